#![forbid(unsafe_code)]

//! Immutable data frame: an ordered row sequence stored column-wise, with a
//! cached name → ordinal lookup. Every verb returns a new frame.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tf_columnar::{Column, ColumnError};
use tf_types::{NullKind, Scalar};
use thiserror::Error;
use tracing::debug;

mod bind;
mod schema;
mod verbs;

pub use bind::{SchemaMismatch, bind_rows, bind_rows_with_report};
pub use schema::{RowValidationError, SchemaValidator, ValidationOutcome};
pub use verbs::{
    MutationExpr, Mutations, SortDirection, SortKey, compare_scalars_with_na_last, structural_key,
};

#[doc(hidden)]
pub use tf_types as __types;

/// Error type user callables may return from row functions and predicates.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One row as an ordered `column → value` mapping.
pub type Record = IndexMap<String, Scalar>;

/// Build a [`Record`] from `name => value` pairs.
///
/// ```
/// let row = tf_frame::record! { "name" => "Luke", "mass" => 77 };
/// assert_eq!(row["mass"], tf_types::Scalar::Int64(77));
/// ```
#[macro_export]
macro_rules! record {
    () => { $crate::Record::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::Record::new();
        $( record.insert(::std::string::String::from($name), $crate::__types::Scalar::from($value)); )+
        record
    }};
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("column(s) not found: {}", .columns.join(", "))]
    ColumnNotFound { columns: Vec<String> },
    #[error("schema validation failed for {} row(s): {}", .errors.len(), summarize_validation(.errors))]
    SchemaValidation { errors: Vec<RowValidationError> },
    #[error("{verb}: {message}")]
    Verb { verb: &'static str, message: String },
    #[error("{verb} failed at row {row}{}: {source}", column_suffix(.column))]
    RowFunction {
        verb: &'static str,
        row: usize,
        column: Option<String>,
        source: BoxError,
    },
    #[error("column '{column}' has {actual} values but the frame has {expected} rows")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Column(#[from] ColumnError),
}

impl FrameError {
    pub fn verb(verb: &'static str, message: impl Into<String>) -> Self {
        Self::Verb {
            verb,
            message: message.into(),
        }
    }
}

fn column_suffix(column: &Option<String>) -> String {
    column
        .as_deref()
        .map(|name| format!(" (column '{name}')"))
        .unwrap_or_default()
}

fn summarize_validation(errors: &[RowValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

static UNDEFINED: Scalar = Scalar::undefined();

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFrame {
    names: Vec<String>,
    columns: Vec<Column>,
    lookup: HashMap<String, usize>,
    nrows: usize,
}

/// Borrowed view of one row of a frame.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    frame: &'a DataFrame,
    position: usize,
}

impl<'a> Row<'a> {
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    #[must_use]
    pub fn frame(&self) -> &'a DataFrame {
        self.frame
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&'a Scalar> {
        self.frame.value(self.position, name)
    }

    /// Value of `name` in this row; absent columns read as undefined.
    #[must_use]
    pub fn value(&self, name: &str) -> &'a Scalar {
        self.get(name).unwrap_or(&UNDEFINED)
    }

    #[must_use]
    pub fn f64(&self, name: &str) -> Option<f64> {
        self.value(name).as_f64()
    }

    #[must_use]
    pub fn str(&self, name: &str) -> Option<&'a str> {
        self.value(name).as_str()
    }

    #[must_use]
    pub fn to_record(&self) -> Record {
        self.frame
            .names
            .iter()
            .zip(&self.frame.columns)
            .map(|(name, column)| (name.clone(), column.values()[self.position].clone()))
            .collect()
    }
}

impl DataFrame {
    /// Assemble a frame from named columns. All columns must have the same
    /// length and names must be unique.
    pub fn new(columns: Vec<(String, Column)>) -> Result<Self, FrameError> {
        let nrows = columns.first().map_or(0, |(_, column)| column.len());
        let mut names = Vec::with_capacity(columns.len());
        let mut stored = Vec::with_capacity(columns.len());
        for (name, column) in columns {
            if column.len() != nrows {
                return Err(FrameError::LengthMismatch {
                    column: name,
                    expected: nrows,
                    actual: column.len(),
                });
            }
            names.push(name);
            stored.push(column);
        }
        Self::from_parts(names, stored, nrows)
    }

    /// Build from column vectors, dict style.
    pub fn from_columns<N: Into<String>>(data: Vec<(N, Vec<Scalar>)>) -> Result<Self, FrameError> {
        Self::new(
            data.into_iter()
                .map(|(name, values)| (name.into(), Column::from_values(values)))
                .collect(),
        )
    }

    /// Build from a row sequence. The column set is the union of all record
    /// keys in first-appearance order; keys a record lacks become undefined.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Record>,
    {
        let records: Vec<Record> = records.into_iter().collect();
        let mut names: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for record in &records {
            for key in record.keys() {
                if seen.insert(key.as_str()) {
                    names.push(key.clone());
                }
            }
        }

        let columns = names
            .iter()
            .map(|name| {
                records
                    .iter()
                    .map(|record| record.get(name).cloned().unwrap_or(Scalar::undefined()))
                    .collect::<Column>()
            })
            .collect();
        let lookup = index_names(&names);
        Self {
            names,
            columns,
            lookup,
            nrows: records.len(),
        }
    }

    /// Run `validator` once over the input, then build the frame from the
    /// rows it returns. Any reported error fails construction.
    pub fn from_records_validated<V>(records: Vec<Record>, validator: &V) -> Result<Self, FrameError>
    where
        V: SchemaValidator + ?Sized,
    {
        let outcome = validator.validate(records);
        if !outcome.errors.is_empty() {
            debug!(
                errors = outcome.errors.len(),
                "schema validator rejected input"
            );
            return Err(FrameError::SchemaValidation {
                errors: outcome.errors,
            });
        }
        Ok(Self::from_records(outcome.rows))
    }

    /// A zero-row frame that still declares its columns.
    pub fn empty_with_columns<N: AsRef<str>>(names: &[N]) -> Result<Self, FrameError> {
        Self::from_parts(
            names.iter().map(|n| n.as_ref().to_owned()).collect(),
            vec![Column::missing(0, NullKind::Undefined); names.len()],
            0,
        )
    }

    pub(crate) fn from_parts(
        names: Vec<String>,
        columns: Vec<Column>,
        nrows: usize,
    ) -> Result<Self, FrameError> {
        let lookup = index_names(&names);
        if lookup.len() != names.len() {
            let mut seen = HashSet::new();
            let duplicates: Vec<&str> = names
                .iter()
                .filter(|name| !seen.insert(name.as_str()))
                .map(String::as_str)
                .collect();
            return Err(FrameError::verb(
                "new",
                format!("duplicate column name(s): {}", duplicates.join(", ")),
            ));
        }
        Ok(Self {
            names,
            columns,
            lookup,
            nrows,
        })
    }

    #[must_use]
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    #[must_use]
    pub fn ncols(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nrows == 0
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.lookup.contains_key(name)
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.column_index(name).map(|idx| &self.columns[idx])
    }

    /// Eager column access.
    pub fn column_values(&self, name: &str) -> Result<&[Scalar], FrameError> {
        self.column(name)
            .map(Column::values)
            .ok_or_else(|| FrameError::ColumnNotFound {
                columns: vec![name.to_owned()],
            })
    }

    /// Lazy column access.
    pub fn iter_column(&self, name: &str) -> Result<impl Iterator<Item = &Scalar>, FrameError> {
        self.column_values(name).map(|values| values.iter())
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.names.iter().map(String::as_str).zip(&self.columns)
    }

    #[must_use]
    pub fn value(&self, row: usize, name: &str) -> Option<&Scalar> {
        self.column(name).and_then(|column| column.value(row))
    }

    #[must_use]
    pub fn row(&self, position: usize) -> Option<Row<'_>> {
        (position < self.nrows).then_some(Row {
            frame: self,
            position,
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        (0..self.nrows).map(move |position| Row {
            frame: self,
            position,
        })
    }

    /// The record at `position`.
    #[must_use]
    pub fn record(&self, position: usize) -> Option<Record> {
        self.row(position).map(|row| row.to_record())
    }

    #[must_use]
    pub fn to_records(&self) -> Vec<Record> {
        self.rows().map(|row| row.to_record()).collect()
    }

    /// Fail with every name in `names` that this frame lacks.
    pub fn require_columns<N: AsRef<str>>(&self, names: &[N]) -> Result<(), FrameError> {
        let missing: Vec<String> = names
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| !self.has_column(name))
            .map(str::to_owned)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FrameError::ColumnNotFound { columns: missing })
        }
    }

    /// Rows at `positions`, in that order.
    pub fn take(&self, positions: &[usize]) -> Result<Self, FrameError> {
        if let Some(&position) = positions.iter().find(|&&p| p >= self.nrows) {
            return Err(ColumnError::PositionOutOfBounds {
                position,
                len: self.nrows,
            }
            .into());
        }
        Ok(self.gather(positions))
    }

    pub(crate) fn gather(&self, positions: &[usize]) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|column| {
                let values = column.values();
                positions.iter().map(|&p| values[p].clone()).collect()
            })
            .collect();
        Self {
            names: self.names.clone(),
            columns,
            lookup: self.lookup.clone(),
            nrows: positions.len(),
        }
    }

    /// Replace `name` in place, or append it as the last column.
    pub fn with_column(&self, name: &str, column: Column) -> Result<Self, FrameError> {
        if column.len() != self.nrows && !(self.names.is_empty() && self.nrows == 0) {
            return Err(FrameError::LengthMismatch {
                column: name.to_owned(),
                expected: self.nrows,
                actual: column.len(),
            });
        }
        let mut out = self.clone();
        out.nrows = column.len();
        match out.column_index(name) {
            Some(idx) => out.columns[idx] = column,
            None => {
                out.lookup.insert(name.to_owned(), out.names.len());
                out.names.push(name.to_owned());
                out.columns.push(column);
            }
        }
        Ok(out)
    }

    /// Rows equal under structural equality, column order included.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.names == other.names
            && self.nrows == other.nrows
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.semantic_eq(b))
    }
}

fn index_names(names: &[String]) -> HashMap<String, usize> {
    names
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.clone(), idx))
        .collect()
}

impl FromIterator<Record> for DataFrame {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self::from_records(iter)
    }
}

/// Serializable snapshot used by renderers: `(columns, rows)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSnapshot {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl From<&DataFrame> for FrameSnapshot {
    fn from(frame: &DataFrame) -> Self {
        Self {
            columns: frame.column_names().to_vec(),
            rows: frame.to_records(),
        }
    }
}

impl From<FrameSnapshot> for DataFrame {
    fn from(snapshot: FrameSnapshot) -> Self {
        let mut frame = Self::from_records(snapshot.rows);
        let absent: Vec<String> = snapshot
            .columns
            .into_iter()
            .filter(|name| !frame.has_column(name))
            .collect();
        for name in absent {
            frame.lookup.insert(name.clone(), frame.names.len());
            frame.names.push(name);
            frame
                .columns
                .push(Column::missing(frame.nrows, NullKind::Undefined));
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use tf_types::{DType, Scalar};

    use super::{DataFrame, FrameError, FrameSnapshot, Record, ValidationOutcome};
    use crate::RowValidationError;

    fn people() -> DataFrame {
        DataFrame::from_records(vec![
            record! { "name" => "Luke", "mass" => 77 },
            record! { "name" => "Leia", "mass" => 49, "homeworld" => "Alderaan" },
        ])
    }

    #[test]
    fn from_records_unions_columns_in_first_seen_order() {
        let frame = people();
        assert_eq!(frame.column_names(), &["name", "mass", "homeworld"]);
        assert_eq!(frame.nrows(), 2);
        assert_eq!(frame.value(0, "homeworld"), Some(&Scalar::undefined()));
    }

    #[test]
    fn record_and_to_records_follow_row_order() {
        let frame = people();
        let first = frame.record(0).expect("row 0");
        assert_eq!(first["name"], Scalar::from("Luke"));
        assert_eq!(first.keys().collect::<Vec<_>>(), ["name", "mass", "homeworld"]);
        assert_eq!(frame.to_records().len(), 2);
        assert!(frame.record(2).is_none());
    }

    #[test]
    fn column_accessors_are_eager_and_lazy() {
        let frame = people();
        let eager = frame.column_values("mass").expect("mass");
        let lazy: Vec<&Scalar> = frame.iter_column("mass").expect("mass").collect();
        assert_eq!(eager, &[Scalar::Int64(77), Scalar::Int64(49)]);
        assert_eq!(lazy.len(), 2);
        assert_eq!(frame.column("mass").expect("mass").dtype(), DType::Int64);
    }

    #[test]
    fn row_view_reads_absent_columns_as_undefined() {
        let frame = people();
        let row = frame.row(1).expect("row 1");
        assert_eq!(row.str("homeworld"), Some("Alderaan"));
        assert!(row.value("species").is_undefined());
        assert_eq!(row.f64("mass"), Some(49.0));
    }

    #[test]
    fn require_columns_reports_every_missing_name() {
        let err = people()
            .require_columns(&["name", "height", "species"])
            .expect_err("missing");
        assert_eq!(err.to_string(), "column(s) not found: height, species");
    }

    #[test]
    fn new_rejects_ragged_and_duplicate_columns() {
        let ragged = DataFrame::from_columns(vec![
            ("a", vec![Scalar::Int64(1)]),
            ("b", vec![Scalar::Int64(1), Scalar::Int64(2)]),
        ]);
        assert!(matches!(ragged, Err(FrameError::LengthMismatch { .. })));

        let duplicate = DataFrame::from_columns(vec![
            ("a", vec![Scalar::Int64(1)]),
            ("a", vec![Scalar::Int64(2)]),
        ]);
        assert!(matches!(duplicate, Err(FrameError::Verb { .. })));
    }

    #[test]
    fn empty_frame_keeps_declared_columns() {
        let frame = DataFrame::empty_with_columns(&["id", "score"]).expect("empty");
        assert_eq!(frame.nrows(), 0);
        assert_eq!(frame.column_names(), &["id", "score"]);
    }

    #[test]
    fn take_checks_bounds() {
        let frame = people();
        assert_eq!(frame.take(&[1, 0]).expect("take").value(0, "name"), Some(&Scalar::from("Leia")));
        assert!(frame.take(&[5]).is_err());
    }

    #[test]
    fn validated_construction_fails_on_any_row_error() {
        let reject_negative = |rows: Vec<Record>| {
            let errors = rows
                .iter()
                .enumerate()
                .filter(|(_, row)| row.get("mass").and_then(Scalar::as_f64).is_some_and(|m| m < 0.0))
                .map(|(row, _)| RowValidationError::new(row, "mass must be non-negative"))
                .collect();
            ValidationOutcome { rows, errors }
        };

        let ok = DataFrame::from_records_validated(vec![record! { "mass" => 1 }], &reject_negative)
            .expect("valid");
        assert_eq!(ok.nrows(), 1);

        let err = DataFrame::from_records_validated(
            vec![record! { "mass" => 1 }, record! { "mass" => -4 }],
            &reject_negative,
        )
        .expect_err("invalid");
        let FrameError::SchemaValidation { errors } = &err else {
            panic!("expected schema validation error, got {err:?}");
        };
        assert_eq!(errors[0].row, 1);
        assert_eq!(
            err.to_string(),
            "schema validation failed for 1 row(s): row 1: mass must be non-negative"
        );
    }

    #[test]
    fn snapshot_serializes_columns_and_rows() {
        let snapshot = FrameSnapshot::from(&people());
        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(json["columns"][2], "homeworld");
        assert_eq!(json["rows"][0]["mass"]["value"], 77);

        let empty = DataFrame::from(FrameSnapshot {
            columns: vec!["a".to_owned()],
            rows: Vec::new(),
        });
        assert_eq!(empty.column_names(), &["a"]);
    }

    #[test]
    fn snapshot_declared_columns_survive_without_row_values() {
        let frame = DataFrame::from(FrameSnapshot {
            columns: vec!["name".to_owned(), "species".to_owned(), "mass".to_owned()],
            rows: vec![
                record! { "name" => "Luke", "mass" => 77 },
                record! { "name" => "Leia", "mass" => 49 },
            ],
        });
        assert_eq!(frame.column_names(), &["name", "mass", "species"]);
        assert_eq!(frame.nrows(), 2);
        let species = frame.column("species").expect("species");
        assert_eq!(species.len(), 2);
        assert!(species.iter().all(Scalar::is_undefined));
    }
}

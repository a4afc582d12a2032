#![forbid(unsafe_code)]

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use tf_columnar::Column;
use tf_frame::{DataFrame, FrameError, structural_key};
use tf_types::{Scalar, ScalarKey};
use tracing::debug;

/// Resolves the values of one (id-group, name) cell fed by several rows.
pub type ValuesFn<'f> = Box<dyn Fn(&[Scalar]) -> Scalar + 'f>;

/// Options for [`pivot_wider`].
///
/// Every column other than `names_from` and `values_from` identifies an
/// output row. Each distinct rendering of a `names_from` value becomes a
/// column holding the matching `values_from` value.
pub struct PivotWider<'f> {
    names_from: String,
    values_from: String,
    names_prefix: String,
    expected_columns: Option<Vec<String>>,
    values_fn: Option<ValuesFn<'f>>,
}

impl<'f> PivotWider<'f> {
    pub fn new(names_from: impl Into<String>, values_from: impl Into<String>) -> Self {
        Self {
            names_from: names_from.into(),
            values_from: values_from.into(),
            names_prefix: String::new(),
            expected_columns: None,
            values_fn: None,
        }
    }

    /// Prepended to every pivot column name.
    #[must_use]
    pub fn names_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.names_prefix = prefix.into();
        self
    }

    /// Fix the pivot columns to exactly `names`, in this order. Names absent
    /// from the data become all-undefined columns; names not listed are
    /// dropped.
    #[must_use]
    pub fn expected_columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_columns = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Aggregate cells fed by more than one row instead of failing.
    #[must_use]
    pub fn values_fn<F>(mut self, values_fn: F) -> Self
    where
        F: Fn(&[Scalar]) -> Scalar + 'f,
    {
        self.values_fn = Some(Box::new(values_fn));
        self
    }

    #[must_use]
    pub fn names_from(&self) -> &str {
        &self.names_from
    }

    #[must_use]
    pub fn values_from(&self) -> &str {
        &self.values_from
    }
}

impl fmt::Debug for PivotWider<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PivotWider")
            .field("names_from", &self.names_from)
            .field("values_from", &self.values_from)
            .field("names_prefix", &self.names_prefix)
            .field("expected_columns", &self.expected_columns)
            .field("values_fn", &self.values_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Wide to long. Each input row yields one output row per column in `cols`,
/// in input-row-major order, carrying the remaining columns plus `names_to`
/// (the pivoted column's name) and `values_to` (its value).
pub fn pivot_longer<N: AsRef<str>>(
    frame: &DataFrame,
    cols: &[N],
    names_to: &str,
    values_to: &str,
) -> Result<DataFrame, FrameError> {
    frame.require_columns(cols)?;
    if cols.is_empty() {
        return Err(FrameError::verb(
            "pivot_longer",
            "at least one column to pivot is required",
        ));
    }
    if names_to == values_to {
        return Err(FrameError::verb(
            "pivot_longer",
            format!("names_to and values_to are both '{names_to}'"),
        ));
    }

    let pivoted: Vec<&str> = cols.iter().map(AsRef::as_ref).collect();
    let mut seen = HashSet::new();
    if let Some(duplicate) = pivoted.iter().find(|name| !seen.insert(**name)) {
        return Err(FrameError::verb(
            "pivot_longer",
            format!("column '{duplicate}' listed more than once"),
        ));
    }

    let retained: Vec<&str> = frame
        .column_names()
        .iter()
        .map(String::as_str)
        .filter(|name| !seen.contains(name))
        .collect();
    if let Some(target) = [names_to, values_to]
        .into_iter()
        .find(|target| retained.contains(target))
    {
        return Err(FrameError::verb(
            "pivot_longer",
            format!("output column '{target}' collides with a retained column"),
        ));
    }

    let width = pivoted.len();
    let source_rows: Vec<usize> = (0..frame.nrows())
        .flat_map(|row| std::iter::repeat_n(row, width))
        .collect();

    let mut columns = Vec::with_capacity(retained.len() + 2);
    for name in &retained {
        let column = frame.column(name).ok_or_else(|| missing(name))?;
        columns.push(((*name).to_owned(), column.take(&source_rows)?));
    }

    let sources = pivoted
        .iter()
        .map(|name| frame.column_values(name))
        .collect::<Result<Vec<_>, _>>()?;
    let mut names = Vec::with_capacity(source_rows.len());
    let mut values = Vec::with_capacity(source_rows.len());
    for row in 0..frame.nrows() {
        for (name, source) in pivoted.iter().zip(&sources) {
            names.push(Scalar::from(*name));
            values.push(source[row].clone());
        }
    }
    columns.push((names_to.to_owned(), Column::from_values(names)));
    columns.push((values_to.to_owned(), Column::from_values(values)));

    debug!(
        input_rows = frame.nrows(),
        output_rows = source_rows.len(),
        pivoted = width,
        "pivot_longer"
    );
    DataFrame::new(columns)
}

/// Long to wide. Output rows follow the first appearance of each id-group;
/// pivot columns follow the first appearance of each name unless
/// `expected_columns` fixes them.
pub fn pivot_wider(frame: &DataFrame, pivot: &PivotWider<'_>) -> Result<DataFrame, FrameError> {
    frame.require_columns(&[pivot.names_from.as_str(), pivot.values_from.as_str()])?;
    if pivot.names_from == pivot.values_from {
        return Err(FrameError::verb(
            "pivot_wider",
            format!("names_from and values_from are both '{}'", pivot.names_from),
        ));
    }

    let id_names: Vec<&str> = frame
        .column_names()
        .iter()
        .map(String::as_str)
        .filter(|name| *name != pivot.names_from && *name != pivot.values_from)
        .collect();
    let id_values = id_names
        .iter()
        .map(|name| frame.column_values(name))
        .collect::<Result<Vec<_>, _>>()?;
    let names_from = frame.column_values(&pivot.names_from)?;
    let values_from = frame.column_values(&pivot.values_from)?;

    let mut group_lookup: HashMap<Vec<ScalarKey<'_>>, usize> = HashMap::new();
    let mut group_rows: Vec<usize> = Vec::new();
    let mut pivot_names: Vec<String> = Vec::new();
    let mut name_lookup: HashMap<String, usize> = HashMap::new();
    let mut cells: HashMap<(usize, usize), Vec<usize>> = HashMap::new();

    for row in 0..frame.nrows() {
        let next_group = group_rows.len();
        let group = *group_lookup
            .entry(structural_key(&id_values, row))
            .or_insert_with(|| {
                group_rows.push(row);
                next_group
            });

        let name = names_from[row].to_string();
        let slot = match name_lookup.get(&name) {
            Some(&slot) => slot,
            None => {
                let slot = pivot_names.len();
                name_lookup.insert(name.clone(), slot);
                pivot_names.push(name);
                slot
            }
        };

        let feeding = cells.entry((group, slot)).or_default();
        feeding.push(row);
        if feeding.len() > 1 && pivot.values_fn.is_none() {
            return Err(FrameError::verb(
                "pivot_wider",
                format!(
                    "multiple rows for {} and name '{}'; aggregate first (for example with summarise) or pass values_fn",
                    describe_group(&id_names, &id_values, group_rows[group]),
                    pivot_names[slot]
                ),
            ));
        }
    }

    let output_names: Vec<&str> = match &pivot.expected_columns {
        Some(expected) => {
            let dropped = pivot_names
                .iter()
                .filter(|name| !expected.contains(name))
                .count();
            if dropped > 0 {
                debug!(dropped, "pivot_wider dropped names outside expected_columns");
            }
            expected.iter().map(String::as_str).collect()
        }
        None => pivot_names.iter().map(String::as_str).collect(),
    };

    let mut columns = Vec::with_capacity(id_names.len() + output_names.len());
    for name in &id_names {
        let column = frame.column(name).ok_or_else(|| missing(name))?;
        columns.push(((*name).to_owned(), column.take(&group_rows)?));
    }

    for name in &output_names {
        let column_name = format!("{}{name}", pivot.names_prefix);
        if id_names.contains(&column_name.as_str()) {
            return Err(FrameError::verb(
                "pivot_wider",
                format!("pivot column '{column_name}' collides with an id column"),
            ));
        }
        let slot = name_lookup.get(*name).copied();
        let values: Vec<Scalar> = (0..group_rows.len())
            .map(|group| {
                let Some(rows) = slot.and_then(|slot| cells.get(&(group, slot))) else {
                    return Scalar::undefined();
                };
                match (rows.as_slice(), &pivot.values_fn) {
                    ([row], _) => values_from[*row].clone(),
                    (rows, Some(values_fn)) => {
                        let gathered: Vec<Scalar> =
                            rows.iter().map(|&row| values_from[row].clone()).collect();
                        values_fn(&gathered)
                    }
                    (_, None) => Scalar::undefined(),
                }
            })
            .collect();
        columns.push((column_name, Column::from_values(values)));
    }

    debug!(
        input_rows = frame.nrows(),
        groups = group_rows.len(),
        pivot_columns = output_names.len(),
        "pivot_wider"
    );
    DataFrame::new(columns)
}

fn describe_group(names: &[&str], values: &[&[Scalar]], row: usize) -> String {
    if names.is_empty() {
        return "<all rows>".to_owned();
    }
    names
        .iter()
        .zip(values)
        .map(|(name, values)| format!("{name}={}", values[row]))
        .collect::<Vec<_>>()
        .join(", ")
}

fn missing(name: &str) -> FrameError {
    FrameError::ColumnNotFound {
        columns: vec![name.to_owned()],
    }
}

pub trait ReshapeExt {
    fn pivot_longer<N: AsRef<str>>(
        &self,
        cols: &[N],
        names_to: &str,
        values_to: &str,
    ) -> Result<DataFrame, FrameError>;

    fn pivot_wider(&self, pivot: &PivotWider<'_>) -> Result<DataFrame, FrameError>;
}

impl ReshapeExt for DataFrame {
    fn pivot_longer<N: AsRef<str>>(
        &self,
        cols: &[N],
        names_to: &str,
        values_to: &str,
    ) -> Result<DataFrame, FrameError> {
        pivot_longer(self, cols, names_to, values_to)
    }

    fn pivot_wider(&self, pivot: &PivotWider<'_>) -> Result<DataFrame, FrameError> {
        pivot_wider(self, pivot)
    }
}

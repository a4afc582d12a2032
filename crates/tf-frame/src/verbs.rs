use std::{cmp::Ordering, collections::HashSet};

use serde::{Deserialize, Serialize};
use tf_columnar::Column;
use tf_types::{Scalar, ScalarKey, compare_present};
use tracing::debug;

use crate::{BoxError, DataFrame, FrameError, Row};

type RowFn<'f> = Box<dyn Fn(&Row<'_>, usize, &DataFrame) -> Result<Scalar, BoxError> + 'f>;

/// Right-hand side of one `mutate` assignment.
pub enum MutationExpr<'f> {
    /// Evaluated once per row as `f(row, index, frame)`.
    Row(RowFn<'f>),
    /// A full column; its length must equal the frame's row count.
    Values(Vec<Scalar>),
    /// Broadcast to every row.
    Constant(Scalar),
    /// Drop the column.
    Remove,
}

/// Ordered set of column assignments applied by `mutate`.
///
/// Entries run in declaration order, and each one sees the columns produced
/// by the entries before it.
#[derive(Default)]
pub struct Mutations<'f> {
    entries: Vec<(String, MutationExpr<'f>)>,
}

impl<'f> Mutations<'f> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<V, F>(self, name: impl Into<String>, f: F) -> Self
    where
        V: Into<Scalar>,
        F: Fn(&Row<'_>, usize, &DataFrame) -> V + 'f,
    {
        self.push(
            name,
            MutationExpr::Row(Box::new(
                move |row: &Row<'_>, idx: usize, frame: &DataFrame| Ok(f(row, idx, frame).into()),
            )),
        )
    }

    #[must_use]
    pub fn try_with<V, E, F>(self, name: impl Into<String>, f: F) -> Self
    where
        V: Into<Scalar>,
        E: Into<BoxError>,
        F: Fn(&Row<'_>, usize, &DataFrame) -> Result<V, E> + 'f,
    {
        self.push(
            name,
            MutationExpr::Row(Box::new(
                move |row: &Row<'_>, idx: usize, frame: &DataFrame| {
                    f(row, idx, frame).map(Into::into).map_err(Into::into)
                },
            )),
        )
    }

    #[must_use]
    pub fn values(self, name: impl Into<String>, values: Vec<Scalar>) -> Self {
        self.push(name, MutationExpr::Values(values))
    }

    #[must_use]
    pub fn constant(self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.push(name, MutationExpr::Constant(value.into()))
    }

    #[must_use]
    pub fn remove(self, name: impl Into<String>) -> Self {
        self.push(name, MutationExpr::Remove)
    }

    #[must_use]
    pub fn push(mut self, name: impl Into<String>, expr: MutationExpr<'f>) -> Self {
        self.entries.push((name.into(), expr));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Descending,
        }
    }
}

impl From<&str> for SortKey {
    fn from(column: &str) -> Self {
        Self::asc(column)
    }
}

impl From<String> for SortKey {
    fn from(column: String) -> Self {
        Self::asc(column)
    }
}

impl From<(&str, SortDirection)> for SortKey {
    fn from((column, direction): (&str, SortDirection)) -> Self {
        Self {
            column: column.to_owned(),
            direction,
        }
    }
}

/// Missing values (null, undefined, NaN) go last in both directions.
#[must_use]
pub fn compare_scalars_with_na_last(left: &Scalar, right: &Scalar, ascending: bool) -> Ordering {
    match (left.is_missing(), right.is_missing()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let order = compare_present(left, right);
            if ascending { order } else { order.reverse() }
        }
    }
}

/// Structural key of the row at `position` over the given column slices.
#[must_use]
pub fn structural_key<'a>(columns: &[&'a [Scalar]], position: usize) -> Vec<ScalarKey<'a>> {
    columns
        .iter()
        .map(|values| ScalarKey::from_scalar(&values[position]))
        .collect()
}

impl DataFrame {
    /// Project to `names`, in the order given.
    pub fn select(&self, names: &[&str]) -> Result<Self, FrameError> {
        self.require_columns(names)?;
        let mut seen = HashSet::new();
        if let Some(duplicate) = names.iter().find(|name| !seen.insert(**name)) {
            return Err(FrameError::verb(
                "select",
                format!("column '{duplicate}' selected more than once"),
            ));
        }
        let columns = names
            .iter()
            .filter_map(|name| self.column(name).cloned())
            .collect();
        Self::from_parts(
            names.iter().map(|name| (*name).to_owned()).collect(),
            columns,
            self.nrows,
        )
    }

    /// Every column except `names`. Unknown names are ignored.
    #[must_use]
    pub fn drop_columns(&self, names: &[&str]) -> Self {
        let (names, columns) = self
            .names
            .iter()
            .zip(&self.columns)
            .filter(|(name, _)| !names.contains(&name.as_str()))
            .map(|(name, column)| (name.clone(), column.clone()))
            .unzip::<_, _, Vec<_>, Vec<_>>();
        let lookup = crate::index_names(&names);
        Self {
            names,
            columns,
            lookup,
            nrows: self.nrows,
        }
    }

    /// Rename `(from, to)` pairs; renamed columns keep their position.
    pub fn rename(&self, mapping: &[(&str, &str)]) -> Result<Self, FrameError> {
        let sources: Vec<&str> = mapping.iter().map(|(from, _)| *from).collect();
        self.require_columns(&sources)?;

        let mut names = Vec::with_capacity(self.names.len());
        let mut seen = HashSet::new();
        for name in &self.names {
            let new_name = mapping
                .iter()
                .rev()
                .find(|(from, _)| *from == name.as_str())
                .map_or(name.as_str(), |(_, to)| *to);
            if !seen.insert(new_name) {
                return Err(FrameError::verb(
                    "rename",
                    format!("duplicate column '{new_name}' resulting from rename"),
                ));
            }
            names.push(new_name.to_owned());
        }
        Self::from_parts(names, self.columns.clone(), self.nrows)
    }

    pub fn mutate(&self, mutations: &Mutations<'_>) -> Result<Self, FrameError> {
        let mut current = self.clone();
        for (name, expr) in &mutations.entries {
            current = match expr {
                MutationExpr::Remove => current.drop_columns(&[name.as_str()]),
                MutationExpr::Constant(value) => current.with_column(
                    name,
                    Column::from_values(vec![value.clone(); current.nrows]),
                )?,
                MutationExpr::Values(values) => {
                    current.with_column(name, Column::from_values(values.clone()))?
                }
                MutationExpr::Row(f) => {
                    let values = current
                        .rows()
                        .map(|row| {
                            let idx = row.position();
                            f(&row, idx, &current).map_err(|source| FrameError::RowFunction {
                                verb: "mutate",
                                row: idx,
                                column: Some(name.clone()),
                                source,
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    current.with_column(name, Column::from_values(values))?
                }
            };
        }
        debug!(
            verb = "mutate",
            rows = current.nrows,
            columns = current.ncols(),
            "verb applied"
        );
        Ok(current)
    }

    /// Keep rows for which `predicate(row, index, frame)` holds, in order.
    #[must_use]
    pub fn filter<P>(&self, predicate: P) -> Self
    where
        P: Fn(&Row<'_>, usize, &DataFrame) -> bool,
    {
        let keep: Vec<usize> = self
            .rows()
            .filter(|row| predicate(row, row.position(), self))
            .map(|row| row.position())
            .collect();
        debug!(
            verb = "filter",
            input_rows = self.nrows,
            output_rows = keep.len(),
            "verb applied"
        );
        self.gather(&keep)
    }

    pub fn try_filter<P, E>(&self, predicate: P) -> Result<Self, FrameError>
    where
        P: Fn(&Row<'_>, usize, &DataFrame) -> Result<bool, E>,
        E: Into<BoxError>,
    {
        let keep = self.filter_positions(predicate)?;
        Ok(self.gather(&keep))
    }

    /// Positions of the rows a fallible predicate keeps.
    pub fn filter_positions<P, E>(&self, predicate: P) -> Result<Vec<usize>, FrameError>
    where
        P: Fn(&Row<'_>, usize, &DataFrame) -> Result<bool, E>,
        E: Into<BoxError>,
    {
        let mut keep = Vec::new();
        for row in self.rows() {
            let idx = row.position();
            let passed = predicate(&row, idx, self).map_err(|err| FrameError::RowFunction {
                verb: "filter",
                row: idx,
                column: None,
                source: err.into(),
            })?;
            if passed {
                keep.push(idx);
            }
        }
        Ok(keep)
    }

    /// Stable multi-key sort.
    pub fn arrange<K, I>(&self, keys: I) -> Result<Self, FrameError>
    where
        K: Into<SortKey>,
        I: IntoIterator<Item = K>,
    {
        let keys: Vec<SortKey> = keys.into_iter().map(Into::into).collect();
        let positions: Vec<usize> = (0..self.nrows).collect();
        let sorted = self.sort_positions(&positions, &keys)?;
        debug!(verb = "arrange", rows = self.nrows, keys = keys.len(), "verb applied");
        Ok(self.gather(&sorted))
    }

    /// Stable sort of an arbitrary subset of row positions.
    pub fn sort_positions(
        &self,
        positions: &[usize],
        keys: &[SortKey],
    ) -> Result<Vec<usize>, FrameError> {
        let names: Vec<&str> = keys.iter().map(|key| key.column.as_str()).collect();
        self.require_columns(&names)?;
        let columns: Vec<(&[Scalar], bool)> = keys
            .iter()
            .filter_map(|key| {
                self.column(&key.column)
                    .map(|column| (column.values(), key.direction == SortDirection::Ascending))
            })
            .collect();

        let mut sorted = positions.to_vec();
        sorted.sort_by(|&a, &b| {
            columns
                .iter()
                .map(|(values, ascending)| {
                    compare_scalars_with_na_last(&values[a], &values[b], *ascending)
                })
                .find(|order| *order != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        Ok(sorted)
    }

    /// Drop rows that duplicate an earlier row on `columns` (all columns when
    /// empty). With columns given, the result is projected to them.
    pub fn distinct(&self, columns: &[&str]) -> Result<Self, FrameError> {
        let projected = if columns.is_empty() {
            self.clone()
        } else {
            self.select(columns)?
        };
        let slices: Vec<&[Scalar]> = projected.columns.iter().map(Column::values).collect();
        let mut seen = HashSet::new();
        let keep: Vec<usize> = (0..projected.nrows)
            .filter(|&position| seen.insert(structural_key(&slices, position)))
            .collect();
        debug!(
            verb = "distinct",
            input_rows = self.nrows,
            output_rows = keep.len(),
            "verb applied"
        );
        Ok(projected.gather(&keep))
    }

    #[must_use]
    pub fn head(&self, n: usize) -> Self {
        self.slice(0, n)
    }

    #[must_use]
    pub fn tail(&self, n: usize) -> Self {
        self.slice(self.nrows.saturating_sub(n), self.nrows)
    }

    /// The `n` rows with the smallest `column` values, smallest first.
    /// Missing values rank last; ties keep row order.
    pub fn slice_min(&self, column: &str, n: usize) -> Result<Self, FrameError> {
        self.slice_by(SortKey::asc(column), n)
    }

    /// The `n` rows with the largest `column` values, largest first.
    /// Missing values rank last; ties keep row order.
    pub fn slice_max(&self, column: &str, n: usize) -> Result<Self, FrameError> {
        self.slice_by(SortKey::desc(column), n)
    }

    fn slice_by(&self, key: SortKey, n: usize) -> Result<Self, FrameError> {
        let positions: Vec<usize> = (0..self.nrows).collect();
        let mut sorted = self.sort_positions(&positions, std::slice::from_ref(&key))?;
        sorted.truncate(n);
        debug!(verb = "slice_by", column = %key.column, kept = sorted.len(), "verb applied");
        Ok(self.gather(&sorted))
    }

    /// Rows `start..end`, clamped to the frame.
    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.nrows);
        let start = start.min(end);
        let positions: Vec<usize> = (start..end).collect();
        self.gather(&positions)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use tf_types::Scalar;

    use super::{Mutations, SortKey};
    use crate::{DataFrame, FrameError, record};

    fn sample() -> DataFrame {
        DataFrame::from_records(vec![
            record! { "name" => "Luke", "species" => "Human", "mass" => 77 },
            record! { "name" => "R2-D2", "species" => "Droid", "mass" => 32 },
            record! { "name" => "Yoda", "species" => "Yoda's", "mass" => Scalar::null() },
            record! { "name" => "C-3PO", "species" => "Droid", "mass" => 75 },
        ])
    }

    fn names(frame: &DataFrame) -> Vec<String> {
        frame
            .column_values("name")
            .expect("name")
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn select_projects_in_requested_order() {
        let out = sample().select(&["mass", "name"]).expect("select");
        assert_eq!(out.column_names(), &["mass", "name"]);
        assert_eq!(out.nrows(), 4);
    }

    #[test]
    fn select_reports_all_missing_columns() {
        let err = sample()
            .select(&["name", "height", "eye_color"])
            .expect_err("missing");
        let FrameError::ColumnNotFound { columns } = err else {
            panic!("expected ColumnNotFound");
        };
        assert_eq!(columns, vec!["height", "eye_color"]);
    }

    #[test]
    fn drop_ignores_unknown_columns() {
        let out = sample().drop_columns(&["mass", "nope"]);
        assert_eq!(out.column_names(), &["name", "species"]);
    }

    #[test]
    fn rename_keeps_positions_and_rejects_collisions() {
        let out = sample().rename(&[("mass", "weight")]).expect("rename");
        assert_eq!(out.column_names(), &["name", "species", "weight"]);
        assert_eq!(out.value(0, "weight"), Some(&Scalar::Int64(77)));

        let err = sample().rename(&[("mass", "name")]).expect_err("collision");
        assert!(matches!(err, FrameError::Verb { verb: "rename", .. }));

        let err = sample().rename(&[("height", "h")]).expect_err("unknown");
        assert!(matches!(err, FrameError::ColumnNotFound { .. }));
    }

    #[test]
    fn mutate_sees_earlier_assignments_of_the_same_call() {
        let mutations = Mutations::new()
            .with("double", |row, _, _| row.f64("mass").map(|m| m * 2.0))
            .with("quad", |row, _, _| row.f64("double").map(|m| m * 2.0))
            .with("idx", |_, idx, _| idx)
            .with("n", |_, _, frame| frame.nrows());
        let out = sample().mutate(&mutations).expect("mutate");
        assert_eq!(out.value(0, "quad"), Some(&Scalar::Float64(308.0)));
        assert_eq!(out.value(2, "quad"), Some(&Scalar::null()));
        assert_eq!(out.value(3, "idx"), Some(&Scalar::Int64(3)));
        assert_eq!(out.value(1, "n"), Some(&Scalar::Int64(4)));
    }

    #[test]
    fn mutate_overwrites_in_place_and_removes() {
        let mutations = Mutations::new()
            .constant("species", "Unknown")
            .remove("mass")
            .values("rank", vec![1.into(), 2.into(), 3.into(), 4.into()]);
        let out = sample().mutate(&mutations).expect("mutate");
        assert_eq!(out.column_names(), &["name", "species", "rank"]);
        assert!(
            out.column_values("species")
                .expect("species")
                .iter()
                .all(|v| v.as_str() == Some("Unknown"))
        );
    }

    #[test]
    fn mutate_rejects_wrong_length_vectors() {
        let err = sample()
            .mutate(&Mutations::new().values("rank", vec![1.into()]))
            .expect_err("length");
        assert!(matches!(err, FrameError::LengthMismatch { expected: 4, actual: 1, .. }));
    }

    #[test]
    fn mutate_reports_row_and_column_of_failure() {
        let mutations = Mutations::new().try_with("checked", |row, _, _| {
            row.f64("mass")
                .ok_or_else(|| io::Error::other("mass is missing"))
        });
        let err = sample().mutate(&mutations).expect_err("fails on Yoda");
        assert_eq!(
            err.to_string(),
            "mutate failed at row 2 (column 'checked'): mass is missing"
        );
    }

    #[test]
    fn filter_preserves_relative_order() {
        let out = sample().filter(|row, _, _| row.str("species") == Some("Droid"));
        assert_eq!(names(&out), ["R2-D2", "C-3PO"]);
    }

    #[test]
    fn try_filter_aborts_without_partial_result() {
        let err = sample()
            .try_filter(|row, _, _| {
                row.f64("mass")
                    .map(|m| m > 50.0)
                    .ok_or_else(|| io::Error::other("no mass"))
            })
            .expect_err("fails");
        assert!(matches!(err, FrameError::RowFunction { verb: "filter", row: 2, .. }));
    }

    #[test]
    fn arrange_puts_missing_last_in_both_directions() {
        let asc = sample().arrange(["mass"]).expect("asc");
        assert_eq!(names(&asc), ["R2-D2", "C-3PO", "Luke", "Yoda"]);

        let desc = sample().arrange([SortKey::desc("mass")]).expect("desc");
        assert_eq!(names(&desc), ["Luke", "C-3PO", "R2-D2", "Yoda"]);
    }

    #[test]
    fn arrange_is_stable_across_keys() {
        let out = sample()
            .arrange([SortKey::asc("species"), SortKey::desc("mass")])
            .expect("arrange");
        assert_eq!(names(&out), ["C-3PO", "R2-D2", "Luke", "Yoda"]);
        assert!(sample().arrange(["height"]).is_err());
    }

    #[test]
    fn slice_min_and_max_rank_missing_values_last() {
        let lightest = sample().slice_min("mass", 2).expect("slice_min");
        assert_eq!(names(&lightest), ["R2-D2", "C-3PO"]);

        let heaviest = sample().slice_max("mass", 10).expect("slice_max");
        assert_eq!(names(&heaviest), ["Luke", "C-3PO", "R2-D2", "Yoda"]);

        assert_eq!(sample().slice_max("mass", 0).expect("empty").nrows(), 0);
        assert!(matches!(
            sample().slice_min("height", 1),
            Err(FrameError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn distinct_projects_and_keeps_first_occurrence() {
        let out = sample().distinct(&["species"]).expect("distinct");
        assert_eq!(out.column_names(), &["species"]);
        assert_eq!(out.nrows(), 3);
        assert_eq!(out.value(1, "species"), Some(&Scalar::from("Droid")));
    }

    #[test]
    fn distinct_compares_structurally() {
        let frame = DataFrame::from_records(vec![
            record! { "a" => 1, "b" => Scalar::null() },
            record! { "a" => 1.0, "b" => Scalar::undefined() },
            record! { "a" => 2, "b" => Scalar::null() },
        ]);
        assert_eq!(frame.distinct(&[]).expect("distinct").nrows(), 2);
    }

    #[test]
    fn head_tail_and_slice_clamp() {
        let frame = sample();
        assert_eq!(names(&frame.head(2)), ["Luke", "R2-D2"]);
        assert_eq!(names(&frame.tail(1)), ["C-3PO"]);
        assert_eq!(frame.slice(3, 99).nrows(), 1);
        assert_eq!(frame.head(10).nrows(), 4);
    }
}

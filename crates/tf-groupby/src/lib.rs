#![forbid(unsafe_code)]

use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
};

use tf_columnar::Column;
use tf_frame::{BoxError, DataFrame, FrameError, Mutations, Row, SortKey, structural_key};
use tf_types::{Reducer, Scalar, ScalarKey, nancount};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum GroupByError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("in group {key}: {source}")]
    InGroup { key: String, source: FrameError },
    #[error("summarise failed for column '{column}' in group {key}: {source}")]
    Summary {
        key: String,
        column: String,
        source: BoxError,
    },
}

/// One partition: the key tuple (as first seen) and the row positions that
/// carry it, in frame order.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    key: Vec<Scalar>,
    rows: Vec<usize>,
}

impl Group {
    #[must_use]
    pub fn key(&self) -> &[Scalar] {
        &self.key
    }

    #[must_use]
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A frame plus its partition by key-tuple equality. Groups are ordered by
/// first appearance of their key when scanning the frame top to bottom.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedDataFrame {
    frame: DataFrame,
    keys: Vec<String>,
    groups: Vec<Group>,
}

fn partition(frame: &DataFrame, keys: &[String]) -> Vec<Group> {
    let slices: Vec<&[Scalar]> = keys
        .iter()
        .filter_map(|key| frame.column(key).map(Column::values))
        .collect();
    let mut slot = HashMap::<Vec<ScalarKey<'_>>, usize>::new();
    let mut groups: Vec<Group> = Vec::new();
    for position in 0..frame.nrows() {
        let idx = *slot
            .entry(structural_key(&slices, position))
            .or_insert_with(|| {
                groups.push(Group {
                    key: slices.iter().map(|values| values[position].clone()).collect(),
                    rows: Vec::new(),
                });
                groups.len() - 1
            });
        groups[idx].rows.push(position);
    }
    groups
}

impl GroupedDataFrame {
    pub fn new(frame: DataFrame, keys: &[&str]) -> Result<Self, GroupByError> {
        if keys.is_empty() {
            return Err(
                FrameError::verb("group_by", "at least one grouping column is required").into(),
            );
        }
        frame.require_columns(keys)?;
        let keys: Vec<String> = keys.iter().map(|key| (*key).to_owned()).collect();
        let groups = partition(&frame, &keys);
        debug!(
            keys = ?keys,
            rows = frame.nrows(),
            groups = groups.len(),
            "grouped frame"
        );
        Ok(Self {
            frame,
            keys,
            groups,
        })
    }

    fn regroup(&self, frame: DataFrame) -> Self {
        let groups = partition(&frame, &self.keys);
        Self {
            frame,
            keys: self.keys.clone(),
            groups,
        }
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    #[must_use]
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    #[must_use]
    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    #[must_use]
    pub fn ungroup(self) -> DataFrame {
        self.frame
    }

    /// `(group ordinal, index within group)` for every row of the frame.
    #[must_use]
    pub fn row_locations(&self) -> Vec<(usize, usize)> {
        let mut locations = vec![(0, 0); self.frame.nrows()];
        for (group_idx, group) in self.groups.iter().enumerate() {
            for (local, &row) in group.rows.iter().enumerate() {
                locations[row] = (group_idx, local);
            }
        }
        locations
    }

    /// The rows of group `idx` as their own frame.
    pub fn group_frame(&self, idx: usize) -> Result<DataFrame, GroupByError> {
        let group = self.groups.get(idx).ok_or_else(|| {
            FrameError::verb(
                "group_frame",
                format!("group {idx} out of range for {} groups", self.groups.len()),
            )
        })?;
        Ok(self.frame.take(&group.rows)?)
    }

    pub fn group_frames(&self) -> Result<Vec<DataFrame>, GroupByError> {
        self.groups
            .iter()
            .map(|group| self.frame.take(&group.rows).map_err(GroupByError::from))
            .collect()
    }

    /// One row per group holding only the key columns.
    pub fn group_keys(&self) -> Result<DataFrame, GroupByError> {
        let columns = self
            .keys
            .iter()
            .enumerate()
            .map(|(k, name)| {
                let values = self.groups.iter().map(|group| group.key[k].clone()).collect();
                (name.clone(), values)
            })
            .collect();
        Ok(DataFrame::from_columns(columns)?)
    }

    /// Human-readable `key=value` rendering used in error messages.
    #[must_use]
    pub fn describe_key(&self, group: &Group) -> String {
        self.keys
            .iter()
            .zip(&group.key)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn in_group(&self, group: &Group, err: FrameError) -> GroupByError {
        let source = match err {
            FrameError::RowFunction {
                verb,
                row,
                column,
                source,
            } => FrameError::RowFunction {
                verb,
                row: group.rows.get(row).copied().unwrap_or(row),
                column,
                source,
            },
            other => other,
        };
        GroupByError::InGroup {
            key: self.describe_key(group),
            source,
        }
    }

    /// Keep only the rows at `positions` (original frame positions) and
    /// recompute the partition. Groups that lose every row disappear.
    pub fn retain_rows(&self, mut positions: Vec<usize>) -> Result<Self, GroupByError> {
        positions.sort_unstable();
        positions.dedup();
        Ok(self.regroup(self.frame.take(&positions)?))
    }

    pub fn filter<P>(&self, predicate: P) -> Result<Self, GroupByError>
    where
        P: Fn(&Row<'_>, usize, &DataFrame) -> bool,
    {
        self.try_filter(|row, idx, frame| Ok::<_, Infallible>(predicate(row, idx, frame)))
    }

    /// Evaluate the predicate per group: `frame` is the group's own rows and
    /// `index` the position within the group.
    pub fn try_filter<P, E>(&self, predicate: P) -> Result<Self, GroupByError>
    where
        P: Fn(&Row<'_>, usize, &DataFrame) -> Result<bool, E>,
        E: Into<BoxError>,
    {
        let mut keep = Vec::new();
        for group in &self.groups {
            let sub = self.frame.take(&group.rows)?;
            let local = sub
                .filter_positions(&predicate)
                .map_err(|err| self.in_group(group, err))?;
            trace!(
                group = %self.describe_key(group),
                rows = group.rows.len(),
                kept = local.len(),
                "filtered group"
            );
            keep.extend(local.into_iter().map(|idx| group.rows[idx]));
        }
        self.retain_rows(keep)
    }

    /// Mutate each group on its own: row functions see the group's frame and
    /// their index within it. Results land back in the original row slots.
    pub fn mutate(&self, mutations: &Mutations<'_>) -> Result<Self, GroupByError> {
        if let Some(name) = mutations
            .names()
            .find(|name| self.keys.iter().any(|key| key.as_str() == *name))
        {
            return Err(FrameError::verb(
                "mutate",
                format!("cannot modify grouping column '{name}'"),
            )
            .into());
        }
        if self.groups.is_empty() {
            return Ok(self.regroup(self.frame.mutate(mutations)?));
        }

        let mut results = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let sub = self.frame.take(&group.rows)?;
            let mutated = sub
                .mutate(mutations)
                .map_err(|err| self.in_group(group, err))?;
            results.push(mutated);
        }

        let names: Vec<String> = results[0].column_names().to_vec();
        let mut columns = Vec::with_capacity(names.len());
        for name in &names {
            let mut values = vec![Scalar::undefined(); self.frame.nrows()];
            for (group, result) in self.groups.iter().zip(&results) {
                let group_values = result.column_values(name)?;
                for (&row, value) in group.rows.iter().zip(group_values) {
                    values[row] = value.clone();
                }
            }
            columns.push((name.clone(), values));
        }
        Ok(Self {
            frame: DataFrame::from_columns(columns)?,
            keys: self.keys.clone(),
            groups: self.groups.clone(),
        })
    }

    /// Sort each group on its own, then lay the groups out end to end in
    /// group order. Every group becomes one contiguous block of rows.
    pub fn arrange<K, I>(&self, keys: I) -> Result<Self, GroupByError>
    where
        K: Into<SortKey>,
        I: IntoIterator<Item = K>,
    {
        let keys: Vec<SortKey> = keys.into_iter().map(Into::into).collect();
        let mut order = Vec::with_capacity(self.frame.nrows());
        for group in &self.groups {
            order.extend(self.frame.sort_positions(&group.rows, &keys)?);
        }
        Ok(self.regroup(self.frame.take(&order)?))
    }

    /// First `n` rows of every group.
    pub fn head(&self, n: usize) -> Result<Self, GroupByError> {
        let keep = self
            .groups
            .iter()
            .flat_map(|group| group.rows.iter().take(n).copied())
            .collect();
        self.retain_rows(keep)
    }

    /// The `n` rows with the smallest `column` values in every group. Groups
    /// come out end to end in group order, each sorted ascending.
    pub fn slice_min(&self, column: &str, n: usize) -> Result<Self, GroupByError> {
        self.slice_by(SortKey::asc(column), n)
    }

    /// The `n` rows with the largest `column` values in every group.
    pub fn slice_max(&self, column: &str, n: usize) -> Result<Self, GroupByError> {
        self.slice_by(SortKey::desc(column), n)
    }

    fn slice_by(&self, key: SortKey, n: usize) -> Result<Self, GroupByError> {
        let keys = [key];
        let mut order = Vec::new();
        for group in &self.groups {
            let sorted = self.frame.sort_positions(&group.rows, &keys)?;
            order.extend(sorted.into_iter().take(n));
        }
        Ok(self.regroup(self.frame.take(&order)?))
    }

    /// Distinct rows on `columns` within every group, first occurrence kept.
    /// The output holds the grouping columns followed by `columns`.
    pub fn distinct(&self, columns: &[&str]) -> Result<Self, GroupByError> {
        self.frame.require_columns(columns)?;
        let mut output: Vec<&str> = self.keys.iter().map(String::as_str).collect();
        for &name in columns {
            if !output.contains(&name) {
                output.push(name);
            }
        }
        let slices: Vec<&[Scalar]> = output
            .iter()
            .filter_map(|name| self.frame.column(name).map(Column::values))
            .collect();

        let mut keep = Vec::new();
        for group in &self.groups {
            let mut seen = HashSet::new();
            keep.extend(
                group
                    .rows
                    .iter()
                    .copied()
                    .filter(|&row| seen.insert(structural_key(&slices, row))),
            );
        }
        trace!(rows = self.frame.nrows(), kept = keep.len(), "grouped distinct");
        let projected = self.frame.take(&keep)?.select(&output)?;
        Ok(self.regroup(projected))
    }

    /// One row per group: key columns in grouping order, then the summaries
    /// in declaration order.
    pub fn summarise(&self, summaries: &Summaries<'_>) -> Result<DataFrame, GroupByError> {
        summaries.validate(&self.frame)?;
        summaries.check_names(&self.keys)?;
        let mut out = self.group_keys()?;
        let frames = self.group_frames()?;
        for (name, expr) in &summaries.entries {
            let values = self
                .groups
                .iter()
                .zip(&frames)
                .map(|(group, frame)| {
                    expr.evaluate(frame).map_err(|source| GroupByError::Summary {
                        key: self.describe_key(group),
                        column: name.clone(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            out = out.with_column(name, Column::from_values(values))?;
        }
        debug!(groups = self.groups.len(), "summarised grouped frame");
        Ok(out)
    }

    pub fn count(&self) -> Result<DataFrame, GroupByError> {
        self.summarise(&Summaries::new().n("n"))
    }
}

type GroupFn<'f> = Box<dyn Fn(&DataFrame) -> Result<Scalar, BoxError> + 'f>;

enum SummaryExpr<'f> {
    Frame(GroupFn<'f>),
    Reduce {
        column: String,
        reducer: Reducer,
        remove_na: bool,
    },
    Count,
}

impl SummaryExpr<'_> {
    fn evaluate(&self, frame: &DataFrame) -> Result<Scalar, BoxError> {
        match self {
            Self::Frame(f) => f(frame),
            Self::Reduce {
                column,
                reducer,
                remove_na,
            } => Ok(reducer(frame.column_values(column)?, *remove_na)),
            Self::Count => Ok(Scalar::from(frame.nrows())),
        }
    }
}

/// Ordered per-group reductions for `summarise`.
#[derive(Default)]
pub struct Summaries<'f> {
    entries: Vec<(String, SummaryExpr<'f>)>,
}

impl<'f> Summaries<'f> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reduce the group's frame to one value.
    #[must_use]
    pub fn with<V, F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        V: Into<Scalar>,
        F: Fn(&DataFrame) -> V + 'f,
    {
        self.entries.push((
            name.into(),
            SummaryExpr::Frame(Box::new(move |frame: &DataFrame| Ok(f(frame).into()))),
        ));
        self
    }

    #[must_use]
    pub fn try_with<V, E, F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        V: Into<Scalar>,
        E: Into<BoxError>,
        F: Fn(&DataFrame) -> Result<V, E> + 'f,
    {
        self.entries.push((
            name.into(),
            SummaryExpr::Frame(Box::new(move |frame: &DataFrame| {
                f(frame).map(Into::into).map_err(Into::into)
            })),
        ));
        self
    }

    /// Apply a column reducer such as `tf_types::nanmean` to `column`.
    #[must_use]
    pub fn reduce(
        mut self,
        name: impl Into<String>,
        column: impl Into<String>,
        reducer: Reducer,
        remove_na: bool,
    ) -> Self {
        self.entries.push((
            name.into(),
            SummaryExpr::Reduce {
                column: column.into(),
                reducer,
                remove_na,
            },
        ));
        self
    }

    /// Row count of the group.
    #[must_use]
    pub fn n(mut self, name: impl Into<String>) -> Self {
        self.entries.push((name.into(), SummaryExpr::Count));
        self
    }

    /// Output names must be unique and must not shadow a grouping column.
    fn check_names(&self, keys: &[String]) -> Result<(), FrameError> {
        let mut seen: Vec<&str> = keys.iter().map(String::as_str).collect();
        for name in self.names() {
            if seen.contains(&name) {
                let what = if keys.iter().any(|key| key == name) {
                    "grouping column"
                } else {
                    "summary"
                };
                return Err(FrameError::verb(
                    "summarise",
                    format!("summary '{name}' would overwrite the {what} of the same name"),
                ));
            }
            seen.push(name);
        }
        Ok(())
    }

    fn validate(&self, frame: &DataFrame) -> Result<(), FrameError> {
        let columns: Vec<&str> = self
            .entries
            .iter()
            .filter_map(|(_, expr)| match expr {
                SummaryExpr::Reduce { column, .. } => Some(column.as_str()),
                _ => None,
            })
            .collect();
        frame.require_columns(&columns)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }
}

/// Grouping verbs on a plain frame.
pub trait GroupByExt {
    fn group_by(&self, keys: &[&str]) -> Result<GroupedDataFrame, GroupByError>;

    /// Summarise the whole frame into exactly one row.
    fn summarise(&self, summaries: &Summaries<'_>) -> Result<DataFrame, GroupByError>;

    /// `group_by(keys)` then count rows per group into `n`.
    fn count(&self, keys: &[&str]) -> Result<DataFrame, GroupByError> {
        self.group_by(keys)?.count()
    }
}

impl GroupByExt for DataFrame {
    fn group_by(&self, keys: &[&str]) -> Result<GroupedDataFrame, GroupByError> {
        GroupedDataFrame::new(self.clone(), keys)
    }

    fn summarise(&self, summaries: &Summaries<'_>) -> Result<DataFrame, GroupByError> {
        if summaries.entries.is_empty() {
            return Err(FrameError::verb(
                "summarise",
                "an ungrouped summarise needs at least one summary to fill its single row",
            )
            .into());
        }
        summaries.validate(self)?;
        summaries.check_names(&[])?;
        let mut columns = Vec::new();
        for (name, expr) in &summaries.entries {
            let value = expr.evaluate(self).map_err(|source| GroupByError::Summary {
                key: "<all rows>".to_owned(),
                column: name.clone(),
                source,
            })?;
            columns.push((name.clone(), vec![value]));
        }
        Ok(DataFrame::from_columns(columns)?)
    }
}

/// Non-missing count, usable with [`Summaries::reduce`].
#[must_use]
pub fn count_present(values: &[Scalar], _remove_na: bool) -> Scalar {
    nancount(values, true)
}

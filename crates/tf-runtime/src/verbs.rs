use std::{convert::Infallible, future::Future, sync::Arc};

use futures::future::{FutureExt, LocalBoxFuture};
use tf_columnar::Column;
use tf_frame::{BoxError, DataFrame, FrameError, Record};
use tf_groupby::GroupedDataFrame;
use tf_types::Scalar;
use tracing::{debug, trace};

use crate::{AsyncTransformError, ConcurrencyOptions, run_ordered};

type AsyncRowFn<'f> =
    Box<dyn Fn(Record, usize, Arc<DataFrame>) -> LocalBoxFuture<'f, Result<Scalar, BoxError>> + 'f>;

type AsyncGroupFn<'f> =
    Box<dyn Fn(Arc<DataFrame>) -> LocalBoxFuture<'f, Result<Scalar, BoxError>> + 'f>;

/// Ordered async column assignments. Every task receives an owned snapshot
/// of its row, the row's index and the frame it belongs to (the group's
/// frame when grouped). Each column sees the columns assigned before it.
#[derive(Default)]
pub struct AsyncMutations<'f> {
    entries: Vec<(String, AsyncRowFn<'f>)>,
}

impl<'f> AsyncMutations<'f> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<V, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        V: Into<Scalar>,
        F: Fn(Record, usize, Arc<DataFrame>) -> Fut + 'f,
        Fut: Future<Output = V> + 'f,
    {
        self.try_with(name, move |record: Record, idx: usize, frame: Arc<DataFrame>| {
            let task = f(record, idx, frame);
            async move { Ok::<V, Infallible>(task.await) }
        })
    }

    #[must_use]
    pub fn try_with<V, E, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        V: Into<Scalar>,
        E: Into<BoxError>,
        F: Fn(Record, usize, Arc<DataFrame>) -> Fut + 'f,
        Fut: Future<Output = Result<V, E>> + 'f,
    {
        let boxed: AsyncRowFn<'f> = Box::new(
            move |record: Record,
                  idx: usize,
                  frame: Arc<DataFrame>|
                  -> LocalBoxFuture<'f, Result<Scalar, BoxError>> {
                let task = f(record, idx, frame);
                async move {
                    match task.await {
                        Ok(value) => Ok::<Scalar, BoxError>(value.into()),
                        Err(err) => Err(err.into()),
                    }
                }
                .boxed_local()
            },
        );
        self.entries.push((name.into(), boxed));
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

/// Named async reducers, each run once per group over the group's frame.
#[derive(Default)]
pub struct AsyncSummaries<'f> {
    entries: Vec<(String, AsyncGroupFn<'f>)>,
}

impl<'f> AsyncSummaries<'f> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<V, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        V: Into<Scalar>,
        F: Fn(Arc<DataFrame>) -> Fut + 'f,
        Fut: Future<Output = V> + 'f,
    {
        self.try_with(name, move |frame: Arc<DataFrame>| {
            let task = f(frame);
            async move { Ok::<V, Infallible>(task.await) }
        })
    }

    #[must_use]
    pub fn try_with<V, E, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        V: Into<Scalar>,
        E: Into<BoxError>,
        F: Fn(Arc<DataFrame>) -> Fut + 'f,
        Fut: Future<Output = Result<V, E>> + 'f,
    {
        let boxed: AsyncGroupFn<'f> = Box::new(
            move |frame: Arc<DataFrame>| -> LocalBoxFuture<'f, Result<Scalar, BoxError>> {
                let task = f(frame);
                async move {
                    match task.await {
                        Ok(value) => Ok::<Scalar, BoxError>(value.into()),
                        Err(err) => Err(err.into()),
                    }
                }
                .boxed_local()
            },
        );
        self.entries.push((name.into(), boxed));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }
}

/// Async `mutate`: one task per row and column, scheduled by `options`.
/// Columns are computed one after another.
pub async fn mutate_async(
    frame: &DataFrame,
    mutations: &AsyncMutations<'_>,
    options: &ConcurrencyOptions,
) -> Result<DataFrame, AsyncTransformError> {
    let mut current = frame.clone();
    for (name, f) in &mutations.entries {
        let context = Arc::new(current);
        let records = context.to_records();
        let values = run_ordered(records.len(), options, |row| {
            f(records[row].clone(), row, Arc::clone(&context))
        })
        .await
        .map_err(|failure| {
            AsyncTransformError::task("mutate_async", Some(name.as_str()), None, failure)
        })?;
        current = context.with_column(name, Column::from_values(values))?;
        debug!(column = name.as_str(), rows = current.nrows(), "async mutate column");
    }
    Ok(current)
}

/// Async `filter` with an infallible predicate.
pub async fn filter_async<P, Fut>(
    frame: &DataFrame,
    predicate: P,
    options: &ConcurrencyOptions,
) -> Result<DataFrame, AsyncTransformError>
where
    P: Fn(Record, usize, Arc<DataFrame>) -> Fut,
    Fut: Future<Output = bool>,
{
    try_filter_async(
        frame,
        |record, row, context| {
            let keep = predicate(record, row, context);
            async move { Ok::<bool, Infallible>(keep.await) }
        },
        options,
    )
    .await
}

/// Async `filter`: rows whose predicate resolves to `true`, in input order.
pub async fn try_filter_async<P, E, Fut>(
    frame: &DataFrame,
    predicate: P,
    options: &ConcurrencyOptions,
) -> Result<DataFrame, AsyncTransformError>
where
    P: Fn(Record, usize, Arc<DataFrame>) -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Into<BoxError>,
{
    let context = Arc::new(frame.clone());
    let records = context.to_records();
    let verdicts = run_ordered(records.len(), options, |row| {
        let task = predicate(records[row].clone(), row, Arc::clone(&context));
        async move { task.await.map_err(Into::<BoxError>::into) }
    })
    .await
    .map_err(|failure| AsyncTransformError::task("filter_async", None, None, failure))?;

    let keep: Vec<usize> = verdicts
        .into_iter()
        .enumerate()
        .filter_map(|(row, keep)| keep.then_some(row))
        .collect();
    debug!(rows = frame.nrows(), kept = keep.len(), "async filter");
    Ok(frame.take(&keep)?)
}

/// Async grouped `mutate`. Tasks receive their index within the group and
/// the group's frame; results land back in the original row slots.
pub async fn grouped_mutate_async(
    grouped: &GroupedDataFrame,
    mutations: &AsyncMutations<'_>,
    options: &ConcurrencyOptions,
) -> Result<GroupedDataFrame, AsyncTransformError> {
    if let Some(name) = mutations
        .names()
        .find(|name| grouped.keys().iter().any(|key| key.as_str() == *name))
    {
        return Err(FrameError::verb(
            "mutate_async",
            format!("cannot modify grouping column '{name}'"),
        )
        .into());
    }

    let locations = grouped.row_locations();
    let mut current = grouped.frame().clone();
    for (name, f) in &mutations.entries {
        let group_frames = group_contexts(grouped, &current)?;
        let records = current.to_records();
        let values = run_ordered(records.len(), options, |row| {
            let (group, local) = locations[row];
            f(records[row].clone(), local, Arc::clone(&group_frames[group]))
        })
        .await
        .map_err(|failure| {
            let group = describe_row_group(grouped, &locations, failure.index);
            AsyncTransformError::task("mutate_async", Some(name.as_str()), group, failure)
        })?;
        current = current.with_column(name, Column::from_values(values))?;
        trace!(
            column = name.as_str(),
            groups = grouped.n_groups(),
            "async grouped mutate column"
        );
    }
    regroup(grouped, current)
}

/// Async grouped `filter` with an infallible predicate.
pub async fn grouped_filter_async<P, Fut>(
    grouped: &GroupedDataFrame,
    predicate: P,
    options: &ConcurrencyOptions,
) -> Result<GroupedDataFrame, AsyncTransformError>
where
    P: Fn(Record, usize, Arc<DataFrame>) -> Fut,
    Fut: Future<Output = bool>,
{
    grouped_try_filter_async(
        grouped,
        |record, local, group| {
            let keep = predicate(record, local, group);
            async move { Ok::<bool, Infallible>(keep.await) }
        },
        options,
    )
    .await
}

/// Async grouped `filter`. The predicate sees only its group's frame and its
/// index within that group. Groups left without rows disappear.
pub async fn grouped_try_filter_async<P, E, Fut>(
    grouped: &GroupedDataFrame,
    predicate: P,
    options: &ConcurrencyOptions,
) -> Result<GroupedDataFrame, AsyncTransformError>
where
    P: Fn(Record, usize, Arc<DataFrame>) -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Into<BoxError>,
{
    let locations = grouped.row_locations();
    let group_frames = group_contexts(grouped, grouped.frame())?;
    let records = grouped.frame().to_records();
    let verdicts = run_ordered(records.len(), options, |row| {
        let (group, local) = locations[row];
        let task = predicate(records[row].clone(), local, Arc::clone(&group_frames[group]));
        async move { task.await.map_err(Into::<BoxError>::into) }
    })
    .await
    .map_err(|failure| {
        let group = describe_row_group(grouped, &locations, failure.index);
        AsyncTransformError::task("filter_async", None, group, failure)
    })?;

    let keep: Vec<usize> = verdicts
        .into_iter()
        .enumerate()
        .filter_map(|(row, keep)| keep.then_some(row))
        .collect();
    debug!(
        rows = grouped.frame().nrows(),
        kept = keep.len(),
        "async grouped filter"
    );
    Ok(grouped.retain_rows(keep)?)
}

/// One row per group: the key columns, then one column per async reducer.
/// Each reducer runs once per group under `options`.
pub async fn summarise_async(
    grouped: &GroupedDataFrame,
    summaries: &AsyncSummaries<'_>,
    options: &ConcurrencyOptions,
) -> Result<DataFrame, AsyncTransformError> {
    if let Some(name) = summaries
        .names()
        .find(|name| grouped.keys().iter().any(|key| key.as_str() == *name))
    {
        return Err(FrameError::verb(
            "summarise_async",
            format!("summary '{name}' would overwrite the grouping column of the same name"),
        )
        .into());
    }
    let group_frames = group_contexts(grouped, grouped.frame())?;
    let mut out = grouped.group_keys()?;
    for (name, f) in &summaries.entries {
        let values = run_ordered(group_frames.len(), options, |group| {
            f(Arc::clone(&group_frames[group]))
        })
        .await
        .map_err(|failure| {
            let group = grouped
                .groups()
                .get(failure.index)
                .map(|group| grouped.describe_key(group));
            AsyncTransformError::task("summarise_async", Some(name.as_str()), group, failure)
        })?;
        out = out.with_column(name, Column::from_values(values))?;
    }
    debug!(groups = grouped.n_groups(), "async summarise");
    Ok(out)
}

fn group_contexts(
    grouped: &GroupedDataFrame,
    frame: &DataFrame,
) -> Result<Vec<Arc<DataFrame>>, FrameError> {
    grouped
        .groups()
        .iter()
        .map(|group| frame.take(group.rows()).map(Arc::new))
        .collect()
}

fn describe_row_group(
    grouped: &GroupedDataFrame,
    locations: &[(usize, usize)],
    row: usize,
) -> Option<String> {
    let (group, _) = locations.get(row)?;
    grouped
        .groups()
        .get(*group)
        .map(|group| grouped.describe_key(group))
}

fn regroup(
    grouped: &GroupedDataFrame,
    frame: DataFrame,
) -> Result<GroupedDataFrame, AsyncTransformError> {
    let keys: Vec<&str> = grouped.keys().iter().map(String::as_str).collect();
    Ok(GroupedDataFrame::new(frame, &keys)?)
}

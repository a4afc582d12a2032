#![forbid(unsafe_code)]

mod verbs;

use std::{future::Future, num::NonZeroUsize, time::Duration};

use futures::{
    future::join_all,
    stream::{FuturesUnordered, StreamExt},
};
use futures_timer::Delay;
use serde::{Deserialize, Serialize};
use tf_frame::{BoxError, FrameError};
use tf_groupby::GroupByError;
use thiserror::Error;
use tracing::{debug, warn};

pub use verbs::{
    AsyncMutations, AsyncSummaries, filter_async, grouped_filter_async, grouped_mutate_async,
    grouped_try_filter_async, mutate_async, summarise_async, try_filter_async,
};

pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How long to wait before retry number `attempt` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `base_delay_ms * multiplier^(attempt - 1)`, capped at `max_delay_ms`.
    Exponential {
        base_delay_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
    },
    /// `base_delay_ms * attempt`, capped at `max_delay_ms`.
    Linear { base_delay_ms: u64, max_delay_ms: u64 },
}

impl Backoff {
    #[must_use]
    pub fn exponential() -> Self {
        Self::Exponential {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }

    #[must_use]
    pub fn linear() -> Self {
        Self::Linear {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }

    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let millis = match *self {
            Self::Exponential {
                base_delay_ms,
                multiplier,
                max_delay_ms,
            } => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let raw = base_delay_ms as f64 * multiplier.max(0.0).powi(exponent);
                if raw.is_finite() {
                    (raw as u64).min(max_delay_ms)
                } else {
                    max_delay_ms
                }
            }
            Self::Linear {
                base_delay_ms,
                max_delay_ms,
            } => base_delay_ms
                .saturating_mul(u64::from(attempt))
                .min(max_delay_ms),
        };
        Duration::from_millis(millis)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a task runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Whether a task that has failed `attempt` times gets another run.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
        }
    }
}

/// Scheduling for async row and group transforms. The default runs every
/// task at once with no retries.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyOptions {
    /// Upper bound on tasks in flight. `None` is unbounded.
    pub concurrency: Option<NonZeroUsize>,
    /// Run tasks in consecutive batches of this size instead; each batch
    /// runs fully concurrently.
    pub batch_size: Option<NonZeroUsize>,
    /// Pause between batches.
    pub batch_delay_ms: u64,
    pub retry: Option<RetryPolicy>,
}

impl ConcurrencyOptions {
    /// One task at a time.
    #[must_use]
    pub fn sequential() -> Self {
        Self::with_concurrency(1)
    }

    /// At most `limit` tasks in flight; zero means unbounded.
    #[must_use]
    pub fn with_concurrency(limit: usize) -> Self {
        Self {
            concurrency: NonZeroUsize::new(limit),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn batched(mut self, size: usize, delay_ms: u64) -> Self {
        self.batch_size = NonZeroUsize::new(size);
        self.batch_delay_ms = delay_ms;
        self
    }

    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// The task that decided a failed run: the lowest index whose retries were
/// exhausted.
#[derive(Debug, Error)]
#[error("task {index} failed after {attempts} attempt(s): {source}")]
pub struct TaskFailure {
    pub index: usize,
    pub attempts: u32,
    pub source: BoxError,
}

#[derive(Debug, Error)]
pub enum AsyncTransformError {
    /// A user task failed. `row` is the row position in the input frame, or
    /// the group ordinal for `summarise_async`.
    #[error(
        "{verb} failed at row {row}{}{} after {attempts} attempt(s): {source}",
        column_suffix(.column),
        group_suffix(.group)
    )]
    Task {
        verb: &'static str,
        row: usize,
        column: Option<String>,
        group: Option<String>,
        attempts: u32,
        source: BoxError,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
}

impl AsyncTransformError {
    fn task(
        verb: &'static str,
        column: Option<&str>,
        group: Option<String>,
        failure: TaskFailure,
    ) -> Self {
        Self::Task {
            verb,
            row: failure.index,
            column: column.map(str::to_owned),
            group,
            attempts: failure.attempts,
            source: failure.source,
        }
    }

    /// Row (or group ordinal) of a task failure.
    #[must_use]
    pub fn row(&self) -> Option<usize> {
        match self {
            Self::Task { row, .. } => Some(*row),
            _ => None,
        }
    }
}

fn column_suffix(column: &Option<String>) -> String {
    column
        .as_deref()
        .map(|name| format!(" (column '{name}')"))
        .unwrap_or_default()
}

fn group_suffix(group: &Option<String>) -> String {
    group
        .as_deref()
        .map(|key| format!(" in group {key}"))
        .unwrap_or_default()
}

/// Run `make_task(0..count)` under `options` and return the outputs in index
/// order, whatever order they complete in.
///
/// Tasks are admitted in index order. Once any task has failed no further
/// task is admitted; tasks already in flight are drained and the failure
/// with the lowest index is returned. A retried task is rebuilt by calling
/// `make_task` again with the same index.
pub async fn run_ordered<T, F, Fut>(
    count: usize,
    options: &ConcurrencyOptions,
    make_task: F,
) -> Result<Vec<T>, TaskFailure>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    debug!(
        tasks = count,
        concurrency = options.concurrency.map(NonZeroUsize::get),
        batch_size = options.batch_size.map(NonZeroUsize::get),
        retries = options.retry.map(|policy| policy.max_retries),
        "running async tasks"
    );
    match options.batch_size {
        Some(size) => run_batches(count, size.get(), options, &make_task).await,
        None => {
            let limit = options.concurrency.map_or(count, NonZeroUsize::get);
            run_bounded(count, limit, options.retry.as_ref(), &make_task).await
        }
    }
}

async fn run_bounded<T, F, Fut>(
    count: usize,
    limit: usize,
    retry: Option<&RetryPolicy>,
    make_task: &F,
) -> Result<Vec<T>, TaskFailure>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    let limit = limit.max(1);
    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(count).collect();
    let mut in_flight = FuturesUnordered::new();
    let mut failure: Option<TaskFailure> = None;
    let mut next = 0;

    loop {
        while failure.is_none() && next < count && in_flight.len() < limit {
            let index = next;
            in_flight.push(async move { (index, attempt(index, retry, make_task).await) });
            next += 1;
        }
        let Some((index, outcome)) = in_flight.next().await else {
            break;
        };
        match outcome {
            Ok(value) => slots[index] = Some(value),
            Err(err) => {
                if failure.as_ref().is_none_or(|first| err.index < first.index) {
                    failure = Some(err);
                }
            }
        }
    }

    match failure {
        Some(failure) => {
            debug!(
                index = failure.index,
                admitted = next,
                "async run stopped on failure"
            );
            Err(failure)
        }
        None => Ok(slots.into_iter().flatten().collect()),
    }
}

async fn run_batches<T, F, Fut>(
    count: usize,
    size: usize,
    options: &ConcurrencyOptions,
    make_task: &F,
) -> Result<Vec<T>, TaskFailure>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    let retry = options.retry.as_ref();
    let mut results = Vec::with_capacity(count);
    for start in (0..count).step_by(size) {
        if start > 0 && options.batch_delay_ms > 0 {
            Delay::new(Duration::from_millis(options.batch_delay_ms)).await;
        }
        let end = count.min(start + size);
        let outcomes = join_all((start..end).map(|index| attempt(index, retry, make_task))).await;
        for outcome in outcomes {
            results.push(outcome?);
        }
    }
    Ok(results)
}

async fn attempt<T, F, Fut>(
    index: usize,
    retry: Option<&RetryPolicy>,
    make_task: &F,
) -> Result<T, TaskFailure>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match make_task(index).await {
            Ok(value) => return Ok(value),
            Err(source) => match retry {
                Some(policy) if policy.should_retry(attempts) => {
                    let delay = policy.backoff.delay_for(attempts);
                    warn!(
                        index,
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %source,
                        "retrying async task"
                    );
                    if !delay.is_zero() {
                        Delay::new(delay).await;
                    }
                }
                _ => {
                    return Err(TaskFailure {
                        index,
                        attempts,
                        source,
                    });
                }
            },
        }
    }
}

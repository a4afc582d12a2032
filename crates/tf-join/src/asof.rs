use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tf_frame::{DataFrame, structural_key};
use tf_types::{DType, Scalar, ScalarKey};
use tracing::debug;

use crate::{JoinError, JoinKeys, JoinSuffixes, key_slices, validate_keys};

/// Which right row an as-of join picks for a left key `x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsofDirection {
    /// Last right row with key `<= x`.
    #[default]
    Backward,
    /// First right row with key `>= x`.
    Forward,
    /// Closest of the two; ties go to the backward candidate.
    Nearest,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AsofOptions {
    pub direction: AsofDirection,
    /// Largest accepted key distance, in key units (milliseconds for
    /// timestamps). `None` or a non-finite value means no limit.
    pub tolerance: Option<f64>,
    /// Exact-match columns, present on both sides, that scope the search.
    pub by: Vec<String>,
    pub suffixes: JoinSuffixes,
}

impl AsofOptions {
    #[must_use]
    pub fn direction(mut self, direction: AsofDirection) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    #[must_use]
    pub fn by(mut self, columns: &[&str]) -> Self {
        self.by = columns.iter().map(|name| (*name).to_owned()).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFamily {
    Number,
    Timestamp,
}

/// Ordered key positions: `None` for missing values. Every present value
/// must be a number or a timestamp, and all of one family.
fn ordinates(
    frame: &DataFrame,
    column: &str,
    family: &mut Option<KeyFamily>,
) -> Result<Vec<Option<f64>>, JoinError> {
    let values = frame.column_values(column)?;
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        if value.is_missing() {
            out.push(None);
            continue;
        }
        let (kind, ordinate) = match value {
            Scalar::Int64(_) | Scalar::Float64(_) => {
                (KeyFamily::Number, value.as_f64().unwrap_or(f64::NAN))
            }
            Scalar::Timestamp(ts) => (KeyFamily::Timestamp, ts.timestamp_millis() as f64),
            other => {
                return Err(JoinError::AsofKey {
                    column: column.to_owned(),
                    dtype: other.dtype(),
                });
            }
        };
        if family.is_some_and(|expected| expected != kind) {
            return Err(JoinError::AsofKey {
                column: column.to_owned(),
                dtype: DType::Mixed,
            });
        }
        *family = Some(kind);
        out.push(Some(ordinate));
    }
    Ok(out)
}

fn pick(
    bucket: &[(f64, usize)],
    x: f64,
    direction: AsofDirection,
    tolerance: Option<f64>,
) -> Option<usize> {
    let after = bucket.partition_point(|(key, _)| *key <= x);
    let backward = after.checked_sub(1).map(|idx| bucket[idx]);
    let chosen = match direction {
        AsofDirection::Backward => backward,
        AsofDirection::Forward => bucket
            .get(bucket.partition_point(|(key, _)| *key < x))
            .copied(),
        AsofDirection::Nearest => match (backward, bucket.get(after).copied()) {
            (Some(before), Some(next)) if next.0 - x < x - before.0 => Some(next),
            (Some(before), _) => Some(before),
            (None, next) => next,
        },
    };
    let (key, row) = chosen?;
    match tolerance {
        Some(limit) if limit.is_finite() && (key - x).abs() > limit => None,
        _ => Some(row),
    }
}

/// Join every left row to at most one right row by nearest ordered key.
///
/// Output keeps all left rows in order with all left columns, followed by
/// the right columns other than `on` and `by`. Unmatched rows get `Null` in
/// the right columns. Name clashes take `suffixes`.
pub fn asof_join(
    left: &DataFrame,
    right: &DataFrame,
    on: &str,
    options: &AsofOptions,
) -> Result<DataFrame, JoinError> {
    let mut keys: Vec<&str> = vec![on];
    keys.extend(options.by.iter().map(String::as_str));
    validate_keys(left, right, &JoinKeys::on(&keys))?;

    let mut family = None;
    let left_ord = ordinates(left, on, &mut family)?;
    let right_ord = ordinates(right, on, &mut family)?;
    let left_by = key_slices(left, &options.by);
    let right_by = key_slices(right, &options.by);

    let mut buckets = HashMap::<Vec<ScalarKey<'_>>, Vec<(f64, usize)>>::new();
    for (row, ordinate) in right_ord.iter().enumerate() {
        if let Some(key) = ordinate {
            buckets
                .entry(structural_key(&right_by, row))
                .or_default()
                .push((*key, row));
        }
    }
    for bucket in buckets.values_mut() {
        bucket.sort_by(|a, b| a.0.total_cmp(&b.0));
    }

    let picks: Vec<Option<usize>> = left_ord
        .iter()
        .enumerate()
        .map(|(row, ordinate)| {
            let x = (*ordinate)?;
            let bucket = buckets.get(&structural_key(&left_by, row))?;
            pick(bucket, x, options.direction, options.tolerance)
        })
        .collect();

    let excluded: HashSet<&str> = keys.iter().copied().collect();
    let right_payload: Vec<_> = right
        .columns()
        .filter(|(name, _)| !excluded.contains(name))
        .collect();
    let right_names: HashSet<&str> = right_payload.iter().map(|(name, _)| *name).collect();
    let left_names: HashSet<&str> = left.columns().map(|(name, _)| name).collect();

    let mut columns = Vec::with_capacity(left.ncols() + right_payload.len());
    for (name, column) in left.columns() {
        let out_name = if right_names.contains(name) {
            format!("{name}{}", options.suffixes.left)
        } else {
            name.to_owned()
        };
        columns.push((out_name, column.clone()));
    }
    for (name, column) in right_payload {
        let out_name = if left_names.contains(name) {
            format!("{name}{}", options.suffixes.right)
        } else {
            name.to_owned()
        };
        columns.push((out_name, column.reindex_by_positions(&picks)?));
    }

    debug!(
        direction = ?options.direction,
        left_rows = left.nrows(),
        right_rows = right.nrows(),
        matched = picks.iter().flatten().count(),
        "asof joined frames"
    );
    Ok(DataFrame::new(columns)?)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tf_frame::{DataFrame, record};
    use tf_types::Scalar;

    use super::{AsofDirection, AsofOptions, asof_join};
    use crate::{JoinError, JoinExt};

    fn trades() -> DataFrame {
        DataFrame::from_records(vec![
            record! { "t" => 2, "sym" => "A", "qty" => 10 },
            record! { "t" => 5, "sym" => "B", "qty" => 20 },
            record! { "t" => 9, "sym" => "A", "qty" => 30 },
            record! { "t" => Scalar::null(), "sym" => "A", "qty" => 40 },
            record! { "t" => 0, "sym" => "A", "qty" => 50 },
        ])
    }

    fn quotes() -> DataFrame {
        DataFrame::from_records(vec![
            record! { "t" => 1, "sym" => "A", "price" => 100.0 },
            record! { "t" => 4, "sym" => "B", "price" => 200.0 },
            record! { "t" => 6, "sym" => "A", "price" => 101.0 },
            record! { "t" => 6, "sym" => "A", "price" => 102.0 },
            record! { "t" => 10, "sym" => "A", "price" => 103.0 },
        ])
    }

    fn strings(frame: &DataFrame, name: &str) -> Vec<String> {
        frame
            .column_values(name)
            .expect("column")
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn backward_takes_the_last_key_at_or_before() {
        let out = asof_join(&trades(), &quotes(), "t", &AsofOptions::default()).expect("asof");
        assert_eq!(out.column_names(), &["t", "sym", "qty", "sym_y", "price"]);
        assert_eq!(strings(&out, "qty"), ["10", "20", "30", "40", "50"]);
        assert_eq!(strings(&out, "price"), ["100", "200", "102", "null", "null"]);
    }

    #[test]
    fn forward_and_nearest_pick_the_other_side() {
        let forward = asof_join(
            &trades(),
            &quotes(),
            "t",
            &AsofOptions::default().direction(AsofDirection::Forward),
        )
        .expect("forward");
        assert_eq!(strings(&forward, "price"), ["200", "101", "103", "null", "100"]);

        let nearest = asof_join(
            &trades(),
            &quotes(),
            "t",
            &AsofOptions::default().direction(AsofDirection::Nearest),
        )
        .expect("nearest");
        assert_eq!(strings(&nearest, "price"), ["100", "200", "103", "null", "100"]);
    }

    #[test]
    fn by_columns_scope_the_search_and_tolerance_bounds_it() {
        let out = trades()
            .asof_join(&quotes(), "t", &AsofOptions::default().by(&["sym"]).tolerance(3.0))
            .expect("asof");
        assert_eq!(out.column_names(), &["t", "sym", "qty", "price"]);
        assert_eq!(strings(&out, "price"), ["100", "200", "102", "null", "null"]);

        let tight = trades()
            .asof_join(&quotes(), "t", &AsofOptions::default().by(&["sym"]).tolerance(0.5))
            .expect("asof");
        assert_eq!(strings(&tight, "price"), ["null", "null", "null", "null", "null"]);
    }

    #[test]
    fn timestamps_order_by_instant() {
        let at = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).single().expect("time");
        let left = DataFrame::from_records(vec![record! { "ts" => at(9) }, record! { "ts" => at(12) }]);
        let right = DataFrame::from_records(vec![
            record! { "ts" => at(8), "rate" => 1 },
            record! { "ts" => at(11), "rate" => 2 },
        ]);
        let out = left.asof_join(&right, "ts", &AsofOptions::default()).expect("asof");
        assert_eq!(strings(&out, "rate"), ["1", "2"]);
    }

    #[test]
    fn empty_right_keeps_left_rows_and_right_columns() {
        let right = DataFrame::empty_with_columns(&["t", "price"]).expect("empty");
        let out = asof_join(&trades(), &right, "t", &AsofOptions::default()).expect("asof");
        assert_eq!(out.nrows(), 5);
        assert!(out.column_values("price").expect("price").iter().all(Scalar::is_null));
    }

    #[test]
    fn non_ordered_keys_and_missing_columns_are_rejected() {
        let err = asof_join(&trades(), &quotes(), "sym", &AsofOptions::default())
            .expect_err("text key");
        assert!(matches!(err, JoinError::AsofKey { ref column, .. } if column == "sym"));

        let err = asof_join(&trades(), &quotes(), "t", &AsofOptions::default().by(&["venue"]))
            .expect_err("missing by");
        assert!(matches!(err, JoinError::MissingKeys { .. }));
    }
}

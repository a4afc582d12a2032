#![forbid(unsafe_code)]

//! Invariants that must hold for arbitrary frames: row order through
//! filter and arrange, partition completeness, join cardinality, the pivot
//! round trip and NA-aware reducers.

use std::cmp::Ordering;

use proptest::prelude::*;

use tf_frame::{DataFrame, Row};
use tf_groupby::GroupByExt;
use tf_join::JoinExt;
use tf_reshape::{PivotWider, ReshapeExt};
use tf_types::{Scalar, compare_present, nanmean, nansum};

// ---------------------------------------------------------------------------
// Strategy generators
// ---------------------------------------------------------------------------

/// A value column entry: mostly numbers, sometimes missing in each of its
/// three forms.
fn arb_value() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        4 => (-50i64..50).prop_map(Scalar::Int64),
        2 => (-50.0f64..50.0).prop_map(Scalar::Float64),
        1 => Just(Scalar::null()),
        1 => Just(Scalar::undefined()),
        1 => Just(Scalar::Float64(f64::NAN)),
    ]
}

/// A grouping or join key from a small space so that keys repeat.
fn arb_key() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        3 => (0i64..4).prop_map(Scalar::Int64),
        2 => "[a-c]".prop_map(Scalar::Utf8),
        1 => Just(Scalar::null()),
        1 => Just(Scalar::undefined()),
    ]
}

fn ids(n: usize) -> Vec<Scalar> {
    (0..n).map(Scalar::from).collect()
}

/// `id` (unique, ascending), `key` and `value` columns.
fn arb_frame(max_rows: usize) -> impl Strategy<Value = DataFrame> {
    (0..=max_rows)
        .prop_flat_map(|n| {
            (
                proptest::collection::vec(arb_key(), n),
                proptest::collection::vec(arb_value(), n),
            )
        })
        .prop_map(|(keys, values)| {
            DataFrame::from_columns(vec![("id", ids(keys.len())), ("key", keys), ("value", values)])
                .expect("generated columns share a length")
        })
}

/// A wide frame with a unique `id` and two value columns, at least one row.
fn arb_wide(max_rows: usize) -> impl Strategy<Value = DataFrame> {
    (1..=max_rows)
        .prop_flat_map(|n| {
            (
                proptest::collection::vec(arb_value(), n),
                proptest::collection::vec(arb_value(), n),
            )
        })
        .prop_map(|(a, b)| {
            DataFrame::from_columns(vec![("id", ids(a.len())), ("a", a), ("b", b)])
                .expect("generated columns share a length")
        })
}

fn id_of(row: &Row<'_>) -> i64 {
    row.value("id").as_i64().unwrap_or(-1)
}

fn divisible(row: &Row<'_>, modulus: i64) -> bool {
    row.value("value")
        .as_i64()
        .is_some_and(|v| v.rem_euclid(modulus) == 0)
}

// ---------------------------------------------------------------------------
// Property: row order
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// filter keeps exactly the matching rows in their original order.
    #[test]
    fn prop_filter_preserves_relative_order(frame in arb_frame(40), modulus in 2i64..5) {
        let out = frame.filter(|row, _, _| divisible(row, modulus));
        let expected: Vec<i64> = frame
            .rows()
            .filter(|row| divisible(row, modulus))
            .map(|row| id_of(&row))
            .collect();
        let actual: Vec<i64> = out.rows().map(|row| id_of(&row)).collect();
        prop_assert_eq!(actual, expected);
    }

    /// arrange is stable, ordered, and puts every missing value last.
    #[test]
    fn prop_arrange_is_stable_with_missing_last(frame in arb_frame(40)) {
        let sorted = frame.arrange(["value"]).expect("arrange");
        let values = sorted.column_values("value").expect("value");
        let order: Vec<i64> = sorted.rows().map(|row| id_of(&row)).collect();

        let first_missing = values.iter().position(Scalar::is_missing).unwrap_or(values.len());
        prop_assert!(values[first_missing..].iter().all(Scalar::is_missing));
        for i in 1..values.len() {
            let cmp = if i < first_missing {
                compare_present(&values[i - 1], &values[i])
            } else if i > first_missing {
                Ordering::Equal
            } else {
                continue;
            };
            prop_assert_ne!(cmp, Ordering::Greater);
            if cmp == Ordering::Equal {
                prop_assert!(order[i - 1] < order[i], "ties keep input order");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Property: grouping
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Every row belongs to exactly one group, and to the group of its key.
    #[test]
    fn prop_groups_partition_rows(frame in arb_frame(40)) {
        let grouped = frame.group_by(&["key"]).expect("group_by");
        let mut seen: Vec<usize> = grouped
            .groups()
            .iter()
            .flat_map(|group| group.rows().iter().copied())
            .collect();
        seen.sort_unstable();
        prop_assert_eq!(seen, (0..frame.nrows()).collect::<Vec<_>>());

        for group in grouped.groups() {
            for &row in group.rows() {
                let key = frame.value(row, "key").expect("key");
                prop_assert!(key.semantic_eq(&group.key()[0]));
            }
        }
        for (i, a) in grouped.groups().iter().enumerate() {
            for b in &grouped.groups()[i + 1..] {
                prop_assert!(!a.key()[0].semantic_eq(&b.key()[0]), "group keys are distinct");
            }
        }
    }

    /// Group order follows the first appearance of each key.
    #[test]
    fn prop_groups_follow_first_appearance(frame in arb_frame(40)) {
        let grouped = frame.group_by(&["key"]).expect("group_by");
        let firsts: Vec<usize> = grouped.groups().iter().map(|group| group.rows()[0]).collect();
        prop_assert!(firsts.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

// ---------------------------------------------------------------------------
// Property: join cardinality
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Inner join emits, for every left row, one row per matching right row.
    #[test]
    fn prop_inner_join_row_count((left, right) in (arb_frame(15), arb_frame(15))) {
        let joined = left.inner_join(&right, &["key"]).expect("inner join");
        let right_keys = right.column_values("key").expect("key");
        let expected: usize = left
            .column_values("key")
            .expect("key")
            .iter()
            .map(|key| right_keys.iter().filter(|other| key.semantic_eq(other)).count())
            .sum();
        prop_assert_eq!(joined.nrows(), expected);
        prop_assert!(joined.nrows() <= left.nrows() * right.nrows());
    }

    /// Semi and anti joins split the left rows between them.
    #[test]
    fn prop_semi_and_anti_partition_left((left, right) in (arb_frame(15), arb_frame(15))) {
        let semi = left.semi_join(&right, &["key"]).expect("semi join");
        let anti = left.anti_join(&right, &["key"]).expect("anti join");
        prop_assert_eq!(semi.nrows() + anti.nrows(), left.nrows());
        prop_assert_eq!(semi.column_names(), left.column_names());

        let left_join = left.left_join(&right, &["key"]).expect("left join");
        prop_assert!(left_join.nrows() >= left.nrows());
    }
}

// ---------------------------------------------------------------------------
// Property: reshape
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Widening the long form of a frame with unique ids restores it.
    #[test]
    fn prop_pivot_round_trip(wide in arb_wide(20)) {
        let long = wide.pivot_longer(&["a", "b"], "k", "v").expect("pivot_longer");
        prop_assert_eq!(long.nrows(), wide.nrows() * 2);

        let back = long.pivot_wider(&PivotWider::new("k", "v")).expect("pivot_wider");
        prop_assert!(back.semantic_eq(&wide), "round trip changed the frame: {:?}", back);
    }
}

// ---------------------------------------------------------------------------
// Property: NA-aware reducers
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// With remove_na, sum and mean see only the present values.
    #[test]
    fn prop_na_aware_reducers_skip_missing(values in proptest::collection::vec(arb_value(), 0..30)) {
        let present: Vec<Scalar> = values.iter().filter(|v| !v.is_missing()).cloned().collect();

        prop_assert!(nansum(&values, true).semantic_eq(&nansum(&present, true)));
        let mean = nanmean(&values, true);
        prop_assert!(mean.semantic_eq(&nanmean(&present, true)));
        if present.is_empty() {
            prop_assert!(mean.is_missing());
        }
        if present.len() < values.len() {
            prop_assert!(nansum(&values, false).is_missing());
        }
    }
}

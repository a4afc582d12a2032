#![forbid(unsafe_code)]

use std::{
    collections::{HashMap, HashSet},
    mem::size_of,
};

use bumpalo::{Bump, collections::Vec as BumpVec};
use serde::{Deserialize, Serialize};
use tf_columnar::{Column, ColumnError};
use tf_frame::{DataFrame, FrameError, structural_key};
use tf_types::{DType, Scalar, ScalarKey};
use thiserror::Error;
use tracing::debug;

mod asof;

pub use asof::{AsofDirection, AsofOptions, asof_join};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    /// Left rows with at least one match, left columns only.
    Semi,
    /// Left rows with no match, left columns only.
    Anti,
    /// Every left row paired with every right row.
    Cross,
}

impl JoinType {
    fn keeps_unmatched_left(self) -> bool {
        matches!(self, Self::Left | Self::Full)
    }

    fn keeps_unmatched_right(self) -> bool {
        matches!(self, Self::Right | Self::Full)
    }

    fn is_filtering(self) -> bool {
        matches!(self, Self::Semi | Self::Anti)
    }
}

/// Key columns, paired left → right. Output keeps the left names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinKeys {
    pub left: Vec<String>,
    pub right: Vec<String>,
}

impl JoinKeys {
    /// Same-named key columns on both sides.
    pub fn on(names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|name| (*name).to_owned()).collect();
        Self {
            left: names.clone(),
            right: names,
        }
    }

    pub fn mapped(pairs: &[(&str, &str)]) -> Self {
        Self {
            left: pairs.iter().map(|(l, _)| (*l).to_owned()).collect(),
            right: pairs.iter().map(|(_, r)| (*r).to_owned()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinSuffixes {
    pub left: String,
    pub right: String,
}

impl Default for JoinSuffixes {
    fn default() -> Self {
        Self {
            left: String::new(),
            right: "_y".to_owned(),
        }
    }
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinOptions {
    pub suffixes: JoinSuffixes,
    pub execution: JoinExecutionOptions,
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join key column(s) missing: left [{}], right [{}]", .left.join(", "), .right.join(", "))]
    MissingKeys { left: Vec<String>, right: Vec<String> },
    #[error("join requires at least one key column")]
    EmptyKeys,
    #[error("join key arity differs: {left} left key(s) vs {right} right key(s)")]
    KeyArityMismatch { left: usize, right: usize },
    #[error("asof key column '{column}' must hold numbers or timestamps of one kind, found {dtype:?}")]
    AsofKey { column: String, dtype: DType },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinExecutionTrace {
    used_arena: bool,
    output_rows: usize,
    estimated_bytes: usize,
}

pub fn join(
    left: &DataFrame,
    right: &DataFrame,
    keys: &JoinKeys,
    join_type: JoinType,
    options: &JoinOptions,
) -> Result<DataFrame, JoinError> {
    let (joined, _) = join_with_trace(left, right, keys, join_type, options)?;
    Ok(joined)
}

/// Key slices and the right-side hash index for one join.
struct ProbePlan<'a> {
    join_type: JoinType,
    left_rows: usize,
    right_rows: usize,
    left_keys: Vec<&'a [Scalar]>,
    right_map: HashMap<Vec<ScalarKey<'a>>, Vec<usize>>,
}

impl<'a> ProbePlan<'a> {
    fn build(
        left: &'a DataFrame,
        right: &'a DataFrame,
        keys: &JoinKeys,
        join_type: JoinType,
    ) -> Result<Self, JoinError> {
        let mut plan = Self {
            join_type,
            left_rows: left.nrows(),
            right_rows: right.nrows(),
            left_keys: Vec::new(),
            right_map: HashMap::new(),
        };
        if join_type == JoinType::Cross {
            return Ok(plan);
        }

        validate_keys(left, right, keys)?;
        plan.left_keys = key_slices(left, &keys.left);
        let right_keys = key_slices(right, &keys.right);
        for pos in 0..right.nrows() {
            plan.right_map
                .entry(structural_key(&right_keys, pos))
                .or_default()
                .push(pos);
        }
        Ok(plan)
    }

    fn matches(&self, left_pos: usize) -> &[usize] {
        self.right_map
            .get(&structural_key(&self.left_keys, left_pos))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn estimate_output_rows(&self) -> usize {
        if self.join_type == JoinType::Cross {
            return self.left_rows.saturating_mul(self.right_rows);
        }
        let from_left: usize = (0..self.left_rows)
            .map(|pos| {
                let hits = self.matches(pos).len();
                match self.join_type {
                    JoinType::Semi => usize::from(hits > 0),
                    JoinType::Anti => usize::from(hits == 0),
                    jt if hits == 0 && jt.keeps_unmatched_left() => 1,
                    _ => hits,
                }
            })
            .sum();
        if self.join_type.keeps_unmatched_right() {
            from_left.saturating_add(self.right_rows)
        } else {
            from_left
        }
    }

    /// Emit `(left, right)` position pairs in output order: left rows in
    /// order with their matches, then never-matched right rows.
    fn probe<F>(&self, mut emit: F)
    where
        F: FnMut(Option<usize>, Option<usize>),
    {
        if self.join_type == JoinType::Cross {
            for l in 0..self.left_rows {
                for r in 0..self.right_rows {
                    emit(Some(l), Some(r));
                }
            }
            return;
        }

        let mut matched_right = vec![false; self.right_rows];
        for l in 0..self.left_rows {
            let hits = self.matches(l);
            match self.join_type {
                JoinType::Semi if !hits.is_empty() => emit(Some(l), None),
                JoinType::Anti if hits.is_empty() => emit(Some(l), None),
                JoinType::Semi | JoinType::Anti => {}
                jt if hits.is_empty() => {
                    if jt.keeps_unmatched_left() {
                        emit(Some(l), None);
                    }
                }
                _ => {
                    for &r in hits {
                        matched_right[r] = true;
                        emit(Some(l), Some(r));
                    }
                }
            }
        }

        if self.join_type.keeps_unmatched_right() {
            for (r, _) in matched_right.iter().enumerate().filter(|(_, hit)| !**hit) {
                emit(None, Some(r));
            }
        }
    }
}

fn validate_keys(left: &DataFrame, right: &DataFrame, keys: &JoinKeys) -> Result<(), JoinError> {
    if keys.left.is_empty() || keys.right.is_empty() {
        return Err(JoinError::EmptyKeys);
    }
    if keys.left.len() != keys.right.len() {
        return Err(JoinError::KeyArityMismatch {
            left: keys.left.len(),
            right: keys.right.len(),
        });
    }
    let missing_left: Vec<String> = keys
        .left
        .iter()
        .filter(|key| !left.has_column(key))
        .cloned()
        .collect();
    let missing_right: Vec<String> = keys
        .right
        .iter()
        .filter(|key| !right.has_column(key))
        .cloned()
        .collect();
    if missing_left.is_empty() && missing_right.is_empty() {
        Ok(())
    } else {
        Err(JoinError::MissingKeys {
            left: missing_left,
            right: missing_right,
        })
    }
}

fn key_slices<'a>(frame: &'a DataFrame, keys: &[String]) -> Vec<&'a [Scalar]> {
    keys.iter()
        .filter_map(|key| frame.column(key).map(Column::values))
        .collect()
}

fn join_with_trace(
    left: &DataFrame,
    right: &DataFrame,
    keys: &JoinKeys,
    join_type: JoinType,
    options: &JoinOptions,
) -> Result<(DataFrame, JoinExecutionTrace), JoinError> {
    let plan = ProbePlan::build(left, right, keys, join_type)?;
    let output_rows = plan.estimate_output_rows();
    let estimated_bytes = estimate_intermediate_bytes(output_rows);
    let execution = options.execution;
    let use_arena = execution.use_arena && estimated_bytes <= execution.arena_budget_bytes;

    let joined = if use_arena {
        join_with_arena(left, right, keys, &plan, options, output_rows)?
    } else {
        join_with_global_allocator(left, right, keys, &plan, options, output_rows)?
    };

    debug!(
        join_type = ?join_type,
        left_rows = left.nrows(),
        right_rows = right.nrows(),
        output_rows = joined.nrows(),
        used_arena = use_arena,
        "joined frames"
    );

    Ok((
        joined,
        JoinExecutionTrace {
            used_arena: use_arena,
            output_rows,
            estimated_bytes,
        },
    ))
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<Option<usize>>().saturating_mul(2))
}

fn join_with_global_allocator(
    left: &DataFrame,
    right: &DataFrame,
    keys: &JoinKeys,
    plan: &ProbePlan<'_>,
    options: &JoinOptions,
    output_rows: usize,
) -> Result<DataFrame, JoinError> {
    let mut left_positions = Vec::<Option<usize>>::with_capacity(output_rows);
    let mut right_positions = Vec::<Option<usize>>::with_capacity(output_rows);
    plan.probe(|l, r| {
        left_positions.push(l);
        right_positions.push(r);
    });
    assemble(
        left,
        right,
        keys,
        plan.join_type,
        &options.suffixes,
        &left_positions,
        &right_positions,
    )
}

fn join_with_arena(
    left: &DataFrame,
    right: &DataFrame,
    keys: &JoinKeys,
    plan: &ProbePlan<'_>,
    options: &JoinOptions,
    output_rows: usize,
) -> Result<DataFrame, JoinError> {
    let arena = Bump::new();
    let mut left_positions = BumpVec::<Option<usize>>::with_capacity_in(output_rows, &arena);
    let mut right_positions = BumpVec::<Option<usize>>::with_capacity_in(output_rows, &arena);
    plan.probe(|l, r| {
        left_positions.push(l);
        right_positions.push(r);
    });
    assemble(
        left,
        right,
        keys,
        plan.join_type,
        &options.suffixes,
        left_positions.as_slice(),
        right_positions.as_slice(),
    )
}

fn assemble(
    left: &DataFrame,
    right: &DataFrame,
    keys: &JoinKeys,
    join_type: JoinType,
    suffixes: &JoinSuffixes,
    left_positions: &[Option<usize>],
    right_positions: &[Option<usize>],
) -> Result<DataFrame, JoinError> {
    if join_type.is_filtering() {
        let rows: Vec<usize> = left_positions.iter().flatten().copied().collect();
        return Ok(left.take(&rows)?);
    }

    let (left_keys, right_keys): (&[String], &[String]) = if join_type == JoinType::Cross {
        (&[], &[])
    } else {
        (&keys.left, &keys.right)
    };

    let right_payload: Vec<(&str, &Column)> = right
        .columns()
        .filter(|(name, _)| !right_keys.iter().any(|key| key.as_str() == *name))
        .collect();
    let right_names: HashSet<&str> = right_payload.iter().map(|(name, _)| *name).collect();
    let left_names: HashSet<&str> = left.columns().map(|(name, _)| name).collect();

    let mut columns = Vec::with_capacity(left.ncols() + right_payload.len());
    for (name, column) in left.columns() {
        if let Some(k) = left_keys.iter().position(|key| key == name) {
            let right_key = right.column_values(&right_keys[k])?;
            let values = column.values();
            let coalesced = left_positions
                .iter()
                .zip(right_positions)
                .map(|(l, r)| match (l, r) {
                    (Some(l), _) => values[*l].clone(),
                    (None, Some(r)) => right_key[*r].clone(),
                    (None, None) => Scalar::null(),
                })
                .collect::<Column>();
            columns.push((name.to_owned(), coalesced));
        } else {
            let out_name = if right_names.contains(name) {
                format!("{name}{}", suffixes.left)
            } else {
                name.to_owned()
            };
            columns.push((out_name, column.reindex_by_positions(left_positions)?));
        }
    }
    for (name, column) in right_payload {
        let out_name = if left_names.contains(name) {
            format!("{name}{}", suffixes.right)
        } else {
            name.to_owned()
        };
        columns.push((out_name, column.reindex_by_positions(right_positions)?));
    }

    Ok(DataFrame::new(columns)?)
}

/// Join verbs on a frame. Keys are same-named on both sides; use
/// [`JoinExt::join_with`] for mapped keys or custom suffixes.
pub trait JoinExt {
    fn join_with(
        &self,
        right: &DataFrame,
        keys: &JoinKeys,
        join_type: JoinType,
        options: &JoinOptions,
    ) -> Result<DataFrame, JoinError>;

    fn inner_join(&self, right: &DataFrame, on: &[&str]) -> Result<DataFrame, JoinError> {
        self.join_with(right, &JoinKeys::on(on), JoinType::Inner, &JoinOptions::default())
    }

    fn left_join(&self, right: &DataFrame, on: &[&str]) -> Result<DataFrame, JoinError> {
        self.join_with(right, &JoinKeys::on(on), JoinType::Left, &JoinOptions::default())
    }

    fn right_join(&self, right: &DataFrame, on: &[&str]) -> Result<DataFrame, JoinError> {
        self.join_with(right, &JoinKeys::on(on), JoinType::Right, &JoinOptions::default())
    }

    fn full_join(&self, right: &DataFrame, on: &[&str]) -> Result<DataFrame, JoinError> {
        self.join_with(right, &JoinKeys::on(on), JoinType::Full, &JoinOptions::default())
    }

    fn semi_join(&self, right: &DataFrame, on: &[&str]) -> Result<DataFrame, JoinError> {
        self.join_with(right, &JoinKeys::on(on), JoinType::Semi, &JoinOptions::default())
    }

    fn anti_join(&self, right: &DataFrame, on: &[&str]) -> Result<DataFrame, JoinError> {
        self.join_with(right, &JoinKeys::on(on), JoinType::Anti, &JoinOptions::default())
    }

    fn cross_join(&self, right: &DataFrame) -> Result<DataFrame, JoinError> {
        self.join_with(right, &JoinKeys::on(&[]), JoinType::Cross, &JoinOptions::default())
    }

    /// Nearest-key join on the ordered column `on`; see [`asof_join`].
    fn asof_join(
        &self,
        right: &DataFrame,
        on: &str,
        options: &AsofOptions,
    ) -> Result<DataFrame, JoinError>;
}

impl JoinExt for DataFrame {
    fn join_with(
        &self,
        right: &DataFrame,
        keys: &JoinKeys,
        join_type: JoinType,
        options: &JoinOptions,
    ) -> Result<DataFrame, JoinError> {
        join(self, right, keys, join_type, options)
    }

    fn asof_join(
        &self,
        right: &DataFrame,
        on: &str,
        options: &AsofOptions,
    ) -> Result<DataFrame, JoinError> {
        asof_join(self, right, on, options)
    }
}

#[cfg(test)]
mod tests {
    use tf_frame::{DataFrame, record};
    use tf_types::Scalar;

    use super::{
        JoinError, JoinExecutionOptions, JoinExt, JoinKeys, JoinOptions, JoinSuffixes, JoinType,
        join, join_with_trace,
    };

    fn people() -> DataFrame {
        DataFrame::from_records(vec![
            record! { "id" => 1, "name" => "Luke" },
            record! { "id" => 2, "name" => "Leia" },
            record! { "id" => 3, "name" => "Han" },
        ])
    }

    fn ships() -> DataFrame {
        DataFrame::from_records(vec![
            record! { "id" => 1, "ship" => "X-wing" },
            record! { "id" => 3, "ship" => "Falcon" },
            record! { "id" => 1, "ship" => "Snowspeeder" },
            record! { "id" => 4, "ship" => "Slave I" },
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
    fn inner_join_emits_every_match_pair_in_left_order() {
        let out = people().inner_join(&ships(), &["id"]).expect("join");
        assert_eq!(out.column_names(), &["id", "name", "ship"]);
        assert_eq!(strings(&out, "name"), ["Luke", "Luke", "Han"]);
        assert_eq!(strings(&out, "ship"), ["X-wing", "Snowspeeder", "Falcon"]);
    }

    #[test]
    fn left_join_fills_unmatched_with_null() {
        let out = people().left_join(&ships(), &["id"]).expect("join");
        assert_eq!(out.nrows(), 4);
        assert_eq!(out.value(2, "name"), Some(&Scalar::from("Leia")));
        assert_eq!(out.value(2, "ship"), Some(&Scalar::null()));
    }

    #[test]
    fn right_join_appends_unmatched_right_rows_with_right_keys() {
        let out = people().right_join(&ships(), &["id"]).expect("join");
        assert_eq!(strings(&out, "id"), ["1", "1", "3", "4"]);
        assert_eq!(out.value(3, "name"), Some(&Scalar::null()));
        assert_eq!(out.value(3, "ship"), Some(&Scalar::from("Slave I")));
    }

    #[test]
    fn full_join_keeps_both_unmatched_sides() {
        let out = people().full_join(&ships(), &["id"]).expect("join");
        assert_eq!(strings(&out, "id"), ["1", "1", "2", "3", "4"]);
        assert_eq!(
            strings(&out, "ship"),
            ["X-wing", "Snowspeeder", "null", "Falcon", "Slave I"]
        );
    }

    #[test]
    fn semi_and_anti_keep_left_columns_only() {
        let semi = people().semi_join(&ships(), &["id"]).expect("semi");
        assert_eq!(semi.column_names(), &["id", "name"]);
        assert_eq!(strings(&semi, "name"), ["Luke", "Han"]);

        let anti = people().anti_join(&ships(), &["id"]).expect("anti");
        assert_eq!(strings(&anti, "name"), ["Leia"]);
    }

    #[test]
    fn cross_join_pairs_every_row() {
        let colors = DataFrame::from_records(vec![
            record! { "color" => "red" },
            record! { "color" => "blue" },
        ]);
        let out = people().cross_join(&colors).expect("cross");
        assert_eq!(out.nrows(), 6);
        assert_eq!(strings(&out, "color")[..2], ["red", "blue"]);
    }

    #[test]
    fn missing_keys_are_reported_for_both_sides_at_once() {
        let err = people()
            .join_with(
                &ships(),
                &JoinKeys::mapped(&[("id", "person"), ("era", "id")]),
                JoinType::Inner,
                &JoinOptions::default(),
            )
            .expect_err("missing");
        let JoinError::MissingKeys { left, right } = &err else {
            panic!("expected MissingKeys, got {err:?}");
        };
        assert_eq!(left, &["era"]);
        assert_eq!(right, &["person"]);
        assert_eq!(
            err.to_string(),
            "join key column(s) missing: left [era], right [person]"
        );
    }

    #[test]
    fn mapped_keys_keep_left_names_and_suffix_conflicts() {
        let crew = DataFrame::from_records(vec![
            record! { "person_id" => 2, "name" => "Princess", "role" => "general" },
        ]);
        let out = people()
            .join_with(
                &crew,
                &JoinKeys::mapped(&[("id", "person_id")]),
                JoinType::Inner,
                &JoinOptions {
                    suffixes: JoinSuffixes {
                        left: "_x".to_owned(),
                        right: "_y".to_owned(),
                    },
                    ..JoinOptions::default()
                },
            )
            .expect("join");
        assert_eq!(out.column_names(), &["id", "name_x", "name_y", "role"]);
        assert_eq!(out.value(0, "name_y"), Some(&Scalar::from("Princess")));
    }

    #[test]
    fn default_suffixes_leave_left_names_untouched() {
        let right = DataFrame::from_records(vec![record! { "id" => 1, "name" => "Skywalker" }]);
        let out = people().inner_join(&right, &["id"]).expect("join");
        assert_eq!(out.column_names(), &["id", "name", "name_y"]);
    }

    #[test]
    fn empty_side_still_contributes_declared_columns() {
        let empty = DataFrame::empty_with_columns(&["id", "ship", "crew"]).expect("empty");
        let out = people().left_join(&empty, &["id"]).expect("join");
        assert_eq!(out.column_names(), &["id", "name", "ship", "crew"]);
        assert_eq!(out.nrows(), 3);
        assert!(out.column_values("crew").expect("crew").iter().all(Scalar::is_null));
    }

    #[test]
    fn missing_and_numeric_keys_match_structurally() {
        let left = DataFrame::from_records(vec![
            record! { "k" => Scalar::null(), "a" => 1 },
            record! { "k" => 2.0, "a" => 2 },
        ]);
        let right = DataFrame::from_records(vec![
            record! { "k" => Scalar::undefined(), "b" => "x" },
            record! { "k" => 2, "b" => "y" },
        ]);
        let out = left.inner_join(&right, &["k"]).expect("join");
        assert_eq!(strings(&out, "b"), ["x", "y"]);
    }

    #[test]
    fn arena_join_matches_global_allocator_behavior() {
        let global = JoinOptions {
            execution: JoinExecutionOptions {
                use_arena: false,
                arena_budget_bytes: 0,
            },
            ..JoinOptions::default()
        };
        for join_type in [JoinType::Inner, JoinType::Left, JoinType::Full, JoinType::Anti] {
            let keys = JoinKeys::on(&["id"]);
            let arena = join(&people(), &ships(), &keys, join_type, &JoinOptions::default())
                .expect("arena join");
            let plain = join(&people(), &ships(), &keys, join_type, &global).expect("global join");
            assert_eq!(arena, plain);
        }
    }

    #[test]
    fn arena_join_falls_back_when_budget_is_too_small() {
        let options = JoinOptions {
            execution: JoinExecutionOptions {
                use_arena: true,
                arena_budget_bytes: 1,
            },
            ..JoinOptions::default()
        };
        let (out, trace) = join_with_trace(
            &people(),
            &ships(),
            &JoinKeys::on(&["id"]),
            JoinType::Inner,
            &options,
        )
        .expect("fallback join");
        assert_eq!(out.nrows(), 3);
        assert_eq!(trace.output_rows, 3);
        assert!(!trace.used_arena);
        assert!(trace.estimated_bytes > options.execution.arena_budget_bytes);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: JoinOptions =
            serde_json::from_str(r#"{"suffixes":{"right":".r"}}"#).expect("parse");
        assert_eq!(options.suffixes.left, "");
        assert_eq!(options.suffixes.right, ".r");
        assert!(options.execution.use_arena);
    }
}

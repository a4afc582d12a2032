#![forbid(unsafe_code)]

use std::{any::Any, cmp::Ordering, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Null,
    Bool,
    Int64,
    Float64,
    Utf8,
    Timestamp,
    Opaque,
    /// Values of more than one semantic type live in the same column.
    Mixed,
}

/// The two missing markers. `Null` is an intentional absence, `Undefined` a
/// structural one (a key the source record never had).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullKind {
    Null,
    Undefined,
}

/// A payload the engine does not look inside. Equality is reference identity.
#[derive(Clone)]
pub struct Opaque(Arc<dyn Any + Send + Sync>);

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({:#x})", self.addr())
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null(NullKind),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Timestamp(DateTime<Utc>),
    #[serde(skip)]
    Opaque(Opaque),
}

impl Scalar {
    #[must_use]
    pub const fn null() -> Self {
        Self::Null(NullKind::Null)
    }

    #[must_use]
    pub const fn undefined() -> Self {
        Self::Null(NullKind::Undefined)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null(_) => DType::Null,
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
            Self::Timestamp(_) => DType::Timestamp,
            Self::Opaque(_) => DType::Opaque,
        }
    }

    /// Null, undefined and NaN all count as missing for reducers and sorting.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null(_) => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(NullKind::Null))
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Null(NullKind::Undefined))
    }

    /// Structural equality: missing markers are equal to each other and
    /// numbers compare by value across `Int64`/`Float64`.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        ScalarKey::from_scalar(self) == ScalarKey::from_scalar(other)
    }

    #[must_use]
    pub fn coalesce(&self, other: &Self) -> Self {
        if self.is_missing() {
            other.clone()
        } else {
            self.clone()
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null(kind) => Err(TypeError::ValueIsMissing { kind: *kind }),
            other => Err(TypeError::NonNumericValue {
                value: other.to_string(),
                dtype: other.dtype(),
            }),
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Float64(v) if !v.is_nan() => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Utf8(v) => Some(v.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null(NullKind::Null) => f.write_str("null"),
            Self::Null(NullKind::Undefined) => f.write_str("undefined"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => f.write_str(v),
            Self::Timestamp(v) => f.write_str(&v.to_rfc3339()),
            Self::Opaque(_) => f.write_str("<opaque>"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Int64(i64::from(value))
    }
}

impl From<usize> for Scalar {
    fn from(value: usize) -> Self {
        i64::try_from(value).map_or(Self::Float64(value as f64), Self::Int64)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl From<DateTime<Utc>> for Scalar {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Opaque> for Scalar {
    fn from(value: Opaque) -> Self {
        Self::Opaque(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::null(), Into::into)
    }
}

/// Hashable structural identity of a scalar, borrowed from the value.
///
/// Used for grouping, joining and distinct. All missing markers collapse to
/// [`ScalarKey::Missing`], integral floats collapse onto the matching integer,
/// timestamps compare by instant and opaque payloads by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKey<'a> {
    Missing,
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(&'a str),
    Timestamp(DateTime<Utc>),
    Opaque(usize),
}

impl<'a> ScalarKey<'a> {
    #[must_use]
    pub fn from_scalar(value: &'a Scalar) -> Self {
        match value {
            Scalar::Null(_) => Self::Missing,
            Scalar::Bool(v) => Self::Bool(*v),
            Scalar::Int64(v) => Self::Int64(*v),
            Scalar::Float64(v) => float_key(*v),
            Scalar::Utf8(v) => Self::Utf8(v.as_str()),
            Scalar::Timestamp(v) => Self::Timestamp(*v),
            Scalar::Opaque(v) => Self::Opaque(v.addr()),
        }
    }
}

fn float_key<'a>(v: f64) -> ScalarKey<'a> {
    if v.is_nan() {
        return ScalarKey::Missing;
    }
    // i64::MAX as f64 rounds up to 2^63, which is already out of range.
    if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        return ScalarKey::Int64(v as i64);
    }
    ScalarKey::FloatBits(v.to_bits())
}

/// Ordering between two present (non-missing) values.
///
/// Numbers compare numerically across int/float; values of different semantic
/// types fall back to dtype order so sorting mixed columns stays total.
#[must_use]
pub fn compare_present(left: &Scalar, right: &Scalar) -> Ordering {
    match (left, right) {
        (Scalar::Bool(lhs), Scalar::Bool(rhs)) => lhs.cmp(rhs),
        (Scalar::Int64(lhs), Scalar::Int64(rhs)) => lhs.cmp(rhs),
        (Scalar::Int64(_) | Scalar::Float64(_), Scalar::Int64(_) | Scalar::Float64(_)) => {
            let lhs = left.as_f64().unwrap_or(f64::NAN);
            let rhs = right.as_f64().unwrap_or(f64::NAN);
            lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal)
        }
        (Scalar::Utf8(lhs), Scalar::Utf8(rhs)) => lhs.cmp(rhs),
        (Scalar::Timestamp(lhs), Scalar::Timestamp(rhs)) => lhs.cmp(rhs),
        _ => semantic_rank(left.dtype()).cmp(&semantic_rank(right.dtype())),
    }
}

fn semantic_rank(dtype: DType) -> u8 {
    match dtype {
        DType::Bool => 0,
        DType::Int64 | DType::Float64 => 1,
        DType::Utf8 => 2,
        DType::Timestamp => 3,
        DType::Opaque => 4,
        DType::Null | DType::Mixed => 5,
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("dtype {left:?} and {right:?} have no common semantic type")]
    IncompatibleDtypes { left: DType, right: DType },
    #[error("value {value:?} has non-numeric dtype {dtype:?}")]
    NonNumericValue { value: String, dtype: DType },
    #[error("value is missing ({kind:?})")]
    ValueIsMissing { kind: NullKind },
}

/// Common dtype of two value types. Integers and floats share the number
/// type; every other pairing of distinct present types is incompatible.
pub fn common_dtype(left: DType, right: DType) -> Result<DType, TypeError> {
    use DType::{Float64, Int64, Null};

    let out = match (left, right) {
        (a, b) if a == b => a,
        (Null, other) | (other, Null) => other,
        (Int64, Float64) | (Float64, Int64) => Float64,
        _ => return Err(TypeError::IncompatibleDtypes { left, right }),
    };

    Ok(out)
}

/// Like [`common_dtype`], but an incompatible pair widens to `Mixed`
/// instead of failing. Values are never converted.
#[must_use]
pub fn unify_dtype(left: DType, right: DType) -> DType {
    common_dtype(left, right).unwrap_or(DType::Mixed)
}

#[must_use]
pub fn infer_dtype(values: &[Scalar]) -> DType {
    values
        .iter()
        .fold(DType::Null, |current, value| unify_dtype(current, value.dtype()))
}

// ── Missingness utilities ──────────────────────────────────────────────

pub fn count_na(values: &[Scalar]) -> usize {
    values.iter().filter(|v| v.is_missing()).count()
}

pub fn dropna(values: &[Scalar]) -> Vec<Scalar> {
    values.iter().filter(|v| !v.is_missing()).cloned().collect()
}

// ── NA-aware reducers ──────────────────────────────────────────────────
//
// Every reducer has the shape `fn(values, remove_na) -> Scalar`. Without
// `remove_na` a single missing input makes the result null; with it, missing
// inputs are skipped. Non-numeric present values are ignored by the numeric
// reducers.

/// Signature of a column reducer that summarise can call per group.
pub type Reducer = fn(&[Scalar], bool) -> Scalar;

fn collect_numeric(values: &[Scalar]) -> Vec<f64> {
    values.iter().filter_map(Scalar::as_f64).collect()
}

fn has_missing(values: &[Scalar]) -> bool {
    values.iter().any(Scalar::is_missing)
}

pub fn nansum(values: &[Scalar], remove_na: bool) -> Scalar {
    if !remove_na && has_missing(values) {
        return Scalar::null();
    }
    let mut int_total = Some(0_i64);
    let mut float_total = 0.0;
    for value in values {
        match value {
            Scalar::Int64(v) => {
                int_total = int_total.and_then(|acc| acc.checked_add(*v));
                float_total += *v as f64;
            }
            Scalar::Float64(v) if !v.is_nan() => {
                int_total = None;
                float_total += v;
            }
            _ => {}
        }
    }
    int_total.map_or(Scalar::Float64(float_total), Scalar::Int64)
}

pub fn nanmean(values: &[Scalar], remove_na: bool) -> Scalar {
    if !remove_na && has_missing(values) {
        return Scalar::null();
    }
    let nums = collect_numeric(values);
    if nums.is_empty() {
        return Scalar::null();
    }
    let sum: f64 = nums.iter().sum();
    Scalar::Float64(sum / nums.len() as f64)
}

pub fn nancount(values: &[Scalar], remove_na: bool) -> Scalar {
    let n = if remove_na {
        values.iter().filter(|v| !v.is_missing()).count()
    } else {
        values.len()
    };
    Scalar::from(n)
}

fn extreme(values: &[Scalar], remove_na: bool, wanted: Ordering) -> Scalar {
    if !remove_na && has_missing(values) {
        return Scalar::null();
    }
    values
        .iter()
        .filter(|v| v.as_f64().is_some())
        .fold(None::<&Scalar>, |best, candidate| match best {
            Some(current) if compare_present(candidate, current) != wanted => Some(current),
            _ => Some(candidate),
        })
        .cloned()
        .unwrap_or_else(Scalar::null)
}

pub fn nanmin(values: &[Scalar], remove_na: bool) -> Scalar {
    extreme(values, remove_na, Ordering::Less)
}

pub fn nanmax(values: &[Scalar], remove_na: bool) -> Scalar {
    extreme(values, remove_na, Ordering::Greater)
}

pub fn nanmedian(values: &[Scalar], remove_na: bool) -> Scalar {
    if !remove_na && has_missing(values) {
        return Scalar::null();
    }
    let mut nums = collect_numeric(values);
    if nums.is_empty() {
        return Scalar::null();
    }
    nums.sort_by(f64::total_cmp);
    let mid = nums.len() / 2;
    if nums.len().is_multiple_of(2) {
        Scalar::Float64((nums[mid - 1] + nums[mid]) / 2.0)
    } else {
        Scalar::Float64(nums[mid])
    }
}

pub fn nanvar(values: &[Scalar], ddof: usize, remove_na: bool) -> Scalar {
    if !remove_na && has_missing(values) {
        return Scalar::null();
    }
    let nums = collect_numeric(values);
    if nums.len() <= ddof {
        return Scalar::null();
    }
    let mean: f64 = nums.iter().sum::<f64>() / nums.len() as f64;
    let sum_sq: f64 = nums.iter().map(|x| (x - mean).powi(2)).sum();
    Scalar::Float64(sum_sq / (nums.len() - ddof) as f64)
}

pub fn nanstd(values: &[Scalar], ddof: usize, remove_na: bool) -> Scalar {
    match nanvar(values, ddof, remove_na) {
        Scalar::Float64(v) => Scalar::Float64(v.sqrt()),
        other => other,
    }
}

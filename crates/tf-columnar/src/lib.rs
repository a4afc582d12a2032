#![forbid(unsafe_code)]

use tf_types::{DType, NullKind, Scalar, infer_dtype, unify_dtype};
use thiserror::Error;

/// Packed one-bit-per-row presence mask. A set bit means the row holds a
/// present (non-missing) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityMask {
    words: Vec<u64>,
    len: usize,
}

impl ValidityMask {
    #[must_use]
    pub fn from_values(values: &[Scalar]) -> Self {
        let len = values.len();
        let mut words = vec![0_u64; len.div_ceil(64)];
        for (idx, value) in values.iter().enumerate() {
            if !value.is_missing() {
                words[idx / 64] |= 1_u64 << (idx % 64);
            }
        }
        Self { words, len }
    }

    #[must_use]
    pub fn all_invalid(len: usize) -> Self {
        Self {
            words: vec![0_u64; len.div_ceil(64)],
            len,
        }
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    #[must_use]
    pub fn count_valid(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bits(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|idx| self.get(idx))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ColumnError {
    #[error("row position {position} is out of bounds for column of length {len}")]
    PositionOutOfBounds { position: usize, len: usize },
}

/// One column of a frame. Values are stored exactly as given: the dtype is
/// derived from them and never used to convert them.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
    validity: ValidityMask,
}

impl Column {
    #[must_use]
    pub fn from_values(values: Vec<Scalar>) -> Self {
        let dtype = infer_dtype(&values);
        let validity = ValidityMask::from_values(&values);
        Self {
            dtype,
            values,
            validity,
        }
    }

    /// A column of `len` copies of the given missing marker.
    #[must_use]
    pub fn missing(len: usize, kind: NullKind) -> Self {
        Self {
            dtype: DType::Null,
            values: vec![Scalar::Null(kind); len],
            validity: ValidityMask::all_invalid(len),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<Scalar> {
        self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Scalar> {
        self.values.iter()
    }

    #[must_use]
    pub fn validity(&self) -> &ValidityMask {
        &self.validity
    }

    #[must_use]
    pub fn null_count(&self) -> usize {
        self.len() - self.validity.count_valid()
    }

    /// Gather rows by position, in the order given.
    pub fn take(&self, positions: &[usize]) -> Result<Self, ColumnError> {
        let values = positions
            .iter()
            .map(|&position| self.checked_value(position).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_values(values))
    }

    /// Gather rows by optional position. `None` slots become explicit nulls.
    pub fn reindex_by_positions(&self, positions: &[Option<usize>]) -> Result<Self, ColumnError> {
        let values = positions
            .iter()
            .map(|slot| match slot {
                Some(position) => self.checked_value(*position).cloned(),
                None => Ok(Scalar::null()),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_values(values))
    }

    /// Stack columns end to end. The resulting dtype is the union of the
    /// inputs' dtypes (possibly `Mixed`); no value is converted.
    #[must_use]
    pub fn concat(columns: &[&Self]) -> Self {
        let total = columns.iter().map(|c| c.len()).sum();
        let mut values = Vec::with_capacity(total);
        let mut dtype = DType::Null;
        for column in columns {
            values.extend_from_slice(&column.values);
            dtype = unify_dtype(dtype, column.dtype);
        }
        let validity = ValidityMask::from_values(&values);
        Self {
            dtype,
            values,
            validity,
        }
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.semantic_eq(b))
    }

    fn checked_value(&self, position: usize) -> Result<&Scalar, ColumnError> {
        self.values
            .get(position)
            .ok_or(ColumnError::PositionOutOfBounds {
                position,
                len: self.values.len(),
            })
    }
}

impl<'a> IntoIterator for &'a Column {
    type Item = &'a Scalar;
    type IntoIter = std::slice::Iter<'a, Scalar>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<Scalar> for Column {
    fn from_iter<I: IntoIterator<Item = Scalar>>(iter: I) -> Self {
        Self::from_values(iter.into_iter().collect())
    }
}

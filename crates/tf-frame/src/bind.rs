use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tf_columnar::Column;
use tf_types::{DType, NullKind};
use tracing::warn;

use crate::DataFrame;

/// A column whose value types differ between the bound frames. The column
/// keeps every value as-is and its dtype becomes `Mixed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMismatch {
    pub column: String,
    pub dtypes: Vec<DType>,
}

/// Stack frames top to bottom. Columns are the ordered union of all inputs;
/// rows lacking a column get undefined.
#[must_use]
pub fn bind_rows(frames: &[&DataFrame]) -> DataFrame {
    bind_rows_with_report(frames).0
}

pub fn bind_rows_with_report(frames: &[&DataFrame]) -> (DataFrame, Vec<SchemaMismatch>) {
    let mut names: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for frame in frames {
        for name in frame.column_names() {
            if seen.insert(name.as_str()) {
                names.push(name.clone());
            }
        }
    }

    let nrows = frames.iter().map(|frame| frame.nrows()).sum();
    let mut mismatches = Vec::new();
    let mut columns = Vec::with_capacity(names.len());
    for name in &names {
        let fills: Vec<Column> = frames
            .iter()
            .filter(|frame| !frame.has_column(name))
            .map(|frame| Column::missing(frame.nrows(), NullKind::Undefined))
            .collect();
        let mut fill_iter = fills.iter();
        let parts: Vec<&Column> = frames
            .iter()
            .filter_map(|frame| frame.column(name).or_else(|| fill_iter.next()))
            .collect();

        let mut dtypes: Vec<DType> = Vec::new();
        for frame in frames {
            if let Some(dtype) = frame.column(name).map(Column::dtype)
                && dtype != DType::Null
                && !dtypes.contains(&dtype)
            {
                dtypes.push(dtype);
            }
        }

        let column = Column::concat(&parts);
        if column.dtype() == DType::Mixed && dtypes.len() > 1 {
            warn!(
                column = name.as_str(),
                dtypes = ?dtypes,
                "bind_rows produced a column with a union of value types"
            );
            mismatches.push(SchemaMismatch {
                column: name.clone(),
                dtypes,
            });
        }
        columns.push(column);
    }

    let lookup = crate::index_names(&names);
    let frame = DataFrame {
        names,
        columns,
        lookup,
        nrows,
    };
    (frame, mismatches)
}

impl DataFrame {
    /// `bind_rows` with this frame first.
    #[must_use]
    pub fn bind_rows(&self, others: &[&DataFrame]) -> DataFrame {
        let mut frames = Vec::with_capacity(others.len() + 1);
        frames.push(self);
        frames.extend_from_slice(others);
        bind_rows(&frames)
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Record;

/// Diagnostic for one rejected input row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowValidationError {
    pub row: usize,
    pub column: Option<String>,
    pub message: String,
}

impl RowValidationError {
    pub fn new(row: usize, message: impl Into<String>) -> Self {
        Self {
            row,
            column: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

impl fmt::Display for RowValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(f, "row {} column '{column}': {}", self.row, self.message),
            None => write!(f, "row {}: {}", self.row, self.message),
        }
    }
}

/// What a validator hands back: the (possibly defaulted) rows and every
/// per-row problem it found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutcome {
    pub rows: Vec<Record>,
    pub errors: Vec<RowValidationError>,
}

/// Hook for an external schema validator. Called once over the whole input.
pub trait SchemaValidator {
    fn validate(&self, rows: Vec<Record>) -> ValidationOutcome;
}

impl<F> SchemaValidator for F
where
    F: Fn(Vec<Record>) -> ValidationOutcome,
{
    fn validate(&self, rows: Vec<Record>) -> ValidationOutcome {
        self(rows)
    }
}

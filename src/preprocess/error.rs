//! Preprocessing error types

use thiserror::Error;

/// Errors raised while reshaping rows. A row that cannot be repaired is not
/// an error; it is reported as `Unified::Discarded`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreprocessError {
    /// Target granularity is not a whole multiple of the row's step
    #[error("Granularity {to} ms is not a multiple of {from} ms")]
    UnevenGranularity { from: i64, to: i64 },

    /// Pre-aggregation can only coarsen a row
    #[error("Cannot refine granularity from {from} ms to {to} ms")]
    Refinement { from: i64, to: i64 },

    /// Zero or negative step or interval
    #[error("Invalid granularity: {0}")]
    InvalidGranularity(i64),

    #[error("Invalid interval [{start}, {finish})")]
    InvalidInterval { start: i64, finish: i64 },

    /// Interval needs more grid points than a row may hold
    #[error("Interval [{start}, {finish}) at {step} ms exceeds the grid limit")]
    GridTooLong { start: i64, finish: i64, step: i64 },
}

pub type PreprocessResult<T> = Result<T, PreprocessError>;

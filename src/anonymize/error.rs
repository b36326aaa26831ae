//! Anonymization error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnonymizeError {
    /// Tier 3 has leftover members and no group to merge them into
    #[error("k-anonymity grouping not possible for {0}")]
    GroupingImpossible(String),

    /// The function has no aggregation strategy
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),

    /// Attribute values are text and cannot be aggregated
    #[error("Attribute is not numeric: {0}")]
    NotNumeric(String),

    /// A call named an attribute that was not preprocessed
    #[error("No rows for attribute {0}")]
    MissingAttribute(String),

    #[error("Invalid privacy parameter: {0}")]
    InvalidParameter(String),

    /// Noise generator could not be used
    #[error("Noise source unavailable: {0}")]
    NoiseUnavailable(String),
}

pub type AnonymizeResult<T> = Result<T, AnonymizeError>;

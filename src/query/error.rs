//! Query error types
//!
//! Errors raised while compiling query text and lowering its WHERE clause.

use thiserror::Error;

/// Errors that can occur while compiling a query
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Query text does not match the grammar
    #[error("Parse error: {0}")]
    Parse(String),

    /// Attribute is not of the form `DataSource.attribute`
    #[error("Invalid attribute reference: {0}")]
    InvalidAttribute(String),

    /// Function called with the wrong number of attributes
    #[error("Invalid arity for {function}: {message}")]
    Arity {
        function: String,
        message: String,
    },

    /// WHERE clause shape cannot be lowered to a constraint list
    #[error("Unsupported constraint: {0}")]
    UnsupportedConstraint(String),

    /// Malformed bound encoding
    #[error("Invalid bound: {0}")]
    InvalidBound(String),

    /// Referenced data source is not part of the registry
    #[error("Unknown data source: {0}")]
    UnknownDataSource(String),

    /// Referenced attribute does not exist on its data source
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),
}

/// Result type for query compilation
pub type QueryResult<T> = Result<T, QueryError>;

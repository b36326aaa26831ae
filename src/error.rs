//! Crate Error Taxonomy
//!
//! `CoreError` collects the per-layer errors and maps every kind onto the
//! stable numeric codes reported to callers as `{code, message}` pairs.

use crate::anonymize::AnonymizeError;
use crate::preprocess::PreprocessError;
use crate::query::QueryError;
use crate::sources::DataSource;
use crate::storage::{QueryKey, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes of the external interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ExistingQuery,
    DataSourceUnknown,
    DataSourceNotRegistered,
    QueryNotFound,
    CannotProcessQuery,
    QueryAlreadyPaid,
    QueryNotReady,
    QueryNotRetrievable,
    InvalidQuery,
    Undefined,
}

impl ErrorCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::ExistingQuery => 2,
            Self::DataSourceUnknown => 8,
            Self::DataSourceNotRegistered => 9,
            Self::QueryNotFound => 19,
            Self::CannotProcessQuery => 24,
            Self::QueryAlreadyPaid => 25,
            Self::QueryNotReady => 26,
            Self::QueryNotRetrievable => 28,
            Self::InvalidQuery => 32,
            Self::Undefined => 99,
        }
    }
}

/// Errors surfaced by the core
#[derive(Error, Debug)]
pub enum CoreError {
    /// Grammar, constraint shape or registration parameters rejected
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Query already exists: {0}")]
    ExistingQuery(QueryKey),

    #[error("Unknown data source: {0}")]
    DataSourceUnknown(String),

    /// Known to the registry but not installed in the repository
    #[error("Data source not registered: {0}")]
    DataSourceNotRegistered(DataSource),

    #[error("Query not found: {0}")]
    QueryNotFound(String),

    /// Unexpected failure while processing an activated query
    #[error("Aggregation failed: {0}")]
    Aggregation(String),

    #[error("Query already paid: {0}")]
    QueryAlreadyPaid(QueryKey),

    #[error("Query not ready: {0}")]
    QueryNotReady(QueryKey),

    /// Query is past the state that allows the operation
    #[error("Query not retrievable: {0}")]
    QueryNotRetrievable(QueryKey),

    #[error("Preprocessing error: {0}")]
    Preprocess(#[from] PreprocessError),

    #[error("Anonymization error: {0}")]
    Anonymize(#[from] AnonymizeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<QueryError> for CoreError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::UnknownDataSource(name) => CoreError::DataSourceUnknown(name),
            other => CoreError::InvalidQuery(other.to_string()),
        }
    }
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidQuery(_) => ErrorCode::InvalidQuery,
            Self::ExistingQuery(_) => ErrorCode::ExistingQuery,
            Self::DataSourceUnknown(_) => ErrorCode::DataSourceUnknown,
            Self::DataSourceNotRegistered(_) => ErrorCode::DataSourceNotRegistered,
            Self::QueryNotFound(_) => ErrorCode::QueryNotFound,
            Self::Aggregation(_) | Self::Preprocess(_) | Self::Anonymize(_) => {
                ErrorCode::CannotProcessQuery
            }
            Self::QueryAlreadyPaid(_) => ErrorCode::QueryAlreadyPaid,
            Self::QueryNotReady(_) => ErrorCode::QueryNotReady,
            Self::QueryNotRetrievable(_) => ErrorCode::QueryNotRetrievable,
            Self::Storage(_) => ErrorCode::Undefined,
        }
    }

    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().as_u16(),
            message: self.to_string(),
        }
    }
}

/// `(code, message)` pair as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: u16,
    pub message: String,
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_errors_map_to_codes() {
        let err: CoreError = QueryError::UnknownDataSource("Weather".to_string()).into();
        assert_eq!(err.code().as_u16(), 8);

        let err: CoreError = QueryError::Parse("trailing input".to_string()).into();
        assert_eq!(err.code(), ErrorCode::InvalidQuery);
        assert_eq!(err.to_report().code, 32);
    }

    #[test]
    fn test_storage_errors_are_undefined() {
        let err: CoreError = StorageError::Lock("poisoned".to_string()).into();
        let report = err.to_report();
        assert_eq!(report.code, 99);
        assert_eq!(report.message, "Storage error: Lock error: poisoned");
    }

    #[test]
    fn test_processing_failures_share_code() {
        let err: CoreError = AnonymizeError::NotNumeric("PersonalInformation.city".into()).into();
        assert_eq!(err.code().as_u16(), 24);
        let err: CoreError = PreprocessError::InvalidGranularity(0).into();
        assert_eq!(err.code().as_u16(), 24);
        assert_eq!(
            CoreError::QueryNotReady(QueryKey::new(1, 2)).to_report(),
            ErrorReport {
                code: 26,
                message: "Query not ready: 1/2".to_string()
            }
        );
    }
}

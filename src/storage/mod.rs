//! Repository Layer
//!
//! Persistent state the core reads and writes:
//!
//! - **types**: Record types (QueryRecord, QueryUser, PrivacySetting, ...)
//! - **repository**: The `Repository` collaborator trait
//! - **sqlite**: `SqliteRepository`, the rusqlite-backed implementation
//! - **error**: Error types
//!
//! # Tables
//!
//! ```text
//! available_data_sources   registry source → numeric id
//! registered_data_sources  user registrations per source
//! privacy_settings         live tier + explicit consent per attribute
//! upload_granularities     append-only upload interval history
//! queries / query_users    aggregate queries and their consent rows
//! pin_queries / pin_query_users
//! <source table>           raw samples keyed by (user_id, timestamp)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use privagg::storage::{Repository, SqliteRepository, QueryState};
//! use std::path::Path;
//!
//! let repo = SqliteRepository::open(Path::new("./data/privagg.db"))?;
//! repo.install_data_sources()?;
//! let due = repo.due_queries(chrono::Utc::now().timestamp_millis())?;
//! assert!(due.iter().all(|q| q.state == QueryState::Pending));
//! # Ok::<(), privagg::storage::StorageError>(())
//! ```

pub mod error;
pub mod repository;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use repository::Repository;
pub use sqlite::SqliteRepository;
pub use types::{
    ConsentState, DataSourceId, ParseStateError, PinQueryRecord, PrivacySetting, ProcessorId,
    QueryId, QueryKey, QueryRecord, QueryState, QueryUser, Sample, Tier, UploadGranularityRecord,
    UserId,
};

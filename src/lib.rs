//! # privagg
//!
//! Privacy-preserving aggregate queries over personal time-series data.
//!
//! Data processors pose SQL-like queries over attributes that users upload.
//! Selected users consent per query; once the consent window closes the
//! accepted users' series are aligned onto one time grid, partitioned by
//! privacy tier and aggregated so that individual contributions stay hidden.
//!
//! ## Modules
//!
//! - [`query`]: query language parser and WHERE-clause lowering
//! - [`sources`]: closed registry of data sources and attribute columns
//! - [`storage`]: repository trait and its SQLite implementation
//! - [`selection`]: eligible-user selection and raw series fetching
//! - [`preprocess`]: time and length unification, tier partitioning
//! - [`anonymize`]: k-anonymity, Gaussian noise, differential privacy
//! - [`lifecycle`]: registration, consent, sweep, processing, retrieval
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use privagg::{Config, NewQuery, QueryLifecycleManager, SqliteRepository};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     let repo = SqliteRepository::open(Path::new(&config.storage.database_path))?;
//!     repo.install_data_sources()?;
//!
//!     let manager = QueryLifecycleManager::new(Arc::new(repo), Arc::new(config));
//!     let query = manager.register_query(NewQuery {
//!         processor_id: 1,
//!         query_id: None,
//!         query: "SELECT AVG(RandomData.random_one)".to_string(),
//!         price: 10.0,
//!         amount: 5,
//!         interval_start: 0,
//!         interval_finish: 3_600_000,
//!         consent_start: 0,
//!         consent_finish: 60_000,
//!         granularity: Some(60_000),
//!         max_privacy: 3,
//!         title: "Hourly average".to_string(),
//!         description: String::new(),
//!         goal_description: String::new(),
//!         thumbnail_url: String::new(),
//!     })?;
//!
//!     let report = manager.sweep(privagg::now_millis()).await?;
//!     println!("{}: {} completed", query.key(), report.completed);
//!     Ok(())
//! }
//! ```

pub mod anonymize;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod preprocess;
pub mod query;
pub mod selection;
pub mod sources;
pub mod storage;

pub use config::{AnonymizationMode, Config, ConfigError, LoggingConfig, PrivacyConfig};

pub use error::{CoreError, CoreResult, ErrorCode, ErrorReport};

pub use query::{compile, Bound, Constraint, Function, QueryError, QueryPlan};

pub use sources::{AttributeId, AttributeValue, DataSource, UserDataType};

pub use storage::{
    ConsentState, QueryKey, QueryRecord, QueryState, Repository, SqliteRepository, StorageError,
    Tier, UserId,
};

pub use preprocess::{preprocess, PreprocessError, Row};

pub use anonymize::{AnonymizeError, Anonymizer, NoiseSource, SeededNoise};

pub use lifecycle::{
    now_millis, NewPinQuery, NewQuery, PaymentGateway, PaymentOutcome, QueryLifecycleManager,
    SweepReport,
};

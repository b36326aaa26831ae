//! Repository Collaborator
//!
//! Filtered reads and writes the core performs against persistent state.
//! Every method is a short acquire/use/release cycle; multi-row writes are
//! committed atomically by the implementation.

use crate::sources::{AttributeId, AttributeValue, DataSource};
use crate::storage::error::StorageResult;
use crate::storage::types::*;
use std::collections::{BTreeMap, BTreeSet};

pub trait Repository: Send + Sync {
    // ---- data sources and live user settings ----

    /// Internal id of an installed data source
    fn data_source_id(&self, source: DataSource) -> StorageResult<Option<DataSourceId>>;

    /// Users who registered the source at or before `not_after`
    fn registered_users(
        &self,
        source_id: DataSourceId,
        not_after: i64,
    ) -> StorageResult<BTreeSet<UserId>>;

    /// All users' privacy settings for one attribute
    fn privacy_settings(
        &self,
        source_id: DataSourceId,
        attribute: &str,
    ) -> StorageResult<Vec<PrivacySetting>>;

    /// Granularity records of the given users up to `until`, oldest first
    fn granularity_history(
        &self,
        source_id: DataSourceId,
        users: &[UserId],
        until: i64,
    ) -> StorageResult<Vec<UploadGranularityRecord>>;

    /// Every stored value of an attribute, regardless of time
    fn attribute_values(
        &self,
        attr: &AttributeId,
        users: &[UserId],
    ) -> StorageResult<Vec<(UserId, AttributeValue)>>;

    /// Samples in `[start, finish)`, ordered by user then timestamp
    fn samples(
        &self,
        attr: &AttributeId,
        users: &[UserId],
        start: i64,
        finish: i64,
    ) -> StorageResult<Vec<(UserId, Sample)>>;

    /// Most recent value of an attribute per user
    fn latest_values(
        &self,
        attr: &AttributeId,
        users: &[UserId],
    ) -> StorageResult<BTreeMap<UserId, AttributeValue>>;

    // ---- queries ----

    /// Store a new query. Returns false if the key already exists.
    fn insert_query(&self, query: &QueryRecord) -> StorageResult<bool>;

    fn get_query(&self, key: QueryKey) -> StorageResult<Option<QueryRecord>>;

    /// Remove a query together with its query users
    fn delete_query(&self, key: QueryKey) -> StorageResult<()>;

    fn queries_by_processor(
        &self,
        processor_id: ProcessorId,
        state: Option<QueryState>,
    ) -> StorageResult<Vec<QueryRecord>>;

    /// Pending queries whose consent window closed at or before `now`
    fn due_queries(&self, now: i64) -> StorageResult<Vec<QueryRecord>>;

    /// Compare-and-set of the state. Returns false if the query was not in `from`.
    fn transition(&self, key: QueryKey, from: QueryState, to: QueryState)
        -> StorageResult<bool>;

    /// Store the result and final state in one write
    fn finalize(&self, key: QueryKey, state: QueryState, result: &str) -> StorageResult<()>;

    // ---- query users ----

    fn insert_query_users(&self, users: &[QueryUser]) -> StorageResult<()>;

    fn query_user(&self, user: UserId, key: QueryKey) -> StorageResult<Option<QueryUser>>;

    fn query_users(
        &self,
        key: QueryKey,
        consent: Option<ConsentState>,
    ) -> StorageResult<Vec<QueryUser>>;

    /// Returns false if the user is not part of the query
    fn set_consent(
        &self,
        user: UserId,
        key: QueryKey,
        consent: ConsentState,
    ) -> StorageResult<bool>;

    fn queries_by_user(
        &self,
        user: UserId,
        state: Option<QueryState>,
        consent: Option<ConsentState>,
    ) -> StorageResult<Vec<(QueryRecord, ConsentState)>>;

    // ---- pin queries ----

    /// Store a new pin query. Returns false if the key already exists.
    fn insert_pin_query(&self, query: &PinQueryRecord) -> StorageResult<bool>;

    fn pin_query(&self, key: QueryKey) -> StorageResult<Option<PinQueryRecord>>;

    /// Pin query holding a PIN. A pending query wins, then the latest
    /// consent deadline.
    fn pin_query_by_pin(&self, pin: u32) -> StorageResult<Option<PinQueryRecord>>;

    fn due_pin_queries(&self, now: i64) -> StorageResult<Vec<PinQueryRecord>>;

    fn transition_pin(
        &self,
        key: QueryKey,
        from: QueryState,
        to: QueryState,
    ) -> StorageResult<bool>;

    fn finalize_pin(&self, key: QueryKey, state: QueryState, result: &str) -> StorageResult<()>;

    /// Insert or update a user's answer to a pin query
    fn upsert_pin_consent(
        &self,
        user: UserId,
        key: QueryKey,
        consent: ConsentState,
    ) -> StorageResult<()>;

    fn pin_query_user(&self, user: UserId, key: QueryKey) -> StorageResult<Option<QueryUser>>;

    fn pin_query_users(
        &self,
        key: QueryKey,
        consent: Option<ConsentState>,
    ) -> StorageResult<Vec<QueryUser>>;
}

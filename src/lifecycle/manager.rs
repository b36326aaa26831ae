//! Query Lifecycle Manager
//!
//! Owns the state machine of aggregate queries:
//!
//! ```text
//! Pending ──(consent window closed)──→ Processing ─┬→ Completed ──(payment)──→ Paid
//!                                                  └→ Aborted
//! ```
//!
//! Registration prepares the query by snapshotting each selected user's
//! settings. The sweep activates due queries and processes each one on the
//! blocking pool; failures stay local to their query.

use crate::anonymize::{Anonymizer, NoiseSource, SeededNoise};
use crate::config::Config;
use crate::error::{CoreError, CoreResult, ErrorCode, ErrorReport};
use crate::lifecycle::payment::{gateway_for, PaymentGateway, PaymentOutcome};
use crate::preprocess::preprocess;
use crate::query::{compile, Function, QueryPlan};
use crate::selection::{AttributeSetting, Selection, SelectionRequest, SeriesFetcher, UserSelector};
use crate::storage::{
    ConsentState, ProcessorId, QueryId, QueryKey, QueryRecord, QueryState, QueryUser, Repository,
    StorageError, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;

pub(crate) const NOT_ENOUGH_USERS: &str = "Query failed because not enough users consented";
pub(crate) const PROCESSING_FAILED: &str = "Exception during query processing";
const NOT_PAID: &str = "query not paid";

/// Parameters of a query to register
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewQuery {
    pub processor_id: ProcessorId,
    /// Generated when absent
    #[serde(default)]
    pub query_id: Option<QueryId>,
    pub query: String,
    #[serde(default)]
    pub price: f64,
    pub amount: u32,
    pub interval_start: i64,
    pub interval_finish: i64,
    pub consent_start: i64,
    pub consent_finish: i64,
    #[serde(default)]
    pub granularity: Option<i64>,
    #[serde(default = "default_max_privacy")]
    pub max_privacy: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub goal_description: String,
    #[serde(default)]
    pub thumbnail_url: String,
}

fn default_max_privacy() -> i64 {
    3
}

/// A query as shown to one of its users
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserQueryView {
    #[serde(flatten)]
    pub query: QueryRecord,
    pub consent: ConsentState,
}

#[derive(Debug, Clone, Copy)]
enum Activated {
    Query,
    Pin,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    pub completed: usize,
    pub aborted: usize,
    pub errors: Vec<ErrorReport>,
}

/// 12-digit query id derived from a random UUID
pub fn generate_query_id() -> QueryId {
    let random = uuid::Uuid::new_v4().as_u128();
    (random % 900_000_000_000 + 100_000_000_000) as QueryId
}

/// Current time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct QueryLifecycleManager {
    pub(super) repo: Arc<dyn Repository>,
    pub(super) config: Arc<Config>,
    noise: Arc<dyn NoiseSource>,
    payment: Arc<dyn PaymentGateway>,
    permits: Arc<Semaphore>,
    running: Arc<RwLock<bool>>,
}

impl QueryLifecycleManager {
    /// Manager with entropy-seeded noise and the configured payment method
    pub fn new(repo: Arc<dyn Repository>, config: Arc<Config>) -> Self {
        let payment = gateway_for(config.payment.method);
        let permits = Arc::new(Semaphore::new(config.lifecycle.max_concurrent_queries.max(1)));
        Self {
            repo,
            config,
            noise: Arc::new(SeededNoise::new()),
            payment,
            permits,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn with_noise(mut self, noise: Arc<dyn NoiseSource>) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_payment(mut self, payment: Arc<dyn PaymentGateway>) -> Self {
        self.payment = payment;
        self
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ---- registration ----

    /// Compile query text and make sure every source it names is installed
    pub fn check_query(&self, text: &str) -> CoreResult<QueryPlan> {
        let plan = compile(text)?;
        for source in plan.all_sources() {
            if self.repo.data_source_id(source)?.is_none() {
                return Err(CoreError::DataSourceNotRegistered(source));
            }
        }
        Ok(plan)
    }

    /// Validate, store and prepare a new query
    pub fn register_query(&self, new: NewQuery) -> CoreResult<QueryRecord> {
        let plan = self.check_query(&new.query)?;
        validate(&new, &plan)?;

        let query_id = new.query_id.unwrap_or_else(generate_query_id);
        let record = QueryRecord {
            processor_id: new.processor_id,
            query_id,
            query: new.query,
            price: new.price,
            amount: new.amount,
            interval_start: new.interval_start,
            interval_finish: new.interval_finish,
            consent_start: new.consent_start,
            consent_finish: new.consent_finish,
            granularity: new.granularity,
            max_privacy: new.max_privacy,
            state: QueryState::Pending,
            result: None,
            title: new.title,
            description: new.description,
            goal_description: new.goal_description,
            thumbnail_url: new.thumbnail_url,
            used_data_types: plan.data_types.iter().copied().collect(),
        };

        let key = record.key();
        if !self.repo.insert_query(&record)? {
            return Err(CoreError::ExistingQuery(key));
        }

        match self.prepare(&record, &plan) {
            Ok(selected) => {
                tracing::info!(
                    processor_id = key.processor_id,
                    query_id = key.query_id,
                    selected,
                    "Query registered"
                );
                Ok(record)
            }
            Err(e) => {
                self.repo.delete_query(key)?;
                Err(e)
            }
        }
    }

    /// Select the users of a stored query and write their snapshots
    fn prepare(&self, query: &QueryRecord, plan: &QueryPlan) -> CoreResult<usize> {
        let request = SelectionRequest {
            attributes: &plan.attributes,
            constraints: &[],
            interval_start: query.interval_start,
            interval_finish: query.interval_finish,
            granularity: query.granularity,
            max_privacy: query.max_privacy,
        };
        let selection = UserSelector::new(self.repo.as_ref()).select_any(&request, &plan.branches)?;

        let key = query.key();
        let users = selection
            .into_iter()
            .map(|(user_id, settings)| -> CoreResult<QueryUser> {
                let consent = if settings.iter().any(|s| s.explicit_consent) {
                    ConsentState::Pending
                } else {
                    ConsentState::Accepted
                };
                let settings = serde_json::to_string(&settings).map_err(StorageError::from)?;
                Ok(QueryUser {
                    user_id,
                    key,
                    consent,
                    settings,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;

        self.repo.insert_query_users(&users)?;
        Ok(users.len())
    }

    // ---- consent ----

    /// Record a user's answer while the query is still pending
    pub fn set_consent(&self, user: UserId, key: QueryKey, accept: bool) -> CoreResult<ConsentState> {
        let query = self.query(key)?;
        if self.repo.query_user(user, key)?.is_none() {
            return Err(CoreError::QueryNotFound(format!("{} for user {}", key, user)));
        }
        if query.state != QueryState::Pending {
            return Err(CoreError::QueryNotRetrievable(key));
        }

        let consent = ConsentState::from_answer(accept);
        self.repo.set_consent(user, key, consent)?;
        tracing::debug!(
            user_id = %user,
            processor_id = key.processor_id,
            query_id = key.query_id,
            consent = consent.as_str(),
            "Consent updated"
        );
        Ok(consent)
    }

    // ---- sweep ----

    /// Activate every due query and pin query and process them concurrently.
    ///
    /// A failure stays with its query: it is aborted where possible and
    /// reported, and the sweep moves on. Every spawned task is awaited.
    pub async fn sweep(&self, now: i64) -> CoreResult<SweepReport> {
        let queries = self.repo.due_queries(now)?;
        let pins = self.repo.due_pin_queries(now)?;

        let mut report = SweepReport::default();
        let mut tasks: Vec<(Activated, QueryKey, JoinHandle<CoreResult<QueryState>>)> =
            Vec::new();

        for query in queries {
            let key = query.key();
            if !self.activate(Activated::Query, key, &mut report) {
                continue;
            }
            let permit = match self.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    self.fail(Activated::Query, key, &e, &mut report);
                    continue;
                }
            };
            let manager = self.clone();
            tasks.push((
                Activated::Query,
                key,
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    manager.process_query(&query)
                }),
            ));
        }

        for pin in pins {
            let key = pin.key();
            if !self.activate(Activated::Pin, key, &mut report) {
                continue;
            }
            let permit = match self.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    self.fail(Activated::Pin, key, &e, &mut report);
                    continue;
                }
            };
            let manager = self.clone();
            tasks.push((
                Activated::Pin,
                key,
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    manager.process_pin_query(&pin)
                }),
            ));
        }

        for (kind, key, task) in tasks {
            report.processed += 1;
            match task.await {
                Ok(Ok(QueryState::Completed)) => report.completed += 1,
                Ok(Ok(_)) => report.aborted += 1,
                Ok(Err(_)) => {
                    report.aborted += 1;
                    report.errors.push(processing_error(key));
                }
                Err(e) => {
                    tracing::error!(
                        processor_id = key.processor_id,
                        query_id = key.query_id,
                        error = %e,
                        "Query task failed"
                    );
                    if let Err(e) = self.finish_aborted(kind, key) {
                        self.report_failure(key, &e);
                    }
                    report.aborted += 1;
                    report.errors.push(processing_error(key));
                }
            }
        }

        if report.processed > 0 || !report.errors.is_empty() {
            tracing::info!(
                processed = report.processed,
                completed = report.completed,
                aborted = report.aborted,
                errors = report.errors.len(),
                "Sweep finished"
            );
        }
        Ok(report)
    }

    /// Move a due query to Processing. False if it was not activated; a
    /// repository failure is reported and leaves the query for the next sweep.
    fn activate(&self, kind: Activated, key: QueryKey, report: &mut SweepReport) -> bool {
        let moved = match kind {
            Activated::Query => self
                .repo
                .transition(key, QueryState::Pending, QueryState::Processing),
            Activated::Pin => self
                .repo
                .transition_pin(key, QueryState::Pending, QueryState::Processing),
        };
        match moved {
            Ok(true) => {
                tracing::info!(
                    processor_id = key.processor_id,
                    query_id = key.query_id,
                    state = QueryState::Processing.as_str(),
                    "Query activated"
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.report_failure(key, &CoreError::from(e));
                report.errors.push(processing_error(key));
                false
            }
        }
    }

    /// Abort an activated query that never reached its processing task
    fn fail(&self, kind: Activated, key: QueryKey, error: &CoreError, report: &mut SweepReport) {
        self.report_failure(key, error);
        if let Err(e) = self.finish_aborted(kind, key) {
            self.report_failure(key, &e);
        }
        report.processed += 1;
        report.aborted += 1;
        report.errors.push(processing_error(key));
    }

    fn finish_aborted(&self, kind: Activated, key: QueryKey) -> CoreResult<()> {
        match kind {
            Activated::Query => self.abort(key, PROCESSING_FAILED),
            Activated::Pin => {
                let result = json!({ "error": PROCESSING_FAILED }).to_string();
                self.repo.finalize_pin(key, QueryState::Aborted, &result)?;
                Ok(())
            }
        }
    }

    async fn acquire(&self) -> CoreResult<tokio::sync::OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| CoreError::Aggregation(e.to_string()))
    }

    /// Run an activated query to `Completed` or `Aborted`.
    ///
    /// Returns the final state, or the processing failure after the query
    /// has been aborted with a generic result.
    pub fn process_query(&self, query: &QueryRecord) -> CoreResult<QueryState> {
        let key = query.key();
        match self.aggregate(query) {
            Ok(Some(result)) => {
                self.repo
                    .finalize(key, QueryState::Completed, &result.to_string())?;
                tracing::info!(
                    processor_id = key.processor_id,
                    query_id = key.query_id,
                    state = QueryState::Completed.as_str(),
                    "Query processed"
                );
                Ok(QueryState::Completed)
            }
            Ok(None) => {
                self.abort(key, NOT_ENOUGH_USERS)?;
                tracing::info!(
                    processor_id = key.processor_id,
                    query_id = key.query_id,
                    state = QueryState::Aborted.as_str(),
                    "Not enough users consented"
                );
                Ok(QueryState::Aborted)
            }
            Err(e) => {
                self.report_failure(key, &e);
                self.abort(key, PROCESSING_FAILED)?;
                Err(e)
            }
        }
    }

    pub(super) fn abort(&self, key: QueryKey, message: &str) -> CoreResult<()> {
        let result = json!({ "error": message }).to_string();
        self.repo.finalize(key, QueryState::Aborted, &result)?;
        Ok(())
    }

    pub(super) fn report_failure(&self, key: QueryKey, error: &CoreError) {
        if self.config.lifecycle.diagnostic_mode {
            tracing::error!(
                processor_id = key.processor_id,
                query_id = key.query_id,
                error = ?error,
                "Query processing failed"
            );
        } else {
            tracing::warn!(
                processor_id = key.processor_id,
                query_id = key.query_id,
                "Query processing failed"
            );
        }
    }

    /// The result object, or None if too few users accepted
    fn aggregate(&self, query: &QueryRecord) -> CoreResult<Option<Value>> {
        let key = query.key();
        let accepted = self.repo.query_users(key, Some(ConsentState::Accepted))?;
        if accepted.len() < query.amount as usize {
            return Ok(None);
        }

        let plan = compile(&query.query)?;

        let mut selection = Selection::new();
        for user in &accepted {
            let settings: Vec<AttributeSetting> =
                serde_json::from_str(&user.settings).map_err(StorageError::from)?;
            selection.insert(user.user_id, settings);
        }

        let series = SeriesFetcher::new(self.repo.as_ref()).fetch(
            &selection,
            query.interval_start,
            query.interval_finish,
        )?;
        let mut partitioned = preprocess(
            series,
            query.interval_start,
            query.interval_finish,
            query.granularity,
            &self.config.preprocessing,
        )?;
        for attr in &plan.attributes {
            partitioned.entry(attr.clone()).or_default();
        }

        let anonymizer = Anonymizer::new(&self.config.privacy, self.noise.as_ref());
        let mut response = Map::new();
        response.insert("amount".to_string(), Value::from(accepted.len()));
        for (i, call) in plan.calls.iter().enumerate() {
            let payload = anonymizer.apply(call.function, &call.attrs, &partitioned)?;
            response.insert(format!("Fun{}", i), payload);
        }

        Ok(Some(json!({ "response": response })))
    }

    // ---- payment ----

    /// Hand a completed query to the payment gateway
    pub async fn settle_payment(&self, key: QueryKey) -> CoreResult<PaymentOutcome> {
        let query = self.query(key)?;
        match query.state {
            QueryState::Completed => {}
            QueryState::Paid => return Err(CoreError::QueryAlreadyPaid(key)),
            _ => return Err(CoreError::QueryNotReady(key)),
        }

        let participants: Vec<UserId> = self
            .repo
            .query_users(key, Some(ConsentState::Accepted))?
            .into_iter()
            .map(|u| u.user_id)
            .collect();

        let outcome = self.payment.settle(&query, &participants).await?;
        if outcome == PaymentOutcome::Paid
            && !self
                .repo
                .transition(key, QueryState::Completed, QueryState::Paid)?
        {
            return Err(CoreError::QueryAlreadyPaid(key));
        }

        tracing::info!(
            processor_id = key.processor_id,
            query_id = key.query_id,
            gateway = self.payment.name(),
            outcome = ?outcome,
            "Payment settled"
        );
        Ok(outcome)
    }

    // ---- retrieval ----

    fn query(&self, key: QueryKey) -> CoreResult<QueryRecord> {
        self.repo
            .get_query(key)?
            .ok_or_else(|| CoreError::QueryNotFound(key.to_string()))
    }

    /// Queries of a processor. Results stay hidden until paid or aborted.
    pub fn processor_queries(
        &self,
        processor_id: ProcessorId,
        state: Option<QueryState>,
    ) -> CoreResult<Vec<QueryRecord>> {
        Ok(self
            .repo
            .queries_by_processor(processor_id, state)?
            .into_iter()
            .map(mask_result)
            .collect())
    }

    pub fn retrieve_for_processor(&self, key: QueryKey) -> CoreResult<QueryRecord> {
        self.query(key).map(mask_result)
    }

    /// Queries a user was selected for, without results
    pub fn user_queries(
        &self,
        user: UserId,
        state: Option<QueryState>,
        consent: Option<ConsentState>,
    ) -> CoreResult<Vec<UserQueryView>> {
        Ok(self
            .repo
            .queries_by_user(user, state, consent)?
            .into_iter()
            .map(|(mut query, consent)| {
                query.result = None;
                UserQueryView { query, consent }
            })
            .collect())
    }

    pub fn retrieve_for_user(&self, user: UserId, key: QueryKey) -> CoreResult<UserQueryView> {
        let mut query = self.query(key)?;
        let member = self
            .repo
            .query_user(user, key)?
            .ok_or_else(|| CoreError::QueryNotFound(format!("{} for user {}", key, user)))?;
        query.result = None;
        Ok(UserQueryView {
            query,
            consent: member.consent,
        })
    }

    // ---- background loop ----

    /// Run the sweep on the configured interval until `stop` is called
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(async move {
            *manager.running.write().await = true;

            let secs = manager.config.lifecycle.sweep_interval_secs.max(1);
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));

            loop {
                interval.tick().await;

                if !*manager.running.read().await {
                    break;
                }

                if let Err(e) = manager.sweep(now_millis()).await {
                    tracing::error!("Sweep failed: {}", e);
                }
            }
        })
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }
}

fn validate(new: &NewQuery, plan: &QueryPlan) -> CoreResult<()> {
    if new.interval_start >= new.interval_finish {
        return Err(CoreError::InvalidQuery(format!(
            "interval start {} is not before finish {}",
            new.interval_start, new.interval_finish
        )));
    }
    if new.consent_start > new.consent_finish {
        return Err(CoreError::InvalidQuery(format!(
            "consent start {} is after finish {}",
            new.consent_start, new.consent_finish
        )));
    }
    if !(1..=3).contains(&new.max_privacy) {
        return Err(CoreError::InvalidQuery(format!(
            "max privacy {} out of range",
            new.max_privacy
        )));
    }
    if let Some(g) = new.granularity {
        if g <= 0 {
            return Err(CoreError::InvalidQuery(format!("granularity {}", g)));
        }
    }
    if let Some(f) = plan
        .functions()
        .find(|f| matches!(f, Function::Corr | Function::All))
    {
        return Err(CoreError::InvalidQuery(format!(
            "{} cannot be aggregated",
            f.as_str()
        )));
    }
    Ok(())
}

fn mask_result(mut query: QueryRecord) -> QueryRecord {
    if !matches!(query.state, QueryState::Paid | QueryState::Aborted) {
        query.result = Some(NOT_PAID.to_string());
    }
    query
}

fn processing_error(key: QueryKey) -> ErrorReport {
    ErrorReport {
        code: ErrorCode::CannotProcessQuery.as_u16(),
        message: format!("Cannot process query {}", key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anonymize::{AnonymizeResult, SeededNoise};
    use crate::config::{AnonymizationMode, TierParams};
    use crate::lifecycle::fixtures::{new_query, seeded_repo};
    use crate::sources::DataSource;
    use crate::storage::{PrivacySetting, SqliteRepository, UploadGranularityRecord};

    fn manager(repo: Arc<SqliteRepository>) -> QueryLifecycleManager {
        let mut config = Config::default();
        for params in [
            &mut config.privacy.tier1,
            &mut config.privacy.tier2,
            &mut config.privacy.tier3,
        ] {
            *params = TierParams {
                epsilon: 1e9,
                ..*params
            };
        }
        QueryLifecycleManager::new(repo, Arc::new(config))
            .with_noise(Arc::new(SeededNoise::with_seed(17)))
    }

    fn manager_in(repo: Arc<SqliteRepository>, mode: AnonymizationMode) -> QueryLifecycleManager {
        let mut config = Config::default();
        config.privacy.mode = mode;
        config.privacy.tier1.k_anonymity = 2;
        QueryLifecycleManager::new(repo, Arc::new(config))
            .with_noise(Arc::new(SeededNoise::with_seed(17)))
    }

    struct PanickingNoise;

    impl NoiseSource for PanickingNoise {
        fn laplace(&self, _scale: f64) -> AnonymizeResult<f64> {
            panic!("noise source failed");
        }

        fn gaussian(&self, _std_dev: f64) -> AnonymizeResult<f64> {
            panic!("noise source failed");
        }
    }

    fn completed_result(repo: &SqliteRepository, key: QueryKey) -> Value {
        let stored = repo.get_query(key).unwrap().unwrap();
        assert_eq!(stored.state, QueryState::Completed);
        serde_json::from_str(stored.result.as_deref().unwrap()).unwrap()
    }

    #[test]
    fn test_generated_ids_have_twelve_digits() {
        for _ in 0..100 {
            let id = generate_query_id();
            assert_eq!(id.to_string().len(), 12);
        }
    }

    #[test]
    fn test_check_query() {
        let m = manager(seeded_repo(&[]));
        let plan = m.check_query("SELECT AVG(RandomData.random_one)").unwrap();
        assert_eq!(plan.calls.len(), 1);

        let err = m.check_query("SELECT AVG(Weather.rain)").unwrap_err();
        assert_eq!(err.code(), ErrorCode::DataSourceUnknown);
        let err = m.check_query("SELECT AVG(RandomData.random_one").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidQuery);
    }

    #[test]
    fn test_check_query_uninstalled_source() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let m = manager(repo);
        let err = m.check_query("SELECT AVG(RandomData.random_one)").unwrap_err();
        assert_eq!(err.code(), ErrorCode::DataSourceNotRegistered);
    }

    #[test]
    fn test_register_prepares_users() {
        let repo = seeded_repo(&[1, 2, 3]);
        let m = manager(repo.clone());
        let record = m
            .register_query(new_query(7, 3, "SELECT AVG(RandomData.random_one)"))
            .unwrap();
        assert_eq!(record.state, QueryState::Pending);
        assert_eq!(record.query_id.to_string().len(), 12);

        let users = repo.query_users(record.key(), None).unwrap();
        assert_eq!(users.len(), 3);
        // even user ids ask for explicit consent
        let pending: Vec<i64> = users
            .iter()
            .filter(|u| u.consent == ConsentState::Pending)
            .map(|u| u.user_id.0)
            .collect();
        assert_eq!(pending, vec![2]);

        let settings: Vec<AttributeSetting> = serde_json::from_str(&users[0].settings).unwrap();
        assert_eq!(settings[0].finest, 60_000);
    }

    #[test]
    fn test_register_rejections() {
        let repo = seeded_repo(&[1]);
        let m = manager(repo.clone());

        let mut duplicate = new_query(7, 1, "SELECT AVG(RandomData.random_one)");
        duplicate.query_id = Some(5);
        m.register_query(duplicate.clone()).unwrap();
        let err = m.register_query(duplicate).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExistingQuery);

        let mut bad_interval = new_query(7, 1, "SELECT AVG(RandomData.random_one)");
        bad_interval.interval_finish = bad_interval.interval_start;
        assert_eq!(
            m.register_query(bad_interval).unwrap_err().code(),
            ErrorCode::InvalidQuery
        );

        let corr = new_query(
            7,
            1,
            "SELECT CORR(RandomData.random_one, RandomData.random_two)",
        );
        assert_eq!(m.register_query(corr).unwrap_err().code(), ErrorCode::InvalidQuery);

        let mut privacy = new_query(7, 1, "SELECT AVG(RandomData.random_one)");
        privacy.max_privacy = 4;
        assert_eq!(m.register_query(privacy).unwrap_err().code(), ErrorCode::InvalidQuery);

        assert_eq!(m.processor_queries(7, None).unwrap().len(), 1);
    }

    #[test]
    fn test_unsupported_constraint_is_never_stored() {
        let repo = seeded_repo(&[1]);
        let m = manager(repo.clone());
        let mut query = new_query(
            7,
            1,
            "SELECT AVG(RandomData.random_one) WHERE PersonalInformation.city = \"aachen\" AND !(RandomData.random_two = 3)",
        );
        query.query_id = Some(11);
        assert_eq!(m.register_query(query).unwrap_err().code(), ErrorCode::InvalidQuery);
        assert!(repo.get_query(QueryKey::new(7, 11)).unwrap().is_none());
    }

    #[test]
    fn test_consent_only_while_pending() {
        let repo = seeded_repo(&[1, 2]);
        let m = manager(repo.clone());
        let record = m
            .register_query(new_query(7, 1, "SELECT AVG(RandomData.random_one)"))
            .unwrap();
        let key = record.key();

        assert_eq!(
            m.set_consent(UserId(2), key, true).unwrap(),
            ConsentState::Accepted
        );
        assert_eq!(
            m.set_consent(UserId(9), key, true).unwrap_err().code(),
            ErrorCode::QueryNotFound
        );

        repo.transition(key, QueryState::Pending, QueryState::Processing)
            .unwrap();
        assert_eq!(
            m.set_consent(UserId(1), key, false).unwrap_err().code(),
            ErrorCode::QueryNotRetrievable
        );
    }

    #[tokio::test]
    async fn test_amount_three_aborts_then_completes() {
        let repo = seeded_repo(&[1, 2, 3, 4]);
        let m = manager(repo.clone());

        // users 2 and 4 need explicit consent; user 4 refuses
        let first = m
            .register_query(new_query(7, 3, "SELECT AVG(RandomData.random_one), COUNT(RandomData.random_one)"))
            .unwrap();
        m.set_consent(UserId(4), first.key(), false).unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.aborted, 1);
        let stored = repo.get_query(first.key()).unwrap().unwrap();
        assert_eq!(stored.state, QueryState::Aborted);
        assert_eq!(
            stored.result.as_deref(),
            Some(json!({ "error": NOT_ENOUGH_USERS }).to_string().as_str())
        );

        // the same query with a third acceptance before the sweep
        let second = m
            .register_query(new_query(7, 3, "SELECT AVG(RandomData.random_one), COUNT(RandomData.random_one)"))
            .unwrap();
        m.set_consent(UserId(2), second.key(), true).unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(report.errors.is_empty());

        let stored = repo.get_query(second.key()).unwrap().unwrap();
        assert_eq!(stored.state, QueryState::Completed);
        let result: Value = serde_json::from_str(stored.result.as_deref().unwrap()).unwrap();
        assert_eq!(result["response"]["amount"], 3);
        assert_eq!(result["response"]["Fun1"], 3);
        assert_eq!(result["response"]["Fun0"]["participants"], 3);
        assert_eq!(result["response"]["Fun0"]["mean"].as_array().unwrap().len(), 10);

        // an aborted query is never swept again
        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn test_text_attribute_aborts_with_generic_result() {
        let repo = seeded_repo(&[1]);
        let source = repo.data_source_id(DataSource::PersonalInformation).unwrap().unwrap();
        repo.register_data_source(UserId(1), source, 0).unwrap();
        repo.set_privacy_setting(&PrivacySetting {
            user_id: UserId(1),
            data_source_id: source,
            attribute: "city".to_string(),
            level: 1,
            explicit_consent: false,
        })
        .unwrap();
        repo.record_granularity(&UploadGranularityRecord {
            user_id: UserId(1),
            data_source_id: source,
            timestamp: 0,
            interval: 60_000,
        })
        .unwrap();

        let m = manager(repo.clone());
        let record = m
            .register_query(new_query(7, 1, "SELECT AVG(PersonalInformation.city)"))
            .unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.aborted, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, 24);

        let stored = repo.get_query(record.key()).unwrap().unwrap();
        assert_eq!(stored.state, QueryState::Aborted);
        assert_eq!(
            stored.result.as_deref(),
            Some(json!({ "error": PROCESSING_FAILED }).to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_oversized_interval_aborts() {
        let repo = seeded_repo(&[1]);
        let m = manager(repo.clone());
        let mut query = new_query(7, 1, "SELECT AVG(RandomData.random_one)");
        query.interval_finish = i64::MAX;
        let record = m.register_query(query).unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.aborted, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, 24);

        let stored = repo.get_query(record.key()).unwrap().unwrap();
        assert_eq!(stored.state, QueryState::Aborted);
        assert_eq!(
            stored.result.as_deref(),
            Some(json!({ "error": PROCESSING_FAILED }).to_string().as_str())
        );

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn test_panicking_task_aborts_query() {
        let repo = seeded_repo(&[1]);
        let m = manager(repo.clone()).with_noise(Arc::new(PanickingNoise));
        let record = m
            .register_query(new_query(7, 1, "SELECT COUNT(RandomData.random_one)"))
            .unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.completed, 0);
        assert_eq!(report.aborted, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, 24);

        let stored = repo.get_query(record.key()).unwrap().unwrap();
        assert_eq!(stored.state, QueryState::Aborted);
        assert_eq!(
            stored.result.as_deref(),
            Some(json!({ "error": PROCESSING_FAILED }).to_string().as_str())
        );
        assert_eq!(m.sweep(now_millis()).await.unwrap().processed, 0);
    }

    #[tokio::test]
    async fn test_activation_failure_stays_with_its_query() {
        let repo = seeded_repo(&[1]);
        let m = manager(repo.clone());
        for id in [1, 2, 3] {
            let mut query = new_query(7, 1, "SELECT COUNT(RandomData.random_one)");
            query.query_id = Some(id);
            m.register_query(query).unwrap();
        }
        repo.execute_batch(
            "CREATE TRIGGER fail_activation BEFORE UPDATE OF state ON queries
             WHEN NEW.query_id = 2 AND NEW.state = 'processing'
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        )
        .unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.completed, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, 24);
        assert!(report.errors[0].message.ends_with("7/2"));

        let state = |id| repo.get_query(QueryKey::new(7, id)).unwrap().unwrap().state;
        assert_eq!(state(1), QueryState::Completed);
        assert_eq!(state(2), QueryState::Pending);
        assert_eq!(state(3), QueryState::Completed);

        repo.execute_batch("DROP TRIGGER fail_activation;").unwrap();
        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(state(2), QueryState::Completed);
    }

    #[tokio::test]
    async fn test_k_anonymity_mode_end_to_end() {
        let repo = seeded_repo(&[1, 3]);
        let m = manager_in(repo.clone(), AnonymizationMode::KAnonymity);
        let record = m
            .register_query(new_query(7, 2, "SELECT AVG(RandomData.random_one)"))
            .unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.completed, 1);

        // both users share one group, so every member reports the group mean
        let result = completed_result(&repo, record.key());
        let payload = &result["response"]["Fun0"];
        assert_eq!(payload["participants"], 2);
        let mean = payload["mean"].as_array().unwrap();
        assert_eq!(mean.len(), 10);
        for (i, value) in mean.iter().enumerate() {
            assert_eq!(value.as_f64().unwrap(), 2.0 + i as f64);
        }
        for sd in payload["stDev"].as_array().unwrap() {
            assert_eq!(sd.as_f64().unwrap(), 0.0);
        }
    }

    #[tokio::test]
    async fn test_gaussian_mode_end_to_end() {
        let repo = seeded_repo(&[1, 3]);
        let m = manager_in(repo.clone(), AnonymizationMode::GaussianNoise);
        let record = m
            .register_query(new_query(7, 2, "SELECT AVG(RandomData.random_one)"))
            .unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.completed, 1);

        // anchor 1.0 and tier 1 factor 0.01 keep the noise small
        let result = completed_result(&repo, record.key());
        let payload = &result["response"]["Fun0"];
        assert_eq!(payload["participants"], 2);
        let mean: Vec<f64> = payload["mean"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        assert_eq!(mean.len(), 10);
        let exact: Vec<f64> = (0..10).map(|i| 2.0 + i as f64).collect();
        assert_ne!(mean, exact);
        for (noised, exact) in mean.iter().zip(&exact) {
            assert!((noised - exact).abs() < 0.1);
        }
    }

    #[tokio::test]
    async fn test_differential_privacy_mode_end_to_end() {
        let repo = seeded_repo(&[1, 3]);
        let m = manager_in(repo.clone(), AnonymizationMode::DifferentialPrivacy);
        let record = m
            .register_query(new_query(7, 2, "SELECT AVG(RandomData.random_one)"))
            .unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.completed, 1);

        let result = completed_result(&repo, record.key());
        let payload = &result["response"]["Fun0"];
        assert_eq!(payload["participants"], 2);
        let mean = payload["mean"].as_array().unwrap();
        assert_eq!(mean.len(), 10);
        assert!(mean.iter().all(|v| v.as_f64().is_some()));
        for sd in payload["stDev"].as_array().unwrap() {
            assert!(sd.as_f64().unwrap() >= 0.0);
        }
    }

    #[tokio::test]
    async fn test_queries_in_consent_window_are_not_swept() {
        let repo = seeded_repo(&[1]);
        let m = manager(repo.clone());
        let mut query = new_query(7, 1, "SELECT COUNT(RandomData.random_one)");
        query.consent_finish = i64::MAX;
        let record = m.register_query(query).unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(
            repo.get_query(record.key()).unwrap().unwrap().state,
            QueryState::Pending
        );
    }

    #[tokio::test]
    async fn test_payment_and_retrieval() {
        let repo = seeded_repo(&[1]);
        let m = manager(repo.clone());
        let record = m
            .register_query(new_query(7, 1, "SELECT COUNT(RandomData.random_one)"))
            .unwrap();
        let key = record.key();

        assert_eq!(
            m.settle_payment(key).await.unwrap_err().code(),
            ErrorCode::QueryNotReady
        );
        assert_eq!(
            m.retrieve_for_processor(key).unwrap().result.as_deref(),
            Some(NOT_PAID)
        );

        m.sweep(now_millis()).await.unwrap();
        assert_eq!(
            m.retrieve_for_processor(key).unwrap().result.as_deref(),
            Some(NOT_PAID)
        );

        assert_eq!(m.settle_payment(key).await.unwrap(), PaymentOutcome::Paid);
        assert_eq!(
            m.settle_payment(key).await.unwrap_err().code(),
            ErrorCode::QueryAlreadyPaid
        );

        let paid = m.retrieve_for_processor(key).unwrap();
        assert_eq!(paid.state, QueryState::Paid);
        assert!(paid.result.unwrap().contains("\"amount\":1"));

        let view = m.retrieve_for_user(UserId(1), key).unwrap();
        assert_eq!(view.consent, ConsentState::Accepted);
        assert!(view.query.result.is_none());
        assert_eq!(m.user_queries(UserId(1), Some(QueryState::Paid), None).unwrap().len(), 1);
        assert_eq!(
            m.retrieve_for_user(UserId(5), key).unwrap_err().code(),
            ErrorCode::QueryNotFound
        );
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let repo = seeded_repo(&[1]);
        let m = Arc::new(manager(repo.clone()));
        let record = m
            .register_query(new_query(7, 1, "SELECT COUNT(RandomData.random_one)"))
            .unwrap();

        let handle = m.clone().start();
        // the first tick fires immediately
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        m.stop().await;
        handle.abort();

        assert_eq!(
            repo.get_query(record.key()).unwrap().unwrap().state,
            QueryState::Completed
        );
    }
}

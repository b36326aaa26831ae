//! Pin Queries
//!
//! A pin query skips user selection. Users join by entering a short PIN and
//! answering; once the consent window closes the latest stored value of
//! every selected attribute is collected from each accepting user.

use crate::error::{CoreError, CoreResult};
use crate::lifecycle::manager::{
    generate_query_id, QueryLifecycleManager, NOT_ENOUGH_USERS, PROCESSING_FAILED,
};
use crate::query::compile;
use crate::storage::{
    ConsentState, PinQueryRecord, ProcessorId, QueryId, QueryKey, QueryState, StorageError,
    UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

const PIN_MODULUS: u32 = 100_000;
const PIN_ATTEMPTS: usize = 16;

/// Parameters of a pin query to register
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewPinQuery {
    pub processor_id: ProcessorId,
    #[serde(default)]
    pub query_id: Option<QueryId>,
    pub session_id: i64,
    pub query: String,
    pub consent_start: i64,
    pub consent_finish: i64,
}

/// A pin query as shown to a user, with their answer if any
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinQueryView {
    #[serde(flatten)]
    pub query: PinQueryRecord,
    pub consent: Option<ConsentState>,
}

/// Five-digit PIN of a query key
pub fn derive_pin(processor_id: ProcessorId, query_id: QueryId) -> u32 {
    crc32fast::hash(format!("{}{}", processor_id, query_id).as_bytes()) % PIN_MODULUS
}

impl QueryLifecycleManager {
    pub fn register_pin_query(&self, new: NewPinQuery) -> CoreResult<PinQueryRecord> {
        self.check_query(&new.query)?;
        if new.consent_start > new.consent_finish {
            return Err(CoreError::InvalidQuery(format!(
                "consent start {} is after finish {}",
                new.consent_start, new.consent_finish
            )));
        }

        let (query_id, pin) = self.issue_pin(new.processor_id, new.query_id)?;
        let record = PinQueryRecord {
            processor_id: new.processor_id,
            query_id,
            query: new.query,
            pin,
            session_id: new.session_id,
            consent_start: new.consent_start,
            consent_finish: new.consent_finish,
            state: QueryState::Pending,
            result: None,
        };

        if !self.repo.insert_pin_query(&record)? {
            return Err(CoreError::ExistingQuery(record.key()));
        }
        tracing::info!(
            processor_id = record.processor_id,
            query_id = record.query_id,
            pin = record.pin,
            "Pin query registered"
        );
        Ok(record)
    }

    /// Query id and PIN for a new pin query. A PIN held by a pending query
    /// is never issued twice; generated ids are redrawn until one is free.
    fn issue_pin(
        &self,
        processor_id: ProcessorId,
        query_id: Option<QueryId>,
    ) -> CoreResult<(QueryId, u32)> {
        let attempts = if query_id.is_some() { 1 } else { PIN_ATTEMPTS };
        for _ in 0..attempts {
            let query_id = query_id.unwrap_or_else(generate_query_id);
            let pin = derive_pin(processor_id, query_id);
            match self.repo.pin_query_by_pin(pin)? {
                Some(held)
                    if held.state == QueryState::Pending
                        && held.key() != QueryKey::new(processor_id, query_id) =>
                {
                    tracing::debug!(pin, holder = %held.key(), "PIN in use");
                }
                _ => return Ok((query_id, pin)),
            }
        }
        Err(CoreError::InvalidQuery(format!(
            "no free PIN for processor {}",
            processor_id
        )))
    }

    fn pin_query_for(&self, pin: u32) -> CoreResult<PinQueryRecord> {
        self.repo
            .pin_query_by_pin(pin)?
            .ok_or_else(|| CoreError::QueryNotFound(format!("pin {}", pin)))
    }

    /// The pin query behind a PIN, without its result
    pub fn pin_query_info(&self, user: UserId, pin: u32) -> CoreResult<PinQueryView> {
        let mut query = self.pin_query_for(pin)?;
        let consent = self
            .repo
            .pin_query_user(user, query.key())?
            .map(|u| u.consent);
        query.result = None;
        Ok(PinQueryView { query, consent })
    }

    pub fn set_pin_consent(&self, user: UserId, pin: u32, accept: bool) -> CoreResult<ConsentState> {
        let query = self.pin_query_for(pin)?;
        if query.state != QueryState::Pending {
            return Err(CoreError::QueryNotRetrievable(query.key()));
        }

        let consent = ConsentState::from_answer(accept);
        self.repo.upsert_pin_consent(user, query.key(), consent)?;
        Ok(consent)
    }

    /// Collect the answers of an activated pin query
    pub fn process_pin_query(&self, query: &PinQueryRecord) -> CoreResult<QueryState> {
        let key = query.key();
        match self.collect_pin_values(key, &query.query) {
            Ok(Some(result)) => {
                self.repo
                    .finalize_pin(key, QueryState::Completed, &result.to_string())?;
                tracing::info!(
                    processor_id = key.processor_id,
                    query_id = key.query_id,
                    state = QueryState::Completed.as_str(),
                    "Pin query processed"
                );
                Ok(QueryState::Completed)
            }
            Ok(None) => {
                let result = json!({ "error": NOT_ENOUGH_USERS }).to_string();
                self.repo.finalize_pin(key, QueryState::Aborted, &result)?;
                Ok(QueryState::Aborted)
            }
            Err(e) => {
                self.report_failure(key, &e);
                let result = json!({ "error": PROCESSING_FAILED });
                self.repo
                    .finalize_pin(key, QueryState::Aborted, &result.to_string())?;
                Err(e)
            }
        }
    }

    fn collect_pin_values(&self, key: QueryKey, text: &str) -> CoreResult<Option<Value>> {
        let users: Vec<UserId> = self
            .repo
            .pin_query_users(key, Some(ConsentState::Accepted))?
            .into_iter()
            .map(|u| u.user_id)
            .collect();
        if users.is_empty() {
            return Ok(None);
        }

        let plan = compile(text)?;
        let mut values: Vec<Map<String, Value>> = vec![Map::new(); users.len()];
        for attr in &plan.attributes {
            let latest = self.repo.latest_values(attr, &users)?;
            for (i, user) in users.iter().enumerate() {
                let value = match latest.get(user) {
                    Some(v) => serde_json::to_value(v).map_err(StorageError::from)?,
                    None => Value::Null,
                };
                values[i].insert(attr.to_string(), value);
            }
        }

        let value = match values.len() {
            1 => Value::Object(values.remove(0)),
            _ => Value::Array(values.into_iter().map(Value::Object).collect()),
        };
        Ok(Some(json!({
            "response": { "value": value, "amount": users.len() }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorCode;
    use crate::lifecycle::fixtures::seeded_repo;
    use crate::lifecycle::manager::now_millis;
    use crate::storage::Repository;
    use std::sync::Arc;

    fn new_pin(query_id: i64) -> NewPinQuery {
        NewPinQuery {
            processor_id: 7,
            query_id: Some(query_id),
            session_id: 1,
            query: "SELECT ALL(RandomData.random_one, RandomData.random_two)".to_string(),
            consent_start: 0,
            consent_finish: 1_000,
        }
    }

    #[test]
    fn test_pin_derivation() {
        let pin = derive_pin(7, 42);
        assert!(pin < 100_000);
        assert_eq!(pin, crc32fast::hash(b"742") % 100_000);
        assert_eq!(derive_pin(7, 42), pin);
    }

    #[test]
    fn test_pin_consent() {
        let repo = seeded_repo(&[1]);
        let m = QueryLifecycleManager::new(repo.clone(), Arc::new(Config::default()));
        let record = m.register_pin_query(new_pin(42)).unwrap();
        assert_eq!(
            m.register_pin_query(new_pin(42)).unwrap_err().code(),
            ErrorCode::ExistingQuery
        );

        assert_eq!(m.pin_query_info(UserId(1), record.pin).unwrap().consent, None);
        m.set_pin_consent(UserId(1), record.pin, false).unwrap();
        m.set_pin_consent(UserId(1), record.pin, true).unwrap();
        assert_eq!(
            m.pin_query_info(UserId(1), record.pin).unwrap().consent,
            Some(ConsentState::Accepted)
        );

        let unknown = (record.pin + 1) % 100_000;
        assert_eq!(
            m.set_pin_consent(UserId(1), unknown, true).unwrap_err().code(),
            ErrorCode::QueryNotFound
        );
    }

    #[test]
    fn test_pin_collision_is_rejected() {
        // "712" and "7165" share a PIN
        assert_eq!(derive_pin(7, 12), derive_pin(7, 165));

        let repo = seeded_repo(&[1]);
        let m = QueryLifecycleManager::new(repo.clone(), Arc::new(Config::default()));
        let first = m.register_pin_query(new_pin(12)).unwrap();
        assert_eq!(
            m.register_pin_query(new_pin(165)).unwrap_err().code(),
            ErrorCode::InvalidQuery
        );
        assert_eq!(m.pin_query_info(UserId(1), first.pin).unwrap().query.query_id, 12);

        // once the holder is finished the PIN may be reused
        repo.transition_pin(first.key(), QueryState::Pending, QueryState::Processing)
            .unwrap();
        let second = m.register_pin_query(new_pin(165)).unwrap();
        assert_eq!(second.pin, first.pin);
        assert_eq!(m.pin_query_info(UserId(1), first.pin).unwrap().query.query_id, 165);

        let mut generated = new_pin(0);
        generated.query_id = None;
        let third = m.register_pin_query(generated).unwrap();
        assert_ne!(third.pin, second.pin);
    }

    #[tokio::test]
    async fn test_pin_query_collects_latest_values() {
        let repo = seeded_repo(&[1, 3]);
        let m = QueryLifecycleManager::new(repo.clone(), Arc::new(Config::default()));
        let record = m.register_pin_query(new_pin(42)).unwrap();
        m.set_pin_consent(UserId(3), record.pin, true).unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.completed, 1);

        let stored = repo.pin_query(record.key()).unwrap().unwrap();
        assert_eq!(stored.state, QueryState::Completed);
        let result: Value = serde_json::from_str(stored.result.as_deref().unwrap()).unwrap();
        assert_eq!(result["response"]["amount"], 1);
        // user 3 uploaded random_one = 3 + 9 last
        assert_eq!(result["response"]["value"]["RandomData.random_one"], 12.0);
        assert_eq!(result["response"]["value"]["RandomData.random_two"], 6.0);

        assert_eq!(
            m.set_pin_consent(UserId(1), record.pin, true).unwrap_err().code(),
            ErrorCode::QueryNotRetrievable
        );
    }

    #[tokio::test]
    async fn test_pin_query_without_answers_aborts() {
        let repo = seeded_repo(&[1]);
        let m = QueryLifecycleManager::new(repo.clone(), Arc::new(Config::default()));
        let record = m.register_pin_query(new_pin(43)).unwrap();

        let report = m.sweep(now_millis()).await.unwrap();
        assert_eq!(report.aborted, 1);
        assert_eq!(
            repo.pin_query(record.key()).unwrap().unwrap().state,
            QueryState::Aborted
        );
    }
}

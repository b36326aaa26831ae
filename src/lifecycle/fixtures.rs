//! Shared repository fixtures for lifecycle tests

use crate::lifecycle::manager::NewQuery;
use crate::sources::{AttributeValue, DataSource};
use crate::storage::{
    DataSourceId, PrivacySetting, SqliteRepository, UploadGranularityRecord, UserId,
};
use std::sync::Arc;

pub const RANDOM: DataSourceId = 2;

/// In-memory repository where every listed user uploads RandomData once a
/// minute for the first ten minutes. Even user ids require explicit consent.
pub fn seeded_repo(users: &[i64]) -> Arc<SqliteRepository> {
    let repo = SqliteRepository::open_in_memory().unwrap();
    repo.install_data_sources().unwrap();

    for &user in users {
        repo.register_data_source(UserId(user), RANDOM, 0).unwrap();
        for attribute in ["random_one", "random_two"] {
            repo.set_privacy_setting(&PrivacySetting {
                user_id: UserId(user),
                data_source_id: RANDOM,
                attribute: attribute.to_string(),
                level: 1,
                explicit_consent: user % 2 == 0,
            })
            .unwrap();
        }
        repo.record_granularity(&UploadGranularityRecord {
            user_id: UserId(user),
            data_source_id: RANDOM,
            timestamp: 0,
            interval: 60_000,
        })
        .unwrap();

        for i in 0..10 {
            repo.insert_sample(
                DataSource::RandomData,
                UserId(user),
                i * 60_000,
                &[
                    ("random_one", AttributeValue::Number((user + i) as f64)),
                    ("random_two", AttributeValue::Number((user * 2) as f64)),
                ],
            )
            .unwrap();
        }
    }
    Arc::new(repo)
}

/// Query over the first ten minutes whose consent window already closed
pub fn new_query(processor_id: i64, amount: u32, text: &str) -> NewQuery {
    NewQuery {
        processor_id,
        query_id: None,
        query: text.to_string(),
        price: 1.0,
        amount,
        interval_start: 0,
        interval_finish: 600_000,
        consent_start: 0,
        consent_finish: 1_000,
        granularity: None,
        max_privacy: 3,
        title: "Random data".to_string(),
        description: String::new(),
        goal_description: String::new(),
        thumbnail_url: String::new(),
    }
}

//! Series Fetching
//!
//! Reads the raw samples of selected users from the repository and pairs
//! them with the settings captured at selection time.

use crate::error::{CoreError, CoreResult};
use crate::preprocess::{round2, RawSeries};
use crate::selection::selector::{AttributeSetting, Selection};
use crate::sources::AttributeId;
use crate::storage::{Repository, UserId};
use std::collections::BTreeMap;

pub struct SeriesFetcher<'r> {
    repo: &'r dyn Repository,
}

impl<'r> SeriesFetcher<'r> {
    pub fn new(repo: &'r dyn Repository) -> Self {
        Self { repo }
    }

    /// Samples in `[start, finish)` per attribute, one series per selected
    /// user. Values are rounded to two decimals. A user without samples gets
    /// an empty series.
    pub fn fetch(
        &self,
        selection: &Selection,
        start: i64,
        finish: i64,
    ) -> CoreResult<BTreeMap<AttributeId, Vec<RawSeries>>> {
        let mut by_attr: BTreeMap<&AttributeId, Vec<(UserId, &AttributeSetting)>> =
            BTreeMap::new();
        for (user, settings) in selection {
            for setting in settings {
                by_attr.entry(&setting.attr).or_default().push((*user, setting));
            }
        }

        let mut fetched = BTreeMap::new();
        for (attr, members) in by_attr {
            if !attr.is_numeric() {
                return Err(CoreError::Aggregation(format!(
                    "attribute {} is not numeric",
                    attr
                )));
            }

            let users: Vec<UserId> = members.iter().map(|(u, _)| *u).collect();
            let mut samples: BTreeMap<UserId, Vec<(i64, f64)>> = BTreeMap::new();
            for (user, sample) in self.repo.samples(attr, &users, start, finish)? {
                if let Some(value) = sample.value.as_number() {
                    samples
                        .entry(user)
                        .or_default()
                        .push((sample.timestamp, round2(value)));
                }
            }

            let series = members
                .into_iter()
                .map(|(user, setting)| RawSeries {
                    user,
                    tier: setting.tier,
                    finest: setting.finest,
                    coarsest: setting.coarsest,
                    samples: samples.remove(&user).unwrap_or_default(),
                })
                .collect();

            tracing::debug!(attribute = %attr, users = users.len(), "Fetched series");
            fetched.insert(attr.clone(), series);
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{AttributeValue, DataSource};
    use crate::storage::{SqliteRepository, Tier};

    fn setting(attr: &AttributeId) -> AttributeSetting {
        AttributeSetting {
            attr: attr.clone(),
            tier: Tier::Two,
            finest: 60_000,
            coarsest: 60_000,
            explicit_consent: false,
        }
    }

    #[test]
    fn test_fetch_rounds_and_groups() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let attr = AttributeId::new(DataSource::RandomData, "random_two");
        for (user, ts, v) in [(1, 0, 1.234), (1, 60_000, 2.0), (2, 0, 9.999), (1, 999_999, 5.0)] {
            repo.insert_sample(
                DataSource::RandomData,
                UserId(user),
                ts,
                &[("random_two", AttributeValue::Number(v))],
            )
            .unwrap();
        }

        let mut selection = Selection::new();
        selection.insert(UserId(1), vec![setting(&attr)]);
        selection.insert(UserId(2), vec![setting(&attr)]);
        selection.insert(UserId(3), vec![setting(&attr)]);

        let fetched = SeriesFetcher::new(&repo)
            .fetch(&selection, 0, 120_000)
            .unwrap();
        let series = &fetched[&attr];
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].samples, vec![(0, 1.23), (60_000, 2.0)]);
        assert_eq!(series[1].samples, vec![(0, 10.0)]);
        assert!(series[2].samples.is_empty());
        assert_eq!(series[0].tier, Tier::Two);
    }

    #[test]
    fn test_text_attribute_rejected() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let attr = AttributeId::new(DataSource::PersonalInformation, "city");
        let mut selection = Selection::new();
        selection.insert(UserId(1), vec![setting(&attr)]);

        assert!(matches!(
            SeriesFetcher::new(&repo).fetch(&selection, 0, 10),
            Err(CoreError::Aggregation(_))
        ));
    }
}

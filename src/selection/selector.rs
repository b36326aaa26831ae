//! User Selection
//!
//! Computes which users may take part in a query and captures, per user and
//! attribute, the privacy tier and upload granularity bounds in force.

use crate::error::{CoreError, CoreResult};
use crate::query::{Branch, Constraint};
use crate::sources::{AttributeId, DataSource};
use crate::storage::{DataSourceId, Repository, Tier, UploadGranularityRecord, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Selection settings of one user for one attribute.
///
/// Serialized into the query-user snapshot so processing sees the settings
/// that were in force when the query was prepared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSetting {
    pub attr: AttributeId,
    pub tier: Tier,
    pub finest: i64,
    pub coarsest: i64,
    #[serde(default)]
    pub explicit_consent: bool,
}

/// Selected users and their per-attribute settings
pub type Selection = BTreeMap<UserId, Vec<AttributeSetting>>;

/// Inputs of one selection run
#[derive(Debug, Clone, Copy)]
pub struct SelectionRequest<'a> {
    /// Attributes whose values the query aggregates
    pub attributes: &'a [AttributeId],
    /// Conjunctive constraints of one WHERE branch
    pub constraints: &'a [Constraint],
    pub interval_start: i64,
    pub interval_finish: i64,
    /// Coarsest upload interval a user may have had
    pub granularity: Option<i64>,
    pub max_privacy: i64,
}

pub struct UserSelector<'r> {
    repo: &'r dyn Repository,
}

/// Finest and coarsest interval of the records active in the window: the
/// latest record at or before `start` and every later one.
fn active_bounds(records: &[&UploadGranularityRecord], start: i64) -> Option<(i64, i64)> {
    let first = records
        .iter()
        .rposition(|r| r.timestamp <= start)
        .unwrap_or(0);
    let active = records[first..].iter().filter(|r| r.interval > 0);

    active.fold(None, |bounds, r| match bounds {
        None => Some((r.interval, r.interval)),
        Some((fine, coarse)) => Some((fine.min(r.interval), coarse.max(r.interval))),
    })
}

impl<'r> UserSelector<'r> {
    pub fn new(repo: &'r dyn Repository) -> Self {
        Self { repo }
    }

    fn source_ids(
        &self,
        attributes: &[AttributeId],
    ) -> CoreResult<BTreeMap<DataSource, DataSourceId>> {
        let mut ids = BTreeMap::new();
        for attr in attributes {
            if ids.contains_key(&attr.source) {
                continue;
            }
            let id = self
                .repo
                .data_source_id(attr.source)?
                .ok_or(CoreError::DataSourceNotRegistered(attr.source))?;
            ids.insert(attr.source, id);
        }
        Ok(ids)
    }

    /// Select the users eligible under one conjunction of constraints
    pub fn select(&self, request: &SelectionRequest<'_>) -> CoreResult<Selection> {
        let mut attributes: Vec<AttributeId> = request.attributes.to_vec();
        attributes.sort();
        attributes.dedup();

        let source_ids = self.source_ids(&attributes)?;

        // registered every source no later than the interval start
        let mut candidates: Option<BTreeSet<UserId>> = None;
        for id in source_ids.values() {
            let users = self.repo.registered_users(*id, request.interval_start)?;
            candidates = Some(match candidates {
                None => users,
                Some(c) => c.intersection(&users).copied().collect(),
            });
        }
        let mut candidates = candidates.unwrap_or_default();

        // a tier within [1, max_privacy] for every attribute
        let mut tiers: BTreeMap<(UserId, AttributeId), (Tier, bool)> = BTreeMap::new();
        for attr in &attributes {
            let id = source_ids[&attr.source];
            let mut eligible = BTreeSet::new();
            for setting in self.repo.privacy_settings(id, &attr.attribute)? {
                if !candidates.contains(&setting.user_id) || setting.level > request.max_privacy {
                    continue;
                }
                let Ok(tier) = Tier::try_from(setting.level) else {
                    continue;
                };
                eligible.insert(setting.user_id);
                tiers.insert(
                    (setting.user_id, attr.clone()),
                    (tier, setting.explicit_consent),
                );
            }
            candidates.retain(|u| eligible.contains(u));
        }

        // granularity history within the window
        let mut granularity: BTreeMap<(UserId, DataSource), (i64, i64)> = BTreeMap::new();
        for (source, id) in &source_ids {
            let users: Vec<UserId> = candidates.iter().copied().collect();
            let history = self
                .repo
                .granularity_history(*id, &users, request.interval_finish)?;

            let mut per_user: BTreeMap<UserId, Vec<&UploadGranularityRecord>> = BTreeMap::new();
            for record in &history {
                per_user.entry(record.user_id).or_default().push(record);
            }

            let mut excluded = BTreeSet::new();
            for user in &users {
                let bounds = per_user
                    .get(user)
                    .and_then(|records| active_bounds(records, request.interval_start));
                match bounds {
                    Some((_, coarse)) if request.granularity.map_or(false, |c| coarse > c) => {
                        excluded.insert(*user);
                    }
                    Some(bounds) => {
                        granularity.insert((*user, *source), bounds);
                    }
                    None => {
                        excluded.insert(*user);
                    }
                }
            }
            candidates.retain(|u| !excluded.contains(u));
        }

        // constraints exclude users holding any violating value
        for constraint in request.constraints {
            if candidates.is_empty() {
                break;
            }
            let users: Vec<UserId> = candidates.iter().copied().collect();
            let violating: BTreeSet<UserId> = self
                .repo
                .attribute_values(&constraint.attr, &users)?
                .into_iter()
                .filter(|(_, value)| !constraint.bound.admits(value))
                .map(|(user, _)| user)
                .collect();
            candidates.retain(|u| !violating.contains(u));
        }

        let mut selection = Selection::new();
        for user in candidates {
            let mut settings = Vec::with_capacity(attributes.len());
            for attr in &attributes {
                let (Some((tier, explicit_consent)), Some((finest, coarsest))) = (
                    tiers.get(&(user, attr.clone())),
                    granularity.get(&(user, attr.source)),
                ) else {
                    continue;
                };
                settings.push(AttributeSetting {
                    attr: attr.clone(),
                    tier: *tier,
                    finest: *finest,
                    coarsest: *coarsest,
                    explicit_consent: *explicit_consent,
                });
            }
            selection.insert(user, settings);
        }

        tracing::debug!(selected = selection.len(), "User selection finished");
        Ok(selection)
    }

    /// Union of the selections of every WHERE branch. A user matched by
    /// several branches keeps the entry of the first one.
    pub fn select_any(
        &self,
        request: &SelectionRequest<'_>,
        branches: &[Branch],
    ) -> CoreResult<Selection> {
        let mut selection = Selection::new();
        for branch in branches {
            let branch_request = SelectionRequest {
                constraints: branch,
                ..*request
            };
            for (user, settings) in self.select(&branch_request)? {
                selection.entry(user).or_insert(settings);
            }
        }
        Ok(selection)
    }
}

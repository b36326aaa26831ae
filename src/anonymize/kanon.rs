//! k-Anonymity Grouping
//!
//! Members of each tier are packed into groups of `k(tier)` and every member
//! reports the elementwise mean of its group. Tiers are filled from the least
//! strict upwards:
//!
//! - a leftover smaller than `k` joins the last group of its tier
//! - a tier without any complete group hands its members on to the next tier
//! - tier 3 members that still fit no group make grouping impossible

use crate::anonymize::error::{AnonymizeError, AnonymizeResult};
use crate::config::PrivacyConfig;
use crate::preprocess::TieredRows;
use crate::storage::{Tier, UserId};

/// A group member, identified by the tier its row lives in
pub type Member = (Tier, UserId);

/// Groups per tier, indexed by `Tier::index`
pub type Groups = [Vec<Vec<Member>>; 3];

/// Form the groups. Returns None if the leftover of tier 3 has nowhere to go.
pub fn build_groups(tiered: &TieredRows, k: impl Fn(Tier) -> usize) -> Option<Groups> {
    let mut groups: Groups = Default::default();
    let mut carried: Vec<Member> = Vec::new();

    for (tier, rows) in tiered.iter() {
        let size = k(tier).max(1);
        let tier_groups = &mut groups[tier.index()];

        let mut current = std::mem::take(&mut carried);
        for user in rows.keys() {
            if current.len() >= size {
                tier_groups.push(std::mem::take(&mut current));
            }
            current.push((tier, *user));
        }
        if current.len() >= size {
            tier_groups.push(std::mem::take(&mut current));
        }

        if !current.is_empty() {
            match tier_groups.last_mut() {
                Some(last) => last.append(&mut current),
                None => carried = current,
            }
        }
    }

    if carried.is_empty() {
        Some(groups)
    } else {
        None
    }
}

/// Replace every member's values with its group's elementwise mean
pub fn k_anonymize(
    tiered: &TieredRows,
    config: &PrivacyConfig,
    label: &str,
) -> AnonymizeResult<TieredRows> {
    let groups = build_groups(tiered, |tier| config.tier(tier).k_anonymity)
        .ok_or_else(|| AnonymizeError::GroupingImpossible(label.to_string()))?;

    let mut anonymized = tiered.clone();
    for group in groups.iter().flatten() {
        let rows: Vec<&[Option<f64>]> = group
            .iter()
            .filter_map(|(tier, user)| tiered.tier(*tier).get(user))
            .map(|row| row.values())
            .collect();
        let len = rows.iter().map(|r| r.len()).max().unwrap_or(0);

        let mean: Vec<Option<f64>> = (0..len)
            .map(|i| {
                let present: Vec<f64> = rows.iter().filter_map(|r| r.get(i).copied().flatten()).collect();
                if present.is_empty() {
                    None
                } else {
                    Some(present.iter().sum::<f64>() / present.len() as f64)
                }
            })
            .collect();

        for (tier, user) in group {
            if let Some(row) = anonymized.tier_mut(*tier).remove(user) {
                let values = if row.len() == mean.len() {
                    mean.clone()
                } else {
                    row.values().to_vec()
                };
                anonymized
                    .tier_mut(*tier)
                    .insert(*user, row.with_values(values));
            }
        }
    }

    tracing::debug!(
        attribute = label,
        groups = groups.iter().map(|g| g.len()).sum::<usize>(),
        "k-anonymity applied"
    );
    Ok(anonymized)
}

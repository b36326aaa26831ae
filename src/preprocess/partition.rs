//! Privacy Partitioning
//!
//! Re-keys rows as `attribute → tier → user → row`. All three tiers are
//! always present, possibly empty.

use crate::preprocess::row::Row;
use crate::sources::AttributeId;
use crate::storage::{Tier, UserId};
use std::collections::BTreeMap;

pub type TierRows = BTreeMap<UserId, Row>;

/// Rows of one attribute split by privacy tier
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TieredRows {
    tiers: [TierRows; 3],
}

impl TieredRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, user: UserId, row: Row) {
        self.tiers[row.tier().index()].insert(user, row);
    }

    pub fn tier(&self, tier: Tier) -> &TierRows {
        &self.tiers[tier.index()]
    }

    pub fn tier_mut(&mut self, tier: Tier) -> &mut TierRows {
        &mut self.tiers[tier.index()]
    }

    /// Tiers in ascending order, empty ones included
    pub fn iter(&self) -> impl Iterator<Item = (Tier, &TierRows)> {
        Tier::ALL.into_iter().zip(self.tiers.iter())
    }

    pub fn participants(&self) -> usize {
        self.tiers.iter().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.participants() == 0
    }

    /// Grid length shared by the rows, 0 when there are none
    pub fn row_len(&self) -> usize {
        self.tiers
            .iter()
            .flat_map(|t| t.values())
            .map(|r| r.len())
            .max()
            .unwrap_or(0)
    }
}

/// Partitioned rows of every attribute
pub type Partitioned = BTreeMap<AttributeId, TieredRows>;

pub fn partition(rows: BTreeMap<AttributeId, BTreeMap<UserId, Row>>) -> Partitioned {
    rows.into_iter()
        .map(|(attr, users)| {
            let mut tiered = TieredRows::new();
            for (user, row) in users {
                tiered.insert(user, row);
            }
            (attr, tiered)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::DataSource;

    #[test]
    fn test_partition_keeps_empty_tiers() {
        let attr = AttributeId::new(DataSource::RandomData, "random_one");
        let mut users = BTreeMap::new();
        users.insert(
            UserId(1),
            Row::new(vec![Some(1.0)], 0, 60, Tier::One, 60, 60).unwrap(),
        );
        users.insert(
            UserId(2),
            Row::new(vec![Some(2.0)], 0, 60, Tier::Three, 60, 60).unwrap(),
        );
        users.insert(
            UserId(3),
            Row::new(vec![Some(3.0)], 0, 60, Tier::Three, 60, 60).unwrap(),
        );

        let mut rows = BTreeMap::new();
        rows.insert(attr.clone(), users);
        let partitioned = partition(rows);

        let tiered = &partitioned[&attr];
        assert_eq!(tiered.tier(Tier::One).len(), 1);
        assert!(tiered.tier(Tier::Two).is_empty());
        assert_eq!(tiered.tier(Tier::Three).len(), 2);
        assert_eq!(tiered.iter().count(), 3);
        assert_eq!(tiered.participants(), 3);
        assert_eq!(tiered.row_len(), 1);
    }
}

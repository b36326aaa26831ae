//! Preprocessing Pipeline
//!
//! Turns fetched raw series into aggregation-ready rows:
//!
//! - **row**: `Row`, a gridded series with explicit missing markers
//! - **time**: grid alignment, pre-aggregation, bounded interpolation
//! - **length**: one grid per attribute
//! - **partition**: rows keyed by privacy tier
//!
//! ```text
//! RawSeries → align → pre_aggregate → interpolate ─┬→ Row ──→ unify_length → partition
//!                                                  └→ Discarded(reason)
//! ```

mod error;
pub mod length;
pub mod partition;
pub mod row;
pub mod time;

pub use error::{PreprocessError, PreprocessResult};
pub use length::{target_granularity, unify_length};
pub use partition::{partition, Partitioned, TierRows, TieredRows};
pub use row::{round2, Row};
pub use time::{align, grid_len, interpolate, pre_aggregate, unify_row, DiscardReason, Unified};

use crate::config::PreprocessingConfig;
use crate::sources::AttributeId;
use crate::storage::{Tier, UserId};
use std::collections::BTreeMap;

/// Raw samples of one user for one attribute, with the selection settings
#[derive(Debug, Clone, PartialEq)]
pub struct RawSeries {
    pub user: UserId,
    pub tier: Tier,
    pub finest: i64,
    pub coarsest: i64,
    /// `(timestamp, value)` in ascending time order
    pub samples: Vec<(i64, f64)>,
}

/// Run time unification, length unification and partitioning for every
/// attribute. Discarded rows drop the user for that attribute only.
pub fn preprocess(
    series: BTreeMap<AttributeId, Vec<RawSeries>>,
    start: i64,
    finish: i64,
    ceiling: Option<i64>,
    config: &PreprocessingConfig,
) -> PreprocessResult<Partitioned> {
    let mut unified = BTreeMap::new();

    for (attr, rows) in series {
        let mut kept = BTreeMap::new();
        for raw in rows {
            match unify_row(
                &raw.samples,
                start,
                finish,
                raw.tier,
                raw.finest,
                raw.coarsest,
                config,
            )? {
                Unified::Row(row) => {
                    kept.insert(raw.user, row);
                }
                Unified::Discarded(reason) => {
                    tracing::debug!(
                        user_id = %raw.user,
                        attribute = %attr,
                        %reason,
                        "Row discarded"
                    );
                }
            }
        }

        let kept = unify_length(kept, start, finish, ceiling)?;
        unified.insert(attr, kept);
    }

    Ok(partition(unified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::DataSource;

    #[test]
    fn test_preprocess_end_to_end() {
        let attr = AttributeId::new(DataSource::RandomData, "random_one");
        let full: Vec<(i64, f64)> = (0..10).map(|i| (i * 60_000, i as f64)).collect();
        let sparse: Vec<(i64, f64)> = vec![(0, 1.0), (540_000, 2.0)];

        let mut series = BTreeMap::new();
        series.insert(
            attr.clone(),
            vec![
                RawSeries {
                    user: UserId(1),
                    tier: Tier::One,
                    finest: 60_000,
                    coarsest: 60_000,
                    samples: full,
                },
                RawSeries {
                    user: UserId(2),
                    tier: Tier::Two,
                    finest: 60_000,
                    coarsest: 60_000,
                    samples: sparse,
                },
            ],
        );

        let out = preprocess(series, 0, 600_000, None, &PreprocessingConfig::default()).unwrap();
        let tiered = &out[&attr];
        assert_eq!(tiered.tier(Tier::One).len(), 1);
        assert!(tiered.tier(Tier::Two).is_empty());
        assert_eq!(tiered.row_len(), 10);
    }
}

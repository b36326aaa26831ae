//! Length Unification
//!
//! Brings every row of one attribute onto the same grid so tiers can be
//! aggregated point by point.

use crate::preprocess::error::PreprocessResult;
use crate::preprocess::row::Row;
use crate::preprocess::time::{grid_len, pre_aggregate};
use crate::storage::UserId;
use std::collections::BTreeMap;

/// Requested ceiling if given, else the coarsest step among the rows
pub fn target_granularity<'a>(
    rows: impl IntoIterator<Item = &'a Row>,
    ceiling: Option<i64>,
) -> Option<i64> {
    ceiling.or_else(|| rows.into_iter().map(|r| r.step()).max())
}

/// Move a row onto a grid of `step` without inventing values.
/// Each value lands on the grid point at or before its timestamp.
fn pad(row: Row, start: i64, len: usize, step: i64) -> Row {
    let mut values = vec![None; len];
    for (i, value) in row.values().iter().enumerate() {
        let Some(value) = value else { continue };
        let offset = row.timestamp(i) - start;
        if offset < 0 {
            continue;
        }
        let slot = (offset / step) as usize;
        if let Some(target) = values.get_mut(slot) {
            if target.is_none() {
                *target = Some(*value);
            }
        }
    }
    row.regrid(values, step)
}

/// Unify the rows of one attribute to one granularity and length.
///
/// Rows shorter than the target grid are padded with missing markers, longer
/// rows are pre-aggregated. Afterwards all rows share the same timestamps.
pub fn unify_length(
    rows: BTreeMap<UserId, Row>,
    start: i64,
    finish: i64,
    ceiling: Option<i64>,
) -> PreprocessResult<BTreeMap<UserId, Row>> {
    let Some(target) = target_granularity(rows.values(), ceiling) else {
        return Ok(rows);
    };
    let target_len = grid_len(start, finish, target)?;

    let mut unified = BTreeMap::new();
    for (user, row) in rows {
        let row = if row.len() > target_len {
            pre_aggregate(row, target)?
        } else if row.len() < target_len || row.step() != target {
            pad(row, start, target_len, target)
        } else {
            row
        };

        tracing::trace!(user_id = %user, len = row.len(), step = row.step(), "Row unified");
        unified.insert(user, row);
    }
    Ok(unified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::PreprocessError;
    use crate::storage::Tier;

    fn row(values: Vec<Option<f64>>, step: i64) -> Row {
        Row::new(values, 0, step, Tier::One, step, step).unwrap()
    }

    #[test]
    fn test_target_granularity() {
        let rows = [row(vec![Some(1.0)], 60), row(vec![Some(1.0)], 120)];
        assert_eq!(target_granularity(rows.iter(), None), Some(120));
        assert_eq!(target_granularity(rows.iter(), Some(300)), Some(300));
        assert_eq!(target_granularity(std::iter::empty(), None), None);
    }

    #[test]
    fn test_longer_rows_are_aggregated() {
        let mut rows = BTreeMap::new();
        rows.insert(
            UserId(1),
            row((1..=7).map(|v| Some(v as f64)).collect(), 43_200_000),
        );
        rows.insert(
            UserId(2),
            row(vec![Some(5.0), Some(4.0), Some(3.0), Some(2.0)], 86_400_000),
        );

        let out = unify_length(rows, 0, 4 * 86_400_000, None).unwrap();
        assert_eq!(
            out[&UserId(1)].values(),
            &[Some(1.5), Some(3.5), Some(5.5), Some(7.0)]
        );
        assert_eq!(out[&UserId(1)].timestamps(), out[&UserId(2)].timestamps());
        assert_eq!(out[&UserId(2)].values(), &[Some(5.0), Some(4.0), Some(3.0), Some(2.0)]);
    }

    #[test]
    fn test_shorter_rows_are_padded() {
        let mut rows = BTreeMap::new();
        rows.insert(UserId(1), row(vec![Some(1.0), Some(2.0)], 120));

        let out = unify_length(rows, 0, 240, Some(60)).unwrap();
        let r = &out[&UserId(1)];
        assert_eq!(r.values(), &[Some(1.0), None, Some(2.0), None]);
        assert_eq!(r.step(), 60);
        assert_eq!(r.timestamps(), vec![0, 60, 120, 180]);
    }

    #[test]
    fn test_uneven_target_fails() {
        let mut rows = BTreeMap::new();
        rows.insert(UserId(1), row(vec![Some(1.0); 6], 60));
        assert!(matches!(
            unify_length(rows, 0, 360, Some(90)),
            Err(PreprocessError::UnevenGranularity { .. })
        ));
    }
}

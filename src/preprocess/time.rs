//! Time Unification
//!
//! Per user and attribute: place raw samples on a grid anchored at the
//! interval start, pre-aggregate when the user's upload cadence varied, and
//! interpolate short gaps. Rows with too much missing data are discarded.

use crate::config::PreprocessingConfig;
use crate::preprocess::error::{PreprocessError, PreprocessResult};
use crate::preprocess::row::{round2, Row};
use crate::storage::Tier;
use std::fmt;

/// Why a row was dropped
#[derive(Debug, Clone, PartialEq)]
pub enum DiscardReason {
    /// Missing fraction above the interpolation limit
    TooManyMissing { missing: usize, len: usize },
    /// A gap longer than the maximum interpolation span
    GapTooLong { run: usize, allowed: f64 },
    /// No sample at all in the interval
    NoValues,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyMissing { missing, len } => {
                write!(f, "{} of {} points missing", missing, len)
            }
            Self::GapTooLong { run, allowed } => {
                write!(f, "gap of {} points exceeds {}", run, allowed)
            }
            Self::NoValues => f.write_str("no values"),
        }
    }
}

/// Outcome of unifying one row
#[derive(Debug, Clone, PartialEq)]
pub enum Unified {
    Row(Row),
    Discarded(DiscardReason),
}

/// Upper limit on points per row
pub const MAX_GRID_LEN: usize = 1 << 22;

/// Number of grid points of `step` needed to cover `[start, finish)`
pub fn grid_len(start: i64, finish: i64, step: i64) -> PreprocessResult<usize> {
    if step <= 0 {
        return Err(PreprocessError::InvalidGranularity(step));
    }
    let too_long = || PreprocessError::GridTooLong { start, finish, step };
    let span = finish.checked_sub(start).ok_or_else(too_long)?.max(0);
    let len = span / step + i64::from(span % step != 0);
    match usize::try_from(len) {
        Ok(len) if len <= MAX_GRID_LEN => Ok(len),
        _ => Err(too_long()),
    }
}

/// Place samples on the grid `start + i * step` covering `[start, finish)`.
///
/// Walks the grid backwards and consumes samples from the tail: a point
/// takes the latest unconsumed sample if it is at or after the point,
/// otherwise the point stays missing and the sample waits for an earlier one.
pub fn align(
    samples: &[(i64, f64)],
    start: i64,
    finish: i64,
    step: i64,
) -> PreprocessResult<Vec<Option<f64>>> {
    if step <= 0 {
        return Err(PreprocessError::InvalidGranularity(step));
    }
    if finish <= start {
        return Err(PreprocessError::InvalidInterval { start, finish });
    }

    let n = grid_len(start, finish, step)?;
    let mut remaining = samples.len();
    let mut values = vec![None; n];

    for i in (0..n).rev() {
        let point = start + step * i as i64;
        if remaining == 0 {
            break;
        }
        let (ts, value) = samples[remaining - 1];
        if ts >= point {
            values[i] = Some(value);
            remaining -= 1;
        }
    }
    Ok(values)
}

/// Coarsen a row to `granularity` by averaging buckets of consecutive points.
///
/// `granularity` must be a whole multiple of the row's step. Each bucket mean
/// ignores missing members; an all-missing bucket stays missing. The last
/// bucket may be short.
pub fn pre_aggregate(row: Row, granularity: i64) -> PreprocessResult<Row> {
    let step = row.step();
    if granularity < step {
        return Err(PreprocessError::Refinement {
            from: step,
            to: granularity,
        });
    }
    if granularity % step != 0 {
        return Err(PreprocessError::UnevenGranularity {
            from: step,
            to: granularity,
        });
    }

    let factor = (granularity / step) as usize;
    let values = row
        .values()
        .chunks(factor)
        .map(|bucket| {
            let present: Vec<f64> = bucket.iter().flatten().copied().collect();
            if present.is_empty() {
                None
            } else {
                Some(round2(present.iter().sum::<f64>() / present.len() as f64))
            }
        })
        .collect();

    Ok(row.regrid(values, granularity))
}

/// Fill gaps by linear blending between the known neighbours.
///
/// A run touching either end copies the single known neighbour.
pub fn interpolate(row: Row, config: &PreprocessingConfig) -> Unified {
    let len = row.len();
    if len == 0 {
        return Unified::Discarded(DiscardReason::NoValues);
    }

    let missing = row.missing();
    if missing == len {
        return Unified::Discarded(DiscardReason::NoValues);
    }
    if missing as f64 / len as f64 > config.interpolation_limit {
        return Unified::Discarded(DiscardReason::TooManyMissing { missing, len });
    }

    let allowed = config.max_interpolation_span_ms as f64 / row.step() as f64;
    let run = row.longest_gap();
    if run as f64 > allowed {
        return Unified::Discarded(DiscardReason::GapTooLong { run, allowed });
    }
    if missing == 0 {
        return Unified::Row(row);
    }

    let mut values = row.values().to_vec();
    let mut i = 0;
    while i < len {
        if values[i].is_some() {
            i += 1;
            continue;
        }

        let first = i;
        while i < len && values[i].is_none() {
            i += 1;
        }
        let last = i - 1;

        let lower = first.checked_sub(1).and_then(|j| values[j]);
        let upper = values.get(i).copied().flatten();
        let dist = (last - first + 2) as f64;

        for (offset, slot) in values[first..=last].iter_mut().enumerate() {
            *slot = match (lower, upper) {
                (Some(lo), Some(hi)) => {
                    let w_upper = (offset + 1) as f64 / dist;
                    let w_lower = (dist - 1.0 - offset as f64) / dist;
                    Some(w_lower * lo + w_upper * hi)
                }
                (Some(v), None) | (None, Some(v)) => Some(v),
                (None, None) => None,
            };
        }
    }

    Unified::Row(row.with_values(values))
}

/// Full time unification of one user's samples for one attribute
pub fn unify_row(
    samples: &[(i64, f64)],
    start: i64,
    finish: i64,
    tier: Tier,
    finest: i64,
    coarsest: i64,
    config: &PreprocessingConfig,
) -> PreprocessResult<Unified> {
    let values = align(samples, start, finish, finest)?;
    let mut row = Row::new(values, start, finest, tier, finest, coarsest)?;

    if finest != coarsest {
        row = pre_aggregate(row, coarsest)?;
    }

    Ok(interpolate(row, config))
}

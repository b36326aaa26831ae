//! One user's values of one attribute on a fixed-step time grid

use crate::preprocess::error::{PreprocessError, PreprocessResult};
use crate::storage::Tier;

/// A gridded series of optional values.
///
/// Timestamps are `start + i * step`, so there is exactly one timestamp per
/// value. A `None` marks a grid point without a sample and is kept until
/// interpolation decides about it.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Option<f64>>,
    start: i64,
    step: i64,
    tier: Tier,
    finest: i64,
    coarsest: i64,
}

impl Row {
    pub fn new(
        values: Vec<Option<f64>>,
        start: i64,
        step: i64,
        tier: Tier,
        finest: i64,
        coarsest: i64,
    ) -> PreprocessResult<Self> {
        for g in [step, finest, coarsest] {
            if g <= 0 {
                return Err(PreprocessError::InvalidGranularity(g));
            }
        }
        Ok(Self {
            values,
            start,
            step,
            tier,
            finest,
            coarsest,
        })
    }

    /// Replace the values and move the row to a new grid step.
    /// Both granularities become `step`.
    pub(crate) fn regrid(self, values: Vec<Option<f64>>, step: i64) -> Self {
        Self {
            values,
            step,
            finest: step,
            coarsest: step,
            ..self
        }
    }

    pub(crate) fn with_values(self, values: Vec<Option<f64>>) -> Self {
        debug_assert_eq!(values.len(), self.values.len());
        Self { values, ..self }
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    /// Distance between successive grid points
    pub fn step(&self) -> i64 {
        self.step
    }

    pub fn timestamp(&self, index: usize) -> i64 {
        self.start + self.step * index as i64
    }

    pub fn timestamps(&self) -> Vec<i64> {
        (0..self.values.len()).map(|i| self.timestamp(i)).collect()
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn finest(&self) -> i64 {
        self.finest
    }

    pub fn coarsest(&self) -> i64 {
        self.coarsest
    }

    pub fn missing(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }

    /// Longest run of consecutive missing points
    pub fn longest_gap(&self) -> usize {
        let mut longest = 0;
        let mut run = 0;
        for v in &self.values {
            if v.is_none() {
                run += 1;
                longest = longest.max(run);
            } else {
                run = 0;
            }
        }
        longest
    }

    /// Values with every gap filled, or None if any point is still missing
    pub fn complete_values(&self) -> Option<Vec<f64>> {
        self.values.iter().copied().collect()
    }
}

/// Round to two decimals, the precision values are stored and reported with
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

//! Per-tier statistics and their combination
//!
//! Each tier contributes an elementwise mean and population variance with
//! the number of members that had a value at each time step. Tiers are
//! combined by weighting with those counts.

use crate::preprocess::TierRows;

#[derive(Debug, Clone, PartialEq)]
pub struct TierStats {
    pub means: Vec<f64>,
    pub variances: Vec<f64>,
    pub counts: Vec<usize>,
}

impl TierStats {
    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }
}

/// Mean, population variance and member count per time step.
/// Steps without members have mean and variance 0.
pub fn tier_stats(rows: &TierRows, len: usize) -> TierStats {
    let mut sums = vec![0.0; len];
    let mut counts = vec![0usize; len];
    for row in rows.values() {
        for (i, v) in row.values().iter().enumerate().take(len) {
            if let Some(v) = v {
                sums[i] += v;
                counts[i] += 1;
            }
        }
    }

    let means: Vec<f64> = sums
        .iter()
        .zip(&counts)
        .map(|(s, c)| if *c == 0 { 0.0 } else { s / *c as f64 })
        .collect();

    let mut squares = vec![0.0; len];
    for row in rows.values() {
        for (i, v) in row.values().iter().enumerate().take(len) {
            if let Some(v) = v {
                squares[i] += (v - means[i]).powi(2);
            }
        }
    }
    let variances = squares
        .iter()
        .zip(&counts)
        .map(|(s, c)| if *c == 0 { 0.0 } else { s / *c as f64 })
        .collect();

    TierStats {
        means,
        variances,
        counts,
    }
}

/// Tiers merged into one series
#[derive(Debug, Clone, PartialEq)]
pub struct Combined {
    /// None where no tier had a member
    pub mean: Vec<Option<f64>>,
    pub variance: Vec<Option<f64>>,
}

impl Combined {
    pub fn std_dev(&self) -> Vec<Option<f64>> {
        self.variance
            .iter()
            .map(|v| v.map(|v| v.max(0.0).sqrt()))
            .collect()
    }
}

/// Count-weighted mean and variance across tiers
pub fn combine(stats: &[TierStats]) -> Combined {
    let len = stats.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut mean = Vec::with_capacity(len);
    let mut variance = Vec::with_capacity(len);

    for i in 0..len {
        let mut total = 0usize;
        let mut weighted_mean = 0.0;
        let mut weighted_var = 0.0;
        for s in stats {
            let c = s.counts.get(i).copied().unwrap_or(0);
            if c == 0 {
                continue;
            }
            total += c;
            weighted_mean += s.means[i] * c as f64;
            weighted_var += s.variances[i] * c as f64;
        }

        if total == 0 {
            mean.push(None);
            variance.push(None);
        } else {
            mean.push(Some(weighted_mean / total as f64));
            variance.push(Some(weighted_var / total as f64));
        }
    }

    Combined { mean, variance }
}

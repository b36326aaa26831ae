//! Differential privacy (Laplace mechanism)
//!
//! Noise is scaled by `sensitivity / epsilon(tier)`. Sensitivities are taken
//! from the observed value range of one attribute across all tiers.

use crate::anonymize::combine::TierStats;
use crate::anonymize::error::AnonymizeResult;
use crate::anonymize::noise::NoiseSource;
use crate::preprocess::TieredRows;

/// Sensitivities of the mean and variance of one attribute
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sensitivity {
    pub mean: f64,
    pub variance: f64,
}

/// `(max - min) / (n + 1)` for the mean and `sqrt(n)` times that for the
/// variance, `n` being the participants of all tiers. Zero without values.
pub fn sensitivity(tiered: &TieredRows) -> Sensitivity {
    let participants = tiered.participants();
    let (min, max) = tiered
        .iter()
        .flat_map(|(_, rows)| rows.values())
        .flat_map(|row| row.values().iter().flatten())
        .fold(None, |bounds: Option<(f64, f64)>, v| match bounds {
            None => Some((*v, *v)),
            Some((lo, hi)) => Some((lo.min(*v), hi.max(*v))),
        })
        .unwrap_or((0.0, 0.0));

    let mean = (max - min) / (participants as f64 + 1.0);
    Sensitivity {
        mean,
        variance: (participants as f64).sqrt() * mean,
    }
}

/// Add Laplace noise to every non-zero mean and variance of one tier.
/// Variances that turn negative are redrawn.
pub fn perturb_stats(
    stats: &mut TierStats,
    sensitivity: Sensitivity,
    epsilon: f64,
    noise: &dyn NoiseSource,
) -> AnonymizeResult<()> {
    let mean_scale = sensitivity.mean / epsilon;
    let variance_scale = sensitivity.variance / epsilon;

    for mean in stats.means.iter_mut() {
        if *mean != 0.0 && mean_scale > 0.0 {
            *mean += noise.laplace(mean_scale)?;
        }
    }

    for variance in stats.variances.iter_mut() {
        if *variance == 0.0 || variance_scale <= 0.0 {
            continue;
        }
        let observed = *variance;
        loop {
            let candidate = observed + noise.laplace(variance_scale)?;
            if candidate >= 0.0 {
                *variance = candidate;
                break;
            }
        }
    }
    Ok(())
}

/// Participant count with Laplace noise of sensitivity 1, rounded and
/// redrawn until non-negative
pub fn noisy_count(count: usize, epsilon: f64, noise: &dyn NoiseSource) -> AnonymizeResult<u64> {
    let scale = 1.0 / epsilon;
    loop {
        let candidate = (count as f64 + noise.laplace(scale)?).round();
        if candidate >= 0.0 {
            return Ok(candidate as u64);
        }
    }
}

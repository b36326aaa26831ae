//! Gaussian-noise mode
//!
//! Every value is perturbed by `Normal(0, noise_factor(tier) * |reference|)`.
//! The reference is the first value found for the attribute, walking tiers
//! in ascending order and users in id order.

use crate::anonymize::error::AnonymizeResult;
use crate::anonymize::noise::NoiseSource;
use crate::config::PrivacyConfig;
use crate::preprocess::TieredRows;

pub fn reference_value(tiered: &TieredRows) -> Option<f64> {
    tiered
        .iter()
        .flat_map(|(_, rows)| rows.values())
        .flat_map(|row| row.values().iter())
        .find_map(|v| *v)
}

pub fn add_gaussian_noise(
    tiered: &TieredRows,
    config: &PrivacyConfig,
    noise: &dyn NoiseSource,
) -> AnonymizeResult<TieredRows> {
    let Some(reference) = reference_value(tiered) else {
        return Ok(tiered.clone());
    };

    let mut noised = TieredRows::new();
    for (tier, rows) in tiered.iter() {
        let std_dev = config.tier(tier).noise_factor * reference.abs();
        for (user, row) in rows {
            let values = row
                .values()
                .iter()
                .map(|v| match v {
                    Some(x) => noise.gaussian(std_dev).map(|n| Some(x + n)),
                    None => Ok(None),
                })
                .collect::<AnonymizeResult<Vec<_>>>()?;
            noised.insert(*user, row.clone().with_values(values));
        }
    }
    Ok(noised)
}

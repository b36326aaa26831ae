//! Per-function aggregation strategies
//!
//! Every SELECT function maps onto one strategy producing a JSON payload:
//!
//! | Function | Payload |
//! |----------|---------|
//! | COUNT    | noised participant count (integer) |
//! | SUM, AVG | `{mean, stDev, participants}` under the configured mode |
//! | RAVG     | `{mean, stDev, participants}` without anonymization |
//!
//! CORR and ALL have no strategy.

use crate::anonymize::combine::{combine, tier_stats, TierStats};
use crate::anonymize::diffpriv::{noisy_count, perturb_stats, sensitivity};
use crate::anonymize::error::{AnonymizeError, AnonymizeResult};
use crate::anonymize::gaussian::add_gaussian_noise;
use crate::anonymize::kanon::k_anonymize;
use crate::anonymize::noise::NoiseSource;
use crate::config::{AnonymizationMode, PrivacyConfig};
use crate::preprocess::{Partitioned, TieredRows};
use crate::query::Function;
use crate::sources::AttributeId;
use serde::Serialize;
use serde_json::{Map, Value};

/// Aggregated series of one attribute
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsPayload {
    pub mean: Vec<Option<f64>>,
    #[serde(rename = "stDev")]
    pub st_dev: Vec<Option<f64>>,
    pub participants: usize,
}

pub struct Anonymizer<'a> {
    config: &'a PrivacyConfig,
    noise: &'a dyn NoiseSource,
}

impl<'a> Anonymizer<'a> {
    pub fn new(config: &'a PrivacyConfig, noise: &'a dyn NoiseSource) -> Self {
        Self { config, noise }
    }

    /// Payload of one function call. Several attributes yield a map keyed
    /// by `Source.attribute`.
    pub fn apply(
        &self,
        function: Function,
        attrs: &[AttributeId],
        data: &Partitioned,
    ) -> AnonymizeResult<Value> {
        if let [attr] = attrs {
            return self.apply_one(function, attr, data);
        }

        let mut payloads = Map::new();
        for attr in attrs {
            payloads.insert(attr.to_string(), self.apply_one(function, attr, data)?);
        }
        Ok(Value::Object(payloads))
    }

    fn apply_one(
        &self,
        function: Function,
        attr: &AttributeId,
        data: &Partitioned,
    ) -> AnonymizeResult<Value> {
        let tiered = data
            .get(attr)
            .ok_or_else(|| AnonymizeError::MissingAttribute(attr.to_string()))?;

        match function {
            Function::Count => Ok(Value::from(self.count(tiered)?)),
            Function::Sum | Function::Avg => to_value(self.anonymized_stats(attr, tiered)?),
            Function::Ravg => to_value(self.stats(tiered, false)?),
            Function::Corr | Function::All => Err(AnonymizeError::UnsupportedFunction(
                function.as_str().to_string(),
            )),
        }
    }

    /// Sum of the per-tier noised counts
    pub fn count(&self, tiered: &TieredRows) -> AnonymizeResult<u64> {
        let mut total = 0;
        for (tier, rows) in tiered.iter() {
            total += noisy_count(rows.len(), self.config.tier(tier).epsilon, self.noise)?;
        }
        Ok(total)
    }

    fn anonymized_stats(
        &self,
        attr: &AttributeId,
        tiered: &TieredRows,
    ) -> AnonymizeResult<StatsPayload> {
        match self.config.mode {
            AnonymizationMode::DifferentialPrivacy => self.stats(tiered, true),
            AnonymizationMode::KAnonymity => {
                let grouped = k_anonymize(tiered, self.config, &attr.to_string())?;
                self.stats(&grouped, false)
            }
            AnonymizationMode::GaussianNoise => {
                let noised = add_gaussian_noise(tiered, self.config, self.noise)?;
                self.stats(&noised, false)
            }
        }
    }

    fn stats(&self, tiered: &TieredRows, noised: bool) -> AnonymizeResult<StatsPayload> {
        let len = tiered.row_len();
        let sens = sensitivity(tiered);

        let mut per_tier: Vec<TierStats> = Vec::with_capacity(3);
        for (tier, rows) in tiered.iter() {
            let mut stats = tier_stats(rows, len);
            if noised {
                perturb_stats(&mut stats, sens, self.config.tier(tier).epsilon, self.noise)?;
            }
            per_tier.push(stats);
        }

        let combined = combine(&per_tier);
        Ok(StatsPayload {
            st_dev: combined.std_dev(),
            mean: combined.mean,
            participants: tiered.participants(),
        })
    }
}

fn to_value(payload: StatsPayload) -> AnonymizeResult<Value> {
    serde_json::to_value(payload).map_err(|e| AnonymizeError::InvalidParameter(e.to_string()))
}

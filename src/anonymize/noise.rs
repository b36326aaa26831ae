//! Noise Sources
//!
//! Laplace and Gaussian samplers behind a trait so aggregation can be run
//! with a fixed seed in tests and benchmarks.

use crate::anonymize::error::{AnonymizeError, AnonymizeResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::Mutex;

pub trait NoiseSource: Send + Sync {
    /// Draw from Laplace(0, scale)
    fn laplace(&self, scale: f64) -> AnonymizeResult<f64>;

    /// Draw from Normal(0, std_dev)
    fn gaussian(&self, std_dev: f64) -> AnonymizeResult<f64>;
}

/// StdRng-backed noise, seeded from OS entropy unless a seed is given
pub struct SeededNoise {
    rng: Mutex<StdRng>,
}

impl SeededNoise {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible sequence for tests and benchmarks
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Uniform draw in (0, 1)
    fn open_unit(&self) -> AnonymizeResult<f64> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|e| AnonymizeError::NoiseUnavailable(e.to_string()))?;
        let mut u: f64 = rng.gen();
        if u == 0.0 {
            u = f64::MIN_POSITIVE;
        }
        Ok(u)
    }
}

impl Default for SeededNoise {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseSource for SeededNoise {
    fn laplace(&self, scale: f64) -> AnonymizeResult<f64> {
        if !scale.is_finite() || scale < 0.0 {
            return Err(AnonymizeError::InvalidParameter(format!(
                "laplace scale {}",
                scale
            )));
        }
        if scale == 0.0 {
            return Ok(0.0);
        }

        // inverse CDF
        let u = self.open_unit()? - 0.5;
        Ok(-scale * u.signum() * (1.0 - 2.0 * u.abs()).ln())
    }

    fn gaussian(&self, std_dev: f64) -> AnonymizeResult<f64> {
        if !std_dev.is_finite() || std_dev < 0.0 {
            return Err(AnonymizeError::InvalidParameter(format!(
                "gaussian std_dev {}",
                std_dev
            )));
        }
        if std_dev == 0.0 {
            return Ok(0.0);
        }

        // Box-Muller
        let u1 = self.open_unit()?;
        let u2 = self.open_unit()?;
        Ok(std_dev * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos())
    }
}

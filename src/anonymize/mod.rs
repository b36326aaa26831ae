//! Anonymization
//!
//! Turns partitioned rows into result payloads while hiding individual
//! contributions:
//!
//! - **noise**: `NoiseSource` trait, StdRng-backed Laplace/Gaussian draws
//! - **kanon**: k-anonymity grouping with tier cascading
//! - **gaussian**: relative Gaussian perturbation of every value
//! - **diffpriv**: Laplace mechanism over counts, means and variances
//! - **combine**: per-tier statistics and their count-weighted merge
//! - **dispatch**: per-function strategy selection (`Anonymizer`)

pub mod combine;
pub mod diffpriv;
pub mod dispatch;
mod error;
pub mod gaussian;
pub mod kanon;
pub mod noise;

pub use combine::{combine, tier_stats, Combined, TierStats};
pub use diffpriv::{noisy_count, perturb_stats, sensitivity, Sensitivity};
pub use dispatch::{Anonymizer, StatsPayload};
pub use error::{AnonymizeError, AnonymizeResult};
pub use gaussian::add_gaussian_noise;
pub use kanon::{build_groups, k_anonymize};
pub use noise::{NoiseSource, SeededNoise};

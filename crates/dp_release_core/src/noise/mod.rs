//! Noise mechanisms for count releases.
//!
//! # Responsibility
//! - Perturb true counts with calibrated Laplace noise.
//! - Derive confidence intervals for published noisy counts.
//!
//! # Invariants
//! - Functions here are pure given the RNG; they never touch the ledger.

pub mod laplace;

pub use laplace::{
    confidence_interval, margin, perturb, scale, NoiseError, NoiseResult, DEFAULT_CONFIDENCE,
    SENSITIVITY,
};

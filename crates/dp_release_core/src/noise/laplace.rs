//! Laplace mechanism for sensitivity-1 counting queries.
//!
//! One vote changes a count by exactly one, so the noise scale is
//! `b = 1 / epsilon`. Budget accounting is the caller's job, which keeps
//! these functions usable for what-if evaluation.

use crate::model::release::ConfidenceInterval;
use rand::Rng;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// L1 sensitivity of a vote count.
pub const SENSITIVITY: f64 = 1.0;
/// Confidence level used for published intervals.
pub const DEFAULT_CONFIDENCE: f64 = 0.95;

const MIN_MAGNITUDE: f64 = 1e-12;

pub type NoiseResult<T> = Result<T, NoiseError>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoiseError {
    /// Epsilon must be finite and strictly positive.
    InvalidEpsilon(f64),
    /// Confidence must lie strictly between 0 and 1.
    InvalidConfidence(f64),
}

impl Display for NoiseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEpsilon(value) => write!(f, "epsilon must be > 0, got {value}"),
            Self::InvalidConfidence(value) => {
                write!(f, "confidence must be within (0, 1), got {value}")
            }
        }
    }
}

impl Error for NoiseError {}

/// Laplace scale `b = sensitivity / epsilon`.
pub fn scale(epsilon: f64) -> NoiseResult<f64> {
    if !epsilon.is_finite() || epsilon <= 0.0 {
        return Err(NoiseError::InvalidEpsilon(epsilon));
    }
    Ok(SENSITIVITY / epsilon)
}

/// Draws `true_count + Laplace(0, 1/epsilon)` by inverse-CDF sampling.
pub fn perturb<R: Rng + ?Sized>(rng: &mut R, true_count: i64, epsilon: f64) -> NoiseResult<f64> {
    let b = scale(epsilon)?;
    let u: f64 = rng.gen::<f64>() - 0.5;
    let sign = if u >= 0.0 { 1.0 } else { -1.0 };
    let magnitude = (1.0 - 2.0 * u.abs()).max(MIN_MAGNITUDE);
    let noise = -b * sign * magnitude.ln();
    Ok(true_count as f64 + noise)
}

/// Half-width `t` with `P(|noise| <= t) = confidence`, i.e. `b * ln(1 / (1 - confidence))`.
pub fn margin(epsilon: f64, confidence: f64) -> NoiseResult<f64> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(NoiseError::InvalidConfidence(confidence));
    }
    let b = scale(epsilon)?;
    Ok(b * (1.0 / (1.0 - confidence)).ln())
}

/// Symmetric interval around `noisy_count` at the given confidence.
pub fn confidence_interval(
    noisy_count: f64,
    epsilon: f64,
    confidence: f64,
) -> NoiseResult<ConfidenceInterval> {
    let half_width = margin(epsilon, confidence)?;
    Ok(ConfidenceInterval {
        lower: noisy_count - half_width,
        upper: noisy_count + half_width,
    })
}

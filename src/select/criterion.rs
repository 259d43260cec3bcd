//! Information criterion values and their comparison contract.
//!
//! Values are computed from a negative log-likelihood, the number of
//! estimated parameters `k` and the number of data points `n`:
//!
//! - AIC  = 2k + 2 NLLH
//! - AICc = AIC + 2k(k + 1) / (n - k - 1)
//! - BIC  = k ln(n) + 2 NLLH
//! - NLLH as given
//!
//! Lower is better for every kind. Two values are comparable only when they
//! share a kind and were computed on the same number of data points.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::schema::CriterionKind;

/// Relative tolerance under which two criterion values count as equal.
pub const RELATIVE_TOLERANCE: f64 = 1e-9;

/// A computed fit-quality score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CriterionValue {
    pub kind: CriterionKind,
    pub value: f64,
    /// Estimated parameters the value was computed with.
    pub n_estimated: usize,
    /// Data points the value was computed with.
    pub n_data: usize,
}

/// Outcome of comparing two criterion values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Better,
    Worse,
    Equal,
}

impl Comparison {
    pub fn to_ordering(self) -> Ordering {
        match self {
            Comparison::Better => Ordering::Less,
            Comparison::Equal => Ordering::Equal,
            Comparison::Worse => Ordering::Greater,
        }
    }
}

/// Criterion errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CriterionError {
    #[error("Cannot compare {left} with {right}: {reason}")]
    Incomparable {
        left: CriterionKind,
        right: CriterionKind,
        reason: String,
    },
    #[error("{kind} needs more data points than {n_estimated} + 1 (got {n_data})")]
    InsufficientData {
        kind: CriterionKind,
        n_estimated: usize,
        n_data: usize,
    },
    #[error("Negative log-likelihood must be finite, got {0}")]
    NonFinite(f64),
}

/// Values within [`RELATIVE_TOLERANCE`] of each other, scaled by the larger
/// magnitude (floored at one so values near zero compare absolutely).
pub fn approx_equal(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= RELATIVE_TOLERANCE * scale
}

impl CriterionValue {
    /// Compute a criterion of `kind`.
    pub fn compute(
        kind: CriterionKind,
        nllh: f64,
        n_estimated: usize,
        n_data: usize,
    ) -> Result<Self, CriterionError> {
        if !nllh.is_finite() {
            return Err(CriterionError::NonFinite(nllh));
        }

        let k = n_estimated as f64;
        let n = n_data as f64;
        let aic = 2.0 * k + 2.0 * nllh;

        let value = match kind {
            CriterionKind::Nllh => nllh,
            CriterionKind::Aic => aic,
            CriterionKind::Aicc => {
                if n_data <= n_estimated + 1 {
                    return Err(CriterionError::InsufficientData {
                        kind,
                        n_estimated,
                        n_data,
                    });
                }
                aic + 2.0 * k * (k + 1.0) / (n - k - 1.0)
            }
            CriterionKind::Bic => {
                if n_data == 0 {
                    return Err(CriterionError::InsufficientData {
                        kind,
                        n_estimated,
                        n_data,
                    });
                }
                k * n.ln() + 2.0 * nllh
            }
        };

        Ok(Self {
            kind,
            value,
            n_estimated,
            n_data,
        })
    }

    /// Compare `self` against `other`.
    pub fn compare(&self, other: &CriterionValue) -> Result<Comparison, CriterionError> {
        if self.kind != other.kind {
            return Err(CriterionError::Incomparable {
                left: self.kind,
                right: other.kind,
                reason: "different criterion kinds".to_string(),
            });
        }
        if self.n_data != other.n_data {
            return Err(CriterionError::Incomparable {
                left: self.kind,
                right: other.kind,
                reason: format!(
                    "computed on different data ({} vs {} points)",
                    self.n_data, other.n_data
                ),
            });
        }

        Ok(if approx_equal(self.value, other.value) {
            Comparison::Equal
        } else if self.value < other.value {
            Comparison::Better
        } else {
            Comparison::Worse
        })
    }

    /// Whether `self` beats `incumbent` by more than `tolerance`.
    pub fn is_improvement(
        &self,
        incumbent: &CriterionValue,
        tolerance: f64,
    ) -> Result<bool, CriterionError> {
        match self.compare(incumbent)? {
            Comparison::Better => Ok(incumbent.value - self.value > tolerance),
            Comparison::Equal | Comparison::Worse => Ok(false),
        }
    }
}

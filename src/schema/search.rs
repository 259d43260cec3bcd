//! Search method configuration for model selection.
//!
//! This module provides the closed set of search strategies and the
//! information criteria they rank models by.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ParameterValue};

/// Information criterion used to rank calibrated models.
///
/// Every kind follows the same sign convention: lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CriterionKind {
    /// Akaike information criterion.
    #[serde(rename = "AIC")]
    Aic,
    /// Akaike information criterion with small-sample correction.
    #[serde(rename = "AICc")]
    Aicc,
    /// Bayesian information criterion.
    #[serde(rename = "BIC")]
    Bic,
    /// Negative log-likelihood.
    #[serde(rename = "NLLH")]
    Nllh,
}

impl CriterionKind {
    /// All supported kinds, in a fixed order.
    pub const ALL: [CriterionKind; 4] = [
        CriterionKind::Aic,
        CriterionKind::Aicc,
        CriterionKind::Bic,
        CriterionKind::Nllh,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CriterionKind::Aic => "AIC",
            CriterionKind::Aicc => "AICc",
            CriterionKind::Bic => "BIC",
            CriterionKind::Nllh => "NLLH",
        }
    }
}

impl fmt::Display for CriterionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Search strategy selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SearchMethod {
    /// Calibrate every remaining model in a single batch.
    BruteForce,
    /// Greedy hill-climb adding one estimated parameter per step.
    Forward(StepwiseConfig),
    /// Greedy hill-climb removing one estimated parameter per step.
    Backward(StepwiseConfig),
    /// Neighbourhood search with add/remove/swap moves and radius jumps.
    Famos(FamosConfig),
}

impl Default for SearchMethod {
    fn default() -> Self {
        Self::Forward(StepwiseConfig::default())
    }
}

impl SearchMethod {
    /// Short human-readable method name.
    pub fn name(&self) -> &'static str {
        match self {
            SearchMethod::BruteForce => "brute_force",
            SearchMethod::Forward(_) => "forward",
            SearchMethod::Backward(_) => "backward",
            SearchMethod::Famos(_) => "famos",
        }
    }

    /// Minimum improvement a candidate needs over the incumbent.
    pub fn tolerance(&self) -> f64 {
        match self {
            SearchMethod::BruteForce => 0.0,
            SearchMethod::Forward(c) | SearchMethod::Backward(c) => c.tolerance,
            SearchMethod::Famos(c) => c.tolerance,
        }
    }

    /// Most candidates proposed per iteration. Brute force is never limited.
    pub fn limit(&self) -> Option<usize> {
        match self {
            SearchMethod::BruteForce => None,
            SearchMethod::Forward(c) | SearchMethod::Backward(c) => c.limit,
            SearchMethod::Famos(c) => c.limit,
        }
    }

    /// Starting point of the search, falling back to the method default.
    pub fn initial_model(&self) -> InitialModel {
        match self {
            SearchMethod::BruteForce => InitialModel::Minimal,
            SearchMethod::Forward(c) => c.initial.clone().unwrap_or(InitialModel::Minimal),
            SearchMethod::Backward(c) => c.initial.clone().unwrap_or(InitialModel::Maximal),
            SearchMethod::Famos(c) => c.initial.clone().unwrap_or(InitialModel::Minimal),
        }
    }

    /// Validate method tunables.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tolerance = self.tolerance();
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            return Err(ConfigError::InvalidTunable(format!(
                "tolerance must be finite and non-negative, got {tolerance}"
            )));
        }

        if self.limit() == Some(0) {
            return Err(ConfigError::InvalidTunable(
                "limit must be at least 1".to_string(),
            ));
        }

        if let SearchMethod::Famos(c) = self
            && c.retry_budget > 0
            && c.jump_radius < 2
        {
            return Err(ConfigError::InvalidTunable(format!(
                "jump_radius must be at least 2 when jumps are enabled, got {}",
                c.jump_radius
            )));
        }

        if let InitialModel::Explicit { subspace, .. } = self.initial_model()
            && subspace.is_empty()
        {
            return Err(ConfigError::InvalidTunable(
                "explicit initial model needs a subspace id".to_string(),
            ));
        }

        Ok(())
    }
}

/// Forward/backward selection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepwiseConfig {
    /// A candidate must beat the incumbent by more than this to be accepted.
    #[serde(default)]
    pub tolerance: f64,
    /// Starting model. `None` uses the direction's natural start.
    #[serde(default)]
    pub initial: Option<InitialModel>,
    /// Most candidates per iteration, taken in enumeration order.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Neighbourhood (FAMoS-style) search configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamosConfig {
    /// A candidate must beat the incumbent by more than this to be accepted.
    #[serde(default)]
    pub tolerance: f64,
    /// Non-improving local iterations tolerated before jumping.
    #[serde(default)]
    pub stall_budget: usize,
    /// Largest neighbourhood radius a jump may widen to.
    #[serde(default = "default_jump_radius")]
    pub jump_radius: usize,
    /// Failed jumps allowed before the search stalls. Zero disables jumps.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: usize,
    /// Include simultaneous add-one/remove-one moves in local batches.
    #[serde(default = "default_swap_moves")]
    pub swap_moves: bool,
    /// Number of abandoned estimated-parameter sets remembered to avoid
    /// oscillating back to them.
    #[serde(default = "default_swap_memory")]
    pub swap_memory: usize,
    /// Starting model. `None` starts from the minimal models.
    #[serde(default)]
    pub initial: Option<InitialModel>,
    /// Most candidates per iteration, taken in enumeration order.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Default for FamosConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.0,
            stall_budget: 0,
            jump_radius: default_jump_radius(),
            retry_budget: default_retry_budget(),
            swap_moves: default_swap_moves(),
            swap_memory: default_swap_memory(),
            initial: None,
            limit: None,
        }
    }
}

fn default_jump_radius() -> usize {
    3
}
fn default_retry_budget() -> usize {
    2
}
fn default_swap_moves() -> bool {
    true
}
fn default_swap_memory() -> usize {
    4
}

/// Where a stepwise search begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum InitialModel {
    /// All remaining models with the fewest estimated parameters.
    Minimal,
    /// All remaining models with the most estimated parameters.
    Maximal,
    /// One named model.
    Explicit {
        /// Subspace the model is generated by.
        subspace: String,
        /// Full parameter assignment.
        assignment: BTreeMap<String, ParameterValue>,
    },
    /// One model drawn uniformly from the space with a fixed seed.
    Random {
        /// RNG seed.
        seed: u64,
    },
}

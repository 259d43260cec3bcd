//! Search phase, ledger and result types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::select::{CriterionValue, Model, ModelId};

// ============================================================================
// State machine phase
// ============================================================================

/// Phase of the candidate space state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SearchPhase {
    /// Strategy configured, nothing proposed yet.
    #[default]
    Initialized,
    /// At least one batch proposed.
    Iterating,
    /// No candidate improves on the incumbent.
    Converged,
    /// No unexcluded candidates remain.
    Exhausted,
    /// No progress possible (every calibration failed, or jumps ran out).
    Stalled,
}

impl SearchPhase {
    /// Terminal phases are never left within a run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SearchPhase::Converged | SearchPhase::Exhausted | SearchPhase::Stalled
        )
    }
}

impl fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SearchPhase::Initialized => "initialized",
            SearchPhase::Iterating => "iterating",
            SearchPhase::Converged => "converged",
            SearchPhase::Exhausted => "exhausted",
            SearchPhase::Stalled => "stalled",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Outcome of one calibration attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LedgerStatus {
    Calibrated,
    Failed { reason: String },
}

/// One row of the visited-model ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    /// Iteration the model was proposed in (1-based).
    pub iteration: usize,
    pub model: ModelId,
    /// Subspace that generated the model.
    pub subspace: String,
    pub n_estimated: usize,
    /// Value of the ranking criterion, absent for failures.
    pub criterion: Option<CriterionValue>,
    pub status: LedgerStatus,
    /// Incumbent the model's batch was expanded from. `None` for starting
    /// batches and brute force.
    #[serde(default)]
    pub predecessor: Option<ModelId>,
}

impl LedgerEntry {
    pub fn is_calibrated(&self) -> bool {
        self.status == LedgerStatus::Calibrated
    }
}

// ============================================================================
// Progress and result
// ============================================================================

/// Snapshot reported after each iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchProgress {
    /// Iterations completed.
    pub iteration: usize,
    pub phase: SearchPhase,
    /// Size of the most recent batch.
    pub batch_size: usize,
    /// Calibration failures in the most recent batch.
    pub batch_failures: usize,
    /// Current incumbent and its ranking criterion.
    pub incumbent: Option<ModelId>,
    pub incumbent_value: Option<f64>,
    /// Models excluded from candidacy so far.
    pub excluded: usize,
    /// Ledger rows so far.
    pub evaluated: usize,
}

/// Why a run returned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Local or global optimum reached.
    Converged,
    /// No candidates remain.
    Exhausted,
    /// No progress possible.
    Stalled,
    /// `max_iterations` reached; the run is resumable.
    IterationLimit,
    /// Cancelled between iterations; the run is resumable.
    Cancelled,
}

impl StopReason {
    /// Stop reason for a terminal phase.
    pub fn from_phase(phase: SearchPhase) -> Option<Self> {
        match phase {
            SearchPhase::Converged => Some(StopReason::Converged),
            SearchPhase::Exhausted => Some(StopReason::Exhausted),
            SearchPhase::Stalled => Some(StopReason::Stalled),
            SearchPhase::Initialized | SearchPhase::Iterating => None,
        }
    }
}

/// Statistics from a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchStats {
    /// Iterations completed, including those of resumed runs.
    pub iterations: usize,
    pub calibrated: usize,
    pub failed: usize,
    /// Wall time of this invocation (in seconds).
    pub elapsed_seconds: f64,
    pub stop_reason: StopReason,
}

/// Final result of a search run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub phase: SearchPhase,
    /// Best calibrated model found.
    pub incumbent: Option<Model>,
    /// Every calibration attempt, in proposal order.
    pub ledger: Vec<LedgerEntry>,
    pub stats: SearchStats,
}

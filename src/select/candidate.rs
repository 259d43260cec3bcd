//! Search strategy state machine.
//!
//! `Initialized -> Iterating -> (Converged | Exhausted | Stalled)`. Every
//! [`CandidateSpace::propose_next_batch`] is answered by exactly one
//! [`CandidateSpace::update_results`], and state only changes at those batch
//! boundaries, so the struct itself is the resumable search state.
//!
//! A terminal phase is final for the current run. Only
//! [`CandidateSpace::retry_failed`] leaves it, and it does so by closing the
//! run and opening the next one.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use log::{debug, info, warn};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointError;
use crate::schema::{
    ConfigError, CriterionKind, FamosConfig, InitialModel, SearchMethod, SearchPhase,
};

use super::calibrator::CalibrationOutcome;
use super::criterion::CriterionError;
use super::model::{Model, ModelError, ModelId};
use super::space::{ModelSpace, StrategyHint};
use super::subspace::SubspaceError;

/// Search errors. All of these are fatal for the run.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Criterion(#[from] CriterionError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Subspace(#[from] SubspaceError),
    #[error("Model {model} was returned without a {expected} value")]
    InconsistentCriterion {
        model: ModelId,
        expected: CriterionKind,
    },
    #[error("Model {0} was proposed twice in one run")]
    DuplicateProposal(ModelId),
    #[error("Result for model {0} does not match the pending batch")]
    UnexpectedResult(ModelId),
    #[error("No batch is pending")]
    NoPendingBatch,
    #[error("Results for the previous batch have not been reported")]
    BatchPending,
    #[error("Search has already terminated ({0})")]
    Terminated(SearchPhase),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Neighbourhood search state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FamosState {
    /// Consecutive non-improving local iterations.
    pub stall: usize,
    /// Jumps made since the last improvement; zero while searching locally.
    pub jumps: usize,
    /// Estimated-parameter sets of abandoned incumbents, oldest first.
    pub swap_history: VecDeque<BTreeSet<String>>,
}

/// Draws tried for a random start before falling back to enumeration order.
const RANDOM_START_ATTEMPTS: usize = 1024;

/// Summary of one reported batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub iteration: usize,
    pub calibrated: usize,
    /// Attempted but uncalibrated.
    pub failed: Vec<ModelId>,
    /// Best calibrated model of the batch.
    pub best: Option<ModelId>,
    /// Whether the incumbent changed.
    pub improved: bool,
    pub phase: SearchPhase,
}

enum Step {
    Propose(Vec<Model>),
    Finish(SearchPhase),
}

/// Order two calibrated models by `kind`: lower value first, then fewer
/// estimated parameters.
pub fn rank(a: &Model, b: &Model, kind: CriterionKind) -> Result<Ordering, SearchError> {
    let cmp = a.get_criterion(kind)?.compare(b.get_criterion(kind)?)?;
    Ok(cmp
        .to_ordering()
        .then_with(|| a.n_estimated().cmp(&b.n_estimated())))
}

/// Best of `models` by [`rank`]; on a full tie the earliest wins.
pub fn select_best<'a, I>(models: I, kind: CriterionKind) -> Result<Option<&'a Model>, SearchError>
where
    I: IntoIterator<Item = &'a Model>,
{
    let mut best: Option<&Model> = None;
    for model in models {
        best = match best {
            Some(current) if rank(model, current, kind)? != Ordering::Less => Some(current),
            _ => Some(model),
        };
    }
    Ok(best)
}

fn estimated_set(model: &Model) -> BTreeSet<String> {
    model.estimated_parameters().map(str::to_string).collect()
}

/// Exactly one parameter added and one removed relative to `current`.
fn is_swap(current: &BTreeSet<String>, model: &Model) -> bool {
    let next = estimated_set(model);
    next.difference(current).count() == 1 && current.difference(&next).count() == 1
}

/// Search strategy state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSpace {
    method: SearchMethod,
    criterion: CriterionKind,
    phase: SearchPhase,
    initial: InitialModel,
    incumbent: Option<Model>,
    /// Proposed and not yet reported.
    pending: Vec<Model>,
    /// Every model reported back in this run, calibrated or failed.
    visited: BTreeSet<ModelId>,
    /// Reported as failed; a subset of `visited`.
    failed: BTreeSet<ModelId>,
    #[serde(default)]
    famos: FamosState,
    iteration: usize,
    /// Successive incumbents.
    history: Vec<ModelId>,
    /// Runs closed by [`retry_failed`](Self::retry_failed).
    #[serde(default)]
    run: usize,
}

impl CandidateSpace {
    pub fn new(method: SearchMethod, criterion: CriterionKind) -> Self {
        let initial = method.initial_model();
        Self {
            method,
            criterion,
            phase: SearchPhase::Initialized,
            initial,
            incumbent: None,
            pending: Vec::new(),
            visited: BTreeSet::new(),
            failed: BTreeSet::new(),
            famos: FamosState::default(),
            iteration: 0,
            history: Vec::new(),
            run: 0,
        }
    }

    pub fn method(&self) -> &SearchMethod {
        &self.method
    }

    pub fn criterion(&self) -> CriterionKind {
        self.criterion
    }

    #[inline]
    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn incumbent(&self) -> Option<&Model> {
        self.incumbent.as_ref()
    }

    /// Batches proposed so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn pending(&self) -> &[Model] {
        &self.pending
    }

    pub fn visited(&self) -> &BTreeSet<ModelId> {
        &self.visited
    }

    pub fn failed(&self) -> &BTreeSet<ModelId> {
        &self.failed
    }

    pub fn incumbent_history(&self) -> &[ModelId] {
        &self.history
    }

    pub fn famos_state(&self) -> &FamosState {
        &self.famos
    }

    /// Current run, counting from zero.
    pub fn run(&self) -> usize {
        self.run
    }

    /// Propose the next batch of candidates.
    ///
    /// An empty batch means the search has just terminated; [`phase`]
    /// tells how.
    ///
    /// [`phase`]: Self::phase
    pub fn propose_next_batch(&mut self, space: &ModelSpace) -> Result<Vec<Model>, SearchError> {
        if self.phase.is_terminal() {
            return Err(SearchError::Terminated(self.phase));
        }
        if !self.pending.is_empty() {
            return Err(SearchError::BatchPending);
        }

        let visited = &self.visited;
        if !space.has_remaining(|id| visited.contains(id)) {
            self.finish(SearchPhase::Exhausted);
            return Ok(Vec::new());
        }

        let mut batch = match self.next_step(space)? {
            Step::Propose(batch) => batch,
            Step::Finish(phase) => {
                self.finish(phase);
                return Ok(Vec::new());
            }
        };
        if let Some(limit) = self.method.limit()
            && batch.len() > limit
        {
            debug!("Limiting batch of {} candidate(s) to {limit}", batch.len());
            batch.truncate(limit);
        }
        self.check_fresh(&batch, space)?;

        self.iteration += 1;
        self.phase = SearchPhase::Iterating;
        debug!(
            "Iteration {}: proposing {} model(s) ({})",
            self.iteration,
            batch.len(),
            self.method.name()
        );
        self.pending = batch.clone();
        Ok(batch)
    }

    fn next_step(&mut self, space: &ModelSpace) -> Result<Step, SearchError> {
        let visited = &self.visited;
        if let SearchMethod::BruteForce = self.method {
            let all = space.candidates_filtered(StrategyHint::All, |id| visited.contains(id));
            return Ok(Step::Propose(all));
        }

        let Some(incumbent) = self.incumbent.clone() else {
            let batch = self.initial_batch(space)?;
            return Ok(if batch.is_empty() {
                Step::Finish(SearchPhase::Exhausted)
            } else {
                Step::Propose(batch)
            });
        };

        let step = match self.method.clone() {
            SearchMethod::Forward(_) => self.stepwise_step(space, &incumbent, true),
            SearchMethod::Backward(_) => self.stepwise_step(space, &incumbent, false),
            SearchMethod::Famos(config) => self.famos_step(space, &incumbent, &config),
            SearchMethod::BruteForce => Step::Finish(SearchPhase::Converged),
        };
        Ok(step)
    }

    fn initial_batch(&self, space: &ModelSpace) -> Result<Vec<Model>, SearchError> {
        let visited = &self.visited;
        let skip = |id: &ModelId| visited.contains(id);

        let batch = match &self.initial {
            InitialModel::Minimal => space.candidates_filtered(StrategyHint::FewestEstimated, skip),
            InitialModel::Maximal => space.candidates_filtered(StrategyHint::MostEstimated, skip),
            InitialModel::Explicit {
                subspace,
                assignment,
            } => {
                let model = space.find(subspace, assignment)?;
                if skip(model.id()) || space.is_excluded(model.id()) {
                    Vec::new()
                } else {
                    vec![model]
                }
            }
            InitialModel::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                space
                    .sample(&mut rng, skip, RANDOM_START_ATTEMPTS)
                    .into_iter()
                    .collect()
            }
        };
        Ok(batch)
    }

    /// One-parameter additions (forward) or removals (backward).
    fn stepwise_step(&self, space: &ModelSpace, incumbent: &Model, forward: bool) -> Step {
        let k = incumbent.n_estimated();
        let target = if forward { Some(k + 1) } else { k.checked_sub(1) };
        let Some(target) = target else {
            // Already minimal.
            return Step::Finish(SearchPhase::Converged);
        };

        let mut batch: Vec<Model> = space
            .neighbors(incumbent, 1)
            .into_iter()
            .filter(|m| m.n_estimated() == target && !self.visited.contains(m.id()))
            .collect();
        space.sort_by_enumeration(&mut batch);
        if batch.is_empty() {
            Step::Finish(SearchPhase::Converged)
        } else {
            Step::Propose(batch)
        }
    }

    fn famos_step(&mut self, space: &ModelSpace, incumbent: &Model, config: &FamosConfig) -> Step {
        loop {
            let batch = self.famos_batch(space, incumbent, config);
            if !batch.is_empty() {
                return Step::Propose(batch);
            }
            // An empty neighbourhood is a non-improving step.
            debug!(
                "Empty neighbourhood (stall {}, jumps {})",
                self.famos.stall, self.famos.jumps
            );
            if let Some(phase) = self.famos_no_improvement(config) {
                return Step::Finish(phase);
            }
        }
    }

    fn famos_batch(&self, space: &ModelSpace, incumbent: &Model, config: &FamosConfig) -> Vec<Model> {
        let local = self.famos.jumps == 0;
        let radius = if local {
            1
        } else {
            (1 + self.famos.jumps).min(config.jump_radius)
        };

        let mut batch = space.neighbors(incumbent, radius);
        if local && config.swap_moves {
            let current = estimated_set(incumbent);
            batch.extend(
                space
                    .neighbors(incumbent, 2)
                    .into_iter()
                    .filter(|m| is_swap(&current, m)),
            );
        }

        batch.retain(|m| {
            !self.visited.contains(m.id())
                && !self.famos.swap_history.contains(&estimated_set(m))
        });
        space.sort_by_enumeration(&mut batch);
        batch
    }

    /// Advance stall and jump counters. Returns the terminal phase, if any.
    fn famos_no_improvement(&mut self, config: &FamosConfig) -> Option<SearchPhase> {
        let state = &mut self.famos;
        if state.jumps == 0 {
            state.stall += 1;
            if state.stall > config.stall_budget {
                if config.retry_budget == 0 {
                    return Some(SearchPhase::Converged);
                }
                state.jumps = 1;
                debug!("Stalled for {} iteration(s), widening neighbourhood", state.stall);
            }
        } else {
            state.jumps += 1;
            if state.jumps > config.retry_budget {
                warn!("No improvement after {} jump(s)", config.retry_budget);
                return Some(SearchPhase::Stalled);
            }
        }
        None
    }

    /// Reject proposals already visited, excluded, or repeated in `batch`.
    fn check_fresh(&self, batch: &[Model], space: &ModelSpace) -> Result<(), SearchError> {
        let mut seen = HashSet::with_capacity(batch.len());
        for model in batch {
            let id = model.id();
            if self.visited.contains(id) || space.is_excluded(id) || !seen.insert(id) {
                return Err(SearchError::DuplicateProposal(id.clone()));
            }
        }
        Ok(())
    }

    /// Feed back the outcomes of the pending batch.
    ///
    /// The whole batch is validated before any state changes. Pending models
    /// without an outcome count as failed.
    pub fn update_results(
        &mut self,
        outcomes: &[CalibrationOutcome],
    ) -> Result<BatchSummary, SearchError> {
        if self.pending.is_empty() {
            return Err(SearchError::NoPendingBatch);
        }

        let position: HashMap<&ModelId, usize> = self
            .pending
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id(), i))
            .collect();
        let mut slots: Vec<Option<&CalibrationOutcome>> = vec![None; self.pending.len()];
        for outcome in outcomes {
            let id = outcome.model_id();
            let i = *position
                .get(id)
                .ok_or_else(|| SearchError::UnexpectedResult(id.clone()))?;
            if slots[i].replace(outcome).is_some() {
                return Err(SearchError::UnexpectedResult(id.clone()));
            }
        }

        // Batch order, not report order, decides ties.
        let mut calibrated: Vec<&Model> = Vec::new();
        let mut failed: Vec<ModelId> = Vec::new();
        for (model, slot) in self.pending.iter().zip(&slots) {
            match slot {
                Some(CalibrationOutcome::Calibrated(m)) => {
                    let consistent = m
                        .get_criterion(self.criterion)
                        .is_ok_and(|v| v.kind == self.criterion);
                    if !consistent {
                        return Err(SearchError::InconsistentCriterion {
                            model: m.id().clone(),
                            expected: self.criterion,
                        });
                    }
                    calibrated.push(m);
                }
                Some(CalibrationOutcome::Failed(_)) | None => failed.push(model.id().clone()),
            }
        }

        let best = select_best(calibrated.iter().copied(), self.criterion)?;
        let improved = match (best, &self.incumbent) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(best), Some(incumbent)) => match self.method {
                SearchMethod::BruteForce => rank(best, incumbent, self.criterion)? == Ordering::Less,
                _ => best.get_criterion(self.criterion)?.is_improvement(
                    incumbent.get_criterion(self.criterion)?,
                    self.method.tolerance(),
                )?,
            },
        };
        let best = best.cloned();
        let n_calibrated = calibrated.len();

        // Validated; apply.
        let pending = std::mem::take(&mut self.pending);
        self.visited.extend(pending.iter().map(|m| m.id().clone()));
        self.failed.extend(failed.iter().cloned());

        let next = if n_calibrated == 0 {
            warn!(
                "Every calibration in iteration {} failed, no progress possible",
                self.iteration
            );
            Some(SearchPhase::Stalled)
        } else if improved {
            if let Some(best) = &best {
                self.accept(best.clone());
            }
            match self.method {
                SearchMethod::BruteForce => Some(SearchPhase::Converged),
                _ => None,
            }
        } else {
            match self.method.clone() {
                SearchMethod::Famos(config) => self.famos_no_improvement(&config),
                _ => Some(SearchPhase::Converged),
            }
        };
        if let Some(phase) = next {
            self.finish(phase);
        }

        Ok(BatchSummary {
            iteration: self.iteration,
            calibrated: n_calibrated,
            failed,
            best: best.map(|m| m.id().clone()),
            improved,
            phase: self.phase,
        })
    }

    fn accept(&mut self, model: Model) {
        if let Ok(value) = model.get_criterion(self.criterion) {
            info!(
                "Iteration {}: new incumbent {} ({} = {:.4}, {} estimated)",
                self.iteration,
                model.id().short(),
                self.criterion,
                value.value,
                model.n_estimated()
            );
        }
        self.history.push(model.id().clone());

        let previous = self.incumbent.replace(model);
        if let SearchMethod::Famos(config) = &self.method {
            self.famos.stall = 0;
            self.famos.jumps = 0;
            if let Some(previous) = previous
                && config.swap_memory > 0
            {
                self.famos.swap_history.push_back(estimated_set(&previous));
                while self.famos.swap_history.len() > config.swap_memory {
                    self.famos.swap_history.pop_front();
                }
            }
        }
    }

    fn finish(&mut self, phase: SearchPhase) {
        if self.phase.is_terminal() {
            return;
        }
        info!("Search {} after {} iteration(s)", phase, self.iteration);
        self.phase = phase;
    }

    /// Make failed models proposable again.
    ///
    /// When anything was cleared from a terminated search, the current run
    /// ends here and the next run starts from the incumbent with fresh stall
    /// and jump counters. The terminal phase of a run is never revisited.
    /// Returns the number of models cleared.
    pub fn retry_failed(&mut self) -> Result<usize, SearchError> {
        if !self.pending.is_empty() {
            return Err(SearchError::BatchPending);
        }

        let failed = std::mem::take(&mut self.failed);
        for id in &failed {
            self.visited.remove(id);
        }
        if !failed.is_empty() && self.phase.is_terminal() {
            self.run += 1;
            self.phase = if self.incumbent.is_some() {
                SearchPhase::Iterating
            } else {
                SearchPhase::Initialized
            };
            self.famos.stall = 0;
            self.famos.jumps = 0;
            info!(
                "Starting run {} to retry {} failed model(s)",
                self.run,
                failed.len()
            );
        }
        Ok(failed.len())
    }
}

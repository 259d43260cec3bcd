//! Problem orchestrator: the propose, calibrate, update loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;

use crate::checkpoint::{CHECKPOINT_VERSION, Checkpoint, CheckpointStore};
use crate::schema::{
    InitialModel, LedgerEntry, LedgerStatus, ProblemConfig, SearchPhase,
    SearchProgress, SearchResult, SearchStats, StopReason,
};

use super::calibrator::{CalibrationOutcome, Calibrator, calibrate_batch};
use super::candidate::{BatchSummary, CandidateSpace, SearchError, rank};
use super::model::{Model, ModelId};
use super::space::ModelSpace;

/// A model selection problem and its search state.
pub struct Problem {
    config: ProblemConfig,
    space: ModelSpace,
    candidates: CandidateSpace,
    ledger: Vec<LedgerEntry>,
    /// Calibrated models by identifier.
    models: BTreeMap<ModelId, Model>,
    last_batch: (usize, usize),
    cancelled: Arc<AtomicBool>,
    store: Option<CheckpointStore>,
}

impl Problem {
    /// Validate `config` and set up a fresh search.
    pub fn new(config: ProblemConfig) -> Result<Self, SearchError> {
        config.validate()?;
        let space = ModelSpace::from_config(&config)?;

        // Surface a bad starting point before any iteration.
        if let InitialModel::Explicit {
            subspace,
            assignment,
        } = config.method.initial_model()
        {
            space.find(&subspace, &assignment)?;
        }

        let candidates = CandidateSpace::new(config.method.clone(), config.criterion);
        info!(
            "Problem with {} subspace(s), {} model(s) before deduplication, {} search on {}",
            space.all_subspaces().len(),
            space.total_size(),
            config.method.name(),
            config.criterion
        );

        Ok(Self {
            config,
            space,
            candidates,
            ledger: Vec::new(),
            models: BTreeMap::new(),
            last_batch: (0, 0),
            cancelled: Arc::new(AtomicBool::new(false)),
            store: None,
        })
    }

    /// Resume from `checkpoint`, which must have been written for `config`.
    pub fn resume(config: ProblemConfig, checkpoint: Checkpoint) -> Result<Self, SearchError> {
        checkpoint.verify(&config)?;
        let mut problem = Self::new(config)?;

        for id in &checkpoint.excluded {
            problem.space.exclude(id);
        }
        problem.candidates = checkpoint.candidates;
        problem.ledger = checkpoint.ledger;
        problem.models = checkpoint
            .models
            .into_iter()
            .map(|m| (m.id().clone(), m))
            .collect();

        info!(
            "Resumed at iteration {} ({} excluded, phase {})",
            checkpoint.iteration,
            problem.space.excluded().len(),
            problem.candidates.phase()
        );
        Ok(problem)
    }

    /// Resume from the store's checkpoint if there is one, and keep
    /// checkpointing into it after every iteration.
    pub fn open(config: ProblemConfig, store: CheckpointStore) -> Result<Self, SearchError> {
        let problem = match store.load()? {
            Some(checkpoint) => Self::resume(config, checkpoint)?,
            None => Self::new(config)?,
        };
        Ok(problem.with_checkpoint_store(store))
    }

    /// Checkpoint into `store` after every iteration.
    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn config(&self) -> &ProblemConfig {
        &self.config
    }

    pub fn model_space(&self) -> &ModelSpace {
        &self.space
    }

    pub fn candidate_space(&self) -> &CandidateSpace {
        &self.candidates
    }

    pub fn phase(&self) -> SearchPhase {
        self.candidates.phase()
    }

    pub fn incumbent(&self) -> Option<&Model> {
        self.candidates.incumbent()
    }

    /// Every calibration attempt so far, in proposal order.
    pub fn ledger(&self) -> &[LedgerEntry] {
        &self.ledger
    }

    /// Calibrated model by identifier.
    pub fn model(&self, id: &ModelId) -> Option<&Model> {
        self.models.get(id)
    }

    /// Next batch to calibrate. Empty once the search has terminated.
    pub fn propose(&mut self) -> Result<Vec<Model>, SearchError> {
        self.candidates.propose_next_batch(&self.space)
    }

    /// Report outcomes for the batch returned by [`propose`](Self::propose).
    ///
    /// Calibrated models are excluded from the space and recorded; failed
    /// ones are recorded but stay eligible for [`retry_failed`](Self::retry_failed).
    pub fn submit(&mut self, outcomes: &[CalibrationOutcome]) -> Result<BatchSummary, SearchError> {
        let iteration = self.candidates.iteration();
        let batch = self.candidates.pending().to_vec();
        let predecessor = self.candidates.incumbent().map(|m| m.id().clone());
        let summary = self.candidates.update_results(outcomes)?;

        let by_id: BTreeMap<&ModelId, &CalibrationOutcome> =
            outcomes.iter().map(|o| (o.model_id(), o)).collect();
        for model in &batch {
            let (criterion, status) = match by_id.get(model.id()) {
                Some(CalibrationOutcome::Calibrated(calibrated)) => {
                    self.space.exclude(calibrated.id());
                    self.models
                        .insert(calibrated.id().clone(), calibrated.clone());
                    let value = calibrated.get_criterion(self.config.criterion).ok().copied();
                    (value, LedgerStatus::Calibrated)
                }
                Some(CalibrationOutcome::Failed(failure)) => (
                    None,
                    LedgerStatus::Failed {
                        reason: failure.reason.clone(),
                    },
                ),
                None => (
                    None,
                    LedgerStatus::Failed {
                        reason: "no result reported".to_string(),
                    },
                ),
            };
            self.ledger.push(LedgerEntry {
                iteration,
                model: model.id().clone(),
                subspace: model.subspace_id().to_string(),
                n_estimated: model.n_estimated(),
                criterion,
                status,
                predecessor: predecessor.clone(),
            });
        }

        self.last_batch = (batch.len(), summary.failed.len());
        Ok(summary)
    }

    /// Propose, calibrate and report one batch. `None` once terminated.
    pub fn run_one_iteration<C: Calibrator + ?Sized>(
        &mut self,
        calibrator: &C,
    ) -> Result<Option<BatchSummary>, SearchError> {
        let batch = self.propose()?;
        if batch.is_empty() {
            self.save_checkpoint()?;
            return Ok(None);
        }

        let outcomes = calibrate_batch(calibrator, &batch, self.config.criterion);
        let summary = self.submit(&outcomes)?;
        info!(
            "Iteration {}: {} calibrated, {} failed, phase {}",
            summary.iteration,
            summary.calibrated,
            summary.failed.len(),
            summary.phase
        );
        self.save_checkpoint()?;
        Ok(Some(summary))
    }

    /// Check if the loop should stop.
    fn should_stop(&self) -> Option<StopReason> {
        if let Some(reason) = StopReason::from_phase(self.candidates.phase()) {
            return Some(reason);
        }

        if self.cancelled.load(Ordering::Relaxed) {
            return Some(StopReason::Cancelled);
        }

        if let Some(limit) = self.config.limits.max_iterations
            && self.candidates.iteration() >= limit
        {
            return Some(StopReason::IterationLimit);
        }

        None
    }

    /// Run the search with a progress callback after every iteration.
    pub fn run_with_callback<C, F>(
        &mut self,
        calibrator: &C,
        callback: F,
    ) -> Result<SearchResult, SearchError>
    where
        C: Calibrator + ?Sized,
        F: Fn(&SearchProgress),
    {
        let start_time = std::time::Instant::now();

        let stop_reason = loop {
            if let Some(reason) = self.should_stop() {
                break reason;
            }
            if self.run_one_iteration(calibrator)?.is_some() {
                callback(&self.progress());
            }
        };

        let elapsed = start_time.elapsed().as_secs_f64();
        info!("Search stopped ({stop_reason:?}) after {elapsed:.2}s");
        Ok(self.result(stop_reason, elapsed))
    }

    /// Run the search until it terminates, is cancelled, or hits the
    /// iteration limit.
    pub fn run_to_completion<C: Calibrator + ?Sized>(
        &mut self,
        calibrator: &C,
    ) -> Result<SearchResult, SearchError> {
        self.run_with_callback(calibrator, |_| {})
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> SearchProgress {
        let incumbent = self.candidates.incumbent();
        SearchProgress {
            iteration: self.candidates.iteration(),
            phase: self.candidates.phase(),
            batch_size: self.last_batch.0,
            batch_failures: self.last_batch.1,
            incumbent: incumbent.map(|m| m.id().clone()),
            incumbent_value: incumbent
                .and_then(|m| m.get_criterion(self.config.criterion).ok())
                .map(|v| v.value),
            excluded: self.space.excluded().len(),
            evaluated: self.ledger.len(),
        }
    }

    fn result(&self, stop_reason: StopReason, elapsed_seconds: f64) -> SearchResult {
        let calibrated = self.ledger.iter().filter(|e| e.is_calibrated()).count();
        SearchResult {
            phase: self.candidates.phase(),
            incumbent: self.candidates.incumbent().cloned(),
            ledger: self.ledger.clone(),
            stats: SearchStats {
                iterations: self.candidates.iteration(),
                calibrated,
                failed: self.ledger.len() - calibrated,
                elapsed_seconds,
                stop_reason,
            },
        }
    }

    /// Top `n` calibrated models by the configured criterion, with the
    /// batch tie-break (fewer estimated parameters, then enumerated first).
    pub fn best_models(&self, n: usize) -> Result<Vec<&Model>, SearchError> {
        let kind = self.config.criterion;
        let mut models: Vec<&Model> = self
            .ledger
            .iter()
            .filter(|e| e.is_calibrated())
            .filter_map(|e| self.models.get(&e.model))
            .collect();

        // Surface incomparable values before sorting.
        if let Some(first) = models.first() {
            for model in &models[1..] {
                rank(model, first, kind)?;
            }
        }
        models.sort_by(|a, b| {
            rank(a, b, kind)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    self.space
                        .enumeration_key(a)
                        .cmp(&self.space.enumeration_key(b))
                })
        });
        models.truncate(n);
        Ok(models)
    }

    /// Make failed models proposable again. Returns how many.
    ///
    /// If the search had terminated, this closes the run: the next call to
    /// [`run_to_completion`](Self::run_to_completion) starts a new run from
    /// the incumbent, and ledger rows keep their original iterations.
    pub fn retry_failed(&mut self) -> Result<usize, SearchError> {
        self.candidates.retry_failed()
    }

    /// Snapshot of the resumable state.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            config_fingerprint: self.config.fingerprint(),
            iteration: self.candidates.iteration(),
            excluded: self.space.excluded().clone(),
            candidates: self.candidates.clone(),
            ledger: self.ledger.clone(),
            models: self
                .ledger
                .iter()
                .filter_map(|e| self.models.get(&e.model))
                .cloned()
                .collect(),
        }
    }

    fn save_checkpoint(&self) -> Result<(), SearchError> {
        if let Some(store) = &self.store {
            store.save(&self.checkpoint())?;
        }
        Ok(())
    }
}

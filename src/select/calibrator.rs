//! External calibration contract and batch dispatch.
//!
//! Calibrating distinct models shares no mutable state, so a batch is
//! dispatched in parallel on native targets. Outcomes are always returned in
//! batch order.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use rand::prelude::*;
use rand_distr::Normal;
#[cfg(not(target_arch = "wasm32"))]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::{CriterionKind, ParameterValue};

use super::criterion::CriterionValue;
use super::model::{Model, ModelId};

/// Raw output of a successful calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCalibration {
    /// Fitted value per estimated parameter.
    pub estimated: BTreeMap<String, f64>,
    /// Negative log-likelihood at the optimum.
    pub nllh: f64,
    /// Number of data points the model was fitted to.
    pub n_data: usize,
}

/// A calibration that did not produce a usable result.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("Calibration of model {model} failed: {reason}")]
pub struct CalibrationFailure {
    pub model: ModelId,
    pub reason: String,
}

impl CalibrationFailure {
    pub fn new(model: &Model, reason: impl Into<String>) -> Self {
        Self {
            model: model.id().clone(),
            reason: reason.into(),
        }
    }
}

/// Result of calibrating one proposed model.
#[derive(Debug, Clone)]
pub enum CalibrationOutcome {
    /// The model with its calibration attached.
    Calibrated(Model),
    /// Attempted but uncalibrated.
    Failed(CalibrationFailure),
}

impl CalibrationOutcome {
    pub fn model_id(&self) -> &ModelId {
        match self {
            CalibrationOutcome::Calibrated(m) => m.id(),
            CalibrationOutcome::Failed(f) => &f.model,
        }
    }
}

/// External parameter estimation.
pub trait Calibrator: Send + Sync {
    /// Calibrate one model.
    fn calibrate(&self, model: &Model) -> Result<RawCalibration, CalibrationFailure>;
}

impl<F> Calibrator for F
where
    F: Fn(&Model) -> Result<RawCalibration, CalibrationFailure> + Send + Sync,
{
    fn calibrate(&self, model: &Model) -> Result<RawCalibration, CalibrationFailure> {
        self(model)
    }
}

/// Turn a raw calibration into a calibrated model.
///
/// Every criterion kind that can be computed is attached; the ranking kind
/// must be among them or the calibration counts as failed.
pub fn finalize(
    model: &Model,
    raw: RawCalibration,
    ranking: CriterionKind,
) -> CalibrationOutcome {
    let k = model.n_estimated();
    let mut criteria = BTreeMap::new();
    for kind in CriterionKind::ALL {
        match CriterionValue::compute(kind, raw.nllh, k, raw.n_data) {
            Ok(value) => {
                criteria.insert(kind, value);
            }
            Err(e) if kind == ranking => {
                return CalibrationOutcome::Failed(CalibrationFailure::new(model, e.to_string()));
            }
            Err(e) => debug!("Skipping {kind} for model {}: {e}", model.id().short()),
        }
    }

    let mut calibrated = model.uncalibrated();
    match calibrated.attach_result(raw.estimated, criteria) {
        Ok(()) => CalibrationOutcome::Calibrated(calibrated),
        Err(e) => CalibrationOutcome::Failed(CalibrationFailure::new(model, e.to_string())),
    }
}

fn calibrate_one<C: Calibrator + ?Sized>(
    calibrator: &C,
    model: &Model,
    ranking: CriterionKind,
) -> CalibrationOutcome {
    match calibrator.calibrate(model) {
        Ok(raw) => finalize(model, raw, ranking),
        Err(failure) => {
            warn!("{failure}");
            CalibrationOutcome::Failed(failure)
        }
    }
}

/// Calibrate every model of a batch.
#[cfg(not(target_arch = "wasm32"))]
pub fn calibrate_batch<C: Calibrator + ?Sized>(
    calibrator: &C,
    batch: &[Model],
    ranking: CriterionKind,
) -> Vec<CalibrationOutcome> {
    // Parallel calibration; collect keeps batch order.
    batch
        .par_iter()
        .map(|model| calibrate_one(calibrator, model, ranking))
        .collect()
}

#[cfg(target_arch = "wasm32")]
pub fn calibrate_batch<C: Calibrator + ?Sized>(
    calibrator: &C,
    batch: &[Model],
    ranking: CriterionKind,
) -> Vec<CalibrationOutcome> {
    // Sequential calibration for WASM
    batch
        .iter()
        .map(|model| calibrate_one(calibrator, model, ranking))
        .collect()
}

/// Deterministic stand-in calibrator with known criterion landscape.
///
/// NLLH = `baseline` + sum of `effects` of the estimated parameters +
/// sum of `interactions` whose parameters are all estimated + optional
/// Gaussian noise. Noise and fitted values are seeded from `seed` and the
/// model identifier, so every model always gets the same result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticCalibrator {
    pub baseline: f64,
    #[serde(default)]
    pub effects: BTreeMap<String, f64>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    #[serde(default)]
    pub noise_sd: f64,
    #[serde(default)]
    pub seed: u64,
    pub n_data: usize,
    /// Models that fail to calibrate.
    #[serde(default)]
    pub failing: BTreeSet<ModelId>,
}

/// Joint effect applied when every listed parameter is estimated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub parameters: Vec<String>,
    pub effect: f64,
}

impl SyntheticCalibrator {
    pub fn new(baseline: f64, n_data: usize) -> Self {
        Self {
            baseline,
            effects: BTreeMap::new(),
            interactions: Vec::new(),
            noise_sd: 0.0,
            seed: 0,
            n_data,
            failing: BTreeSet::new(),
        }
    }

    pub fn with_effect(mut self, parameter: impl Into<String>, effect: f64) -> Self {
        self.effects.insert(parameter.into(), effect);
        self
    }

    pub fn with_interaction(mut self, parameters: &[&str], effect: f64) -> Self {
        self.interactions.push(Interaction {
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            effect,
        });
        self
    }

    pub fn with_noise(mut self, noise_sd: f64, seed: u64) -> Self {
        self.noise_sd = noise_sd;
        self.seed = seed;
        self
    }

    pub fn failing(mut self, model: &ModelId) -> Self {
        self.failing.insert(model.clone());
        self
    }

    /// Noise-free NLLH of `model`.
    pub fn expected_nllh(&self, model: &Model) -> f64 {
        let estimated: BTreeSet<&str> = model.estimated_parameters().collect();
        let main: f64 = estimated
            .iter()
            .filter_map(|p| self.effects.get(*p))
            .sum();
        let joint: f64 = self
            .interactions
            .iter()
            .filter(|i| i.parameters.iter().all(|p| estimated.contains(p.as_str())))
            .map(|i| i.effect)
            .sum();
        self.baseline + main + joint
    }
}

impl Calibrator for SyntheticCalibrator {
    fn calibrate(&self, model: &Model) -> Result<RawCalibration, CalibrationFailure> {
        if self.failing.contains(model.id()) {
            return Err(CalibrationFailure::new(model, "optimizer did not converge"));
        }

        let mut rng = StdRng::seed_from_u64(self.seed ^ model.id().seed());
        let noise = if self.noise_sd > 0.0 {
            let normal = Normal::new(0.0, self.noise_sd)
                .map_err(|e| CalibrationFailure::new(model, e.to_string()))?;
            normal.sample(&mut rng)
        } else {
            0.0
        };
        let estimated = model
            .estimated_parameters()
            .map(|p| (p.to_string(), rng.gen_range(-1.0..1.0)))
            .collect();

        Ok(RawCalibration {
            estimated,
            nllh: self.expected_nllh(model) + noise,
            n_data: self.n_data,
        })
    }
}

/// One precomputed calibration, matched by base structure and assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    pub base: String,
    pub assignment: BTreeMap<String, ParameterValue>,
    /// `None` records a known calibration failure.
    pub nllh: Option<f64>,
    pub n_data: usize,
    #[serde(default)]
    pub estimated: BTreeMap<String, f64>,
}

/// Replays calibrations from a table, e.g. results of an earlier run.
#[derive(Debug, Clone, Default)]
pub struct TableCalibrator {
    entries: BTreeMap<ModelId, TableEntry>,
}

impl TableCalibrator {
    pub fn new(entries: Vec<TableEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| {
                let id = ModelId::derive(&e.base, e.assignment.iter().map(|(k, v)| (k.as_str(), v)));
                (id, e)
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Calibrator for TableCalibrator {
    fn calibrate(&self, model: &Model) -> Result<RawCalibration, CalibrationFailure> {
        let entry = self
            .entries
            .get(model.id())
            .ok_or_else(|| CalibrationFailure::new(model, "no calibration recorded"))?;
        let nllh = entry
            .nllh
            .ok_or_else(|| CalibrationFailure::new(model, "recorded as failed"))?;

        // Tables may omit fitted values; fall back to zeros.
        let estimated = model
            .estimated_parameters()
            .map(|p| (p.to_string(), entry.estimated.get(p).copied().unwrap_or(0.0)))
            .collect();

        Ok(RawCalibration {
            estimated,
            nllh,
            n_data: entry.n_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AxisSpec, SubspaceSpec};
    use crate::select::subspace::ModelSubspace;

    fn subspace() -> ModelSubspace {
        ModelSubspace::from_spec(&SubspaceSpec {
            id: "s".to_string(),
            base: "base".to_string(),
            dataset: None,
            axes: vec![AxisSpec::toggle("a", 0.0), AxisSpec::toggle("b", 0.0)],
        })
        .unwrap()
    }

    #[test]
    fn test_synthetic_landscape() {
        let s = subspace();
        let calibrator = SyntheticCalibrator::new(100.0, 50)
            .with_effect("a", -10.0)
            .with_effect("b", -1.0)
            .with_interaction(&["a", "b"], -5.0);

        let full = s.model_at(3).unwrap();
        assert_eq!(calibrator.expected_nllh(&full), 84.0);
        assert_eq!(calibrator.expected_nllh(&s.model_at(0).unwrap()), 100.0);

        let raw = calibrator.calibrate(&full).unwrap();
        assert_eq!(raw.nllh, 84.0);
        assert_eq!(raw.estimated.len(), 2);
    }

    #[test]
    fn test_synthetic_noise_is_deterministic() {
        let s = subspace();
        let calibrator = SyntheticCalibrator::new(100.0, 50).with_noise(1.0, 7);
        let m = s.model_at(1).unwrap();
        assert_eq!(calibrator.calibrate(&m), calibrator.calibrate(&m));
    }

    #[test]
    fn test_batch_keeps_order_and_failures() {
        let s = subspace();
        let batch: Vec<Model> = s.enumerate(None).collect();
        let calibrator = SyntheticCalibrator::new(100.0, 50).failing(batch[2].id());

        let outcomes = calibrate_batch(&calibrator, &batch, CriterionKind::Aic);
        assert_eq!(outcomes.len(), 4);
        for (outcome, model) in outcomes.iter().zip(&batch) {
            assert_eq!(outcome.model_id(), model.id());
        }
        assert!(matches!(outcomes[2], CalibrationOutcome::Failed(_)));
        let CalibrationOutcome::Calibrated(m) = &outcomes[3] else {
            panic!("expected calibration");
        };
        assert_eq!(m.get_criterion(CriterionKind::Aic).unwrap().value, 204.0);
        assert!(m.get_criterion(CriterionKind::Bic).is_ok());
    }

    #[test]
    fn test_uncomputable_ranking_criterion_fails() {
        let s = subspace();
        let full = s.model_at(3).unwrap();
        // AICc needs n > k + 1.
        let raw = RawCalibration {
            estimated: BTreeMap::from([("a".to_string(), 0.0), ("b".to_string(), 0.0)]),
            nllh: 1.0,
            n_data: 3,
        };
        assert!(matches!(
            finalize(&full, raw.clone(), CriterionKind::Aicc),
            CalibrationOutcome::Failed(_)
        ));
        let CalibrationOutcome::Calibrated(m) = finalize(&full, raw, CriterionKind::Aic) else {
            panic!("expected calibration");
        };
        assert!(m.get_criterion(CriterionKind::Aicc).is_err());
    }

    #[test]
    fn test_table_calibrator() {
        let s = subspace();
        let m = s.model_at(2).unwrap();
        let table = TableCalibrator::new(vec![
            TableEntry {
                base: "base".to_string(),
                assignment: m.assignment().clone(),
                nllh: Some(12.5),
                n_data: 20,
                estimated: BTreeMap::new(),
            },
            TableEntry {
                base: "base".to_string(),
                assignment: s.model_at(0).unwrap().assignment().clone(),
                nllh: None,
                n_data: 20,
                estimated: BTreeMap::new(),
            },
        ]);
        assert_eq!(table.len(), 2);

        let raw = table.calibrate(&m).unwrap();
        assert_eq!(raw.nllh, 12.5);
        assert_eq!(raw.estimated.get("a"), Some(&0.0));

        assert!(table.calibrate(&s.model_at(0).unwrap()).is_err());
        assert!(table.calibrate(&s.model_at(1).unwrap()).is_err());
    }

    #[test]
    fn test_closure_calibrator() {
        let s = subspace();
        let calibrator = |model: &Model| -> Result<RawCalibration, CalibrationFailure> {
            Err(CalibrationFailure::new(model, "always fails"))
        };
        let outcomes = calibrate_batch(&calibrator, &[s.model_at(0).unwrap()], CriterionKind::Aic);
        assert!(matches!(outcomes[0], CalibrationOutcome::Failed(_)));
    }
}

//! Fully specified candidate models and their calibration records.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::schema::{CriterionKind, ParameterValue};

use super::criterion::CriterionValue;

/// Domain separator for model identifiers.
const MODEL_ID_DOMAIN: &[u8] = b"model-select/model/v1";

/// Deterministic model identifier.
///
/// A pure function of the base structure and the parameter assignment, and
/// independent of the order parameters are listed in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    /// Derive the identifier of `assignment` on top of `base`.
    pub fn derive<'a, I>(base: &str, assignment: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a ParameterValue)>,
    {
        let mut sorted: Vec<(&str, &ParameterValue)> = assignment.into_iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        let mut hasher = blake3::Hasher::new();
        hasher.update(MODEL_ID_DOMAIN);
        hasher.update(&(base.len() as u64).to_le_bytes());
        hasher.update(base.as_bytes());
        for (name, value) in sorted {
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&value.canonical_bytes());
        }
        let hex = hasher.finalize().to_hex();
        // 128 bits is plenty for any enumerable space.
        Self(hex[..32].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }

    /// Leading 64 bits, usable as a per-model RNG seed.
    pub fn seed(&self) -> u64 {
        u64::from_str_radix(&self.0[..self.0.len().min(16)], 16).unwrap_or(0)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Fitted values of the estimated parameters.
    pub estimated: BTreeMap<String, f64>,
    /// Criterion values, one per kind that could be computed.
    pub criteria: BTreeMap<CriterionKind, CriterionValue>,
}

/// Model contract violations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("Model {model} has no {kind} value (not calibrated)")]
    NotCalibrated { model: ModelId, kind: CriterionKind },
    #[error("Model {0} is already calibrated with different results")]
    AlreadyCalibrated(ModelId),
    #[error("Estimates for model {model} do not match its estimated parameters: {detail}")]
    EstimateMismatch { model: ModelId, detail: String },
}

/// A candidate model: base structure plus a concrete parameter assignment.
///
/// Equality and hashing use the identifier only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    id: ModelId,
    /// Subspace that first generated this model.
    subspace: String,
    base: String,
    /// Domain index per axis of the generating subspace.
    indices: Vec<usize>,
    assignment: BTreeMap<String, ParameterValue>,
    #[serde(default)]
    calibration: Option<Calibration>,
}

impl Model {
    pub(crate) fn new(
        subspace: &str,
        base: &str,
        indices: Vec<usize>,
        assignment: BTreeMap<String, ParameterValue>,
    ) -> Self {
        let id = ModelId::derive(base, assignment.iter().map(|(k, v)| (k.as_str(), v)));
        Self {
            id,
            subspace: subspace.to_string(),
            base: base.to_string(),
            indices,
            assignment,
            calibration: None,
        }
    }

    #[inline]
    pub fn id(&self) -> &ModelId {
        &self.id
    }

    pub fn subspace_id(&self) -> &str {
        &self.subspace
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn assignment(&self) -> &BTreeMap<String, ParameterValue> {
        &self.assignment
    }

    pub fn value(&self, parameter: &str) -> Option<ParameterValue> {
        self.assignment.get(parameter).copied()
    }

    /// Names of the estimated parameters, sorted.
    pub fn estimated_parameters(&self) -> impl Iterator<Item = &str> {
        self.assignment
            .iter()
            .filter(|(_, v)| v.is_estimated())
            .map(|(k, _)| k.as_str())
    }

    pub fn n_estimated(&self) -> usize {
        self.assignment.values().filter(|v| v.is_estimated()).count()
    }

    /// Number of parameters whose values differ. `None` across bases or
    /// parameter sets, where no such distance exists.
    pub fn distance(&self, other: &Model) -> Option<usize> {
        if self.base != other.base || self.assignment.len() != other.assignment.len() {
            return None;
        }
        let mut changed = 0;
        for (name, value) in &self.assignment {
            let theirs = other.assignment.get(name)?;
            if !value.same_as(theirs) {
                changed += 1;
            }
        }
        Some(changed)
    }

    #[inline]
    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    /// Attach a calibration result.
    ///
    /// Attaching the identical result again is a no-op; a conflicting one is
    /// rejected, the stored result is never overwritten.
    pub fn attach_result(
        &mut self,
        estimated: BTreeMap<String, f64>,
        criteria: BTreeMap<CriterionKind, CriterionValue>,
    ) -> Result<(), ModelError> {
        let calibration = Calibration {
            estimated,
            criteria,
        };

        if let Some(existing) = &self.calibration {
            return if *existing == calibration {
                Ok(())
            } else {
                Err(ModelError::AlreadyCalibrated(self.id.clone()))
            };
        }

        for name in calibration.estimated.keys() {
            if !self.value(name).is_some_and(|v| v.is_estimated()) {
                return Err(ModelError::EstimateMismatch {
                    model: self.id.clone(),
                    detail: format!("{name:?} is not an estimated parameter"),
                });
            }
        }
        if let Some(missing) = self
            .estimated_parameters()
            .find(|name| !calibration.estimated.contains_key(*name))
        {
            return Err(ModelError::EstimateMismatch {
                model: self.id.clone(),
                detail: format!("no estimate for {missing:?}"),
            });
        }

        self.calibration = Some(calibration);
        Ok(())
    }

    /// Criterion value of `kind`.
    pub fn get_criterion(&self, kind: CriterionKind) -> Result<&CriterionValue, ModelError> {
        self.calibration
            .as_ref()
            .and_then(|c| c.criteria.get(&kind))
            .ok_or_else(|| ModelError::NotCalibrated {
                model: self.id.clone(),
                kind,
            })
    }

    /// Copy of this model with no calibration attached.
    pub fn uncalibrated(&self) -> Model {
        Model {
            calibration: None,
            ..self.clone()
        }
    }

    /// Compact `name=value` rendering of the assignment.
    pub fn label(&self) -> String {
        let parts: Vec<String> = self
            .assignment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}[{}]", self.base, parts.join(","))
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Model {}

impl Hash for Model {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assignment(pairs: &[(&str, ParameterValue)]) -> BTreeMap<String, ParameterValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn model() -> Model {
        Model::new(
            "s1",
            "base",
            vec![1, 0],
            assignment(&[
                ("k1", ParameterValue::Estimated),
                ("k2", ParameterValue::Fixed(0.0)),
            ]),
        )
    }

    fn criteria(value: f64) -> BTreeMap<CriterionKind, CriterionValue> {
        let v = CriterionValue::compute(CriterionKind::Aic, value, 1, 10).unwrap();
        BTreeMap::from([(CriterionKind::Aic, v)])
    }

    #[test]
    fn test_identity_is_order_independent() {
        let a = ModelId::derive(
            "base",
            [
                ("k1", &ParameterValue::Estimated),
                ("k2", &ParameterValue::Fixed(1.0)),
            ],
        );
        let b = ModelId::derive(
            "base",
            [
                ("k2", &ParameterValue::Fixed(1.0)),
                ("k1", &ParameterValue::Estimated),
            ],
        );
        assert_eq!(a, b);

        let other_base = ModelId::derive(
            "other",
            [
                ("k1", &ParameterValue::Estimated),
                ("k2", &ParameterValue::Fixed(1.0)),
            ],
        );
        assert_ne!(a, other_base);
    }

    #[test]
    fn test_identity_ignores_subspace() {
        let a = model();
        let b = Model::new("s2", "base", vec![0, 3], a.assignment().clone());
        assert_eq!(a, b);

        let set: HashSet<Model> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_attach_result_idempotent() {
        let mut m = model();
        let estimated = BTreeMap::from([("k1".to_string(), 0.5)]);
        m.attach_result(estimated.clone(), criteria(3.0)).unwrap();
        let stored = m.calibration().cloned();

        m.attach_result(estimated.clone(), criteria(3.0)).unwrap();
        assert_eq!(m.calibration().cloned(), stored);

        let err = m.attach_result(estimated, criteria(4.0)).unwrap_err();
        assert_eq!(err, ModelError::AlreadyCalibrated(m.id().clone()));
        assert_eq!(m.calibration().cloned(), stored);
    }

    #[test]
    fn test_attach_result_checks_estimates() {
        let mut m = model();
        let err = m
            .attach_result(BTreeMap::from([("k2".to_string(), 1.0)]), criteria(3.0))
            .unwrap_err();
        assert!(matches!(err, ModelError::EstimateMismatch { .. }));

        let err = m.attach_result(BTreeMap::new(), criteria(3.0)).unwrap_err();
        assert!(matches!(err, ModelError::EstimateMismatch { .. }));
        assert!(!m.is_calibrated());
    }

    #[test]
    fn test_get_criterion() {
        let mut m = model();
        assert!(matches!(
            m.get_criterion(CriterionKind::Aic),
            Err(ModelError::NotCalibrated { .. })
        ));
        m.attach_result(BTreeMap::from([("k1".to_string(), 0.5)]), criteria(3.0))
            .unwrap();
        assert_eq!(m.get_criterion(CriterionKind::Aic).unwrap().value, 8.0);
        assert!(m.get_criterion(CriterionKind::Bic).is_err());
    }

    #[test]
    fn test_distance() {
        let a = model();
        let b = Model::new(
            "s1",
            "base",
            vec![0, 0],
            assignment(&[
                ("k1", ParameterValue::Fixed(0.0)),
                ("k2", ParameterValue::Fixed(0.0)),
            ]),
        );
        assert_eq!(a.distance(&b), Some(1));
        assert_eq!(a.distance(&a), Some(0));
        assert_eq!(a.n_estimated(), 1);
        assert_eq!(a.estimated_parameters().collect::<Vec<_>>(), vec!["k1"]);
    }
}

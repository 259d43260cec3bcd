//! Configuration types for a model selection problem.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{CriterionKind, SearchMethod};

/// Value assigned to one parameter axis: estimated, or fixed to a number.
///
/// In JSON an estimated parameter is written as the string `"estimate"`,
/// a fixed one as a plain number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterValue {
    /// The parameter is free and fitted by calibration.
    Estimated,
    /// The parameter is held at this value.
    Fixed(f64),
}

/// JSON marker for an estimated parameter.
pub const ESTIMATE_MARKER: &str = "estimate";

impl ParameterValue {
    #[inline]
    pub fn is_estimated(&self) -> bool {
        matches!(self, ParameterValue::Estimated)
    }

    /// The fixed value, if any.
    #[inline]
    pub fn fixed(&self) -> Option<f64> {
        match self {
            ParameterValue::Estimated => None,
            ParameterValue::Fixed(v) => Some(*v),
        }
    }

    /// Canonical byte encoding used for hashing. `-0.0` and `0.0` coincide.
    pub fn canonical_bytes(&self) -> [u8; 9] {
        let mut out = [0u8; 9];
        if let ParameterValue::Fixed(v) = self {
            let v = if *v == 0.0 { 0.0f64 } else { *v };
            out[0] = 1;
            out[1..].copy_from_slice(&v.to_bits().to_le_bytes());
        }
        out
    }

    /// Equality on canonical encoding (so `0.0 == -0.0`, and exact otherwise).
    pub fn same_as(&self, other: &ParameterValue) -> bool {
        self.canonical_bytes() == other.canonical_bytes()
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Estimated => f.write_str(ESTIMATE_MARKER),
            ParameterValue::Fixed(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ParameterValueRepr {
    Number(f64),
    Marker(String),
}

impl Serialize for ParameterValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let repr = match self {
            ParameterValue::Estimated => ParameterValueRepr::Marker(ESTIMATE_MARKER.to_string()),
            ParameterValue::Fixed(v) => ParameterValueRepr::Number(*v),
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ParameterValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match ParameterValueRepr::deserialize(deserializer)? {
            ParameterValueRepr::Number(v) => Ok(ParameterValue::Fixed(v)),
            ParameterValueRepr::Marker(s) if s.eq_ignore_ascii_case(ESTIMATE_MARKER) => {
                Ok(ParameterValue::Estimated)
            }
            ParameterValueRepr::Marker(s) => Err(serde::de::Error::custom(format!(
                "unknown parameter value {s:?}, expected a number or {ESTIMATE_MARKER:?}"
            ))),
        }
    }
}

/// One parameter axis of a subspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    /// Parameter name.
    pub name: String,
    /// Allowed values, in enumeration order.
    pub domain: Vec<ParameterValue>,
}

impl AxisSpec {
    pub fn new(name: impl Into<String>, domain: Vec<ParameterValue>) -> Self {
        Self {
            name: name.into(),
            domain,
        }
    }

    /// Axis whose domain is `{fixed, estimate}`.
    pub fn toggle(name: impl Into<String>, fixed: f64) -> Self {
        Self::new(
            name,
            vec![ParameterValue::Fixed(fixed), ParameterValue::Estimated],
        )
    }
}

/// Declarative description of a model subspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubspaceSpec {
    /// Unique subspace identifier.
    pub id: String,
    /// Identifier of the base model structure. Subspaces sharing a base
    /// produce identical models for identical assignments.
    pub base: String,
    /// Observed data the models are calibrated against.
    #[serde(default)]
    pub dataset: Option<String>,
    /// Parameter axes, in enumeration order.
    #[serde(default)]
    pub axes: Vec<AxisSpec>,
}

impl SubspaceSpec {
    /// Number of models, or `None` on overflow.
    pub fn size(&self) -> Option<usize> {
        self.axes
            .iter()
            .try_fold(1usize, |acc, axis| acc.checked_mul(axis.domain.len()))
    }

    /// Validate axes and domains.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() || self.base.is_empty() {
            return Err(ConfigError::EmptyIdentifier);
        }

        let mut names = HashSet::new();
        for axis in &self.axes {
            if !names.insert(axis.name.as_str()) {
                return Err(ConfigError::DuplicateAxis {
                    subspace: self.id.clone(),
                    axis: axis.name.clone(),
                });
            }
            if axis.domain.is_empty() {
                return Err(ConfigError::EmptyDomain {
                    subspace: self.id.clone(),
                    axis: axis.name.clone(),
                });
            }
            for (i, value) in axis.domain.iter().enumerate() {
                if let ParameterValue::Fixed(v) = value
                    && !v.is_finite()
                {
                    return Err(ConfigError::NonFiniteValue {
                        subspace: self.id.clone(),
                        axis: axis.name.clone(),
                    });
                }
                if axis.domain[..i].iter().any(|prev| prev.same_as(value)) {
                    return Err(ConfigError::DuplicateValue {
                        subspace: self.id.clone(),
                        axis: axis.name.clone(),
                        value: value.to_string(),
                    });
                }
            }
        }

        if self.size().is_none() {
            return Err(ConfigError::SubspaceTooLarge(self.id.clone()));
        }

        Ok(())
    }
}

/// Search-wide limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Limits {
    /// Models with more estimated parameters are never proposed.
    #[serde(default)]
    pub max_estimated: Option<usize>,
    /// Stop (resumably) after this many iterations.
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

/// Top-level configuration of a model selection problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemConfig {
    /// Criterion models are ranked by.
    pub criterion: CriterionKind,
    /// Search strategy and its tunables.
    #[serde(default)]
    pub method: SearchMethod,
    /// Subspaces whose union forms the model space.
    pub subspaces: Vec<SubspaceSpec>,
    /// Search-wide limits.
    #[serde(default)]
    pub limits: Limits,
}

impl ProblemConfig {
    pub fn new(criterion: CriterionKind, method: SearchMethod, subspaces: Vec<SubspaceSpec>) -> Self {
        Self {
            criterion,
            method,
            subspaces,
            limits: Limits::default(),
        }
    }

    /// Validate the whole problem before any iteration begins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subspaces.is_empty() {
            return Err(ConfigError::NoSubspaces);
        }

        let mut ids = HashSet::new();
        let mut datasets: BTreeMap<&str, &str> = BTreeMap::new();
        for spec in &self.subspaces {
            spec.validate()?;
            if !ids.insert(spec.id.as_str()) {
                return Err(ConfigError::DuplicateSubspace(spec.id.clone()));
            }
            if let Some(dataset) = &spec.dataset {
                datasets.insert(spec.id.as_str(), dataset.as_str());
            }
        }

        // Criterion values are only comparable on shared data.
        let mut declared = datasets.iter();
        if let Some((first_id, first)) = declared.next()
            && let Some((other_id, other)) = declared.find(|(_, d)| *d != first)
        {
            return Err(ConfigError::IncompatibleDatasets {
                first: format!("{first_id} ({first})"),
                second: format!("{other_id} ({other})"),
            });
        }

        self.method.validate()
    }

    /// Stable digest of everything that shapes the search trajectory.
    ///
    /// `limits.max_iterations` is left out so a resumed run may extend it.
    pub fn fingerprint(&self) -> String {
        #[derive(Serialize)]
        struct View<'a> {
            criterion: CriterionKind,
            method: &'a SearchMethod,
            subspaces: &'a [SubspaceSpec],
            max_estimated: Option<usize>,
        }

        let view = View {
            criterion: self.criterion,
            method: &self.method,
            subspaces: &self.subspaces,
            max_estimated: self.limits.max_estimated,
        };
        // Serializing plain data with string keys cannot fail.
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"model-select/config/v1");
        hasher.update(&bytes);
        hasher.finalize().to_hex().to_string()
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("At least one subspace is required")]
    NoSubspaces,
    #[error("Subspace and base identifiers must be non-empty")]
    EmptyIdentifier,
    #[error("Duplicate subspace id {0:?}")]
    DuplicateSubspace(String),
    #[error("Subspace {subspace:?} declares axis {axis:?} twice")]
    DuplicateAxis { subspace: String, axis: String },
    #[error("Axis {axis:?} of subspace {subspace:?} has an empty domain")]
    EmptyDomain { subspace: String, axis: String },
    #[error("Axis {axis:?} of subspace {subspace:?} lists {value} twice")]
    DuplicateValue {
        subspace: String,
        axis: String,
        value: String,
    },
    #[error("Axis {axis:?} of subspace {subspace:?} has a non-finite fixed value")]
    NonFiniteValue { subspace: String, axis: String },
    #[error("Subspace {0:?} has more models than can be enumerated")]
    SubspaceTooLarge(String),
    #[error("Subspaces are calibrated against different data: {first} vs {second}")]
    IncompatibleDatasets { first: String, second: String },
    #[error("Invalid search tunable: {0}")]
    InvalidTunable(String),
    #[error("Initial model not found in the model space: {0}")]
    InitialModelNotFound(String),
}

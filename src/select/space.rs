//! The model space: union of subspaces with cross-subspace deduplication and
//! a monotone excluded set.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::debug;
use rand::Rng;

use crate::schema::{ConfigError, ParameterValue, ProblemConfig};

use super::model::{Model, ModelId};
use super::subspace::ModelSubspace;

/// Which part of the remaining space a strategy asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyHint {
    /// Every remaining model.
    All,
    /// Remaining models with the fewest estimated parameters.
    FewestEstimated,
    /// Remaining models with the most estimated parameters.
    MostEstimated,
}

/// Union of model subspaces for one problem.
#[derive(Debug, Clone)]
pub struct ModelSpace {
    subspaces: Vec<ModelSubspace>,
    excluded: BTreeSet<ModelId>,
    max_estimated: Option<usize>,
}

impl ModelSpace {
    /// Create a model space. Subspace ids must be unique.
    pub fn new(
        subspaces: Vec<ModelSubspace>,
        max_estimated: Option<usize>,
    ) -> Result<Self, ConfigError> {
        if subspaces.is_empty() {
            return Err(ConfigError::NoSubspaces);
        }
        let mut ids = HashSet::new();
        for s in &subspaces {
            if !ids.insert(s.id()) {
                return Err(ConfigError::DuplicateSubspace(s.id().to_string()));
            }
            let (min, _) = s.parameter_count_bounds();
            if let Some(limit) = max_estimated
                && min > limit
            {
                debug!(
                    "Pruning subspace {} (needs {min} estimated parameters, limit {limit})",
                    s.id()
                );
            }
        }

        Ok(Self {
            subspaces,
            excluded: BTreeSet::new(),
            max_estimated,
        })
    }

    /// Build the space declared by a problem configuration.
    pub fn from_config(config: &ProblemConfig) -> Result<Self, ConfigError> {
        let subspaces = config
            .subspaces
            .iter()
            .map(ModelSubspace::from_spec)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(subspaces, config.limits.max_estimated)
    }

    pub fn all_subspaces(&self) -> &[ModelSubspace] {
        &self.subspaces
    }

    pub fn subspace(&self, id: &str) -> Option<&ModelSubspace> {
        self.subspaces.iter().find(|s| s.id() == id)
    }

    pub fn max_estimated(&self) -> Option<usize> {
        self.max_estimated
    }

    /// Sum of subspace sizes, before deduplication.
    pub fn total_size(&self) -> usize {
        self.subspaces.iter().map(|s| s.size()).sum()
    }

    /// Exclude a model from candidacy. Returns `true` if newly excluded.
    pub fn exclude(&mut self, id: &ModelId) -> bool {
        self.excluded.insert(id.clone())
    }

    #[inline]
    pub fn is_excluded(&self, id: &ModelId) -> bool {
        self.excluded.contains(id)
    }

    pub fn excluded(&self) -> &BTreeSet<ModelId> {
        &self.excluded
    }

    /// Subspaces that can produce a model within the estimated-parameter
    /// limit, with `k` (if given) inside their bounds.
    fn live_subspaces(&self, k: Option<usize>) -> impl Iterator<Item = &ModelSubspace> {
        self.subspaces.iter().filter(move |s| {
            let (min, max) = s.parameter_count_bounds();
            let within_limit = self.max_estimated.is_none_or(|limit| min <= limit);
            let holds_k = k.is_none_or(|k| min <= k && k <= max);
            within_limit && holds_k
        })
    }

    fn admissible(&self, model: &Model) -> bool {
        !self.is_excluded(model.id())
            && self
                .max_estimated
                .is_none_or(|limit| model.n_estimated() <= limit)
    }

    /// Lazily iterate remaining models across subspaces, each identifier at
    /// most once, skipping excluded models and those `skip` rejects.
    pub fn iter_candidates<'a, F>(&'a self, skip: F) -> impl Iterator<Item = Model> + 'a
    where
        F: Fn(&ModelId) -> bool + 'a,
    {
        let mut seen: HashSet<ModelId> = HashSet::new();
        self.live_subspaces(None)
            .flat_map(|s| s.enumerate(None))
            .filter(move |m| self.admissible(m) && !skip(m.id()) && seen.insert(m.id().clone()))
    }

    /// Remaining models for a strategy, deduplicated, in enumeration order.
    pub fn candidates(&self, hint: StrategyHint) -> Vec<Model> {
        self.candidates_filtered(hint, |_| false)
    }

    /// As [`candidates`](Self::candidates), additionally dropping models
    /// `skip` rejects.
    pub fn candidates_filtered<F>(&self, hint: StrategyHint, skip: F) -> Vec<Model>
    where
        F: Fn(&ModelId) -> bool,
    {
        let counts: Vec<usize> = match hint {
            StrategyHint::All => return self.iter_candidates(skip).collect(),
            StrategyHint::FewestEstimated => self.count_range().collect(),
            StrategyHint::MostEstimated => self.count_range().rev().collect(),
        };

        // Walk estimated-parameter counts outward, generating only the
        // models with that count.
        for k in counts {
            let mut seen = HashSet::new();
            let batch: Vec<Model> = self
                .live_subspaces(Some(k))
                .flat_map(|s| s.with_estimated(k))
                .filter(|m| {
                    self.admissible(m)
                        && !skip(m.id())
                        && seen.insert(m.id().clone())
                })
                .collect();
            if !batch.is_empty() {
                return batch;
            }
        }
        Vec::new()
    }

    fn count_range(&self) -> std::ops::RangeInclusive<usize> {
        let (min, max) = self
            .live_subspaces(None)
            .map(|s| s.parameter_count_bounds())
            .fold((usize::MAX, 0), |(lo, hi), (min, max)| {
                (lo.min(min), hi.max(max))
            });
        let max = self.max_estimated.map_or(max, |limit| max.min(limit));
        if min > max { 1..=0 } else { min..=max }
    }

    /// Whether any remaining model passes `skip`.
    pub fn has_remaining<F>(&self, skip: F) -> bool
    where
        F: Fn(&ModelId) -> bool,
    {
        self.iter_candidates(skip).next().is_some()
    }

    /// Draw a remaining model uniformly by enumeration index.
    ///
    /// Draws landing on excluded or skipped models are rejected. After
    /// `attempts` rejections the first remaining model in enumeration order
    /// is returned instead.
    pub fn sample<R, F>(&self, rng: &mut R, skip: F, attempts: usize) -> Option<Model>
    where
        R: Rng,
        F: Fn(&ModelId) -> bool,
    {
        let live: Vec<&ModelSubspace> = self.live_subspaces(None).collect();
        let total: usize = live.iter().map(|s| s.size()).sum();
        if total == 0 {
            return None;
        }

        for _ in 0..attempts {
            let mut index = rng.gen_range(0..total);
            let Some(subspace) = live.iter().find(|s| {
                if index < s.size() {
                    true
                } else {
                    index -= s.size();
                    false
                }
            }) else {
                continue;
            };
            let Some(model) = subspace.model_at(index) else {
                continue;
            };
            if self.admissible(&model) && !skip(model.id()) {
                return Some(self.canonical(model));
            }
        }

        debug!("Sampling rejected {attempts} draw(s), taking the first remaining model");
        self.iter_candidates(skip).next()
    }

    /// The copy of `model` produced by the first subspace that can produce it.
    fn canonical(&self, model: Model) -> Model {
        self.live_subspaces(None)
            .find(|s| s.contains(&model))
            .and_then(|s| s.model_from_assignment(model.assignment()).ok())
            .unwrap_or(model)
    }

    /// Position of `model` in the space's enumeration: the index of its
    /// subspace, then its index within that subspace.
    pub fn enumeration_key(&self, model: &Model) -> (usize, usize) {
        self.subspaces
            .iter()
            .enumerate()
            .find_map(|(i, s)| s.index_of(model).ok().map(|index| (i, index)))
            .unwrap_or((usize::MAX, usize::MAX))
    }

    /// Sort `models` into enumeration order.
    pub fn sort_by_enumeration(&self, models: &mut [Model]) {
        models.sort_by_cached_key(|m| self.enumeration_key(m));
    }

    /// Remaining models exactly `radius` parameter changes away from
    /// `model`, gathered from every subspace that contains it.
    pub fn neighbors(&self, model: &Model, radius: usize) -> Vec<Model> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for s in self.live_subspaces(None) {
            let Ok(found) = s.at_distance(model, radius) else {
                continue;
            };
            for m in found {
                if self.admissible(&m) && seen.insert(m.id().clone()) {
                    out.push(m);
                }
            }
        }
        out
    }

    /// Look up a model by subspace and assignment.
    pub fn find(
        &self,
        subspace: &str,
        assignment: &BTreeMap<String, ParameterValue>,
    ) -> Result<Model, ConfigError> {
        let s = self
            .subspace(subspace)
            .ok_or_else(|| ConfigError::InitialModelNotFound(format!("subspace {subspace:?}")))?;
        s.model_from_assignment(assignment)
            .map_err(|e| ConfigError::InitialModelNotFound(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AxisSpec, SubspaceSpec};

    fn subspace(id: &str, axes: Vec<AxisSpec>) -> ModelSubspace {
        ModelSubspace::from_spec(&SubspaceSpec {
            id: id.to_string(),
            base: "base".to_string(),
            dataset: None,
            axes,
        })
        .unwrap()
    }

    /// Two subspaces sharing the model `a=estimate, b=0`.
    fn overlapping_space() -> ModelSpace {
        let s1 = subspace(
            "s1",
            vec![
                AxisSpec::toggle("a", 0.0),
                AxisSpec::new("b", vec![ParameterValue::Fixed(0.0)]),
            ],
        );
        let s2 = subspace(
            "s2",
            vec![
                AxisSpec::new("a", vec![ParameterValue::Estimated]),
                AxisSpec::toggle("b", 0.0),
            ],
        );
        ModelSpace::new(vec![s1, s2], None).unwrap()
    }

    #[test]
    fn test_cross_subspace_dedup() {
        let space = overlapping_space();
        assert_eq!(space.total_size(), 4);
        let all = space.candidates(StrategyHint::All);
        assert_eq!(all.len(), 3);
        let ids: HashSet<_> = all.iter().map(|m| m.id().clone()).collect();
        assert_eq!(ids.len(), 3);
        // The shared model keeps the subspace that produced it first.
        let shared = all
            .iter()
            .find(|m| m.n_estimated() == 1 && m.value("b") == Some(ParameterValue::Fixed(0.0)))
            .unwrap();
        assert_eq!(shared.subspace_id(), "s1");
    }

    #[test]
    fn test_exclusion_is_monotone() {
        let mut space = overlapping_space();
        let first = space.candidates(StrategyHint::All)[0].clone();
        assert!(space.exclude(first.id()));
        assert!(!space.exclude(first.id()));
        assert!(space.is_excluded(first.id()));
        assert_eq!(space.candidates(StrategyHint::All).len(), 2);
        assert!(space.has_remaining(|_| false));
        assert!(!space.has_remaining(|_| true));
    }

    #[test]
    fn test_hints() {
        let space = overlapping_space();
        let fewest = space.candidates(StrategyHint::FewestEstimated);
        assert_eq!(fewest.len(), 1);
        assert_eq!(fewest[0].n_estimated(), 0);

        let most = space.candidates(StrategyHint::MostEstimated);
        assert_eq!(most.len(), 1);
        assert_eq!(most[0].n_estimated(), 2);
    }

    #[test]
    fn test_fewest_moves_on_when_excluded() {
        let mut space = overlapping_space();
        let minimal = space.candidates(StrategyHint::FewestEstimated);
        space.exclude(minimal[0].id());
        let next = space.candidates(StrategyHint::FewestEstimated);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].n_estimated(), 1);
    }

    #[test]
    fn test_hints_on_large_space() {
        let axes = (0..40).map(|i| AxisSpec::toggle(format!("k{i:02}"), 0.0)).collect();
        let mut space = ModelSpace::new(vec![subspace("big", axes)], None).unwrap();

        let minimal = space.candidates(StrategyHint::FewestEstimated);
        assert_eq!(minimal.len(), 1);
        assert_eq!(space.candidates(StrategyHint::MostEstimated)[0].n_estimated(), 40);

        space.exclude(minimal[0].id());
        let singles = space.candidates(StrategyHint::FewestEstimated);
        assert_eq!(singles.len(), 40);
        assert!(singles.iter().all(|m| m.n_estimated() == 1));
    }

    #[test]
    fn test_sample() {
        use rand::SeedableRng;
        use rand::rngs::StdRng;

        let mut space = overlapping_space();
        let draw = |space: &ModelSpace| space.sample(&mut StdRng::seed_from_u64(5), |_| false, 64);
        let first = draw(&space).unwrap();
        assert_eq!(draw(&space), Some(first.clone()));

        // The shared model is always reported from its first subspace.
        for seed in 0..16 {
            let m = space
                .sample(&mut StdRng::seed_from_u64(seed), |_| false, 64)
                .unwrap();
            if m.n_estimated() == 1 && m.value("b") == Some(ParameterValue::Fixed(0.0)) {
                assert_eq!(m.subspace_id(), "s1");
            }
        }

        // With one model left and no attempts, the fallback still finds it.
        let all = space.candidates(StrategyHint::All);
        for m in &all[1..] {
            space.exclude(m.id());
        }
        let last = space.sample(&mut StdRng::seed_from_u64(5), |_| false, 0);
        assert_eq!(last.as_ref(), Some(&all[0]));
        assert!(space.sample(&mut StdRng::seed_from_u64(5), |_| true, 8).is_none());
    }

    #[test]
    fn test_sort_by_enumeration() {
        let space = overlapping_space();
        let s1 = space.subspace("s1").unwrap();
        let s2 = space.subspace("s2").unwrap();
        let mut models = vec![
            s2.model_at(1).unwrap(),
            s1.model_at(1).unwrap(),
            s1.model_at(0).unwrap(),
        ];
        space.sort_by_enumeration(&mut models);
        assert_eq!(space.enumeration_key(&models[0]), (0, 0));
        assert_eq!(space.enumeration_key(&models[1]), (0, 1));
        assert_eq!(space.enumeration_key(&models[2]), (1, 1));
    }

    #[test]
    fn test_max_estimated_prunes() {
        let s1 = subspace("s1", vec![AxisSpec::toggle("a", 0.0), AxisSpec::toggle("b", 0.0)]);
        let s2 = subspace(
            "s2",
            vec![
                AxisSpec::new("a", vec![ParameterValue::Estimated]),
                AxisSpec::new("b", vec![ParameterValue::Estimated]),
                AxisSpec::new("c", vec![ParameterValue::Estimated]),
            ],
        );
        let space = ModelSpace::new(vec![s1, s2], Some(1)).unwrap();
        let all = space.candidates(StrategyHint::All);
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|m| m.n_estimated() <= 1));
        assert_eq!(space.candidates(StrategyHint::MostEstimated).len(), 2);
    }

    #[test]
    fn test_neighbors_across_subspaces() {
        let space = overlapping_space();
        let shared = space.subspace("s2").unwrap().model_at(0).unwrap();
        // From s1: a=0,b=0. From s2: a=est,b=est.
        let near = space.neighbors(&shared, 1);
        assert_eq!(near.len(), 2);
        assert!(near.iter().any(|m| m.n_estimated() == 0));
        assert!(near.iter().any(|m| m.n_estimated() == 2));
    }

    #[test]
    fn test_duplicate_subspace_rejected() {
        let a = subspace("s", vec![]);
        let b = subspace("s", vec![]);
        assert_eq!(
            ModelSpace::new(vec![a, b], None).unwrap_err(),
            ConfigError::DuplicateSubspace("s".to_string())
        );
    }

    #[test]
    fn test_find() {
        let space = overlapping_space();
        let assignment = BTreeMap::from([
            ("a".to_string(), ParameterValue::Estimated),
            ("b".to_string(), ParameterValue::Estimated),
        ]);
        assert_eq!(space.find("s2", &assignment).unwrap().n_estimated(), 2);
        assert!(space.find("s1", &assignment).is_err());
        assert!(space.find("nope", &assignment).is_err());
    }
}

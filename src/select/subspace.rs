//! Model subspaces: enumerable families of models over parameter axes.
//!
//! Models are enumerated with a mixed-radix counter over the axis domain
//! sizes. The last axis varies fastest, so model `i` is the `i`-th element
//! of the lexicographic Cartesian product of the domains.

use std::collections::BTreeMap;

use crate::schema::{AxisSpec, ConfigError, ParameterValue, SubspaceSpec};

use super::model::Model;

/// Subspace contract violations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubspaceError {
    #[error("Subspace {subspace:?} has no axis {axis:?}")]
    InvalidAxis { subspace: String, axis: String },
    #[error("Model {model} does not belong to subspace {subspace:?}")]
    ForeignModel { subspace: String, model: String },
}

/// A declarative, enumerable family of models sharing a base structure.
#[derive(Debug, Clone)]
pub struct ModelSubspace {
    id: String,
    base: String,
    dataset: Option<String>,
    axes: Vec<AxisSpec>,
    size: usize,
}

impl ModelSubspace {
    /// Build a subspace from its validated specification.
    pub fn from_spec(spec: &SubspaceSpec) -> Result<Self, ConfigError> {
        spec.validate()?;
        let size = spec
            .size()
            .ok_or_else(|| ConfigError::SubspaceTooLarge(spec.id.clone()))?;

        Ok(Self {
            id: spec.id.clone(),
            base: spec.base.clone(),
            dataset: spec.dataset.clone(),
            axes: spec.axes.clone(),
            size,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn dataset(&self) -> Option<&str> {
        self.dataset.as_deref()
    }

    pub fn axes(&self) -> &[AxisSpec] {
        &self.axes
    }

    /// Number of models, the product of the domain sizes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Lazily enumerate models in deterministic order.
    pub fn enumerate(&self, limit: Option<usize>) -> SubspaceIter<'_> {
        let mut iter = self.enumerate_from(0);
        if let Some(limit) = limit {
            iter.remaining = iter.remaining.min(limit);
        }
        iter
    }

    /// Enumerate starting at model index `start`.
    ///
    /// Restarting from the same index yields the same sequence.
    pub fn enumerate_from(&self, start: usize) -> SubspaceIter<'_> {
        let remaining = self.size.saturating_sub(start);
        let digits = if remaining > 0 {
            self.decode(start)
        } else {
            vec![0; self.axes.len()]
        };
        SubspaceIter {
            subspace: self,
            radices: self.axes.iter().map(|a| a.domain.len()).collect(),
            digits,
            remaining,
        }
    }

    /// Model at enumeration index `index`.
    pub fn model_at(&self, index: usize) -> Option<Model> {
        (index < self.size).then(|| self.build(&self.decode(index)))
    }

    /// Enumeration index of `model` in this subspace.
    pub fn index_of(&self, model: &Model) -> Result<usize, SubspaceError> {
        let digits = self.locate(model)?;
        Ok(digits
            .iter()
            .zip(&self.axes)
            .fold(0usize, |acc, (&d, axis)| acc * axis.domain.len() + d))
    }

    /// Lazily enumerate the models with exactly `k` estimated parameters,
    /// in enumeration order.
    ///
    /// Prefixes that cannot reach `k` are never expanded, so the cost is
    /// proportional to the number of models produced.
    pub fn with_estimated(&self, k: usize) -> EstimatedIter<'_> {
        let n = self.axes.len();
        let mut bounds = vec![(0usize, 0usize); n + 1];
        for (a, axis) in self.axes.iter().enumerate().rev() {
            let (min, max) = bounds[a + 1];
            let all = axis.domain.iter().all(|v| v.is_estimated());
            let any = axis.domain.iter().any(|v| v.is_estimated());
            bounds[a] = (min + usize::from(all), max + usize::from(any));
        }

        let mut iter = EstimatedIter {
            subspace: self,
            k,
            bounds,
            next: None,
        };
        let mut digits = vec![0; n];
        if iter.fits(0, k) && iter.fill(&mut digits, 0, k) {
            iter.next = Some(digits);
        }
        iter
    }

    /// Minimum and maximum number of estimated parameters producible.
    pub fn parameter_count_bounds(&self) -> (usize, usize) {
        let mut min = 0;
        let mut max = 0;
        for axis in &self.axes {
            if axis.domain.iter().all(|v| v.is_estimated()) {
                min += 1;
            }
            if axis.domain.iter().any(|v| v.is_estimated()) {
                max += 1;
            }
        }
        (min, max)
    }

    /// Whether this subspace can produce `model`.
    pub fn contains(&self, model: &Model) -> bool {
        self.locate(model).is_ok()
    }

    /// Build the model with the given assignment.
    pub fn model_from_assignment(
        &self,
        assignment: &BTreeMap<String, ParameterValue>,
    ) -> Result<Model, SubspaceError> {
        if assignment.len() != self.axes.len() {
            return Err(self.foreign(&format!("{assignment:?}")));
        }
        let mut digits = Vec::with_capacity(self.axes.len());
        for axis in &self.axes {
            let value = assignment
                .get(&axis.name)
                .ok_or_else(|| self.foreign(&format!("{assignment:?}")))?;
            let digit = axis
                .domain
                .iter()
                .position(|v| v.same_as(value))
                .ok_or_else(|| self.foreign(&format!("{assignment:?}")))?;
            digits.push(digit);
        }
        Ok(self.build(&digits))
    }

    /// Models reachable from `model` by changing exactly one axis.
    ///
    /// `axes` restricts which axes may change; `None` allows all. Each move
    /// either adds an estimated parameter, removes one (fixing it), or swaps
    /// one fixed value for another. A model this subspace cannot produce is
    /// an [`SubspaceError::InvalidAxis`] naming the first parameter that does
    /// not fit.
    pub fn neighbors(
        &self,
        model: &Model,
        axes: Option<&[&str]>,
    ) -> Result<Vec<Model>, SubspaceError> {
        let digits = self.locate_axes(model)?;
        let selected: Vec<usize> = match axes {
            None => (0..self.axes.len()).collect(),
            Some(names) => names
                .iter()
                .map(|name| self.axis_index(name))
                .collect::<Result<_, _>>()?,
        };

        let mut out = Vec::new();
        for (a, axis) in self.axes.iter().enumerate() {
            if !selected.contains(&a) {
                continue;
            }
            for d in 0..axis.domain.len() {
                if d == digits[a] {
                    continue;
                }
                let mut next = digits.clone();
                next[a] = d;
                out.push(self.build(&next));
            }
        }
        Ok(out)
    }

    /// Models differing from `model` on exactly `radius` axes.
    ///
    /// Axis combinations are visited in lexicographic order, and for each
    /// combination the alternative values in domain order.
    pub fn at_distance(&self, model: &Model, radius: usize) -> Result<Vec<Model>, SubspaceError> {
        let digits = self.locate_axes(model)?;
        let n = self.axes.len();
        if radius == 0 {
            return Ok(vec![self.build(&digits)]);
        }
        if radius > n {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut combo: Vec<usize> = (0..radius).collect();
        loop {
            self.push_alternatives(&digits, &combo, &mut out);
            if !next_combination(&mut combo, n) {
                break;
            }
        }
        Ok(out)
    }

    /// Every model that changes all axes in `combo`, in mixed-radix order
    /// over the alternative values.
    fn push_alternatives(&self, digits: &[usize], combo: &[usize], out: &mut Vec<Model>) {
        // Alternatives per chosen axis skip the current value.
        let radices: Vec<usize> = combo
            .iter()
            .map(|&a| self.axes[a].domain.len() - 1)
            .collect();
        if radices.contains(&0) {
            return;
        }

        let mut counter = vec![0usize; combo.len()];
        loop {
            let mut next = digits.to_vec();
            for (slot, &a) in combo.iter().enumerate() {
                let alt = counter[slot];
                next[a] = if alt >= digits[a] { alt + 1 } else { alt };
            }
            out.push(self.build(&next));

            if !increment(&mut counter, &radices) {
                break;
            }
        }
    }

    fn axis_index(&self, name: &str) -> Result<usize, SubspaceError> {
        self.axes
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| SubspaceError::InvalidAxis {
                subspace: self.id.clone(),
                axis: name.to_string(),
            })
    }

    /// Domain index per axis for `model`, if it belongs here.
    fn locate(&self, model: &Model) -> Result<Vec<usize>, SubspaceError> {
        if model.base() != self.base || model.assignment().len() != self.axes.len() {
            return Err(self.foreign(model.id().as_str()));
        }
        self.axes
            .iter()
            .map(|axis| {
                model
                    .value(&axis.name)
                    .and_then(|value| axis.domain.iter().position(|v| v.same_as(&value)))
                    .ok_or_else(|| self.foreign(model.id().as_str()))
            })
            .collect()
    }

    /// As [`locate`](Self::locate), reporting the offending axis.
    fn locate_axes(&self, model: &Model) -> Result<Vec<usize>, SubspaceError> {
        self.locate(model).map_err(|_| {
            let axis = model
                .assignment()
                .iter()
                .find(|(name, value)| {
                    self.axes
                        .iter()
                        .find(|a| &a.name == *name)
                        .is_none_or(|a| !a.domain.iter().any(|v| v.same_as(value)))
                })
                .map(|(name, _)| name.clone())
                .or_else(|| {
                    self.axes
                        .iter()
                        .find(|a| model.value(&a.name).is_none())
                        .map(|a| a.name.clone())
                })
                .unwrap_or_else(|| model.base().to_string());
            SubspaceError::InvalidAxis {
                subspace: self.id.clone(),
                axis,
            }
        })
    }

    fn foreign(&self, model: &str) -> SubspaceError {
        SubspaceError::ForeignModel {
            subspace: self.id.clone(),
            model: model.to_string(),
        }
    }

    fn decode(&self, mut index: usize) -> Vec<usize> {
        let mut digits = vec![0; self.axes.len()];
        for (a, axis) in self.axes.iter().enumerate().rev() {
            let radix = axis.domain.len();
            digits[a] = index % radix;
            index /= radix;
        }
        digits
    }

    fn build(&self, digits: &[usize]) -> Model {
        let assignment = self
            .axes
            .iter()
            .zip(digits)
            .map(|(axis, &d)| (axis.name.clone(), axis.domain[d]))
            .collect();
        Model::new(&self.id, &self.base, digits.to_vec(), assignment)
    }
}

/// Advance a mixed-radix counter, last digit fastest. Returns `false` on
/// wrap-around.
fn increment(digits: &mut [usize], radices: &[usize]) -> bool {
    for i in (0..digits.len()).rev() {
        digits[i] += 1;
        if digits[i] < radices[i] {
            return true;
        }
        digits[i] = 0;
    }
    false
}

/// Advance a sorted `k`-combination of `0..n` in lexicographic order.
fn next_combination(combo: &mut [usize], n: usize) -> bool {
    let k = combo.len();
    for i in (0..k).rev() {
        if combo[i] < n - k + i {
            combo[i] += 1;
            for j in i + 1..k {
                combo[j] = combo[j - 1] + 1;
            }
            return true;
        }
    }
    false
}

/// Models of one subspace with a fixed number of estimated parameters.
///
/// `bounds[a]` holds the fewest and most estimated parameters the axes from
/// `a` onwards can contribute.
#[derive(Debug, Clone)]
pub struct EstimatedIter<'a> {
    subspace: &'a ModelSubspace,
    k: usize,
    bounds: Vec<(usize, usize)>,
    next: Option<Vec<usize>>,
}

impl EstimatedIter<'_> {
    fn estimated(&self, axis: usize, digit: usize) -> usize {
        usize::from(self.subspace.axes[axis].domain[digit].is_estimated())
    }

    /// Whether the axes from `from` onwards can contribute exactly `need`.
    fn fits(&self, from: usize, need: usize) -> bool {
        let (min, max) = self.bounds[from];
        min <= need && need <= max
    }

    /// Smallest digit of `axis` leaving a reachable remainder, at or after
    /// `start`.
    fn first_digit(&self, axis: usize, start: usize, need: usize) -> Option<usize> {
        (start..self.subspace.axes[axis].domain.len()).find(|&d| {
            let e = self.estimated(axis, d);
            e <= need && self.fits(axis + 1, need - e)
        })
    }

    /// Set `digits[from..]` to the first suffix contributing `need`.
    fn fill(&self, digits: &mut [usize], from: usize, mut need: usize) -> bool {
        for a in from..digits.len() {
            let Some(d) = self.first_digit(a, 0, need) else {
                return false;
            };
            digits[a] = d;
            need -= self.estimated(a, d);
        }
        need == 0
    }

    /// Step `digits` to the next assignment with `k` estimated parameters.
    fn advance(&self, digits: &mut [usize]) -> bool {
        let mut prefix = vec![0; digits.len() + 1];
        for (a, &d) in digits.iter().enumerate() {
            prefix[a + 1] = prefix[a] + self.estimated(a, d);
        }

        for a in (0..digits.len()).rev() {
            let Some(need) = self.k.checked_sub(prefix[a]) else {
                continue;
            };
            if let Some(d) = self.first_digit(a, digits[a] + 1, need) {
                digits[a] = d;
                return self.fill(digits, a + 1, need - self.estimated(a, d));
            }
        }
        false
    }
}

impl Iterator for EstimatedIter<'_> {
    type Item = Model;

    fn next(&mut self) -> Option<Model> {
        let mut digits = self.next.take()?;
        let model = self.subspace.build(&digits);
        if self.advance(&mut digits) {
            self.next = Some(digits);
        }
        Some(model)
    }
}

/// Lazy, finite, restartable enumeration of a subspace.
#[derive(Debug, Clone)]
pub struct SubspaceIter<'a> {
    subspace: &'a ModelSubspace,
    radices: Vec<usize>,
    digits: Vec<usize>,
    remaining: usize,
}

impl Iterator for SubspaceIter<'_> {
    type Item = Model;

    fn next(&mut self) -> Option<Model> {
        if self.remaining == 0 {
            return None;
        }
        let model = self.subspace.build(&self.digits);
        self.remaining -= 1;
        if self.remaining > 0 {
            increment(&mut self.digits, &self.radices);
        }
        Some(model)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for SubspaceIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn boolean_subspace(n: usize) -> ModelSubspace {
        let spec = SubspaceSpec {
            id: "s".to_string(),
            base: "base".to_string(),
            dataset: None,
            axes: (0..n)
                .map(|i| AxisSpec::toggle(format!("k{i}"), 0.0))
                .collect(),
        };
        ModelSubspace::from_spec(&spec).unwrap()
    }

    fn mixed_subspace() -> ModelSubspace {
        let spec = SubspaceSpec {
            id: "mixed".to_string(),
            base: "base".to_string(),
            dataset: None,
            axes: vec![
                AxisSpec::toggle("a", 0.0),
                AxisSpec::new(
                    "b",
                    vec![
                        ParameterValue::Fixed(0.0),
                        ParameterValue::Fixed(1.0),
                        ParameterValue::Estimated,
                    ],
                ),
                AxisSpec::new("c", vec![ParameterValue::Estimated]),
            ],
        };
        ModelSubspace::from_spec(&spec).unwrap()
    }

    #[test]
    fn test_enumeration_order() {
        let s = boolean_subspace(2);
        let models: Vec<Model> = s.enumerate(None).collect();
        assert_eq!(models.len(), 4);
        assert_eq!(models[0].indices(), &[0, 0]);
        assert_eq!(models[1].indices(), &[0, 1]);
        assert_eq!(models[2].indices(), &[1, 0]);
        assert_eq!(models[3].indices(), &[1, 1]);
        assert_eq!(models[3].n_estimated(), 2);
    }

    #[test]
    fn test_enumeration_limit_and_restart() {
        let s = mixed_subspace();
        assert_eq!(s.size(), 6);
        assert_eq!(s.enumerate(Some(4)).count(), 4);
        assert_eq!(s.enumerate(Some(100)).count(), 6);

        let tail: Vec<Model> = s.enumerate_from(3).collect();
        let again: Vec<Model> = s.enumerate_from(3).collect();
        assert_eq!(tail, again);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0], s.model_at(3).unwrap());
        assert_eq!(s.enumerate_from(6).count(), 0);
        assert!(s.model_at(6).is_none());
    }

    #[test]
    fn test_empty_axes_yield_one_model() {
        let s = boolean_subspace(0);
        let models: Vec<Model> = s.enumerate(None).collect();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].n_estimated(), 0);
    }

    #[test]
    fn test_parameter_count_bounds() {
        assert_eq!(mixed_subspace().parameter_count_bounds(), (1, 3));
        assert_eq!(boolean_subspace(4).parameter_count_bounds(), (0, 4));
    }

    #[test]
    fn test_neighbors() {
        let s = mixed_subspace();
        // a=0, b=0, c=estimate
        let m = s.model_at(0).unwrap();
        let all = s.neighbors(&m, None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|n| n.distance(&m) == Some(1)));

        let only_b = s.neighbors(&m, Some(&["b"])).unwrap();
        assert_eq!(only_b.len(), 2);
        assert_eq!(only_b[0].value("b"), Some(ParameterValue::Fixed(1.0)));
        assert_eq!(only_b[1].value("b"), Some(ParameterValue::Estimated));

        assert!(matches!(
            s.neighbors(&m, Some(&["zzz"])),
            Err(SubspaceError::InvalidAxis { .. })
        ));
    }

    #[test]
    fn test_neighbors_of_foreign_model() {
        let s = mixed_subspace();
        let other = boolean_subspace(3).model_at(0).unwrap();
        // `k0` is not an axis of the mixed subspace.
        assert_eq!(
            s.neighbors(&other, None).unwrap_err(),
            SubspaceError::InvalidAxis {
                subspace: "mixed".to_string(),
                axis: "k0".to_string(),
            }
        );
        assert!(matches!(
            s.at_distance(&other, 2),
            Err(SubspaceError::InvalidAxis { .. })
        ));
        assert!(matches!(
            s.index_of(&other),
            Err(SubspaceError::ForeignModel { .. })
        ));
        assert!(!s.contains(&other));
    }

    #[test]
    fn test_with_estimated_matches_filtered_enumeration() {
        let s = mixed_subspace();
        for k in 0..=4 {
            let expected: Vec<Model> = s.enumerate(None).filter(|m| m.n_estimated() == k).collect();
            let direct: Vec<Model> = s.with_estimated(k).collect();
            assert_eq!(direct, expected, "k = {k}");
        }
        // c is always estimated.
        assert_eq!(s.with_estimated(0).count(), 0);
        assert_eq!(s.with_estimated(3).count(), 1);
    }

    #[test]
    fn test_with_estimated_on_large_subspace() {
        let s = boolean_subspace(48);
        assert_eq!(s.size(), 1 << 48);

        let minimal: Vec<Model> = s.with_estimated(0).collect();
        assert_eq!(minimal.len(), 1);
        assert_eq!(s.index_of(&minimal[0]).unwrap(), 0);

        let singles: Vec<usize> = s.with_estimated(1).map(|m| s.index_of(&m).unwrap()).collect();
        assert_eq!(singles.len(), 48);
        assert!(singles.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(s.with_estimated(48).count(), 1);
        assert_eq!(s.with_estimated(49).count(), 0);
    }

    #[test]
    fn test_at_distance() {
        let s = boolean_subspace(4);
        let m = s.model_at(0).unwrap();
        assert_eq!(s.at_distance(&m, 1).unwrap().len(), 4);
        let two = s.at_distance(&m, 2).unwrap();
        assert_eq!(two.len(), 6);
        assert!(two.iter().all(|n| n.distance(&m) == Some(2)));
        assert_eq!(s.at_distance(&m, 4).unwrap().len(), 1);
        assert!(s.at_distance(&m, 5).unwrap().is_empty());

        let mixed = mixed_subspace();
        let m = mixed.model_at(0).unwrap();
        // Axis c has no alternative value.
        assert_eq!(mixed.at_distance(&m, 2).unwrap().len(), 2);
        assert!(mixed.at_distance(&m, 3).unwrap().is_empty());
    }

    #[test]
    fn test_model_from_assignment() {
        let s = mixed_subspace();
        let m = s.model_at(4).unwrap();
        let rebuilt = s.model_from_assignment(m.assignment()).unwrap();
        assert_eq!(rebuilt, m);
        assert_eq!(s.index_of(&rebuilt).unwrap(), 4);

        let mut bad = m.assignment().clone();
        bad.insert("b".to_string(), ParameterValue::Fixed(7.0));
        assert!(s.model_from_assignment(&bad).is_err());
    }

    proptest! {
        #[test]
        fn prop_enumeration_is_a_bijection(sizes in prop::collection::vec(1usize..4, 0..5)) {
            let axes = sizes
                .iter()
                .enumerate()
                .map(|(i, &n)| {
                    let mut domain: Vec<ParameterValue> =
                        (0..n - 1).map(|v| ParameterValue::Fixed(v as f64)).collect();
                    domain.push(ParameterValue::Estimated);
                    AxisSpec::new(format!("p{i}"), domain)
                })
                .collect();
            let spec = SubspaceSpec {
                id: "prop".to_string(),
                base: "base".to_string(),
                dataset: None,
                axes,
            };
            let s = ModelSubspace::from_spec(&spec).unwrap();
            let expected: usize = sizes.iter().product();

            let models: Vec<Model> = s.enumerate(None).collect();
            prop_assert_eq!(models.len(), expected);
            prop_assert_eq!(s.size(), expected);

            let ids: HashSet<_> = models.iter().map(|m| m.id().clone()).collect();
            prop_assert_eq!(ids.len(), expected);

            for (i, m) in models.iter().enumerate() {
                prop_assert_eq!(s.index_of(m).unwrap(), i);
            }
        }

        #[test]
        fn prop_with_estimated_is_the_count_slice(sizes in prop::collection::vec(1usize..4, 0..5), k in 0usize..6) {
            let axes = sizes
                .iter()
                .enumerate()
                .map(|(i, &n)| {
                    // Alternate estimate-first and fixed-first domains.
                    let mut domain: Vec<ParameterValue> =
                        (0..n - 1).map(|v| ParameterValue::Fixed(v as f64)).collect();
                    if i % 2 == 0 {
                        domain.insert(0, ParameterValue::Estimated);
                    } else {
                        domain.push(ParameterValue::Estimated);
                    }
                    AxisSpec::new(format!("p{i}"), domain)
                })
                .collect();
            let s = ModelSubspace::from_spec(&SubspaceSpec {
                id: "prop".to_string(),
                base: "base".to_string(),
                dataset: None,
                axes,
            })
            .unwrap();

            let expected: Vec<Model> = s.enumerate(None).filter(|m| m.n_estimated() == k).collect();
            let direct: Vec<Model> = s.with_estimated(k).collect();
            prop_assert_eq!(direct, expected);
        }

        #[test]
        fn prop_restart_matches(start in 0usize..20) {
            let s = boolean_subspace(4);
            let full: Vec<Model> = s.enumerate(None).collect();
            let resumed: Vec<Model> = s.enumerate_from(start).collect();
            prop_assert_eq!(&full[start.min(full.len())..], &resumed[..]);
        }
    }
}

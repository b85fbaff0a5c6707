//! Core types shared by the accumulators, solvers and the estimation drivers.

pub mod accumulators;
pub mod estimators;

use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Identifies one entry of the model ensemble by its model form and its
/// resolution (solution) level within that form.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    /// Index of the model form.
    pub form: usize,
    /// Resolution level within the form. Single-resolution forms use level 0.
    pub level: usize,
}

impl ModelKey {
    /// Constructor.
    pub const fn new(form: usize, level: usize) -> Self {
        Self { form, level }
    }
}

/// The result of evaluating one ensemble entry at a parameter point.
///
/// Contains one value per quantity of interest (QoI). Non-finite entries are
/// legal and are filtered per QoI by the accumulators. The optional
/// evaluation time carries the metadata used for online cost recovery.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Response<T> {
    /// Per-QoI values of this evaluation.
    pub values: Vec<T>,
    /// Wall time of this evaluation, if the model reports it.
    pub eval_time: Option<T>,
}

impl<T> Response<T> {
    /// Create a response without timing metadata.
    pub fn new(values: Vec<T>) -> Self {
        Self {
            values,
            eval_time: None,
        }
    }

    /// Create a response carrying timing metadata.
    pub fn with_time(values: Vec<T>, eval_time: T) -> Self {
        Self {
            values,
            eval_time: Some(eval_time),
        }
    }
}

/// Trait which every model ensemble must implement.
///
/// An ensemble is an ordered collection of model entries of varying fidelity
/// and cost. Entries are ordered from lowest to highest fidelity and the last
/// entry is the truth model. All entries share the same parameter space and
/// the same set of QoI.
pub trait ModelEnsemble<T: Copy>: Send + Sync {
    /// Evaluate the given `entry` at the parameter point `x`, which has as
    /// many coordinates as specified by `dim()`.
    fn evaluate(&self, entry: ModelKey, x: &[T]) -> Response<T>;

    /// Returns the number of random numbers needed per parameter point.
    fn dim(&self) -> usize;

    /// Returns the number of quantities of interest per response.
    fn num_qoi(&self) -> usize;

    /// Returns the ensemble entries, ordered from lowest to highest fidelity.
    /// The last entry is the truth model. At least two entries are required
    /// for a control-variate estimator.
    fn entries(&self) -> Vec<ModelKey>;

    /// User-specified evaluation cost of `entry`, in arbitrary but consistent
    /// units. Returning `None` for any entry selects online cost recovery
    /// from the timing metadata of the pilot responses.
    fn cost(&self, _entry: ModelKey) -> Option<T> {
        None
    }
}

/// A named subset of ensemble entries that is sampled together from a single
/// random draw.
///
/// Sampling all members of a group from one draw is what induces the
/// correlation between their outputs that the control variate exploits.
/// Groups are constructed once per allocation structure and persist across
/// the whole iterative solve.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ModelGroup {
    id: usize,
    members: Vec<ModelKey>,
}

impl ModelGroup {
    /// Construct a group from its member entries. Members must be non-empty
    /// and are kept in the order given.
    pub fn new(id: usize, members: Vec<ModelKey>) -> Self {
        debug_assert!(!members.is_empty());
        Self { id, members }
    }

    /// The group identifier.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The member entries of this group.
    pub fn members(&self) -> &[ModelKey] {
        &self.members
    }

    /// The cost of one group draw: the sum of the member costs as given by
    /// `cost_of`.
    pub fn cost<T, F>(&self, cost_of: F) -> T
    where
        T: Float,
        F: Fn(ModelKey) -> T,
    {
        self.members
            .iter()
            .fold(T::zero(), |acc, &m| acc + cost_of(m))
    }
}

/// Per-model sample accounting.
///
/// `alloc` counts the samples attempted for the model and is monotonically
/// non-decreasing; the per-QoI `actual` counters track how many samples were
/// successfully accumulated (non-finite responses are excluded per QoI). The
/// invariant `actual[q] <= alloc` holds at all times.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SampleCounters {
    alloc: usize,
    actual: Vec<usize>,
}

impl SampleCounters {
    /// New counters for a model with `num_qoi` quantities of interest.
    pub fn new(num_qoi: usize) -> Self {
        Self {
            alloc: 0,
            actual: vec![0; num_qoi],
        }
    }

    /// Record that `n` further samples have been allocated (attempted).
    pub fn allocate(&mut self, n: usize) {
        self.alloc += n;
    }

    /// Overwrite the per-QoI actual counts with the counts recovered from an
    /// accumulator. Counts never decrease.
    pub fn update_actual(&mut self, counts: &[usize]) {
        debug_assert_eq!(counts.len(), self.actual.len());
        for (a, &c) in self.actual.iter_mut().zip(counts.iter()) {
            debug_assert!(c >= *a);
            *a = c;
        }
        debug_assert!(self.actual.iter().all(|&a| a <= self.alloc));
    }

    /// The number of samples allocated so far.
    pub fn alloc(&self) -> usize {
        self.alloc
    }

    /// The per-QoI numbers of successfully accumulated samples.
    pub fn actual(&self) -> &[usize] {
        &self.actual
    }

    /// The smallest per-QoI actual count, i.e. the number of samples usable
    /// by every QoI.
    pub fn min_actual(&self) -> usize {
        self.actual.iter().copied().min().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_cost_is_sum_of_member_costs() {
        let group = ModelGroup::new(
            0,
            vec![ModelKey::new(0, 0), ModelKey::new(1, 0), ModelKey::new(2, 0)],
        );
        let cost: f64 = group.cost(|k| (k.form + 1) as f64);
        assert_eq!(cost, 6.0);
    }

    #[test]
    fn counters_track_alloc_and_actual_independently() {
        let mut counters = SampleCounters::new(3);
        counters.allocate(10);
        counters.update_actual(&[10, 8, 9]);
        assert_eq!(counters.alloc(), 10);
        assert_eq!(counters.actual(), &[10, 8, 9]);
        assert_eq!(counters.min_actual(), 8);

        counters.allocate(5);
        counters.update_actual(&[14, 13, 12]);
        assert_eq!(counters.alloc(), 15);
        assert_eq!(counters.min_actual(), 12);
    }
}

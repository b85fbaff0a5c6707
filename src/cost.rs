//! Per-entry evaluation cost, user-specified or recovered online.

use crate::core::{ModelKey, Response};
use crate::error::EstimationError;
use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};

/// Evaluation cost per ensemble entry.
///
/// Costs either come from a static user-specified table or are recovered
/// online: after the pilot batch, the timing metadata attached to the
/// returned responses is averaged per entry. Either way, [`resolve`] turns
/// the model into a plain cost vector, ordered like the ensemble entries,
/// which the allocation solvers consume.
///
/// [`resolve`]: CostModel::resolve
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CostModel<T> {
    entries: Vec<ModelKey>,
    specified: Vec<Option<T>>,
    time_sums: Vec<T>,
    time_counts: Vec<usize>,
}

impl<T: Float + FromPrimitive> CostModel<T> {
    /// A cost model for the given entries. `specified[i]` carries the
    /// user-specified cost of entry `i`, or `None` to recover that entry's
    /// cost online.
    pub fn new(entries: Vec<ModelKey>, specified: Vec<Option<T>>) -> Self {
        debug_assert_eq!(entries.len(), specified.len());
        let n = entries.len();
        Self {
            entries,
            specified,
            time_sums: vec![T::zero(); n],
            time_counts: vec![0; n],
        }
    }

    /// Record the timing metadata of one response of entry `entry_idx`.
    /// Responses without metadata are ignored here; whether that is fatal is
    /// decided by [`resolve`](CostModel::resolve).
    pub fn record(&mut self, entry_idx: usize, response: &Response<T>) {
        if let Some(t) = response.eval_time {
            self.time_sums[entry_idx] = self.time_sums[entry_idx] + t;
            self.time_counts[entry_idx] += 1;
        }
    }

    /// Resolve to one cost per entry. User-specified costs win; otherwise
    /// the recorded evaluation times are averaged. Missing metadata or
    /// non-positive costs are fatal configuration errors.
    pub fn resolve(&self) -> Result<Vec<T>, EstimationError> {
        let mut costs = Vec::with_capacity(self.entries.len());
        for (i, &key) in self.entries.iter().enumerate() {
            let cost = match self.specified[i] {
                Some(c) => c,
                None => {
                    if self.time_counts[i] == 0 {
                        return Err(EstimationError::MissingCostMetadata {
                            form: key.form,
                            level: key.level,
                        });
                    }
                    self.time_sums[i] / T::from_usize(self.time_counts[i]).unwrap()
                }
            };
            if !(cost > T::zero()) {
                return Err(EstimationError::NonPositiveCost {
                    form: key.form,
                    level: key.level,
                });
            }
            costs.push(cost);
        }
        Ok(costs)
    }
}

/// Total cost of `counts` evaluations per entry, normalized into units of
/// one truth-model evaluation. The truth cost is the last element of
/// `costs`.
pub fn equivalent_hf_cost<T: Float + FromPrimitive>(counts: &[T], costs: &[T]) -> T {
    debug_assert_eq!(counts.len(), costs.len());
    debug_assert!(!costs.is_empty());
    let total = counts
        .iter()
        .zip(costs.iter())
        .fold(T::zero(), |acc, (&n, &c)| acc + n * c);
    total / *costs.last().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn keys() -> Vec<ModelKey> {
        vec![ModelKey::new(0, 0), ModelKey::new(1, 0)]
    }

    #[test]
    fn user_specified_costs_resolve_unchanged() {
        let model = CostModel::new(keys(), vec![Some(0.1), Some(1.0)]);
        assert_eq!(model.resolve().unwrap(), vec![0.1, 1.0]);
    }

    #[test]
    fn online_costs_average_the_recorded_times() {
        let mut model = CostModel::<f64>::new(keys(), vec![None, None]);
        model.record(0, &Response::with_time(vec![0.0], 0.2));
        model.record(0, &Response::with_time(vec![0.0], 0.4));
        model.record(1, &Response::with_time(vec![0.0], 2.0));

        let costs = model.resolve().unwrap();
        assert_approx_eq!(costs[0], 0.3);
        assert_approx_eq!(costs[1], 2.0);
    }

    #[test]
    fn missing_metadata_is_fatal() {
        let mut model = CostModel::<f64>::new(keys(), vec![None, None]);
        model.record(0, &Response::with_time(vec![0.0], 0.2));
        // entry 1 never reports a time
        model.record(1, &Response::new(vec![0.0]));

        assert_eq!(
            model.resolve(),
            Err(EstimationError::MissingCostMetadata { form: 1, level: 0 })
        );
    }

    #[test]
    fn equivalent_cost_is_normalized_to_the_truth_entry() {
        // 40 approximation draws at cost 0.1 plus 10 truth draws at cost 2.0
        let equiv = equivalent_hf_cost(&[40.0, 10.0], &[0.1, 2.0]);
        assert_approx_eq!(equiv, (40.0 * 0.1 + 10.0 * 2.0) / 2.0);
    }
}

//! Multilevel control-variate allocation.
//!
//! The estimator telescopes the truth model over its resolution levels,
//! $\mathbb{E}[H] = \sum_l \mathbb{E}[Y^H_l]$ with $Y^H_l = H_l - H_{l-1}$,
//! and controls each level discrepancy with the weighted approximation
//! discrepancy $Y^L_l(\gamma_l)$. Each level keeps the control-variate
//! variance fraction $\Lambda_l = 1 - \dot\rho^2_l (r_l - 1) / r_l$ and the
//! classic multilevel square-root rule distributes the truth samples as
//! $N_l \propto \sqrt{V_l \Lambda_l / C_l}$.

use crate::solvers::analytic::cvmc_eval_ratio;
use crate::solvers::{AllocationMode, SMALL_NUMBER};
use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Per-level inputs to the multilevel allocation, already averaged over QoI.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct LevelStats<T> {
    /// Variance of the truth discrepancy $Y^H_l$.
    pub var_yh: T,
    /// Discrepancy-adjusted squared correlation $\dot\rho^2_l$; `None`
    /// flags a degenerate estimate.
    pub rho_dot_sq: Option<T>,
    /// Cost of one truth draw at this level (levels $l$ and $l-1$ combined
    /// for $l > 0$), in the ensemble's cost units.
    pub hf_cost: T,
    /// Cost of one approximation draw at this level, same convention.
    pub lf_cost: T,
}

/// Per-level allocation produced by [`multilevel_allocation`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MlSolutionData<T> {
    hf_targets: Vec<T>,
    eval_ratios: Vec<T>,
    avg_estvar: T,
    equiv_hf_cost: T,
}

impl<T: Float> MlSolutionData<T> {
    /// Truth sample targets per level.
    pub fn hf_targets(&self) -> &[T] {
        &self.hf_targets
    }

    /// Approximation evaluation ratios per level.
    pub fn eval_ratios(&self) -> &[T] {
        &self.eval_ratios
    }

    /// Estimator variance of the telescoped estimator at these targets.
    pub fn avg_estvar(&self) -> T {
        self.avg_estvar
    }

    /// Total allocation cost normalized to truth evaluations at the finest
    /// level.
    pub fn equiv_hf_cost(&self) -> T {
        self.equiv_hf_cost
    }
}

/// Variance fraction retained by the control variate at one level,
/// $\Lambda = 1 - \dot\rho^2 (r - 1) / r$, clamped into
/// `[SMALL_NUMBER, 1]`.
pub fn variance_fraction<T: Float + FromPrimitive>(rho_dot_sq: Option<T>, r: T) -> T {
    let one_minus = T::one() - T::from_f64(SMALL_NUMBER).unwrap();
    let rho_sq = rho_dot_sq.unwrap_or(one_minus);
    (T::one() - rho_sq * (r - T::one()) / r)
        .max(T::from_f64(SMALL_NUMBER).unwrap())
        .min(T::one())
}

/// Solve the per-level allocation.
///
/// In budget mode the budget is expressed in equivalent truth evaluations at
/// the finest level and is spent exactly; in accuracy mode the targets are
/// scaled so that $\sum_l V_l \Lambda_l / N_l$ meets the variance target.
pub fn multilevel_allocation<T>(
    stats: &[LevelStats<T>],
    mode: AllocationMode<T>,
) -> MlSolutionData<T>
where
    T: Float + FromPrimitive + AddAssign,
{
    debug_assert!(!stats.is_empty());
    let finest_hf_cost = stats.last().unwrap().hf_cost;

    // per-level LF ratio and the amortized cost of one truth draw with its
    // approximation companions
    let mut eval_ratios = Vec::with_capacity(stats.len());
    let mut level_costs = Vec::with_capacity(stats.len());
    let mut lambdas = Vec::with_capacity(stats.len());
    for s in stats {
        let r = cvmc_eval_ratio(s.hf_cost / s.lf_cost, s.rho_dot_sq).max(T::one());
        let lambda = variance_fraction(s.rho_dot_sq, r);
        level_costs.push(s.hf_cost + r * s.lf_cost);
        lambdas.push(lambda);
        eval_ratios.push(r);
    }

    // multilevel square-root rule with control-variate-reduced variances
    let mut normalizer = T::zero();
    for (s, (&lambda, &cost)) in stats.iter().zip(lambdas.iter().zip(level_costs.iter())) {
        normalizer += (s.var_yh * lambda * cost).sqrt();
    }

    let scale = match mode {
        AllocationMode::Budget(budget) => {
            let budget_cost = budget * finest_hf_cost;
            if normalizer > T::zero() {
                budget_cost / normalizer
            } else {
                T::zero()
            }
        }
        AllocationMode::Accuracy(target) => normalizer / target,
    };

    let mut hf_targets = Vec::with_capacity(stats.len());
    let mut avg_estvar = T::zero();
    let mut total_cost = T::zero();
    for (s, (&lambda, &cost)) in stats.iter().zip(lambdas.iter().zip(level_costs.iter())) {
        let n_l = if cost > T::zero() {
            (scale * (s.var_yh * lambda / cost).sqrt()).max(T::one())
        } else {
            T::one()
        };
        avg_estvar += s.var_yh * lambda / n_l;
        total_cost += n_l * cost;
        hf_targets.push(n_l);
    }

    MlSolutionData {
        hf_targets,
        eval_ratios,
        avg_estvar,
        equiv_hf_cost: total_cost / finest_hf_cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn three_levels() -> Vec<LevelStats<f64>> {
        vec![
            LevelStats {
                var_yh: 8.0,
                rho_dot_sq: Some(0.64),
                hf_cost: 1.0,
                lf_cost: 0.1,
            },
            LevelStats {
                var_yh: 2.0,
                rho_dot_sq: Some(0.81),
                hf_cost: 4.0,
                lf_cost: 0.4,
            },
            LevelStats {
                var_yh: 0.5,
                rho_dot_sq: Some(0.9),
                hf_cost: 16.0,
                lf_cost: 1.6,
            },
        ]
    }

    #[test]
    fn budget_is_spent_up_to_the_integer_floor() {
        let budget = 200.0;
        let solution = multilevel_allocation(&three_levels(), AllocationMode::Budget(budget));

        assert!(solution.equiv_hf_cost() <= budget * (1.0 + 1e-10));
        assert!(solution.hf_targets().iter().all(|&n| n >= 1.0));
        // coarser levels receive more samples
        assert!(solution.hf_targets()[0] > solution.hf_targets()[1]);
        assert!(solution.hf_targets()[1] > solution.hf_targets()[2]);
    }

    #[test]
    fn accuracy_mode_meets_the_variance_target() {
        let target = 1e-2;
        let solution = multilevel_allocation(&three_levels(), AllocationMode::Accuracy(target));
        assert!(solution.avg_estvar() <= target * (1.0 + 1e-10));
    }

    #[test]
    fn degenerate_level_correlation_stays_finite() {
        let mut stats = three_levels();
        stats[1].rho_dot_sq = None;
        let solution = multilevel_allocation(&stats, AllocationMode::Budget(100.0));
        assert!(solution.eval_ratios()[1].is_finite());
        assert!(solution.avg_estvar().is_finite());
    }

    #[test]
    fn variance_fraction_is_clamped() {
        assert_approx_eq!(variance_fraction(Some(0.81), 1.0), 1.0);
        let lambda = variance_fraction(Some(0.81), 10.0);
        assert_approx_eq!(lambda, 1.0 - 0.81 * 0.9, 1e-12);
        assert!(variance_fraction(None, 1e9) > 0.0);
    }
}

//! Closed-form control-variate and MFMC allocation.
//!
//! For a pairwise control variate (one approximation $L$, one truth $H$) the
//! variance-optimal evaluation ratio is
//!
//! $$ r = \sqrt{\frac{c_H}{c_L} \frac{\rho^2}{1 - \rho^2}} $$
//!
//! and for an ensemble of approximations with strictly ordered correlations
//! the MFMC pyramid formula assigns each approximation a ratio from the
//! telescoping correlation differences. A monotonicity repair pass makes the
//! ratios usable when the estimated correlation structure is not strictly
//! ordered.

use crate::solvers::{AllocationMode, SolutionData, RATIO_NUDGE, SMALL_NUMBER};
use num_traits::{Float, FromPrimitive};
use std::cmp::Ordering;
use std::ops::AddAssign;

/// Correlation/variance statistics of one QoI, as consumed by the
/// allocation solvers.
#[derive(Clone, Debug)]
pub struct QoiStats<T> {
    /// Unbiased variance of the truth model.
    pub var_h: T,
    /// Squared correlation with the truth per approximation, ordered lowest
    /// to highest fidelity. `None` flags a degenerate (near-perfect or
    /// unestimable) correlation.
    pub rho_sq: Vec<Option<T>>,
}

fn small<T: FromPrimitive>() -> T {
    T::from_f64(SMALL_NUMBER).unwrap()
}

/// The pairwise control-variate evaluation ratio. A degenerate correlation
/// substitutes `cost_ratio / SMALL_NUMBER` for the correlation term, keeping
/// the ratio large but finite.
pub fn cvmc_eval_ratio<T: Float + FromPrimitive>(cost_ratio: T, rho_sq: Option<T>) -> T {
    match rho_sq {
        Some(r2) => (cost_ratio * r2 / (T::one() - r2)).sqrt(),
        None => (cost_ratio / small::<T>()).sqrt(),
    }
}

/// Enforce non-increasing evaluation ratios along a sequence ordered by
/// ascending correlation: a running max swept from the most-correlated end
/// lifts every violating entry to its better-correlated neighbour.
/// Idempotent on already-monotone input.
pub fn enforce_monotone_ratios<T: Float>(ratios: &mut [T]) {
    for k in (0..ratios.len().saturating_sub(1)).rev() {
        if ratios[k] < ratios[k + 1] {
            ratios[k] = ratios[k + 1];
        }
    }
}

/// Strictly decreasing lower bounds `1 + k * nudge` along the ascending
/// correlation ordering, with the most-correlated approximation closest to
/// one. Keeps every ratio strictly above one and breaks ties
/// deterministically.
pub fn ratio_lower_bounds<T: Float + FromPrimitive>(num_approx: usize) -> Vec<T> {
    let nudge = T::from_f64(RATIO_NUDGE).unwrap();
    (0..num_approx)
        .map(|k| T::one() + T::from_usize(num_approx - k).unwrap() * nudge)
        .collect()
}

/// Average of the per-QoI squared correlations for approximation `approx`,
/// with degenerate entries treated as just-below-perfect.
fn avg_rho_sq<T: Float + FromPrimitive>(stats: &[QoiStats<T>], approx: usize) -> T {
    let one_minus = T::one() - small::<T>();
    let sum = stats
        .iter()
        .fold(T::zero(), |acc, s| acc + s.rho_sq[approx].unwrap_or(one_minus));
    sum / T::from_usize(stats.len()).unwrap()
}

/// The estimator-variance ratio $1 - \sum_k \frac{r_k - 1}{r_k}
/// (\rho^2_{(k)} - \rho^2_{(k-1)})$ for one QoI, evaluated along the
/// ordering `order` (ascending correlation) with $\rho^2_{(-1)} = 0$.
/// Clamped into `[SMALL_NUMBER, 1]`.
fn estvar_ratio_for_qoi<T: Float + FromPrimitive>(
    ratios_ord: &[T],
    stats: &QoiStats<T>,
    order: &[usize],
) -> T {
    let one_minus = T::one() - small::<T>();
    let mut prev = T::zero();
    let mut reduction = T::zero();
    for (k, &i) in order.iter().enumerate() {
        let r = ratios_ord[k];
        let rho_sq = stats.rho_sq[i].unwrap_or(one_minus);
        reduction = reduction + (r - T::one()) / r * (rho_sq - prev);
        prev = rho_sq;
    }
    (T::one() - reduction).max(small::<T>()).min(T::one())
}

/// Closed-form MFMC allocation.
///
/// `costs` holds the per-approximation costs ordered lowest to highest
/// fidelity, `cost_h` the truth cost and `stats` one entry per QoI. With
/// `reorder` set, the approximations are first sorted by their average
/// correlation and the pyramid formula is applied along that sequence; the
/// sorted sequence affects only the variance formula and the ratio
/// assignment, never the model labels. The returned ratios are indexed in
/// the original approximation order.
pub fn mfmc_allocation<T>(
    costs: &[T],
    cost_h: T,
    stats: &[QoiStats<T>],
    mode: AllocationMode<T>,
    reorder: bool,
) -> SolutionData<T>
where
    T: Float + FromPrimitive + AddAssign,
{
    debug_assert!(!costs.is_empty());
    debug_assert!(!stats.is_empty());
    let m = costs.len();
    let num_qoi = T::from_usize(stats.len()).unwrap();

    let avg: Vec<T> = (0..m).map(|i| avg_rho_sq(stats, i)).collect();

    let mut order: Vec<usize> = (0..m).collect();
    if reorder {
        order.sort_by(|&a, &b| avg[a].partial_cmp(&avg[b]).unwrap_or(Ordering::Equal));
    }

    // pyramid formula along the ordered sequence
    let denom = (T::one() - avg[order[m - 1]]).max(small::<T>());
    let mut ratios_ord: Vec<T> = Vec::with_capacity(m);
    let mut prev = T::zero();
    for &i in &order {
        let num = (avg[i] - prev).max(T::zero());
        ratios_ord.push((cost_h / costs[i] * num / denom).sqrt());
        prev = avg[i];
    }

    enforce_monotone_ratios(&mut ratios_ord);
    let bounds = ratio_lower_bounds::<T>(m);
    for (r, &b) in ratios_ord.iter_mut().zip(bounds.iter()) {
        if *r < b {
            *r = b;
        }
    }

    let mut eval_ratios = vec![T::one(); m];
    for (k, &i) in order.iter().enumerate() {
        eval_ratios[i] = ratios_ord[k];
    }

    // average the per-QoI estimator-variance ratios and reference variances
    let mut avg_ratio = T::zero();
    let mut avg_var_reduced = T::zero();
    let mut avg_var_h = T::zero();
    for s in stats {
        let ratio = estvar_ratio_for_qoi(&ratios_ord, s, &order);
        avg_ratio += ratio;
        avg_var_reduced += s.var_h * ratio;
        avg_var_h += s.var_h;
    }
    avg_ratio = avg_ratio / num_qoi;
    avg_var_reduced = avg_var_reduced / num_qoi;
    avg_var_h = avg_var_h / num_qoi;

    // cost of one truth draw plus its approximation companions, in
    // equivalent-HF units
    let mut cost_per_hf = T::one();
    for (i, &r) in eval_ratios.iter().enumerate() {
        cost_per_hf += r * costs[i] / cost_h;
    }

    let hf_target = match mode {
        AllocationMode::Budget(budget) => budget / cost_per_hf,
        AllocationMode::Accuracy(target) => avg_var_reduced / target,
    };
    let avg_estvar = if hf_target > T::zero() {
        avg_var_reduced / hf_target
    } else {
        avg_var_h
    };
    let equiv_hf_cost = hf_target * cost_per_hf;

    SolutionData::new(eval_ratios, hf_target, avg_estvar, avg_ratio, equiv_hf_cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn stats(var_h: f64, rho_sq: Vec<Option<f64>>) -> Vec<QoiStats<f64>> {
        vec![QoiStats { var_h, rho_sq }]
    }

    #[test]
    fn two_model_cvmc_scenario() {
        // cost_H = 1, cost_L = 0.1, rho^2 = 0.81, budget = 100 equivalent-HF
        let r = cvmc_eval_ratio(10.0, Some(0.81));
        assert_approx_eq!(r, (10.0_f64 * 0.81 / 0.19).sqrt(), 1e-12);
        assert_approx_eq!(r, 6.52, 0.01);

        let solution = mfmc_allocation(
            &[0.1],
            1.0,
            &stats(4.0, vec![Some(0.81)]),
            AllocationMode::Budget(100.0),
            false,
        );
        let n_h = solution.hf_target();
        let n_l = solution.approx_targets()[0];
        assert_approx_eq!(solution.eval_ratios()[0], r, 1e-10);
        // the allocation jointly exhausts the budget
        assert_approx_eq!(n_h + 0.1 * n_l, 100.0, 1e-8);
        assert!(solution.equiv_hf_cost() <= 100.0 * (1.0 + 1e-10));
    }

    #[test]
    fn degenerate_correlation_stays_finite() {
        let r = cvmc_eval_ratio(10.0, Some(0.999999));
        assert!(r.is_finite());

        // correlations computed >= 1 arrive as `None` and take the sentinel
        let r = cvmc_eval_ratio(10.0, None);
        assert!(r.is_finite());
        assert!(r <= (10.0 / SMALL_NUMBER).sqrt());

        let solution = mfmc_allocation(
            &[0.1],
            1.0,
            &stats(1.0, vec![None]),
            AllocationMode::Budget(1000.0),
            false,
        );
        assert!(solution.eval_ratios()[0].is_finite());
        assert!(solution.avg_estvar().is_finite());
        assert!(solution.hf_target().is_finite());
    }

    #[test]
    fn monotone_repair_is_idempotent() {
        let mut already = vec![9.0, 5.0, 2.0, 1.5];
        let expected = already.clone();
        enforce_monotone_ratios(&mut already);
        assert_eq!(already, expected);
        enforce_monotone_ratios(&mut already);
        assert_eq!(already, expected);
    }

    #[test]
    fn monotone_repair_lifts_violations_from_the_correlated_end() {
        let mut ratios = vec![3.0, 6.0, 2.0, 2.5];
        enforce_monotone_ratios(&mut ratios);
        assert_eq!(ratios, vec![6.0, 6.0, 2.5, 2.5]);
    }

    #[test]
    fn lower_bounds_are_strictly_decreasing_and_above_one() {
        let bounds = ratio_lower_bounds::<f64>(3);
        assert!(bounds[0] > bounds[1] && bounds[1] > bounds[2]);
        assert!(bounds[2] > 1.0);
    }

    #[test]
    fn budget_feasibility_over_configurations() {
        let budgets = [50.0, 200.0, 1000.0];
        let configs: Vec<(Vec<f64>, Vec<Option<f64>>)> = vec![
            (vec![0.01, 0.1], vec![Some(0.49), Some(0.81)]),
            (vec![0.05, 0.2, 0.5], vec![Some(0.3), Some(0.7), Some(0.95)]),
            (vec![0.001], vec![Some(0.9999)]),
            (vec![0.1, 0.3], vec![None, Some(0.5)]),
        ];

        for &budget in &budgets {
            for (costs, rho_sq) in &configs {
                let solution = mfmc_allocation(
                    costs,
                    1.0,
                    &stats(2.0, rho_sq.clone()),
                    AllocationMode::Budget(budget),
                    false,
                );
                let mut total = solution.hf_target();
                for (i, n) in solution.approx_targets().iter().enumerate() {
                    total += n * costs[i];
                }
                assert!(
                    total <= budget * (1.0 + 1e-8),
                    "cost {} exceeds budget {}",
                    total,
                    budget
                );
            }
        }
    }

    #[test]
    fn accuracy_mode_meets_the_variance_target() {
        let target = 1e-3;
        let solution = mfmc_allocation(
            &[0.1],
            1.0,
            &stats(4.0, vec![Some(0.81)]),
            AllocationMode::Accuracy(target),
            false,
        );
        assert_approx_eq!(solution.avg_estvar(), target, 1e-12);
        assert!(solution.hf_target() > 0.0);
    }

    #[test]
    fn reorder_assigns_larger_ratios_to_less_correlated_models() {
        // natural order violates the ascending-correlation assumption
        let solution = mfmc_allocation(
            &[0.05, 0.1],
            1.0,
            &stats(1.0, vec![Some(0.9), Some(0.5)]),
            AllocationMode::Budget(500.0),
            true,
        );
        let r = solution.eval_ratios();
        // model 1 is the less correlated one and must not receive a larger
        // ratio than model 0
        assert!(r[0] >= r[1]);
        assert!(r.iter().all(|&x| x > 1.0));
    }

    #[test]
    fn estvar_ratio_matches_the_pairwise_closed_form() {
        // one approximation: 1 - rho^2 (r - 1) / r
        let solution = mfmc_allocation(
            &[0.1],
            1.0,
            &stats(1.0, vec![Some(0.81)]),
            AllocationMode::Budget(100.0),
            false,
        );
        let r = solution.eval_ratios()[0];
        let expected = 1.0 - 0.81 * (r - 1.0) / r;
        assert_approx_eq!(solution.avg_estvar_ratio(), expected, 1e-12);
    }
}

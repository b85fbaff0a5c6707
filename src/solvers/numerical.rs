//! Numerically optimized allocation.
//!
//! The allocation is posed as a nonlinear program over the per-approximation
//! evaluation ratios and the truth sample target. In budget mode the
//! objective is $\ln \bar{V}_\mathrm{est}(x)$ (log space improves the
//! conditioning of the near-flat variance landscape) with the linear budget
//! constraint handled through a quadratic penalty; in accuracy mode the
//! objective is the log of the equivalent-HF cost with the variance target
//! as a penalized nonlinear constraint.
//!
//! Interior solvers stay behind the [`Minimizer`] trait and receive the
//! objective as an explicit closure over the problem context; nothing in
//! this module relies on process-wide state, so nested solves are safe. Two
//! built-in direct-search minimizers are provided and run in competition;
//! the candidate with the lowest penalty merit wins, and non-convergence is
//! a warning rather than an error.

use crate::solvers::analytic::{self, QoiStats};
use crate::solvers::{AllocationMode, SolutionData, RATIO_NUDGE, SMALL_NUMBER};
use log::warn;
use num_traits::{Float, FromPrimitive};
use std::ops::AddAssign;

/// Scale of the quadratic constraint penalty added to the log-space
/// objective.
const PENALTY_SCALE: f64 = 1.0e+6;

/// Result of one interior minimization.
#[derive(Clone, Debug)]
pub struct MinimizeResult<T> {
    /// The best design vector found.
    pub x: Vec<T>,
    /// The penalty merit at `x`.
    pub merit: T,
    /// Whether the solver met its own convergence criterion before running
    /// into its iteration cap.
    pub converged: bool,
}

/// A bounded minimization routine. Implementations are pure searches over a
/// box; all problem knowledge arrives through the objective closure.
pub trait Minimizer<T: Float> {
    /// Minimize `f` over the box `[lb, ub]`, starting from `x0`.
    fn minimize(
        &self,
        f: &dyn Fn(&[T]) -> T,
        lb: &[T],
        ub: &[T],
        x0: &[T],
    ) -> MinimizeResult<T>;
}

/// Coordinate scan over a dyadically refined grid: a derivative-free global
/// stage in the spirit of DIRECT. Has no native constraint support, which is
/// why the problem wraps its constraints into the penalty merit.
#[derive(Clone, Copy, Debug)]
pub struct DyadicScan {
    /// Number of grid refinement levels.
    pub levels: usize,
    /// Sweeps over all coordinates per level.
    pub sweeps: usize,
}

impl Default for DyadicScan {
    fn default() -> Self {
        Self {
            levels: 6,
            sweeps: 3,
        }
    }
}

impl<T: Float + FromPrimitive> Minimizer<T> for DyadicScan {
    fn minimize(
        &self,
        f: &dyn Fn(&[T]) -> T,
        lb: &[T],
        ub: &[T],
        x0: &[T],
    ) -> MinimizeResult<T> {
        let dim = x0.len();
        let mut best = x0.to_vec();
        let mut best_merit = f(&best);

        for level in 0..self.levels {
            let divisions = 1_usize << (level + 1);
            for _ in 0..self.sweeps {
                let mut improved = false;
                for d in 0..dim {
                    if ub[d] <= lb[d] {
                        continue;
                    }
                    let step = (ub[d] - lb[d]) / T::from_usize(divisions).unwrap();
                    let mut candidate = best.clone();
                    for k in 0..=divisions {
                        candidate[d] = lb[d] + step * T::from_usize(k).unwrap();
                        let merit = f(&candidate);
                        if merit < best_merit {
                            best_merit = merit;
                            best[d] = candidate[d];
                            improved = true;
                        }
                    }
                }
                if !improved {
                    break;
                }
            }
        }

        MinimizeResult {
            x: best,
            merit: best_merit,
            // a global scan has no convergence criterion of its own
            converged: true,
        }
    }
}

/// Compass (pattern) search: local gradient-free refinement with step
/// halving, the SQP-refinement stage of the competition.
#[derive(Clone, Copy, Debug)]
pub struct CompassSearch {
    /// Iteration cap; the search always terminates.
    pub max_iterations: usize,
    /// Relative step size at which the search declares convergence.
    pub tolerance: f64,
}

impl Default for CompassSearch {
    fn default() -> Self {
        Self {
            max_iterations: 400,
            tolerance: 1.0e-8,
        }
    }
}

impl<T: Float + FromPrimitive> Minimizer<T> for CompassSearch {
    fn minimize(
        &self,
        f: &dyn Fn(&[T]) -> T,
        lb: &[T],
        ub: &[T],
        x0: &[T],
    ) -> MinimizeResult<T> {
        let dim = x0.len();
        let mut best = x0.to_vec();
        let mut best_merit = f(&best);
        let half = T::from_f64(0.5).unwrap();
        let tol = T::from_f64(self.tolerance).unwrap();

        let mut steps: Vec<T> = (0..dim)
            .map(|d| {
                let width = ub[d] - lb[d];
                if width > T::zero() {
                    width * T::from_f64(0.25).unwrap()
                } else {
                    T::zero()
                }
            })
            .collect();

        let mut converged = false;
        for _ in 0..self.max_iterations {
            let mut improved = false;
            for d in 0..dim {
                if steps[d] <= T::zero() {
                    continue;
                }
                for &sign in &[T::one(), -T::one()] {
                    let mut candidate = best.clone();
                    candidate[d] = (candidate[d] + sign * steps[d]).max(lb[d]).min(ub[d]);
                    let merit = f(&candidate);
                    if merit < best_merit {
                        best_merit = merit;
                        best = candidate;
                        improved = true;
                    }
                }
            }
            if !improved {
                for s in steps.iter_mut() {
                    *s = *s * half;
                }
                let max_rel = steps
                    .iter()
                    .zip(lb.iter().zip(ub.iter()))
                    .map(|(&s, (&l, &u))| {
                        let width = u - l;
                        if width > T::zero() {
                            s / width
                        } else {
                            T::zero()
                        }
                    })
                    .fold(T::zero(), T::max);
                if max_rel < tol {
                    converged = true;
                    break;
                }
            }
        }

        MinimizeResult {
            x: best,
            merit: best_merit,
            converged,
        }
    }
}

/// The allocation nonlinear program. Design vector: `x[0..m]` are the
/// evaluation ratios, `x[m]` is the truth sample target.
pub struct AllocationProblem<'a, T> {
    costs: &'a [T],
    cost_h: T,
    stats: &'a [QoiStats<T>],
    mode: AllocationMode<T>,
    /// Equivalent-HF cost already incurred by previous increments.
    incurred_cost: T,
}

impl<'a, T> AllocationProblem<'a, T>
where
    T: Float + FromPrimitive + AddAssign,
{
    /// Set up the program.
    pub fn new(
        costs: &'a [T],
        cost_h: T,
        stats: &'a [QoiStats<T>],
        mode: AllocationMode<T>,
        incurred_cost: T,
    ) -> Self {
        Self {
            costs,
            cost_h,
            stats,
            mode,
            incurred_cost,
        }
    }

    fn num_approx(&self) -> usize {
        self.costs.len()
    }

    /// Total cost of the design `x` in equivalent-HF units.
    fn equiv_cost(&self, x: &[T]) -> T {
        let m = self.num_approx();
        let n_h = x[m];
        let mut per_hf = T::one();
        for (i, &r) in x[..m].iter().enumerate() {
            per_hf += r * self.costs[i] / self.cost_h;
        }
        n_h * per_hf
    }

    /// Average estimator variance of the design `x`.
    fn avg_estvar(&self, x: &[T]) -> T {
        let m = self.num_approx();
        let n_h = x[m].max(T::from_f64(SMALL_NUMBER).unwrap());
        let one_minus = T::one() - T::from_f64(SMALL_NUMBER).unwrap();

        let mut acc = T::zero();
        for s in self.stats {
            // pairwise correlation differences along the natural ordering
            let mut prev = T::zero();
            let mut reduction = T::zero();
            for (i, &r) in x[..m].iter().enumerate() {
                let rho_sq = s.rho_sq[i].unwrap_or(one_minus);
                let r = r.max(T::one() + T::from_f64(SMALL_NUMBER).unwrap());
                reduction = reduction + (r - T::one()) / r * (rho_sq - prev);
                prev = rho_sq;
            }
            let ratio = (T::one() - reduction)
                .max(T::from_f64(SMALL_NUMBER).unwrap())
                .min(T::one());
            acc += s.var_h * ratio / n_h;
        }
        acc / T::from_usize(self.stats.len()).unwrap()
    }

    /// The penalty merit: log-space objective plus a quadratic penalty on
    /// the relative violation of the constraint the interior solvers cannot
    /// enforce natively.
    pub fn merit(&self, x: &[T]) -> T {
        let penalty = T::from_f64(PENALTY_SCALE).unwrap();
        let tiny = T::from_f64(SMALL_NUMBER).unwrap();
        match self.mode {
            AllocationMode::Budget(budget) => {
                let objective = self.avg_estvar(x).max(tiny).ln();
                let violation = ((self.equiv_cost(x) - budget) / budget).max(T::zero());
                objective + penalty * violation * violation
            }
            AllocationMode::Accuracy(target) => {
                let objective = self.equiv_cost(x).max(tiny).ln();
                let violation = ((self.avg_estvar(x) - target) / target).max(T::zero());
                objective + penalty * violation * violation
            }
        }
    }

    /// Box bounds of the design vector. Ratios get the strictly-decreasing
    /// `1 + k * nudge` lower bounds; upper bounds derive from the budget.
    /// If the incurred cost already exceeds the budget, the current point
    /// `x0` serves as both lower and upper bound, never an inverted
    /// interval.
    pub fn bounds(&self, x0: &[T]) -> (Vec<T>, Vec<T>) {
        let m = self.num_approx();
        match self.mode {
            AllocationMode::Budget(budget) if self.incurred_cost >= budget => {
                (x0.to_vec(), x0.to_vec())
            }
            AllocationMode::Budget(budget) => {
                let mut lb = analytic::ratio_lower_bounds::<T>(m);
                lb.push(T::one());
                let mut ub: Vec<T> = (0..m)
                    .map(|i| (budget * self.cost_h / self.costs[i]).max(lb[i]))
                    .collect();
                ub.push(budget.max(T::one()));
                (lb, ub)
            }
            AllocationMode::Accuracy(_) => {
                let mut lb = analytic::ratio_lower_bounds::<T>(m);
                lb.push(T::one());
                let cap = T::from_f64(1.0 / RATIO_NUDGE).unwrap();
                let mut ub: Vec<T> = (0..m)
                    .map(|i| (cap * self.cost_h / self.costs[i]).max(lb[i]))
                    .collect();
                // generous cap; the penalty steers the target itself
                ub.push(x0[m].max(T::one()) * cap);
                (lb, ub)
            }
        }
    }

    /// Recover the immutable solution snapshot from a design vector.
    pub fn recover_results(&self, x: &[T]) -> SolutionData<T> {
        let m = self.num_approx();
        let eval_ratios = x[..m].to_vec();
        let hf_target = x[m];
        let avg_estvar = self.avg_estvar(x);
        let num_qoi = T::from_usize(self.stats.len()).unwrap();
        let avg_var_h = self
            .stats
            .iter()
            .fold(T::zero(), |acc, s| acc + s.var_h)
            / num_qoi;
        let avg_estvar_ratio = if avg_var_h > T::zero() {
            avg_estvar * hf_target / avg_var_h
        } else {
            T::one()
        };
        SolutionData::new(
            eval_ratios,
            hf_target,
            avg_estvar,
            avg_estvar_ratio,
            self.equiv_cost(x),
        )
    }
}

/// Solve the allocation program with a competition of minimizers: a global
/// dyadic scan followed by compass refinement of both the scan result and
/// the warm start. The candidate with the lowest penalty merit wins; if no
/// refinement converged the best candidate is still used, with a warning.
pub fn solve_numerical<T>(
    problem: &AllocationProblem<'_, T>,
    warm_start: &SolutionData<T>,
) -> SolutionData<T>
where
    T: Float + FromPrimitive + AddAssign,
{
    let mut x0: Vec<T> = warm_start.eval_ratios().to_vec();
    x0.push(warm_start.hf_target().max(T::one()));
    let (lb, ub) = problem.bounds(&x0);
    for (v, (&l, &u)) in x0.iter_mut().zip(lb.iter().zip(ub.iter())) {
        *v = (*v).max(l).min(u);
    }

    let merit_fn = |x: &[T]| problem.merit(x);

    let global = DyadicScan::default().minimize(&merit_fn, &lb, &ub, &x0);
    let local = CompassSearch::default();
    let candidates = vec![
        local.minimize(&merit_fn, &lb, &ub, &global.x),
        local.minimize(&merit_fn, &lb, &ub, &x0),
        global,
    ];

    let best = candidates
        .into_iter()
        .min_by(|a, b| {
            a.merit
                .partial_cmp(&b.merit)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap();
    if !best.converged {
        warn!("allocation sub-solve did not converge; proceeding with the best candidate found");
    }

    problem.recover_results(&best.x)
}

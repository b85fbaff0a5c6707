//! Allocation solvers.
//!
//! Given per-entry costs and the correlation/variance statistics recovered
//! from the pilot, a solver produces the number of samples each model should
//! receive so that the estimator variance is minimized for a fixed budget,
//! or the cost is minimized for a fixed accuracy target. The closed-form
//! paths live in [`analytic`], the nonlinear-program path in [`numerical`]
//! and the multilevel control-variate path in [`multilevel`].

pub mod analytic;
pub mod multilevel;
pub mod numerical;

use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};

/// Sentinel used to keep degenerate ratios large but finite.
pub(crate) const SMALL_NUMBER: f64 = 1.0e-12;

/// Lower-bound nudge applied to evaluation ratios so that no ratio can reach
/// exactly one, which would divide by zero downstream.
pub(crate) const RATIO_NUDGE: f64 = 1.0e-4;

/// Constraint regime of the allocation solve. Exactly one of the two
/// regimes applies; the type makes a run without any constraint
/// unrepresentable.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub enum AllocationMode<T> {
    /// Minimize the estimator variance subject to a total budget, expressed
    /// in equivalent high-fidelity evaluations.
    Budget(T),
    /// Minimize cost subject to an absolute average-estimator-variance
    /// target (typically `convergence_tol` times a reference variance).
    Accuracy(T),
}

/// Which allocation algorithm drives the solve.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum AllocationFormula {
    /// Closed-form MFMC pyramid solution in the natural model ordering.
    AnalyticMfmc,
    /// Closed-form MFMC solution over a correlation-sorted model sequence.
    /// The sorted sequence is used only inside the variance formula; model
    /// labels are never permanently reordered.
    AnalyticMfmcReorder,
    /// Nonlinear program over evaluation ratios and the truth target,
    /// warm-started from the analytic solution.
    NumericalMfmc,
    /// Multilevel control variate: the truth model is telescoped over its
    /// resolution levels and each level discrepancy is controlled by the
    /// weighted approximation discrepancy.
    MultilevelCv,
}

/// Solution snapshot produced by an allocation solver.
///
/// Immutable once recovered; the scheduler and the final reporting step
/// consume it read-only.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SolutionData<T> {
    eval_ratios: Vec<T>,
    hf_target: T,
    avg_estvar: T,
    avg_estvar_ratio: T,
    equiv_hf_cost: T,
}

impl<T: Float + FromPrimitive> SolutionData<T> {
    /// Assemble a solution snapshot.
    pub fn new(
        eval_ratios: Vec<T>,
        hf_target: T,
        avg_estvar: T,
        avg_estvar_ratio: T,
        equiv_hf_cost: T,
    ) -> Self {
        Self {
            eval_ratios,
            hf_target,
            avg_estvar,
            avg_estvar_ratio,
            equiv_hf_cost,
        }
    }

    /// Per-approximation evaluation ratios $r_i = N_i / N_H$, ordered like
    /// the ensemble approximations (lowest to highest fidelity).
    pub fn eval_ratios(&self) -> &[T] {
        &self.eval_ratios
    }

    /// The truth-model sample target $N_H$ (real-valued; the scheduler
    /// rounds via its one-sided increments).
    pub fn hf_target(&self) -> T {
        self.hf_target
    }

    /// Per-approximation absolute sample targets $N_i = r_i N_H$.
    pub fn approx_targets(&self) -> Vec<T> {
        self.eval_ratios
            .iter()
            .map(|&r| r * self.hf_target)
            .collect()
    }

    /// The average (over QoI) estimator variance at this allocation.
    pub fn avg_estvar(&self) -> T {
        self.avg_estvar
    }

    /// The average ratio of estimator variance to the plain Monte Carlo
    /// variance at the same number of truth samples, $1 - R^2$.
    pub fn avg_estvar_ratio(&self) -> T {
        self.avg_estvar_ratio
    }

    /// Total allocation cost in equivalent high-fidelity evaluations.
    pub fn equiv_hf_cost(&self) -> T {
        self.equiv_hf_cost
    }
}

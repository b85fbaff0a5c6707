//! Iterative estimation drivers.
//!
//! An [`EnsembleEstimator`] composes an allocation formula, a cost model, a
//! pilot strategy and a relaxation schedule into the outer sampling loop:
//! evaluate a pilot, estimate correlations and variances, solve for the
//! sample allocation, issue one-sided sample increments, and repeat until
//! the increments vanish, the budget is spent or the iteration cap is hit.
//! Each finished iteration produces a serializable [`Checkpoint`] carrying
//! the generator state before and after the iteration, so a run can be
//! replayed or resumed bit-identically.

use crate::callbacks::Callback;
use crate::core::accumulators::{GroupSums, MAX_MOMENT_ORDER};
use crate::core::estimators::{
    control_beta, correlation_sq, covariance, mlmf_control, variance, MlPairSums,
};
use crate::core::{ModelEnsemble, ModelGroup, SampleCounters};
use crate::cost::{equivalent_hf_cost, CostModel};
use crate::error::EstimationError;
use crate::moments::{
    apply_control, mc_equivalent_variance, raw_to_standard, FinalMoments, RawMoments,
};
use crate::scheduler::{draw_samples, one_sided_delta, BatchEvaluator, RelaxationSchedule};
use crate::solvers::analytic::{mfmc_allocation, QoiStats};
use crate::solvers::multilevel::{multilevel_allocation, LevelStats, MlSolutionData};
use crate::solvers::numerical::{solve_numerical, AllocationProblem};
use crate::solvers::{AllocationFormula, AllocationMode, SolutionData};
use num_traits::{Float, FromPrimitive};
use rand::distributions::{Distribution, Standard};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// How the pilot sample relates to the final estimator.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum PilotMode {
    /// The pilot draws count toward both the correlation statistics and the
    /// final estimator, and their cost is charged against the budget.
    Online,
    /// The pilot informs the correlation statistics only; the estimator
    /// starts from fresh draws and the pilot cost is not charged.
    Offline,
    /// Like `Offline`, but no estimator samples are drawn at all: the run
    /// stops after one allocation solve and reports the projected
    /// performance.
    OfflineProjection,
}

/// Configuration of one estimation run.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct EstimatorConfig<T> {
    /// Budget or accuracy constraint. In accuracy mode the value is the
    /// convergence tolerance relative to the pilot Monte Carlo variance.
    pub mode: AllocationMode<T>,
    /// Which allocation algorithm drives the solve.
    pub formula: AllocationFormula,
    /// Number of pilot draws per sampled group.
    pub pilot: usize,
    /// Pilot strategy.
    pub pilot_mode: PilotMode,
    /// Cap on the number of outer iterations.
    pub max_iterations: usize,
    /// With backfill, increments are measured against the fault-tolerant
    /// actual counts instead of the allocated counts, so failed evaluations
    /// are re-attempted.
    pub backfill_failures: bool,
    /// Damping schedule for the early sample increments.
    pub relaxation: RelaxationSchedule<T>,
}

impl<T: Float + FromPrimitive> EstimatorConfig<T> {
    /// A configuration with the given constraint and default strategy
    /// choices: analytic MFMC, an online pilot of 50 draws, at most 25
    /// iterations, no backfill, undamped increments.
    pub fn new(mode: AllocationMode<T>) -> Self {
        Self {
            mode,
            formula: AllocationFormula::AnalyticMfmc,
            pilot: 50,
            pilot_mode: PilotMode::Online,
            max_iterations: 25,
            backfill_failures: false,
            relaxation: RelaxationSchedule::default(),
        }
    }
}

/// Why the outer loop stopped.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum Termination {
    /// All sample increments reached zero.
    Converged,
    /// The incurred cost reached the budget.
    BudgetExhausted,
    /// The iteration cap was hit with increments still outstanding.
    MaxIterations,
}

/// The allocation produced by one solve, either over evaluation ratios or
/// over per-level targets.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub enum AllocationSolution<T> {
    /// Ratio-based solution of the control-variate and MFMC paths.
    MultiFidelity(SolutionData<T>),
    /// Per-level solution of the multilevel path.
    Multilevel(MlSolutionData<T>),
}

impl<T: Float + FromPrimitive> AllocationSolution<T> {
    /// The average estimator variance at this allocation.
    pub fn avg_estvar(&self) -> T {
        match self {
            Self::MultiFidelity(s) => s.avg_estvar(),
            Self::Multilevel(s) => s.avg_estvar(),
        }
    }

    /// The allocation cost in equivalent truth evaluations.
    pub fn equiv_hf_cost(&self) -> T {
        match self {
            Self::MultiFidelity(s) => s.equiv_hf_cost(),
            Self::Multilevel(s) => s.equiv_hf_cost(),
        }
    }
}

/// State snapshot of one finished outer iteration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Checkpoint<T, R> {
    rng_before: R,
    rng_after: R,
    iteration: usize,
    sums: Vec<GroupSums<T>>,
    counters: Vec<SampleCounters>,
    solution: AllocationSolution<T>,
    equiv_hf_cost: T,
}

impl<T, R> Checkpoint<T, R> {
    /// Returns the random number generator as it was before this iteration.
    pub fn rng_before(&self) -> &R {
        &self.rng_before
    }

    /// Returns the state of the random number generator after this
    /// iteration.
    pub fn rng_after(&self) -> &R {
        &self.rng_after
    }

    /// Zero-based index of this iteration.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// The accumulated shared sums, one per persistent sampling group.
    pub fn sums(&self) -> &[GroupSums<T>] {
        &self.sums
    }

    /// Per-entry sample counters at the end of this iteration.
    pub fn counters(&self) -> &[SampleCounters] {
        &self.counters
    }

    /// The allocation this iteration sampled toward.
    pub fn solution(&self) -> &AllocationSolution<T> {
        &self.solution
    }

    /// Equivalent-HF cost incurred up to and including this iteration.
    pub fn equiv_hf_cost(&self) -> T
    where
        T: Copy,
    {
        self.equiv_hf_cost
    }
}

/// Final output of an estimation run.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EstimationReport<T> {
    /// Corrected moments, one per QoI.
    pub moments: Vec<FinalMoments<T>>,
    /// Average (over QoI) estimator variance at the final allocation.
    pub avg_estvar: T,
    /// Ratio of the estimator variance to the plain Monte Carlo variance.
    pub avg_estvar_ratio: T,
    /// Plain Monte Carlo estimator variance on the truth model at the same
    /// equivalent-HF cost.
    pub mc_estvar: T,
    /// Total equivalent-HF cost spent.
    pub equiv_hf_cost: T,
    /// Why the run stopped.
    pub termination: Termination,
    /// Final per-entry sample counters, ordered like the ensemble entries.
    pub counters: Vec<SampleCounters>,
    /// Number of outer iterations performed.
    pub iterations: usize,
}

impl<T: Float> EstimationReport<T> {
    /// The variance reduction over plain Monte Carlo at equal cost,
    /// $1 - \mathrm{estvar} / \mathrm{estvar}_\mathrm{MC}$.
    pub fn variance_reduction(&self) -> T {
        if self.mc_estvar > T::zero() {
            T::one() - self.avg_estvar / self.mc_estvar
        } else {
            T::zero()
        }
    }
}

/// The estimation driver: a model ensemble plus the strategy configuration.
pub struct EnsembleEstimator<'a, T, M> {
    ensemble: &'a M,
    config: EstimatorConfig<T>,
}

impl<'a, T, M> EnsembleEstimator<'a, T, M>
where
    T: Float + FromPrimitive + AddAssign,
    M: ModelEnsemble<T>,
    Standard: Distribution<T>,
{
    /// Compose a driver from an ensemble and a configuration.
    pub fn new(ensemble: &'a M, config: EstimatorConfig<T>) -> Self {
        Self { ensemble, config }
    }

    /// Run the estimation to termination.
    ///
    /// Returns the final report together with the per-iteration checkpoints.
    /// All parameter draws are consumed sequentially from `rng`, so two runs
    /// with the same seed and configuration produce identical reports
    /// regardless of how `evaluator` schedules the batches.
    pub fn run<R, E, C>(
        &self,
        rng: &mut R,
        evaluator: &mut E,
        callback: &C,
    ) -> Result<(EstimationReport<T>, Vec<Checkpoint<T, R>>), EstimationError>
    where
        R: Clone + Rng,
        E: BatchEvaluator<T>,
        C: Callback<T, R>,
    {
        match self.config.formula {
            AllocationFormula::MultilevelCv => self.run_multilevel(rng, evaluator, callback),
            _ => self.run_multifidelity(rng, evaluator, callback),
        }
    }

    fn run_multifidelity<R, E, C>(
        &self,
        rng: &mut R,
        evaluator: &mut E,
        callback: &C,
    ) -> Result<(EstimationReport<T>, Vec<Checkpoint<T, R>>), EstimationError>
    where
        R: Clone + Rng,
        E: BatchEvaluator<T>,
        C: Callback<T, R>,
    {
        let entries = self.ensemble.entries();
        if entries.len() < 2 {
            return Err(EstimationError::EnsembleTooSmall);
        }
        if self.config.pilot < 2 {
            return Err(EstimationError::PilotTooSmall(self.config.pilot));
        }
        let num_qoi = self.ensemble.num_qoi();
        let dim = self.ensemble.dim();
        let num_approx = entries.len() - 1;
        let h_idx = num_approx;
        let offline = self.config.pilot_mode != PilotMode::Online;
        let projection = self.config.pilot_mode == PilotMode::OfflineProjection;

        // the shared group samples every entry from a common draw; the
        // pyramid groups sample nested approximation prefixes
        let shared_group = ModelGroup::new(0, entries.clone());
        let approx_groups: Vec<ModelGroup> = (0..num_approx)
            .map(|j| ModelGroup::new(j + 1, entries[..=j].to_vec()))
            .collect();
        let entry_of: Vec<usize> = (0..entries.len()).collect();

        let mut cost_model = CostModel::new(
            entries.clone(),
            entries.iter().map(|&e| self.ensemble.cost(e)).collect(),
        );
        let mut shared = GroupSums::new(entries.clone(), num_qoi);
        let mut entry_sums: Vec<GroupSums<T>> = entries
            .iter()
            .map(|&e| GroupSums::new(vec![e], num_qoi))
            .collect();
        let mut counters = vec![SampleCounters::new(num_qoi); entries.len()];
        let mut pilot_sums = GroupSums::new(entries.clone(), num_qoi);
        let mut pilot_entry_sums = entry_sums.clone();

        // pilot
        let batch =
            evaluator.evaluate_blocking(&shared_group, draw_samples(rng, self.config.pilot, dim));
        if offline {
            accumulate_batch(
                batch.responses(),
                &entry_of,
                Some(&mut pilot_sums),
                &mut pilot_entry_sums,
                &mut cost_model,
            );
        } else {
            accumulate_batch(
                batch.responses(),
                &entry_of,
                Some(&mut shared),
                &mut entry_sums,
                &mut cost_model,
            );
            for (c, sums) in counters.iter_mut().zip(entry_sums.iter()) {
                c.allocate(self.config.pilot);
                c.update_actual(sums.counts());
            }
        }

        let stats_of = |sums: &GroupSums<T>| qoi_stats(sums);
        let pilot_source = if offline { &pilot_sums } else { &shared };
        let pilot_min = pilot_source.counts().iter().copied().min().unwrap_or(0);
        if pilot_min < 2 {
            return Err(EstimationError::PilotTooSmall(pilot_min));
        }

        let costs = cost_model.resolve()?;
        let cost_h = costs[h_idx];
        let solver_mode = absolute_mode(self.config.mode, &stats_of(pilot_source), pilot_min);

        let mut incurred = incurred_cost(&counters, &costs);
        let mut chkpts: Vec<Checkpoint<T, R>> = Vec::new();
        let mut iteration = 0;

        let (solution, termination) = loop {
            let stats = if offline {
                stats_of(&pilot_sums)
            } else {
                stats_of(&shared)
            };
            let solution = solve_multifidelity_step(
                self.config.formula,
                &costs[..num_approx],
                cost_h,
                &stats,
                solver_mode,
                incurred,
            );

            if projection {
                break (solution, Termination::Converged);
            }
            if let AllocationMode::Budget(budget) = self.config.mode {
                if incurred >= budget {
                    break (solution, Termination::BudgetExhausted);
                }
            }

            let relax = self.config.relaxation.factor(iteration);
            let current = |idx: usize| {
                if self.config.backfill_failures {
                    counters[idx].min_actual()
                } else {
                    counters[idx].alloc()
                }
            };
            let delta_h = one_sided_delta(
                solution.hf_target(),
                T::from_usize(current(h_idx)).unwrap(),
                relax,
            );

            // nested pyramid increments, from the smallest target outward
            let targets = solution.approx_targets();
            let mut planned: Vec<usize> = (0..num_approx).map(|i| current(i) + delta_h).collect();
            let mut group_deltas = vec![0_usize; num_approx];
            for j in (0..num_approx).rev() {
                let d = one_sided_delta(targets[j], T::from_usize(planned[j]).unwrap(), relax);
                group_deltas[j] = d;
                for p in planned[..=j].iter_mut() {
                    *p += d;
                }
            }

            if delta_h == 0 && group_deltas.iter().all(|&d| d == 0) {
                break (solution, Termination::Converged);
            }
            if iteration >= self.config.max_iterations {
                break (solution, Termination::MaxIterations);
            }

            let rng_before = rng.clone();
            let mut submitted = Vec::new();
            if delta_h > 0 {
                let id = evaluator.submit(&shared_group, draw_samples(rng, delta_h, dim));
                submitted.push((id, true));
                for c in counters.iter_mut() {
                    c.allocate(delta_h);
                }
            }
            for j in (0..num_approx).rev() {
                if group_deltas[j] > 0 {
                    let id =
                        evaluator.submit(&approx_groups[j], draw_samples(rng, group_deltas[j], dim));
                    submitted.push((id, false));
                    for c in counters[..=j].iter_mut() {
                        c.allocate(group_deltas[j]);
                    }
                }
            }

            let arena = evaluator.synchronize();
            for (id, is_shared) in submitted {
                let batch = arena
                    .take(id)
                    .expect("a synchronized batch is present in the arena");
                accumulate_batch(
                    batch.responses(),
                    &entry_of,
                    if is_shared { Some(&mut shared) } else { None },
                    &mut entry_sums,
                    &mut cost_model,
                );
            }
            arena.release_all();
            for (c, sums) in counters.iter_mut().zip(entry_sums.iter()) {
                c.update_actual(sums.counts());
            }
            incurred = incurred_cost(&counters, &costs);

            chkpts.push(Checkpoint {
                rng_before,
                rng_after: rng.clone(),
                iteration,
                sums: vec![shared.clone()],
                counters: counters.clone(),
                solution: AllocationSolution::MultiFidelity(solution.clone()),
                equiv_hf_cost: incurred,
            });
            callback.print(&chkpts);
            iteration += 1;
        };

        let (moments, final_stats) = if projection {
            (mf_roll_up(&pilot_sums, None), stats_of(&pilot_sums))
        } else {
            (mf_roll_up(&shared, Some(&entry_sums)), stats_of(&shared))
        };
        let avg_var_h = average_var_h(&final_stats);
        let cost_basis = if projection {
            solution.equiv_hf_cost()
        } else {
            incurred
        };
        let report = EstimationReport {
            moments,
            avg_estvar: solution.avg_estvar(),
            avg_estvar_ratio: solution.avg_estvar_ratio(),
            mc_estvar: mc_equivalent_variance(avg_var_h, cost_basis),
            equiv_hf_cost: incurred,
            termination,
            counters,
            iterations: iteration,
        };
        Ok((report, chkpts))
    }

    fn run_multilevel<R, E, C>(
        &self,
        rng: &mut R,
        evaluator: &mut E,
        callback: &C,
    ) -> Result<(EstimationReport<T>, Vec<Checkpoint<T, R>>), EstimationError>
    where
        R: Clone + Rng,
        E: BatchEvaluator<T>,
        C: Callback<T, R>,
    {
        let entries = self.ensemble.entries();
        if entries.len() < 2 {
            return Err(EstimationError::EnsembleTooSmall);
        }
        if self.config.pilot < 2 {
            return Err(EstimationError::PilotTooSmall(self.config.pilot));
        }
        let num_qoi = self.ensemble.num_qoi();
        let dim = self.ensemble.dim();
        let offline = self.config.pilot_mode != PilotMode::Online;
        let projection = self.config.pilot_mode == PilotMode::OfflineProjection;

        // split into the truth form (the form of the last entry) and a
        // single approximation form with matching level counts
        let truth_form = entries[entries.len() - 1].form;
        let truth_idx: Vec<usize> = (0..entries.len())
            .filter(|&i| entries[i].form == truth_form)
            .collect();
        let approx_idx: Vec<usize> = (0..entries.len())
            .filter(|&i| entries[i].form != truth_form)
            .collect();
        if approx_idx.is_empty()
            || truth_idx.len() != approx_idx.len()
            || approx_idx
                .iter()
                .any(|&i| entries[i].form != entries[approx_idx[0]].form)
        {
            return Err(EstimationError::LevelMismatch);
        }
        let num_levels = truth_idx.len();

        // per-level shared groups pair each level with its coarser
        // neighbour; member layout is [L_l, L_{l-1}, H_l, H_{l-1}] (level
        // zero omits the coarse members)
        let mut level_groups = Vec::with_capacity(num_levels);
        let mut level_entry_of = Vec::with_capacity(num_levels);
        let mut lf_groups = Vec::with_capacity(num_levels);
        let mut lf_entry_of = Vec::with_capacity(num_levels);
        for l in 0..num_levels {
            let mut eof = vec![approx_idx[l]];
            if l > 0 {
                eof.push(approx_idx[l - 1]);
            }
            eof.push(truth_idx[l]);
            if l > 0 {
                eof.push(truth_idx[l - 1]);
            }
            let members = eof.iter().map(|&i| entries[i]).collect();
            level_groups.push(ModelGroup::new(l, members));
            level_entry_of.push(eof);

            let mut eof = vec![approx_idx[l]];
            if l > 0 {
                eof.push(approx_idx[l - 1]);
            }
            let members = eof.iter().map(|&i| entries[i]).collect();
            lf_groups.push(ModelGroup::new(num_levels + l, members));
            lf_entry_of.push(eof);
        }

        let mut cost_model = CostModel::new(
            entries.clone(),
            entries.iter().map(|&e| self.ensemble.cost(e)).collect(),
        );
        let mut level_shared: Vec<GroupSums<T>> = level_groups
            .iter()
            .map(|g| GroupSums::new(g.members().to_vec(), num_qoi))
            .collect();
        let mut entry_sums: Vec<GroupSums<T>> = entries
            .iter()
            .map(|&e| GroupSums::new(vec![e], num_qoi))
            .collect();
        let mut counters = vec![SampleCounters::new(num_qoi); entries.len()];
        let mut pilot_level: Vec<GroupSums<T>> = level_shared.clone();
        let mut pilot_entry_sums = entry_sums.clone();

        // pilot: every level group gets its own independent draws
        let mut pilot_ids = Vec::with_capacity(num_levels);
        for group in &level_groups {
            pilot_ids.push(evaluator.submit(group, draw_samples(rng, self.config.pilot, dim)));
        }
        let arena = evaluator.synchronize();
        for (l, id) in pilot_ids.into_iter().enumerate() {
            let batch = arena
                .take(id)
                .expect("a synchronized batch is present in the arena");
            if offline {
                accumulate_batch(
                    batch.responses(),
                    &level_entry_of[l],
                    Some(&mut pilot_level[l]),
                    &mut pilot_entry_sums,
                    &mut cost_model,
                );
            } else {
                accumulate_batch(
                    batch.responses(),
                    &level_entry_of[l],
                    Some(&mut level_shared[l]),
                    &mut entry_sums,
                    &mut cost_model,
                );
                for &i in &level_entry_of[l] {
                    counters[i].allocate(self.config.pilot);
                }
            }
        }
        arena.release_all();
        if !offline {
            for (c, sums) in counters.iter_mut().zip(entry_sums.iter()) {
                c.update_actual(sums.counts());
            }
        }

        let pilot_source = if offline { &pilot_level } else { &level_shared };
        let pilot_min = pilot_source
            .iter()
            .flat_map(|s| s.counts().iter().copied())
            .min()
            .unwrap_or(0);
        if pilot_min < 2 {
            return Err(EstimationError::PilotTooSmall(pilot_min));
        }

        let costs = cost_model.resolve()?;
        let level_hf_cost: Vec<T> = (0..num_levels)
            .map(|l| {
                costs[truth_idx[l]]
                    + if l > 0 {
                        costs[truth_idx[l - 1]]
                    } else {
                        T::zero()
                    }
            })
            .collect();
        let level_lf_cost: Vec<T> = (0..num_levels)
            .map(|l| {
                costs[approx_idx[l]]
                    + if l > 0 {
                        costs[approx_idx[l - 1]]
                    } else {
                        T::zero()
                    }
            })
            .collect();

        let stats_of = |source: &[GroupSums<T>]| {
            (0..num_levels)
                .map(|l| level_stats_from(&source[l], l == 0, level_hf_cost[l], level_lf_cost[l]))
                .collect::<Vec<_>>()
        };

        // accuracy targets are relative to the telescoped pilot variance
        let solver_mode = match self.config.mode {
            AllocationMode::Budget(b) => AllocationMode::Budget(b),
            AllocationMode::Accuracy(tol) => {
                let reference = stats_of(pilot_source)
                    .iter()
                    .fold(T::zero(), |acc, s| acc + s.var_yh)
                    / T::from_usize(pilot_min).unwrap();
                AllocationMode::Accuracy(tol * reference)
            }
        };

        let mut incurred = incurred_cost(&counters, &costs);
        let mut chkpts: Vec<Checkpoint<T, R>> = Vec::new();
        let mut iteration = 0;

        let (solution, termination) = loop {
            let stats = if offline {
                stats_of(&pilot_level)
            } else {
                stats_of(&level_shared)
            };
            let solution = multilevel_allocation(&stats, solver_mode);

            if projection {
                break (solution, Termination::Converged);
            }
            if let AllocationMode::Budget(budget) = self.config.mode {
                if incurred >= budget {
                    break (solution, Termination::BudgetExhausted);
                }
            }

            let relax = self.config.relaxation.factor(iteration);
            let current = |idx: usize| {
                if self.config.backfill_failures {
                    counters[idx].min_actual()
                } else {
                    counters[idx].alloc()
                }
            };

            let mut hf_deltas = Vec::with_capacity(num_levels);
            let mut lf_deltas = Vec::with_capacity(num_levels);
            for l in 0..num_levels {
                let d_h = one_sided_delta(
                    solution.hf_targets()[l],
                    T::from_usize(current(truth_idx[l])).unwrap(),
                    relax,
                );
                hf_deltas.push(d_h);
                // shared draws sample the approximation members as well
                let lf_target = solution.eval_ratios()[l] * solution.hf_targets()[l];
                let d_l = one_sided_delta(
                    lf_target,
                    T::from_usize(current(approx_idx[l]) + d_h).unwrap(),
                    relax,
                );
                lf_deltas.push(d_l);
            }

            if hf_deltas.iter().all(|&d| d == 0) && lf_deltas.iter().all(|&d| d == 0) {
                break (solution, Termination::Converged);
            }
            if iteration >= self.config.max_iterations {
                break (solution, Termination::MaxIterations);
            }

            let rng_before = rng.clone();
            let mut submitted = Vec::new();
            for l in 0..num_levels {
                if hf_deltas[l] > 0 {
                    let id =
                        evaluator.submit(&level_groups[l], draw_samples(rng, hf_deltas[l], dim));
                    submitted.push((id, l, true));
                    for &i in &level_entry_of[l] {
                        counters[i].allocate(hf_deltas[l]);
                    }
                }
                if lf_deltas[l] > 0 {
                    let id = evaluator.submit(&lf_groups[l], draw_samples(rng, lf_deltas[l], dim));
                    submitted.push((id, l, false));
                    for &i in &lf_entry_of[l] {
                        counters[i].allocate(lf_deltas[l]);
                    }
                }
            }

            let arena = evaluator.synchronize();
            for (id, l, is_shared) in submitted {
                let batch = arena
                    .take(id)
                    .expect("a synchronized batch is present in the arena");
                if is_shared {
                    accumulate_batch(
                        batch.responses(),
                        &level_entry_of[l],
                        Some(&mut level_shared[l]),
                        &mut entry_sums,
                        &mut cost_model,
                    );
                } else {
                    accumulate_batch(
                        batch.responses(),
                        &lf_entry_of[l],
                        None,
                        &mut entry_sums,
                        &mut cost_model,
                    );
                }
            }
            arena.release_all();
            for (c, sums) in counters.iter_mut().zip(entry_sums.iter()) {
                c.update_actual(sums.counts());
            }
            incurred = incurred_cost(&counters, &costs);

            chkpts.push(Checkpoint {
                rng_before,
                rng_after: rng.clone(),
                iteration,
                sums: level_shared.clone(),
                counters: counters.clone(),
                solution: AllocationSolution::Multilevel(solution.clone()),
                equiv_hf_cost: incurred,
            });
            callback.print(&chkpts);
            iteration += 1;
        };

        let (moments, mc_var_h) = if projection {
            (
                ml_roll_up(&pilot_level, None, &approx_idx),
                finest_truth_variance(&pilot_level),
            )
        } else {
            (
                ml_roll_up(&level_shared, Some(&entry_sums), &approx_idx),
                finest_truth_variance(&level_shared),
            )
        };
        let cost_basis = if projection {
            solution.equiv_hf_cost()
        } else {
            incurred
        };
        let mc_estvar = mc_equivalent_variance(mc_var_h, cost_basis);
        let avg_estvar_ratio = if mc_estvar > T::zero() {
            solution.avg_estvar() / mc_estvar
        } else {
            T::one()
        };
        let report = EstimationReport {
            moments,
            avg_estvar: solution.avg_estvar(),
            avg_estvar_ratio,
            mc_estvar,
            equiv_hf_cost: incurred,
            termination,
            counters,
            iterations: iteration,
        };
        Ok((report, chkpts))
    }
}

/// Fold one batch into the accumulators. `entry_of[m]` maps member position
/// `m` of the batch to its ensemble entry index.
fn accumulate_batch<T>(
    responses: &[Vec<crate::core::Response<T>>],
    entry_of: &[usize],
    mut group_sums: Option<&mut GroupSums<T>>,
    entry_sums: &mut [GroupSums<T>],
    cost_model: &mut CostModel<T>,
) where
    T: Float + FromPrimitive + AddAssign,
{
    for sample in responses {
        if let Some(sums) = group_sums.as_deref_mut() {
            let values: Vec<Vec<T>> = sample.iter().map(|r| r.values.clone()).collect();
            sums.add_draw(&values);
        }
        for (member, response) in sample.iter().enumerate() {
            let idx = entry_of[member];
            cost_model.record(idx, response);
            entry_sums[idx].add_draw(std::slice::from_ref(&response.values));
        }
    }
}

/// Per-QoI solver statistics from a shared accumulator whose last member is
/// the truth entry.
fn qoi_stats<T>(sums: &GroupSums<T>) -> Vec<QoiStats<T>>
where
    T: Float + FromPrimitive + AddAssign,
{
    let num_approx = sums.members().len() - 1;
    let h = num_approx;
    (0..sums.num_qoi())
        .map(|q| {
            let n = sums.count(q);
            if n < 2 {
                return QoiStats {
                    var_h: T::zero(),
                    rho_sq: vec![None; num_approx],
                };
            }
            let var_h = variance(sums.power_sum(h, 1, q), sums.power_sum(h, 2, q), n);
            let rho_sq = (0..num_approx)
                .map(|i| {
                    let var_l = variance(sums.power_sum(i, 1, q), sums.power_sum(i, 2, q), n);
                    let cov = covariance(
                        sums.power_sum(i, 1, q),
                        sums.power_sum(h, 1, q),
                        sums.cross_sum(i, h, 1, q),
                        n,
                    );
                    correlation_sq(cov, var_l, var_h)
                })
                .collect();
            QoiStats { var_h, rho_sq }
        })
        .collect()
}

fn average_var_h<T: Float + FromPrimitive + AddAssign>(stats: &[QoiStats<T>]) -> T {
    let mut acc = T::zero();
    for s in stats {
        acc += s.var_h;
    }
    acc / T::from_usize(stats.len().max(1)).unwrap()
}

/// Convert a relative accuracy tolerance into the absolute variance target
/// `tol * estvar_MC(pilot)`; budgets pass through unchanged.
fn absolute_mode<T>(
    mode: AllocationMode<T>,
    pilot_stats: &[QoiStats<T>],
    pilot_n: usize,
) -> AllocationMode<T>
where
    T: Float + FromPrimitive + AddAssign,
{
    match mode {
        AllocationMode::Budget(b) => AllocationMode::Budget(b),
        AllocationMode::Accuracy(tol) => {
            let reference = average_var_h(pilot_stats) / T::from_usize(pilot_n.max(1)).unwrap();
            AllocationMode::Accuracy(tol * reference)
        }
    }
}

fn solve_multifidelity_step<T>(
    formula: AllocationFormula,
    costs: &[T],
    cost_h: T,
    stats: &[QoiStats<T>],
    mode: AllocationMode<T>,
    incurred: T,
) -> SolutionData<T>
where
    T: Float + FromPrimitive + AddAssign,
{
    let reorder = formula == AllocationFormula::AnalyticMfmcReorder;
    let analytic = mfmc_allocation(costs, cost_h, stats, mode, reorder);
    if formula == AllocationFormula::NumericalMfmc {
        let problem = AllocationProblem::new(costs, cost_h, stats, mode, incurred);
        solve_numerical(&problem, &analytic)
    } else {
        analytic
    }
}

fn incurred_cost<T: Float + FromPrimitive>(counters: &[SampleCounters], costs: &[T]) -> T {
    let counts: Vec<T> = counters
        .iter()
        .map(|c| T::from_usize(c.alloc()).unwrap())
        .collect();
    equivalent_hf_cost(&counts, costs)
}

/// Raw moments of one member of `sums` for QoI `q` over `n` draws.
fn raw_moments_of<T>(sums: &GroupSums<T>, member: usize, q: usize, n: usize) -> RawMoments<T>
where
    T: Float + FromPrimitive + AddAssign,
{
    let nf = T::from_usize(n).unwrap();
    let mut raw = [T::zero(); MAX_MOMENT_ORDER];
    for (ord, r) in raw.iter_mut().enumerate() {
        *r = sums.power_sum(member, ord + 1, q) / nf;
    }
    RawMoments(raw)
}

/// Control-variate moment roll-up of the multifidelity paths. `refined`
/// holds the per-entry accumulators over every draw an entry has seen; when
/// absent, the corrections net to zero and the shared truth moments are
/// returned (the projection case).
fn mf_roll_up<T>(shared: &GroupSums<T>, refined: Option<&[GroupSums<T>]>) -> Vec<FinalMoments<T>>
where
    T: Float + FromPrimitive + AddAssign,
{
    let h = shared.members().len() - 1;
    (0..shared.num_qoi())
        .map(|q| {
            let n = shared.count(q);
            if n == 0 {
                return raw_to_standard(&RawMoments([T::zero(); MAX_MOMENT_ORDER]));
            }
            let mut corrected = raw_moments_of(shared, h, q, n);
            for i in 0..h {
                let mut beta = [T::zero(); MAX_MOMENT_ORDER];
                if n >= 2 {
                    for ord in 1..=MAX_MOMENT_ORDER {
                        let var_lm = variance(
                            shared.power_sum(i, ord, q),
                            shared.power_sq_sum(i, ord, q),
                            n,
                        );
                        let cov = covariance(
                            shared.power_sum(i, ord, q),
                            shared.power_sum(h, ord, q),
                            shared.cross_sum(i, h, ord, q),
                            n,
                        );
                        beta[ord - 1] = control_beta(cov, var_lm);
                    }
                }
                let l_shared = raw_moments_of(shared, i, q, n);
                let l_refined = refined
                    .and_then(|sums| {
                        let n_i = sums[i].count(q);
                        if n_i == 0 {
                            None
                        } else {
                            Some(raw_moments_of(&sums[i], 0, q, n_i))
                        }
                    })
                    .unwrap_or(l_shared);
                corrected = apply_control(&corrected, &beta, &l_shared, &l_refined);
            }
            raw_to_standard(&corrected)
        })
        .collect()
}

/// Extract the fourteen pair sums of one level from its shared accumulator.
/// At level zero the coarse members are absent and their sums vanish.
fn ml_pair_sums<T>(sums: &GroupSums<T>, level0: bool, q: usize) -> MlPairSums<T>
where
    T: Float + FromPrimitive + AddAssign,
{
    let z = T::zero();
    if level0 {
        // members [L_0, H_0]
        MlPairSums {
            ll: sums.power_sum(0, 1, q),
            llm1: z,
            hl: sums.power_sum(1, 1, q),
            hlm1: z,
            ll_ll: sums.power_sum(0, 2, q),
            ll_llm1: z,
            llm1_llm1: z,
            hl_ll: sums.cross_sum(1, 0, 1, q),
            hl_llm1: z,
            hlm1_ll: z,
            hlm1_llm1: z,
            hl_hl: sums.power_sum(1, 2, q),
            hl_hlm1: z,
            hlm1_hlm1: z,
        }
    } else {
        // members [L_l, L_{l-1}, H_l, H_{l-1}]
        MlPairSums {
            ll: sums.power_sum(0, 1, q),
            llm1: sums.power_sum(1, 1, q),
            hl: sums.power_sum(2, 1, q),
            hlm1: sums.power_sum(3, 1, q),
            ll_ll: sums.power_sum(0, 2, q),
            ll_llm1: sums.cross_sum(0, 1, 1, q),
            llm1_llm1: sums.power_sum(1, 2, q),
            hl_ll: sums.cross_sum(2, 0, 1, q),
            hl_llm1: sums.cross_sum(2, 1, 1, q),
            hlm1_ll: sums.cross_sum(3, 0, 1, q),
            hlm1_llm1: sums.cross_sum(3, 1, 1, q),
            hl_hl: sums.power_sum(2, 2, q),
            hl_hlm1: sums.cross_sum(2, 3, 1, q),
            hlm1_hlm1: sums.power_sum(3, 2, q),
        }
    }
}

/// Per-level solver inputs, averaged over the QoI with enough draws.
fn level_stats_from<T>(sums: &GroupSums<T>, level0: bool, hf_cost: T, lf_cost: T) -> LevelStats<T>
where
    T: Float + FromPrimitive + AddAssign,
{
    let mut var_acc = T::zero();
    let mut var_n = 0;
    let mut rho_acc = T::zero();
    let mut rho_n = 0;
    for q in 0..sums.num_qoi() {
        let n = sums.count(q);
        if n < 2 {
            continue;
        }
        let control = mlmf_control(&ml_pair_sums(sums, level0, q), n);
        var_acc += control.var_yh;
        var_n += 1;
        if let Some(r) = control.rho_dot_sq {
            rho_acc += r;
            rho_n += 1;
        }
    }
    LevelStats {
        var_yh: if var_n > 0 {
            var_acc / T::from_usize(var_n).unwrap()
        } else {
            T::zero()
        },
        rho_dot_sq: if rho_n > 0 {
            Some(rho_acc / T::from_usize(rho_n).unwrap())
        } else {
            None
        },
        hf_cost,
        lf_cost,
    }
}

/// Average variance of the finest truth member, read off the last level's
/// shared accumulator.
fn finest_truth_variance<T>(level_shared: &[GroupSums<T>]) -> T
where
    T: Float + FromPrimitive + AddAssign,
{
    let sums = match level_shared.last() {
        Some(s) => s,
        None => return T::zero(),
    };
    let member = if level_shared.len() == 1 { 1 } else { 2 };
    let mut acc = T::zero();
    let mut valid = 0;
    for q in 0..sums.num_qoi() {
        let n = sums.count(q);
        if n < 2 {
            continue;
        }
        acc += variance(sums.power_sum(member, 1, q), sums.power_sum(member, 2, q), n);
        valid += 1;
    }
    if valid > 0 {
        acc / T::from_usize(valid).unwrap()
    } else {
        T::zero()
    }
}

/// Telescoped moment roll-up of the multilevel path. Each raw moment order
/// telescopes over the levels, with the level-$l$ power discrepancy of the
/// truth controlled by the $\gamma_l$-weighted approximation discrepancy of
/// the same order.
fn ml_roll_up<T>(
    level_shared: &[GroupSums<T>],
    entry_sums: Option<&[GroupSums<T>]>,
    approx_idx: &[usize],
) -> Vec<FinalMoments<T>>
where
    T: Float + FromPrimitive + AddAssign,
{
    let num_qoi = level_shared.first().map(|s| s.num_qoi()).unwrap_or(0);
    (0..num_qoi)
        .map(|q| {
            let mut raw = [T::zero(); MAX_MOMENT_ORDER];
            for (l, sums) in level_shared.iter().enumerate() {
                let n = sums.count(q);
                if n == 0 {
                    continue;
                }
                let nf = T::from_usize(n).unwrap();
                let level0 = l == 0;
                // member positions within the level layout
                let (lf, lc, hf, hc) = if level0 {
                    (0, None, 1, None)
                } else {
                    (0, Some(1), 2, Some(3))
                };
                let gamma = if n >= 2 {
                    mlmf_control(&ml_pair_sums(sums, level0, q), n).gamma
                } else {
                    T::one()
                };

                for ord in 1..=MAX_MOMENT_ORDER {
                    let coarse_power =
                        |m: Option<usize>| m.map_or(T::zero(), |c| sums.power_sum(c, ord, q));
                    let yh = (sums.power_sum(hf, ord, q) - coarse_power(hc)) / nf;
                    let yl_shared = (sums.power_sum(lf, ord, q) - gamma * coarse_power(lc)) / nf;

                    let beta = if n >= 2 {
                        let cov_of = |a: usize, b: usize| {
                            covariance(
                                sums.power_sum(a, ord, q),
                                sums.power_sum(b, ord, q),
                                sums.cross_sum(a, b, ord, q),
                                n,
                            )
                        };
                        let var_f =
                            variance(sums.power_sum(lf, ord, q), sums.power_sq_sum(lf, ord, q), n);
                        let mut cov = cov_of(hf, lf);
                        let mut var_yl = var_f;
                        if let Some(c) = lc {
                            let var_c = variance(
                                sums.power_sum(c, ord, q),
                                sums.power_sq_sum(c, ord, q),
                                n,
                            );
                            var_yl = (var_f - (gamma + gamma) * cov_of(lf, c)
                                + gamma * gamma * var_c)
                                .max(T::zero());
                            cov = cov - gamma * cov_of(hf, c);
                        }
                        if let Some(hcoarse) = hc {
                            cov = cov - cov_of(hcoarse, lf);
                            if let Some(c) = lc {
                                cov = cov + gamma * cov_of(hcoarse, c);
                            }
                        }
                        control_beta(cov, var_yl)
                    } else {
                        T::zero()
                    };

                    let yl_refined = entry_sums
                        .and_then(|es| {
                            let fine = &es[approx_idx[l]];
                            let n_f = fine.count(q);
                            if n_f == 0 {
                                return None;
                            }
                            let mean_f =
                                fine.power_sum(0, ord, q) / T::from_usize(n_f).unwrap();
                            if l == 0 {
                                return Some(mean_f);
                            }
                            let coarse = &es[approx_idx[l - 1]];
                            let n_c = coarse.count(q);
                            if n_c == 0 {
                                return None;
                            }
                            let mean_c =
                                coarse.power_sum(0, ord, q) / T::from_usize(n_c).unwrap();
                            Some(mean_f - gamma * mean_c)
                        })
                        .unwrap_or(yl_shared);

                    raw[ord - 1] += yh + beta * (yl_refined - yl_shared);
                }
            }
            raw_to_standard(&RawMoments(raw))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::SinkCallback;
    use crate::core::{ModelKey, Response};
    use crate::scheduler::LocalEvaluator;
    use rand_pcg::Pcg64;

    /// Two correlated forms: the truth is a shifted, noisier copy of the
    /// approximation, ten times as expensive.
    struct TwoModel;

    impl ModelEnsemble<f64> for TwoModel {
        fn evaluate(&self, entry: ModelKey, x: &[f64]) -> Response<f64> {
            let base = x[0] + 0.5 * x[1];
            let value = if entry.form == 0 {
                base
            } else {
                base + 0.05 * (x[0] * 7.3).sin() + 0.2
            };
            Response::new(vec![value, value * value])
        }

        fn dim(&self) -> usize {
            2
        }

        fn num_qoi(&self) -> usize {
            2
        }

        fn entries(&self) -> Vec<ModelKey> {
            vec![ModelKey::new(0, 0), ModelKey::new(1, 0)]
        }

        fn cost(&self, entry: ModelKey) -> Option<f64> {
            Some(if entry.form == 0 { 0.1 } else { 1.0 })
        }
    }

    fn seeded_rng() -> Pcg64 {
        Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96)
    }

    #[test]
    fn too_small_ensembles_and_pilots_are_rejected() {
        struct Lonely;
        impl ModelEnsemble<f64> for Lonely {
            fn evaluate(&self, _: ModelKey, x: &[f64]) -> Response<f64> {
                Response::new(vec![x[0]])
            }
            fn dim(&self) -> usize {
                1
            }
            fn num_qoi(&self) -> usize {
                1
            }
            fn entries(&self) -> Vec<ModelKey> {
                vec![ModelKey::new(0, 0)]
            }
            fn cost(&self, _: ModelKey) -> Option<f64> {
                Some(1.0)
            }
        }

        let config = EstimatorConfig::new(AllocationMode::Budget(50.0));
        let lonely = Lonely;
        let mut evaluator = LocalEvaluator::new(&lonely, 1);
        let result = EnsembleEstimator::new(&lonely, config).run(
            &mut seeded_rng(),
            &mut evaluator,
            &SinkCallback {},
        );
        assert_eq!(result.unwrap_err(), EstimationError::EnsembleTooSmall);

        let model = TwoModel;
        let mut config = EstimatorConfig::new(AllocationMode::Budget(50.0));
        config.pilot = 1;
        let mut evaluator = LocalEvaluator::new(&model, 1);
        let result = EnsembleEstimator::new(&model, config).run(
            &mut seeded_rng(),
            &mut evaluator,
            &SinkCallback {},
        );
        assert_eq!(result.unwrap_err(), EstimationError::PilotTooSmall(1));
    }

    #[test]
    fn projection_mode_solves_without_spending() {
        let model = TwoModel;
        let mut config = EstimatorConfig::new(AllocationMode::Budget(100.0));
        config.pilot_mode = PilotMode::OfflineProjection;
        let mut evaluator = LocalEvaluator::new(&model, 1);
        let (report, chkpts) = EnsembleEstimator::new(&model, config)
            .run(&mut seeded_rng(), &mut evaluator, &SinkCallback {})
            .unwrap();

        assert_eq!(report.termination, Termination::Converged);
        assert_eq!(report.iterations, 0);
        assert!(chkpts.is_empty());
        // nothing was charged, but the projected allocation is reported
        assert_eq!(report.equiv_hf_cost, 0.0);
        assert!(report.avg_estvar > 0.0);
        assert!(report.avg_estvar.is_finite());
    }

    #[test]
    fn accuracy_mode_reaches_the_relative_tolerance() {
        let model = TwoModel;
        let mut config = EstimatorConfig::new(AllocationMode::Accuracy(0.5));
        config.pilot = 100;
        let mut evaluator = LocalEvaluator::new(&model, 2);
        let (report, _) = EnsembleEstimator::new(&model, config)
            .run(&mut seeded_rng(), &mut evaluator, &SinkCallback {})
            .unwrap();

        // no budget applies, so the run stops on its own
        assert_ne!(report.termination, Termination::BudgetExhausted);
        assert!(report.avg_estvar.is_finite());
        assert!(report.equiv_hf_cost > 0.0);
    }
}

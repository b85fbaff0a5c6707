use multifid::callbacks::SinkCallback;
use multifid::core::*;
use multifid::error::EstimationError;
use multifid::estimation::{EnsembleEstimator, EstimatorConfig, PilotMode, Termination};
use multifid::scheduler::LocalEvaluator;
use multifid::solvers::{AllocationFormula, AllocationMode};

use assert_approx_eq::assert_approx_eq;
use rand::Rng;
use rand_pcg::Pcg64;
use serde::Serialize;

fn assert_eq_rng<R>(lhs: &R, rhs: &R)
where
    R: Rng + Serialize,
{
    assert_eq!(
        serde_json::to_string(lhs).unwrap(),
        serde_json::to_string(rhs).unwrap()
    );
}

/// Two forms with three resolution levels each. The truth at level $l$ is
/// $g(x) - 2^{-(l+1)} h(x)$ with $g = x_0 + 0.5 x_1$ and $h = x_0 x_1$, so
/// the level discrepancies shrink geometrically and the finest truth mean is
/// $3/4 - 1/32 = 0.71875$. The approximation adds a small level-dependent
/// perturbation, which keeps the discrepancy correlations high but away
/// from one.
struct TwoFormHierarchy;

const NUM_LEVELS: usize = 3;

impl ModelEnsemble<f64> for TwoFormHierarchy {
    fn evaluate(&self, entry: ModelKey, x: &[f64]) -> Response<f64> {
        let g = x[0] + 0.5 * x[1];
        let h = x[0] * x[1];
        let scale = 0.5_f64.powi(entry.level as i32 + 1);
        let mut value = g - scale * h;
        if entry.form == 0 {
            value += 0.04 * (6.0 * x[0] + entry.level as f64).sin();
        }
        Response::new(vec![value])
    }

    fn dim(&self) -> usize {
        2
    }

    fn num_qoi(&self) -> usize {
        1
    }

    fn entries(&self) -> Vec<ModelKey> {
        let mut entries: Vec<ModelKey> = (0..NUM_LEVELS).map(|l| ModelKey::new(0, l)).collect();
        entries.extend((0..NUM_LEVELS).map(|l| ModelKey::new(1, l)));
        entries
    }

    fn cost(&self, entry: ModelKey) -> Option<f64> {
        let level_cost = 4.0_f64.powi(entry.level as i32);
        Some(if entry.form == 0 {
            0.1 * level_cost
        } else {
            level_cost
        })
    }
}

fn seeded_rng() -> Pcg64 {
    Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96)
}

fn ml_config(mode: AllocationMode<f64>) -> EstimatorConfig<f64> {
    let mut config = EstimatorConfig::new(mode);
    config.formula = AllocationFormula::MultilevelCv;
    config.pilot = 25;
    config
}

#[test]
fn budget_run_telescopes_to_the_finest_truth_mean() {
    let _ = env_logger::builder().is_test(true).try_init();

    const BUDGET: f64 = 150.0;
    let model = TwoFormHierarchy;
    let mut evaluator = LocalEvaluator::new(&model, 2);
    let (report, chkpts) = EnsembleEstimator::new(&model, ml_config(AllocationMode::Budget(BUDGET)))
        .run(&mut seeded_rng(), &mut evaluator, &SinkCallback {})
        .unwrap();

    assert!(!chkpts.is_empty());
    assert!(matches!(
        report.termination,
        Termination::Converged | Termination::BudgetExhausted
    ));
    assert!(report.equiv_hf_cost <= BUDGET * 1.3);
    assert!(report.equiv_hf_cost > 0.0);

    // E[g - h/8] over the unit square
    assert_approx_eq!(report.moments[0].mean, 0.71875, 0.05);
    assert!(report.moments[0].variance > 0.0);
    assert!(report.avg_estvar.is_finite() && report.avg_estvar > 0.0);

    // every level received at least its pilot
    for c in &report.counters {
        assert!(c.alloc() >= 25);
        assert!(c.min_actual() <= c.alloc());
    }
}

#[test]
fn same_seed_reproduces_the_multilevel_run() {
    let model = TwoFormHierarchy;

    let mut evaluator = LocalEvaluator::new(&model, 1);
    let (first, _) = EnsembleEstimator::new(&model, ml_config(AllocationMode::Budget(100.0)))
        .run(&mut seeded_rng(), &mut evaluator, &SinkCallback {})
        .unwrap();

    let mut evaluator = LocalEvaluator::new(&model, 3);
    let (second, _) = EnsembleEstimator::new(&model, ml_config(AllocationMode::Budget(100.0)))
        .run(&mut seeded_rng(), &mut evaluator, &SinkCallback {})
        .unwrap();

    assert_eq!(first.counters, second.counters);
    assert_eq!(first.moments[0].mean, second.moments[0].mean);
    assert_eq!(first.moments[0].variance, second.moments[0].variance);
}

#[test]
fn checkpoints_chain_the_generator_state() {
    let model = TwoFormHierarchy;
    let mut evaluator = LocalEvaluator::new(&model, 2);
    let mut rng = seeded_rng();
    let (_, chkpts) = EnsembleEstimator::new(&model, ml_config(AllocationMode::Budget(120.0)))
        .run(&mut rng, &mut evaluator, &SinkCallback {})
        .unwrap();

    assert!(!chkpts.is_empty());
    for pair in chkpts.windows(2) {
        assert_eq_rng(pair[0].rng_after(), pair[1].rng_before());
    }
    assert_eq_rng(chkpts.last().unwrap().rng_after(), &rng);
}

#[test]
fn projection_reports_without_spending_the_budget() {
    let model = TwoFormHierarchy;
    let mut config = ml_config(AllocationMode::Budget(100.0));
    config.pilot_mode = PilotMode::OfflineProjection;
    let mut evaluator = LocalEvaluator::new(&model, 2);
    let (report, chkpts) = EnsembleEstimator::new(&model, config)
        .run(&mut seeded_rng(), &mut evaluator, &SinkCallback {})
        .unwrap();

    assert!(chkpts.is_empty());
    assert_eq!(report.iterations, 0);
    assert_eq!(report.equiv_hf_cost, 0.0);
    assert!(report.avg_estvar.is_finite() && report.avg_estvar > 0.0);
}

#[test]
fn mismatched_level_counts_are_rejected() {
    struct Lopsided;
    impl ModelEnsemble<f64> for Lopsided {
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
            vec![
                ModelKey::new(0, 0),
                ModelKey::new(1, 0),
                ModelKey::new(1, 1),
            ]
        }
        fn cost(&self, entry: ModelKey) -> Option<f64> {
            Some(1.0 + entry.level as f64)
        }
    }

    let model = Lopsided;
    let mut evaluator = LocalEvaluator::new(&model, 1);
    let result = EnsembleEstimator::new(&model, ml_config(AllocationMode::Budget(50.0))).run(
        &mut seeded_rng(),
        &mut evaluator,
        &SinkCallback {},
    );
    assert_eq!(result.unwrap_err(), EstimationError::LevelMismatch);
}

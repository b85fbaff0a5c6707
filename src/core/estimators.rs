//! Statistical estimators on accumulated sums.
//!
//! All estimators are Bessel-corrected (unbiased) and are written to be
//! numerically robust: variances are clamped before any square root and
//! degenerate correlations are reported as such instead of propagating
//! `NaN` or `Inf` into the allocation solver.

use log::debug;
use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};

/// Basic estimators, like the mean, variance, and the standard deviation.
pub trait BasicEstimators<T: Float> {
    /// Returns the mean value.
    fn mean(&self) -> T;

    /// Returns the variance, $V$.
    fn var(&self) -> T;

    /// Returns the standard deviation, $\sigma = \sqrt{V}$.
    fn std(&self) -> T {
        self.var().sqrt()
    }
}

/// The sample mean $\bar{x} = \frac{1}{N} \sum_j x_j$ from a first-order
/// power sum.
pub fn mean<T: Float + FromPrimitive>(sum: T, n: usize) -> T {
    debug_assert!(n > 0);
    sum / T::from_usize(n).unwrap()
}

/// The unbiased variance from $\sum x$ and $\sum x^2$,
///
/// $$ V = \left( \frac{\sum x^2}{N} - \bar{x}^2 \right) \frac{N}{N - 1} $$
///
/// clamped at zero so that numerical noise never produces a negative
/// radicand downstream. Requires `n >= 2`.
pub fn variance<T: Float + FromPrimitive>(sum: T, sum_sq: T, n: usize) -> T {
    debug_assert!(n >= 2);
    let nf = T::from_usize(n).unwrap();
    let mu = sum / nf;
    let biased = sum_sq / nf - mu * mu;
    let var = biased * nf / (nf - T::one());
    if var < T::zero() {
        T::zero()
    } else {
        var
    }
}

/// The unbiased covariance from $\sum x$, $\sum y$ and $\sum x y$. Requires
/// `n >= 2`.
pub fn covariance<T: Float + FromPrimitive>(sum_x: T, sum_y: T, sum_xy: T, n: usize) -> T {
    debug_assert!(n >= 2);
    let nf = T::from_usize(n).unwrap();
    (sum_xy - sum_x * sum_y / nf) / (nf - T::one())
}

/// The squared Pearson correlation $\rho^2 = \mathrm{cov}^2 / (V_L V_H)$.
///
/// Returns `None` when either variance is non-positive or when the computed
/// value is non-finite or reaches one: those cases are degenerate
/// (near-perfect correlation or a deterministic QoI) and the caller must
/// substitute a large-but-finite evaluation-ratio fallback.
pub fn correlation_sq<T: Float>(cov: T, var_l: T, var_h: T) -> Option<T> {
    if var_l <= T::zero() || var_h <= T::zero() {
        return None;
    }
    let rho_sq = cov * cov / (var_l * var_h);
    if rho_sq.is_finite() && rho_sq < T::one() {
        Some(rho_sq)
    } else {
        debug!("degenerate correlation encountered, deferring to ratio fallback");
        None
    }
}

/// The control-variate regression coefficient $\beta = \mathrm{cov}(L, H) /
/// V_L$, or zero when the approximation variance vanishes (a constant
/// approximation carries no usable signal).
pub fn control_beta<T: Float>(cov_lh: T, var_l: T) -> T {
    if var_l > T::zero() {
        cov_lh / var_l
    } else {
        T::zero()
    }
}

/// First and second raw moment sums of the four random variables entering a
/// multilevel pair regression: the approximation at levels $l$ and $l-1$
/// ($L_l$, $L_{l-1}$) and the truth model at the same two levels ($H_l$,
/// $H_{l-1}$), all accumulated over one shared sample set of size `n`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct MlPairSums<T> {
    /// $\sum L_l$
    pub ll: T,
    /// $\sum L_{l-1}$
    pub llm1: T,
    /// $\sum H_l$
    pub hl: T,
    /// $\sum H_{l-1}$
    pub hlm1: T,
    /// $\sum L_l L_l$
    pub ll_ll: T,
    /// $\sum L_l L_{l-1}$
    pub ll_llm1: T,
    /// $\sum L_{l-1} L_{l-1}$
    pub llm1_llm1: T,
    /// $\sum H_l L_l$
    pub hl_ll: T,
    /// $\sum H_l L_{l-1}$
    pub hl_llm1: T,
    /// $\sum H_{l-1} L_l$
    pub hlm1_ll: T,
    /// $\sum H_{l-1} L_{l-1}$
    pub hlm1_llm1: T,
    /// $\sum H_l H_l$
    pub hl_hl: T,
    /// $\sum H_l H_{l-1}$
    pub hl_hlm1: T,
    /// $\sum H_{l-1} H_{l-1}$
    pub hlm1_hlm1: T,
}

/// Result of the multilevel discrepancy regression, see [`mlmf_control`].
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct MlmfControl<T> {
    /// Optimal weight $\gamma$ of the coarse approximation in the
    /// low-fidelity discrepancy $Y^L_l(\gamma) = L_l - \gamma L_{l-1}$.
    pub gamma: T,
    /// Discrepancy-adjusted squared correlation $\dot\rho^2$ between
    /// $Y^H_l$ and $Y^L_l(\gamma)$. `None` flags a degenerate value.
    pub rho_dot_sq: Option<T>,
    /// Regression coefficient $\dot\beta = \mathrm{cov}(Y^H, Y^L) /
    /// V_{Y^L}$.
    pub beta_dot: T,
    /// Variance of the truth discrepancy $Y^H_l = H_l - H_{l-1}$.
    pub var_yh: T,
}

/// Closed-form regression for a multilevel pair.
///
/// The truth-level discrepancy $Y^H_l = H_l - H_{l-1}$ is controlled by the
/// weighted approximation discrepancy $Y^L_l(\gamma) = L_l - \gamma
/// L_{l-1}$. Writing $c_1 = \mathrm{cov}(Y^H, L_l)$, $c_2 =
/// \mathrm{cov}(Y^H, L_{l-1})$, $v_1 = V_{L_l}$, $v_2 = V_{L_{l-1}}$ and
/// $c_{12} = \mathrm{cov}(L_l, L_{l-1})$, the weight maximizing
/// $\dot\rho^2(\gamma)$ is the stationary point
///
/// $$ \gamma = \frac{c_2 v_1 - c_1 c_{12}}{c_2 c_{12} - c_1 v_2} $$
///
/// a ratio of differences of covariances that is prone to catastrophic
/// cancellation; accumulate the input sums in double precision. A vanishing
/// denominator falls back to $\gamma = 1$, the plain multilevel
/// discrepancy.
pub fn mlmf_control<T: Float + FromPrimitive>(sums: &MlPairSums<T>, n: usize) -> MlmfControl<T> {
    debug_assert!(n >= 2);

    let v1 = variance(sums.ll, sums.ll_ll, n);
    let v2 = variance(sums.llm1, sums.llm1_llm1, n);
    let c12 = covariance(sums.ll, sums.llm1, sums.ll_llm1, n);

    // covariances of the truth discrepancy with the two approximation levels
    let c1 = covariance(sums.hl, sums.ll, sums.hl_ll, n)
        - covariance(sums.hlm1, sums.ll, sums.hlm1_ll, n);
    let c2 = covariance(sums.hl, sums.llm1, sums.hl_llm1, n)
        - covariance(sums.hlm1, sums.llm1, sums.hlm1_llm1, n);

    let var_hl = variance(sums.hl, sums.hl_hl, n);
    let var_hlm1 = variance(sums.hlm1, sums.hlm1_hlm1, n);
    let cov_hl_hlm1 = covariance(sums.hl, sums.hlm1, sums.hl_hlm1, n);
    let var_yh = {
        let v = var_hl - (cov_hl_hlm1 + cov_hl_hlm1) + var_hlm1;
        if v < T::zero() {
            T::zero()
        } else {
            v
        }
    };

    let denom = c2 * c12 - c1 * v2;
    let gamma = if denom.is_finite() && denom.abs() > T::epsilon() {
        (c2 * v1 - c1 * c12) / denom
    } else {
        debug!("ill-conditioned gamma regression, using plain level discrepancy");
        T::one()
    };

    let cov_yh_yl = c1 - gamma * c2;
    let var_yl = {
        let v = v1 - (gamma + gamma) * c12 + gamma * gamma * v2;
        if v < T::zero() {
            T::zero()
        } else {
            v
        }
    };

    let rho_dot_sq = correlation_sq(cov_yh_yl, var_yl, var_yh);
    let beta_dot = control_beta(cov_yh_yl, var_yl);

    MlmfControl {
        gamma,
        rho_dot_sq,
        beta_dot,
        var_yh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::accumulators::GroupSums;
    use crate::core::ModelKey;
    use assert_approx_eq::assert_approx_eq;
    use rand::Rng;
    use rand_pcg::Pcg64;

    #[test]
    fn variance_matches_two_pass_formula() {
        let xs = [1.0, 4.0, -2.0, 0.5, 3.25];
        let sum: f64 = xs.iter().sum();
        let sum_sq: f64 = xs.iter().map(|x| x * x).sum();
        let mu = sum / xs.len() as f64;
        let two_pass: f64 =
            xs.iter().map(|x| (x - mu) * (x - mu)).sum::<f64>() / (xs.len() - 1) as f64;

        assert_approx_eq!(variance(sum, sum_sq, xs.len()), two_pass, 1e-12);
    }

    #[test]
    fn variance_is_non_negative_for_random_accumulations() {
        let mut rng = Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96);
        let key = vec![ModelKey::new(0, 0), ModelKey::new(1, 0)];

        for _ in 0..100 {
            let mut sums = GroupSums::<f64>::new(key.clone(), 1);
            let n = 2 + rng.gen_range(0, 50);
            let scale: f64 = 10.0_f64.powi(rng.gen_range(-3, 4));
            for _ in 0..n {
                let l: f64 = rng.gen::<f64>() * scale;
                let h = l + rng.gen::<f64>();
                sums.add_draw(&[vec![l], vec![h]]);
            }
            let var_l = variance(sums.power_sum(0, 1, 0), sums.power_sum(0, 2, 0), n);
            let var_h = variance(sums.power_sum(1, 1, 0), sums.power_sum(1, 2, 0), n);
            assert!(var_l >= 0.0);
            assert!(var_h >= 0.0);

            // Cauchy-Schwarz keeps the correlation within [0, 1]
            let cov = covariance(
                sums.power_sum(0, 1, 0),
                sums.power_sum(1, 1, 0),
                sums.cross_sum(0, 1, 1, 0),
                n,
            );
            if let Some(rho_sq) = correlation_sq(cov, var_l, var_h) {
                assert!(rho_sq >= 0.0 && rho_sq < 1.0);
            }
        }
    }

    #[test]
    fn perfect_correlation_is_reported_as_degenerate() {
        // L == H exactly: rho^2 computes to one
        let xs = [1.0, 2.0, 3.0, 4.0];
        let sum: f64 = xs.iter().sum();
        let sum_sq: f64 = xs.iter().map(|x| x * x).sum();
        let var = variance(sum, sum_sq, xs.len());
        let cov = covariance(sum, sum, sum_sq, xs.len());

        assert!(correlation_sq(cov, var, var).is_none());
    }

    #[test]
    fn zero_variance_is_reported_as_degenerate() {
        assert!(correlation_sq(0.5, 0.0, 1.0).is_none());
        assert_eq!(control_beta(0.5, 0.0), 0.0);
    }

    #[test]
    fn gamma_regression_recovers_an_exact_linear_control() {
        // Construct H_l, H_{l-1} from L_l, L_{l-1} so that
        // Y^H = 2 L_l - 0.5 L_{l-1} holds exactly. The stationary gamma then
        // reproduces the weight ratio 0.5 / 2 = 0.25 and the adjusted
        // correlation is degenerate (perfect).
        let mut rng = Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7ac28fa16a64abf96);
        let mut sums = MlPairSums {
            ll: 0.0,
            llm1: 0.0,
            hl: 0.0,
            hlm1: 0.0,
            ll_ll: 0.0,
            ll_llm1: 0.0,
            llm1_llm1: 0.0,
            hl_ll: 0.0,
            hl_llm1: 0.0,
            hlm1_ll: 0.0,
            hlm1_llm1: 0.0,
            hl_hl: 0.0,
            hl_hlm1: 0.0,
            hlm1_hlm1: 0.0,
        };
        let n = 200;
        for _ in 0..n {
            let ll: f64 = rng.gen();
            let llm1: f64 = rng.gen();
            let hlm1: f64 = rng.gen();
            let hl = hlm1 + 2.0 * ll - 0.5 * llm1;

            sums.ll += ll;
            sums.llm1 += llm1;
            sums.hl += hl;
            sums.hlm1 += hlm1;
            sums.ll_ll += ll * ll;
            sums.ll_llm1 += ll * llm1;
            sums.llm1_llm1 += llm1 * llm1;
            sums.hl_ll += hl * ll;
            sums.hl_llm1 += hl * llm1;
            sums.hlm1_ll += hlm1 * ll;
            sums.hlm1_llm1 += hlm1 * llm1;
            sums.hl_hl += hl * hl;
            sums.hl_hlm1 += hl * hlm1;
            sums.hlm1_hlm1 += hlm1 * hlm1;
        }

        let control = mlmf_control(&sums, n);
        assert_approx_eq!(control.gamma, 0.25, 1e-9);
        // Y^H and Y^L(gamma) are perfectly correlated; rounding may leave the
        // computed rho^2 a hair below one or push it into the degenerate case
        match control.rho_dot_sq {
            None => {}
            Some(rho_sq) => assert!(rho_sq > 1.0 - 1e-10),
        }
        assert!(control.var_yh > 0.0);
    }
}

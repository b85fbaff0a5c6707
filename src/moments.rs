//! Moment roll-up and final statistics.
//!
//! The control-variate correction is applied independently per raw moment
//! order,
//!
//! $$ \hat{H}_m = \bar{H}_m^\mathrm{shared} + \beta_m \left(
//! \bar{L}_m^\mathrm{refined} - \bar{L}_m^\mathrm{shared} \right) $$
//!
//! after which the corrected raw moments are converted to the usual central
//! and standardized moments (mean, variance, skewness, excess kurtosis).

use crate::core::accumulators::MAX_MOMENT_ORDER;
use crate::core::estimators::BasicEstimators;
use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};

/// Raw moments $\mathbb{E}[X^m]$ of orders one through four for one QoI.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct RawMoments<T>(pub [T; MAX_MOMENT_ORDER]);

/// Apply the control-variate correction per moment order.
pub fn apply_control<T: Float>(
    h_shared: &RawMoments<T>,
    beta: &[T; MAX_MOMENT_ORDER],
    l_shared: &RawMoments<T>,
    l_refined: &RawMoments<T>,
) -> RawMoments<T> {
    let mut corrected = h_shared.0;
    for m in 0..MAX_MOMENT_ORDER {
        corrected[m] = corrected[m] + beta[m] * (l_refined.0[m] - l_shared.0[m]);
    }
    RawMoments(corrected)
}

/// Final standardized moments of one QoI.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct FinalMoments<T> {
    /// The mean.
    pub mean: T,
    /// The central second moment.
    pub variance: T,
    /// The standardized third moment.
    pub skewness: T,
    /// The standardized fourth moment, with the normal-distribution offset
    /// of three removed (excess kurtosis).
    pub kurtosis: T,
}

impl<T: Float> BasicEstimators<T> for FinalMoments<T> {
    fn mean(&self) -> T {
        self.mean
    }

    fn var(&self) -> T {
        self.variance
    }
}

/// Convert raw moments to central/standardized moments.
///
/// Central moments use the standard transformation
/// $c_2 = m_2 - m_1^2$,
/// $c_3 = m_3 - 3 m_1 m_2 + 2 m_1^3$,
/// $c_4 = m_4 - 4 m_1 m_3 + 6 m_1^2 m_2 - 3 m_1^4$;
/// the variance is clamped at zero before standardization so a noisy
/// near-constant QoI cannot produce a negative radicand.
pub fn raw_to_standard<T: Float + FromPrimitive>(raw: &RawMoments<T>) -> FinalMoments<T> {
    let [m1, m2, m3, m4] = raw.0;
    let two = T::from_f64(2.0).unwrap();
    let three = T::from_f64(3.0).unwrap();
    let four = T::from_f64(4.0).unwrap();
    let six = T::from_f64(6.0).unwrap();

    let c2 = (m2 - m1 * m1).max(T::zero());
    let c3 = m3 - three * m1 * m2 + two * m1 * m1 * m1;
    let c4 = m4 - four * m1 * m3 + six * m1 * m1 * m2 - three * m1 * m1 * m1 * m1;

    let (skewness, kurtosis) = if c2 > T::zero() {
        let sigma = c2.sqrt();
        (c3 / (c2 * sigma), c4 / (c2 * c2) - three)
    } else {
        (T::zero(), T::zero())
    };

    FinalMoments {
        mean: m1,
        variance: c2,
        skewness,
        kurtosis,
    }
}

/// The estimator variance of plain Monte Carlo on the truth model at the
/// same equivalent-HF cost: `var_h / equiv_cost`. The cost is floored at
/// one truth evaluation.
pub fn mc_equivalent_variance<T: Float>(var_h: T, equiv_cost: T) -> T {
    var_h / equiv_cost.max(T::one())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn identical_models_contribute_zero_net_correction() {
        // L is a deterministic exact copy of H and the refined sample set
        // equals the shared one: the corrected moments are the plain Monte
        // Carlo moments of the truth samples.
        let h_shared = RawMoments([0.5, 0.35, 0.28, 0.24]);
        let l_shared = h_shared;
        let l_refined = h_shared;
        let beta = [1.0; MAX_MOMENT_ORDER];

        let corrected = apply_control(&h_shared, &beta, &l_shared, &l_refined);
        assert_eq!(corrected, h_shared);
    }

    #[test]
    fn correction_shifts_each_order_independently() {
        let h_shared = RawMoments([1.0, 2.0, 3.0, 4.0]);
        let l_shared = RawMoments([0.9, 1.8, 2.7, 3.6]);
        let l_refined = RawMoments([1.0, 1.8, 2.9, 3.6]);
        let beta = [0.5, 1.0, 2.0, 0.0];

        let corrected = apply_control(&h_shared, &beta, &l_shared, &l_refined);
        assert_approx_eq!(corrected.0[0], 1.0 + 0.5 * 0.1, 1e-12);
        assert_approx_eq!(corrected.0[1], 2.0, 1e-12);
        assert_approx_eq!(corrected.0[2], 3.0 + 2.0 * 0.2, 1e-12);
        assert_approx_eq!(corrected.0[3], 4.0, 1e-12);
    }

    #[test]
    fn standard_moments_of_a_known_distribution() {
        // raw moments of a uniform [0, 1] variable
        let raw = RawMoments([0.5, 1.0 / 3.0, 0.25, 0.2]);
        let moments = raw_to_standard(&raw);

        assert_approx_eq!(moments.mean, 0.5, 1e-12);
        assert_approx_eq!(moments.variance, 1.0 / 12.0, 1e-12);
        assert_approx_eq!(moments.skewness, 0.0, 1e-10);
        assert_approx_eq!(moments.kurtosis, -1.2, 1e-10);
        assert_approx_eq!(moments.std(), (1.0_f64 / 12.0).sqrt(), 1e-12);
    }

    #[test]
    fn constant_qoi_degrades_gracefully() {
        let raw = RawMoments([2.0, 4.0, 8.0, 16.0]);
        let moments = raw_to_standard(&raw);
        assert_approx_eq!(moments.variance, 0.0);
        assert_eq!(moments.skewness, 0.0);
        assert_eq!(moments.kurtosis, 0.0);
    }

    #[test]
    fn mc_baseline_uses_the_equivalent_cost() {
        assert_approx_eq!(mc_equivalent_variance(4.0, 100.0), 0.04, 1e-12);
        // cost floor
        assert_approx_eq!(mc_equivalent_variance(4.0, 0.5), 4.0, 1e-12);
    }
}

//! Running power-sum and cross-product accumulators.
//!
//! A [`GroupSums`] maintains, for every member model of a group and every
//! QoI, the running sums $\sum_j v_j^m$ of orders $m = 1, \ldots, 4$, and for
//! every member pair the cross-product sums $\sum_j a_j^m b_j^m$. A draw
//! contributes to a QoI only if *every* member value for that QoI is finite,
//! so the mean, variance and covariance estimators derived from one
//! accumulator always share the same sample population.
//!
//! Accumulators merge by plain sum addition, which makes accumulation
//! commutative and associative: batches may be consumed in any order.

use crate::core::ModelKey;
use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Highest moment order tracked by every accumulator.
pub const MAX_MOMENT_ORDER: usize = 4;

/// Running power sums and pairwise cross-product sums for a group of models,
/// with per-QoI draw counts.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GroupSums<T> {
    members: Vec<ModelKey>,
    num_qoi: usize,
    /// Power sums, flattened as `[member][order][qoi]`.
    power: Vec<T>,
    /// Squared power sums $\sum_j (v_j^m)^2$, same layout. These feed the
    /// variance of the $m$-th power, which the per-order control-variate
    /// regressions need.
    power_sq: Vec<T>,
    /// Cross-product sums for each unordered member pair `(i, j)` with
    /// `i < j`, flattened as `[pair][order][qoi]`.
    cross: Vec<T>,
    /// Per-QoI number of draws accumulated.
    count: Vec<usize>,
}

impl<T: Float + FromPrimitive + AddAssign> GroupSums<T> {
    /// An empty accumulator for the given group members.
    pub fn new(members: Vec<ModelKey>, num_qoi: usize) -> Self {
        debug_assert!(!members.is_empty());
        let n = members.len();
        let pairs = n * (n - 1) / 2;
        Self {
            members,
            num_qoi,
            power: vec![T::zero(); n * MAX_MOMENT_ORDER * num_qoi],
            power_sq: vec![T::zero(); n * MAX_MOMENT_ORDER * num_qoi],
            cross: vec![T::zero(); pairs * MAX_MOMENT_ORDER * num_qoi],
            count: vec![0; num_qoi],
        }
    }

    /// The member entries of the underlying group.
    pub fn members(&self) -> &[ModelKey] {
        &self.members
    }

    /// The number of QoI tracked.
    pub fn num_qoi(&self) -> usize {
        self.num_qoi
    }

    /// The number of draws accumulated for QoI `qoi`.
    pub fn count(&self, qoi: usize) -> usize {
        self.count[qoi]
    }

    /// The per-QoI draw counts.
    pub fn counts(&self) -> &[usize] {
        &self.count
    }

    fn power_index(&self, member: usize, order: usize, qoi: usize) -> usize {
        debug_assert!((1..=MAX_MOMENT_ORDER).contains(&order));
        (member * MAX_MOMENT_ORDER + order - 1) * self.num_qoi + qoi
    }

    /// Index of the unordered pair `(i, j)`, `i < j`, among all pairs of `n`
    /// members, in lexicographic order.
    fn pair_offset(i: usize, j: usize, n: usize) -> usize {
        debug_assert!(i < j && j < n);
        i * n - i * (i + 1) / 2 + j - i - 1
    }

    fn cross_index(&self, i: usize, j: usize, order: usize, qoi: usize) -> usize {
        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
        let pair = Self::pair_offset(lo, hi, self.members.len());
        (pair * MAX_MOMENT_ORDER + order - 1) * self.num_qoi + qoi
    }

    /// Accumulate one draw. `values[m]` holds the per-QoI values of member
    /// `m`. For each QoI, the draw is included only if all member values for
    /// that QoI are finite; inclusion is decided independently per QoI.
    pub fn add_draw(&mut self, values: &[Vec<T>]) {
        debug_assert_eq!(values.len(), self.members.len());
        let n = self.members.len();

        for qoi in 0..self.num_qoi {
            if values.iter().any(|v| !v[qoi].is_finite()) {
                continue;
            }
            self.count[qoi] += 1;

            for (member, v) in values.iter().enumerate() {
                let mut p = v[qoi];
                for order in 1..=MAX_MOMENT_ORDER {
                    let idx = self.power_index(member, order, qoi);
                    self.power[idx] += p;
                    self.power_sq[idx] += p * p;
                    p = p * v[qoi];
                }
            }

            for i in 0..n {
                for j in (i + 1)..n {
                    let (a, b) = (values[i][qoi], values[j][qoi]);
                    let mut pa = a;
                    let mut pb = b;
                    for order in 1..=MAX_MOMENT_ORDER {
                        let idx = self.cross_index(i, j, order, qoi);
                        self.cross[idx] += pa * pb;
                        pa = pa * a;
                        pb = pb * b;
                    }
                }
            }
        }
    }

    /// The running sum $\sum_j v_j^m$ for member `member`, order `m = order`
    /// and QoI `qoi`.
    pub fn power_sum(&self, member: usize, order: usize, qoi: usize) -> T {
        self.power[self.power_index(member, order, qoi)]
    }

    /// The running sum $\sum_j (v_j^m)^2$ for member `member`, order
    /// `m = order` and QoI `qoi`.
    pub fn power_sq_sum(&self, member: usize, order: usize, qoi: usize) -> T {
        self.power_sq[self.power_index(member, order, qoi)]
    }

    /// The running cross-product sum $\sum_k a_k^m b_k^m$ for members `i` and
    /// `j` (in either order), order `m = order` and QoI `qoi`.
    pub fn cross_sum(&self, i: usize, j: usize, order: usize, qoi: usize) -> T {
        debug_assert_ne!(i, j);
        self.cross[self.cross_index(i, j, order, qoi)]
    }
}

impl<T: Float + FromPrimitive + AddAssign> Add for GroupSums<T> {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl<T: Float + FromPrimitive + AddAssign> AddAssign for GroupSums<T> {
    fn add_assign(&mut self, other: Self) {
        debug_assert_eq!(self.members, other.members);
        debug_assert_eq!(self.num_qoi, other.num_qoi);

        for (s, o) in self.power.iter_mut().zip(other.power) {
            *s += o;
        }
        for (s, o) in self.power_sq.iter_mut().zip(other.power_sq) {
            *s += o;
        }
        for (s, o) in self.cross.iter_mut().zip(other.cross) {
            *s += o;
        }
        for (c, o) in self.count.iter_mut().zip(other.count) {
            *c += o;
        }
    }
}

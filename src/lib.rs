#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! The crate `multifid` provides [multifidelity Monte Carlo] sample allocation routines, which
//! combine an expensive truth model with cheaper correlated approximations so that a statistic
//! of the truth model is estimated at a fraction of the plain Monte Carlo cost.
//!
//! # Features
//!
//! This library was designed with the following features as essential in mind:
//!
//! - **Generic numeric type**. The numeric type used in this library is not fixed, but instead a
//! generic parameter, so that the estimation routines can be used with either `f32`, `f64`, or a
//! custom numeric type that implements the `Float` trait from the `num-traits` crate.
//! - **Generic random number generator**. Every random number generator that implements the `Rng`
//! trait from the `rand` crate can be used with every driver in this crate.
//! - **Reproducibility**. All parameter draws are consumed sequentially from a single seeded
//! generator before batches are dispatched, so the results only depend on the chosen generator
//! and seed. In particular, they do not depend on the number of cores the evaluation was started
//! with or how the batches are distributed on different cores.
//! - **Non-finite number filtering**. The accumulators filter out non-finite responses per
//! quantity of interest: a draw contributes to a QoI only if every group member returned a finite
//! value for it, which keeps means, variances and covariances on a single consistent population.
//! Separate allocated/actual counters keep track of how many evaluations were lost, and the
//! drivers can optionally backfill them.
//! - **Checkpoints**. Each outer iteration produces a serializable checkpoint carrying the
//! generator state before and after the iteration together with the accumulated sums, counters
//! and the current allocation, so long runs can be replayed or resumed without a difference in
//! the final results.
//!
//! # What is ...?
//!
//! This section is a dictionary of terms that are used in this documentation. Given a truth
//! model $H$ and an approximation $L$ with squared correlation $\rho^2$ and cost ratio
//! $w = c_H / c_L$, the control-variate estimator
//!
//! $$ \hat{H} = \bar{H}_N + \beta \left( \bar{L}_{rN} - \bar{L}_N \right) $$
//!
//! reduces the estimator variance by a factor that grows with $\rho^2$ and $w$. We use the
//! following terms:
//!
//! - the *truth model* (or *HF model*) is the highest-fidelity ensemble entry, whose statistics
//! are being estimated;
//! - an *approximation* (or *LF model*) is any cheaper ensemble entry used only to reduce
//! variance, never to bias the estimate;
//! - the *evaluation ratio* $r_i$ is the number of samples of approximation $i$ per truth
//! sample;
//! - the *equivalent-HF cost* is a total sampling effort normalized into units of one truth
//! evaluation, which is assumed to be the expensive operation;
//! - the *pilot* is the initial batch of shared draws from which correlations, variances and
//! (optionally) per-entry costs are first estimated;
//! - the *estimator variance* is the variance of the estimated statistic itself; dividing it by
//! the plain Monte Carlo estimator variance at equal cost gives the *variance ratio* reported by
//! the allocation solvers.
//!
//! [multifidelity Monte Carlo]: https://epubs.siam.org/doi/10.1137/15M1046472

pub mod callbacks;
pub mod core;
pub mod cost;
pub mod error;
pub mod estimation;
pub mod moments;
pub mod scheduler;
pub mod solvers;

pub use crate::core::*;

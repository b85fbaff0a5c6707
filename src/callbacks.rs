//! Implementation of different callback functions.

use crate::estimation::Checkpoint;
use num_traits::{Float, FromPrimitive};
use std::fmt::Display;
use std::ops::AddAssign;

/// Trait for implementing callbacks for the iterative estimation drivers.
pub trait Callback<T, R>
where
    T: Copy,
{
    /// This method is called after each successfully finished iteration and may print information
    /// about it.
    fn print(&self, chkpts: &[Checkpoint<T, R>]);
}

/// A callback function that does nothing
pub struct SinkCallback {}

impl<T, R> Callback<T, R> for SinkCallback
where
    T: Copy,
{
    fn print(&self, _: &[Checkpoint<T, R>]) {}
}

/// A callback function that prints the allocation of each individual iteration
pub struct SimpleCallback {}

impl<T, R> Callback<T, R> for SimpleCallback
where
    T: AddAssign + Display + Float + FromPrimitive,
{
    fn print(&self, chkpts: &[Checkpoint<T, R>]) {
        // Make sure that there is at least one checkpoint
        // otherwise do nothing.
        if let Some(chkpt) = chkpts.last() {
            let solution = chkpt.solution();
            println!("iteration {} finished.", chkpt.iteration());
            println!(
                "this iteration: estvar={} equivalent HF cost={}",
                solution.avg_estvar(),
                chkpt.equiv_hf_cost()
            );
        }
    }
}

/// Cumulative callback that shows the allocation of the individual iteration
/// together with the total sampling effort spent so far.
pub struct SimpleCumulativeCallback {}

impl<T, R> Callback<T, R> for SimpleCumulativeCallback
where
    T: AddAssign + Display + Float + FromPrimitive,
{
    fn print(&self, chkpts: &[Checkpoint<T, R>]) {
        if let Some(chkpt) = chkpts.last() {
            let truth_samples: usize = chkpt
                .counters()
                .last()
                .map(|c| c.alloc())
                .unwrap_or_default();

            println!(
                "[iteration {}: estvar={}] [cumulative: N_H={} cost={}]",
                chkpt.iteration(),
                chkpt.solution().avg_estvar(),
                truth_samples,
                chkpt.equiv_hf_cost()
            );
        }
    }
}

//! Sample increment scheduling and batched evaluation.
//!
//! The scheduler converts a target allocation into one-sided sample
//! increments relative to the counts already evaluated, dispatches batches
//! of parameter sets against model groups and collects the responses. The
//! asynchronous mode means "submit many batches, then block once": the
//! [`BatchEvaluator::synchronize`] barrier drains every outstanding batch
//! into a [`BatchArena`], which owns the responses until they are released
//! at the end-of-iteration checkpoint.
//!
//! Parameter draws are generated sequentially from a single seeded
//! generator *before* dispatch, so two runs with identical seeds and
//! increment sequences consume identical draws regardless of how batches
//! are scheduled or how many cores evaluate them.

use crate::core::{ModelEnsemble, ModelGroup, Response};
use num_traits::{Float, FromPrimitive};
use rand::distributions::{Distribution, Standard};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crossbeam as cb;

/// The one-sided, relaxation-damped sample increment
/// `max(0, ceil(relax * (target - current)))`.
pub fn one_sided_delta<T: Float + FromPrimitive>(target: T, current: T, relax: T) -> usize {
    let delta = relax * (target - current);
    if delta <= T::zero() {
        0
    } else {
        delta.ceil().to_usize().unwrap_or(0)
    }
}

/// Relaxation factor schedule damping the early sample increments to avoid
/// runaway oversampling while the statistics are still noisy.
///
/// Note that the estimator variance reported by the allocation solver is
/// that of the *unrelaxed* target; the realized (damped) increment is
/// tracked only in the sample counters. This mirrors a known approximation
/// in the upstream formulation and is kept as documented behavior.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct RelaxationSchedule<T> {
    initial: T,
    growth: T,
}

impl<T: Float + FromPrimitive> RelaxationSchedule<T> {
    /// A constant relaxation factor (use `fixed(1)` for undamped
    /// increments).
    pub fn fixed(factor: T) -> Self {
        Self {
            initial: factor,
            growth: T::zero(),
        }
    }

    /// A factor ramping additively from `initial` toward one.
    pub fn ramp(initial: T, growth: T) -> Self {
        Self { initial, growth }
    }

    /// The factor applied in outer iteration `iteration` (zero-based),
    /// never exceeding one.
    pub fn factor(&self, iteration: usize) -> T {
        let f = self.initial + self.growth * T::from_usize(iteration).unwrap();
        f.min(T::one())
    }
}

impl<T: Float + FromPrimitive> Default for RelaxationSchedule<T> {
    fn default() -> Self {
        Self::fixed(T::one())
    }
}

/// Handle of one submitted batch.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

/// The collected responses of one batch: `responses[sample][member]`.
#[derive(Clone, Debug)]
pub struct BatchResponses<T> {
    group_id: usize,
    responses: Vec<Vec<Response<T>>>,
}

impl<T> BatchResponses<T> {
    /// Assemble the responses of one batch.
    pub fn new(group_id: usize, responses: Vec<Vec<Response<T>>>) -> Self {
        Self {
            group_id,
            responses,
        }
    }

    /// Identifier of the group the batch was evaluated against.
    pub fn group_id(&self) -> usize {
        self.group_id
    }

    /// Per-sample, per-member responses.
    pub fn responses(&self) -> &[Vec<Response<T>>] {
        &self.responses
    }
}

/// Owned arena of collected batches, keyed by batch id.
///
/// Batches stay in the arena until they are taken or released; the driver
/// calls [`release_all`](BatchArena::release_all) at the end of every outer
/// iteration so that consumed responses never accumulate across iterations.
#[derive(Debug)]
pub struct BatchArena<T> {
    batches: HashMap<BatchId, BatchResponses<T>>,
}

impl<T> BatchArena<T> {
    /// An empty arena.
    pub fn new() -> Self {
        Self {
            batches: HashMap::new(),
        }
    }

    /// Store a collected batch.
    pub fn insert(&mut self, id: BatchId, responses: BatchResponses<T>) {
        self.batches.insert(id, responses);
    }

    /// Remove and return one batch.
    pub fn take(&mut self, id: BatchId) -> Option<BatchResponses<T>> {
        self.batches.remove(&id)
    }

    /// Drop one batch without consuming it.
    pub fn release(&mut self, id: BatchId) {
        self.batches.remove(&id);
    }

    /// Drop all batches.
    pub fn release_all(&mut self) {
        self.batches.clear();
    }

    /// Number of batches currently held.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether the arena holds no batches.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl<T> Default for BatchArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Batched evaluation service consumed by the estimation drivers.
///
/// `submit` queues a batch without blocking; `synchronize` blocks once for
/// all outstanding batches and moves their responses into the arena. The
/// service may evaluate batches in parallel internally, but the interface
/// presented to the driver is the submit/synchronize pair.
pub trait BatchEvaluator<T: Copy> {
    /// Queue a batch of parameter sets against `group`; returns the handle
    /// under which the responses will appear in the arena.
    fn submit(&mut self, group: &ModelGroup, samples: Vec<Vec<T>>) -> BatchId;

    /// Block until every outstanding batch has been evaluated.
    fn synchronize(&mut self) -> &mut BatchArena<T>;

    /// Evaluate a single batch synchronously.
    fn evaluate_blocking(&mut self, group: &ModelGroup, samples: Vec<Vec<T>>) -> BatchResponses<T> {
        let id = self.submit(group, samples);
        self.synchronize()
            .take(id)
            .expect("a synchronized batch is present in the arena")
    }
}

/// Half-open sample range assigned to `core` when splitting `total` samples
/// over `n_cores` cores. Ranges are clamped to `total`, so trailing cores of
/// a batch smaller than the core grid receive empty ranges.
pub(crate) fn samples_for_core(core: usize, n_cores: usize, total: usize) -> (usize, usize) {
    debug_assert!(core < n_cores);
    let per_core = (total as f32 / n_cores as f32).ceil() as usize;
    let begin = (core * per_core).min(total);
    let end = (begin + per_core).min(total);
    (begin, end)
}

/// In-process evaluation service.
///
/// Splits each batch across `n_cores` scoped threads; every thread
/// evaluates a contiguous slice of the samples for all group members, and
/// the slices are reassembled in submission order, so the collected
/// responses are independent of the core count.
pub struct LocalEvaluator<'a, T, M> {
    model: &'a M,
    n_cores: usize,
    next_id: u64,
    pending: Vec<(BatchId, ModelGroup, Vec<Vec<T>>)>,
    arena: BatchArena<T>,
}

impl<'a, T, M> LocalEvaluator<'a, T, M>
where
    T: Float + Send + Sync,
    M: ModelEnsemble<T>,
{
    /// An evaluator executing batches on `n_cores` cores.
    pub fn new(model: &'a M, n_cores: usize) -> Self {
        debug_assert!(n_cores > 0);
        Self {
            model,
            n_cores,
            next_id: 0,
            pending: Vec::new(),
            arena: BatchArena::new(),
        }
    }

    fn evaluate(&self, group: &ModelGroup, samples: &[Vec<T>]) -> Vec<Vec<Response<T>>> {
        let total = samples.len();
        let n_cores = self.n_cores.min(total.max(1));
        let model = self.model;

        let chunks = cb::thread::scope(|s| {
            let mut handles = Vec::with_capacity(n_cores);
            for core in 0..n_cores {
                let (begin, end) = samples_for_core(core, n_cores, total);
                let slice = &samples[begin..end];
                let members = group.members();
                handles.push(s.spawn(move |_| {
                    slice
                        .iter()
                        .map(|x| members.iter().map(|&m| model.evaluate(m, x)).collect())
                        .collect::<Vec<Vec<Response<T>>>>()
                }));
            }
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();

        chunks.into_iter().flatten().collect()
    }
}

impl<'a, T, M> BatchEvaluator<T> for LocalEvaluator<'a, T, M>
where
    T: Float + Send + Sync,
    M: ModelEnsemble<T>,
{
    fn submit(&mut self, group: &ModelGroup, samples: Vec<Vec<T>>) -> BatchId {
        let id = BatchId(self.next_id);
        self.next_id += 1;
        self.pending.push((id, group.clone(), samples));
        id
    }

    fn synchronize(&mut self) -> &mut BatchArena<T> {
        let pending = std::mem::replace(&mut self.pending, Vec::new());
        for (id, group, samples) in pending {
            let responses = self.evaluate(&group, &samples);
            self.arena
                .insert(id, BatchResponses::new(group.id(), responses));
        }
        &mut self.arena
    }
}

/// Draw `count` parameter sets of dimension `dim` sequentially from `rng`.
pub fn draw_samples<T, R>(rng: &mut R, count: usize, dim: usize) -> Vec<Vec<T>>
where
    T: Float,
    R: Rng,
    Standard: Distribution<T>,
{
    (0..count)
        .map(|_| (0..dim).map(|_| rng.gen()).collect())
        .collect()
}

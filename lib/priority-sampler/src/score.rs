//! Decaying per-signature frequency estimation.
//!
//! Every signature has a live counter, incremented for each trace seen. On every decay tick, each score is halved and
//! the counts received since the previous tick are added to it:
//!
//! ```text
//! score = score / 2 + counts_since_last_tick
//! ```
//!
//! This is a low-pass filter whose half-life is one tick. With a steady arrival of `r` traces per tick, the score
//! converges to `2r`, so dividing a score by twice the tick interval gives an estimate of the recent number of traces
//! per second.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use arc_swap::ArcSwap;

use crate::collections::{FastConcurrentHashMap, FastHashMap};
use crate::signature::Signature;

/// Factor every score is divided by on each decay tick.
pub(crate) const DECAY_FACTOR: f64 = 2.0;

/// Returns the factor to divide a score by to get traces per second, given the decay tick interval.
///
/// A steady arrival rate converges to `DECAY_FACTOR / (DECAY_FACTOR - 1)` ticks worth of traces.
pub(crate) fn count_scale_factor(decay_period: Duration) -> f64 {
    (DECAY_FACTOR / (DECAY_FACTOR - 1.0)) * decay_period.as_secs_f64()
}

fn decayed(score: f64, count: u64) -> f64 {
    score / DECAY_FACTOR + count as f64
}

/// Scores as of the most recent decay tick.
#[derive(Debug, Default)]
pub struct ScoreSnapshot {
    scores: FastHashMap<Signature, f64>,
    total_score: f64,
    sampled_score: f64,
    ticks: u64,
}

impl ScoreSnapshot {
    /// Returns the score of the given signature, if it was tracked during the last tick.
    pub fn score(&self, sig: &Signature) -> Option<f64> {
        self.scores.get(sig).copied()
    }

    /// Returns all scores.
    pub fn scores(&self) -> &FastHashMap<Signature, f64> {
        &self.scores
    }

    /// Returns the decayed count of all traces, across signatures.
    pub fn total_score(&self) -> f64 {
        self.total_score
    }

    /// Returns the decayed count of sampled traces.
    pub fn sampled_score(&self) -> f64 {
        self.sampled_score
    }

    /// Returns the number of decay ticks that led to this snapshot.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

/// Per-signature decaying counters.
///
/// Counting is lock-free: each signature owns an atomic counter that producers increment. Decay ticks drain those
/// counters, fold them into the previous scores, and publish the result as a new [`ScoreSnapshot`], so readers always
/// observe the data of exactly one tick.
#[derive(Default)]
pub struct ScoreTable {
    counters: FastConcurrentHashMap<Signature, AtomicU64>,
    sampled: AtomicU64,
    snapshot: ArcSwap<ScoreSnapshot>,
    tick_lock: Mutex<()>,
}

impl ScoreTable {
    /// Creates a new, empty `ScoreTable`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one trace for the given signature.
    pub fn count_signature(&self, sig: Signature) {
        let counters = self.counters.pin();
        match counters.get(&sig) {
            Some(counter) => counter.fetch_add(1, Ordering::Relaxed),
            None => counters
                .get_or_insert_with(sig, AtomicU64::default)
                .fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Counts one sampled trace.
    pub fn count_sample(&self) {
        self.sampled.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of tracked signatures.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Returns the scores as of the most recent decay tick.
    pub fn snapshot(&self) -> Arc<ScoreSnapshot> {
        self.snapshot.load_full()
    }

    /// Runs a single decay tick, returning the new snapshot.
    ///
    /// Ticks are serialized against each other, but never block counting.
    pub fn decay(&self) -> Arc<ScoreSnapshot> {
        let _tick = self.tick_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = self.snapshot.load();
        let counters = self.counters.pin();

        let mut scores = FastHashMap::with_capacity_and_hasher(counters.len(), Default::default());
        let mut total_count = 0;
        for (sig, counter) in counters.iter() {
            let count = counter.swap(0, Ordering::AcqRel);
            total_count += count;

            let previous_score = previous.score(sig).unwrap_or(0.0);
            scores.insert(*sig, decayed(previous_score, count));
        }

        let next = Arc::new(ScoreSnapshot {
            scores,
            total_score: decayed(previous.total_score, total_count),
            sampled_score: decayed(previous.sampled_score, self.sampled.swap(0, Ordering::AcqRel)),
            ticks: previous.ticks + 1,
        });
        self.snapshot.store(Arc::clone(&next));
        next
    }
}

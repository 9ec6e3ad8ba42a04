//! Signature-based sampling core.
//!
//! The [`Sampler`] owns the decaying score table and turns scores into sample rates: a signature seen at `tps`
//! traces per second gets `min(1, extra_rate * target_tps / tps)`. Signatures without a score yet, and published
//! defaults, get a rate derived the same way from the total throughput across all signatures.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::collections::FastHashMap;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::score::{count_scale_factor, ScoreSnapshot, ScoreTable};
use crate::signature::Signature;

/// Internal statistics and coefficients of a [`Sampler`], for diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SamplerState {
    /// Number of tracked signatures.
    pub cardinality: usize,

    /// Estimated incoming traces per second, across all signatures.
    pub in_tps: f64,

    /// Estimated sampled traces per second.
    pub out_tps: f64,

    /// Target traces per second.
    pub target_tps: f64,

    /// Extra rate applied on top of computed rates.
    pub extra_rate: f64,

    /// Rate applied to signatures without a score.
    pub default_rate: f64,

    /// Lifecycle state of the decay loop.
    pub state: LifecycleState,
}

/// Signature sampler.
///
/// Counting is lock-free and can be done from any number of threads. Rates are computed on demand from the scores of
/// the most recent decay tick, which is driven by [`run`][Self::run].
pub struct Sampler {
    scores: ScoreTable,
    extra_rate: f64,
    target_tps: AtomicU64,
    rate_threshold_to_1: f64,
    decay_period: Duration,
    count_scale_factor: f64,
    lifecycle: Lifecycle,
}

impl Sampler {
    /// Creates a new `Sampler`.
    ///
    /// Computed rates are never rounded up to `1.0` until a threshold is set with
    /// [`with_rate_threshold_to_1`][Self::with_rate_threshold_to_1].
    pub fn new(extra_rate: f64, target_tps: f64, decay_period: Duration) -> Self {
        Self {
            scores: ScoreTable::new(),
            extra_rate,
            target_tps: AtomicU64::new(target_tps.to_bits()),
            rate_threshold_to_1: 1.0,
            decay_period,
            count_scale_factor: count_scale_factor(decay_period),
            lifecycle: Lifecycle::new("sampler"),
        }
    }

    /// Sets the threshold above which computed rates are reported as exactly `1.0`.
    pub fn with_rate_threshold_to_1(mut self, rate_threshold_to_1: f64) -> Self {
        self.rate_threshold_to_1 = rate_threshold_to_1;
        self
    }

    /// Ties the decay loop to the given parent lifecycle, so that stopping the parent also stops this sampler.
    pub(crate) fn with_parent_lifecycle(mut self, parent: &Lifecycle) -> Self {
        self.lifecycle = parent.child("sampler");
        self
    }

    /// Counts one trace for the given signature.
    pub fn count_signature(&self, sig: Signature) {
        self.scores.count_signature(sig);
    }

    /// Counts one sampled trace.
    pub fn count_sample(&self) {
        self.scores.count_sample();
    }

    /// Runs the decay loop until [`stop`][Self::stop] is called.
    ///
    /// A decay tick fires every decay period. Returns once any in-flight tick has completed. If the sampler was already
    /// running, or was stopped before, returns immediately.
    pub async fn run(&self) {
        let Some(_running) = self.lifecycle.try_start() else {
            return;
        };

        if self.decay_period.is_zero() {
            warn!("Sampler decay period is zero. Scores will not decay.");
            return;
        }

        debug!(decay_period = ?self.decay_period, "Sampler decay loop started.");

        let mut ticker = interval_at(Instant::now() + self.decay_period, self.decay_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.lifecycle.cancelled() => break,
                _ = ticker.tick() => self.decay(),
            }
        }

        debug!("Sampler decay loop stopped.");
    }

    /// Signals the decay loop to stop, without waiting for it.
    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    /// Runs a single decay tick.
    pub(crate) fn decay(&self) {
        let snapshot = self.scores.decay();
        if snapshot.ticks() % 20 == 0 {
            info!(
                signatures = snapshot.scores().len(),
                in_tps = snapshot.total_score() / self.count_scale_factor,
                out_tps = snapshot.sampled_score() / self.count_scale_factor,
                "Sampler scores decayed."
            );
        }
    }

    /// Returns the sample rate to apply to traces of the given signature.
    ///
    /// Falls back to the default sample rate if the signature has no score yet.
    pub fn get_signature_sample_rate(&self, sig: Signature) -> f64 {
        let snapshot = self.scores.snapshot();
        match snapshot.score(&sig) {
            Some(score) if score > 0.0 => self.score_rate(score),
            _ => self.default_rate(&snapshot),
        }
    }

    /// Returns the sample rate of every scored signature, along with the default sample rate.
    ///
    /// Both come from the same decay tick.
    pub fn get_all_signature_sample_rates(&self) -> (FastHashMap<Signature, f64>, f64) {
        let snapshot = self.scores.snapshot();
        let rates = snapshot
            .scores()
            .iter()
            .filter(|(_, score)| **score > 0.0)
            .map(|(sig, score)| (*sig, self.score_rate(*score)))
            .collect();
        (rates, self.default_rate(&snapshot))
    }

    /// Returns the sample rate to apply to signatures without enough history to be scored.
    pub fn get_default_sample_rate(&self) -> f64 {
        self.default_rate(&self.scores.snapshot())
    }

    /// Returns the target traces per second.
    pub fn target_tps(&self) -> f64 {
        f64::from_bits(self.target_tps.load(Ordering::Relaxed))
    }

    /// Updates the target traces per second. Takes effect on the next rate computation.
    ///
    /// Targets that are not strictly positive, or not finite, are ignored.
    pub fn update_target_tps(&self, target_tps: f64) {
        if !target_tps.is_finite() || target_tps <= 0.0 {
            warn!(target_tps, "Ignoring invalid target traces per second.");
            return;
        }

        let previous = f64::from_bits(self.target_tps.swap(target_tps.to_bits(), Ordering::Relaxed));
        if previous != target_tps {
            info!(previous, target_tps, "Updated sampler target traces per second.");
        }
    }

    /// Returns the extra rate applied on top of computed rates.
    pub fn extra_rate(&self) -> f64 {
        self.extra_rate
    }

    /// Returns the number of tracked signatures.
    pub fn size(&self) -> usize {
        self.scores.len()
    }

    /// Returns a snapshot of the internal statistics of this sampler.
    pub fn get_state(&self) -> SamplerState {
        let snapshot = self.scores.snapshot();
        SamplerState {
            cardinality: self.scores.len(),
            in_tps: snapshot.total_score() / self.count_scale_factor,
            out_tps: snapshot.sampled_score() / self.count_scale_factor,
            target_tps: self.target_tps(),
            extra_rate: self.extra_rate,
            default_rate: self.default_rate(&snapshot),
            state: self.lifecycle.state(),
        }
    }

    fn score_rate(&self, score: f64) -> f64 {
        self.tps_rate(score / self.count_scale_factor)
    }

    fn default_rate(&self, snapshot: &ScoreSnapshot) -> f64 {
        self.tps_rate(snapshot.total_score() / self.count_scale_factor)
    }

    fn tps_rate(&self, seen_tps: f64) -> f64 {
        if seen_tps.is_nan() || seen_tps <= 0.0 {
            return self.load_rate(1.0);
        }

        let rate = self.extra_rate * self.target_tps() / seen_tps;
        if rate.is_nan() {
            return self.load_rate(1.0);
        }
        self.load_rate(rate.clamp(0.0, 1.0))
    }

    fn load_rate(&self, rate: f64) -> f64 {
        if rate > self.rate_threshold_to_1 {
            1.0
        } else {
            rate
        }
    }
}

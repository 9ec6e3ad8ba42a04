use std::{sync::Arc, time::Duration};

use priority_sampler::{trace::SAMPLING_PRIORITY_METRIC_KEY, PriorityEngine, RateByService, Span, Trace};
use rand::{rngs::StdRng, Rng as _, SeedableRng as _};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cli::ServiceTraffic;

const TICK: Duration = Duration::from_millis(100);

/// Totals for a traffic generator.
#[derive(Debug, Default)]
pub struct TrafficStats {
    pub generated: u64,
    pub kept: u64,
}

/// Emulates a client library: generates traces for one service at a steady rate, and keeps them according to the rate
/// last published for its service.
pub struct TrafficGenerator {
    traffic: ServiceTraffic,
    engine: Arc<PriorityEngine>,
    rate_by_service: Arc<RateByService>,
    rng: StdRng,
    next_trace_id: u64,
}

impl TrafficGenerator {
    pub fn new(
        traffic: ServiceTraffic, engine: Arc<PriorityEngine>, rate_by_service: Arc<RateByService>, seed: u64,
    ) -> Self {
        Self {
            traffic,
            engine,
            rate_by_service,
            rng: StdRng::seed_from_u64(seed),
            next_trace_id: 1,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> TrafficStats {
        let mut stats = TrafficStats::default();
        let per_tick = self.traffic.traces_per_second * TICK.as_secs_f64();
        let mut pending = 0.0;

        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    pending += per_tick;
                    while pending >= 1.0 {
                        pending -= 1.0;
                        stats.generated += 1;
                        if self.send_trace() {
                            stats.kept += 1;
                        }
                    }
                }
            }
        }

        debug!(service = %self.traffic.service, generated = stats.generated, kept = stats.kept, "Traffic generator stopped.");
        stats
    }

    fn send_trace(&mut self) -> bool {
        // Clients keep everything until the agent has told them otherwise.
        let rate = self
            .rate_by_service
            .get_all()
            .rate_for(&self.traffic.service, &self.traffic.env)
            .unwrap_or(1.0);
        let priority = if self.rng.random::<f64>() < rate { 1.0 } else { 0.0 };

        let trace_id = self.next_trace_id;
        self.next_trace_id += 1;

        let mut root =
            Span::new(self.traffic.service.as_str(), trace_id, 1, 0).with_metric(SAMPLING_PRIORITY_METRIC_KEY, priority);
        if !self.traffic.env.is_empty() {
            root = root.with_meta("env", self.traffic.env.as_str());
        }
        let child = Span::new(self.traffic.service.as_str(), trace_id, 2, 1);

        let mut trace = Trace::new(vec![root, child]);
        self.engine.sample_trace(&mut trace)
    }
}

use metrics::{counter, gauge, Counter, Gauge};

use crate::trace::SamplingPriority;

#[derive(Clone)]
pub(crate) struct Telemetry {
    traces_kept: Counter,
    traces_dropped: Counter,
    traces_no_opinion: Counter,
    traces_authoritative: Counter,
    rates_applied: Counter,
    rates_published: Counter,
    tracked_signatures: Gauge,
    default_rate: Gauge,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            traces_kept: counter!("trace_sampler_priority_traces_total", "decision" => "keep"),
            traces_dropped: counter!("trace_sampler_priority_traces_total", "decision" => "drop"),
            traces_no_opinion: counter!("trace_sampler_priority_traces_total", "decision" => "no_opinion"),
            traces_authoritative: counter!("trace_sampler_priority_traces_total", "decision" => "authoritative"),
            rates_applied: counter!("trace_sampler_priority_rates_applied_total"),
            rates_published: counter!("trace_sampler_priority_rates_published_total"),
            tracked_signatures: gauge!("trace_sampler_priority_signatures"),
            default_rate: gauge!("trace_sampler_priority_default_rate"),
        }
    }

    pub fn record_priority(&self, priority: SamplingPriority) {
        match priority {
            SamplingPriority::NoOpinion => self.traces_no_opinion.increment(1),
            SamplingPriority::ExplicitDrop => self.traces_dropped.increment(1),
            SamplingPriority::ExplicitKeep => self.traces_kept.increment(1),
            SamplingPriority::Authoritative(_) => self.traces_authoritative.increment(1),
        }
    }

    pub fn record_rate_applied(&self) {
        self.rates_applied.increment(1);
    }

    pub fn record_rates_published(&self, signatures: usize, default_rate: f64) {
        self.rates_published.increment(1);
        self.tracked_signatures.set(signatures as f64);
        self.default_rate.set(default_rate);
    }
}

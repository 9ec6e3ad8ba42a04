//! Traces, spans, and the sampling priority carried on trace roots.

use crate::collections::FastHashMap;

/// Metric key holding the sampling priority set by the client library.
pub const SAMPLING_PRIORITY_METRIC_KEY: &str = "_sampling_priority_v1";

const ENV_META_KEY: &str = "env";

/// The parts of a span that trace sampling reads or annotates.
///
/// Spans are owned by the trace pipeline; sampling only looks up the service, the IDs used to locate the root, and
/// the tags and metrics carried on it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Span {
    service: String,
    trace_id: u64,
    span_id: u64,
    parent_id: u64,
    meta: FastHashMap<String, String>,
    metrics: FastHashMap<String, f64>,
}

impl Span {
    /// Creates a new `Span` with no tags or metrics.
    pub fn new(service: impl Into<String>, trace_id: u64, span_id: u64, parent_id: u64) -> Self {
        Self {
            service: service.into(),
            trace_id,
            span_id,
            parent_id,
            meta: FastHashMap::default(),
            metrics: FastHashMap::default(),
        }
    }

    /// Sets a string tag on the span, returning the span.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Sets a numeric metric on the span, returning the span.
    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    /// Returns the service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the trace ID.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// Returns the span ID.
    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    /// Returns the parent span ID, or `0` when the span is a trace root.
    pub fn parent_id(&self) -> u64 {
        self.parent_id
    }

    /// Returns the string tags.
    pub fn meta(&self) -> &FastHashMap<String, String> {
        &self.meta
    }

    /// Returns the numeric metrics.
    pub fn metrics(&self) -> &FastHashMap<String, f64> {
        &self.metrics
    }

    /// Returns a mutable reference to the numeric metrics.
    pub fn metrics_mut(&mut self) -> &mut FastHashMap<String, f64> {
        &mut self.metrics
    }

    /// Returns the value of the given metric, if present.
    pub fn get_metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    /// Sets the value of the given metric.
    pub fn set_metric(&mut self, key: &str, value: f64) {
        self.metrics.insert(key.to_string(), value);
    }

    /// Returns `true` if this span has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_id == 0
    }
}

/// A trace.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trace {
    spans: Vec<Span>,
}

impl Trace {
    /// Creates a new `Trace` from the given spans.
    pub fn new(spans: Vec<Span>) -> Self {
        Self { spans }
    }

    /// Returns the spans in this trace.
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Returns a mutable reference to the spans in this trace.
    pub fn spans_mut(&mut self) -> &mut [Span] {
        &mut self.spans
    }

    /// Returns `true` if the trace contains no spans.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Finds the index of the root span of this trace.
    ///
    /// The last span without a parent wins, since some clients report the root last. When no span has a zero parent
    /// ID, the first span whose parent is not part of the trace is used, and failing that, the last span.
    ///
    /// Returns `None` if the trace is empty.
    pub fn root_span_index(&self) -> Option<usize> {
        let spans = &self.spans;
        if spans.is_empty() {
            return None;
        }

        if let Some(idx) = spans.iter().rposition(Span::is_root) {
            return Some(idx);
        }

        let mut parent_id_to_child: FastHashMap<u64, usize> = FastHashMap::default();
        for (idx, span) in spans.iter().enumerate().rev() {
            parent_id_to_child.insert(span.parent_id(), idx);
        }
        for span in spans {
            parent_id_to_child.remove(&span.span_id());
        }

        if parent_id_to_child.len() != 1 {
            tracing::debug!(
                trace_id = spans[0].trace_id(),
                "Didn't reliably find the root span for trace."
            );
        }

        let orphan = parent_id_to_child.values().min().copied();
        Some(orphan.unwrap_or(spans.len() - 1))
    }

    /// Returns the environment of the trace.
    ///
    /// The root span's `env` tag is preferred, with a fallback to the first span carrying one.
    pub fn env(&self, root_idx: usize) -> Option<&str> {
        self.spans
            .get(root_idx)
            .and_then(|root| root.meta().get(ENV_META_KEY))
            .or_else(|| self.spans.iter().find_map(|span| span.meta().get(ENV_META_KEY)))
            .map(String::as_str)
    }
}

/// Sampling priority of a trace, as decided by a client library or a rule engine upstream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SamplingPriority {
    /// No priority was set, or a negative one was: the client expressed no opinion this sampler can act on.
    NoOpinion,

    /// Priority `0`: the client library dropped the trace based on the rates it was given.
    ExplicitDrop,

    /// Priority `1`: the client library kept the trace based on the rates it was given.
    ExplicitKeep,

    /// Priority above `1`: the decision was made by a more authoritative layer, such as a user rule.
    Authoritative(i32),
}

impl SamplingPriority {
    /// Derives the sampling priority from a raw priority metric value.
    ///
    /// Fractional values are truncated. Missing, negative, and non-finite values carry no opinion.
    pub fn from_metric(value: Option<f64>) -> Self {
        match value {
            Some(value) if value.is_finite() && value >= 0.0 => match value as i32 {
                0 => Self::ExplicitDrop,
                1 => Self::ExplicitKeep,
                p => Self::Authoritative(p),
            },
            _ => Self::NoOpinion,
        }
    }

    /// Reads the sampling priority set on the given span.
    pub fn from_span(span: &Span) -> Self {
        Self::from_metric(span.get_metric(SAMPLING_PRIORITY_METRIC_KEY))
    }

    /// Returns `true` if the trace should be kept.
    pub const fn is_keep(&self) -> bool {
        matches!(self, Self::ExplicitKeep | Self::Authoritative(_))
    }

    /// Returns `true` if this decision participates in the rate feedback loop.
    pub const fn is_feedback(&self) -> bool {
        matches!(self, Self::ExplicitDrop | Self::ExplicitKeep)
    }
}

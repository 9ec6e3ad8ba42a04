//! Priority sampler for traces with a sampling priority set by the client library.
//!
//! Client libraries decide whether to keep a trace based on rates the agent advertises per service. This engine
//! respects those decisions, counts the traces they apply to in order to compute new rates, and periodically
//! publishes the rates to a shared [`RateByService`] store. Since sampling can happen at several layers, kept trace
//! roots are annotated with the rate applied here, unless a more specific layer already did so.

use std::sync::Arc;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::catalog::ServiceKeyCatalog;
use crate::collections::FastHashMap;
use crate::config::{ConfigurationError, PrioritySamplerConfiguration};
use crate::core_sampler::{Sampler, SamplerState};
use crate::lifecycle::Lifecycle;
use crate::rate_by_service::RateByService;
use crate::signature::{ServiceSignature, Signature};
use crate::telemetry::Telemetry;
use crate::trace::{SamplingPriority, Span, Trace};

/// Metric key set on trace roots by client libraries that applied an agent-provided rate.
pub const AGENT_RATE_KEY: &str = "_dd.agent_psr";

/// Metric key set on trace roots by client libraries that applied a sampling rule.
pub const RULE_RATE_KEY: &str = "_dd.rule_psr";

/// Metric key used by older client libraries to track the rate applied by the agent.
pub const DEPRECATED_RATE_KEY: &str = "_sampling_priority_rate_v1";

/// Outcome of sampling a trace: whether it is kept, and the signature it was counted under, if any.
struct Decision {
    sampled: bool,
    signature: Option<Signature>,
}

/// Priority sampling engine.
///
/// [`sample`][Self::sample] can be called concurrently from any number of ingestion paths while [`run`][Self::run]
/// drives the background decay and rate publication loops.
pub struct PriorityEngine {
    sampler: Sampler,
    catalog: ServiceKeyCatalog,
    rate_by_service: Arc<RateByService>,
    rate_threshold_to_1: f64,
    rate_sync_period: std::time::Duration,
    default_env: String,
    lifecycle: Lifecycle,
    telemetry: Telemetry,
}

impl PriorityEngine {
    /// Creates a new `PriorityEngine` publishing its rates to `rate_by_service`.
    ///
    /// # Errors
    ///
    /// If the configuration holds out-of-range values, such as a zero period, an error is returned.
    pub fn new(
        config: &PrioritySamplerConfiguration, rate_by_service: Arc<RateByService>,
    ) -> Result<Self, ConfigurationError> {
        let config = config.clone().validate()?;
        let lifecycle = Lifecycle::new("priority_sampler");
        let sampler = Sampler::new(
            config.extra_sample_rate(),
            config.target_traces_per_second(),
            config.decay_period(),
        )
        .with_rate_threshold_to_1(config.rate_threshold_to_1())
        .with_parent_lifecycle(&lifecycle);

        Ok(Self {
            sampler,
            catalog: ServiceKeyCatalog::new(),
            rate_by_service,
            rate_threshold_to_1: config.rate_threshold_to_1(),
            rate_sync_period: config.rate_sync_period(),
            default_env: config.default_env().to_string(),
            lifecycle,
            telemetry: Telemetry::new(),
        })
    }

    /// Replaces the catalog used to assign signatures to services.
    ///
    /// Must be called before any trace is sampled.
    pub fn with_catalog(mut self, catalog: ServiceKeyCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Returns the underlying sampler.
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Returns the catalog of service signatures seen so far.
    pub fn catalog(&self) -> &ServiceKeyCatalog {
        &self.catalog
    }

    /// Counts an incoming trace and returns whether it should be kept.
    ///
    /// The decision always follows the sampling priority set on the root span at `root_idx`. Only traces with a
    /// priority of `0` or `1` are counted towards rates, and kept ones get the rate applied here annotated on their
    /// root. Empty traces, and traces with an out-of-bounds root, are dropped without being counted.
    ///
    /// If `env` is empty, the configured default environment is used.
    pub fn sample(&self, trace: &mut Trace, root_idx: usize, env: &str) -> bool {
        let Some(root) = trace.spans().get(root_idx) else {
            return false;
        };
        let decision = self.count_trace(root, env);
        self.finish_sampling(trace, root_idx, decision)
    }

    /// Samples a trace, locating its root span and environment.
    pub fn sample_trace(&self, trace: &mut Trace) -> bool {
        let Some(root_idx) = trace.root_span_index() else {
            return false;
        };
        let Some(root) = trace.spans().get(root_idx) else {
            return false;
        };
        let decision = self.count_trace(root, trace.env(root_idx).unwrap_or_default());
        self.finish_sampling(trace, root_idx, decision)
    }

    fn count_trace(&self, root: &Span, env: &str) -> Decision {
        let priority = SamplingPriority::from_span(root);
        self.telemetry.record_priority(priority);

        // Regardless of rates, the decision belongs to the client library, or to the rules it applied.
        let sampled = priority.is_keep();

        // The feedback loop is scoped to the decisions it can act upon: traces with no priority, or with a priority
        // set by a more authoritative layer, are neither counted nor annotated.
        if !priority.is_feedback() {
            return Decision { sampled, signature: None };
        }

        let env = if env.is_empty() { self.default_env.as_str() } else { env };
        let signature = self.catalog.register_service(root.service(), env);

        // Count every trace, kept or not, so the scores reflect real traffic.
        self.sampler.count_signature(signature);

        Decision {
            sampled,
            signature: Some(signature),
        }
    }

    fn finish_sampling(&self, trace: &mut Trace, root_idx: usize, decision: Decision) -> bool {
        if let (true, Some(signature)) = (decision.sampled, decision.signature) {
            if let Some(root) = trace.spans_mut().get_mut(root_idx) {
                self.apply_rate(root, signature);
            }
            self.sampler.count_sample();
        }
        decision.sampled
    }

    fn apply_rate(&self, root: &mut Span, signature: Signature) {
        if !root.is_root() {
            return;
        }

        // Recent client libraries annotate roots with the rate they applied: the agent rate, or a rule rate. Either
        // one takes precedence over ours.
        if root.get_metric(AGENT_RATE_KEY).is_some() || root.get_metric(RULE_RATE_KEY).is_some() {
            return;
        }

        // Older client libraries rely on the deprecated key instead, which we only fill in if it isn't set already.
        if root.get_metric(DEPRECATED_RATE_KEY).is_none() {
            let mut rate = self.sampler.get_signature_sample_rate(signature);
            if rate > self.rate_threshold_to_1 {
                rate = 1.0;
            }
            root.set_metric(DEPRECATED_RATE_KEY, rate);
            self.telemetry.record_rate_applied();
        }
    }

    /// Runs the decay and rate publication loops until [`stop`][Self::stop] is called.
    ///
    /// Both loops share one shutdown signal, and this method returns once both have completed. If the engine was
    /// already running, or was stopped before, returns immediately.
    pub async fn run(&self) {
        let Some(_running) = self.lifecycle.try_start() else {
            return;
        };

        info!(
            target_tps = self.sampler.target_tps(),
            extra_rate = self.sampler.extra_rate(),
            rate_sync_period = ?self.rate_sync_period,
            "Priority sampler started."
        );

        tokio::join!(self.sampler.run(), self.run_rate_sync());

        info!("Priority sampler stopped.");
    }

    async fn run_rate_sync(&self) {
        let mut ticker = interval_at(Instant::now() + self.rate_sync_period, self.rate_sync_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.lifecycle.cancelled() => break,
                _ = ticker.tick() => self.publish_rates(),
            }
        }
    }

    fn publish_rates(&self) {
        let (rates_by_service, default_rate) = self.rates_by_service_with_default();
        debug!(
            services = rates_by_service.len(),
            default_rate, "Publishing rates by service."
        );
        self.telemetry
            .record_rates_published(self.sampler.size(), default_rate);
        self.rate_by_service.set_all(rates_by_service);
    }

    /// Stops the engine, waiting for both background loops to complete.
    ///
    /// Calling this more than once, or before [`run`][Self::run], is a no-op beyond preventing the engine from running.
    pub async fn stop(&self) {
        self.sampler.stop();
        self.lifecycle.stop();
        self.lifecycle.wait_stopped().await;
    }

    /// Returns a snapshot of the internal statistics of this engine, for diagnostics.
    pub fn get_state(&self) -> SamplerState {
        self.sampler.get_state()
    }

    /// Returns the current sample rate of every service signature seen so far.
    pub fn rates_by_service(&self) -> FastHashMap<ServiceSignature, f64> {
        self.rates_by_service_with_default().0
    }

    fn rates_by_service_with_default(&self) -> (FastHashMap<ServiceSignature, f64>, f64) {
        let (rates, default_rate) = self.sampler.get_all_signature_sample_rates();
        (self.catalog.rates_by_service(&rates, default_rate), default_rate)
    }

    /// Updates the target traces per second.
    ///
    /// Targets that are not strictly positive, or not finite, are ignored.
    pub fn update_target_tps(&self, target_tps: f64) {
        self.sampler.update_target_tps(target_tps);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lifecycle::LifecycleState;
    use crate::trace::SAMPLING_PRIORITY_METRIC_KEY;

    const TEST_ENV: &str = "testEnv";

    fn get_test_priority_engine() -> PriorityEngine {
        get_test_priority_engine_with(PrioritySamplerConfiguration::default())
    }

    fn get_test_priority_engine_with(config: PrioritySamplerConfiguration) -> PriorityEngine {
        PriorityEngine::new(&config, Arc::new(RateByService::new())).unwrap()
    }

    fn get_test_trace(service: &str, trace_id: u64, priority: Option<f64>) -> Trace {
        let mut root = Span::new(service, trace_id, 1, 0);
        if let Some(priority) = priority {
            root = root.with_metric(SAMPLING_PRIORITY_METRIC_KEY, priority);
        }
        let child = Span::new(service, trace_id, 2, 1);
        Trace::new(vec![root, child])
    }

    fn deprecated_rate(trace: &Trace) -> Option<f64> {
        trace.spans()[0].get_metric(DEPRECATED_RATE_KEY)
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let configs = [
            PrioritySamplerConfiguration::default().with_rate_sync_period(Duration::ZERO),
            PrioritySamplerConfiguration::default().with_decay_period(Duration::ZERO),
            PrioritySamplerConfiguration::default().with_target_traces_per_second(-1.0),
            PrioritySamplerConfiguration::default().with_extra_sample_rate(f64::NAN),
        ];

        for config in configs {
            let result = PriorityEngine::new(&config, Arc::new(RateByService::new()));
            assert!(
                matches!(result, Err(ConfigurationError::InvalidValue { .. })),
                "config {:?} should be rejected",
                config
            );
        }
    }

    #[test]
    fn invalid_target_tps_update_keeps_applied_rates_in_range() {
        let engine = get_test_priority_engine();
        for i in 0..1000 {
            engine.sample(&mut get_test_trace("service-a", i, Some(0.0)), 0, TEST_ENV);
        }
        engine.sampler().decay();

        engine.update_target_tps(-10.0);
        engine.update_target_tps(f64::NAN);
        assert_eq!(engine.sampler().target_tps(), 10.0);

        // 1000 traces over one 3s tick, read as 1000 / (2 * 3s): a rate of 10 / 166.67.
        let mut trace = get_test_trace("service-a", 1001, Some(1.0));
        assert!(engine.sample(&mut trace, 0, TEST_ENV));
        let rate = deprecated_rate(&trace).unwrap();
        assert!((rate - 0.06).abs() < 1e-9, "rate {}", rate);
    }

    #[test]
    fn empty_trace() {
        let engine = get_test_priority_engine();
        let mut trace = Trace::default();
        assert!(!engine.sample(&mut trace, 0, TEST_ENV));
        assert!(engine.catalog().is_empty());
        assert_eq!(engine.sampler().size(), 0);
    }

    #[test]
    fn root_index_out_of_bounds() {
        let engine = get_test_priority_engine();
        let mut trace = get_test_trace("service-a", 1, Some(1.0));
        assert!(!engine.sample(&mut trace, 5, TEST_ENV));
        assert!(engine.catalog().is_empty());
    }

    #[test]
    fn priority_sample() {
        let test_cases = [
            (None, false),       // no priority
            (Some(-1.0), false), // user drop
            (Some(0.0), false),  // auto drop
            (Some(1.0), true),   // auto keep
            (Some(2.0), true),   // user keep
        ];

        for (idx, (priority, expected_sampled)) in test_cases.iter().copied().enumerate() {
            let engine = get_test_priority_engine();
            let mut trace = get_test_trace("service-a", idx as u64 + 1, priority);
            let sampled = engine.sample(&mut trace, 0, TEST_ENV);
            assert_eq!(
                sampled, expected_sampled,
                "priority {:?} should sample={}",
                priority, expected_sampled
            );
        }
    }

    #[test]
    fn no_opinion_is_not_counted() {
        for priority in [None, Some(-1.0)] {
            let engine = get_test_priority_engine();
            let mut trace = get_test_trace("service-a", 1, priority);
            assert!(!engine.sample(&mut trace, 0, TEST_ENV));
            assert!(engine.catalog().is_empty());
            assert_eq!(engine.sampler().size(), 0);
            assert_eq!(deprecated_rate(&trace), None);
        }
    }

    #[test]
    fn authoritative_priority_is_not_counted() {
        let engine = get_test_priority_engine();
        let mut trace = get_test_trace("service-a", 1, Some(2.0));
        assert!(engine.sample(&mut trace, 0, TEST_ENV));
        assert!(engine.catalog().is_empty());
        assert_eq!(engine.sampler().size(), 0);
        assert_eq!(deprecated_rate(&trace), None);

        engine.sampler().decay();
        let state = engine.get_state();
        assert_eq!(state.in_tps, 0.0);
        assert_eq!(state.out_tps, 0.0);
    }

    #[test]
    fn auto_keep_is_counted_and_annotated() {
        let engine = get_test_priority_engine_with(PrioritySamplerConfiguration::default().with_decay_period(Duration::from_secs(1)));
        let mut trace = get_test_trace("service-a", 1, Some(1.0));
        assert!(engine.sample(&mut trace, 0, TEST_ENV));

        assert_eq!(engine.catalog().len(), 1);
        assert_eq!(engine.sampler().size(), 1);
        assert_eq!(deprecated_rate(&trace), Some(1.0));

        // One count and one sample, read back through a decay tick with a 1s period: 1 / (2 * 1s).
        engine.sampler().decay();
        let state = engine.get_state();
        assert_eq!(state.in_tps, 0.5);
        assert_eq!(state.out_tps, 0.5);
        assert!(trace.spans()[1].get_metric(DEPRECATED_RATE_KEY).is_none());
    }

    #[test]
    fn auto_drop_is_counted_but_not_annotated() {
        let engine = get_test_priority_engine();
        let mut trace = get_test_trace("service-a", 1, Some(0.0));
        assert!(!engine.sample(&mut trace, 0, TEST_ENV));

        assert_eq!(engine.catalog().len(), 1);
        assert_eq!(engine.sampler().size(), 1);
        assert_eq!(deprecated_rate(&trace), None);

        engine.sampler().decay();
        let state = engine.get_state();
        assert!(state.in_tps > 0.0);
        assert_eq!(state.out_tps, 0.0);
    }

    #[test]
    fn signatures_are_per_service_and_env() {
        let engine = get_test_priority_engine();
        for (service, env) in [("a", "prod"), ("a", "staging"), ("b", "prod"), ("a", "prod")] {
            let mut trace = get_test_trace(service, 1, Some(1.0));
            engine.sample(&mut trace, 0, env);
        }
        assert_eq!(engine.catalog().len(), 3);
    }

    #[test]
    fn empty_env_uses_default_env() {
        let engine = get_test_priority_engine_with(PrioritySamplerConfiguration::default().with_default_env("agent-env"));
        let mut trace = get_test_trace("service-a", 1, Some(1.0));
        engine.sample(&mut trace, 0, "");

        let rates = engine.rates_by_service();
        assert!(rates.contains_key(&ServiceSignature::new("service-a", "agent-env")));
    }

    #[test]
    fn injected_catalog() {
        let catalog = ServiceKeyCatalog::new();
        let sig = catalog.register(ServiceSignature::new("service-a", TEST_ENV));
        let engine = get_test_priority_engine().with_catalog(catalog);

        assert_eq!(engine.catalog().register(ServiceSignature::new("service-a", TEST_ENV)), sig);
        assert_eq!(engine.rates_by_service().len(), 2);
    }

    #[test]
    fn sample_trace_finds_root_and_env() {
        let engine = get_test_priority_engine();
        let root = Span::new("service-a", 1, 1, 0)
            .with_meta("env", "prod")
            .with_metric(SAMPLING_PRIORITY_METRIC_KEY, 1.0);
        let child = Span::new("service-b", 1, 2, 1);
        let mut trace = Trace::new(vec![child, root]);

        assert!(engine.sample_trace(&mut trace));
        assert_eq!(trace.spans()[1].get_metric(DEPRECATED_RATE_KEY), Some(1.0));
        assert!(engine
            .rates_by_service()
            .contains_key(&ServiceSignature::new("service-a", "prod")));

        assert!(!engine.sample_trace(&mut Trace::default()));
    }

    #[test]
    fn apply_rate_respects_more_specific_layers() {
        let engine = get_test_priority_engine();
        let sig = engine.catalog().register(ServiceSignature::new("service-a", TEST_ENV));

        for key in [AGENT_RATE_KEY, RULE_RATE_KEY] {
            let mut root = Span::new("service-a", 1, 1, 0).with_metric(key, 0.5);
            for _ in 0..3 {
                engine.apply_rate(&mut root, sig);
                assert_eq!(root.get_metric(DEPRECATED_RATE_KEY), None);
            }
        }

        // An existing deprecated rate is never overwritten.
        let mut root = Span::new("service-a", 1, 1, 0).with_metric(DEPRECATED_RATE_KEY, 0.2);
        engine.apply_rate(&mut root, sig);
        assert_eq!(root.get_metric(DEPRECATED_RATE_KEY), Some(0.2));

        // Non-root spans are never annotated.
        let mut child = Span::new("service-a", 1, 2, 1);
        engine.apply_rate(&mut child, sig);
        assert_eq!(child.get_metric(DEPRECATED_RATE_KEY), None);
    }

    #[test]
    fn applied_rate_rounds_up_above_threshold() {
        let config = PrioritySamplerConfiguration::default()
            .with_target_traces_per_second(10.0)
            .with_decay_period(Duration::from_secs(1));

        // 25 traces per second: raw rate of 0.4, above the 0.3 threshold.
        let engine = get_test_priority_engine_with(config.clone());
        for _ in 0..30 {
            for _ in 0..25 {
                engine.sample(&mut get_test_trace("service-a", 1, Some(0.0)), 0, TEST_ENV);
            }
            engine.sampler().decay();
        }
        let mut trace = get_test_trace("service-a", 1, Some(1.0));
        engine.sample(&mut trace, 0, TEST_ENV);
        assert_eq!(deprecated_rate(&trace), Some(1.0));

        // 50 traces per second: raw rate of 0.2, below the threshold.
        let engine = get_test_priority_engine_with(config);
        for _ in 0..30 {
            for _ in 0..50 {
                engine.sample(&mut get_test_trace("service-a", 1, Some(0.0)), 0, TEST_ENV);
            }
            engine.sampler().decay();
        }
        let mut trace = get_test_trace("service-a", 1, Some(1.0));
        engine.sample(&mut trace, 0, TEST_ENV);
        let rate = deprecated_rate(&trace).unwrap();
        assert!((rate - 0.2).abs() < 1e-6, "rate {}", rate);
    }

    #[test]
    fn rates_by_service_defaults_for_unscored_signatures() {
        let engine = get_test_priority_engine();
        let mut trace = get_test_trace("service-a", 1, Some(1.0));
        engine.sample(&mut trace, 0, TEST_ENV);

        // Registered, but no decay tick has accounted for it yet.
        let rates = engine.rates_by_service();
        let default_rate = engine.sampler().get_default_sample_rate();
        assert_eq!(rates[&ServiceSignature::new("service-a", TEST_ENV)], default_rate);
        assert_eq!(rates[&ServiceSignature::default()], default_rate);
    }

    #[test]
    fn priority_sampler_tps_feedback_loop() {
        struct TestCase {
            target_tps: f64,
            generated_tps: f64,
            service: &'static str,
            expected_tps: f64,
            relative_error: f64,
        }

        let test_cases = [
            TestCase {
                target_tps: 5.0,
                generated_tps: 50.0,
                expected_tps: 5.0,
                relative_error: 0.01,
                service: "bim",
            },
            TestCase {
                target_tps: 3.0,
                generated_tps: 200.0,
                expected_tps: 3.0,
                relative_error: 0.01,
                service: "2",
            },
            TestCase {
                target_tps: 10.0,
                generated_tps: 10.0,
                expected_tps: 10.0,
                relative_error: 0.01,
                service: "4",
            },
            TestCase {
                target_tps: 10.0,
                generated_tps: 3.0,
                expected_tps: 3.0,
                relative_error: 0.01,
                service: "10",
            },
        ];

        let sync_period = Duration::from_secs(3);

        for tc in test_cases {
            let config = PrioritySamplerConfiguration::default().with_target_traces_per_second(tc.target_tps);
            let engine = get_test_priority_engine_with(config);
            let signature = engine.catalog().register(ServiceSignature::new(tc.service, TEST_ENV));
            let expected_rate = tc.expected_tps / tc.generated_tps;

            let traces_per_period = (tc.generated_tps * sync_period.as_secs_f64()) as u64;
            let mut rate = 1.0;
            for period in 0..20u64 {
                for i in 0..traces_per_period {
                    // Clients keep traces according to the latest rate they were given.
                    let keep = (i as f64) < rate * traces_per_period as f64;
                    let priority = if keep { 1.0 } else { 0.0 };
                    let mut trace = get_test_trace(tc.service, period << 32 | i, Some(priority));
                    assert_eq!(engine.sample(&mut trace, 0, TEST_ENV), keep);
                }
                engine.sampler().decay();
                rate = engine.sampler().get_signature_sample_rate(signature);
            }

            // Rates above the threshold are rounded up to 1.0.
            let expected_rate = if expected_rate > 0.3 { 1.0 } else { expected_rate };
            assert!(
                (rate - expected_rate).abs() <= expected_rate * tc.relative_error,
                "rate mismatch for service {}: got {}, want {}",
                tc.service,
                rate,
                expected_rate
            );
        }
    }

    #[test]
    fn concurrent_sampling() {
        const THREADS: u64 = 8;
        const TRACES: u64 = 1_000;

        let engine = get_test_priority_engine();
        std::thread::scope(|s| {
            for thread in 0..THREADS {
                let engine = &engine;
                s.spawn(move || {
                    for i in 0..TRACES {
                        let mut trace = get_test_trace("service-a", thread << 32 | i, Some((i % 2) as f64));
                        engine.sample(&mut trace, 0, TEST_ENV);
                    }
                });
            }
        });

        assert_eq!(engine.catalog().len(), 1);
        engine.sampler().decay();
        let state = engine.get_state();
        let scale = 2.0 * PrioritySamplerConfiguration::default().decay_period().as_secs_f64();
        assert_eq!(state.in_tps, (THREADS * TRACES) as f64 / scale);
        assert_eq!(state.out_tps, (THREADS * TRACES / 2) as f64 / scale);
    }

    #[tokio::test(start_paused = true)]
    async fn run_publishes_rates_until_stopped() {
        let rate_by_service = Arc::new(RateByService::new());
        let engine = Arc::new(
            PriorityEngine::new(&PrioritySamplerConfiguration::default(), Arc::clone(&rate_by_service)).unwrap(),
        );

        let handle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(engine.get_state().state, LifecycleState::Running);
        assert!(rate_by_service.get_all().is_empty());

        for i in 0..10 {
            let mut trace = get_test_trace("service-a", i, Some(1.0));
            assert!(engine.sample(&mut trace, 0, TEST_ENV));
        }

        tokio::time::sleep(Duration::from_millis(3100)).await;
        let published = rate_by_service.get_all();
        assert_eq!(published.version(), 1);
        assert_eq!(published.rates().len(), 2);
        assert_eq!(published.rate_for("service-a", TEST_ENV), Some(1.0));
        assert_eq!(published.rates()[&ServiceSignature::default()], 1.0);

        engine.stop().await;
        assert_eq!(engine.get_state().state, LifecycleState::Stopped);
        handle.await.unwrap();

        // Stopping twice is harmless.
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_run_can_still_be_stopped() {
        let engine = Arc::new(get_test_priority_engine());
        let handle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(engine.get_state().state, LifecycleState::Running);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        let stopped = tokio::time::timeout(Duration::from_secs(60), engine.stop()).await;
        assert!(stopped.is_ok(), "stop should not wait on a dropped run");
        assert_eq!(engine.get_state().state, LifecycleState::Stopped);

        // The engine is single-use: it does not start again.
        engine.run().await;
        assert_eq!(engine.get_state().state, LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_run() {
        let engine = get_test_priority_engine();
        engine.stop().await;
        engine.run().await;
        assert_eq!(engine.get_state().state, LifecycleState::Stopped);
    }
}

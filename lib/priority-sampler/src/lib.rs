//! Adaptive priority sampling for traces.
//!
//! Client libraries tag each trace root with a sampling priority derived from rates the agent recommends per service.
//! [`PriorityEngine`] honors those decisions, estimates the throughput of every `(service, env)` pair with a decaying
//! score, and periodically publishes fresh rates to a shared [`RateByService`] store so that clients converge on the
//! configured target throughput.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod catalog;
pub mod collections;
pub mod config;
pub mod core_sampler;
mod lifecycle;
pub mod priority_sampler;
pub mod rate_by_service;
mod score;
pub mod signature;
mod telemetry;
pub mod trace;

pub use self::catalog::ServiceKeyCatalog;
pub use self::config::{ConfigurationError, ConfigurationLoader, PrioritySamplerConfiguration};
pub use self::core_sampler::{Sampler, SamplerState};
pub use self::lifecycle::LifecycleState;
pub use self::priority_sampler::PriorityEngine;
pub use self::rate_by_service::{RateByService, RatesByService};
pub use self::signature::{ServiceSignature, Signature};
pub use self::trace::{SamplingPriority, Span, Trace};

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;

/// Simulated traffic for a single service.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceTraffic {
    pub service: String,
    pub env: String,
    pub traces_per_second: f64,
}

impl FromStr for ServiceTraffic {
    type Err = String;

    /// Parses `service[@env]=tps`. An empty environment is left to the sampler's default environment.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, tps) = s
            .split_once('=')
            .ok_or_else(|| format!("expected `service[@env]=tps`, got '{}'", s))?;
        let (service, env) = name.split_once('@').unwrap_or((name, ""));

        if service.is_empty() {
            return Err(format!("missing service name in '{}'", s));
        }

        let traces_per_second = tps
            .parse::<f64>()
            .map_err(|e| format!("invalid traces per second '{}': {}", tps, e))?;
        if !traces_per_second.is_finite() || traces_per_second < 0.0 {
            return Err(format!("traces per second must be a non-negative number, got {}", tps));
        }

        Ok(Self {
            service: service.to_string(),
            env: env.to_string(),
            traces_per_second,
        })
    }
}

/// Drives a priority sampler with simulated client traffic and reports how rates converge.
#[derive(Clone, Parser)]
#[command(about)]
pub struct Cli {
    /// Path to a configuration file, in YAML format.
    ///
    /// Settings are read from the `apm_config` section, and can be overridden with `DD_`-prefixed environment variables,
    /// such as `DD_APM_CONFIG__TARGET_TRACES_PER_SECOND`.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Service traffic to simulate, as `service[@env]=tps`.
    ///
    /// Can be repeated.
    #[arg(long = "service", required = true)]
    pub services: Vec<ServiceTraffic>,

    /// How long to run for, in seconds. Runs until interrupted when not set.
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// How often to report the sampler state, in seconds.
    #[arg(long, default_value_t = 5)]
    pub report_interval_secs: u64,

    /// Seed for the client-side keep/drop decisions.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl Cli {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }
}

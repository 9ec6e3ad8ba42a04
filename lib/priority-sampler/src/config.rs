//! Priority sampler configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format as _, Yaml},
    Figment,
};
use serde::Deserialize;
use serde_with::{formats::Flexible, serde_as, DurationSecondsWithFrac};
use snafu::{ensure, ResultExt as _, Snafu};
use tracing::debug;

const fn default_extra_sample_rate() -> f64 {
    1.0
}

const fn default_target_traces_per_second() -> f64 {
    10.0
}

const fn default_rate_threshold_to_1() -> f64 {
    0.3
}

const fn default_rate_sync_period() -> Duration {
    Duration::from_secs(3)
}

fn default_env() -> String {
    "none".to_string()
}

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A required configuration file does not exist.
    #[snafu(display("Configuration file '{}' does not exist.", path.display()))]
    MissingFile {
        /// Path of the missing file.
        path: PathBuf,
    },

    /// Configuration could not be read or deserialized.
    #[snafu(display("Failed to load configuration: {}", source))]
    Load {
        /// Error source.
        source: Box<figment::Error>,
    },

    /// A configuration value is out of its allowed range.
    #[snafu(display("Invalid value for '{}': {}", field, reason))]
    InvalidValue {
        /// Name of the invalid field.
        field: &'static str,

        /// Why the value was rejected.
        reason: String,
    },
}

/// A configuration loader that can pull from various sources.
///
/// Sources added later take precedence over sources added earlier. Values missing from every source fall back to
/// their defaults.
///
/// # Supported sources
///
/// - YAML file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    figment: Figment,
}

impl ConfigurationLoader {
    /// Creates a new `ConfigurationLoader` with no sources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file does not exist, an error will be returned. Parse errors are reported when the configuration is
    /// extracted.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        ensure!(path.is_file(), MissingFile { path });

        self.figment = self.figment.merge(Yaml::file(path));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring it if it does not exist.
    pub fn try_from_yaml<P>(self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if !path.is_file() {
            debug!(file_path = %path.display(), "Unable to read YAML configuration file. Ignoring.");
            return self;
        }

        let figment = self.figment.merge(Yaml::file(path));
        Self { figment }
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix given will have an underscore appended to it if it does not already end with one. Nested keys are
    /// separated by a double underscore: with a prefix of `DD`, `DD_APM_CONFIG__TARGET_TRACES_PER_SECOND` sets
    /// `apm_config.target_traces_per_second`.
    ///
    /// The prefix is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        ensure!(!prefix.is_empty(), EmptyPrefix);

        let prefix = if prefix.ends_with('_') {
            prefix.to_string()
        } else {
            format!("{}_", prefix)
        };

        self.figment = self.figment.merge(Env::prefixed(&prefix).split("__"));
        Ok(self)
    }

    fn extract<'a, T: Deserialize<'a>>(&self) -> Result<T, ConfigurationError> {
        self.figment.extract().map_err(Box::new).context(Load)
    }
}

#[derive(Deserialize)]
struct ApmConfiguration {
    #[serde(default)]
    apm_config: PrioritySamplerConfiguration,
}

/// Priority sampler configuration.
///
/// Read from the `apm_config` section, mirroring the trace agent configuration.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PrioritySamplerConfiguration {
    /// Extra rate multiplied into every computed sample rate. Must be in `(0, 1]`.
    ///
    /// Defaults to 1.0.
    #[serde(default = "default_extra_sample_rate")]
    extra_sample_rate: f64,

    /// Target number of sampled traces per second, per signature. Must be positive.
    ///
    /// Defaults to 10.0.
    #[serde(default = "default_target_traces_per_second")]
    target_traces_per_second: f64,

    /// Computed rates above this threshold are rounded up to 1.0. Must be in `[0, 1]`.
    ///
    /// Defaults to 0.3.
    #[serde(default = "default_rate_threshold_to_1")]
    rate_threshold_to_1: f64,

    /// How often rates by service are published, in seconds.
    ///
    /// Defaults to 3 seconds.
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    #[serde(default = "default_rate_sync_period")]
    rate_sync_period: Duration,

    /// How often scores are decayed, in seconds.
    ///
    /// Defaults to the rate sync period.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64, Flexible>>")]
    #[serde(default)]
    decay_period: Option<Duration>,

    /// Environment used for traces that don't carry one.
    ///
    /// Defaults to "none".
    #[serde(default = "default_env")]
    default_env: String,
}

impl PrioritySamplerConfiguration {
    /// Extracts and validates the configuration from the given loader.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized, or holds out-of-range values, an error is returned.
    pub fn from_loader(loader: &ConfigurationLoader) -> Result<Self, ConfigurationError> {
        let wrapper = loader.extract::<ApmConfiguration>()?;
        wrapper.apm_config.validate()
    }

    /// Sets the extra sample rate.
    pub fn with_extra_sample_rate(mut self, extra_sample_rate: f64) -> Self {
        self.extra_sample_rate = extra_sample_rate;
        self
    }

    /// Sets the target traces per second.
    pub fn with_target_traces_per_second(mut self, target_traces_per_second: f64) -> Self {
        self.target_traces_per_second = target_traces_per_second;
        self
    }

    /// Sets the rate sync period.
    pub fn with_rate_sync_period(mut self, rate_sync_period: Duration) -> Self {
        self.rate_sync_period = rate_sync_period;
        self
    }

    /// Sets the decay period.
    pub fn with_decay_period(mut self, decay_period: Duration) -> Self {
        self.decay_period = Some(decay_period);
        self
    }

    /// Sets the default environment.
    pub fn with_default_env(mut self, default_env: impl Into<String>) -> Self {
        self.default_env = default_env.into();
        self
    }

    /// Validates the configured values.
    ///
    /// # Errors
    ///
    /// If any value is out of its allowed range, an error is returned.
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        ensure!(
            self.extra_sample_rate > 0.0 && self.extra_sample_rate <= 1.0,
            InvalidValue {
                field: "extra_sample_rate",
                reason: format!("{} is not in (0, 1]", self.extra_sample_rate),
            }
        );
        ensure!(
            self.target_traces_per_second.is_finite() && self.target_traces_per_second > 0.0,
            InvalidValue {
                field: "target_traces_per_second",
                reason: format!("{} is not a positive number", self.target_traces_per_second),
            }
        );
        ensure!(
            (0.0..=1.0).contains(&self.rate_threshold_to_1),
            InvalidValue {
                field: "rate_threshold_to_1",
                reason: format!("{} is not in [0, 1]", self.rate_threshold_to_1),
            }
        );
        ensure!(
            !self.rate_sync_period.is_zero(),
            InvalidValue {
                field: "rate_sync_period",
                reason: "must not be zero",
            }
        );
        ensure!(
            !self.decay_period().is_zero(),
            InvalidValue {
                field: "decay_period",
                reason: "must not be zero",
            }
        );
        Ok(self)
    }

    /// Returns the extra sample rate.
    pub const fn extra_sample_rate(&self) -> f64 {
        self.extra_sample_rate
    }

    /// Returns the target traces per second.
    pub const fn target_traces_per_second(&self) -> f64 {
        self.target_traces_per_second
    }

    /// Returns the threshold above which rates are rounded up to 1.0.
    pub const fn rate_threshold_to_1(&self) -> f64 {
        self.rate_threshold_to_1
    }

    /// Returns how often rates by service are published.
    pub const fn rate_sync_period(&self) -> Duration {
        self.rate_sync_period
    }

    /// Returns how often scores are decayed.
    pub fn decay_period(&self) -> Duration {
        self.decay_period.unwrap_or(self.rate_sync_period)
    }

    /// Returns the environment used for traces that don't carry one.
    pub fn default_env(&self) -> &str {
        &self.default_env
    }
}

impl Default for PrioritySamplerConfiguration {
    fn default() -> Self {
        Self {
            extra_sample_rate: default_extra_sample_rate(),
            target_traces_per_second: default_target_traces_per_second(),
            rate_threshold_to_1: default_rate_threshold_to_1(),
            rate_sync_period: default_rate_sync_period(),
            decay_period: None,
            default_env: default_env(),
        }
    }
}

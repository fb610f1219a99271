//! Configuration management for the job limiter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::gate::DEFAULT_RESCHEDULE_MULTIPLIER;
use crate::key::DEFAULT_NAMESPACE;
use crate::store::MEMORY_BACKEND;

/// Main configuration for the job limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Prefix of every lock key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Lock store backend name
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Upper bound on a single lock store call, in milliseconds (0 disables)
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Margin applied to the throttle duration when rescheduling
    #[serde(default = "default_reschedule_multiplier")]
    pub reschedule_multiplier: f64,

    /// What to do when a lock cannot be released before a job performs
    #[serde(default)]
    pub on_release_error: ReleaseErrorPolicy,

    /// Per job class policies
    #[serde(default)]
    pub jobs: BTreeMap<String, JobPolicyConfig>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            backend: default_backend(),
            store_timeout_ms: default_store_timeout_ms(),
            reschedule_multiplier: default_reschedule_multiplier(),
            on_release_error: ReleaseErrorPolicy::default(),
            jobs: BTreeMap::new(),
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_backend() -> String {
    MEMORY_BACKEND.to_string()
}

fn default_store_timeout_ms() -> u64 {
    1000
}

fn default_reschedule_multiplier() -> f64 {
    DEFAULT_RESCHEDULE_MULTIPLIER
}

/// Handling of a failed lock release right before a job performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseErrorPolicy {
    /// Surface the error and do not run the job body
    #[default]
    Abort,
    /// Log the error and act on the decision anyway
    Proceed,
}

/// Limiter policy of one job class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPolicyConfig {
    /// Collapse identical pending submissions
    #[serde(default)]
    pub dedup: Option<DedupConfig>,

    /// Bound execution rate per resource
    #[serde(default)]
    pub throttle: Option<ThrottleConfig>,
}

/// Dedup gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Lifetime of a pending lock that is never cleared
    pub expiration_secs: u64,
}

impl DedupConfig {
    /// Lock lifetime as a duration.
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }
}

/// Throttle gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Throttle window and lock lifetime
    pub duration_secs: u64,

    /// Argument positions identifying the throttled resource
    #[serde(default = "default_resource_arguments")]
    pub resource_arguments: Vec<usize>,
}

impl ThrottleConfig {
    /// Throttle window as a duration.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

fn default_resource_arguments() -> Vec<usize> {
    vec![0]
}

impl LimiterConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse limiter config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Store call timeout, if enabled.
    pub fn store_timeout(&self) -> Option<Duration> {
        (self.store_timeout_ms > 0).then(|| Duration::from_millis(self.store_timeout_ms))
    }

    /// Reject settings that would break the gate protocols.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(LimiterError::Config("namespace must not be empty".to_string()));
        }

        if !(self.reschedule_multiplier.is_finite() && self.reschedule_multiplier > 1.0) {
            return Err(LimiterError::Config(format!(
                "reschedule_multiplier must be greater than 1.0, got {}",
                self.reschedule_multiplier
            )));
        }

        for (job_class, policy) in &self.jobs {
            if let Some(dedup) = &policy.dedup {
                if dedup.expiration_secs == 0 {
                    return Err(LimiterError::Config(format!(
                        "{}: dedup expiration_secs must be positive",
                        job_class
                    )));
                }
            }

            if let Some(throttle) = &policy.throttle {
                if throttle.duration_secs == 0 {
                    return Err(LimiterError::Config(format!(
                        "{}: throttle duration_secs must be positive",
                        job_class
                    )));
                }
                if throttle.resource_arguments.is_empty() {
                    return Err(LimiterError::Config(format!(
                        "{}: throttle resource_arguments must not be empty",
                        job_class
                    )));
                }
            }
        }

        Ok(())
    }
}

//! Configuration loading for the projector.
//!
//! Layered config: defaults -> config file -> env vars (`PROJECTOR__*`) -> CLI flags.
//! Nested keys use `__` in env vars, e.g. `PROJECTOR__WORKER__BATCH_SIZE=50`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::app::scheduler::{SchedulerConfig, SelectionMode};
use crate::domain::{BackoffPolicy, RetryPolicy};
use crate::error::ProjectorError;

/// Worker loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Delay between ticks.
    pub interval_ms: u64,

    /// Max tasks selected per tick.
    pub batch_size: usize,

    /// Bound on each external index call.
    pub call_timeout_ms: u64,

    /// Set to run in claim mode alongside other workers sharing the database.
    pub claim_owner: Option<String>,

    pub claim_lease_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            batch_size: 100,
            call_timeout_ms: 5000,
            claim_owner: None,
            claim_lease_secs: 60,
        }
    }
}

/// Retry/backoff settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retry: u32,
    pub cap_secs: u64,
    pub max_exponent: u32,
    pub saturate_at: u32,
    pub error_max_chars: usize,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retry: 8,
            cap_secs: 120,
            max_exponent: 6,
            saturate_at: 8,
            error_max_chars: 2000,
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// SQLite file holding the task queue and dead letters
    pub db_path: String,

    /// Log level (trace, debug, info, warn, error) or a full EnvFilter directive
    pub log_level: String,

    pub worker: WorkerSettings,
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: "projector.db".to_string(),
            log_level: "info".to_string(),
            worker: WorkerSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (optional; required when a path is given)
    /// 3. Environment variables (PROJECTOR__*)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ProjectorError> {
        Self::load_with_env(config_path, None)
    }

    /// Like [`Settings::load`], reading env vars from `env` instead of the process
    /// environment when given.
    pub fn load_with_env(
        config_path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ProjectorError> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("PROJECTOR")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let settings: Settings = builder
            .build()
            .map_err(|e| ProjectorError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ProjectorError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ProjectorError> {
        if self.worker.call_timeout_ms == 0 {
            return Err(ProjectorError::Config("worker.call_timeout_ms must be > 0".into()));
        }
        if self.retry.max_retry == 0 {
            return Err(ProjectorError::Config("retry.max_retry must be > 0".into()));
        }
        if self.retry.cap_secs == 0 {
            return Err(ProjectorError::Config("retry.cap_secs must be > 0".into()));
        }
        if self.retry.error_max_chars == 0 {
            return Err(ProjectorError::Config("retry.error_max_chars must be > 0".into()));
        }
        self.scheduler_config().validate(self.call_timeout())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let mode = match &self.worker.claim_owner {
            Some(owner) => SelectionMode::Claim {
                owner: owner.clone(),
                lease: Duration::from_secs(self.worker.claim_lease_secs),
            },
            None => SelectionMode::Exclusive,
        };
        SchedulerConfig {
            interval: Duration::from_millis(self.worker.interval_ms),
            batch_size: self.worker.batch_size,
            mode,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                max_exponent: self.retry.max_exponent,
                cap: Duration::from_secs(self.retry.cap_secs),
                saturate_at: self.retry.saturate_at,
            },
            max_retry: self.retry.max_retry,
            error_max_chars: self.retry.error_max_chars,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.worker.call_timeout_ms)
    }
}

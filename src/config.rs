// src/config.rs
use crate::data_model::PipelineStep;
use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level orchestrator settings, read from YAML.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub quotas: QuotaSettings,
    #[serde(default)]
    pub review: ReviewSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.timeouts.validate()?;
        self.idempotency.validate()?;
        self.quotas.validate()?;
        self.review.validate()?;
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RetrySettings {
    /// Default retry budget for new jobs.
    pub default_max_retries: u32,
    /// Base of the exponential backoff between retry attempts.
    pub backoff_base_secs: u64,
    /// Upper bound on the computed backoff delay.
    pub backoff_cap_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            default_max_retries: 3,
            backoff_base_secs: 2,
            backoff_cap_secs: 300,
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> Result<()> {
        if self.backoff_base_secs == 0 {
            return Err(PipelineError::ConfigValidationError(
                "RetrySettings: backoff_base_secs must be greater than 0".to_string(),
            ));
        }
        if self.backoff_cap_secs < self.backoff_base_secs {
            return Err(PipelineError::ConfigValidationError(format!(
                "RetrySettings: backoff_cap_secs ({}) cannot be less than backoff_base_secs ({})",
                self.backoff_cap_secs, self.backoff_base_secs
            )));
        }
        Ok(())
    }

    /// Exponential backoff with jitter for attempt `retry_count` (0-based).
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        use rand::Rng;
        let exp = self
            .backoff_base_secs
            .saturating_mul(1u64 << retry_count.min(16));
        let capped = exp.min(self.backoff_cap_secs);
        let jitter_ms = rand::thread_rng().gen_range(0..=250);
        Duration::from_secs(capped) + Duration::from_millis(jitter_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct TimeoutSettings {
    /// Workers must heartbeat at least this often; a beat missed by more than
    /// one interval trips the heartbeat watchdog.
    pub heartbeat_interval_secs: u64,
    /// Execution ceiling for steps without a specific override.
    pub default_execution_timeout_secs: u64,
    /// Per-step execution ceilings.
    #[serde(default)]
    pub step_execution_timeout_secs: HashMap<PipelineStep, u64>,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        TimeoutSettings {
            heartbeat_interval_secs: 15,
            default_execution_timeout_secs: 300,
            step_execution_timeout_secs: HashMap::new(),
        }
    }
}

impl TimeoutSettings {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(PipelineError::ConfigValidationError(
                "TimeoutSettings: heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.default_execution_timeout_secs == 0 {
            return Err(PipelineError::ConfigValidationError(
                "TimeoutSettings: default_execution_timeout_secs must be greater than 0"
                    .to_string(),
            ));
        }
        for (step, secs) in &self.step_execution_timeout_secs {
            if *secs == 0 {
                return Err(PipelineError::ConfigValidationError(format!(
                    "TimeoutSettings: execution timeout for step '{}' must be greater than 0",
                    step
                )));
            }
        }
        Ok(())
    }

    pub fn execution_timeout(&self, step: PipelineStep) -> Duration {
        let secs = self
            .step_execution_timeout_secs
            .get(&step)
            .copied()
            .unwrap_or(self.default_execution_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct IdempotencySettings {
    /// How long a committed record keeps serving cached responses.
    pub ttl_secs: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        IdempotencySettings { ttl_secs: 86_400 }
    }
}

impl IdempotencySettings {
    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(PipelineError::ConfigValidationError(
                "IdempotencySettings: ttl_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

/// Per-organization limits; `overrides` replaces the defaults wholesale for
/// the named org.
#[derive(Deserialize, Debug, Clone)]
pub struct QuotaSettings {
    pub default_limits: QuotaLimits,
    #[serde(default)]
    pub overrides: HashMap<String, QuotaLimits>,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        QuotaSettings {
            default_limits: QuotaLimits::default(),
            overrides: HashMap::new(),
        }
    }
}

impl QuotaSettings {
    pub fn validate(&self) -> Result<()> {
        self.default_limits.validate("default_limits")?;
        for (org, limits) in &self.overrides {
            limits.validate(org)?;
        }
        Ok(())
    }

    pub fn limits_for(&self, org_id: &str) -> &QuotaLimits {
        self.overrides.get(org_id).unwrap_or(&self.default_limits)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct QuotaLimits {
    pub processing_monthly: i64,
    pub storage_total_bytes: i64,
    pub concurrent_jobs: i64,
    pub file_count_total: i64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        QuotaLimits {
            processing_monthly: 1_000,
            storage_total_bytes: 10 * 1024 * 1024 * 1024,
            concurrent_jobs: 25,
            file_count_total: 10_000,
        }
    }
}

impl QuotaLimits {
    pub fn validate(&self, scope: &str) -> Result<()> {
        for (name, value) in [
            ("processing_monthly", self.processing_monthly),
            ("storage_total_bytes", self.storage_total_bytes),
            ("concurrent_jobs", self.concurrent_jobs),
            ("file_count_total", self.file_count_total),
        ] {
            if value <= 0 {
                return Err(PipelineError::ConfigValidationError(format!(
                    "QuotaLimits ({}): {} must be greater than 0, got {}",
                    scope, name, value
                )));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ReviewSettings {
    /// Scores below this, overall or per area, flag the document for review.
    pub threshold: f64,
    pub high_priority_below: f64,
    pub medium_priority_below: f64,
    /// Known-area weight table; renormalized over the areas present.
    #[serde(default = "ReviewSettings::default_weights")]
    pub weights: HashMap<String, f64>,
}

impl ReviewSettings {
    fn default_weights() -> HashMap<String, f64> {
        HashMap::from([
            ("textExtraction".to_string(), 0.30),
            ("structureExtraction".to_string(), 0.25),
            ("readingOrder".to_string(), 0.20),
            ("altTextGeneration".to_string(), 0.15),
            ("tableStructure".to_string(), 0.10),
        ])
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("threshold", self.threshold),
            ("high_priority_below", self.high_priority_below),
            ("medium_priority_below", self.medium_priority_below),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::ConfigValidationError(format!(
                    "ReviewSettings: {} must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
        }
        if self.high_priority_below > self.medium_priority_below {
            return Err(PipelineError::ConfigValidationError(format!(
                "ReviewSettings: high_priority_below ({}) cannot be greater than medium_priority_below ({})",
                self.high_priority_below, self.medium_priority_below
            )));
        }
        if self.weights.is_empty() {
            return Err(PipelineError::ConfigValidationError(
                "ReviewSettings: weights cannot be empty".to_string(),
            ));
        }
        for (area, weight) in &self.weights {
            if *weight <= 0.0 {
                return Err(PipelineError::ConfigValidationError(format!(
                    "ReviewSettings: weight for area '{}' must be greater than 0.0, got {}",
                    area, weight
                )));
            }
        }
        Ok(())
    }
}

impl Default for ReviewSettings {
    fn default() -> Self {
        ReviewSettings {
            threshold: 0.8,
            high_priority_below: 0.6,
            medium_priority_below: 0.7,
            weights: Self::default_weights(),
        }
    }
}

/// Loads and validates the orchestrator settings YAML file.
pub fn load_settings<P: AsRef<Path>>(config_path: P) -> Result<Settings> {
    let path_ref = config_path.as_ref();
    let content = fs::read_to_string(path_ref).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to read settings file '{}': {}",
            path_ref.display(),
            e
        ))
    })?;

    let settings: Settings = serde_yaml::from_str(&content).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to parse settings YAML from '{}': {}",
            path_ref.display(),
            e
        ))
    })?;

    settings.validate()?;

    Ok(settings)
}

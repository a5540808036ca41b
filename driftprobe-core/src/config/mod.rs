//! Configuration types for profiling runs.
//!
//! - `ProfilingOptions`: per-environment sampling, timeouts and parallelism
//! - `ConnectionConfig`: database pool settings
//! - `EnvironmentConfig` / `ProviderConfig`: which environments take part
//! - `CaptureOptions`: the whole run, including consensus and validation
//!
//! # Security
//! Connection URLs are redacted whenever a configuration is displayed.

mod connection;
mod environment;
mod profiling;

pub use connection::ConnectionConfig;
pub use environment::{EnvironmentConfig, ProviderConfig};
pub use profiling::{NamingOverride, ProfilingOptions, RetryPolicy};

use serde::{Deserialize, Serialize};

/// Consensus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Fraction of environments (0.0-1.0) that must be individually safe
    pub threshold: f64,
    /// Treat evidence read from a sample as not safe
    pub require_full_scan: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: 1.0,
            require_full_scan: false,
        }
    }
}

impl ConsensusConfig {
    /// Sets the consensus threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Validates the threshold range.
    ///
    /// # Errors
    /// Returns a configuration error when the threshold is outside 0.0-1.0
    pub fn validate(&self) -> crate::Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(crate::error::DriftProbeError::configuration(format!(
                "consensus threshold must be between 0.0 and 1.0, got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Cross-environment validation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Minimum spread in observed null counts worth reporting
    pub null_variance_abs_threshold: u64,
    /// Minimum spread in observed null ratios worth reporting
    pub null_variance_rel_threshold: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            null_variance_abs_threshold: 10,
            null_variance_rel_threshold: 0.01,
        }
    }
}

/// Options for a multi-environment capture run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    pub profiling: ProfilingOptions,
    /// Environments captured at once; defaults to available parallelism
    pub max_parallel_environments: Option<usize>,
    pub consensus: ConsensusConfig,
    pub validation: ValidationConfig,
}

impl CaptureOptions {
    /// Creates options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the profiling options.
    pub fn with_profiling(mut self, profiling: ProfilingOptions) -> Self {
        self.profiling = profiling;
        self
    }

    /// Sets the consensus threshold.
    pub fn with_consensus_threshold(mut self, threshold: f64) -> Self {
        self.consensus.threshold = threshold;
        self
    }

    /// Caps how many environments are captured concurrently.
    pub fn with_max_parallel_environments(mut self, max: usize) -> Self {
        self.max_parallel_environments = Some(max.max(1));
        self
    }

    /// Concurrency actually used for `environment_count` environments.
    pub fn effective_parallelism(&self, environment_count: usize) -> usize {
        let requested = self.max_parallel_environments.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        });
        requested.clamp(1, environment_count.max(1))
    }

    /// Validates all nested options.
    ///
    /// # Errors
    /// Returns the first configuration error found
    pub fn validate(&self) -> crate::Result<()> {
        self.profiling.validate()?;
        self.consensus.validate()?;
        if self.max_parallel_environments == Some(0) {
            return Err(crate::error::DriftProbeError::configuration(
                "max_parallel_environments must be greater than 0",
            ));
        }
        if self.validation.null_variance_rel_threshold < 0.0 {
            return Err(crate::error::DriftProbeError::configuration(
                "null_variance_rel_threshold cannot be negative",
            ));
        }
        Ok(())
    }
}

//! Single-environment profiling options.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded retry with exponential backoff for whole-batch metadata loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(5);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

/// Maps a logical entity to a physical table when names do not line up.
///
/// Used to resolve relationship targets, scoped to the target's module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingOverride {
    pub module: String,
    pub entity: String,
    pub schema: String,
    pub table: String,
}

/// Options for profiling one environment.
///
/// # Example
/// ```rust
/// use driftprobe_core::config::ProfilingOptions;
///
/// let options = ProfilingOptions::new()
///     .with_sampling(100_000, 10_000)
///     .with_max_parallel_tables(4)
///     .with_lenient(true);
///
/// assert!(options.validate().is_ok());
/// assert!(options.should_sample(1_000_000));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingOptions {
    /// Tables with more rows than this are sampled
    pub sampling_threshold: u64,
    /// Rows scanned when sampling
    pub sample_size: u64,
    /// Offending row identifiers fetched per column or relationship
    pub evidence_sample_size: u32,
    /// Client-side limit for one probe, in seconds
    pub command_timeout_secs: u64,
    /// Deadline for all probes of one table, in seconds
    pub table_timeout_secs: u64,
    /// Tables profiled concurrently
    pub max_parallel_tables: usize,
    /// Tolerate tables and columns missing from the catalog
    pub lenient: bool,
    /// Tables per metadata query
    pub metadata_batch_size: usize,
    pub retry: RetryPolicy,
    pub naming_overrides: Vec<NamingOverride>,
}

impl Default for ProfilingOptions {
    fn default() -> Self {
        Self {
            sampling_threshold: 100_000,
            sample_size: 10_000,
            evidence_sample_size: 10,
            command_timeout_secs: 30,
            table_timeout_secs: 300,
            max_parallel_tables: 1,
            lenient: false,
            metadata_batch_size: 50,
            retry: RetryPolicy::default(),
            naming_overrides: Vec::new(),
        }
    }
}

impl ProfilingOptions {
    /// Creates options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates option ranges.
    ///
    /// # Errors
    /// Returns a configuration error naming the first invalid field
    pub fn validate(&self) -> crate::Result<()> {
        use crate::error::DriftProbeError;

        if self.sample_size == 0 {
            return Err(DriftProbeError::configuration(
                "sample_size must be greater than 0",
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(DriftProbeError::configuration(
                "command_timeout_secs must be greater than 0",
            ));
        }
        if self.table_timeout_secs == 0 {
            return Err(DriftProbeError::configuration(
                "table_timeout_secs must be greater than 0",
            ));
        }
        if self.max_parallel_tables == 0 {
            return Err(DriftProbeError::configuration(
                "max_parallel_tables must be greater than 0",
            ));
        }
        if self.metadata_batch_size == 0 {
            return Err(DriftProbeError::configuration(
                "metadata_batch_size must be greater than 0",
            ));
        }
        if self.evidence_sample_size > 1_000 {
            return Err(DriftProbeError::configuration(
                "evidence_sample_size should not exceed 1000",
            ));
        }
        Ok(())
    }

    /// True when a table of `row_count` rows is probed through a sample.
    pub fn should_sample(&self, row_count: u64) -> bool {
        row_count > self.sampling_threshold
    }

    /// Row cap for a table of `row_count` rows.
    pub fn sample_cap(&self, row_count: u64) -> Option<u64> {
        self.should_sample(row_count).then_some(self.sample_size)
    }

    /// Per-probe timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Per-table deadline.
    pub fn table_timeout(&self) -> Duration {
        Duration::from_secs(self.table_timeout_secs)
    }

    /// Sets the sampling threshold and sample size.
    pub fn with_sampling(mut self, threshold: u64, sample_size: u64) -> Self {
        self.sampling_threshold = threshold;
        self.sample_size = sample_size;
        self
    }

    /// Sets the per-probe timeout.
    pub fn with_command_timeout_secs(mut self, secs: u64) -> Self {
        self.command_timeout_secs = secs;
        self
    }

    /// Sets the per-table deadline.
    pub fn with_table_timeout_secs(mut self, secs: u64) -> Self {
        self.table_timeout_secs = secs;
        self
    }

    /// Sets how many tables are profiled at once.
    pub fn with_max_parallel_tables(mut self, max: usize) -> Self {
        if max == 0 {
            tracing::warn!("max_parallel_tables of 0 raised to 1");
        }
        self.max_parallel_tables = max.max(1);
        self
    }

    /// Enables or disables lenient mode.
    pub fn with_lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    /// Sets the metadata batch size.
    pub fn with_metadata_batch_size(mut self, size: usize) -> Self {
        self.metadata_batch_size = size.max(1);
        self
    }

    /// Sets the evidence sample size.
    pub fn with_evidence_sample_size(mut self, size: u32) -> Self {
        self.evidence_sample_size = size;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Adds a naming override.
    pub fn add_naming_override(mut self, naming: NamingOverride) -> Self {
        self.naming_overrides.push(naming);
        self
    }
}

//! Database connection configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection pool settings for one SQL environment.
///
/// # Security
/// This struct never stores credentials. The connection URL lives on the
/// provider configuration and is redacted whenever it is displayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum number of pooled connections
    pub max_connections: u32,
    /// Seconds to wait when acquiring or opening a connection
    pub connect_timeout_secs: u64,
    /// Server-side statement timeout applied to every session, in seconds
    pub statement_timeout_secs: Option<u64>,
    /// Application name reported to the server
    pub application_name: String,
    /// Force read-only sessions
    pub read_only: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            connect_timeout_secs: 30,
            statement_timeout_secs: None,
            application_name: "driftprobe".to_string(),
            read_only: true,
        }
    }
}

impl ConnectionConfig {
    /// Creates a connection config with safe defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates connection configuration parameters.
    ///
    /// # Errors
    /// Returns error if configuration values are invalid or unsafe
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_connections == 0 {
            return Err(crate::error::DriftProbeError::configuration(
                "max_connections must be greater than 0",
            ));
        }

        if self.max_connections > 100 {
            return Err(crate::error::DriftProbeError::configuration(
                "max_connections should not exceed 100 for safety",
            ));
        }

        if self.connect_timeout_secs == 0 {
            return Err(crate::error::DriftProbeError::configuration(
                "connect_timeout_secs must be greater than 0",
            ));
        }

        if self.statement_timeout_secs == Some(0) {
            return Err(crate::error::DriftProbeError::configuration(
                "statement_timeout_secs must be greater than 0 when set",
            ));
        }

        if !self.read_only {
            return Err(crate::error::DriftProbeError::configuration(
                "profiling sessions must be read-only",
            ));
        }

        Ok(())
    }

    /// Settings a profiling run actually connects with.
    ///
    /// An unset statement timeout inherits the per-probe command timeout.
    ///
    /// # Errors
    /// Returns a configuration error when the pool holds fewer connections
    /// than `max_parallel_tables` workers
    pub fn for_profiling(&self, options: &super::ProfilingOptions) -> crate::Result<Self> {
        let connections = usize::try_from(self.max_connections).unwrap_or(usize::MAX);
        if options.max_parallel_tables > connections {
            return Err(crate::error::DriftProbeError::configuration(format!(
                "max_parallel_tables ({}) exceeds max_connections ({}); every table worker needs its own connection",
                options.max_parallel_tables, self.max_connections
            )));
        }
        let mut config = self.clone();
        if config.statement_timeout_secs.is_none() {
            config.statement_timeout_secs = Some(options.command_timeout_secs);
        }
        Ok(config)
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Builder method to set the pool size.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Builder method to set the server-side statement timeout.
    pub fn with_statement_timeout_secs(mut self, secs: u64) -> Self {
        self.statement_timeout_secs = Some(secs);
        self
    }

    /// Builder method to set the connect timeout.
    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }
}

//! Probe policy.
//!
//! Runs one data probe inside a table's cancellation scope and classifies
//! the result. Degraded probes return their conservative fallback instead of
//! failing the table:
//!
//! | Result                               | Value    | Outcome           |
//! |--------------------------------------|----------|-------------------|
//! | completed                            | observed | `Succeeded`       |
//! | per-table deadline fired             | fallback | `Cancelled`       |
//! | command timeout (driver or policy)   | fallback | `FallbackTimeout` |
//! | caller or sibling cancellation       | error    |                   |
//! | any other error                      | error    |                   |

use crate::cancellation::TableScope;
use crate::error::DriftProbeError;
use crate::models::{ProbeOutcome, ProbeStatus};
use crate::Result;
use std::future::Future;
use std::time::Duration;

/// A probe value with the status describing how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Probed<T> {
    pub value: T,
    pub status: ProbeStatus,
}

impl<T> Probed<T> {
    /// True when the value is the conservative fallback.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self.status.outcome,
            ProbeOutcome::FallbackTimeout | ProbeOutcome::Cancelled
        )
    }
}

/// Executes probes for one table.
#[derive(Debug)]
pub struct ProbePolicy<'a> {
    scope: &'a TableScope,
    command_timeout: Duration,
}

impl<'a> ProbePolicy<'a> {
    /// Creates a policy bound to one table scope.
    pub fn new(scope: &'a TableScope, command_timeout: Duration) -> Self {
        Self {
            scope,
            command_timeout,
        }
    }

    /// Runs `probe` and classifies its outcome.
    ///
    /// # Arguments
    /// * `name` - Probe description for logs and errors
    /// * `sample_size` - Row cap applied by the probe, recorded in the status
    /// * `fallback` - Conservative value used when the probe degrades
    /// * `probe` - The database read
    ///
    /// # Errors
    /// Returns a cancellation error when the enclosing scope is cancelled,
    /// and propagates every probe error other than a command timeout.
    pub async fn run<T, Fut>(
        &self,
        name: &str,
        sample_size: Option<u64>,
        fallback: T,
        probe: Fut,
    ) -> Result<Probed<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        if self.scope.upstream().is_cancelled() {
            return Err(DriftProbeError::cancelled(format!("{} not started", name)));
        }
        if self.scope.deadline_fired() {
            return Ok(self.degrade(name, fallback, ProbeOutcome::Cancelled, sample_size));
        }

        tokio::select! {
            biased;
            () = self.scope.upstream().cancelled() => {
                Err(DriftProbeError::cancelled(format!("{} interrupted", name)))
            }
            () = self.scope.token().cancelled() => {
                Ok(self.degrade(name, fallback, ProbeOutcome::Cancelled, sample_size))
            }
            result = tokio::time::timeout(self.command_timeout, probe) => match result {
                Ok(Ok(value)) => Ok(Probed {
                    value,
                    status: ProbeStatus::succeeded(sample_size),
                }),
                Ok(Err(e)) if e.is_command_timeout() => {
                    tracing::debug!(probe = name, error = %e, "Driver reported command timeout");
                    Ok(self.degrade(name, fallback, ProbeOutcome::FallbackTimeout, sample_size))
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Ok(self.degrade(name, fallback, ProbeOutcome::FallbackTimeout, sample_size)),
            },
        }
    }

    fn degrade<T>(
        &self,
        name: &str,
        fallback: T,
        outcome: ProbeOutcome,
        sample_size: Option<u64>,
    ) -> Probed<T> {
        tracing::warn!(
            probe = name,
            outcome = %outcome,
            "Probe degraded to conservative fallback"
        );
        Probed {
            value: fallback,
            status: ProbeStatus::new(outcome, sample_size),
        }
    }
}

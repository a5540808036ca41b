//! Profiling event recorder.
//!
//! An optional, write-only sink for profiling metadata (what was loaded,
//! skipped, degraded or ambiguous). Components receive an explicit handle;
//! there is no global sink. Implementations must tolerate concurrent calls.

use crate::error::DriftProbeError;
use crate::models::ProbeOutcome;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared recorder handle.
pub type SharedRecorder = Arc<dyn ProfilingRecorder>;

/// One profiling event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProfilingEvent {
    EnvironmentStarted {
        environment: String,
        provider: String,
    },
    MetadataLoaded {
        environment: String,
        tables: usize,
        batches: usize,
    },
    TableSkipped {
        environment: String,
        table: String,
    },
    TableProfiled {
        environment: String,
        table: String,
        duration_ms: u64,
        sample_size: Option<u64>,
    },
    ProbeDegraded {
        environment: String,
        table: String,
        probe: String,
        outcome: ProbeOutcome,
    },
    RelationshipAmbiguous {
        environment: String,
        relationship: String,
    },
    EnvironmentCompleted {
        environment: String,
        duration_ms: u64,
    },
    EnvironmentFailed {
        environment: String,
        code: String,
        message: String,
    },
}

/// A recorded event with its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ProfilingEvent,
}

/// Append-only sink for [`ProfilingEvent`]s.
pub trait ProfilingRecorder: Send + Sync {
    /// Records one event. Must not fail the caller.
    fn record(&self, event: ProfilingEvent);
}

/// Records into a no-op when no recorder is configured.
pub(crate) fn record(recorder: Option<&SharedRecorder>, event: impl FnOnce() -> ProfilingEvent) {
    if let Some(recorder) = recorder {
        recorder.record(event());
    }
}

/// Keeps events in memory; useful for tests and summaries.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ProfilingRecorder for MemoryRecorder {
    fn record(&self, event: ProfilingEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                at: Utc::now(),
                event,
            });
        }
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonLinesRecorder {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesRecorder {
    /// Creates (or truncates) the log file.
    ///
    /// # Errors
    /// Returns an I/O error when the file cannot be created
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| DriftProbeError::Io {
            context: format!("Failed to create metadata log {}", path.display()),
            source: e,
        })?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Flushes buffered lines.
    ///
    /// # Errors
    /// Returns an I/O error when flushing fails
    pub fn flush(&self) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| DriftProbeError::configuration("metadata log lock poisoned"))?;
        writer.flush().map_err(|e| DriftProbeError::Io {
            context: "Failed to flush metadata log".to_string(),
            source: e,
        })
    }
}

impl ProfilingRecorder for JsonLinesRecorder {
    fn record(&self, event: ProfilingEvent) {
        let entry = RecordedEvent {
            at: Utc::now(),
            event,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize profiling event");
                return;
            }
        };
        match self.writer.lock() {
            Ok(mut writer) => {
                if let Err(e) = writeln!(writer, "{}", line) {
                    tracing::warn!(error = %e, "Failed to write profiling event");
                }
            }
            Err(_) => tracing::warn!("Metadata log lock poisoned, dropping event"),
        }
    }
}

impl Drop for JsonLinesRecorder {
    fn drop(&mut self) {
        if let Ok(writer) = self.writer.get_mut() {
            let _ = writer.flush();
        }
    }
}

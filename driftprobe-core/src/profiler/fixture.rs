//! Snapshot loader for deterministic runs without a database.

use super::SnapshotCapture;
use crate::error::DriftProbeError;
use crate::model::LogicalModel;
use crate::models::ProfileSnapshot;
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Reads a previously captured [`ProfileSnapshot`] from a JSON file.
#[derive(Debug, Clone)]
pub struct FixtureCapture {
    path: PathBuf,
}

impl FixtureCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotCapture for FixtureCapture {
    fn kind(&self) -> &'static str {
        "fixture"
    }

    async fn capture(
        &self,
        _model: &LogicalModel,
        cancel: &CancellationToken,
    ) -> Result<ProfileSnapshot> {
        if cancel.is_cancelled() {
            return Err(DriftProbeError::cancelled(format!(
                "fixture {} not loaded",
                self.path.display()
            )));
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| DriftProbeError::Io {
                context: format!("Failed to read snapshot fixture {}", self.path.display()),
                source: e,
            })?;
        let loaded: ProfileSnapshot =
            serde_json::from_str(&content).map_err(|e| DriftProbeError::Serialization {
                context: format!("Failed to parse snapshot fixture {}", self.path.display()),
                source: e,
            })?;

        // normalize ordering so fixtures written by hand compare equal
        Ok(ProfileSnapshot::new(
            loaded.columns,
            loaded.unique_candidates,
            loaded.composite_unique_candidates,
            loaded.foreign_keys,
            loaded.catalog_tables,
        ))
    }
}

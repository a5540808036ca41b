//! Logical model sources.

use super::LogicalModel;
use crate::error::DriftProbeError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Supplies the logical model for a run.
#[async_trait]
pub trait LogicalModelProvider: Send + Sync {
    /// Loads and validates the model.
    ///
    /// # Errors
    /// Returns an error when the model cannot be read or is malformed
    async fn load(&self) -> crate::Result<LogicalModel>;
}

#[async_trait]
impl LogicalModelProvider for LogicalModel {
    async fn load(&self) -> crate::Result<LogicalModel> {
        self.validate()?;
        Ok(self.clone())
    }
}

/// Reads the logical model from a JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonModelProvider {
    path: PathBuf,
}

impl JsonModelProvider {
    /// Creates a provider reading `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path this provider reads.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogicalModelProvider for JsonModelProvider {
    async fn load(&self) -> crate::Result<LogicalModel> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| DriftProbeError::Io {
                context: format!("Failed to read model {}", self.path.display()),
                source: e,
            })?;

        let model: LogicalModel =
            serde_json::from_str(&content).map_err(|e| DriftProbeError::Serialization {
                context: format!("Failed to parse model {}", self.path.display()),
                source: e,
            })?;

        model.validate()?;
        tracing::debug!(
            path = %self.path.display(),
            modules = model.modules.len(),
            "Loaded logical model"
        );
        Ok(model)
    }
}

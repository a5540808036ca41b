//! Run definition files.
//!
//! A run file names the logical model, the environments to capture and the
//! capture options:
//!
//! ```json
//! {
//!   "model": "model.json",
//!   "environments": [
//!     {"name": "dev", "is_primary": true,
//!      "provider": {"type": "sql", "url": "sqlite:///data/dev.db"}},
//!     {"name": "prod",
//!      "provider": {"type": "fixture", "snapshot_path": "prod.snapshot.json"}}
//!   ],
//!   "options": {"profiling": {"lenient": true}}
//! }
//! ```
//!
//! Relative model and fixture paths resolve against the run file's
//! directory.

use anyhow::{Context, bail};
use driftprobe_core::{CaptureOptions, EnvironmentConfig, ProviderConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Parsed run definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFile {
    /// Logical model JSON file
    pub model: PathBuf,
    pub environments: Vec<EnvironmentConfig>,
    #[serde(default)]
    pub options: CaptureOptions,
}

impl RunFile {
    /// Reads and parses a run file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or names no
    /// environments
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run file {}", path.display()))?;
        let mut run: RunFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run file {}", path.display()))?;
        if run.environments.is_empty() {
            bail!("Run file {} defines no environments", path.display());
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        run.resolve_paths(base);
        Ok(run)
    }

    fn resolve_paths(&mut self, base: &Path) {
        self.model = resolve(base, &self.model);
        for environment in &mut self.environments {
            if let ProviderConfig::Fixture { snapshot_path } = &mut environment.provider {
                *snapshot_path = resolve(base, snapshot_path);
            }
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_resolve_against_run_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{
                "model": "model.json",
                "environments": [
                    {"name": "dev", "is_primary": true,
                     "provider": {"type": "fixture", "snapshot_path": "snapshots/dev.json"}},
                    {"name": "prod",
                     "provider": {"type": "sql", "url": "sqlite:///var/data/prod.db"}}
                ],
                "options": {"profiling": {"lenient": true}}
            }"#,
        )
        .expect("write run file");

        let run = RunFile::load(&path).expect("run file loads");
        assert_eq!(run.model, dir.path().join("model.json"));
        assert_eq!(
            run.environments[0].provider,
            ProviderConfig::Fixture {
                snapshot_path: dir.path().join("snapshots/dev.json")
            }
        );
        assert!(run.options.profiling.lenient);
        assert_eq!(run.options.consensus.threshold, 1.0);
    }

    #[test]
    fn test_empty_environment_list_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"model": "model.json", "environments": []}"#)
            .expect("write run file");

        let err = RunFile::load(&path).expect_err("no environments");
        assert!(err.to_string().contains("defines no environments"));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = RunFile::load(Path::new("/nonexistent/run.json")).expect_err("missing");
        assert!(format!("{:#}", err).contains("/nonexistent/run.json"));
    }
}

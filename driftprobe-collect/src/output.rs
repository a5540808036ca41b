//! File output for capture reports.
//!
//! Reports are written as pretty JSON, optionally Zstandard-compressed.

use anyhow::Context;
use driftprobe_core::CaptureReport;
use std::path::{Path, PathBuf};

/// Output path actually written: `.zst` is appended when compressing.
pub fn output_path(requested: &Path, compress: bool) -> PathBuf {
    let has_zst = requested
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zst"));
    if compress && !has_zst {
        let mut name = requested.as_os_str().to_owned();
        name.push(".zst");
        PathBuf::from(name)
    } else {
        requested.to_path_buf()
    }
}

/// Serializes and writes a report.
///
/// # Errors
/// Returns an error when serialization, compression or the write fails, or
/// when compression is requested without the `compression` feature
pub async fn save_report(report: &CaptureReport, path: &Path, compress: bool) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    let bytes = if compress {
        compress_json(&json)?
    } else {
        json.into_bytes()
    };

    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    tracing::info!(path = %path.display(), compressed = compress, "Report written");
    Ok(())
}

/// Reads a report written by [`save_report`].
///
/// # Errors
/// Returns an error when the file cannot be read, decompressed or parsed
pub async fn load_report(path: &Path) -> anyhow::Result<CaptureReport> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read report {}", path.display()))?;
    let compressed = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zst"));
    let json = if compressed {
        decompress_json(&bytes)?
    } else {
        bytes
    };
    serde_json::from_slice(&json)
        .with_context(|| format!("Failed to parse report {}", path.display()))
}

#[cfg(feature = "compression")]
fn compress_json(json: &str) -> anyhow::Result<Vec<u8>> {
    zstd::encode_all(json.as_bytes(), 3).context("Compression failed")
}

#[cfg(not(feature = "compression"))]
fn compress_json(_json: &str) -> anyhow::Result<Vec<u8>> {
    anyhow::bail!("Compression not available. Compile with --features compression")
}

#[cfg(feature = "compression")]
fn decompress_json(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    zstd::decode_all(bytes).context("Decompression failed")
}

#[cfg(not(feature = "compression"))]
fn decompress_json(_bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    anyhow::bail!("Compressed reports need the compression feature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_appends_zst_once() {
        assert_eq!(
            output_path(Path::new("report.json"), true),
            PathBuf::from("report.json.zst")
        );
        assert_eq!(
            output_path(Path::new("report.json.zst"), true),
            PathBuf::from("report.json.zst")
        );
        assert_eq!(
            output_path(Path::new("report.json"), false),
            PathBuf::from("report.json")
        );
    }
}

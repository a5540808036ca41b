//! Core engine for DriftProbe.
//!
//! DriftProbe decides which schema constraints (NOT NULL, UNIQUE, FOREIGN
//! KEY) can be tightened without breaking on real data, across several
//! database environments that share one logical model.
//!
//! # Guarantees
//! - Every statement issued against a target database is a read
//! - Connection strings are redacted in errors and logs
//! - A slow probe degrades to a conservative fallback instead of failing
//!   the run, and the merged view is never safer than the least-safe
//!   environment
//!
//! # Architecture
//! - [`planner`] builds one immutable plan per table from the model and the
//!   catalog
//! - [`executor`] runs the plan's probes through the [`probe`] policy
//! - [`profiler`] captures one environment; [`orchestrator`] runs several
//!   with fail-fast sibling cancellation and [`merge`]s the snapshots
//! - [`consensus`] scores every candidate constraint per environment and
//!   reports drift findings
//! - [`capture::capture`] ties the pipeline together

pub mod cancellation;
pub mod capture;
pub mod catalog;
pub mod config;
pub mod consensus;
pub mod error;
pub mod executor;
pub mod logging;
pub mod merge;
pub mod model;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod probe;
pub mod profiler;
pub mod recorder;
pub mod retry;

pub use capture::{CaptureReport, capture, capture_with};
pub use catalog::{CatalogQueryService, ProbeSession, create_catalog};
pub use config::{
    CaptureOptions, ConnectionConfig, ConsensusConfig, EnvironmentConfig, ProfilingOptions,
    ProviderConfig, RetryPolicy, ValidationConfig,
};
pub use consensus::{
    ConsensusAnalyzer, ConsensusReport, ConstraintConsensusResult, ConstraintKind, Severity,
    ValidationIssue,
};
pub use error::{DriftProbeError, ErrorCode, Result};
pub use model::{JsonModelProvider, LogicalModel, LogicalModelProvider};
pub use models::{
    ColumnProfile, ForeignKeyReality, ProbeOutcome, ProbeStatus, ProfileSnapshot,
    ProfilingEnvironmentSnapshot, TableId, TableNameMapping,
};
pub use orchestrator::{EnvironmentCapture, MultiEnvironmentOrchestrator};
pub use profiler::{EnvironmentProfiler, FixtureCapture, SnapshotCapture, create_capture};
pub use recorder::{JsonLinesRecorder, MemoryRecorder, ProfilingRecorder, SharedRecorder};

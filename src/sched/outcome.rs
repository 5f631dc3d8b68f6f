// src/sched/outcome.rs

//! Build outcomes returned by the external package builder.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::Result;

/// Resource usage of one build, as reported by the builder
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu_secs: f64,
    pub peak_mem_bytes: u64,
}

/// Why a build ended up in the `failed` state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildFailure {
    /// The build could not proceed because internal dependencies were missing;
    /// the scheduler records these for the next cycle
    MissingDependencies { deps: Vec<String> },
    /// Any other build error
    Error { message: String },
}

/// The terminal state of one build
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Successful,
    /// Built into the staging store, not yet published
    Staged,
    Skipped(String),
    Failed(BuildFailure),
}

impl OutcomeKind {
    /// Stable name used in logs and the run database
    pub fn name(&self) -> &'static str {
        match self {
            OutcomeKind::Successful => "successful",
            OutcomeKind::Staged => "staged",
            OutcomeKind::Skipped(_) => "skipped",
            OutcomeKind::Failed(_) => "failed",
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self, OutcomeKind::Successful | OutcomeKind::Staged)
    }
}

/// Result of one package build
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub kind: OutcomeKind,
    /// Version of the built package, when the builder knows it
    pub version: Option<String>,
    /// Wall-clock seconds spent building
    pub elapsed: f64,
    pub rusage: Option<ResourceUsage>,
}

impl BuildOutcome {
    pub fn new(kind: OutcomeKind, elapsed: f64) -> Self {
        Self {
            kind,
            version: None,
            elapsed,
            rusage: None,
        }
    }
}

/// Everything the builder needs to build one package
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub pkgbase: String,
    /// Worker slot id; the builder may key a per-worker sandbox on it
    pub worker_slot: u32,
    /// Where successful artifacts are published
    pub destdir: PathBuf,
    /// `src:dst` mount strings, already expanded and ordered
    pub bindmounts: Vec<String>,
    pub envvars: HashMap<String, String>,
    /// Per-package log file for this cycle
    pub log_path: PathBuf,
}

/// The external package builder. Building happens in a sandbox owned by the
/// implementation; the scheduler only consumes the structured result.
///
/// Implementations block for the duration of the build and must be callable
/// from multiple worker threads at once.
pub trait PackageBuilder: Send + Sync {
    fn build(&self, request: &BuildRequest) -> Result<BuildOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_names() {
        assert_eq!(OutcomeKind::Successful.name(), "successful");
        assert_eq!(OutcomeKind::Staged.name(), "staged");
        assert_eq!(OutcomeKind::Skipped("no change".into()).name(), "skipped");
        assert_eq!(
            OutcomeKind::Failed(BuildFailure::Error { message: "boom".into() }).name(),
            "failed"
        );
    }

    #[test]
    fn test_is_built() {
        assert!(OutcomeKind::Successful.is_built());
        assert!(OutcomeKind::Staged.is_built());
        assert!(!OutcomeKind::Skipped("x".into()).is_built());
        assert!(!OutcomeKind::Failed(BuildFailure::MissingDependencies { deps: vec![] }).is_built());
    }
}

// src/sched/mod.rs

//! The build-scheduling kernel.
//!
//! One cycle flows through this module: the collector classifies packages with
//! build reasons, the graph materializes the relevant dependency subgraph, the
//! sorter surfaces ready packages in priority order, and the driver feeds a
//! bounded worker pool, absorbing partial failure as results come back.

pub mod collector;
pub mod driver;
pub mod graph;
pub mod outcome;
pub mod pool;
pub mod reason;
pub mod sorter;

pub use collector::collect_reasons;
pub use driver::{Driver, DriverConfig};
pub use graph::build_dep_graph;
pub use outcome::{
    BuildFailure, BuildOutcome, BuildRequest, OutcomeKind, PackageBuilder, ResourceUsage,
};
pub use reason::{build_priority, BuildReason, NvItem, LOWEST_PRIORITY};
pub use sorter::BuildSorter;

use std::collections::{HashMap, HashSet};

use crate::nvchecker::VersionChange;

/// In-memory state of one cycle.
///
/// Reasons, upstream data and the dependency map are fully populated before
/// the worker pool starts; `failed` and `built` are written only by the driver
/// thread as results are handled.
#[derive(Debug, Default)]
pub struct Cycle {
    /// Build reasons per package, append-only within the cycle
    pub build_reasons: HashMap<String, Vec<BuildReason>>,

    /// Upstream check results for packages with any changed source
    pub nvdata: HashMap<String, Vec<VersionChange>>,

    /// Dependency subgraph the sorter runs on: package -> its internal deps
    pub depmap: HashMap<String, HashSet<String>>,

    /// Packages that failed this cycle, with the missing deps (may be empty)
    pub failed: HashMap<String, Vec<String>>,

    /// Packages built (successful or staged) this cycle
    pub built: HashSet<String>,
}

impl Cycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reason; a package is in the cycle iff it has at least one
    pub fn add_reason(&mut self, pkgbase: &str, reason: BuildReason) {
        let list = self.build_reasons.entry(pkgbase.to_string()).or_default();
        if !list.contains(&reason) {
            list.push(reason);
        }
    }

    pub fn is_reasoned(&self, pkgbase: &str) -> bool {
        self.build_reasons.contains_key(pkgbase)
    }

    /// Record a failure; `built` and `failed` stay disjoint
    pub fn mark_failed(&mut self, pkgbase: &str, missing: Vec<String>) {
        debug_assert!(!self.built.contains(pkgbase));
        let entry = self.failed.entry(pkgbase.to_string()).or_default();
        if !missing.is_empty() {
            *entry = missing;
        }
    }

    /// Record a build; `built` and `failed` stay disjoint
    pub fn mark_built(&mut self, pkgbase: &str) {
        debug_assert!(!self.failed.contains_key(pkgbase));
        self.built.insert(pkgbase.to_string());
    }

    /// The newest upstream version reported for a package this cycle
    pub fn new_version_of(&self, pkgbase: &str) -> Option<String> {
        self.nvdata
            .get(pkgbase)
            .and_then(|changes| changes.last())
            .map(|change| change.new.clone())
    }

    /// Reasons serialized for the run database
    pub fn reasons_json(&self, pkgbase: &str) -> String {
        self.build_reasons
            .get(pkgbase)
            .and_then(|reasons| serde_json::to_string(reasons).ok())
            .unwrap_or_else(|| "[]".to_string())
    }
}

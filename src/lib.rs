// src/lib.rs

//! Banquet: automated batch build scheduler for a rolling-release package
//! repository.
//!
//! Given a checkout of package recipes, banquet decides which packages need
//! rebuilding (commit-range changes, upstream version bumps, prior failures,
//! command-line requests), orders them along the intra-repo dependency DAG
//! with priority tie-breaking, drives a bounded worker pool that invokes the
//! external package builder, and persists per-cycle state so the next run is
//! incremental.
//!
//! # Architecture
//!
//! - Reasons first: a package builds iff it carries at least one build reason
//! - Live sorting: a Kahn-style sorter surfaces ready packages as their
//!   dependencies complete, sorted by build priority
//! - Partial failure: individual build failures never abort a cycle; failed
//!   subgraphs are remembered and retried when their inputs change
//! - Durable state: last processed commit and missing-dependency memory live
//!   in an atomically-written store under a process-wide lock

pub mod builder;
pub mod config;
pub mod cycle;
pub mod db;
mod error;
pub mod git;
pub mod logs;
pub mod notify;
pub mod nvchecker;
pub mod recipe;
pub mod sched;
pub mod state;

pub use builder::CommandBuilder;
pub use config::{load_config, Config};
pub use cycle::{run_cycle, Collaborators, CycleOutcome};
pub use db::{BuildLogDb, RunRecord, SqliteDb};
pub use error::{Error, Result};
pub use git::{GitCli, Vcs};
pub use notify::{LogNotifier, Notifier};
pub use nvchecker::{CommandChecker, UpstreamChecker, UpstreamReport, VersionChange};
pub use recipe::{Catalog, Dependency, Recipe, RecipeLoader, Resolver, TomlRecipeLoader};
pub use sched::{
    BuildFailure, BuildOutcome, BuildReason, BuildRequest, Cycle, OutcomeKind, PackageBuilder,
    ResourceUsage,
};
pub use state::{CycleStore, FailedRecord, LockFile};

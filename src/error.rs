// src/error.rs

//! Central error type for the banquet library.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the scheduler and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("another instance holds the lock at {0}")]
    LockHeld(PathBuf),

    #[error("refusing to run on branch {0:?} (expected master or main)")]
    WrongBranch(String),

    #[error("command {command:?} failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("circular dependency among: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("recipe for {pkgbase} failed to load: {detail}")]
    RecipeLoad { pkgbase: String, detail: String },

    #[error("upstream check failed: {0}")]
    UpstreamCheck(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

// src/builder.rs

//! Subprocess-backed package builder.
//!
//! The actual sandboxed build is an external program; this shim invokes it
//! per package and maps its exit status onto a structured outcome:
//!
//! | exit | outcome |
//! |---|---|
//! | 0 | successful |
//! | 2 | staged |
//! | 3 | skipped, reason on the last log line |
//! | 4 | failed with missing dependencies, names on the last log line |
//! | other | failed |
//!
//! The worker slot, destination directory and bind mounts are exported via
//! `BANQUET_*` environment variables so the builder can pick a sandbox.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sched::outcome::{
    BuildFailure, BuildOutcome, BuildRequest, OutcomeKind, PackageBuilder,
};

/// Builder that execs a configured command in the package's directory
pub struct CommandBuilder {
    command: Vec<String>,
    repodir: PathBuf,
}

impl CommandBuilder {
    pub fn new(command: Vec<String>, repodir: PathBuf) -> Self {
        Self { command, repodir }
    }
}

impl PackageBuilder for CommandBuilder {
    fn build(&self, request: &BuildRequest) -> Result<BuildOutcome> {
        let program = self.command.first().ok_or_else(|| {
            Error::Config("build command must not be empty".to_string())
        })?;

        let log = File::create(&request.log_path)?;
        let start = Instant::now();

        debug!(
            "{}: running {} on worker slot {}",
            request.pkgbase, program, request.worker_slot
        );
        let status = Command::new(program)
            .args(&self.command[1..])
            .arg(&request.pkgbase)
            .current_dir(self.repodir.join(&request.pkgbase))
            .envs(&request.envvars)
            .env("BANQUET_WORKER_SLOT", request.worker_slot.to_string())
            .env("BANQUET_DESTDIR", &request.destdir)
            .env("BANQUET_BINDMOUNTS", request.bindmounts.join("\n"))
            .stdout(log.try_clone()?)
            .stderr(log)
            .status()?;

        let elapsed = start.elapsed().as_secs_f64();
        let kind = match status.code() {
            Some(0) => OutcomeKind::Successful,
            Some(2) => OutcomeKind::Staged,
            Some(3) => OutcomeKind::Skipped(
                last_log_line(&request.log_path).unwrap_or_else(|| "skipped".to_string()),
            ),
            Some(4) => {
                let deps = last_log_line(&request.log_path)
                    .map(|line| {
                        line.split_whitespace().map(str::to_string).collect()
                    })
                    .unwrap_or_default();
                OutcomeKind::Failed(BuildFailure::MissingDependencies { deps })
            }
            code => OutcomeKind::Failed(BuildFailure::Error {
                message: match code {
                    Some(code) => format!("builder exited with status {}", code),
                    None => "builder killed by signal".to_string(),
                },
            }),
        };

        Ok(BuildOutcome::new(kind, elapsed))
    }
}

fn last_log_line(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut last = None;
    for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
        if !line.trim().is_empty() {
            last = Some(line.trim().to_string());
        }
    }
    last
}

// src/nvchecker.rs

//! Upstream version checking interface.
//!
//! The checker reports, per package, one `(old, new)` tuple per configured
//! source; `take` commits new versions as the baseline so the next cycle sees
//! no change. Execution of the actual checks is external: `CommandChecker`
//! runs a configured command that emits one JSON object per line.

use serde::Deserialize;
use std::collections::HashMap;
use std::process::Command;
use tracing::debug;

use crate::config::NvcheckerConfig;
use crate::error::{Error, Result};

/// One upstream source's version report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionChange {
    /// Index of the source in the recipe's `update_on` list
    pub index: usize,
    /// Source kind, e.g. `"github"` or `"manual"`
    pub source: String,
    /// Previously taken version; `None` for a never-built package
    pub old: Option<String>,
    pub new: String,
}

impl VersionChange {
    /// Whether this tuple represents an actual change
    pub fn is_changed(&self) -> bool {
        self.old.as_deref() != Some(self.new.as_str())
    }
}

/// Result of one upstream check run
#[derive(Debug, Default)]
pub struct UpstreamReport {
    /// Version tuples per package, in source order
    pub versions: HashMap<String, Vec<VersionChange>>,
    /// Packages whose check failed, with the failure message
    pub errors: HashMap<String, String>,
}

/// The upstream version checker
pub trait UpstreamChecker: Send + Sync {
    /// Check the given packages; packages without configured sources are
    /// simply absent from the report
    fn check(&self, pkgs: &[String]) -> Result<UpstreamReport>;

    /// Advance the change-detection baseline for these packages
    fn take(&self, pkgs: &[String]) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct RawLine {
    pkgbase: String,
    #[serde(default)]
    index: usize,
    #[serde(default)]
    source: String,
    #[serde(default)]
    old: Option<String>,
    #[serde(default)]
    new: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Checker that shells out to configured commands
pub struct CommandChecker {
    command: Vec<String>,
    take_command: Vec<String>,
    proxy: Option<String>,
}

impl CommandChecker {
    pub fn new(config: &NvcheckerConfig) -> Self {
        Self {
            command: config.command.clone(),
            take_command: config.take_command.clone(),
            proxy: config.proxy.clone(),
        }
    }

    fn run(&self, argv: &[String], pkgs: &[String]) -> Result<String> {
        let program = argv.first().ok_or_else(|| {
            Error::Config("nvchecker command must not be empty".to_string())
        })?;
        let mut command = Command::new(program);
        command.args(&argv[1..]).args(pkgs);
        if let Some(proxy) = &self.proxy {
            command.env("https_proxy", proxy);
        }
        let output = command.output()?;
        if !output.status.success() {
            return Err(Error::UpstreamCheck(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl UpstreamChecker for CommandChecker {
    fn check(&self, pkgs: &[String]) -> Result<UpstreamReport> {
        if pkgs.is_empty() {
            return Ok(UpstreamReport::default());
        }
        let stdout = self.run(&self.command, pkgs)?;
        let mut report = UpstreamReport::default();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let raw: RawLine = match serde_json::from_str(line) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!("unparsable checker line {:?}: {}", line, e);
                    continue;
                }
            };
            if let Some(error) = raw.error {
                report.errors.insert(raw.pkgbase, error);
            } else if let Some(new) = raw.new {
                report
                    .versions
                    .entry(raw.pkgbase)
                    .or_default()
                    .push(VersionChange {
                        index: raw.index,
                        source: raw.source,
                        old: raw.old,
                        new,
                    });
            }
        }
        Ok(report)
    }

    fn take(&self, pkgs: &[String]) -> Result<()> {
        if pkgs.is_empty() {
            return Ok(());
        }
        self.run(&self.take_command, pkgs)?;
        Ok(())
    }
}

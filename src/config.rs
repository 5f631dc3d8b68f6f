// src/config.rs

//! Startup configuration loaded from `config.toml`.
//!
//! # Example config.toml
//!
//! ```toml
//! [repository]
//! repodir = "/srv/repo/recipes"
//! destdir = "/srv/repo/packages"
//!
//! [banquet]
//! name = "banquet"
//! max_concurrency = 4
//! rebuild_failed_pkgs = false
//! git_push = true
//! dburl = "/var/lib/banquet/runs.db"
//!
//! [envvars]
//! TZ = "UTC"
//!
//! [bindmounts]
//! "~/.cache/sources" = "/build/sources"
//!
//! [nvchecker]
//! proxy = "http://localhost:8118"
//!
//! [misc]
//! prerun = [["./scripts/sync-keys"]]
//! postrun = [["./scripts/publish"]]
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Environment variables injected into builds
    #[serde(default)]
    pub envvars: HashMap<String, String>,

    /// Host path -> sandbox path mounts handed to the builder
    #[serde(default)]
    pub bindmounts: HashMap<String, String>,

    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub banquet: BanquetConfig,

    #[serde(default)]
    pub nvchecker: NvcheckerConfig,

    #[serde(default)]
    pub misc: MiscConfig,
}

/// Repository paths
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    /// Checkout containing one recipe directory per package
    #[serde(default = "default_repodir")]
    pub repodir: PathBuf,

    /// Where successful artifacts are published
    #[serde(default = "default_destdir")]
    pub destdir: PathBuf,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            repodir: default_repodir(),
            destdir: default_destdir(),
        }
    }
}

fn default_repodir() -> PathBuf {
    PathBuf::from(".")
}

fn default_destdir() -> PathBuf {
    PathBuf::from("packages")
}

/// Scheduler behavior
#[derive(Debug, Clone, Deserialize)]
pub struct BanquetConfig {
    /// Maintainer identity attached to notifications
    #[serde(default = "default_name")]
    pub name: String,

    /// Optional build-log database path; absent disables throttling and
    /// known-bad dependency skips
    #[serde(default)]
    pub dburl: Option<String>,

    /// Worker pool size
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    /// Advance upstream bookmarks for every success instead of only for
    /// packages attempted because of an upstream change
    #[serde(default)]
    pub rebuild_failed_pkgs: bool,

    /// Push the repository after a cycle
    #[serde(default)]
    pub git_push: bool,
}

impl Default for BanquetConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            dburl: None,
            max_concurrency: default_concurrency(),
            rebuild_failed_pkgs: false,
            git_push: false,
        }
    }
}

fn default_name() -> String {
    "banquet".to_string()
}

fn default_concurrency() -> usize {
    1
}

/// Upstream checker invocation
#[derive(Debug, Clone, Deserialize)]
pub struct NvcheckerConfig {
    /// Proxy URL exported to the checker process
    #[serde(default)]
    pub proxy: Option<String>,

    /// Command that reports upstream versions as JSON lines
    #[serde(default = "default_check_command")]
    pub command: Vec<String>,

    /// Command that commits new versions as the change-detection baseline
    #[serde(default = "default_take_command")]
    pub take_command: Vec<String>,
}

impl Default for NvcheckerConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            command: default_check_command(),
            take_command: default_take_command(),
        }
    }
}

fn default_check_command() -> Vec<String> {
    vec!["nvchecker-run".to_string()]
}

fn default_take_command() -> Vec<String> {
    vec!["nvtake".to_string()]
}

/// Hooks around the cycle
#[derive(Debug, Clone, Deserialize)]
pub struct MiscConfig {
    /// Commands run before the cycle; each must exit zero
    #[serde(default)]
    pub prerun: Vec<Vec<String>>,

    /// Commands run after cycle state is persisted
    #[serde(default)]
    pub postrun: Vec<Vec<String>>,

    /// Builder invocation; receives the pkgbase as its final argument
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            prerun: Vec::new(),
            postrun: Vec::new(),
            build_command: default_build_command(),
        }
    }
}

fn default_build_command() -> Vec<String> {
    vec!["banquet-build".to_string()]
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let config: Config = toml::from_str(&text)
        .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
    if config.banquet.max_concurrency == 0 {
        return Err(Error::Config(
            "banquet.max_concurrency must be at least 1".into(),
        ));
    }
    Ok(config)
}

impl Config {
    /// Bind mounts expanded and formatted as `src:dst`, sorted descending by
    /// source path so that deeper mounts are applied first.
    pub fn formatted_bindmounts(&self) -> Vec<String> {
        let mut mounts: Vec<(String, &String)> = self
            .bindmounts
            .iter()
            .map(|(src, dst)| (expand_home(src), dst))
            .collect();
        mounts.sort_by(|a, b| b.0.cmp(&a.0));
        mounts
            .into_iter()
            .map(|(src, dst)| format!("{}:{}", src, dst))
            .collect()
    }
}

/// Expand a leading `~` or `$HOME` using the HOME environment variable
fn expand_home(path: &str) -> String {
    let home = match std::env::var("HOME") {
        Ok(h) => h,
        Err(_) => return path.to_string(),
    };
    if let Some(rest) = path.strip_prefix("~/") {
        format!("{}/{}", home, rest)
    } else if path == "~" {
        home
    } else if let Some(rest) = path.strip_prefix("$HOME/") {
        format!("{}/{}", home, rest)
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.banquet.max_concurrency, 1);
        assert!(!config.banquet.rebuild_failed_pkgs);
        assert!(!config.banquet.git_push);
        assert!(config.banquet.dburl.is_none());
        assert!(config.misc.prerun.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [repository]
            repodir = "/srv/recipes"
            destdir = "/srv/packages"

            [banquet]
            name = "repo-bot"
            max_concurrency = 8
            rebuild_failed_pkgs = true
            git_push = true

            [envvars]
            TZ = "UTC"

            [misc]
            prerun = [["true"]]
            "#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.banquet.name, "repo-bot");
        assert_eq!(config.banquet.max_concurrency, 8);
        assert!(config.banquet.git_push);
        assert_eq!(config.envvars.get("TZ").unwrap(), "UTC");
        assert_eq!(config.misc.prerun, vec![vec!["true".to_string()]]);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[banquet]\nmax_concurrency = 0\n").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_bindmounts_sorted_descending() {
        let mut config = Config::default();
        config
            .bindmounts
            .insert("/data".to_string(), "/mnt/data".to_string());
        config
            .bindmounts
            .insert("/data/cache".to_string(), "/mnt/cache".to_string());

        let mounts = config.formatted_bindmounts();
        assert_eq!(
            mounts,
            vec!["/data/cache:/mnt/cache".to_string(), "/data:/mnt/data".to_string()]
        );
    }

    #[test]
    fn test_expand_home() {
        std::env::set_var("HOME", "/home/builder");
        assert_eq!(expand_home("~/cache"), "/home/builder/cache");
        assert_eq!(expand_home("$HOME/cache"), "/home/builder/cache");
        assert_eq!(expand_home("/abs/path"), "/abs/path");
    }
}

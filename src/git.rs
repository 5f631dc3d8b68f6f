// src/git.rs

//! Source-control interface.
//!
//! The scheduler needs a handful of operations on the recipe checkout: sync,
//! commit-range queries and an optional push. `GitCli` shells out to git; the
//! trait exists so tests can substitute an in-memory history.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::recipe::loader::RECIPE_FILE;

/// Source-control operations the cycle driver depends on
pub trait Vcs: Send + Sync {
    /// Name of the currently checked-out branch
    fn branch_name(&self) -> Result<String>;

    /// Current HEAD commit hash
    fn head_commit(&self) -> Result<String>;

    /// Discard local modifications
    fn reset_hard(&self) -> Result<()>;

    /// Bring the checkout up to date, preferring the remote side on conflict
    fn pull_override(&self) -> Result<()>;

    /// Push local commits; pulls and retries once on rejection
    fn push(&self) -> Result<()>;

    /// Packages whose files changed in `from..to`
    fn changed_packages(&self, from: &str, to: &str) -> Result<HashSet<String>>;

    /// Whether the package's release field changed in `from..to`
    fn release_field_changed(&self, from: &str, to: &str, pkgbase: &str) -> Result<bool>;
}

/// Git implementation running the `git` binary in the repository checkout
pub struct GitCli {
    repodir: PathBuf,
}

impl GitCli {
    pub fn new(repodir: PathBuf) -> Self {
        Self { repodir }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        debug!("git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repodir)
            .output()?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: format!("git {}", args.join(" ")),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Vcs for GitCli {
    fn branch_name(&self) -> Result<String> {
        Ok(self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_string())
    }

    fn head_commit(&self) -> Result<String> {
        Ok(self.run(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn reset_hard(&self) -> Result<()> {
        self.run(&["reset", "--hard"])?;
        Ok(())
    }

    fn pull_override(&self) -> Result<()> {
        self.run(&["checkout", "--", "."])?;
        self.run(&["pull", "--no-edit", "-s", "recursive", "-X", "theirs"])?;
        Ok(())
    }

    fn push(&self) -> Result<()> {
        if let Err(e) = self.run(&["push"]) {
            warn!("git push rejected, pulling and retrying: {}", e);
            self.pull_override()?;
            self.run(&["push"])?;
        }
        Ok(())
    }

    fn changed_packages(&self, from: &str, to: &str) -> Result<HashSet<String>> {
        let range = format!("{}..{}", from, to);
        let output = self.run(&["diff", "--name-only", &range])?;
        Ok(packages_from_paths(output.lines()))
    }

    fn release_field_changed(&self, from: &str, to: &str, pkgbase: &str) -> Result<bool> {
        let range = format!("{}..{}", from, to);
        let path = format!("{}/{}", pkgbase, RECIPE_FILE);
        let diff = self.run(&["diff", "-U0", &range, "--", &path])?;
        Ok(diff_touches_release(&diff))
    }
}

/// Derive package names from changed paths: the first component of any path
/// at least two levels deep is a package directory.
fn packages_from_paths<'a>(paths: impl Iterator<Item = &'a str>) -> HashSet<String> {
    let mut packages = HashSet::new();
    for path in paths {
        let mut parts = path.split('/');
        if let (Some(first), Some(_)) = (parts.next(), parts.next()) {
            if !first.is_empty() && !first.starts_with('.') {
                packages.insert(first.to_string());
            }
        }
    }
    packages
}

/// Whether a unified diff adds or removes a `release = ...` line
fn diff_touches_release(diff: &str) -> bool {
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if let Some(body) = line.strip_prefix('+').or_else(|| line.strip_prefix('-')) {
            let body = body.trim_start();
            if body.starts_with("release") {
                let rest = body["release".len()..].trim_start();
                if rest.starts_with('=') {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packages_from_paths() {
        let paths = vec![
            "pkga/recipe.toml",
            "pkga/patches/fix.patch",
            "pkgb/recipe.toml",
            "README.md",
            ".github/workflows/ci.yml",
        ];
        let packages = packages_from_paths(paths.into_iter());
        assert_eq!(packages.len(), 2);
        assert!(packages.contains("pkga"));
        assert!(packages.contains("pkgb"));
    }

    #[test]
    fn test_diff_touches_release() {
        let diff = "\
--- a/pkga/recipe.toml
+++ b/pkga/recipe.toml
@@ -3 +3 @@
-release = 1
+release = 2
";
        assert!(diff_touches_release(diff));

        let unrelated = "\
--- a/pkga/recipe.toml
+++ b/pkga/recipe.toml
@@ -5 +5 @@
-depends = [\"libfoo\"]
+depends = [\"libfoo\", \"libbar\"]
";
        assert!(!diff_touches_release(unrelated));
    }

    #[test]
    fn test_release_mentioned_in_value_is_ignored() {
        let diff = "+comment = \"release notes\"";
        assert!(!diff_touches_release(diff));
    }
}

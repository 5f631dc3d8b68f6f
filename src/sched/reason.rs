// src/sched/reason.rs

//! Build reasons and build priorities.
//!
//! Every package that builds in a cycle carries at least one reason; reasons
//! accumulate and are append-only within a cycle. A package's effective
//! priority is the minimum over its reasons' priorities (lower builds
//! earlier), and `Depended` inherits the depender's priority transitively.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// One changed upstream source: its index in the recipe's source list and the
/// source kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NvItem {
    pub index: usize,
    pub source: String,
}

/// Why a package is being built this cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BuildReason {
    /// The recipe's release field changed in the commit range
    UpdatedPkgrel,
    /// One or more upstream sources reported a new version
    NvChecker { items: Vec<NvItem> },
    /// Promoted into the cycle because `depender` needs it
    Depended { depender: String },
    /// Previously failed and its recipe changed
    UpdatedFailed,
    /// Last attempt failed because these dependencies were missing
    FailedByDeps { deps: Vec<String> },
    /// Named on the command line
    Cmdline,
}

impl fmt::Display for BuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildReason::UpdatedPkgrel => write!(f, "release bumped"),
            BuildReason::NvChecker { items } => {
                let sources: Vec<String> = items
                    .iter()
                    .map(|i| format!("{}#{}", i.source, i.index))
                    .collect();
                write!(f, "upstream updated ({})", sources.join(", "))
            }
            BuildReason::Depended { depender } => write!(f, "depended by {}", depender),
            BuildReason::UpdatedFailed => write!(f, "failed last time, recipe updated"),
            BuildReason::FailedByDeps { deps } => {
                write!(f, "missing dependencies last time: {}", deps.join(", "))
            }
            BuildReason::Cmdline => write!(f, "requested on the command line"),
        }
    }
}

/// The lowest (latest-building) priority; also the fallback for reason cycles
pub const LOWEST_PRIORITY: u8 = 3;

/// Guard against pathological `Depended` chains on malformed graphs
const MAX_RECURSION: usize = 64;

/// Effective build priority of a package: minimum over its reasons.
///
/// `Depended` recurses into the depender's reasons, yielding the transitive
/// minimum. Recursion is memoized and depth-limited; a reason cycle resolves
/// to [`LOWEST_PRIORITY`].
pub fn build_priority(pkg: &str, reasons: &HashMap<String, Vec<BuildReason>>) -> u8 {
    let mut memo = HashMap::new();
    package_priority(pkg, reasons, &mut memo, 0)
}

fn package_priority(
    pkg: &str,
    reasons: &HashMap<String, Vec<BuildReason>>,
    memo: &mut HashMap<String, u8>,
    depth: usize,
) -> u8 {
    if depth > MAX_RECURSION {
        return LOWEST_PRIORITY;
    }
    if let Some(p) = memo.get(pkg) {
        return *p;
    }
    // placeholder entry breaks Depended cycles
    memo.insert(pkg.to_string(), LOWEST_PRIORITY);

    let priority = match reasons.get(pkg) {
        Some(list) => list
            .iter()
            .map(|r| reason_priority(r, reasons, memo, depth))
            .min()
            .unwrap_or(LOWEST_PRIORITY),
        None => LOWEST_PRIORITY,
    };

    memo.insert(pkg.to_string(), priority);
    priority
}

fn reason_priority(
    reason: &BuildReason,
    reasons: &HashMap<String, Vec<BuildReason>>,
    memo: &mut HashMap<String, u8>,
    depth: usize,
) -> u8 {
    match reason {
        BuildReason::UpdatedPkgrel => 0,
        BuildReason::NvChecker { items } => {
            if items.iter().any(|i| i.source == "manual") {
                0
            } else if items.len() > 1 || items.first().is_some_and(|i| i.index > 0) {
                1
            } else {
                LOWEST_PRIORITY
            }
        }
        BuildReason::Depended { depender } => {
            package_priority(depender, reasons, memo, depth + 1)
        }
        BuildReason::UpdatedFailed => 2,
        BuildReason::FailedByDeps { .. } | BuildReason::Cmdline => LOWEST_PRIORITY,
    }
}

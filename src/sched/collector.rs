// src/sched/collector.rs

//! Reason collection: decide which packages enter the cycle and why.

use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::db::BuildLogDb;
use crate::error::Result;
use crate::git::Vcs;
use crate::notify::Notifier;
use crate::nvchecker::{UpstreamChecker, VersionChange};
use crate::recipe::Catalog;
use crate::sched::reason::{BuildReason, NvItem};
use crate::sched::Cycle;
use crate::state::FailedRecord;

/// Everything the collector reads
pub struct CollectorEnv<'a> {
    pub catalog: &'a Catalog,
    /// `failed_info` persisted by the previous cycle
    pub prev_failed: &'a std::collections::HashMap<String, FailedRecord>,
    /// Last processed commit; `None` on the very first run
    pub last_commit: Option<&'a str>,
    /// Packages named on the command line (empty means: the full managed set)
    pub cmdline: &'a [String],
    /// Packages to run the upstream check for
    pub care_pkgs: &'a [String],
    pub vcs: &'a dyn Vcs,
    pub checker: &'a dyn UpstreamChecker,
    pub db: Option<&'a dyn BuildLogDb>,
    pub notifier: &'a dyn Notifier,
}

/// Populate `build_reasons` and `nvdata` for this cycle
pub fn collect_reasons(cycle: &mut Cycle, env: &CollectorEnv) -> Result<()> {
    let report = env.checker.check(env.care_pkgs)?;
    for (pkgbase, error) in &report.errors {
        env.notifier
            .report(Some(pkgbase), "upstream check failed", error);
    }
    let upstream_unknown: HashSet<&String> = report.errors.keys().collect();

    if !env.cmdline.is_empty() {
        for pkgbase in env.cmdline {
            if env.catalog.contains(pkgbase) {
                cycle.add_reason(pkgbase, BuildReason::Cmdline);
            } else {
                env.notifier.report(
                    Some(pkgbase),
                    "unknown package",
                    "not managed by this repository",
                );
            }
        }
    } else {
        let changed = match env.last_commit {
            Some(last) => {
                let mut changed = env.vcs.changed_packages(last, "HEAD")?;
                changed.retain(|p| env.catalog.contains(p));
                changed
            }
            None => {
                info!("no last commit recorded, skipping commit-range reasons");
                HashSet::new()
            }
        };

        for pkgbase in &changed {
            if env.prev_failed.contains_key(pkgbase) {
                cycle.add_reason(pkgbase, BuildReason::UpdatedFailed);
            }
        }

        if let Some(last) = env.last_commit {
            for pkgbase in &changed {
                if upstream_unknown.contains(pkgbase) {
                    continue;
                }
                if env.vcs.release_field_changed(last, "HEAD", pkgbase)? {
                    cycle.add_reason(pkgbase, BuildReason::UpdatedPkgrel);
                }
            }
        }

        for (pkgbase, record) in env.prev_failed {
            cycle.add_reason(
                pkgbase,
                BuildReason::FailedByDeps {
                    deps: record.missing.clone(),
                },
            );
        }
    }

    collect_upstream_reasons(cycle, env, report.versions)?;

    Ok(())
}

fn collect_upstream_reasons(
    cycle: &mut Cycle,
    env: &CollectorEnv,
    versions: std::collections::HashMap<String, Vec<VersionChange>>,
) -> Result<()> {
    let now = Utc::now();

    for (pkgbase, tuples) in versions {
        let changed: Vec<VersionChange> =
            tuples.into_iter().filter(|t| t.is_changed()).collect();
        if changed.is_empty() {
            continue;
        }

        let recipe = match env.catalog.get(&pkgbase) {
            Some(recipe) => recipe,
            None => continue,
        };

        // Per-source throttling: drop a changed pair while its last success
        // is younger than the configured interval. Without a database every
        // pair survives.
        let mut surviving = Vec::new();
        for change in &changed {
            let throttled = match (recipe.throttle.get(&change.index), env.db) {
                (Some(interval), Some(db)) => match db.last_success_at(&pkgbase)? {
                    Some(t) => {
                        let interval = chrono::Duration::from_std(*interval)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                        t + interval > now
                    }
                    None => false,
                },
                _ => false,
            };
            if throttled {
                debug!(
                    "{}: source {} ({}) throttled",
                    pkgbase, change.index, change.source
                );
            } else {
                surviving.push(NvItem {
                    index: change.index,
                    source: change.source.clone(),
                });
            }
        }

        if !surviving.is_empty() {
            cycle.add_reason(&pkgbase, BuildReason::NvChecker { items: surviving });
        } else {
            warn!("{}: all changed sources throttled", pkgbase);
        }

        cycle.nvdata.insert(pkgbase, changed);
    }

    Ok(())
}

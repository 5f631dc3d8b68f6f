// src/sched/graph.rs

//! Dependency graph construction.
//!
//! Starting from the reasoned packages, materialize the dependency subgraph
//! the sorter runs on. Unresolved managed dependencies are promoted into the
//! cycle with a `Depended` reason; unmanaged ones are collected and reported.

use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

use crate::db::BuildLogDb;
use crate::error::Result;
use crate::notify::Notifier;
use crate::recipe::Catalog;
use crate::sched::reason::BuildReason;
use crate::sched::Cycle;

/// Populate `cycle.depmap` from the reasoned packages, promoting unresolved
/// managed dependencies along the way.
pub fn build_dep_graph(
    cycle: &mut Cycle,
    catalog: &Catalog,
    db: Option<&dyn BuildLogDb>,
    notifier: &dyn Notifier,
) -> Result<()> {
    let mut worklist: VecDeque<String> = {
        let mut seeds: Vec<String> = cycle.build_reasons.keys().cloned().collect();
        seeds.sort();
        seeds.into()
    };
    let mut processed: HashSet<String> = HashSet::new();
    // depender -> dependency names that no repository package provides
    let mut nonexistent: Vec<(String, Vec<String>)> = Vec::new();

    while let Some(pkgbase) = worklist.pop_front() {
        if !processed.insert(pkgbase.clone()) {
            continue;
        }

        let recipe = match catalog.get(&pkgbase) {
            Some(recipe) => recipe,
            None => {
                // stale failure memory can reference packages no longer
                // managed; give them an empty node so the sorter completes
                cycle.depmap.entry(pkgbase.clone()).or_default();
                continue;
            }
        };

        let mut missing_here = Vec::new();
        for dep in &recipe.deps {
            if dep.resolve() {
                continue;
            }
            if !catalog.contains(&dep.pkgbase) {
                missing_here.push(dep.pkgname.clone());
                continue;
            }
            if let Some(db) = db {
                if db.is_last_build_failed(&dep.pkgbase)? {
                    warn!(
                        "{}: not promoting dependency {} whose last build failed",
                        pkgbase, dep.pkgbase
                    );
                    continue;
                }
            }
            debug!("{}: promoting dependency {}", pkgbase, dep.pkgbase);
            cycle.add_reason(
                &dep.pkgbase,
                BuildReason::Depended {
                    depender: pkgbase.clone(),
                },
            );
            worklist.push_back(dep.pkgbase.clone());
        }

        if !missing_here.is_empty() {
            nonexistent.push((pkgbase.clone(), missing_here));
        }

        let internal: HashSet<String> = recipe
            .deps
            .iter()
            .filter(|d| catalog.contains(&d.pkgbase))
            .map(|d| d.pkgbase.clone())
            .collect();
        cycle.depmap.insert(pkgbase, internal);
    }

    nonexistent.sort();
    for (depender, deps) in nonexistent {
        notifier.report(
            Some(&depender),
            "dependencies not managed by this repository",
            &deps.join(", "),
        );
    }

    Ok(())
}

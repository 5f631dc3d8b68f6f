// src/cycle.rs

//! The cycle driver: one end-to-end scheduler invocation.
//!
//! Wires collector, graph, sorter and worker pool together around the
//! source-control sync and the persisted state. Finalization (state save,
//! upstream bookmark advancement, reset, hooks) always runs, also when the
//! scheduling phase errors out or an interrupt arrives.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tracing::{info, warn};

use serde_json::json;

use crate::config::Config;
use crate::db::BuildLogDb;
use crate::error::{Error, Result};
use crate::git::Vcs;
use crate::logs::{BuildLogger, LogDir};
use crate::notify::Notifier;
use crate::nvchecker::UpstreamChecker;
use crate::recipe::{Catalog, RecipeLoader};
use crate::sched::collector::CollectorEnv;
use crate::sched::driver::clear_interrupt;
use crate::sched::reason::BuildReason;
use crate::sched::{build_dep_graph, collect_reasons, Cycle, Driver, DriverConfig, PackageBuilder};
use crate::state::{CycleStore, FailedRecord, LockFile};

/// Persistent state file name under the working directory
pub const STORE_FILE: &str = "store";
/// Lock file name under the working directory
pub const LOCK_FILE: &str = ".lock";

/// The external collaborators one cycle runs against
pub struct Collaborators<'a> {
    pub vcs: &'a dyn Vcs,
    pub checker: &'a dyn UpstreamChecker,
    pub builder: Arc<dyn PackageBuilder>,
    pub loader: &'a dyn RecipeLoader,
    pub notifier: &'a dyn Notifier,
    pub db: Option<&'a dyn BuildLogDb>,
}

/// What one cycle did, for the caller's summary
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub built: Vec<String>,
    pub failed: Vec<String>,
}

/// Run one cycle in `mydir` against the configured repository checkout.
///
/// `cmdline` restricts the cycle to the named packages (and their promoted
/// dependencies); empty means the full managed set. With `redirect_streams`
/// the process' stdout/stderr are pointed at the cycle's main log before any
/// worker starts.
pub fn run_cycle(
    config: &Config,
    mydir: &Path,
    cmdline: &[String],
    redirect_streams: bool,
    workers: &Collaborators,
) -> Result<CycleOutcome> {
    clear_interrupt();

    let _lock = LockFile::acquire(&mydir.join(LOCK_FILE))?;

    let branch = workers.vcs.branch_name()?;
    if branch != "master" && branch != "main" {
        return Err(Error::WrongBranch(branch));
    }

    let logger = BuildLogger::open(mydir)?;
    let logdir = LogDir::create(mydir)?;
    if redirect_streams {
        crate::logs::redirect_std_streams(&logdir.main_log())?;
    }

    let mut store = CycleStore::load(&mydir.join(STORE_FILE))?;
    let repodir = config.repository.repodir.clone();

    logger.event("cycle-start", {
        let mut fields = serde_json::Map::new();
        fields.insert("cmdline".into(), json!(cmdline));
        fields
    });

    let mut cycle = Cycle::new();
    let mut catalog = Catalog::new();

    let run_result = run_scheduling_phase(
        config,
        cmdline,
        &repodir,
        workers,
        &logger,
        &logdir,
        &store,
        &mut cycle,
        &mut catalog,
    );

    // Finalization: everything below runs regardless of the phase result.
    let finalize_result = finalize_cycle(
        config,
        mydir,
        cmdline,
        workers,
        &mut store,
        &cycle,
        &catalog,
    );

    logger.event("cycle-finished", {
        let mut fields = serde_json::Map::new();
        fields.insert("built".into(), json!(cycle.built.len()));
        fields.insert("failed".into(), json!(cycle.failed.len()));
        fields
    });

    run_result?;
    finalize_result?;

    let mut built: Vec<String> = cycle.built.iter().cloned().collect();
    built.sort();
    let mut failed: Vec<String> = cycle.failed.keys().cloned().collect();
    failed.sort();
    Ok(CycleOutcome { built, failed })
}

#[allow(clippy::too_many_arguments)]
fn run_scheduling_phase(
    config: &Config,
    cmdline: &[String],
    repodir: &Path,
    workers: &Collaborators,
    logger: &BuildLogger,
    logdir: &LogDir,
    store: &CycleStore,
    cycle: &mut Cycle,
    catalog: &mut Catalog,
) -> Result<()> {
    run_hooks(&config.misc.prerun, repodir)?;

    workers.vcs.reset_hard()?;
    workers.vcs.pull_override()?;

    let loaded = workers.loader.load(repodir)?;
    *catalog = loaded.catalog;
    for (pkgbase, detail) in &loaded.errors {
        cycle.mark_failed(pkgbase, Vec::new());
        workers
            .notifier
            .report(Some(pkgbase), "recipe failed to load", detail);
    }

    let care_pkgs: Vec<String> = if cmdline.is_empty() {
        catalog.names()
    } else {
        let mut closure: Vec<String> =
            catalog.dependency_closure(cmdline).into_iter().collect();
        closure.sort();
        closure
    };

    collect_reasons(
        cycle,
        &CollectorEnv {
            catalog,
            prev_failed: &store.failed,
            last_commit: store.last_commit.as_deref(),
            cmdline,
            care_pkgs: &care_pkgs,
            vcs: workers.vcs,
            checker: workers.checker,
            db: workers.db,
            notifier: workers.notifier,
        },
    )?;

    build_dep_graph(cycle, catalog, workers.db, workers.notifier)?;

    info!(
        "{} package(s) to consider this cycle",
        cycle.build_reasons.len()
    );

    let driver = Driver::new(
        cycle,
        catalog,
        Arc::clone(&workers.builder),
        workers.db,
        workers.notifier,
        logger,
        logdir,
        DriverConfig {
            max_concurrency: config.banquet.max_concurrency,
            destdir: config.repository.destdir.clone(),
            bindmounts: config.formatted_bindmounts(),
            envvars: config.envvars.clone(),
        },
    )?;
    driver.run()
}

fn finalize_cycle(
    config: &Config,
    mydir: &Path,
    cmdline: &[String],
    workers: &Collaborators,
    store: &mut CycleStore,
    cycle: &Cycle,
    catalog: &Catalog,
) -> Result<()> {
    // the post-cycle HEAD becomes the baseline for the next commit range
    match workers.vcs.head_commit() {
        Ok(head) => store.last_commit = Some(head),
        Err(e) => warn!("cannot record HEAD commit: {}", e),
    }

    for (pkgbase, missing) in &cycle.failed {
        store.failed.insert(
            pkgbase.clone(),
            FailedRecord {
                missing: missing.clone(),
                version: cycle.new_version_of(pkgbase),
            },
        );
    }
    for pkgbase in &cycle.built {
        store.failed.remove(pkgbase);
    }
    if cmdline.is_empty() && !catalog.is_empty() {
        store.failed.retain(|pkgbase, _| catalog.contains(pkgbase));
    }

    let take_list = version_take_list(config, cycle);
    if !take_list.is_empty() {
        info!("advancing upstream bookmarks for: {}", take_list.join(", "));
        if let Err(e) = workers.checker.take(&take_list) {
            warn!("nvtake failed: {}", e);
            workers
                .notifier
                .report(None, "nvtake failed", &e.to_string());
        }
    }

    store.save(&mydir.join(STORE_FILE))?;

    if let Err(e) = workers.vcs.reset_hard() {
        warn!("post-cycle reset failed: {}", e);
    }
    if config.banquet.git_push {
        if let Err(e) = workers.vcs.push() {
            warn!("git push failed: {}", e);
            workers.notifier.report(None, "git push failed", &e.to_string());
        }
    }

    run_hooks(&config.misc.postrun, &config.repository.repodir)?;
    Ok(())
}

/// Which packages get their upstream bookmark advanced this cycle.
///
/// With `rebuild_failed_pkgs` every success advances; otherwise only packages
/// that were reasoned by an upstream change *and* actually attempted
/// (built or failed) do, so an unattempted update is seen again next cycle.
fn version_take_list(config: &Config, cycle: &Cycle) -> Vec<String> {
    let mut list: Vec<String> = if config.banquet.rebuild_failed_pkgs {
        cycle.built.iter().cloned().collect()
    } else {
        cycle
            .build_reasons
            .iter()
            .filter(|(_, reasons)| {
                reasons
                    .iter()
                    .any(|r| matches!(r, BuildReason::NvChecker { .. }))
            })
            .map(|(pkgbase, _)| pkgbase.clone())
            .filter(|pkgbase| {
                cycle.built.contains(pkgbase) || cycle.failed.contains_key(pkgbase)
            })
            .collect()
    };
    list.sort();
    list.dedup();
    list
}

fn run_hooks(hooks: &[Vec<String>], workdir: &Path) -> Result<()> {
    for argv in hooks {
        let program = argv
            .first()
            .ok_or_else(|| Error::Config("empty hook command".to_string()))?;
        let status = Command::new(program)
            .args(&argv[1..])
            .current_dir(workdir)
            .status()?;
        if !status.success() {
            return Err(Error::CommandFailed {
                command: argv.join(" "),
                detail: format!("exit status {:?}", status.code()),
            });
        }
    }
    Ok(())
}

// src/sched/driver.rs

//! The worker-pool driver and result handler.
//!
//! Pulls ready packages from the sorter in priority order, keeps at most
//! `max_concurrency` builds in flight, and interprets results as they come
//! back. Packages that already failed this cycle, or whose only reason is a
//! prior missing-dependency failure that still holds, are completed without
//! dispatch so their dependents can move on.
//!
//! A user interrupt stops new dispatches at the next synchronization point;
//! running builds are waited for, never killed.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{BuildLogDb, RunRecord};
use crate::error::{Error, Result};
use crate::logs::{build_event_fields, BuildLogger, LogDir};
use crate::notify::Notifier;
use crate::recipe::Catalog;
use crate::sched::outcome::{BuildFailure, BuildRequest, OutcomeKind, PackageBuilder};
use crate::sched::pool::{WorkerPool, WorkerReport};
use crate::sched::reason::BuildReason;
use crate::sched::sorter::BuildSorter;
use crate::sched::Cycle;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Request cooperative cancellation; safe to call from a signal handler
pub fn request_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Clear the interrupt flag at the start of a cycle
pub fn clear_interrupt() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Static driver parameters for one cycle
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub max_concurrency: usize,
    pub destdir: PathBuf,
    pub bindmounts: Vec<String>,
    pub envvars: HashMap<String, String>,
}

/// Drives one cycle's builds through the worker pool
pub struct Driver<'a> {
    cycle: &'a mut Cycle,
    catalog: &'a Catalog,
    sorter: BuildSorter,
    pool: WorkerPool,
    db: Option<&'a dyn BuildLogDb>,
    notifier: &'a dyn Notifier,
    logger: &'a BuildLogger,
    logdir: &'a LogDir,
    config: DriverConfig,
    running: HashSet<String>,
}

impl<'a> Driver<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cycle: &'a mut Cycle,
        catalog: &'a Catalog,
        builder: Arc<dyn PackageBuilder>,
        db: Option<&'a dyn BuildLogDb>,
        notifier: &'a dyn Notifier,
        logger: &'a BuildLogger,
        logdir: &'a LogDir,
        config: DriverConfig,
    ) -> Result<Self> {
        let sorter = BuildSorter::new(&cycle.depmap, &cycle.build_reasons)?;
        let pool = WorkerPool::new(config.max_concurrency, builder);
        Ok(Self {
            cycle,
            catalog,
            sorter,
            pool,
            db,
            notifier,
            logger,
            logdir,
            config,
            running: HashSet::new(),
        })
    }

    /// Run until the sorter drains, a scheduling error occurs, or an
    /// interrupt arrives. Individual build failures never abort the loop.
    pub fn run(mut self) -> Result<()> {
        let result = self.run_loop();

        // wait out whatever is still in flight, also on the interrupt path
        while !self.running.is_empty() {
            match self.pool.wait_one() {
                Some(report) => self.handle(report)?,
                None => break,
            }
        }
        self.pool.shutdown();
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            if interrupted() {
                info!("interrupt received, waiting for running builds");
                return Ok(());
            }

            let picked = self.try_pick_some()?;
            for pkgbase in &picked {
                self.submit(pkgbase)?;
            }

            if self.running.is_empty() {
                if picked.is_empty() {
                    return Ok(());
                }
                continue;
            }

            let report = self
                .pool
                .wait_one()
                .ok_or_else(|| Error::Scheduler("worker pool disconnected".into()))?;
            self.handle(report)?;
            while let Some(report) = self.pool.try_wait() {
                self.handle(report)?;
            }
        }
    }

    /// Pick up to `max_concurrency - inflight` ready packages, pruning
    /// entries that must not build.
    fn try_pick_some(&mut self) -> Result<Vec<String>> {
        let limit = self.config.max_concurrency.saturating_sub(self.running.len());
        let mut picked = Vec::new();
        if limit == 0 {
            return Ok(picked);
        }

        loop {
            if !self.sorter.is_active() {
                break;
            }
            let ready = self.sorter.get_ready()?;
            let mut pruned = false;

            for pkgbase in ready {
                if self.running.contains(&pkgbase) || picked.contains(&pkgbase) {
                    continue;
                }

                // a package that failed this cycle is never dispatched;
                // completing it lets dependents surface (they carry their own
                // FailedByDeps history)
                if self.cycle.failed.contains_key(&pkgbase) {
                    self.sorter.done(&pkgbase)?;
                    if let Some(db) = self.db {
                        db.mark_status(&pkgbase, "done")?;
                    }
                    pruned = true;
                    continue;
                }

                if self.still_missing_failed_deps(&pkgbase) {
                    info!("{}: previously missing dependencies still absent, skipping", pkgbase);
                    self.logger
                        .line(&format!("{}: skipped, missing dependencies unchanged", pkgbase));
                    self.sorter.done(&pkgbase)?;
                    if let Some(db) = self.db {
                        db.mark_status(&pkgbase, "done")?;
                    }
                    pruned = true;
                    continue;
                }

                picked.push(pkgbase);
                if picked.len() >= limit {
                    return Ok(picked);
                }
            }

            if !pruned {
                break;
            }
        }

        Ok(picked)
    }

    /// Whether the package's only reasons are prior missing-dependency
    /// failures whose named dependencies still fail to resolve.
    fn still_missing_failed_deps(&self, pkgbase: &str) -> bool {
        let reasons = match self.cycle.build_reasons.get(pkgbase) {
            Some(reasons) if !reasons.is_empty() => reasons,
            _ => return false,
        };
        let mut named: Vec<&String> = Vec::new();
        for reason in reasons {
            match reason {
                BuildReason::FailedByDeps { deps } => named.extend(deps.iter()),
                _ => return false,
            }
        }

        let recipe = match self.catalog.get(pkgbase) {
            Some(recipe) => recipe,
            None => return false,
        };
        let mut any_known = false;
        let mut any_unresolved = false;
        for dep in &recipe.deps {
            if named.iter().any(|n| **n == dep.pkgbase || **n == dep.pkgname) {
                any_known = true;
                if !dep.resolve() {
                    any_unresolved = true;
                }
            }
        }
        any_known && any_unresolved
    }

    fn submit(&mut self, pkgbase: &str) -> Result<()> {
        self.logger.line(&format!(
            "{}: build started (priority {})",
            pkgbase,
            self.sorter.priority_of(pkgbase)
        ));
        if let Some(db) = self.db {
            db.mark_status(pkgbase, "building")?;
        }
        let request = BuildRequest {
            pkgbase: pkgbase.to_string(),
            worker_slot: 0, // assigned by the worker
            destdir: self.config.destdir.clone(),
            bindmounts: self.config.bindmounts.clone(),
            envvars: self.config.envvars.clone(),
            log_path: self.logdir.pkg_log(pkgbase),
        };
        self.pool.submit(request)?;
        self.running.insert(pkgbase.to_string());
        Ok(())
    }

    /// Interpret one build result (structured outcome or builder error)
    fn handle(&mut self, report: WorkerReport) -> Result<()> {
        let pkgbase = report.pkgbase;
        self.running.remove(&pkgbase);

        let nv_version = self.cycle.new_version_of(&pkgbase);
        let mut record = RunRecord {
            pkgbase: pkgbase.clone(),
            outcome: "failed".to_string(),
            nv_version: nv_version.clone(),
            pkg_version: None,
            elapsed: 0.0,
            cpu_secs: None,
            peak_mem_bytes: None,
            reasons: self.cycle.reasons_json(&pkgbase),
            message: None,
        };

        match report.outcome {
            Ok(outcome) => {
                record.outcome = outcome.kind.name().to_string();
                record.pkg_version = outcome.version.clone();
                record.elapsed = outcome.elapsed;
                if let Some(rusage) = &outcome.rusage {
                    record.cpu_secs = Some(rusage.cpu_secs);
                    record.peak_mem_bytes = Some(rusage.peak_mem_bytes as i64);
                }

                let mut fields = build_event_fields(
                    &pkgbase,
                    nv_version.as_deref(),
                    outcome.version.as_deref(),
                    outcome.elapsed,
                );

                match &outcome.kind {
                    OutcomeKind::Successful => {
                        self.cycle.mark_built(&pkgbase);
                        self.logger.line(&format!(
                            "{}: built successfully in {:.1}s",
                            pkgbase, outcome.elapsed
                        ));
                        self.logger.event("build-successful", fields);
                    }
                    OutcomeKind::Staged => {
                        self.cycle.mark_built(&pkgbase);
                        self.logger.line(&format!(
                            "{}: built and staged in {:.1}s",
                            pkgbase, outcome.elapsed
                        ));
                        self.logger.event("build-staged", fields);
                    }
                    OutcomeKind::Skipped(reason) => {
                        record.message = Some(reason.clone());
                        self.logger
                            .line(&format!("{}: skipped: {}", pkgbase, reason));
                        fields.insert("message".into(), json!(reason));
                        self.logger.event("build-skipped", fields);
                    }
                    OutcomeKind::Failed(BuildFailure::MissingDependencies { deps }) => {
                        self.cycle.mark_failed(&pkgbase, deps.clone());
                        self.logger.line(&format!(
                            "{}: failed, missing dependencies: {}",
                            pkgbase,
                            deps.join(", ")
                        ));
                        fields.insert("missing".into(), json!(deps));
                        self.logger.event("build-failed", fields);
                        self.notifier.report(
                            Some(&pkgbase),
                            "build failed: missing dependencies",
                            &self.missing_deps_report(&pkgbase, deps),
                        );
                        record.message = Some(format!("missing: {}", deps.join(", ")));
                    }
                    OutcomeKind::Failed(BuildFailure::Error { message }) => {
                        self.cycle.mark_failed(&pkgbase, Vec::new());
                        self.logger
                            .line(&format!("{}: build failed: {}", pkgbase, message));
                        fields.insert("error".into(), json!(message));
                        self.logger.event("build-failed", fields);
                        self.notifier.report(
                            Some(&pkgbase),
                            "build failed",
                            &format!(
                                "{}\nbuild log: {}",
                                message,
                                self.logdir.pkg_log(&pkgbase).display()
                            ),
                        );
                        record.message = Some(message.clone());
                    }
                }
            }
            Err(e) => {
                // the builder itself blew up; treat as a failed build
                warn!("{}: builder error: {}", pkgbase, e);
                self.cycle.mark_failed(&pkgbase, Vec::new());
                self.logger
                    .line(&format!("{}: builder error: {}", pkgbase, e));
                let mut fields =
                    build_event_fields(&pkgbase, nv_version.as_deref(), None, 0.0);
                fields.insert("error".into(), json!(e.to_string()));
                self.logger.event("build-failed", fields);
                self.notifier.report(
                    Some(&pkgbase),
                    "builder error",
                    &format!(
                        "{}\nbuild log: {}",
                        e,
                        self.logdir.pkg_log(&pkgbase).display()
                    ),
                );
                record.message = Some(e.to_string());
            }
        }

        if let Some(db) = self.db {
            db.append_run(&record)?;
            db.mark_status(&pkgbase, "done")?;
        }
        self.sorter.done(&pkgbase)?;
        Ok(())
    }

    /// Report body distinguishing deps that failed this cycle from deps that
    /// were never attempted.
    fn missing_deps_report(&self, pkgbase: &str, deps: &[String]) -> String {
        let (failed_now, not_attempted): (Vec<&String>, Vec<&String>) = deps
            .iter()
            .partition(|d| self.cycle.failed.contains_key(*d));

        let mut body = format!("{} is missing dependencies:\n", pkgbase);
        if !failed_now.is_empty() {
            body.push_str(&format!(
                "  already failed this cycle: {}\n",
                failed_now.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }
        if !not_attempted.is_empty() {
            body.push_str(&format!(
                "  not yet attempted: {}\n",
                not_attempted.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Dependency, Recipe, Resolver};
    use crate::sched::outcome::BuildOutcome;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    struct FlagResolver(Arc<AtomicBool>);

    impl Resolver for FlagResolver {
        fn resolve(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    /// Builder that records dispatch order and succeeds/fails per a script
    struct ScriptedBuilder {
        order: Mutex<Vec<String>>,
        failures: HashMap<String, BuildFailure>,
    }

    impl ScriptedBuilder {
        fn new(failures: HashMap<String, BuildFailure>) -> Self {
            Self {
                order: Mutex::new(Vec::new()),
                failures,
            }
        }
    }

    impl PackageBuilder for ScriptedBuilder {
        fn build(&self, request: &BuildRequest) -> Result<BuildOutcome> {
            self.order.lock().unwrap().push(request.pkgbase.clone());
            let kind = match self.failures.get(&request.pkgbase) {
                Some(failure) => OutcomeKind::Failed(failure.clone()),
                None => OutcomeKind::Successful,
            };
            Ok(BuildOutcome::new(kind, 0.01))
        }
    }

    struct NullNotifier;
    impl Notifier for NullNotifier {
        fn report(&self, _pkgbase: Option<&str>, _subject: &str, _body: &str) {}
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        logger: BuildLogger,
        logdir: LogDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let logger = BuildLogger::open(dir.path()).unwrap();
            let logdir = LogDir::create(dir.path()).unwrap();
            Self {
                _dir: dir,
                logger,
                logdir,
            }
        }

        fn config(&self, max_concurrency: usize) -> DriverConfig {
            DriverConfig {
                max_concurrency,
                destdir: PathBuf::from("/tmp"),
                bindmounts: Vec::new(),
                envvars: HashMap::new(),
            }
        }
    }

    fn run_driver(
        cycle: &mut Cycle,
        catalog: &Catalog,
        builder: Arc<ScriptedBuilder>,
        max_concurrency: usize,
    ) -> Result<Vec<String>> {
        clear_interrupt();
        let fixture = Fixture::new();
        let driver = Driver::new(
            cycle,
            catalog,
            builder.clone(),
            None,
            &NullNotifier,
            &fixture.logger,
            &fixture.logdir,
            fixture.config(max_concurrency),
        )?;
        driver.run()?;
        let order = builder.order.lock().unwrap().clone();
        Ok(order)
    }

    #[test]
    fn test_sequential_priority_order() {
        let mut catalog = Catalog::new();
        catalog.insert(Recipe::new("p1"));
        catalog.insert(Recipe::new("p2"));
        catalog.insert(Recipe::new("p3"));

        let mut cycle = Cycle::new();
        cycle.add_reason("p3", BuildReason::Cmdline);
        cycle.add_reason("p2", BuildReason::UpdatedFailed);
        cycle.add_reason("p1", BuildReason::UpdatedPkgrel);
        for pkg in ["p1", "p2", "p3"] {
            cycle.depmap.insert(pkg.to_string(), HashSet::new());
        }

        let builder = Arc::new(ScriptedBuilder::new(HashMap::new()));
        let order = run_driver(&mut cycle, &catalog, builder, 1).unwrap();

        assert_eq!(order, vec!["p1", "p2", "p3"]);
        assert_eq!(cycle.built.len(), 3);
        assert!(cycle.failed.is_empty());
    }

    #[test]
    fn test_dependency_ordering() {
        let mut catalog = Catalog::new();
        catalog.insert(Recipe::new("app"));
        catalog.insert(Recipe::new("lib"));

        let mut cycle = Cycle::new();
        cycle.add_reason("app", BuildReason::Cmdline);
        cycle.add_reason("lib", BuildReason::Depended { depender: "app".to_string() });
        cycle
            .depmap
            .insert("app".to_string(), ["lib".to_string()].into());
        cycle.depmap.insert("lib".to_string(), HashSet::new());

        let builder = Arc::new(ScriptedBuilder::new(HashMap::new()));
        let order = run_driver(&mut cycle, &catalog, builder, 4).unwrap();

        assert_eq!(order, vec!["lib", "app"]);
    }

    #[test]
    fn test_missing_dependencies_recorded() {
        let mut catalog = Catalog::new();
        catalog.insert(Recipe::new("app"));

        let mut cycle = Cycle::new();
        cycle.add_reason("app", BuildReason::Cmdline);
        cycle.depmap.insert("app".to_string(), HashSet::new());

        let mut failures = HashMap::new();
        failures.insert(
            "app".to_string(),
            BuildFailure::MissingDependencies {
                deps: vec!["lib".to_string()],
            },
        );
        let builder = Arc::new(ScriptedBuilder::new(failures));
        run_driver(&mut cycle, &catalog, builder, 1).unwrap();

        assert_eq!(cycle.failed["app"], vec!["lib"]);
        assert!(cycle.built.is_empty());
    }

    #[test]
    fn test_failed_by_deps_only_reason_is_pruned() {
        let unresolved = Arc::new(AtomicBool::new(false));
        let mut catalog = Catalog::new();
        let mut app = Recipe::new("app");
        app.deps.push(Dependency::new(
            "lib",
            "lib",
            Arc::new(FlagResolver(unresolved.clone())),
        ));
        catalog.insert(app);

        let mut cycle = Cycle::new();
        cycle.add_reason(
            "app",
            BuildReason::FailedByDeps { deps: vec!["lib".to_string()] },
        );
        cycle.depmap.insert("app".to_string(), HashSet::new());

        let builder = Arc::new(ScriptedBuilder::new(HashMap::new()));
        let order = run_driver(&mut cycle, &catalog, builder, 1).unwrap();

        // dependency still missing: never dispatched, not marked failed
        assert!(order.is_empty());
        assert!(cycle.failed.is_empty());
        assert!(cycle.built.is_empty());
    }

    #[test]
    fn test_failed_by_deps_builds_once_deps_resolve() {
        let resolved = Arc::new(AtomicBool::new(true));
        let mut catalog = Catalog::new();
        let mut app = Recipe::new("app");
        app.deps.push(Dependency::new(
            "lib",
            "lib",
            Arc::new(FlagResolver(resolved)),
        ));
        catalog.insert(app);

        let mut cycle = Cycle::new();
        cycle.add_reason(
            "app",
            BuildReason::FailedByDeps { deps: vec!["lib".to_string()] },
        );
        cycle.depmap.insert("app".to_string(), HashSet::new());

        let builder = Arc::new(ScriptedBuilder::new(HashMap::new()));
        let order = run_driver(&mut cycle, &catalog, builder, 1).unwrap();

        assert_eq!(order, vec!["app"]);
        assert!(cycle.built.contains("app"));
    }

    #[test]
    fn test_failed_package_in_frontier_is_not_dispatched() {
        let mut catalog = Catalog::new();
        catalog.insert(Recipe::new("app"));

        let mut cycle = Cycle::new();
        cycle.add_reason("app", BuildReason::Cmdline);
        cycle.depmap.insert("app".to_string(), HashSet::new());
        // failed before the pool ever saw it
        cycle.mark_failed("app", Vec::new());

        let builder = Arc::new(ScriptedBuilder::new(HashMap::new()));
        let order = run_driver(&mut cycle, &catalog, builder, 1).unwrap();

        assert!(order.is_empty());
        assert!(cycle.built.is_empty());
    }

    #[test]
    fn test_failure_does_not_abort_cycle() {
        let mut catalog = Catalog::new();
        catalog.insert(Recipe::new("bad"));
        catalog.insert(Recipe::new("good"));

        let mut cycle = Cycle::new();
        cycle.add_reason("bad", BuildReason::UpdatedPkgrel);
        cycle.add_reason("good", BuildReason::Cmdline);
        cycle.depmap.insert("bad".to_string(), HashSet::new());
        cycle.depmap.insert("good".to_string(), HashSet::new());

        let mut failures = HashMap::new();
        failures.insert(
            "bad".to_string(),
            BuildFailure::Error { message: "compile error".to_string() },
        );
        let builder = Arc::new(ScriptedBuilder::new(failures));
        run_driver(&mut cycle, &catalog, builder, 1).unwrap();

        assert!(cycle.failed.contains_key("bad"));
        assert!(cycle.built.contains("good"));
    }
}

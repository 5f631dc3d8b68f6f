// src/sched/pool.rs

//! Bounded worker pool.
//!
//! Workers are plain OS threads: each picks jobs off a shared channel, calls
//! the external builder (blocking, subprocess-heavy) and reports the result
//! back to the driver. Worker slot ids come from a process-wide counter so
//! the builder can key per-worker sandboxes on them; slots are never recycled
//! across cycles.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sched::outcome::{BuildOutcome, BuildRequest, PackageBuilder};

/// Result of one worker job, fed back to the driver thread
pub struct WorkerReport {
    pub pkgbase: String,
    pub outcome: Result<BuildOutcome>,
}

static NEXT_WORKER_SLOT: Mutex<u32> = Mutex::new(0);

/// Allocate the next worker slot id. Process-wide and monotonic.
fn alloc_worker_slot() -> u32 {
    let mut next = NEXT_WORKER_SLOT
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let slot = *next;
    *next += 1;
    slot
}

/// Fixed-size pool of build workers
pub struct WorkerPool {
    job_tx: Option<Sender<BuildRequest>>,
    results: Receiver<WorkerReport>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, builder: Arc<dyn PackageBuilder>) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<BuildRequest>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, results) = mpsc::channel();

        let mut handles = Vec::with_capacity(size);
        for _ in 0..size {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let builder = Arc::clone(&builder);
            handles.push(std::thread::spawn(move || {
                worker_loop(job_rx, result_tx, builder)
            }));
        }

        Self {
            job_tx: Some(job_tx),
            results,
            handles,
        }
    }

    /// Queue one build; a free worker picks it up
    pub fn submit(&self, request: BuildRequest) -> Result<()> {
        let tx = self
            .job_tx
            .as_ref()
            .ok_or_else(|| Error::Scheduler("worker pool already shut down".into()))?;
        tx.send(request)
            .map_err(|_| Error::Scheduler("all workers exited".into()))
    }

    /// Block until at least one job completes; `None` if every worker exited
    pub fn wait_one(&self) -> Option<WorkerReport> {
        self.results.recv().ok()
    }

    /// Drain one already-completed job without blocking
    pub fn try_wait(&self) -> Option<WorkerReport> {
        match self.results.try_recv() {
            Ok(report) => Some(report),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Close the job channel and join the workers
    pub fn shutdown(mut self) {
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    job_rx: Arc<Mutex<Receiver<BuildRequest>>>,
    result_tx: Sender<WorkerReport>,
    builder: Arc<dyn PackageBuilder>,
) {
    let slot = alloc_worker_slot();
    debug!("worker slot {} started", slot);
    loop {
        let job = {
            let rx = job_rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rx.recv()
        };
        let mut request = match job {
            Ok(request) => request,
            Err(_) => break, // channel closed: pool is shutting down
        };
        request.worker_slot = slot;
        let pkgbase = request.pkgbase.clone();
        let outcome = builder.build(&request);
        if result_tx.send(WorkerReport { pkgbase, outcome }).is_err() {
            break;
        }
    }
    debug!("worker slot {} exiting", slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::outcome::OutcomeKind;
    use std::collections::HashMap;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBuilder {
        concurrent: AtomicUsize,
        peak: AtomicUsize,
    }

    impl PackageBuilder for CountingBuilder {
        fn build(&self, _request: &BuildRequest) -> Result<BuildOutcome> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(BuildOutcome::new(OutcomeKind::Successful, 0.02))
        }
    }

    fn request(pkgbase: &str) -> BuildRequest {
        BuildRequest {
            pkgbase: pkgbase.to_string(),
            worker_slot: 0,
            destdir: PathBuf::from("/tmp"),
            bindmounts: Vec::new(),
            envvars: HashMap::new(),
            log_path: PathBuf::from("/dev/null"),
        }
    }

    #[test]
    fn test_all_jobs_complete() {
        let builder = Arc::new(CountingBuilder {
            concurrent: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = WorkerPool::new(2, builder.clone());

        for i in 0..5 {
            pool.submit(request(&format!("pkg{}", i))).unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let report = pool.wait_one().unwrap();
            assert!(report.outcome.is_ok());
            seen.insert(report.pkgbase);
        }
        assert_eq!(seen.len(), 5);
        // bounded: never more in flight than the pool size
        assert!(builder.peak.load(Ordering::SeqCst) <= 2);

        pool.shutdown();
    }

    #[test]
    fn test_worker_slots_are_unique() {
        struct SlotRecorder {
            slots: Mutex<HashSet<u32>>,
        }
        impl PackageBuilder for SlotRecorder {
            fn build(&self, request: &BuildRequest) -> Result<BuildOutcome> {
                std::thread::sleep(std::time::Duration::from_millis(10));
                self.slots.lock().unwrap().insert(request.worker_slot);
                Ok(BuildOutcome::new(OutcomeKind::Successful, 0.0))
            }
        }

        let builder = Arc::new(SlotRecorder {
            slots: Mutex::new(HashSet::new()),
        });
        let pool = WorkerPool::new(3, builder.clone());
        for i in 0..3 {
            pool.submit(request(&format!("pkg{}", i))).unwrap();
        }
        for _ in 0..3 {
            pool.wait_one().unwrap();
        }
        pool.shutdown();

        // three workers can have raced for fewer jobs, but any slot seen is
        // distinct per worker
        let slots = builder.slots.lock().unwrap();
        assert!(!slots.is_empty());
        assert!(slots.len() <= 3);
    }

    #[test]
    fn test_try_wait_does_not_block() {
        let builder = Arc::new(CountingBuilder {
            concurrent: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = WorkerPool::new(1, builder);
        assert!(pool.try_wait().is_none());
        pool.shutdown();
    }
}

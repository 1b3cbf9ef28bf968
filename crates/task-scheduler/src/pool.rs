//! Worker pool implementation
//!
//! Concurrency is bounded by a semaphore whose permit count tracks the
//! scaler's target. The pool moves through three states: `Stopped` until
//! the first admission, `Running(n)` while accepting work, and `ShutDown`
//! once `shutdown` has been called. `ShutDown` is final.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{Job, JobOutcome};
use config::ConfigManager;
use inference_engine::ImageGenerator;
use scaling_adapter::AutoScaler;

use crate::job::{BatchResults, JobHandle, PoolStats, TrackedJob};

/// Time in-flight jobs get to finish after `shutdown`
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

const DEFAULT_SAMPLER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolState {
    /// No capacity has been allocated yet
    Stopped,
    /// Accepting work with this many concurrent slots
    Running(usize),
    /// No longer accepting work
    ShutDown,
}

struct PoolInner {
    state: PoolState,
    tracked: Vec<TrackedJob>,
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Load-adaptive pool running generation jobs
pub struct WorkerPool {
    /// Runs each job
    generator: Arc<dyn ImageGenerator>,

    /// Decides the concurrency target
    scaler: Arc<AutoScaler>,

    /// Concurrency slots
    semaphore: Arc<Semaphore>,

    /// State and jobs not yet collected
    inner: Mutex<PoolInner>,

    /// Jobs submitted but not resolved
    pending: Arc<AtomicUsize>,

    /// Signalled when `pending` drops to zero
    idle: Arc<Notify>,

    /// Cancels jobs abandoned after the shutdown grace period
    token: CancellationToken,

    counters: Arc<PoolCounters>,

    /// Grace period used by `shutdown_default`
    shutdown_grace: Duration,

    /// How long to wait for the sampler loop on shutdown
    sampler_stop_timeout: Duration,
}

impl WorkerPool {
    /// Creates a stopped pool
    pub fn new(generator: Arc<dyn ImageGenerator>, scaler: Arc<AutoScaler>) -> Self {
        Self {
            generator,
            scaler,
            semaphore: Arc::new(Semaphore::new(0)),
            inner: Mutex::new(PoolInner {
                state: PoolState::Stopped,
                tracked: Vec::new(),
            }),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            token: CancellationToken::new(),
            counters: Arc::new(PoolCounters::default()),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            sampler_stop_timeout: DEFAULT_SAMPLER_STOP_TIMEOUT,
        }
    }

    /// Creates a stopped pool with `pool.shutdown_grace` and `sampler.stop_timeout`
    pub fn from_config(
        config_manager: &ConfigManager,
        generator: Arc<dyn ImageGenerator>,
        scaler: Arc<AutoScaler>,
    ) -> Self {
        let mut pool = Self::new(generator, scaler);

        pool.shutdown_grace = config_manager
            .get_duration("pool.shutdown_grace")
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE);
        pool.sampler_stop_timeout = config_manager
            .get_duration("sampler.stop_timeout")
            .unwrap_or(DEFAULT_SAMPLER_STOP_TIMEOUT);

        pool
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        self.inner.lock().state
    }

    /// Jobs submitted but not yet resolved
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// The scaler driving this pool
    pub fn scaler(&self) -> &Arc<AutoScaler> {
        &self.scaler
    }

    /// Sets the number of concurrent slots
    ///
    /// Growing takes effect at once. Shrinking retires slots as running jobs
    /// release them; no job is interrupted.
    pub fn resize(&self, workers: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        self.resize_locked(&mut inner, workers)
    }

    fn resize_locked(&self, inner: &mut PoolInner, workers: usize) -> Result<()> {
        let workers = workers.max(1);

        let current = match inner.state {
            PoolState::ShutDown => return Err(Error::PoolShutDown),
            PoolState::Stopped => {
                info!("Starting worker pool with {} workers", workers);
                0
            }
            PoolState::Running(current) => current,
        };

        if workers > current {
            self.semaphore.add_permits(workers - current);
        } else if workers < current {
            let retire = u32::try_from(current - workers)
                .map_err(|_| Error::Internal(format!("Cannot retire {} workers", current - workers)))?;
            let semaphore = self.semaphore.clone();
            let token = self.token.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    permits = semaphore.acquire_many_owned(retire) => {
                        if let Ok(permits) = permits {
                            permits.forget();
                        }
                    }
                }
            });
        }

        if current != 0 && workers != current {
            debug!("Worker pool resized {} -> {}", current, workers);
        }

        inner.state = PoolState::Running(workers);

        Ok(())
    }

    /// Submits one job
    ///
    /// The worker target is recomputed from the current backlog first.
    pub async fn submit(&self, job: Job) -> Result<JobHandle> {
        if self.state() == PoolState::ShutDown {
            return Err(Error::PoolShutDown);
        }

        self.scaler.adjust_workers(self.pending()).await;

        let mut inner = self.inner.lock();

        // Concurrent submits can finish scaling in any order; size to the latest decision
        let target = self.scaler.current_workers();

        // Shutdown may have started while the scaler was sampling
        match inner.state {
            PoolState::ShutDown => return Err(Error::PoolShutDown),
            PoolState::Running(current) if current == target => {}
            _ => self.resize_locked(&mut inner, target)?,
        }

        let index = job.index;
        let (tx, rx) = oneshot::channel();

        self.pending.fetch_add(1, Ordering::SeqCst);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let handle = tokio::spawn(run_job(
            job,
            self.generator.clone(),
            self.semaphore.clone(),
            self.token.clone(),
            JobBookkeeping {
                pending: self.pending.clone(),
                idle: self.idle.clone(),
                counters: self.counters.clone(),
                tx,
            },
        ));

        inner.tracked.push(TrackedJob { index, handle });

        Ok(JobHandle::new(index, rx))
    }

    /// Submits many jobs, returning their handles in submission order
    ///
    /// Stops at the first rejected job; jobs already admitted keep running.
    pub async fn submit_batch<I>(&self, jobs: I) -> Result<Vec<JobHandle>>
    where
        I: IntoIterator<Item = Job>,
    {
        let jobs = jobs.into_iter();
        let mut handles = Vec::with_capacity(jobs.size_hint().0);

        for job in jobs {
            handles.push(self.submit(job).await?);
        }

        info!("Submitted batch of {} jobs", handles.len());

        Ok(handles)
    }

    /// Waits until every uncollected job resolves or `timeout` elapses
    ///
    /// Jobs still running at the deadline are reported as unresolved and
    /// remain collectable by a later call.
    pub async fn await_all(&self, timeout: Duration) -> BatchResults {
        let tracked = std::mem::take(&mut self.inner.lock().tracked);
        let deadline = Instant::now() + timeout;

        let mut running: FuturesUnordered<TrackedJob> = tracked.into_iter().collect();
        let mut outcomes = Vec::with_capacity(running.len());

        while let Ok(Some((index, result))) = tokio::time::timeout_at(deadline, running.next()).await {
            let outcome = result.unwrap_or_else(|e| JobOutcome::failed(index, format!("job task failed: {}", e)));
            outcomes.push(outcome);
        }

        let unresolved: Vec<usize> = running.iter().map(|job| job.index).collect();
        if !unresolved.is_empty() {
            warn!("{} jobs still running after {:?}", unresolved.len(), timeout);
        }

        self.inner.lock().tracked.extend(running);

        BatchResults { outcomes, unresolved }
    }

    /// Stops admitting work, drains in-flight jobs and stops the scaler
    ///
    /// Jobs still running after `grace` are abandoned and resolve as
    /// failures. Returns true if everything finished within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state == PoolState::ShutDown {
                return self.pending() == 0;
            }
            inner.state = PoolState::ShutDown;
        }

        info!("Worker pool shutting down with {} jobs in flight", self.pending());

        let drained = self.wait_idle(grace).await;
        if !drained {
            warn!("Abandoning {} jobs after {:?} grace period", self.pending(), grace);
        }

        self.token.cancel();
        self.semaphore.close();
        self.scaler.stop(self.sampler_stop_timeout).await;

        info!("Worker pool shut down");

        drained
    }

    /// `shutdown` with the configured grace period
    pub async fn shutdown_default(&self) -> bool {
        self.shutdown(self.shutdown_grace).await
    }

    async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;

        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending() == 0;
            }
        }
    }

    /// Snapshot of the pool counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            state: self.state(),
            pending: self.pending(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

struct JobBookkeeping {
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    counters: Arc<PoolCounters>,
    tx: oneshot::Sender<JobOutcome>,
}

async fn run_job(
    job: Job,
    generator: Arc<dyn ImageGenerator>,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
    bookkeeping: JobBookkeeping,
) -> JobOutcome {
    let index = job.index;

    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => JobOutcome::failed(index, "abandoned at shutdown"),
        outcome = execute(job, generator, semaphore) => outcome,
    };

    if outcome.success {
        bookkeeping.counters.succeeded.fetch_add(1, Ordering::Relaxed);
    } else {
        bookkeeping.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    if bookkeeping.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
        bookkeeping.idle.notify_waiters();
    }

    // The caller may have dropped its handle
    let _ = bookkeeping.tx.send(outcome.clone());

    outcome
}

async fn execute(mut job: Job, generator: Arc<dyn ImageGenerator>, semaphore: Arc<Semaphore>) -> JobOutcome {
    let index = job.index;

    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return JobOutcome::failed(index, "worker pool closed"),
    };

    match AssertUnwindSafe(generator.generate_job(&mut job)).catch_unwind().await {
        Ok(Ok(image)) => JobOutcome::succeeded(index, image),
        Ok(Err(error)) => JobOutcome::failed(index, error.to_string()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());

            warn!("Job {} panicked: {}", index, message);
            JobOutcome::failed(index, format!("job panicked: {}", message))
        }
    }
}

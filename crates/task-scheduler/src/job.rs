//! Job handles and batch results

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};

use common::models::JobOutcome;

use crate::pool::PoolState;

/// Caller's handle to one submitted job
#[derive(Debug)]
pub struct JobHandle {
    index: usize,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub(crate) fn new(index: usize, rx: oneshot::Receiver<JobOutcome>) -> Self {
        Self { index, rx }
    }

    /// Index of the job
    pub fn index(&self) -> usize {
        self.index
    }

    /// Waits for the job's outcome
    pub async fn outcome(self) -> JobOutcome {
        let index = self.index;
        self.rx
            .await
            .unwrap_or_else(|_| JobOutcome::failed(index, "job was dropped before completing"))
    }
}

/// Pool-side view of a running job
pub(crate) struct TrackedJob {
    pub(crate) index: usize,
    pub(crate) handle: JoinHandle<JobOutcome>,
}

impl Future for TrackedJob {
    type Output = (usize, Result<JobOutcome, JoinError>);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let index = self.index;
        Pin::new(&mut self.handle).poll(cx).map(|result| (index, result))
    }
}

/// Outcomes collected by `await_all`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResults {
    /// One outcome per resolved job, in completion order
    pub outcomes: Vec<JobOutcome>,
    /// Indices of jobs still running when the wait ended
    pub unresolved: Vec<usize>,
}

impl BatchResults {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Returns true if every tracked job resolved
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub state: PoolState,
    /// Jobs submitted but not yet resolved
    pub pending: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

//! Pending-job registry correlating outbound requests with inbound responses.
//!
//! Each job-bearing send registers its source [`JobId`] here. Inbound messages with a
//! non-zero target job are resolved against the registry:
//!
//! - a *single* job is fulfilled by the first matching message and removed;
//! - a *multiple* job receives every matching message and is removed once its terminal
//!   predicate (an explicit check on a message field) returns true.
//!
//! Every entry leaves the registry exactly once: on completion, timeout, cancellation,
//! disconnect, or when its handle is dropped. Messages for unknown jobs are reported as
//! [`Resolution::Unknown`] and are not an error.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::job::{JobId, JobIdAllocator};
use crate::message::PacketMsg;

/// Terminal outcome of a job other than a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JobError {
    /// The caller's deadline passed before the job completed.
    #[error("job {job} timed out")]
    Timeout {
        /// Job that timed out.
        job: JobId,
    },
    /// The job was cancelled by the caller.
    #[error("job {job} was cancelled")]
    Cancelled {
        /// Job that was cancelled.
        job: JobId,
    },
    /// The connection carrying the job went away.
    #[error("job {job} failed: connection lost")]
    Disconnected {
        /// Job that was faulted.
        job: JobId,
    },
}

impl JobError {
    /// Job this error belongs to.
    pub fn job_id(&self) -> JobId {
        match self {
            JobError::Timeout { job } | JobError::Cancelled { job } | JobError::Disconnected { job } => *job,
        }
    }
}

/// Why a job is being removed without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit caller cancellation.
    UserRequested,
    /// Caller deadline expired.
    Timeout,
    /// The session ended.
    Disconnected,
}

impl CancelReason {
    fn into_error(self, job: JobId) -> JobError {
        match self {
            CancelReason::UserRequested => JobError::Cancelled { job },
            CancelReason::Timeout => JobError::Timeout { job },
            CancelReason::Disconnected => JobError::Disconnected { job },
        }
    }
}

/// Outcome of resolving an inbound message against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The job finished and its entry was removed.
    Completed,
    /// A multiple job took the message and expects more.
    AwaitingMore,
    /// No job with that id is pending.
    Unknown,
}

/// Predicate deciding whether a message is the last one of a multiple job.
pub type TerminalPredicate = Box<dyn Fn(&PacketMsg) -> bool + Send + Sync>;

/// Outcome delivered through a job handle.
pub type JobResult = std::result::Result<PacketMsg, JobError>;

enum Sink {
    Single(oneshot::Sender<JobResult>),
    Multiple {
        tx: mpsc::UnboundedSender<JobResult>,
        terminal: TerminalPredicate,
    },
}

impl Sink {
    fn fail(self, err: JobError) {
        match self {
            Sink::Single(tx) => {
                let _ = tx.send(Err(err));
            }
            Sink::Multiple { tx, .. } => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// A registered sink and the generation of the handle that owns it.
struct Pending {
    generation: u64,
    sink: Sink,
}

struct RegistryInner {
    allocator: JobIdAllocator,
    generations: AtomicU64,
    pending: Mutex<HashMap<JobId, Pending>>,
}

/// Shared registry of pending jobs. Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    /// Creates a registry with a fresh job id allocator.
    pub fn new() -> Self {
        Self::with_allocator(JobIdAllocator::new())
    }

    /// Creates a registry around an existing allocator.
    pub fn with_allocator(allocator: JobIdAllocator) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                allocator,
                generations: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Allocates the next job id. Safe under concurrent callers.
    pub fn next_job_id(&self) -> JobId {
        self.inner.allocator.next_job_id()
    }

    /// Registers a job completed by exactly one response.
    ///
    /// Registering an id that is already pending replaces the old entry; its handle then
    /// resolves as `Disconnected`, and dropping it leaves the new entry in place.
    pub fn register_single(&self, job: JobId) -> SingleJob {
        let (tx, rx) = oneshot::channel();
        let generation = self.insert(job, Sink::Single(tx));
        SingleJob {
            job_id: job,
            generation,
            rx: Some(rx),
            registry: self.clone(),
        }
    }

    /// Registers a job answered by a stream of responses ending with one for which
    /// `terminal` returns true.
    pub fn register_multiple<F>(&self, job: JobId, terminal: F) -> MultiJob
    where
        F: Fn(&PacketMsg) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.insert(
            job,
            Sink::Multiple {
                tx,
                terminal: Box::new(terminal),
            },
        );
        MultiJob {
            job_id: job,
            generation,
            rx,
            registry: self.clone(),
        }
    }

    fn insert(&self, job: JobId, sink: Sink) -> u64 {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .inner
            .pending
            .lock()
            .insert(job, Pending { generation, sink });
        if let Some(previous) = previous {
            debug!(job = %job, "replaced pending job with the same id");
            previous.sink.fail(JobError::Disconnected { job });
        }
        generation
    }

    /// Hands `packet` to the job it targets.
    pub fn resolve(&self, target: JobId, packet: PacketMsg) -> Resolution {
        let mut pending = self.inner.pending.lock();
        let Entry::Occupied(entry) = pending.entry(target) else {
            return Resolution::Unknown;
        };
        if let Sink::Multiple { tx, terminal } = &entry.get().sink {
            let last = terminal(&packet);
            let delivered = tx.send(Ok(packet)).is_ok();
            if !last && delivered {
                return Resolution::AwaitingMore;
            }
            entry.remove();
            return Resolution::Completed;
        }
        if let Sink::Single(tx) = entry.remove().sink {
            let _ = tx.send(Ok(packet));
        }
        Resolution::Completed
    }

    /// Removes a pending job, failing its handle. Returns false if it was not pending.
    pub fn cancel(&self, job: JobId, reason: CancelReason) -> bool {
        self.remove_entry(job, None, reason)
    }

    fn remove_entry(&self, job: JobId, generation: Option<u64>, reason: CancelReason) -> bool {
        let removed = {
            let mut pending = self.inner.pending.lock();
            match pending.entry(job) {
                Entry::Occupied(entry)
                    if generation.map_or(true, |g| entry.get().generation == g) =>
                {
                    Some(entry.remove())
                }
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                entry.sink.fail(reason.into_error(job));
                true
            }
            None => false,
        }
    }

    /// Fails every pending job with `reason`. Returns how many were pending.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let drained: Vec<(JobId, Pending)> = self.inner.pending.lock().drain().collect();
        let count = drained.len();
        for (job, entry) in drained {
            entry.sink.fail(reason.into_error(job));
        }
        count
    }

    /// Removes the entry owned by the handle of `generation` without notifying it. An
    /// entry registered later under the same id is left alone.
    fn forget(&self, job: JobId, generation: u64) -> bool {
        let mut pending = self.inner.pending.lock();
        match pending.entry(job) {
            Entry::Occupied(entry) if entry.get().generation == generation => {
                entry.remove();
                true
            }
            _ => false,
        }
    }

    /// Number of pending jobs.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// True if `job` is pending.
    pub fn is_pending(&self, job: JobId) -> bool {
        self.inner.pending.lock().contains_key(&job)
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Completion handle of a single-response job.
///
/// Dropping the handle removes the job from the registry; a later response is then
/// dropped as unknown.
pub struct SingleJob {
    job_id: JobId,
    generation: u64,
    rx: Option<oneshot::Receiver<JobResult>>,
    registry: JobRegistry,
}

impl SingleJob {
    /// Id of this job.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Waits for the response with no deadline.
    pub async fn wait(mut self) -> JobResult {
        let Some(rx) = self.rx.take() else {
            return Err(JobError::Disconnected { job: self.job_id });
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(JobError::Disconnected { job: self.job_id }),
        }
    }

    /// Waits for the response for at most `timeout`. On expiry the job is removed and
    /// resolves as [`JobError::Timeout`].
    pub async fn wait_timeout(mut self, timeout: Duration) -> JobResult {
        let Some(mut rx) = self.rx.take() else {
            return Err(JobError::Disconnected { job: self.job_id });
        };
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(JobError::Disconnected { job: self.job_id }),
            Err(_) => {
                if self.registry.forget(self.job_id, self.generation) {
                    debug!(job = %self.job_id, timeout_ms = timeout.as_millis() as u64, "job timed out");
                    return Err(JobError::Timeout { job: self.job_id });
                }
                // Resolved between the deadline and the removal.
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(JobError::Timeout { job: self.job_id }),
                }
            }
        }
    }

    /// Returns a handle that cancels this job from elsewhere.
    pub fn canceller(&self) -> JobCanceller {
        JobCanceller {
            job_id: self.job_id,
            generation: self.generation,
            registry: self.registry.clone(),
        }
    }
}

impl Drop for SingleJob {
    fn drop(&mut self) {
        self.registry.forget(self.job_id, self.generation);
    }
}

impl std::fmt::Debug for SingleJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleJob").field("job_id", &self.job_id).finish()
    }
}

/// Cloneable handle that cancels one pending job.
#[derive(Clone)]
pub struct JobCanceller {
    job_id: JobId,
    generation: u64,
    registry: JobRegistry,
}

impl JobCanceller {
    /// Cancels the job. Returns false if it had already finished.
    pub fn cancel(&self) -> bool {
        self.registry
            .remove_entry(self.job_id, Some(self.generation), CancelReason::UserRequested)
    }

    /// Id of the job this handle cancels.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// Completion handle of a multiple-response job.
pub struct MultiJob {
    job_id: JobId,
    generation: u64,
    rx: mpsc::UnboundedReceiver<JobResult>,
    registry: JobRegistry,
}

impl MultiJob {
    /// Id of this job.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Next response, or `None` after the terminal response has been returned.
    pub async fn next(&mut self) -> Option<JobResult> {
        self.rx.recv().await
    }

    /// Collects all responses up to and including the terminal one.
    pub async fn collect(mut self, timeout: Duration) -> Result<Vec<PacketMsg>, JobError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut responses = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(Ok(packet))) => responses.push(packet),
                Ok(Some(Err(err))) => return Err(err),
                Ok(None) => return Ok(responses),
                Err(_) => {
                    self.registry.forget(self.job_id, self.generation);
                    return Err(JobError::Timeout { job: self.job_id });
                }
            }
        }
    }

    /// Cancels the job; `next` then yields `Cancelled`.
    pub fn cancel(&self) -> bool {
        self.registry
            .remove_entry(self.job_id, Some(self.generation), CancelReason::UserRequested)
    }
}

impl Drop for MultiJob {
    fn drop(&mut self) {
        self.registry.forget(self.job_id, self.generation);
    }
}

impl std::fmt::Debug for MultiJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiJob").field("job_id", &self.job_id).finish()
    }
}

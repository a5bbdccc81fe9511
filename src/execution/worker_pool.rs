//! Bounded worker pool behind a submit/await/cancel work-queue interface

use crate::execution::executor::StepResult;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tracing::{debug, warn};

/// A unit of work producing a step result
pub type Job = Pin<Box<dyn Future<Output = StepResult> + Send + 'static>>;

/// A finished task; `Err` carries the panic message of a crashed job
#[derive(Debug)]
pub struct Completion {
    pub task_id: String,
    pub outcome: Result<StepResult, String>,
}

/// What a cancel request found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Task was still queued and will never start
    NotStarted,
    /// Task was running; abort was requested
    Running,
    /// Task already finished or was unknown
    AlreadyFinished,
}

/// Work-queue abstraction the coordinator depends on
///
/// One queue serves every parallel stage of a run; each stage opens its
/// own batch so completions never leak across stages.
pub trait WorkQueue: Send + Sync {
    /// Maximum number of jobs running at once
    fn capacity(&self) -> usize;

    fn open_batch(&self) -> Box<dyn TaskBatch>;
}

/// The tasks of a single stage
#[async_trait]
pub trait TaskBatch: Send {
    fn submit(&mut self, task_id: String, job: Job);

    /// Next finished task, in completion order; `None` once nothing is left
    async fn next_completion(&mut self) -> Option<Completion>;

    fn cancel(&mut self, task_id: &str) -> CancelOutcome;

    /// Ids of tasks neither finished nor cancelled, in submission order
    fn unresolved(&self) -> Vec<String>;
}

/// In-process pool bounded by a semaphore
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }
}

impl WorkQueue for WorkerPool {
    fn capacity(&self) -> usize {
        self.size
    }

    fn open_batch(&self) -> Box<dyn TaskBatch> {
        Box::new(PoolBatch {
            permits: self.permits.clone(),
            set: JoinSet::new(),
            tasks: Vec::new(),
        })
    }
}

struct TaskSlot {
    id: String,
    abort: AbortHandle,
    started: Arc<AtomicBool>,
    resolved: bool,
}

struct PoolBatch {
    permits: Arc<Semaphore>,
    set: JoinSet<Completion>,
    tasks: Vec<TaskSlot>,
}

/// Aborts the inner job when the worker task is dropped or aborted
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task was aborted".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("executor panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("executor panicked: {}", msg)
    } else {
        "executor panicked".to_string()
    }
}

#[async_trait]
impl TaskBatch for PoolBatch {
    fn submit(&mut self, task_id: String, job: Job) {
        let permits = self.permits.clone();
        let started = Arc::new(AtomicBool::new(false));
        let started_flag = started.clone();
        let id = task_id.clone();

        let abort = self.set.spawn(async move {
            // The pool never closes its semaphore; a closed one means unbounded
            let _permit = permits.acquire_owned().await.ok();
            started_flag.store(true, Ordering::SeqCst);
            debug!("Worker picked up task {}", id);

            // Panics stay inside the inner task and come back as a join error
            let mut job = AbortOnDrop(tokio::spawn(job));
            let outcome = (&mut job.0).await.map_err(panic_message);
            Completion { task_id: id, outcome }
        });

        self.tasks.push(TaskSlot {
            id: task_id,
            abort,
            started,
            resolved: false,
        });
    }

    async fn next_completion(&mut self) -> Option<Completion> {
        loop {
            match self.set.join_next().await? {
                Ok(completion) => {
                    let slot = self.tasks.iter_mut().find(|t| t.id == completion.task_id);
                    match slot {
                        Some(slot) if !slot.resolved => {
                            slot.resolved = true;
                            return Some(completion);
                        }
                        // Finished after it was cancelled; the cancellation stands
                        _ => continue,
                    }
                }
                Err(err) if err.is_cancelled() => continue,
                Err(err) => {
                    warn!("Worker task failed outside its job: {}", err);
                    continue;
                }
            }
        }
    }

    fn cancel(&mut self, task_id: &str) -> CancelOutcome {
        let Some(slot) = self.tasks.iter_mut().find(|t| t.id == task_id) else {
            return CancelOutcome::AlreadyFinished;
        };
        if slot.resolved {
            return CancelOutcome::AlreadyFinished;
        }
        slot.resolved = true;
        slot.abort.abort();
        if slot.started.load(Ordering::SeqCst) {
            CancelOutcome::Running
        } else {
            CancelOutcome::NotStarted
        }
    }

    fn unresolved(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| !t.resolved)
            .map(|t| t.id.clone())
            .collect()
    }
}

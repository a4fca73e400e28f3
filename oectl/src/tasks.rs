//! Asynchronous in-memory task queue with a bounded worker pool.
//!
//! Tasks are submitted with a priority (1-10, higher dequeues sooner; FIFO
//! within equal priority) and executed by a fixed set of worker loops that all
//! pull from one shared queue. Execution is delegated to an injected
//! [`TaskExecutor`]; the queue itself never talks to a provider. Finished
//! tasks stay queryable until a TTL elapses, after which a periodic sweep
//! removes them.
//!
//! The task table, the priority queue, and the map of in-flight executions
//! share one async-aware lock. The lock is held only for in-memory mutation
//! and is always released before awaiting the executor, so a slow provider
//! call never serializes queue operations.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::models::tasks::{
    AgentType, ListTasksQuery, TaskListResponse, TaskRequest, TaskResult, TaskResultResponse,
    TaskStatus, TaskStatusResponse,
};
use crate::config::TaskQueueConfig;
use crate::errors::{Error, Result};

/// Executes one unit of agent work.
///
/// Implementations wrap the provider-execution layer, including any provider
/// fallback. Errors are captured per-task and surface as `Failed`; they never
/// reach the worker loop. Executions are spawned as abortable units, so
/// implementations should be cancel-safe at their await points.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: TaskRequest) -> anyhow::Result<TaskResult>;
}

/// Plain async functions and closures can serve as executors directly.
#[async_trait]
impl<F, Fut> TaskExecutor for F
where
    F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<TaskResult>> + Send + 'static,
{
    async fn execute(&self, request: TaskRequest) -> anyhow::Result<TaskResult> {
        (self)(request).await
    }
}

/// Internal task state, owned exclusively by the manager.
#[derive(Debug, Clone)]
struct StoredTask {
    task_id: String,
    api_key_id: String,
    request: TaskRequest,
    agent: AgentType,
    priority: u8,
    status: TaskStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    error: Option<String>,
    result: Option<TaskResult>,
    cancel_requested: bool,
}

/// Heap entry ordering by priority (higher first), then submission order.
#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: u8,
    sequence: u64,
    task_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority wins, then the lowest sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Everything the workers and callers mutate, behind one lock.
#[derive(Default)]
struct TaskTable {
    tasks: HashMap<String, StoredTask>,
    queue: BinaryHeap<QueueEntry>,
    active: HashMap<String, AbortHandle>,
    sequence: u64,
}

struct WorkerSet {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    cleanup: JoinHandle<()>,
}

/// In-memory async task queue with worker pool and TTL cleanup.
pub struct TaskManager {
    executor: Arc<dyn TaskExecutor>,
    max_workers: usize,
    task_ttl: chrono::Duration,
    cleanup_interval: Duration,
    table: Mutex<TaskTable>,
    queue_signal: Notify,
    runtime: Mutex<Option<WorkerSet>>,
}

impl TaskManager {
    pub fn new(executor: Arc<dyn TaskExecutor>, config: &TaskQueueConfig) -> Self {
        Self {
            executor,
            max_workers: config.max_workers,
            task_ttl: chrono::Duration::seconds(config.task_ttl_seconds as i64),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds),
            table: Mutex::new(TaskTable::default()),
            queue_signal: Notify::new(),
            runtime: Mutex::new(None),
        }
    }

    /// Start queue workers and the cleanup loop. No-op if already running.
    pub async fn start(self: &Arc<Self>) {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let workers = (0..self.max_workers)
            .map(|worker_id| {
                let manager = Arc::clone(self);
                let token = shutdown.clone();
                tokio::spawn(async move { manager.worker_loop(worker_id, token).await })
            })
            .collect();
        let cleanup = {
            let manager = Arc::clone(self);
            let token = shutdown.clone();
            tokio::spawn(async move { manager.cleanup_loop(token).await })
        };

        *runtime = Some(WorkerSet {
            shutdown,
            workers,
            cleanup,
        });
        tracing::info!(workers = self.max_workers, "Task manager started");
    }

    /// Stop workers and the cleanup loop, aborting in-flight executions.
    /// No-op if not running.
    pub async fn shutdown(&self) {
        let Some(set) = self.runtime.lock().await.take() else {
            return;
        };

        {
            let mut table = self.table.lock().await;
            for (_, execution) in table.active.drain() {
                execution.abort();
            }
        }

        set.shutdown.cancel();
        for worker in set.workers {
            let _ = worker.await;
        }
        let _ = set.cleanup.await;

        tracing::info!("Task manager stopped");
    }

    /// Submit a task for asynchronous execution.
    ///
    /// Returns the status snapshot immediately; execution happens in the
    /// background.
    pub async fn submit_task(
        &self,
        request: TaskRequest,
        api_key_id: &str,
    ) -> Result<TaskStatusResponse> {
        request.validate()?;

        let task_id = Uuid::new_v4().to_string();
        let task = StoredTask {
            task_id: task_id.clone(),
            api_key_id: api_key_id.to_string(),
            agent: request.agent(),
            priority: request.priority(),
            request,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: None,
            error: None,
            result: None,
            cancel_requested: false,
        };
        let response = status_response(&task);

        {
            let mut table = self.table.lock().await;
            let sequence = table.sequence;
            table.sequence += 1;
            table.queue.push(QueueEntry {
                priority: task.priority,
                sequence,
                task_id: task_id.clone(),
            });
            table.tasks.insert(task_id.clone(), task);
        }
        self.queue_signal.notify_one();

        tracing::info!(
            task_id = %task_id,
            agent = response.agent.as_str(),
            priority = response.priority,
            api_key_id,
            "Task submitted"
        );
        Ok(response)
    }

    /// Get task status for the owning API key.
    pub async fn get_task(&self, task_id: &str, api_key_id: &str) -> Result<TaskStatusResponse> {
        let table = self.table.lock().await;
        let task = owned_task(&table, task_id, api_key_id)?;
        Ok(status_response(task))
    }

    /// Get a completed task's result for the owning API key.
    ///
    /// Failed and cancelled tasks do not expose results through this path;
    /// callers needing failure detail use the status payload.
    pub async fn get_task_result(
        &self,
        task_id: &str,
        api_key_id: &str,
    ) -> Result<TaskResultResponse> {
        let table = self.table.lock().await;
        let task = owned_task(&table, task_id, api_key_id)?;

        if task.status != TaskStatus::Completed {
            return Err(Error::TaskNotReady {
                id: task_id.to_string(),
            });
        }
        Ok(result_response(task))
    }

    /// Cancel a pending or processing task.
    ///
    /// The stored status flips to `Cancelled` synchronously; an in-flight
    /// execution is aborted as a best-effort signal and unwinds at its next
    /// await point.
    pub async fn cancel_task(&self, task_id: &str, api_key_id: &str) -> Result<TaskStatusResponse> {
        let response = {
            let mut table = self.table.lock().await;
            let task = table
                .tasks
                .get_mut(task_id)
                .filter(|task| task.api_key_id == api_key_id)
                .ok_or_else(|| Error::TaskNotFound {
                    id: task_id.to_string(),
                })?;

            if task.status.is_terminal() {
                return Err(Error::CancellationConflict {
                    id: task_id.to_string(),
                    status: task.status,
                });
            }

            task.cancel_requested = true;
            mark_cancelled(task, self.task_ttl);
            let response = status_response(task);

            if let Some(execution) = table.active.get(task_id) {
                execution.abort();
            }
            response
        };

        tracing::info!(task_id, api_key_id, "Task cancelled");
        Ok(response)
    }

    /// List tasks for the owning API key with filtering and pagination,
    /// newest first.
    pub async fn list_tasks(&self, api_key_id: &str, query: &ListTasksQuery) -> TaskListResponse {
        let table = self.table.lock().await;
        let mut tasks: Vec<&StoredTask> = table
            .tasks
            .values()
            .filter(|task| task.api_key_id == api_key_id)
            .filter(|task| query.status.is_none_or(|status| task.status == status))
            .filter(|task| query.agent.is_none_or(|agent| task.agent == agent))
            .collect();

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = tasks.len();
        let page = tasks
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(status_response)
            .collect();

        TaskListResponse {
            total,
            limit: query.limit,
            offset: query.offset,
            tasks: page,
        }
    }

    /// Worker loop pulling from the shared priority queue.
    async fn worker_loop(self: Arc<Self>, worker_id: usize, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let entry = self.table.lock().await.queue.pop();
            let Some(entry) = entry else {
                // Bounded wait so shutdown is observed promptly even without
                // queue activity.
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.queue_signal.notified() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            };

            self.process_task(&entry.task_id, worker_id).await;
        }
    }

    /// Process a single dequeued task.
    async fn process_task(&self, task_id: &str, worker_id: usize) {
        let request = {
            let mut table = self.table.lock().await;
            let Some(task) = table.tasks.get_mut(task_id) else {
                // Evicted while queued.
                return;
            };
            if task.status != TaskStatus::Pending {
                // Already cancelled; drop the stale queue entry.
                return;
            }
            if task.cancel_requested {
                mark_cancelled(task, self.task_ttl);
                return;
            }

            task.status = TaskStatus::Processing;
            task.started_at = Some(Utc::now());
            task.request.clone()
        };

        tracing::info!(task_id, worker = worker_id, "Task processing started");

        // Spawn the executor as its own abortable unit and register it so
        // cancellation can reach it. The table lock is not held across the
        // await below.
        let executor = Arc::clone(&self.executor);
        let execution = tokio::spawn(async move { executor.execute(request).await });
        {
            let mut table = self.table.lock().await;
            table
                .active
                .insert(task_id.to_string(), execution.abort_handle());
        }

        let outcome = execution.await;

        let mut table = self.table.lock().await;
        table.active.remove(task_id);
        let Some(task) = table.tasks.get_mut(task_id) else {
            return;
        };

        match outcome {
            Ok(Ok(result)) => {
                if task.status == TaskStatus::Cancelled || task.cancel_requested {
                    mark_cancelled(task, self.task_ttl);
                } else {
                    mark_completed(task, result, self.task_ttl);
                    tracing::info!(task_id, worker = worker_id, "Task processing completed");
                }
            }
            Ok(Err(error)) => {
                if !task.status.is_terminal() {
                    mark_failed(task, error.to_string(), self.task_ttl);
                }
                tracing::error!(
                    task_id,
                    worker = worker_id,
                    error = %error,
                    "Task processing failed"
                );
            }
            Err(join_error) if join_error.is_cancelled() => {
                if !task.status.is_terminal() {
                    mark_cancelled(task, self.task_ttl);
                }
            }
            Err(join_error) => {
                // The executor panicked; contain it as a task failure.
                if !task.status.is_terminal() {
                    mark_failed(task, join_error.to_string(), self.task_ttl);
                }
                tracing::error!(
                    task_id,
                    worker = worker_id,
                    error = %join_error,
                    "Task executor panicked"
                );
            }
        }
    }

    /// Periodic removal of expired finished tasks. This is the only path
    /// that deletes tasks; it never changes the status of a live one.
    async fn cleanup_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.cleanup_interval) => {}
            }

            let now = Utc::now();
            let expired = {
                let mut table = self.table.lock().await;
                let expired_ids: Vec<String> = table
                    .tasks
                    .iter()
                    .filter(|(_, task)| {
                        task.status.is_terminal()
                            && task.expires_at.is_some_and(|expires_at| expires_at <= now)
                    })
                    .map(|(task_id, _)| task_id.clone())
                    .collect();

                for task_id in &expired_ids {
                    table.tasks.remove(task_id);
                }
                expired_ids.len()
            };

            if expired > 0 {
                tracing::info!(count = expired, "Expired tasks cleaned");
            }
        }
    }
}

/// Looks up a task visible to `api_key_id`. A task owned by a different key
/// is indistinguishable from a nonexistent one.
fn owned_task<'a>(table: &'a TaskTable, task_id: &str, api_key_id: &str) -> Result<&'a StoredTask> {
    table
        .tasks
        .get(task_id)
        .filter(|task| task.api_key_id == api_key_id)
        .ok_or_else(|| Error::TaskNotFound {
            id: task_id.to_string(),
        })
}

fn mark_completed(task: &mut StoredTask, result: TaskResult, ttl: chrono::Duration) {
    let now = Utc::now();
    task.status = TaskStatus::Completed;
    task.result = Some(result);
    task.error = None;
    task.completed_at = Some(now);
    task.expires_at = Some(now + ttl);
}

fn mark_failed(task: &mut StoredTask, error: String, ttl: chrono::Duration) {
    let now = Utc::now();
    task.status = TaskStatus::Failed;
    task.result = None;
    task.error = Some(error);
    task.completed_at = Some(now);
    task.expires_at = Some(now + ttl);
}

fn mark_cancelled(task: &mut StoredTask, ttl: chrono::Duration) {
    let now = Utc::now();
    task.status = TaskStatus::Cancelled;
    task.result = None;
    task.error = None;
    task.completed_at = Some(now);
    task.expires_at = Some(now + ttl);
}

fn status_response(task: &StoredTask) -> TaskStatusResponse {
    TaskStatusResponse {
        task_id: task.task_id.clone(),
        agent: task.agent,
        status: task.status,
        priority: task.priority,
        created_at: task.created_at,
        started_at: task.started_at,
        completed_at: task.completed_at,
        expires_at: task.expires_at,
        error: task.error.clone(),
    }
}

fn result_response(task: &StoredTask) -> TaskResultResponse {
    TaskResultResponse {
        task_id: task.task_id.clone(),
        agent: task.agent,
        status: task.status,
        priority: task.priority,
        created_at: task.created_at,
        started_at: task.started_at,
        completed_at: task.completed_at,
        expires_at: task.expires_at,
        error: task.error.clone(),
        result: task.result.clone(),
    }
}

//! In-process task queue with a single-flight runner.
//!
//! Exactly one job executes at any instant regardless of type, which is
//! what bounds total extractor concurrency initiated through the queue.
//! There is deliberately no timeout on a running job: a hung handler blocks
//! the worker, and the watchdog belongs to a future hardening pass.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use jobfeed_core::{JobStatus, QueueJob};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Processing function bound to a job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &serde_json::Value) -> anyhow::Result<()>;
}

/// Job lifecycle notifications. Delivered on a broadcast channel so that
/// observers (audit, dashboards) can never block the queue; a lagging
/// observer loses old events, not the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    Created {
        job_id: Uuid,
        job_type: String,
    },
    Started {
        job_id: Uuid,
        job_type: String,
        attempt: u32,
    },
    Completed {
        job_id: Uuid,
        job_type: String,
        attempts: u32,
    },
    Failed {
        job_id: Uuid,
        job_type: String,
        attempts: u32,
        error: String,
        will_retry: bool,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub by_status: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub poll_interval: Duration,
    /// How long terminal jobs stay visible before the sweep removes them.
    pub retention: Duration,
    pub default_max_attempts: u32,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retention: Duration::from_secs(3_600),
            default_max_attempts: 3,
        }
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, QueueJob>,
    /// Pending job ids, oldest first. A retried job goes back to the front,
    /// keeping its place as the oldest pending job.
    pending: VecDeque<Uuid>,
}

pub struct TaskQueue {
    state: Mutex<QueueState>,
    handlers: RwLock<HashMap<String, std::sync::Arc<dyn JobHandler>>>,
    events: broadcast::Sender<QueueEvent>,
    config: TaskQueueConfig,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(QueueState::default()),
            handlers: RwLock::new(HashMap::new()),
            events,
            config,
        }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    /// Bind a handler to a job type; re-registering overwrites.
    pub async fn register_handler(&self, job_type: &str, handler: std::sync::Arc<dyn JobHandler>) {
        self.handlers.write().await.insert(job_type.to_string(), handler);
    }

    /// Create a pending job. FIFO by creation among pending jobs of any type.
    pub async fn enqueue(&self, job_type: &str, payload: serde_json::Value, max_attempts: u32) -> Uuid {
        let job = QueueJob::new(job_type, payload, max_attempts);
        let job_id = job.id;
        {
            let mut state = self.state.lock().await;
            state.pending.push_back(job_id);
            state.jobs.insert(job_id, job);
        }
        debug!(job_id = %job_id, job_type, "job enqueued");
        self.emit(QueueEvent::Created {
            job_id,
            job_type: job_type.to_string(),
        });
        job_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub async fn job(&self, job_id: Uuid) -> Option<QueueJob> {
        self.state.lock().await.jobs.get(&job_id).cloned()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            *stats.by_status.entry(job.status.as_str().to_string()).or_default() += 1;
            *stats.by_type.entry(job.job_type.clone()).or_default() += 1;
        }
        stats
    }

    fn emit(&self, event: QueueEvent) {
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.events.send(event);
    }

    /// Pick the oldest pending job and run it to a status transition.
    /// Returns the processed job id, or `None` when the queue was idle.
    pub async fn process_next(&self) -> Option<Uuid> {
        let (job_id, job_type, payload, attempt) = {
            let mut state = self.state.lock().await;
            let job_id = state.pending.pop_front()?;
            let job = state.jobs.get_mut(&job_id)?;
            job.status = JobStatus::Processing;
            job.attempts += 1;
            job.processed_at = Some(Utc::now());
            (job_id, job.job_type.clone(), job.payload.clone(), job.attempts)
        };
        self.emit(QueueEvent::Started {
            job_id,
            job_type: job_type.clone(),
            attempt,
        });

        let handler = self.handlers.read().await.get(&job_type).cloned();
        let missing_handler = handler.is_none();
        let result = match handler {
            Some(handler) => handler.handle(&payload).await,
            None => Err(anyhow!("no handler registered for job type `{job_type}`")),
        };

        let event = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let job = state.jobs.get_mut(&job_id)?;
            match result {
                Ok(()) => {
                    job.status = JobStatus::Completed;
                    job.completed_at = Some(Utc::now());
                    job.error = None;
                    info!(job_id = %job_id, job_type = %job_type, attempts = job.attempts, "job completed");
                    QueueEvent::Completed {
                        job_id,
                        job_type: job_type.clone(),
                        attempts: job.attempts,
                    }
                }
                Err(e) => {
                    let error = e.to_string();
                    // Retrying a job nothing can handle cannot succeed.
                    let will_retry = !missing_handler && job.attempts < job.max_attempts;
                    job.error = Some(error.clone());
                    if will_retry {
                        job.status = JobStatus::Pending;
                        state.pending.push_front(job_id);
                    } else {
                        job.status = JobStatus::Failed;
                        job.failed_at = Some(Utc::now());
                    }
                    warn!(
                        job_id = %job_id,
                        job_type = %job_type,
                        attempt,
                        will_retry,
                        error = %error,
                        "job failed"
                    );
                    QueueEvent::Failed {
                        job_id,
                        job_type: job_type.clone(),
                        attempts: attempt,
                        error,
                        will_retry,
                    }
                }
            }
        };
        self.emit(event);
        Some(job_id)
    }

    /// Remove terminal jobs older than the retention window.
    pub async fn sweep_expired(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::zero());
        let mut state = self.state.lock().await;
        state.jobs.retain(|_, job| {
            if !job.status.is_terminal() {
                return true;
            }
            let finished = job.completed_at.or(job.failed_at).unwrap_or(job.created_at);
            finished > cutoff
        });
    }

    /// Poll loop: one job per tick, then a retention sweep. Runs until the
    /// token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(poll_interval_ms = self.config.poll_interval.as_millis() as u64, "task queue runner starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            self.process_next().await;
            self.sweep_expired().await;
        }
        info!("task queue runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct AlwaysFails;

    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn handle(&self, _payload: &serde_json::Value) -> anyhow::Result<()> {
            Err(anyhow!("handler always fails"))
        }
    }

    /// Fails until the given attempt number, then succeeds.
    struct SucceedsOnAttempt {
        succeed_on: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for SucceedsOnAttempt {
        async fn handle(&self, _payload: &serde_json::Value) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(())
            } else {
                Err(anyhow!("not yet (attempt {call})"))
            }
        }
    }

    async fn drain(queue: &TaskQueue) {
        while queue.process_next().await.is_some() {}
    }

    #[tokio::test]
    async fn always_failing_handler_ends_terminally_failed() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        queue.register_handler("doomed", Arc::new(AlwaysFails)).await;
        let job_id = queue.enqueue("doomed", serde_json::json!({}), 3).await;

        drain(&queue).await;

        let job = queue.job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.failed_at.is_some());
        assert!(job.error.as_deref().unwrap().contains("always fails"));
    }

    #[tokio::test]
    async fn handler_succeeding_on_second_attempt_completes_with_two_attempts() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        queue
            .register_handler(
                "flaky",
                Arc::new(SucceedsOnAttempt {
                    succeed_on: 2,
                    calls: AtomicU32::new(0),
                }),
            )
            .await;
        let job_id = queue.enqueue("flaky", serde_json::json!({}), 3).await;

        drain(&queue).await;

        let job = queue.job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
        assert!(job.completed_at.is_some());
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn unknown_job_type_fails_without_retries() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        let job_id = queue.enqueue("mystery", serde_json::json!({}), 5).await;

        drain(&queue).await;

        let job = queue.job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.error.as_deref().unwrap().contains("no handler registered"));
    }

    #[tokio::test]
    async fn retried_job_keeps_its_place_at_the_head() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        queue
            .register_handler(
                "flaky",
                Arc::new(SucceedsOnAttempt {
                    succeed_on: 2,
                    calls: AtomicU32::new(0),
                }),
            )
            .await;
        struct AlwaysOk;
        #[async_trait]
        impl JobHandler for AlwaysOk {
            async fn handle(&self, _payload: &serde_json::Value) -> anyhow::Result<()> {
                Ok(())
            }
        }
        queue.register_handler("fine", Arc::new(AlwaysOk)).await;

        let first = queue.enqueue("flaky", serde_json::json!({}), 3).await;
        let second = queue.enqueue("fine", serde_json::json!({}), 3).await;

        // Tick 1: the flaky job fails and returns to the head of the queue.
        assert_eq!(queue.process_next().await, Some(first));
        // Tick 2: the retried job runs again before the younger job.
        assert_eq!(queue.process_next().await, Some(first));
        assert_eq!(queue.process_next().await, Some(second));

        assert_eq!(queue.job(first).await.unwrap().status, JobStatus::Completed);
        assert_eq!(queue.job(second).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn stats_count_by_status_and_type() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        queue.register_handler("doomed", Arc::new(AlwaysFails)).await;
        queue.enqueue("doomed", serde_json::json!({}), 1).await;
        queue.enqueue("idle", serde_json::json!({}), 1).await;

        assert!(queue.process_next().await.is_some());

        let stats = queue.stats().await;
        assert_eq!(stats.by_status.get("failed"), Some(&1));
        assert_eq!(stats.by_status.get("pending"), Some(&1));
        assert_eq!(stats.by_type.get("doomed"), Some(&1));
        assert_eq!(stats.by_type.get("idle"), Some(&1));
    }

    #[tokio::test]
    async fn lifecycle_events_reach_subscribers() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        queue.register_handler("doomed", Arc::new(AlwaysFails)).await;
        let mut events = queue.subscribe();

        queue.enqueue("doomed", serde_json::json!({}), 1).await;
        queue.process_next().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], QueueEvent::Created { .. }));
        assert!(matches!(seen[1], QueueEvent::Started { attempt: 1, .. }));
        assert!(matches!(
            seen[2],
            QueueEvent::Failed {
                will_retry: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn sweep_removes_terminal_jobs_after_retention() {
        let queue = TaskQueue::new(TaskQueueConfig {
            retention: Duration::ZERO,
            ..TaskQueueConfig::default()
        });
        queue.register_handler("doomed", Arc::new(AlwaysFails)).await;
        let done = queue.enqueue("doomed", serde_json::json!({}), 1).await;
        let waiting = queue.enqueue("doomed", serde_json::json!({}), 1).await;

        queue.process_next().await;
        queue.sweep_expired().await;

        assert!(queue.job(done).await.is_none());
        // Non-terminal jobs are never swept.
        assert!(queue.job(waiting).await.is_some());
    }
}

//! Named recurring tasks bound to cron expressions.
//!
//! Expressions use the six-field form (seconds first) that
//! `tokio-cron-scheduler` consumes. Handler failures are logged and never
//! stop the scheduler or sibling tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jobfeed_core::ScheduledTask;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown task `{0}`")]
    UnknownTask(String),
    #[error("cron scheduler error: {0}")]
    Cron(#[from] JobSchedulerError),
}

struct TaskEntry {
    task: ScheduledTask,
    handler: Arc<dyn TaskHandler>,
    /// Cron job id while the task is bound to a running scheduler.
    binding: Option<Uuid>,
}

/// Registry of named recurring tasks. Tasks stay registered across
/// `stop`/`start` cycles; only their cron bindings come and go.
#[derive(Default)]
pub struct Scheduler {
    entries: Mutex<BTreeMap<String, TaskEntry>>,
    runner: Mutex<Option<JobScheduler>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a task. Takes effect on the next `start` or
    /// `set_enabled` for an already-running scheduler.
    pub async fn register(&self, task: ScheduledTask, handler: Arc<dyn TaskHandler>) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            task.name.clone(),
            TaskEntry {
                task,
                handler,
                binding: None,
            },
        );
    }

    pub async fn status(&self) -> Vec<ScheduledTask> {
        let entries = self.entries.lock().await;
        entries.values().map(|entry| entry.task.clone()).collect()
    }

    /// Run a task's handler now, regardless of its enabled flag or cron
    /// schedule. Handler errors are logged, not returned; only an unknown
    /// name is an error.
    pub async fn trigger(&self, name: &str) -> Result<(), SchedulerError> {
        self.fire(name).await
    }

    async fn fire(&self, name: &str) -> Result<(), SchedulerError> {
        let handler = {
            let mut entries = self.entries.lock().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
            entry.task.last_run = Some(Utc::now());
            entry.handler.clone()
        };
        info!(task = name, "running scheduled task");
        if let Err(e) = handler.run().await {
            error!(task = name, error = %e, "scheduled task failed");
        }
        Ok(())
    }

    /// Bind every enabled task to its cron trigger and start firing.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut runner_slot = self.runner.lock().await;
        if runner_slot.is_some() {
            return Ok(());
        }
        let runner = JobScheduler::new().await?;
        {
            let mut entries = self.entries.lock().await;
            for (name, entry) in entries.iter_mut() {
                if entry.task.enabled {
                    entry.binding = Some(Self::bind(&runner, self, name, &entry.task.expression).await?);
                }
            }
        }
        runner.start().await?;
        *runner_slot = Some(runner);
        info!("scheduler started");
        Ok(())
    }

    async fn bind(
        runner: &JobScheduler,
        scheduler: &Arc<Self>,
        name: &str,
        expression: &str,
    ) -> Result<Uuid, SchedulerError> {
        let scheduler = Arc::clone(scheduler);
        let task_name = name.to_string();
        let job = Job::new_async(expression, move |_uuid, _lock| {
            let scheduler = scheduler.clone();
            let task_name = task_name.clone();
            Box::pin(async move {
                if let Err(e) = scheduler.fire(&task_name).await {
                    error!(task = %task_name, error = %e, "scheduled task firing failed");
                }
            })
        })?;
        Ok(runner.add(job).await?)
    }

    /// Unbind every task and shut the cron runtime down. Tasks remain
    /// registered so `start` can resume them later.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut runner_slot = self.runner.lock().await;
        if let Some(mut runner) = runner_slot.take() {
            runner.shutdown().await?;
        }
        let mut entries = self.entries.lock().await;
        for entry in entries.values_mut() {
            entry.binding = None;
        }
        info!("scheduler stopped");
        Ok(())
    }

    /// Toggle a single task's cron binding at runtime without touching the
    /// others. `trigger` keeps working for disabled tasks.
    pub async fn set_enabled(self: &Arc<Self>, name: &str, enabled: bool) -> Result<(), SchedulerError> {
        let mut runner_slot = self.runner.lock().await;
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
        if entry.task.enabled == enabled {
            return Ok(());
        }
        entry.task.enabled = enabled;
        if let Some(runner) = runner_slot.as_mut() {
            if enabled {
                let expression = entry.task.expression.clone();
                entry.binding = Some(Self::bind(runner, self, name, &expression).await?);
            } else if let Some(binding) = entry.binding.take() {
                runner.remove(&binding).await?;
            }
        }
        info!(task = name, enabled, "scheduled task toggled");
        Ok(())
    }
}

#[cfg(test)]
impl Scheduler {
    async fn is_bound(&self, name: &str) -> bool {
        let entries = self.entries.lock().await;
        entries.get(name).map(|e| e.binding.is_some()).unwrap_or(false)
    }
}

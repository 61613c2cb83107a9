//! The job handlers shipped with the engine and the default scheduled-task
//! registry that enqueues them.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use jobfeed_core::ScheduledTask;
use jobfeed_storage::ListingRepository;
use tracing::info;

use crate::config::EngineConfig;
use crate::manager::ExtractionManager;
use crate::queue::{JobHandler, TaskQueue};
use crate::scheduler::{Scheduler, TaskHandler};

pub const JOB_EXTRACT_ALL: &str = "extract_all";
pub const JOB_EXTRACT_SOURCE: &str = "extract_source";
pub const JOB_DEACTIVATE_STALE: &str = "deactivate_stale";

pub const TASK_EXTRACT_ALL: &str = "extract-all-sources";
pub const TASK_DEACTIVATE_STALE: &str = "deactivate-stale-listings";

/// Runs every registered extractor. Per-source failures are already
/// contained and audited by the manager, so this handler itself only fails
/// on infrastructure problems, never on a bad source.
pub struct ExtractAllHandler {
    manager: Arc<ExtractionManager>,
}

impl ExtractAllHandler {
    pub fn new(manager: Arc<ExtractionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl JobHandler for ExtractAllHandler {
    async fn handle(&self, _payload: &serde_json::Value) -> anyhow::Result<()> {
        let outcomes = self.manager.run_all().await;
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        let scraped: usize = outcomes.iter().map(|o| o.scraped).sum();
        info!(
            sources = outcomes.len(),
            succeeded, scraped, "extract_all job finished"
        );
        Ok(())
    }
}

/// Runs one source named in the payload (`{"source": "jobsdb"}`). A run
/// that produced nothing and failed makes the job fail, so the queue's
/// retry policy applies.
pub struct ExtractSourceHandler {
    manager: Arc<ExtractionManager>,
}

impl ExtractSourceHandler {
    pub fn new(manager: Arc<ExtractionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl JobHandler for ExtractSourceHandler {
    async fn handle(&self, payload: &serde_json::Value) -> anyhow::Result<()> {
        let source = payload
            .get("source")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("extract_source payload missing `source`"))?;
        let outcome = self.manager.run(source).await;
        if !outcome.success {
            return Err(anyhow!(
                "extraction of `{source}` failed: {}",
                outcome.errors.join("; ")
            ));
        }
        Ok(())
    }
}

/// Housekeeping: deactivate listings not re-observed within the window
/// (`{"days": 30}`, falling back to the configured default).
pub struct DeactivateStaleHandler {
    repository: Arc<dyn ListingRepository>,
    default_days: i64,
}

impl DeactivateStaleHandler {
    pub fn new(repository: Arc<dyn ListingRepository>, default_days: i64) -> Self {
        Self {
            repository,
            default_days,
        }
    }
}

#[async_trait]
impl JobHandler for DeactivateStaleHandler {
    async fn handle(&self, payload: &serde_json::Value) -> anyhow::Result<()> {
        let days = payload
            .get("days")
            .and_then(|v| v.as_i64())
            .unwrap_or(self.default_days);
        let affected = self.repository.deactivate_stale(days).await?;
        info!(days, affected, "deactivated stale listings");
        Ok(())
    }
}

/// Bind the engine's job types to their handlers.
pub async fn register_default_handlers(
    queue: &TaskQueue,
    manager: Arc<ExtractionManager>,
    repository: Arc<dyn ListingRepository>,
    default_stale_days: i64,
) {
    queue
        .register_handler(JOB_EXTRACT_ALL, Arc::new(ExtractAllHandler::new(manager.clone())))
        .await;
    queue
        .register_handler(JOB_EXTRACT_SOURCE, Arc::new(ExtractSourceHandler::new(manager)))
        .await;
    queue
        .register_handler(
            JOB_DEACTIVATE_STALE,
            Arc::new(DeactivateStaleHandler::new(repository, default_stale_days)),
        )
        .await;
}

/// A scheduled-task handler that enqueues a typed queue job when it fires.
pub struct EnqueueTaskHandler {
    queue: Arc<TaskQueue>,
    job_type: String,
    payload: serde_json::Value,
    max_attempts: u32,
}

impl EnqueueTaskHandler {
    pub fn new(
        queue: Arc<TaskQueue>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            job_type: job_type.into(),
            payload,
            max_attempts,
        }
    }
}

#[async_trait]
impl TaskHandler for EnqueueTaskHandler {
    async fn run(&self) -> anyhow::Result<()> {
        let job_id = self
            .queue
            .enqueue(&self.job_type, self.payload.clone(), self.max_attempts)
            .await;
        info!(job_type = %self.job_type, job_id = %job_id, "scheduled task enqueued job");
        Ok(())
    }
}

/// The static task registry built at process start.
pub async fn register_default_tasks(scheduler: &Scheduler, queue: Arc<TaskQueue>, config: &EngineConfig) {
    let max_attempts = queue.config().default_max_attempts;
    scheduler
        .register(
            ScheduledTask {
                name: TASK_EXTRACT_ALL.to_string(),
                expression: config.extract_cron.clone(),
                description: "Extract listings from every registered source".to_string(),
                enabled: true,
                last_run: None,
            },
            Arc::new(EnqueueTaskHandler::new(
                queue.clone(),
                JOB_EXTRACT_ALL,
                serde_json::json!({}),
                max_attempts,
            )),
        )
        .await;
    scheduler
        .register(
            ScheduledTask {
                name: TASK_DEACTIVATE_STALE.to_string(),
                expression: config.stale_cron.clone(),
                description: "Deactivate listings not re-observed recently".to_string(),
                enabled: true,
                last_run: None,
            },
            Arc::new(EnqueueTaskHandler::new(
                queue,
                JOB_DEACTIVATE_STALE,
                serde_json::json!({ "days": config.stale_days }),
                max_attempts,
            )),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::manager::ManagerConfig;
    use crate::queue::TaskQueueConfig;
    use jobfeed_core::JobStatus;
    use jobfeed_extractors::testing::{job_card, listing_page, test_profile, ScriptedBrowser};
    use jobfeed_extractors::{Extractor, SourceExtractor};
    use jobfeed_storage::MemoryListingRepository;
    use std::time::Duration;

    fn scripted_manager(
        browser: &Arc<ScriptedBrowser>,
        repository: &Arc<MemoryListingRepository>,
    ) -> Arc<ExtractionManager> {
        browser.set_page(
            "https://scripted.test/alpha",
            listing_page(&[job_card(Some("Alpha Job"), "Org", "/a")], None),
        );
        let extractor: Arc<dyn SourceExtractor> = Arc::new(Extractor::new(
            test_profile("alpha", "https://scripted.test/alpha", 1),
            browser.clone(),
            repository.clone(),
        ));
        Arc::new(ExtractionManager::new(
            vec![extractor],
            Arc::new(MemoryAuditSink::new()),
            ManagerConfig {
                source_delay: Duration::ZERO,
                chunk_delay: Duration::ZERO,
            },
        ))
    }

    #[tokio::test]
    async fn extract_source_job_round_trips_through_the_queue() {
        let browser = Arc::new(ScriptedBrowser::new());
        let repository = Arc::new(MemoryListingRepository::new());
        let manager = scripted_manager(&browser, &repository);

        let queue = TaskQueue::new(TaskQueueConfig::default());
        register_default_handlers(&queue, manager, repository.clone(), 30).await;

        let job_id = queue
            .enqueue(JOB_EXTRACT_SOURCE, serde_json::json!({ "source": "alpha" }), 3)
            .await;
        while queue.process_next().await.is_some() {}

        assert_eq!(queue.job(job_id).await.unwrap().status, JobStatus::Completed);
        assert_eq!(repository.count_active().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn extract_source_job_with_unknown_source_retries_then_fails() {
        let browser = Arc::new(ScriptedBrowser::new());
        let repository = Arc::new(MemoryListingRepository::new());
        let manager = scripted_manager(&browser, &repository);

        let queue = TaskQueue::new(TaskQueueConfig::default());
        register_default_handlers(&queue, manager, repository, 30).await;

        let job_id = queue
            .enqueue(JOB_EXTRACT_SOURCE, serde_json::json!({ "source": "ghost" }), 2)
            .await;
        while queue.process_next().await.is_some() {}

        let job = queue.job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert!(job.error.as_deref().unwrap().contains("unknown source"));
    }

    #[tokio::test]
    async fn default_tasks_enqueue_their_jobs_when_triggered() {
        let browser = Arc::new(ScriptedBrowser::new());
        let repository = Arc::new(MemoryListingRepository::new());
        let manager = scripted_manager(&browser, &repository);

        let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default()));
        register_default_handlers(&queue, manager, repository.clone(), 30).await;

        let scheduler = Arc::new(Scheduler::new());
        register_default_tasks(&scheduler, queue.clone(), &EngineConfig::default()).await;

        scheduler.trigger(TASK_EXTRACT_ALL).await.unwrap();
        scheduler.trigger(TASK_DEACTIVATE_STALE).await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.by_type.get(JOB_EXTRACT_ALL), Some(&1));
        assert_eq!(stats.by_type.get(JOB_DEACTIVATE_STALE), Some(&1));

        while queue.process_next().await.is_some() {}
        let stats = queue.stats().await;
        assert_eq!(stats.by_status.get("completed"), Some(&2));
    }
}

//! Orchestration for the JobFeed pipeline: the extraction manager, the
//! in-process task queue and the cron scheduler.
//!
//! ```text
//! Scheduler (cron firing or manual trigger)
//!     │
//!     └─► TaskQueue.enqueue(typed job)
//!             │
//!             └─► runner picks one job at a time
//!                     └─► JobHandler → ExtractionManager.run/run_all
//!                             └─► Extractor streams candidates into the
//!                                 listing repository; the outcome lands in
//!                                 the audit sink
//! ```

pub mod audit;
pub mod config;
pub mod handlers;
pub mod manager;
pub mod queue;
pub mod scheduler;

pub use audit::{AuditSink, JsonlAuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::EngineConfig;
pub use handlers::{
    register_default_handlers, register_default_tasks, JOB_DEACTIVATE_STALE, JOB_EXTRACT_ALL,
    JOB_EXTRACT_SOURCE, TASK_DEACTIVATE_STALE, TASK_EXTRACT_ALL,
};
pub use manager::{ExtractionManager, ManagerConfig};
pub use queue::{JobHandler, QueueEvent, QueueStats, TaskQueue, TaskQueueConfig};
pub use scheduler::{Scheduler, SchedulerError, TaskHandler};

pub const CRATE_NAME: &str = "jobfeed-engine";

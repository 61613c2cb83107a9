//! Core domain model for the JobFeed ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfeed-core";

/// Compensation range as advertised by a source site.
///
/// `raw` keeps the site's original text; `min`/`max` are best-effort parses
/// and may both be absent when the text carries no usable numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub raw: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// A not-yet-persisted listing extracted from a source page.
///
/// Owned by the extractor that produced it until handed to the repository.
/// `title`, `organization`, `url` and `source` are always present; an item
/// missing any of them is dropped at extraction time and never becomes a
/// candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingCandidate {
    pub title: String,
    pub organization: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub compensation: Option<Compensation>,
    pub employment_type: Option<String>,
    pub category: Option<String>,
    pub posted_at: Option<String>,
    pub deadline: Option<String>,
    pub url: String,
    pub source: String,
    pub extracted_at: DateTime<Utc>,
}

/// Canonical persisted listing.
///
/// Invariant: exactly one `Listing` exists per distinct `content_fingerprint`.
/// Re-observation updates `last_seen_at`, `reobserved_count` and the mutable
/// candidate fields; `first_seen_at` never changes after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub title: String,
    pub organization: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub compensation: Option<Compensation>,
    pub employment_type: Option<String>,
    pub category: Option<String>,
    pub posted_at: Option<String>,
    pub deadline: Option<String>,
    pub url: String,
    pub source: String,
    pub extracted_at: DateTime<Utc>,
    pub content_fingerprint: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub reobserved_count: i64,
    pub active: bool,
}

/// Aggregated result of one extractor run.
///
/// Serialized with camelCase keys because this struct is the audit record
/// consumed by external reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionOutcome {
    pub success: bool,
    pub scraped: usize,
    pub new: usize,
    pub updated: usize,
    pub errors: Vec<String>,
    pub source: String,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExtractionOutcome {
    /// Outcome for a run that failed before any item was attempted.
    pub fn failed(source: impl Into<String>, error: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let finished_at = Utc::now();
        Self {
            success: false,
            scraped: 0,
            new: 0,
            updated: 0,
            errors: vec![error.into()],
            source: source.into(),
            duration_seconds: duration_seconds(started_at, finished_at),
            started_at,
            finished_at,
        }
    }
}

/// Seconds elapsed between two instants, clamped at zero.
pub fn duration_seconds(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> f64 {
    let millis = finished_at.signed_duration_since(started_at).num_milliseconds();
    (millis.max(0) as f64) / 1000.0
}

/// Lifecycle status of a queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal statuses never transition again and become eligible for
    /// garbage collection after the retention window.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// A background job held by the in-process task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl QueueJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            payload,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
            failed_at: None,
            error: None,
        }
    }
}

/// A named recurring task registered with the scheduler.
///
/// Process-lifetime only; built from a static registry at startup and
/// mutated by enable/disable and by each firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub expression: String,
    pub description: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
}

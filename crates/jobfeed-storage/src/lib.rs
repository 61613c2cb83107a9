//! Listing deduplication store + page-automation capability for JobFeed.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobfeed_core::{Listing, ListingCandidate};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfeed-storage";

/// How much of the normalized description participates in the fingerprint.
/// Long enough to separate postings that differ in the visible summary,
/// short enough to tolerate tail drift between scrapes.
pub const DESCRIPTION_PREFIX_CHARS: usize = 120;

/// Lowercase, trim and collapse internal whitespace.
pub fn normalize_component(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic content fingerprint for a candidate.
///
/// Hashes the normalized title, organization, location and description
/// prefix. Stable across whitespace/case drift in the raw HTML; postings
/// that agree on all four normalized components collide into one listing,
/// which is a documented limitation of the pipeline.
pub fn fingerprint(candidate: &ListingCandidate) -> String {
    let title = normalize_component(&candidate.title);
    let organization = normalize_component(&candidate.organization);
    let location = normalize_component(candidate.location.as_deref().unwrap_or(""));
    let description = normalize_component(candidate.description.as_deref().unwrap_or(""))
        .chars()
        .take(DESCRIPTION_PREFIX_CHARS)
        .collect::<String>();

    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    hasher.update(organization.as_bytes());
    hasher.update(b"|");
    hasher.update(location.as_bytes());
    hasher.update(b"|");
    hasher.update(description.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Idempotent listing store keyed by content fingerprint.
#[async_trait]
pub trait ListingRepository: Send + Sync {
    /// Insert-or-update by fingerprint. Returns the stored listing and
    /// whether it was newly created. Re-ingesting identical content any
    /// number of times converges to one row whose `reobserved_count`
    /// reflects the number of re-observations.
    async fn upsert(&self, candidate: &ListingCandidate) -> Result<(Listing, bool), StoreError>;

    /// Flip `active = false` for listings not seen within `max_age_days`.
    /// Returns the number of rows affected.
    async fn deactivate_stale(&self, max_age_days: i64) -> Result<u64, StoreError>;

    async fn count_active(&self) -> Result<u64, StoreError>;
}

fn listing_from_candidate(candidate: &ListingCandidate, content_fingerprint: String, now: DateTime<Utc>) -> Listing {
    Listing {
        id: Uuid::new_v4(),
        title: candidate.title.clone(),
        organization: candidate.organization.clone(),
        location: candidate.location.clone(),
        description: candidate.description.clone(),
        compensation: candidate.compensation.clone(),
        employment_type: candidate.employment_type.clone(),
        category: candidate.category.clone(),
        posted_at: candidate.posted_at.clone(),
        deadline: candidate.deadline.clone(),
        url: candidate.url.clone(),
        source: candidate.source.clone(),
        extracted_at: candidate.extracted_at,
        content_fingerprint,
        first_seen_at: now,
        last_seen_at: now,
        reobserved_count: 0,
        active: true,
    }
}

fn apply_candidate(listing: &mut Listing, candidate: &ListingCandidate, now: DateTime<Utc>) {
    listing.title = candidate.title.clone();
    listing.organization = candidate.organization.clone();
    listing.location = candidate.location.clone();
    listing.description = candidate.description.clone();
    listing.compensation = candidate.compensation.clone();
    listing.employment_type = candidate.employment_type.clone();
    listing.category = candidate.category.clone();
    listing.posted_at = candidate.posted_at.clone();
    listing.deadline = candidate.deadline.clone();
    listing.url = candidate.url.clone();
    listing.source = candidate.source.clone();
    listing.extracted_at = candidate.extracted_at;
    listing.last_seen_at = now;
    listing.reobserved_count += 1;
    listing.active = true;
}

/// In-memory repository, used by tests and when no database is configured.
#[derive(Default)]
pub struct MemoryListingRepository {
    listings: Mutex<HashMap<String, Listing>>,
}

impl MemoryListingRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListingRepository for MemoryListingRepository {
    async fn upsert(&self, candidate: &ListingCandidate) -> Result<(Listing, bool), StoreError> {
        let key = fingerprint(candidate);
        let now = Utc::now();
        let mut listings = self.listings.lock().await;
        match listings.get_mut(&key) {
            Some(existing) => {
                apply_candidate(existing, candidate, now);
                Ok((existing.clone(), false))
            }
            None => {
                let listing = listing_from_candidate(candidate, key.clone(), now);
                listings.insert(key, listing.clone());
                Ok((listing, true))
            }
        }
    }

    async fn deactivate_stale(&self, max_age_days: i64) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        let mut affected = 0;
        let mut listings = self.listings.lock().await;
        for listing in listings.values_mut() {
            if listing.active && listing.last_seen_at < cutoff {
                listing.active = false;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn count_active(&self) -> Result<u64, StoreError> {
        let listings = self.listings.lock().await;
        Ok(listings.values().filter(|l| l.active).count() as u64)
    }
}

/// Postgres-backed repository. The unique constraint on
/// `content_fingerprint` is the backstop for concurrent upserts of the same
/// content: the losing writer's insert becomes an update inside one
/// `ON CONFLICT` statement.
pub struct PgListingRepository {
    pool: PgPool,
}

impl PgListingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn listing_from_row(row: &sqlx::postgres::PgRow) -> Result<Listing, sqlx::Error> {
        let compensation_raw: Option<String> = row.try_get("compensation_raw")?;
        let compensation = compensation_raw.map(|raw| jobfeed_core::Compensation {
            raw,
            min: row.try_get("compensation_min").unwrap_or(None),
            max: row.try_get("compensation_max").unwrap_or(None),
        });
        Ok(Listing {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            organization: row.try_get("organization")?,
            location: row.try_get("location")?,
            description: row.try_get("description")?,
            compensation,
            employment_type: row.try_get("employment_type")?,
            category: row.try_get("category")?,
            posted_at: row.try_get("posted_at")?,
            deadline: row.try_get("deadline")?,
            url: row.try_get("url")?,
            source: row.try_get("source")?,
            extracted_at: row.try_get("extracted_at")?,
            content_fingerprint: row.try_get("content_fingerprint")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            reobserved_count: row.try_get("reobserved_count")?,
            active: row.try_get("active")?,
        })
    }
}

#[async_trait]
impl ListingRepository for PgListingRepository {
    async fn upsert(&self, candidate: &ListingCandidate) -> Result<(Listing, bool), StoreError> {
        let key = fingerprint(candidate);
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO listings (
                id, title, organization, location, description,
                compensation_raw, compensation_min, compensation_max,
                employment_type, category, posted_at, deadline,
                url, source, extracted_at, content_fingerprint,
                first_seen_at, last_seen_at, reobserved_count, active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $17, 0, TRUE)
            ON CONFLICT (content_fingerprint) DO UPDATE SET
                title = EXCLUDED.title,
                organization = EXCLUDED.organization,
                location = EXCLUDED.location,
                description = EXCLUDED.description,
                compensation_raw = EXCLUDED.compensation_raw,
                compensation_min = EXCLUDED.compensation_min,
                compensation_max = EXCLUDED.compensation_max,
                employment_type = EXCLUDED.employment_type,
                category = EXCLUDED.category,
                posted_at = EXCLUDED.posted_at,
                deadline = EXCLUDED.deadline,
                url = EXCLUDED.url,
                source = EXCLUDED.source,
                extracted_at = EXCLUDED.extracted_at,
                last_seen_at = EXCLUDED.last_seen_at,
                reobserved_count = listings.reobserved_count + 1,
                active = TRUE
            RETURNING id, title, organization, location, description,
                      compensation_raw, compensation_min, compensation_max,
                      employment_type, category, posted_at, deadline,
                      url, source, extracted_at, content_fingerprint,
                      first_seen_at, last_seen_at, reobserved_count, active
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&candidate.title)
        .bind(&candidate.organization)
        .bind(&candidate.location)
        .bind(&candidate.description)
        .bind(candidate.compensation.as_ref().map(|c| c.raw.clone()))
        .bind(candidate.compensation.as_ref().and_then(|c| c.min))
        .bind(candidate.compensation.as_ref().and_then(|c| c.max))
        .bind(&candidate.employment_type)
        .bind(&candidate.category)
        .bind(&candidate.posted_at)
        .bind(&candidate.deadline)
        .bind(&candidate.url)
        .bind(&candidate.source)
        .bind(candidate.extracted_at)
        .bind(&key)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let listing = Self::listing_from_row(&row)?;
        let is_new = listing.reobserved_count == 0;
        debug!(source = %listing.source, fingerprint = %key, is_new, "upserted listing");
        Ok((listing, is_new))
    }

    async fn deactivate_stale(&self, max_age_days: i64) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        let result = sqlx::query("UPDATE listings SET active = FALSE WHERE active AND last_seen_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_active(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM listings WHERE active")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u64)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("building http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("launching browser: {0}")]
    Launch(String),
}

#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("request for {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("navigation to {url} timed out")]
    Timeout { url: String },
    #[error("session already closed while navigating to {url}")]
    SessionClosed { url: String },
}

impl NavigationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            NavigationError::Request { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            NavigationError::HttpStatus { status, .. } => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
            }
            NavigationError::Timeout { .. } => true,
            NavigationError::SessionClosed { .. } => false,
        }
    }
}

/// A fetched page, ready for selector-based extraction.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub url: String,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
}

/// Page-automation capability. Implementations own whatever machinery is
/// needed to turn a URL into rendered HTML.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, SessionError>;
}

/// One exclusive browsing session. The caller that opened it must call
/// `close` on every exit path.
#[async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str) -> Result<PageSnapshot, NavigationError>;
    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct HttpBrowserConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpBrowserConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// HTTP-backed browser. Each session gets its own client with a cookie
/// store, so state accumulated while paginating stays scoped to the run.
pub struct HttpBrowser {
    config: HttpBrowserConfig,
}

impl HttpBrowser {
    pub fn new(config: HttpBrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(self.config.timeout);
        if let Some(user_agent) = &self.config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        Ok(Box::new(HttpBrowserSession { client: Some(client) }))
    }
}

struct HttpBrowserSession {
    client: Option<reqwest::Client>,
}

#[async_trait]
impl BrowserSession for HttpBrowserSession {
    async fn goto(&mut self, url: &str) -> Result<PageSnapshot, NavigationError> {
        let Some(client) = &self.client else {
            return Err(NavigationError::SessionClosed { url: url.to_string() });
        };
        let response = client.get(url).send().await.map_err(|source| {
            if source.is_timeout() {
                NavigationError::Timeout { url: url.to_string() }
            } else {
                NavigationError::Request {
                    url: url.to_string(),
                    source,
                }
            }
        })?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(NavigationError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let html = response.text().await.map_err(|source| NavigationError::Request {
            url: final_url.clone(),
            source,
        })?;
        Ok(PageSnapshot {
            url: final_url,
            html,
            fetched_at: Utc::now(),
        })
    }

    async fn close(&mut self) {
        self.client = None;
    }
}

/// Retry schedule for page navigation: `base_delay × attempt`, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after the given attempt (counted from 1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(attempt.max(1));
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, organization: &str) -> ListingCandidate {
        ListingCandidate {
            title: title.to_string(),
            organization: organization.to_string(),
            location: Some("Kowloon".to_string()),
            description: Some("Maintain the data ingestion platform.".to_string()),
            compensation: None,
            employment_type: Some("Full Time".to_string()),
            category: None,
            posted_at: None,
            deadline: None,
            url: "https://example.com/job/1".to_string(),
            source: "jobsdb".to_string(),
            extracted_at: Utc::now(),
        }
    }

    #[test]
    fn fingerprint_ignores_case_and_whitespace_drift() {
        let a = candidate("Senior  Rust Engineer", "Acme Ltd");
        let mut b = candidate("senior rust engineer", "ACME LTD");
        b.location = Some("  kowloon ".to_string());
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_distinguishes_organizations() {
        let a = candidate("Senior Rust Engineer", "Acme Ltd");
        let b = candidate("Senior Rust Engineer", "Globex Ltd");
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_only_reads_the_description_prefix() {
        let shared: String = "x ".repeat(DESCRIPTION_PREFIX_CHARS);
        let mut a = candidate("Engineer", "Acme Ltd");
        let mut b = candidate("Engineer", "Acme Ltd");
        a.description = Some(format!("{shared} tail one"));
        b.description = Some(format!("{shared} tail two"));
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let mut c = candidate("Engineer", "Acme Ltd");
        c.description = Some("a different summary entirely".to_string());
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let repo = MemoryListingRepository::new();
        let c = candidate("Engineer", "Acme Ltd");

        let (first, is_new) = repo.upsert(&c).await.unwrap();
        assert!(is_new);
        assert_eq!(first.reobserved_count, 0);

        let (second, is_new) = repo.upsert(&c).await.unwrap();
        assert!(!is_new);
        assert_eq!(second.reobserved_count, 1);
        assert_eq!(second.first_seen_at, first.first_seen_at);
        assert_eq!(second.id, first.id);
        assert!(second.last_seen_at >= first.last_seen_at);
    }

    #[tokio::test]
    async fn reobservation_overwrites_mutable_fields() {
        let repo = MemoryListingRepository::new();
        let c = candidate("Engineer", "Acme Ltd");
        repo.upsert(&c).await.unwrap();

        let mut updated = c.clone();
        updated.employment_type = Some("Contract".to_string());
        updated.url = "https://example.com/job/1?ref=refresh".to_string();
        let (listing, is_new) = repo.upsert(&updated).await.unwrap();
        assert!(!is_new);
        assert_eq!(listing.employment_type.as_deref(), Some("Contract"));
        assert_eq!(listing.url, "https://example.com/job/1?ref=refresh");
    }

    #[tokio::test]
    async fn deactivate_stale_flips_old_listings_only() {
        let repo = MemoryListingRepository::new();
        repo.upsert(&candidate("Engineer", "Acme Ltd")).await.unwrap();

        assert_eq!(repo.deactivate_stale(30).await.unwrap(), 0);
        assert_eq!(repo.count_active().await.unwrap(), 1);

        // A zero-day window puts the cutoff at "now", so everything already
        // observed counts as stale.
        assert_eq!(repo.deactivate_stale(0).await.unwrap(), 1);
        assert_eq!(repo.count_active().await.unwrap(), 0);

        assert_eq!(repo.deactivate_stale(0).await.unwrap(), 0);
    }

    #[test]
    fn backoff_grows_linearly_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(400));
    }
}

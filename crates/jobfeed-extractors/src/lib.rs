//! Per-source extraction: source profiles, selector-driven parsing and the
//! generic extractor that streams candidates into the listing repository.
//!
//! There is one `Extractor` implementation; source-specific behavior lives
//! entirely in [`SourceProfile`] configuration plus small [`SourceQuirk`]
//! strategies, never in per-source types.

pub mod testing;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use jobfeed_core::{duration_seconds, Compensation, ExtractionOutcome, ListingCandidate};
use jobfeed_storage::{
    BackoffPolicy, Browser, BrowserSession, ListingRepository, NavigationError, PageSnapshot,
};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "jobfeed-extractors";

/// CSS selectors describing where listing fields live on a source's pages.
/// `container`, `item`, `title`, `organization` and `link` are required for
/// a source to be scrapeable at all; the rest are best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorMap {
    pub container: String,
    pub item: String,
    pub title: String,
    pub organization: String,
    pub link: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub compensation: Option<String>,
    #[serde(default)]
    pub employment_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub posted_at: Option<String>,
    #[serde(default)]
    pub deadline: Option<String>,
}

/// How a source paginates its result list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationRule {
    /// Selector for the "next page" control.
    pub next: String,
    pub max_pages: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTunables {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_navigation_timeout_ms() -> u64 {
    30_000
}

fn default_page_delay_ms() -> u64 {
    1_500
}

impl Default for SourceTunables {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            page_delay_ms: default_page_delay_ms(),
        }
    }
}

/// Small per-source post-processing strategies. These cover the quirks that
/// would otherwise push a source toward its own extractor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceQuirk {
    /// Drop trailing badge text some boards append to titles ("NEW", "HOT").
    StripTitleBadge,
    /// Split "Organization - Location" composite cells when the page has no
    /// dedicated location element.
    SplitOrganizationLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub listing_url: String,
    pub selectors: SelectorMap,
    pub pagination: PaginationRule,
    #[serde(default)]
    pub tunables: SourceTunables,
    #[serde(default)]
    pub quirks: Vec<SourceQuirk>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct SourceRegistryFile {
    sources: Vec<SourceProfile>,
}

/// Load source profiles from a YAML registry file.
pub fn load_source_registry(path: impl AsRef<Path>) -> anyhow::Result<Vec<SourceProfile>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: SourceRegistryFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed.sources)
}

/// Merge registry overrides into the built-in profiles. An override with a
/// known `source_id` replaces the built-in; unknown ids are appended.
pub fn merge_profiles(builtin: Vec<SourceProfile>, overrides: Vec<SourceProfile>) -> Vec<SourceProfile> {
    let mut merged = builtin;
    for profile in overrides {
        match merged.iter_mut().find(|p| p.source_id == profile.source_id) {
            Some(slot) => *slot = profile,
            None => merged.push(profile),
        }
    }
    merged
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(scope: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn optional_text(scope: &ElementRef<'_>, selector: &Option<String>) -> Result<Option<String>, ExtractError> {
    match selector {
        Some(selector) => Ok(first_text(scope, &parse_selector(selector)?)),
        None => Ok(None),
    }
}

/// Pull every number out of free salary text, tolerating thousands
/// separators ("HK$15,000 - 20,000" yields 15000 and 20000).
pub fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    let chars: Vec<char> = text.chars().collect();
    for (i, ch) in chars.iter().enumerate() {
        if ch.is_ascii_digit() {
            current.push(*ch);
            continue;
        }
        if *ch == ','
            && !current.is_empty()
            && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
        {
            continue;
        }
        if *ch == '.' && !seen_dot && !current.is_empty() {
            current.push(*ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
            out.push(v);
        }
    }
    out
}

/// Turn raw salary text into a compensation range, keeping the raw text.
pub fn parse_compensation(text: &str) -> Option<Compensation> {
    let raw = text.trim().to_string();
    if raw.is_empty() {
        return None;
    }
    let numbers = extract_numbers(&raw);
    let min = numbers.first().copied();
    let max = numbers.get(1).copied().or(min);
    Some(Compensation { raw, min, max })
}

fn apply_quirks(quirks: &[SourceQuirk], candidate: &mut ListingCandidate) {
    for quirk in quirks {
        match quirk {
            SourceQuirk::StripTitleBadge => {
                for badge in ["NEW", "New", "HOT", "Hot"] {
                    if let Some(stripped) = candidate.title.strip_suffix(badge) {
                        candidate.title = stripped.trim_end().to_string();
                    }
                }
            }
            SourceQuirk::SplitOrganizationLocation => {
                if candidate.location.is_none() {
                    if let Some((organization, location)) = candidate.organization.rsplit_once(" - ") {
                        candidate.location = text_or_none(location.to_string());
                        candidate.organization = organization.trim().to_string();
                    }
                }
            }
        }
    }
}

fn resolve_url(base: &str, href: &str) -> Option<String> {
    match Url::parse(base) {
        Ok(base) => base.join(href).ok().map(|u| u.to_string()),
        Err(_) => Some(href.to_string()),
    }
}

/// Everything one page yields: extracted candidates, the resolved next-page
/// URL (absent when pagination should stop), how many items were skipped for
/// missing required fields, and page-level extraction errors.
#[derive(Debug, Default)]
pub struct ParsedPage {
    pub candidates: Vec<ListingCandidate>,
    pub next_url: Option<String>,
    pub skipped: usize,
    pub page_errors: Vec<String>,
}

/// Selector-driven extraction of one listing page. Only a malformed selector
/// in the profile is a hard error; a missing container is a page-level
/// extraction error and pagination is still attempted.
pub fn parse_listing_page(snapshot: &PageSnapshot, profile: &SourceProfile) -> Result<ParsedPage, ExtractError> {
    let document = Html::parse_document(&snapshot.html);
    let selectors = &profile.selectors;
    let container_selector = parse_selector(&selectors.container)?;
    let item_selector = parse_selector(&selectors.item)?;
    let title_selector = parse_selector(&selectors.title)?;
    let organization_selector = parse_selector(&selectors.organization)?;
    let link_selector = parse_selector(&selectors.link)?;
    let next_selector = parse_selector(&profile.pagination.next)?;

    let mut parsed = ParsedPage {
        next_url: next_page_url(&document, &snapshot.url, &next_selector),
        ..ParsedPage::default()
    };

    let Some(container) = document.select(&container_selector).next() else {
        parsed
            .page_errors
            .push(format!("listing container `{}` not found", selectors.container));
        return Ok(parsed);
    };

    for item in container.select(&item_selector) {
        let title = first_text(&item, &title_selector);
        let organization = first_text(&item, &organization_selector);
        let link = first_attr(&item, &link_selector, "href")
            .and_then(|href| resolve_url(&snapshot.url, &href));

        // Items missing a required field are skipped, not reported.
        let (Some(title), Some(organization), Some(url)) = (title, organization, link) else {
            parsed.skipped += 1;
            continue;
        };

        let compensation = optional_text(&item, &selectors.compensation)?
            .as_deref()
            .and_then(parse_compensation);
        let mut candidate = ListingCandidate {
            title,
            organization,
            location: optional_text(&item, &selectors.location)?,
            description: optional_text(&item, &selectors.description)?,
            compensation,
            employment_type: optional_text(&item, &selectors.employment_type)?,
            category: optional_text(&item, &selectors.category)?,
            posted_at: optional_text(&item, &selectors.posted_at)?,
            deadline: optional_text(&item, &selectors.deadline)?,
            url,
            source: profile.source_id.clone(),
            extracted_at: snapshot.fetched_at,
        };
        apply_quirks(&profile.quirks, &mut candidate);
        parsed.candidates.push(candidate);
    }

    Ok(parsed)
}

/// Resolve the next-page URL, treating an absent, disabled or hidden control
/// (or one without a usable href) as the normal end of pagination.
fn next_page_url(document: &Html, page_url: &str, next_selector: &Selector) -> Option<String> {
    let control = document.select(next_selector).next()?;
    let element = control.value();
    if element.attr("disabled").is_some() || element.attr("hidden").is_some() {
        return None;
    }
    if element.attr("aria-disabled") == Some("true") {
        return None;
    }
    if element.classes().any(|class| class.eq_ignore_ascii_case("disabled")) {
        return None;
    }
    let href = element.attr("href").map(str::trim)?;
    if href.is_empty() || href == "#" {
        return None;
    }
    resolve_url(page_url, href)
}

/// The per-source extraction capability consumed by the orchestration
/// layer. One implementation per source is registered with the extraction
/// manager; [`Extractor`] is the selector-driven implementation every
/// shipped source uses.
#[async_trait::async_trait]
pub trait SourceExtractor: Send + Sync {
    fn source_id(&self) -> &str;
    async fn scrape(&self) -> ExtractionOutcome;
}

#[derive(Debug, Default)]
struct RunTally {
    scraped: usize,
    new: usize,
    updated: usize,
    errors: Vec<String>,
}

/// One extractor per source. Owns a single browsing session for the duration
/// of `scrape` and releases it on every exit path.
pub struct Extractor {
    profile: SourceProfile,
    browser: Arc<dyn Browser>,
    repository: Arc<dyn ListingRepository>,
}

impl Extractor {
    pub fn new(profile: SourceProfile, browser: Arc<dyn Browser>, repository: Arc<dyn ListingRepository>) -> Self {
        Self {
            profile,
            browser,
            repository,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.profile.source_id
    }

    pub fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    /// Run a full extraction pass against this source.
    ///
    /// Failures are contained: a session-open failure aborts the run with a
    /// failed outcome; navigation exhaustion stops remaining pages but keeps
    /// what was already saved; per-item problems never abort a page. The run
    /// counts as a success when there were no errors or at least one item
    /// was scraped.
    pub async fn scrape(&self) -> ExtractionOutcome {
        let started_at = Utc::now();
        let source = self.profile.source_id.clone();
        info!(source = %source, "starting extraction");

        let mut session = match self.browser.open().await {
            Ok(session) => session,
            Err(e) => {
                warn!(source = %source, error = %e, "failed to open browsing session");
                return ExtractionOutcome::failed(source, format!("opening browsing session: {e}"), started_at);
            }
        };

        let mut tally = RunTally::default();
        self.scrape_pages(&mut *session, &mut tally).await;
        session.close().await;

        let finished_at = Utc::now();
        let success = tally.errors.is_empty() || tally.scraped > 0;
        info!(
            source = %source,
            scraped = tally.scraped,
            new = tally.new,
            updated = tally.updated,
            errors = tally.errors.len(),
            success,
            "extraction finished"
        );
        ExtractionOutcome {
            success,
            scraped: tally.scraped,
            new: tally.new,
            updated: tally.updated,
            errors: tally.errors,
            source,
            duration_seconds: duration_seconds(started_at, finished_at),
            started_at,
            finished_at,
        }
    }

    async fn scrape_pages(&self, session: &mut dyn BrowserSession, tally: &mut RunTally) {
        let mut url = self.profile.listing_url.clone();
        let max_pages = self.profile.pagination.max_pages.max(1);
        let page_delay = Duration::from_millis(self.profile.tunables.page_delay_ms);

        for page_no in 1..=max_pages {
            if page_no > 1 && !page_delay.is_zero() {
                tokio::time::sleep(page_delay).await;
            }

            let snapshot = match self.navigate(session, &url).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    // Exhausted retries: fatal for this and all remaining
                    // pages, but items already saved stay saved.
                    tally.errors.push(format!("page {page_no}: {e}"));
                    return;
                }
            };

            let parsed = match parse_listing_page(&snapshot, &self.profile) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // A malformed selector will fail every page the same way.
                    tally.errors.push(format!("page {page_no}: {e}"));
                    return;
                }
            };

            if parsed.skipped > 0 {
                debug!(source = %self.profile.source_id, page = page_no, skipped = parsed.skipped, "skipped incomplete items");
            }
            for error in parsed.page_errors {
                tally.errors.push(format!("page {page_no}: {error}"));
            }

            tally.scraped += parsed.candidates.len();
            for candidate in parsed.candidates {
                match self.repository.upsert(&candidate).await {
                    Ok((_, true)) => tally.new += 1,
                    Ok((_, false)) => tally.updated += 1,
                    Err(e) => tally
                        .errors
                        .push(format!("page {page_no}: saving \"{}\": {e}", candidate.title)),
                }
            }

            match parsed.next_url {
                Some(next) => url = next,
                None => {
                    debug!(source = %self.profile.source_id, pages = page_no, "no next control, pagination complete");
                    return;
                }
            }
        }
        debug!(source = %self.profile.source_id, max_pages, "page cap reached");
    }

    /// Navigate with bounded, timeboxed retries. Attempts are counted from 1
    /// up to `max_retries`; the delay before each retry grows linearly.
    async fn navigate(&self, session: &mut dyn BrowserSession, url: &str) -> Result<PageSnapshot, NavigationError> {
        let tunables = &self.profile.tunables;
        let policy = BackoffPolicy {
            max_retries: tunables.max_retries.max(1),
            base_delay: Duration::from_millis(tunables.base_delay_ms),
            ..BackoffPolicy::default()
        };
        let timebox = Duration::from_millis(tunables.navigation_timeout_ms);

        let mut attempt = 1;
        loop {
            let error = match tokio::time::timeout(timebox, session.goto(url)).await {
                Ok(Ok(snapshot)) => return Ok(snapshot),
                Ok(Err(e)) => e,
                Err(_) => NavigationError::Timeout { url: url.to_string() },
            };
            if attempt >= policy.max_retries || !error.is_retryable() {
                return Err(error);
            }
            warn!(
                source = %self.profile.source_id,
                url,
                attempt,
                error = %error,
                "navigation failed, retrying"
            );
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait::async_trait]
impl SourceExtractor for Extractor {
    fn source_id(&self) -> &str {
        &self.profile.source_id
    }

    async fn scrape(&self) -> ExtractionOutcome {
        Extractor::scrape(self).await
    }
}

/// Build the extractor set for every enabled profile.
pub fn build_extractors(
    profiles: &[SourceProfile],
    browser: Arc<dyn Browser>,
    repository: Arc<dyn ListingRepository>,
) -> Vec<Arc<dyn SourceExtractor>> {
    profiles
        .iter()
        .filter(|profile| profile.enabled)
        .map(|profile| {
            Arc::new(Extractor::new(profile.clone(), browser.clone(), repository.clone()))
                as Arc<dyn SourceExtractor>
        })
        .collect()
}

pub fn builtin_profiles() -> Vec<SourceProfile> {
    vec![
        jobsdb_profile(),
        jobstreet_profile(),
        ctgoodjobs_profile(),
        goodjobs_profile(),
    ]
}

pub fn profile_for_source(source_id: &str) -> Option<SourceProfile> {
    builtin_profiles().into_iter().find(|p| p.source_id == source_id)
}

pub fn jobsdb_profile() -> SourceProfile {
    SourceProfile {
        source_id: "jobsdb".to_string(),
        display_name: "JobsDB".to_string(),
        enabled: true,
        listing_url: "https://hk.jobsdb.com/jobs".to_string(),
        selectors: SelectorMap {
            container: "div[data-automation=\"searchResults\"]".to_string(),
            item: "article[data-automation=\"jobCard\"]".to_string(),
            title: "a[data-automation=\"jobTitle\"]".to_string(),
            organization: "a[data-automation=\"jobCompany\"]".to_string(),
            link: "a[data-automation=\"jobTitle\"]".to_string(),
            location: Some("span[data-automation=\"jobLocation\"]".to_string()),
            description: Some("span[data-automation=\"jobShortDescription\"]".to_string()),
            compensation: Some("span[data-automation=\"jobSalary\"]".to_string()),
            employment_type: Some("span[data-automation=\"jobWorkType\"]".to_string()),
            category: Some("span[data-automation=\"jobClassification\"]".to_string()),
            posted_at: Some("span[data-automation=\"jobListingDate\"]".to_string()),
            deadline: None,
        },
        pagination: PaginationRule {
            next: "a[data-automation=\"page-next\"]".to_string(),
            max_pages: 5,
        },
        tunables: SourceTunables::default(),
        quirks: vec![],
    }
}

pub fn jobstreet_profile() -> SourceProfile {
    SourceProfile {
        source_id: "jobstreet".to_string(),
        display_name: "JobStreet".to_string(),
        enabled: true,
        listing_url: "https://www.jobstreet.com.sg/jobs".to_string(),
        selectors: SelectorMap {
            container: "div[data-search-results]".to_string(),
            item: "article[data-card-type=\"JobCard\"]".to_string(),
            title: "a[data-automation=\"job-card-title\"]".to_string(),
            organization: "span[data-automation=\"job-card-company\"]".to_string(),
            link: "a[data-automation=\"job-card-title\"]".to_string(),
            location: Some("span[data-automation=\"job-card-location\"]".to_string()),
            description: Some("div[data-automation=\"job-card-teaser\"]".to_string()),
            compensation: Some("span[data-automation=\"job-card-salary\"]".to_string()),
            employment_type: None,
            category: Some("span[data-automation=\"job-card-classification\"]".to_string()),
            posted_at: Some("time".to_string()),
            deadline: None,
        },
        pagination: PaginationRule {
            next: "a[aria-label=\"Next\"]".to_string(),
            max_pages: 5,
        },
        tunables: SourceTunables::default(),
        quirks: vec![SourceQuirk::StripTitleBadge],
    }
}

pub fn ctgoodjobs_profile() -> SourceProfile {
    SourceProfile {
        source_id: "ctgoodjobs".to_string(),
        display_name: "CTgoodjobs".to_string(),
        enabled: true,
        listing_url: "https://www.ctgoodjobs.hk/jobs".to_string(),
        selectors: SelectorMap {
            container: "ul.job-result-list".to_string(),
            item: "li.job-result-item".to_string(),
            title: "h2.job-title a".to_string(),
            organization: "div.job-company".to_string(),
            link: "h2.job-title a".to_string(),
            location: Some("div.job-location".to_string()),
            description: Some("div.job-snippet".to_string()),
            compensation: Some("div.job-salary".to_string()),
            employment_type: Some("div.job-type".to_string()),
            category: None,
            posted_at: Some("span.job-posted".to_string()),
            deadline: Some("span.job-deadline".to_string()),
        },
        pagination: PaginationRule {
            next: "a.pagination-next".to_string(),
            max_pages: 4,
        },
        tunables: SourceTunables {
            page_delay_ms: 2_500,
            ..SourceTunables::default()
        },
        quirks: vec![SourceQuirk::SplitOrganizationLocation],
    }
}

pub fn goodjobs_profile() -> SourceProfile {
    SourceProfile {
        source_id: "goodjobs".to_string(),
        display_name: "GoodJobs".to_string(),
        enabled: true,
        listing_url: "https://www.goodjobs.hk/en/jobs".to_string(),
        selectors: SelectorMap {
            container: "section#vacancy-list".to_string(),
            item: "div.vacancy-row".to_string(),
            title: "a.vacancy-title".to_string(),
            organization: "span.vacancy-employer".to_string(),
            link: "a.vacancy-title".to_string(),
            location: Some("span.vacancy-district".to_string()),
            description: None,
            compensation: Some("span.vacancy-salary".to_string()),
            employment_type: Some("span.vacancy-nature".to_string()),
            category: Some("span.vacancy-industry".to_string()),
            posted_at: Some("span.vacancy-date".to_string()),
            deadline: None,
        },
        pagination: PaginationRule {
            next: "li.next > a".to_string(),
            max_pages: 3,
        },
        tunables: SourceTunables::default(),
        quirks: vec![],
    }
}

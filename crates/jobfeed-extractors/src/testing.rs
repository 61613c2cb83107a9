//! Scripted page-automation for exercising extraction without a network.
//!
//! `ScriptedBrowser` serves canned HTML keyed by URL, can fail session opens
//! and navigations on demand, and keeps counters (navigations, open and
//! active sessions, peak concurrency) that tests assert against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobfeed_storage::{Browser, BrowserSession, NavigationError, PageSnapshot, SessionError};

use crate::{PaginationRule, SelectorMap, SourceProfile, SourceTunables};

#[derive(Default)]
struct ScriptedState {
    pages: Mutex<HashMap<String, String>>,
    navigation_failures: Mutex<HashMap<String, u32>>,
    open_failures: AtomicU32,
    opened: AtomicUsize,
    navigations: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    goto_delay_ms: AtomicU64,
}

#[derive(Default, Clone)]
pub struct ScriptedBrowser {
    state: Arc<ScriptedState>,
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_page(&self, url: impl Into<String>, html: impl Into<String>) {
        self.state
            .pages
            .lock()
            .expect("pages lock")
            .insert(url.into(), html.into());
    }

    /// Make the next `n` session opens fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.open_failures.store(n, Ordering::SeqCst);
    }

    /// Answer 503 for `url` the next `times` navigations.
    pub fn fail_navigation(&self, url: impl Into<String>, times: u32) {
        self.state
            .navigation_failures
            .lock()
            .expect("failures lock")
            .insert(url.into(), times);
    }

    /// Delay every navigation, to keep sessions observably overlapping.
    pub fn set_goto_delay(&self, delay: Duration) {
        self.state
            .goto_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> usize {
        self.state.navigations.load(Ordering::SeqCst)
    }

    /// Sessions opened but not yet closed. Zero after a well-behaved run.
    pub fn active_sessions(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open sessions observed.
    pub fn peak_active_sessions(&self) -> usize {
        self.state.peak_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Browser for ScriptedBrowser {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let failed = self
            .state
            .open_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SessionError::Launch("scripted open failure".to_string()));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_active.fetch_max(active, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct ScriptedSession {
    state: Arc<ScriptedState>,
    closed: bool,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn goto(&mut self, url: &str) -> Result<PageSnapshot, NavigationError> {
        if self.closed {
            return Err(NavigationError::SessionClosed { url: url.to_string() });
        }
        self.state.navigations.fetch_add(1, Ordering::SeqCst);

        let delay_ms = self.state.goto_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        {
            let mut failures = self.state.navigation_failures.lock().expect("failures lock");
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining = remaining.saturating_sub(1);
                    return Err(NavigationError::HttpStatus {
                        status: 503,
                        url: url.to_string(),
                    });
                }
            }
        }

        let html = self.state.pages.lock().expect("pages lock").get(url).cloned();
        match html {
            Some(html) => Ok(PageSnapshot {
                url: url.to_string(),
                html,
                fetched_at: Utc::now(),
            }),
            None => Err(NavigationError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A profile matching the markup produced by [`job_card`]/[`listing_page`],
/// tuned for fast tests.
pub fn test_profile(source_id: &str, listing_url: &str, max_pages: u32) -> SourceProfile {
    SourceProfile {
        source_id: source_id.to_string(),
        display_name: source_id.to_string(),
        enabled: true,
        listing_url: listing_url.to_string(),
        selectors: SelectorMap {
            container: "div.job-list".to_string(),
            item: "div.job-card".to_string(),
            title: "h3.job-title".to_string(),
            organization: "span.employer".to_string(),
            link: "a.job-link".to_string(),
            location: Some("span.district".to_string()),
            description: Some("p.summary".to_string()),
            compensation: Some("span.salary".to_string()),
            employment_type: None,
            category: None,
            posted_at: None,
            deadline: None,
        },
        pagination: PaginationRule {
            next: "a.pager-next".to_string(),
            max_pages,
        },
        tunables: SourceTunables {
            max_retries: 3,
            base_delay_ms: 1,
            navigation_timeout_ms: 2_000,
            page_delay_ms: 0,
        },
        quirks: Vec::new(),
    }
}

/// One listing card in the [`test_profile`] markup. Pass `None` for the
/// title to produce an item missing a required field.
pub fn job_card(title: Option<&str>, organization: &str, href: &str) -> String {
    let title_html = title
        .map(|t| format!("<h3 class=\"job-title\">{t}</h3>"))
        .unwrap_or_default();
    format!(
        "<div class=\"job-card\">{title_html}<span class=\"employer\">{organization}</span><a class=\"job-link\" href=\"{href}\">View</a></div>"
    )
}

/// A full listing page wrapping the given cards, with an optional next-page
/// control.
pub fn listing_page(cards: &[String], next_href: Option<&str>) -> String {
    let next_html = next_href
        .map(|href| format!("<a class=\"pager-next\" href=\"{href}\">Next</a>"))
        .unwrap_or_default();
    format!(
        "<html><body><div class=\"job-list\">{}</div>{next_html}</body></html>",
        cards.join("")
    )
}

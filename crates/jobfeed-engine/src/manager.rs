//! Extraction manager: the registry of per-source extractors and the
//! isolation boundary around them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobfeed_core::ExtractionOutcome;
use jobfeed_extractors::SourceExtractor;
use tracing::{error, info};

use crate::audit::AuditSink;

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// Politeness interval between sources in a sequential `run_all`.
    pub source_delay: Duration,
    /// Interval between chunks in `run_concurrent`; longer than
    /// `source_delay` because a whole chunk has just hit the remote side.
    pub chunk_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            source_delay: Duration::from_secs(5),
            chunk_delay: Duration::from_secs(20),
        }
    }
}

/// Runs one, all, or a bounded subset of the registered extractors.
///
/// Failures never cross source boundaries: a crashed extractor becomes a
/// failed outcome for its slot and nothing else. Every outcome, success or
/// failure, is forwarded to the audit sink.
pub struct ExtractionManager {
    extractors: BTreeMap<String, Arc<dyn SourceExtractor>>,
    audit: Arc<dyn AuditSink>,
    config: ManagerConfig,
}

impl ExtractionManager {
    pub fn new(
        extractors: Vec<Arc<dyn SourceExtractor>>,
        audit: Arc<dyn AuditSink>,
        config: ManagerConfig,
    ) -> Self {
        let extractors = extractors
            .into_iter()
            .map(|extractor| (extractor.source_id().to_string(), extractor))
            .collect();
        Self {
            extractors,
            audit,
            config,
        }
    }

    pub fn available_sources(&self) -> Vec<String> {
        self.extractors.keys().cloned().collect()
    }

    /// Run a single source. Unknown names produce a failed outcome naming
    /// the available sources; a panicking extractor produces a failed
    /// outcome for that source. Either way the outcome is audited.
    pub async fn run(&self, name: &str) -> ExtractionOutcome {
        let outcome = match self.extractors.get(name) {
            Some(extractor) => Self::run_isolated(extractor.clone()).await,
            None => ExtractionOutcome::failed(
                name,
                format!(
                    "unknown source `{name}`; available sources: {}",
                    self.available_sources().join(", ")
                ),
                Utc::now(),
            ),
        };
        self.audit.record(&outcome);
        outcome
    }

    async fn run_isolated(extractor: Arc<dyn SourceExtractor>) -> ExtractionOutcome {
        let source = extractor.source_id().to_string();
        let started_at = Utc::now();
        match tokio::spawn(async move { extractor.scrape().await }).await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                error!(source = %source, error = %join_error, "extractor crashed");
                ExtractionOutcome::failed(source, format!("extractor crashed: {join_error}"), started_at)
            }
        }
    }

    /// Run every registered source sequentially with a politeness interval
    /// between them. One source failing never blocks the rest.
    pub async fn run_all(&self) -> Vec<ExtractionOutcome> {
        let names = self.available_sources();
        info!(sources = names.len(), "running all extractors sequentially");
        let mut outcomes = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            if index > 0 && !self.config.source_delay.is_zero() {
                tokio::time::sleep(self.config.source_delay).await;
            }
            outcomes.push(self.run(name).await);
        }
        outcomes
    }

    /// Run the named sources in chunks of at most `max_concurrent`,
    /// preserving input order in the returned outcomes.
    pub async fn run_concurrent(&self, names: &[String], max_concurrent: usize) -> Vec<ExtractionOutcome> {
        let max_concurrent = max_concurrent.max(1);
        info!(
            sources = names.len(),
            max_concurrent, "running extractors in bounded chunks"
        );
        let mut outcomes = Vec::with_capacity(names.len());
        for (chunk_no, chunk) in names.chunks(max_concurrent).enumerate() {
            if chunk_no > 0 && !self.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
            let chunk_outcomes = futures::future::join_all(chunk.iter().map(|name| self.run(name))).await;
            outcomes.extend(chunk_outcomes);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use async_trait::async_trait;
    use jobfeed_extractors::testing::{job_card, listing_page, test_profile, ScriptedBrowser};
    use jobfeed_extractors::Extractor;
    use jobfeed_storage::MemoryListingRepository;

    struct PanickingExtractor {
        source: String,
    }

    #[async_trait]
    impl SourceExtractor for PanickingExtractor {
        fn source_id(&self) -> &str {
            &self.source
        }

        async fn scrape(&self) -> ExtractionOutcome {
            panic!("scripted crash");
        }
    }

    fn quiet_config() -> ManagerConfig {
        ManagerConfig {
            source_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
        }
    }

    fn scripted_extractor(
        browser: &Arc<ScriptedBrowser>,
        repository: &Arc<MemoryListingRepository>,
        source: &str,
    ) -> Arc<dyn SourceExtractor> {
        let url = format!("https://scripted.test/{source}");
        browser.set_page(
            url.clone(),
            listing_page(&[job_card(Some(&format!("{source} job")), "Org", "/x")], None),
        );
        Arc::new(Extractor::new(
            test_profile(source, &url, 1),
            browser.clone(),
            repository.clone(),
        ))
    }

    #[tokio::test]
    async fn unknown_source_fails_and_names_available_sources() {
        let browser = Arc::new(ScriptedBrowser::new());
        let repository = Arc::new(MemoryListingRepository::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = ExtractionManager::new(
            vec![scripted_extractor(&browser, &repository, "alpha")],
            audit.clone(),
            quiet_config(),
        );

        let outcome = manager.run("nosuch").await;
        assert!(!outcome.success);
        assert!(outcome.errors[0].contains("unknown source `nosuch`"));
        assert!(outcome.errors[0].contains("alpha"));
        assert_eq!(audit.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn run_all_isolates_a_crashing_source() {
        let browser = Arc::new(ScriptedBrowser::new());
        let repository = Arc::new(MemoryListingRepository::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = ExtractionManager::new(
            vec![
                scripted_extractor(&browser, &repository, "alpha"),
                Arc::new(PanickingExtractor {
                    source: "bravo".to_string(),
                }),
                scripted_extractor(&browser, &repository, "charlie"),
                scripted_extractor(&browser, &repository, "delta"),
            ],
            audit.clone(),
            quiet_config(),
        );

        let outcomes = manager.run_all().await;
        assert_eq!(outcomes.len(), 4);
        assert_eq!(
            outcomes.iter().map(|o| o.source.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "bravo", "charlie", "delta"]
        );
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].errors[0].contains("extractor crashed"));
        assert!(outcomes[2].success);
        assert!(outcomes[3].success);
        assert_eq!(audit.outcomes().len(), 4);
    }

    #[tokio::test]
    async fn run_concurrent_respects_the_ceiling_and_preserves_order() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.set_goto_delay(Duration::from_millis(100));
        let repository = Arc::new(MemoryListingRepository::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let sources = ["s1", "s2", "s3", "s4"];
        let manager = ExtractionManager::new(
            sources
                .iter()
                .map(|s| scripted_extractor(&browser, &repository, s))
                .collect(),
            audit,
            quiet_config(),
        );

        let names: Vec<String> = sources.iter().map(|s| s.to_string()).collect();
        let outcomes = manager.run_concurrent(&names, 2).await;

        assert_eq!(outcomes.len(), 4);
        assert_eq!(
            outcomes.iter().map(|o| o.source.as_str()).collect::<Vec<_>>(),
            vec!["s1", "s2", "s3", "s4"]
        );
        assert!(outcomes.iter().all(|o| o.success));
        assert!(browser.peak_active_sessions() <= 2);
        assert!(browser.peak_active_sessions() >= 1);
        assert_eq!(browser.active_sessions(), 0);
    }
}

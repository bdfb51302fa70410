//! Reconciliation and lifecycle engine: keeps the local listing inventory in
//! step with the crawl and with the marketplace.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use listsync_adapters::{CrawlCollector, HtmlCollector, HtmlCollectorConfig};
use listsync_core::{
    ItemStatus, NewSourceLink, SourceLink, TaskName, DEFAULT_LOG_ENTRY_BYTES, DEFAULT_LOG_TRAIL_CAP,
};
use listsync_market::{MarketClient, MarketplaceApi, Taxonomy};
use listsync_storage::{HttpFetcher, ImageStore, ListingStore, PgStore};
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::info;

mod capture;
mod config;
mod detail;
mod drain;
mod ledger;
mod publish;
mod reconcile;
mod retire;
mod scheduler;

#[cfg(test)]
mod fakes;

pub use capture::{RunLogCapture, RunLogLayer};
pub use config::SyncConfig;
pub use detail::DetailOutcome;
pub use drain::{DrainCreateReport, DrainDeleteReport};
pub use ledger::{RunLedger, RunOutcome, RunScope, TaskReport};
pub use publish::SyncCreatedReport;
pub use reconcile::{RecheckReport, ReconcileReport};
pub use retire::DeleteSourceReport;
pub use scheduler::{build_scheduler, scheduled_tasks};

pub const CRATE_NAME: &str = "listsync-sync";

/// Random pause between consecutive units of polite work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const NONE: DelayRange = DelayRange {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn secs(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_secs(min),
            max: Duration::from_secs(max.max(min)),
        }
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }

    pub async fn pause(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_city_id: i64,
    pub log_trail_cap: usize,
    pub log_entry_bytes: usize,
    pub recheck_after: chrono::Duration,
    /// Between sources during a recheck.
    pub source_delay: DelayRange,
    /// Between item detail fetches while draining ToCreate.
    pub item_delay: DelayRange,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_city_id: 1,
            log_trail_cap: DEFAULT_LOG_TRAIL_CAP,
            log_entry_bytes: DEFAULT_LOG_ENTRY_BYTES,
            recheck_after: chrono::Duration::hours(24),
            source_delay: DelayRange::secs(1, 10),
            item_delay: DelayRange::secs(1, 5),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            default_city_id: config.default_city_id,
            log_trail_cap: config.log_trail_cap,
            log_entry_bytes: config.log_entry_bytes,
            recheck_after: chrono::Duration::hours(config.recheck_after_hours),
            ..Default::default()
        }
    }

    pub fn without_delays(mut self) -> Self {
        self.source_delay = DelayRange::NONE;
        self.item_delay = DelayRange::NONE;
        self
    }
}

pub struct Engine {
    store: Arc<dyn ListingStore>,
    collector: Arc<dyn CrawlCollector>,
    market: Arc<dyn MarketplaceApi>,
    taxonomy: Arc<Taxonomy>,
    images: ImageStore,
    ledger: RunLedger,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ListingStore>,
        collector: Arc<dyn CrawlCollector>,
        market: Arc<dyn MarketplaceApi>,
        taxonomy: Arc<Taxonomy>,
        images: ImageStore,
        settings: EngineSettings,
    ) -> Self {
        let ledger = RunLedger::new(store.clone(), settings.log_trail_cap, settings.log_entry_bytes);
        Self {
            store,
            collector,
            market,
            taxonomy,
            images,
            ledger,
            settings,
        }
    }

    /// Routes events captured under a run's span into that run's trail.
    pub fn with_log_capture(mut self, capture: RunLogCapture) -> Self {
        self.ledger = self.ledger.with_capture(capture);
        self
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Registers a crawl target. Idempotent on URL; an unknown category tag
    /// is rejected here rather than at sync time.
    pub async fn register_source(
        &self,
        url: &str,
        category: Option<&str>,
        owner: Option<&str>,
    ) -> Result<SourceLink> {
        let url = url.trim();
        if url.is_empty() {
            bail!("source url must not be empty");
        }
        let category = category.map(str::trim).filter(|c| !c.is_empty());
        if let Some(tag) = category {
            self.taxonomy.resolve(Some(tag))?;
        }

        let source = self
            .store
            .register_source(&NewSourceLink {
                url: url.to_string(),
                category: category.map(str::to_string),
                owner: owner.map(str::trim).filter(|o| !o.is_empty()).map(str::to_string),
            })
            .await
            .with_context(|| format!("registering source {url}"))?;
        info!(source_id = source.id, url = %source.url, "source link registered");
        Ok(source)
    }

    /// Sources never processed, or not processed within `recheck_after`.
    pub async fn stale_sources(&self) -> Result<Vec<SourceLink>> {
        let threshold = Utc::now() - self.settings.recheck_after;
        self.store.stale_sources(threshold).await
    }

    pub async fn item_status_counts(&self) -> Result<Vec<(ItemStatus, i64)>> {
        self.store.item_status_counts().await
    }

    /// Entry point for the scheduler: runs one recurring task over every source.
    pub async fn run_scheduled(&self, task: TaskName) -> Result<()> {
        let run_id = match task {
            TaskName::RecheckSources => self.recheck_parsed_sources().await?.run_id(),
            TaskName::DrainCreate => self.drain_create(None).await?.run_id(),
            TaskName::SyncCreated => self.sync_created().await?.run_id(),
            TaskName::DrainDelete => self.drain_delete().await?.run_id(),
            TaskName::ReconcileSource | TaskName::DeleteSource => {
                bail!("{task} needs a source link id and cannot be scheduled")
            }
        };
        info!(run_id, task = task.as_str(), "scheduled run finished");
        Ok(())
    }
}

fn details(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn source_details(source_id: Option<i64>) -> Map<String, Value> {
    details(&[("source_id", json!(source_id))])
}

/// Wires the production engine from configuration: Postgres store, HTML
/// collector, marketplace client and taxonomy.
pub async fn engine_from_config(config: &SyncConfig) -> Result<Engine> {
    let store = PgStore::connect(&config.database_url).await?;
    let taxonomy = match &config.taxonomy_path {
        Some(path) => Taxonomy::load(path)?,
        None => Taxonomy::builtin()?,
    };
    let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let collector = HtmlCollector::new(fetcher, HtmlCollectorConfig::default());
    let market = MarketClient::new(config.market_client_config())?;

    Ok(Engine::new(
        Arc::new(store),
        Arc::new(collector),
        Arc::new(market),
        Arc::new(taxonomy),
        ImageStore::new(config.images_dir.clone()),
        EngineSettings::from_config(config),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::harness;

    #[test]
    fn delay_range_samples_within_bounds() {
        let range = DelayRange {
            min: Duration::from_millis(5),
            max: Duration::from_millis(9),
        };
        for _ in 0..50 {
            let d = range.sample();
            assert!(d >= range.min && d <= range.max);
        }
        assert_eq!(DelayRange::NONE.sample(), Duration::ZERO);
        assert_eq!(DelayRange::secs(4, 2).max, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn register_source_validates_category() {
        let h = harness();
        let source = h
            .engine
            .register_source(" https://src.example/list ", Some("3-5 тон"), Some(" ops "))
            .await
            .unwrap();
        assert_eq!(source.url, "https://src.example/list");
        assert_eq!(source.owner.as_deref(), Some("ops"));

        let again = h
            .engine
            .register_source("https://src.example/list", Some("3-5 тон"), None)
            .await
            .unwrap();
        assert_eq!(again.id, source.id);

        let err = h
            .engine
            .register_source("https://src.example/other", Some("boats"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown category"));

        let blank = h
            .engine
            .register_source("https://src.example/third", Some("  "), None)
            .await
            .unwrap();
        assert_eq!(blank.category, None);
    }

    #[tokio::test]
    async fn new_sources_are_stale() {
        let h = harness();
        h.engine.register_source("https://src.example/a", None, None).await.unwrap();
        assert_eq!(h.engine.stale_sources().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn source_bound_tasks_cannot_be_scheduled() {
        let h = harness();
        assert!(h.engine.run_scheduled(TaskName::DeleteSource).await.is_err());
        h.engine.run_scheduled(TaskName::DrainDelete).await.unwrap();
    }
}

use anyhow::{bail, Context, Result};
use chrono::Utc;
use listsync_core::{diff_urls, ParseStatus, SourceLink, SourceLinkId, TaskName};
use listsync_storage::QueuedChanges;
use serde::Serialize;
use serde_json::Map;
use tracing::{warn, Instrument};

use crate::ledger::{RunOutcome, RunScope, TaskReport};
use crate::{source_details, Engine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub source_id: SourceLinkId,
    pub collected: usize,
    /// New URLs in the crawl.
    pub added: usize,
    /// Stored URLs missing from the crawl.
    pub removed: usize,
    pub queued_create: usize,
    pub queued_delete: usize,
}

impl TaskReport for ReconcileReport {
    fn summary(&self) -> String {
        format!(
            "collected {} item urls (+{} -{})",
            self.collected, self.added, self.removed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecheckReport {
    pub checked: usize,
    pub failed: usize,
}

impl TaskReport for RecheckReport {
    fn summary(&self) -> String {
        if self.checked == 0 {
            return "no parsed sources to recheck".to_string();
        }
        format!("rechecked {} sources, {} failed", self.checked, self.failed)
    }
}

impl Engine {
    /// Crawls one source link and reconciles its change queues.
    pub async fn reconcile_source(&self, id: SourceLinkId) -> Result<RunOutcome<ReconcileReport>> {
        let scope = self
            .ledger
            .start(TaskName::ReconcileSource, source_details(Some(id)))
            .await?;
        let result = self.reconcile_source_in(&scope, id)
            .instrument(scope.span().clone())
            .await;
        scope.finish(result).await
    }

    async fn reconcile_source_in(&self, scope: &RunScope, id: SourceLinkId) -> Result<ReconcileReport> {
        let Some(source) = self.store.get_source(id).await? else {
            bail!("source link {id} not found");
        };
        scope
            .info(&format!("collecting item urls of source {} ({})", source.id, source.url))
            .await;

        let fresh = match self.collector.collect_item_urls(&source.url).await {
            Ok(urls) => urls,
            Err(err) => {
                self.mark_parsed_after_failure(&source, false).await;
                return Err(err).with_context(|| format!("collecting item urls of {}", source.url));
            }
        };
        self.reconcile(&source, &fresh, false).await
    }

    /// Diffs `fresh` against the source's stored items and replaces its
    /// pending change entries. The source ends up PARSED even when the
    /// diff could not be stored.
    pub async fn reconcile(
        &self,
        source: &SourceLink,
        fresh: &[String],
        recheck: bool,
    ) -> Result<ReconcileReport> {
        let queued = self.queue_diff(source, fresh).await;
        if queued.is_err() {
            self.mark_parsed_after_failure(source, recheck).await;
        }
        let (diff, queued) = queued?;
        self.store
            .mark_source_parsed(source.id, Utc::now(), recheck)
            .await
            .with_context(|| format!("marking source {} parsed", source.id))?;

        Ok(ReconcileReport {
            source_id: source.id,
            collected: fresh.len(),
            added: diff.to_create.len(),
            removed: diff.to_delete.len(),
            queued_create: queued.to_create,
            queued_delete: queued.to_delete,
        })
    }

    async fn queue_diff(
        &self,
        source: &SourceLink,
        fresh: &[String],
    ) -> Result<(listsync_core::UrlDiff, QueuedChanges)> {
        let stored = self
            .store
            .item_urls_for_source(source.id)
            .await
            .with_context(|| format!("loading stored items of source {}", source.id))?;
        let diff = diff_urls(&stored, fresh);
        let queued = self
            .store
            .replace_pending_changes(source.id, &diff)
            .await
            .with_context(|| format!("queueing changes of source {}", source.id))?;
        Ok((diff, queued))
    }

    async fn mark_parsed_after_failure(&self, source: &SourceLink, recheck: bool) {
        if let Err(err) = self
            .store
            .mark_source_parsed(source.id, Utc::now(), recheck)
            .await
        {
            warn!(source_id = source.id, error = %err, "could not mark failed source parsed");
        }
    }

    /// Re-crawls every PARSED source. One failing source does not stop the rest.
    pub async fn recheck_parsed_sources(&self) -> Result<RunOutcome<RecheckReport>> {
        let scope = self.ledger.start(TaskName::RecheckSources, Map::new()).await?;
        let result = self.recheck_in(&scope)
            .instrument(scope.span().clone())
            .await;
        scope.finish(result).await
    }

    async fn recheck_in(&self, scope: &RunScope) -> Result<RecheckReport> {
        let sources = self
            .store
            .list_sources(Some(ParseStatus::Parsed))
            .await
            .context("listing parsed sources")?;
        let mut report = RecheckReport {
            checked: sources.len(),
            failed: 0,
        };

        for (i, source) in sources.iter().enumerate() {
            if i > 0 {
                self.settings.source_delay.pause().await;
            }
            scope
                .info(&format!("rechecking source {} ({})", source.id, source.url))
                .await;
            let result = match self.collector.collect_item_urls(&source.url).await {
                Ok(fresh) => self.reconcile(source, &fresh, true).await,
                Err(err) => Err(anyhow::Error::new(err).context("collecting item urls")),
            };
            match result {
                Ok(r) => {
                    scope
                        .info(&format!(
                            "source {}: +{} -{}",
                            source.id, r.added, r.removed
                        ))
                        .await;
                }
                Err(err) => {
                    report.failed += 1;
                    scope
                        .error(&format!("source {} recheck failed: {err:#}", source.id))
                        .await;
                }
            }
        }
        Ok(report)
    }
}

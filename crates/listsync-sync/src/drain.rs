use anyhow::{Context, Result};
use listsync_core::{ChangeKind, ChangeRecord, SourceLinkId, TaskName};
use listsync_market::DeleteOutcome;
use serde::Serialize;
use tracing::Instrument;
use serde_json::Map;

use crate::detail::DetailOutcome;
use crate::ledger::{RunOutcome, RunScope, TaskReport};
use crate::{source_details, Engine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainCreateReport {
    pub source_id: Option<SourceLinkId>,
    /// Entries completed, whether the item parsed or was routed to FAILED.
    pub processed: usize,
    pub failed_items: usize,
    pub total: usize,
}

impl TaskReport for DrainCreateReport {
    fn summary(&self) -> String {
        if self.total == 0 {
            return "no queued ToCreate entries".to_string();
        }
        format!(
            "processed {}/{} ToCreate entries ({} items failed)",
            self.processed, self.total, self.failed_items
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainDeleteReport {
    /// Remote listings confirmed gone (404 included).
    pub processed: usize,
    /// Entries completed with nothing to remove remotely.
    pub without_remote: usize,
    pub total: usize,
}

impl TaskReport for DrainDeleteReport {
    fn summary(&self) -> String {
        if self.total == 0 {
            return "no queued ToDelete entries".to_string();
        }
        format!(
            "deleted {} remote listings, {} entries had none, {} total",
            self.processed, self.without_remote, self.total
        )
    }
}

impl Engine {
    /// Fetches the detail page of every pending ToCreate entry, for one
    /// source or for all of them.
    pub async fn drain_create(
        &self,
        source: Option<SourceLinkId>,
    ) -> Result<RunOutcome<DrainCreateReport>> {
        let scope = self
            .ledger
            .start(TaskName::DrainCreate, source_details(source))
            .await?;
        let result = self.drain_create_in(&scope, source)
            .instrument(scope.span().clone())
            .await;
        scope.finish(result).await
    }

    async fn drain_create_in(
        &self,
        scope: &RunScope,
        source: Option<SourceLinkId>,
    ) -> Result<DrainCreateReport> {
        let entries = self
            .store
            .pending_creates(source)
            .await
            .context("loading pending ToCreate entries")?;
        let mut report = DrainCreateReport {
            source_id: source,
            processed: 0,
            failed_items: 0,
            total: entries.len(),
        };

        for (i, entry) in entries.iter().enumerate() {
            if i > 0 {
                self.settings.item_delay.pause().await;
            }
            let record = &entry.record;
            scope
                .info(&format!(
                    "fetching {} (entry {}, source {})",
                    record.item_url, record.id, entry.source_url
                ))
                .await;

            let outcome = match self
                .fetch_detail(scope, record.source_link_id, &record.item_url)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    scope
                        .error(&format!("entry {} left queued: {err:#}", record.id))
                        .await;
                    continue;
                }
            };
            if outcome == DetailOutcome::Failed {
                report.failed_items += 1;
            }
            match self.store.complete_change(ChangeKind::ToCreate, record.id).await {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    scope
                        .error(&format!("completing entry {} failed: {err:#}", record.id))
                        .await;
                }
            }
        }
        Ok(report)
    }

    /// Removes the remote listing behind every pending ToDelete entry.
    pub async fn drain_delete(&self) -> Result<RunOutcome<DrainDeleteReport>> {
        let scope = self.ledger.start(TaskName::DrainDelete, Map::new()).await?;
        let result = self.drain_delete_in(&scope)
            .instrument(scope.span().clone())
            .await;
        scope.finish(result).await
    }

    async fn drain_delete_in(&self, scope: &RunScope) -> Result<DrainDeleteReport> {
        let entries = self
            .store
            .pending_deletes()
            .await
            .context("loading pending ToDelete entries")?;
        let mut report = DrainDeleteReport {
            processed: 0,
            without_remote: 0,
            total: entries.len(),
        };

        for entry in &entries {
            match self.delete_one(scope, entry).await {
                Ok(Some(_)) => report.processed += 1,
                Ok(None) => report.without_remote += 1,
                Err(err) => {
                    scope
                        .error(&format!(
                            "ToDelete entry {} ({}) left queued: {err:#}",
                            entry.id, entry.item_url
                        ))
                        .await;
                }
            }
        }
        Ok(report)
    }

    /// `Ok(None)` when there was no remote listing to remove.
    async fn delete_one(&self, scope: &RunScope, entry: &ChangeRecord) -> Result<Option<DeleteOutcome>> {
        let item = self
            .store
            .get_item_by_url(&entry.item_url)
            .await
            .with_context(|| format!("loading item {}", entry.item_url))?;
        let Some((item_id, remote_id)) = item.and_then(|i| i.remote_id.map(|r| (i.id, r))) else {
            scope
                .warn(&format!(
                    "{} has no remote listing, completing entry {}",
                    entry.item_url, entry.id
                ))
                .await;
            self.store
                .complete_change(ChangeKind::ToDelete, entry.id)
                .await
                .with_context(|| format!("completing entry {}", entry.id))?;
            return Ok(None);
        };

        let outcome = match self.market.delete_listing(remote_id).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_not_found() => DeleteOutcome::AlreadyGone,
            Err(err) => {
                return Err(err).with_context(|| format!("deleting remote listing {remote_id}"))
            }
        };
        if outcome == DeleteOutcome::AlreadyGone {
            scope
                .warn(&format!("remote listing {remote_id} was already gone"))
                .await;
        }
        self.store
            .complete_deletion(entry.id, item_id)
            .await
            .with_context(|| format!("completing deletion of {}", entry.item_url))?;
        scope
            .info(&format!("{} deleted (remote {remote_id})", entry.item_url))
            .await;
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use listsync_core::{ChangeStatus, ItemStatus};
    use listsync_storage::ListingStore;

    use crate::fakes::{harness, truck, Harness};

    async fn queued_source(h: &Harness, urls: &[&str]) -> i64 {
        let source = h.engine.register_source("https://src.example", None, None).await.unwrap();
        h.collector.set_listing("https://src.example", urls);
        h.engine.reconcile_source(source.id).await.unwrap();
        source.id
    }

    #[tokio::test]
    async fn drain_create_completes_entries_even_for_failed_items() {
        let h = harness();
        let source = queued_source(&h, &["u/ok", "u/bad"]).await;
        h.collector.set_detail("u/ok", truck("Mercedes-Benz", "Sprinter", 1));
        h.collector.fail_detail("u/bad", "layout changed");

        let outcome = h.engine.drain_create(Some(source)).await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!((report.processed, report.failed_items, report.total), (2, 1, 2));

        let creates = h.store.changes_for_source(source, listsync_core::ChangeKind::ToCreate).await.unwrap();
        assert!(creates.iter().all(|c| c.status == ChangeStatus::Completed));
        let ok = h.store.get_item_by_url("u/ok").await.unwrap().unwrap();
        assert_eq!(ok.status, ItemStatus::Created);
        let deletes = h.store.pending_deletes().await.unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].item_url, "u/bad");
    }

    #[tokio::test]
    async fn upsert_failure_still_completes_entry_through_bridge() {
        let h = harness();
        let source = queued_source(&h, &["u/1"]).await;
        h.collector.set_detail("u/1", truck("Mercedes-Benz", "Sprinter", 1));
        h.store.fail_upserts_for("u/1").await;

        let outcome = h.engine.drain_create(None).await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!((report.processed, report.failed_items), (1, 1));
        let item = h.store.get_item_by_url("u/1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.source_link_id, Some(source));

        let empty = h.engine.drain_create(None).await.unwrap();
        assert_eq!(empty.report().unwrap().total, 0);
    }

    #[tokio::test]
    async fn drain_delete_without_remote_id_completes_without_api_call() {
        let h = harness();
        let source = h.engine.register_source("https://src.example", None, None).await.unwrap();
        h.store.mark_failed_and_queue_deletion(source.id, "u/x").await.unwrap();

        let outcome = h.engine.drain_delete().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!((report.processed, report.without_remote), (0, 1));
        assert!(h.market.deleted.lock().unwrap().is_empty());
        let item = h.store.get_item_by_url("u/x").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(h.store.pending_deletes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drain_delete_treats_not_found_like_success() {
        let h = harness();
        let source = h.engine.register_source("https://src.example", None, None).await.unwrap();
        for (url, remote) in [("u/200", 1), ("u/404", 2)] {
            h.store
                .upsert_item(source.id, url, &truck("Mercedes-Benz", "Sprinter", 1).fields, None)
                .await
                .unwrap();
            let item = h.store.get_item_by_url(url).await.unwrap().unwrap();
            h.store.set_remote_id(item.id, remote).await.unwrap();
            h.store.mark_failed_and_queue_deletion(source.id, url).await.unwrap();
        }
        h.market.mark_gone(2);

        let outcome = h.engine.drain_delete().await.unwrap();
        assert_eq!(outcome.report().unwrap().processed, 2);
        for url in ["u/200", "u/404"] {
            let item = h.store.get_item_by_url(url).await.unwrap().unwrap();
            assert_eq!(item.status, ItemStatus::Deleted);
        }
        let deletes = h.store.changes_for_source(source.id, listsync_core::ChangeKind::ToDelete).await.unwrap();
        assert!(deletes.iter().all(|c| c.status == ChangeStatus::Completed));
    }

    #[tokio::test]
    async fn drain_delete_leaves_entry_queued_on_server_error() {
        let h = harness();
        let source = h.engine.register_source("https://src.example", None, None).await.unwrap();
        h.store
            .upsert_item(source.id, "u/500", &truck("Mercedes-Benz", "Sprinter", 1).fields, None)
            .await
            .unwrap();
        let item = h.store.get_item_by_url("u/500").await.unwrap().unwrap();
        h.store.set_remote_id(item.id, 77).await.unwrap();
        h.store.set_item_status(item.id, ItemStatus::Active).await.unwrap();
        h.store.mark_failed_and_queue_deletion(source.id, "u/500").await.unwrap();
        h.market.mark_broken(77);

        let outcome = h.engine.drain_delete().await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.report().unwrap().processed, 0);
        assert_eq!(h.store.pending_deletes().await.unwrap().len(), 1);
        let item = h.store.get_item_by_url("u/500").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
    }
}

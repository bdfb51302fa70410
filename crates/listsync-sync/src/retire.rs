use anyhow::{bail, Context, Result};
use listsync_core::{ItemStatus, SourceLinkId, TaskName};
use serde::Serialize;
use tracing::Instrument;

use crate::ledger::{RunOutcome, RunScope, TaskReport};
use crate::{source_details, Engine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteSourceReport {
    pub source_id: SourceLinkId,
    pub removed_remote: usize,
    pub detached_items: usize,
    pub dropped_changes: usize,
}

impl TaskReport for DeleteSourceReport {
    fn summary(&self) -> String {
        format!(
            "source {} removed; {} remote listings deleted",
            self.source_id, self.removed_remote
        )
    }
}

impl Engine {
    /// Retires a source link: its remote listings are deleted first, and
    /// only when all of them are gone is anything changed locally.
    pub async fn delete_source(&self, id: SourceLinkId) -> Result<RunOutcome<DeleteSourceReport>> {
        let scope = self
            .ledger
            .start(TaskName::DeleteSource, source_details(Some(id)))
            .await?;
        let result = self.delete_source_in(&scope, id)
            .instrument(scope.span().clone())
            .await;
        scope.finish(result).await
    }

    async fn delete_source_in(&self, scope: &RunScope, id: SourceLinkId) -> Result<DeleteSourceReport> {
        if self.store.get_source(id).await?.is_none() {
            bail!("source link {id} not found");
        }

        let items = self
            .store
            .items_for_source(id)
            .await
            .with_context(|| format!("loading items of source {id}"))?;
        let mut removed_remote = 0;
        for item in &items {
            let Some(remote_id) = item.remote_id else {
                continue;
            };
            if item.status == ItemStatus::Deleted {
                continue;
            }
            match self.market.delete_listing(remote_id).await {
                Ok(_) => removed_remote += 1,
                Err(err) if err.is_not_found() => removed_remote += 1,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("deleting remote listing {remote_id} of item {}", item.id)
                    })
                }
            }
            scope
                .debug(&format!("remote listing {remote_id} of item {} removed", item.id))
                .await;
        }

        let retired = self
            .store
            .retire_source(id)
            .await
            .with_context(|| format!("retiring source {id}"))?;
        Ok(DeleteSourceReport {
            source_id: id,
            removed_remote,
            detached_items: retired.detached_items,
            dropped_changes: retired.dropped_changes,
        })
    }
}

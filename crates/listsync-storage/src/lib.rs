//! Persistence for source links, items, change queues and run records, plus
//! the ordered image store and rate-limited HTTP fetch utilities.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listsync_core::{
    ChangeId, ChangeKind, ChangeRecord, Item, ItemFields, ItemId, ItemStatus, LogEntry,
    NewSourceLink, ParseStatus, PendingCreate, RunId, RunRecord, RunStatus, SourceLink,
    SourceLinkId, TaskName, UpsertAction, UrlDiff,
};
use serde_json::{Map, Value};
use thiserror::Error;

mod http;
mod images;
mod memory;
mod pg;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use images::{ImageStore, StoredImage};
pub use memory::MemoryStore;
pub use pg::PgStore;

pub const CRATE_NAME: &str = "listsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database cannot be reached at all; callers should not swallow this.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// True when any error in the chain says the store itself is down.
pub fn is_store_unavailable(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<StoreError>(), Some(StoreError::Unavailable(_))))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueuedChanges {
    pub to_delete: usize,
    pub to_create: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetiredSource {
    pub detached_items: usize,
    pub dropped_changes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub task: Option<TaskName>,
    pub status: Option<RunStatus>,
    pub limit: usize,
}

/// Every operation is its own transaction; none spans a network call.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Idempotent on URL: registering a known URL returns the stored row.
    async fn register_source(&self, new: &NewSourceLink) -> Result<SourceLink>;
    async fn get_source(&self, id: SourceLinkId) -> Result<Option<SourceLink>>;
    async fn list_sources(&self, parse_status: Option<ParseStatus>) -> Result<Vec<SourceLink>>;
    /// Sources never processed or last processed before `older_than`.
    async fn stale_sources(&self, older_than: DateTime<Utc>) -> Result<Vec<SourceLink>>;
    async fn mark_source_parsed(
        &self,
        id: SourceLinkId,
        at: DateTime<Utc>,
        recheck: bool,
    ) -> Result<()>;
    /// Marks the source's items DELETED, detaches them, drops its change
    /// entries and deletes the source row.
    async fn retire_source(&self, id: SourceLinkId) -> Result<RetiredSource>;

    async fn item_urls_for_source(&self, id: SourceLinkId) -> Result<Vec<String>>;
    async fn items_for_source(&self, id: SourceLinkId) -> Result<Vec<Item>>;
    async fn get_item_by_url(&self, url: &str) -> Result<Option<Item>>;
    async fn upsert_item(
        &self,
        source: SourceLinkId,
        url: &str,
        fields: &ItemFields,
        explicit: Option<ItemStatus>,
    ) -> Result<UpsertAction>;
    /// Forces FAILED (even through a terminal status, inserting a minimal
    /// record when none exists) and ensures a single ToDelete entry.
    async fn mark_failed_and_queue_deletion(&self, source: SourceLinkId, url: &str) -> Result<()>;
    /// Atomically moves every CREATED item to PROCESS and returns the claimed rows.
    async fn claim_created_items(&self) -> Result<Vec<Item>>;
    /// Sets the status; an item is published exactly while it is ACTIVE.
    async fn set_item_status(&self, id: ItemId, status: ItemStatus) -> Result<()>;
    async fn set_remote_id(&self, id: ItemId, remote_id: i64) -> Result<()>;
    async fn item_status_counts(&self) -> Result<Vec<(ItemStatus, i64)>>;

    /// Replaces the source's PROCESS entries with the diff. URLs that already
    /// have an entry of the same kind anywhere are skipped.
    async fn replace_pending_changes(&self, source: SourceLinkId, diff: &UrlDiff)
        -> Result<QueuedChanges>;
    async fn pending_creates(&self, source: Option<SourceLinkId>) -> Result<Vec<PendingCreate>>;
    async fn pending_deletes(&self) -> Result<Vec<ChangeRecord>>;
    async fn complete_change(&self, kind: ChangeKind, id: ChangeId) -> Result<()>;
    /// Item DELETED and ToDelete entry completed in one transaction.
    async fn complete_deletion(&self, change_id: ChangeId, item_id: ItemId) -> Result<()>;
    async fn changes_for_source(
        &self,
        source: SourceLinkId,
        kind: ChangeKind,
    ) -> Result<Vec<ChangeRecord>>;

    async fn start_run(&self, task: TaskName, details: Map<String, Value>) -> Result<RunId>;
    async fn append_run_log(&self, run: RunId, entry: LogEntry, cap: usize) -> Result<()>;
    /// Merges `details` into whatever was recorded at start.
    async fn finish_run(
        &self,
        run: RunId,
        status: RunStatus,
        message: Option<&str>,
        details: Map<String, Value>,
    ) -> Result<()>;
    async fn get_run(&self, run: RunId) -> Result<Option<RunRecord>>;
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn unavailable_is_detected_through_context() {
        let err = anyhow::Error::new(StoreError::Unavailable("connection refused".into()))
            .context("loading pending deletes");
        assert!(is_store_unavailable(&err));

        let err = Err::<(), _>(StoreError::Query("syntax".into()))
            .context("loading pending deletes")
            .unwrap_err();
        assert!(!is_store_unavailable(&err));
    }

    #[test]
    fn sqlx_pool_errors_map_to_unavailable() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
    }
}

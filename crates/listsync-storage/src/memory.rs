//! In-process `ListingStore` with the same semantics as the Postgres store.
//!
//! Used by the engine tests and by dry runs. Fault injection lets tests
//! simulate a dead database or a single failing item write.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listsync_core::{
    decide_upsert, ChangeId, ChangeKind, ChangeRecord, ChangeStatus, Item, ItemFields, ItemId,
    ItemStatus, LogEntry, NewSourceLink, ParseStatus, PendingCreate, RunId, RunRecord, RunStatus,
    SourceLink, SourceLinkId, TaskName, UpsertAction, UrlDiff,
};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};

use crate::{ListingStore, QueuedChanges, RetiredSource, RunFilter, StoreError};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    sources: BTreeMap<SourceLinkId, SourceLink>,
    items: BTreeMap<ItemId, Item>,
    to_create: BTreeMap<ChangeId, ChangeRecord>,
    to_delete: BTreeMap<ChangeId, ChangeRecord>,
    runs: BTreeMap<RunId, RunRecord>,
    failing_upserts: HashSet<String>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn changes(&self, kind: ChangeKind) -> &BTreeMap<ChangeId, ChangeRecord> {
        match kind {
            ChangeKind::ToCreate => &self.to_create,
            ChangeKind::ToDelete => &self.to_delete,
        }
    }

    fn changes_mut(&mut self, kind: ChangeKind) -> &mut BTreeMap<ChangeId, ChangeRecord> {
        match kind {
            ChangeKind::ToCreate => &mut self.to_create,
            ChangeKind::ToDelete => &mut self.to_delete,
        }
    }

    fn item_by_url_mut(&mut self, url: &str) -> Option<&mut Item> {
        self.items.values_mut().find(|item| item.url == url)
    }

    /// Inserts a PROCESS entry unless one of that kind already exists for the URL.
    fn queue_change(&mut self, kind: ChangeKind, source: SourceLinkId, url: &str) -> bool {
        if self.changes(kind).values().any(|c| c.item_url == url) {
            return false;
        }
        let id = self.next_id();
        self.changes_mut(kind).insert(
            id,
            ChangeRecord {
                id,
                kind,
                source_link_id: source,
                item_url: url.to_string(),
                status: ChangeStatus::Process,
            },
        );
        true
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails with `StoreError::Unavailable`.
    #[cfg(any(test, feature = "test-hooks"))]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes `upsert_item` fail for this URL, leaving the bridge path working.
    #[cfg(any(test, feature = "test-hooks"))]
    pub async fn fail_upserts_for(&self, url: &str) {
        self.state.lock().await.failing_upserts.insert(url.to_string());
    }

    async fn state(&self) -> Result<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()).into());
        }
        Ok(self.state.lock().await)
    }
}

fn not_found(what: &str) -> anyhow::Error {
    StoreError::NotFound(what.to_string()).into()
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn register_source(&self, new: &NewSourceLink) -> Result<SourceLink> {
        let mut state = self.state().await?;
        let now = Utc::now();
        if let Some(existing) = state.sources.values_mut().find(|s| s.url == new.url) {
            if new.category.is_some() {
                existing.category = new.category.clone();
            }
            if new.owner.is_some() {
                existing.owner = new.owner.clone();
            }
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let id = state.next_id();
        let source = SourceLink {
            id,
            url: new.url.clone(),
            category: new.category.clone(),
            owner: new.owner.clone(),
            parse_status: ParseStatus::Pending,
            created_at: now,
            updated_at: now,
            last_processed_at: None,
            last_recheck_at: None,
        };
        state.sources.insert(id, source.clone());
        Ok(source)
    }

    async fn get_source(&self, id: SourceLinkId) -> Result<Option<SourceLink>> {
        Ok(self.state().await?.sources.get(&id).cloned())
    }

    async fn list_sources(&self, parse_status: Option<ParseStatus>) -> Result<Vec<SourceLink>> {
        let state = self.state().await?;
        Ok(state
            .sources
            .values()
            .filter(|s| parse_status.map_or(true, |p| s.parse_status == p))
            .cloned()
            .collect())
    }

    async fn stale_sources(&self, older_than: DateTime<Utc>) -> Result<Vec<SourceLink>> {
        let state = self.state().await?;
        Ok(state
            .sources
            .values()
            .filter(|s| s.last_processed_at.map_or(true, |at| at < older_than))
            .cloned()
            .collect())
    }

    async fn mark_source_parsed(
        &self,
        id: SourceLinkId,
        at: DateTime<Utc>,
        recheck: bool,
    ) -> Result<()> {
        let mut state = self.state().await?;
        let source = state
            .sources
            .get_mut(&id)
            .ok_or_else(|| not_found("source link"))?;
        source.parse_status = ParseStatus::Parsed;
        source.last_processed_at = Some(at);
        if recheck {
            source.last_recheck_at = Some(at);
        }
        source.updated_at = Utc::now();
        Ok(())
    }

    async fn retire_source(&self, id: SourceLinkId) -> Result<RetiredSource> {
        let mut state = self.state().await?;
        if state.sources.remove(&id).is_none() {
            return Err(not_found("source link"));
        }

        let now = Utc::now();
        let mut detached_items = 0;
        for item in state.items.values_mut() {
            if item.source_link_id == Some(id) {
                item.source_link_id = None;
                item.status = ItemStatus::Deleted;
                item.is_published = false;
                item.updated_at = now;
                detached_items += 1;
            }
        }

        let before = state.to_create.len() + state.to_delete.len();
        state.to_create.retain(|_, c| c.source_link_id != id);
        state.to_delete.retain(|_, c| c.source_link_id != id);
        let dropped_changes = before - (state.to_create.len() + state.to_delete.len());

        Ok(RetiredSource {
            detached_items,
            dropped_changes,
        })
    }

    async fn item_urls_for_source(&self, id: SourceLinkId) -> Result<Vec<String>> {
        let state = self.state().await?;
        Ok(state
            .items
            .values()
            .filter(|item| item.source_link_id == Some(id))
            .map(|item| item.url.clone())
            .collect())
    }

    async fn items_for_source(&self, id: SourceLinkId) -> Result<Vec<Item>> {
        let state = self.state().await?;
        Ok(state
            .items
            .values()
            .filter(|item| item.source_link_id == Some(id))
            .cloned()
            .collect())
    }

    async fn get_item_by_url(&self, url: &str) -> Result<Option<Item>> {
        let state = self.state().await?;
        Ok(state.items.values().find(|item| item.url == url).cloned())
    }

    async fn upsert_item(
        &self,
        source: SourceLinkId,
        url: &str,
        fields: &ItemFields,
        explicit: Option<ItemStatus>,
    ) -> Result<UpsertAction> {
        let mut state = self.state().await?;
        if state.failing_upserts.contains(url) {
            return Err(StoreError::Query(format!("injected upsert failure for {url}")))
                .context("upserting item");
        }

        let existing = state.items.values().find(|item| item.url == url).map(|i| i.status);
        let action = decide_upsert(existing, explicit);
        let now = Utc::now();

        match action {
            UpsertAction::Insert(status) => {
                let id = state.next_id();
                state.items.insert(
                    id,
                    Item {
                        id,
                        source_link_id: Some(source),
                        url: url.to_string(),
                        fields: fields.clone(),
                        remote_id: None,
                        status,
                        is_published: status == ItemStatus::Active,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
            UpsertAction::Overwrite(status) => {
                if let Some(item) = state.item_by_url_mut(url) {
                    item.source_link_id = Some(source);
                    item.fields = fields.clone();
                    item.status = status;
                    item.is_published = status == ItemStatus::Active;
                    item.updated_at = now;
                }
            }
            UpsertAction::Skip { queue_deletion } => {
                if queue_deletion {
                    state.queue_change(ChangeKind::ToDelete, source, url);
                }
            }
        }
        Ok(action)
    }

    async fn mark_failed_and_queue_deletion(&self, source: SourceLinkId, url: &str) -> Result<()> {
        let mut state = self.state().await?;
        let now = Utc::now();
        match state.item_by_url_mut(url) {
            Some(item) => {
                item.status = ItemStatus::Failed;
                item.is_published = false;
                item.updated_at = now;
            }
            None => {
                let id = state.next_id();
                state.items.insert(
                    id,
                    Item {
                        id,
                        source_link_id: Some(source),
                        url: url.to_string(),
                        fields: ItemFields::default(),
                        remote_id: None,
                        status: ItemStatus::Failed,
                        is_published: false,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        state.queue_change(ChangeKind::ToDelete, source, url);
        Ok(())
    }

    async fn claim_created_items(&self) -> Result<Vec<Item>> {
        let mut state = self.state().await?;
        let now = Utc::now();
        let mut claimed = Vec::new();
        for item in state.items.values_mut() {
            if item.status == ItemStatus::Created {
                item.status = ItemStatus::Process;
                item.updated_at = now;
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn set_item_status(&self, id: ItemId, status: ItemStatus) -> Result<()> {
        let mut state = self.state().await?;
        let item = state.items.get_mut(&id).ok_or_else(|| not_found("item"))?;
        item.status = status;
        item.is_published = status == ItemStatus::Active;
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn set_remote_id(&self, id: ItemId, remote_id: i64) -> Result<()> {
        let mut state = self.state().await?;
        let item = state.items.get_mut(&id).ok_or_else(|| not_found("item"))?;
        item.remote_id = Some(remote_id);
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn item_status_counts(&self) -> Result<Vec<(ItemStatus, i64)>> {
        let state = self.state().await?;
        Ok(ItemStatus::ALL
            .iter()
            .map(|status| {
                let count = state.items.values().filter(|i| i.status == *status).count();
                (*status, count as i64)
            })
            .filter(|(_, count)| *count > 0)
            .collect())
    }

    async fn replace_pending_changes(
        &self,
        source: SourceLinkId,
        diff: &UrlDiff,
    ) -> Result<QueuedChanges> {
        let mut state = self.state().await?;
        if !state.sources.contains_key(&source) {
            return Err(not_found("source link"));
        }

        let pending = |c: &ChangeRecord| c.source_link_id == source && c.status == ChangeStatus::Process;
        state.to_delete.retain(|_, c| !pending(c));
        state.to_create.retain(|_, c| !pending(c));

        let mut queued = QueuedChanges::default();
        for url in &diff.to_delete {
            if state.queue_change(ChangeKind::ToDelete, source, url) {
                queued.to_delete += 1;
            }
        }
        for url in &diff.to_create {
            if state.queue_change(ChangeKind::ToCreate, source, url) {
                queued.to_create += 1;
            }
        }
        Ok(queued)
    }

    async fn pending_creates(&self, source: Option<SourceLinkId>) -> Result<Vec<PendingCreate>> {
        let state = self.state().await?;
        Ok(state
            .to_create
            .values()
            .filter(|c| c.status == ChangeStatus::Process)
            .filter(|c| source.map_or(true, |s| c.source_link_id == s))
            .filter_map(|c| {
                state.sources.get(&c.source_link_id).map(|s| PendingCreate {
                    record: c.clone(),
                    source_url: s.url.clone(),
                })
            })
            .collect())
    }

    async fn pending_deletes(&self) -> Result<Vec<ChangeRecord>> {
        let state = self.state().await?;
        Ok(state
            .to_delete
            .values()
            .filter(|c| c.status == ChangeStatus::Process)
            .cloned()
            .collect())
    }

    async fn complete_change(&self, kind: ChangeKind, id: ChangeId) -> Result<()> {
        let mut state = self.state().await?;
        let change = state
            .changes_mut(kind)
            .get_mut(&id)
            .ok_or_else(|| not_found("change entry"))?;
        change.status = ChangeStatus::Completed;
        Ok(())
    }

    async fn complete_deletion(&self, change_id: ChangeId, item_id: ItemId) -> Result<()> {
        let mut state = self.state().await?;
        if !state.to_delete.contains_key(&change_id) {
            return Err(not_found("change entry"));
        }
        let item = state.items.get_mut(&item_id).ok_or_else(|| not_found("item"))?;
        item.status = ItemStatus::Deleted;
        item.is_published = false;
        item.updated_at = Utc::now();
        if let Some(change) = state.to_delete.get_mut(&change_id) {
            change.status = ChangeStatus::Completed;
        }
        Ok(())
    }

    async fn changes_for_source(
        &self,
        source: SourceLinkId,
        kind: ChangeKind,
    ) -> Result<Vec<ChangeRecord>> {
        let state = self.state().await?;
        Ok(state
            .changes(kind)
            .values()
            .filter(|c| c.source_link_id == source)
            .cloned()
            .collect())
    }

    async fn start_run(&self, task: TaskName, details: Map<String, Value>) -> Result<RunId> {
        let mut state = self.state().await?;
        let id = state.next_id();
        state.runs.insert(
            id,
            RunRecord {
                id,
                task_name: task,
                status: RunStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                message: None,
                details,
                logs: Default::default(),
            },
        );
        Ok(id)
    }

    async fn append_run_log(&self, run: RunId, entry: LogEntry, cap: usize) -> Result<()> {
        let mut state = self.state().await?;
        let record = state.runs.get_mut(&run).ok_or_else(|| not_found("run"))?;
        record.logs.push(entry, cap);
        Ok(())
    }

    async fn finish_run(
        &self,
        run: RunId,
        status: RunStatus,
        message: Option<&str>,
        details: Map<String, Value>,
    ) -> Result<()> {
        let mut state = self.state().await?;
        let record = state.runs.get_mut(&run).ok_or_else(|| not_found("run"))?;
        record.status = status;
        record.finished_at = Some(Utc::now());
        record.message = message.map(str::to_string);
        record.details.extend(details);
        Ok(())
    }

    async fn get_run(&self, run: RunId) -> Result<Option<RunRecord>> {
        Ok(self.state().await?.runs.get(&run).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let state = self.state().await?;
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
        Ok(state
            .runs
            .values()
            .rev()
            .filter(|r| filter.task.map_or(true, |t| r.task_name == t))
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .take(limit)
            .cloned()
            .collect())
    }
}

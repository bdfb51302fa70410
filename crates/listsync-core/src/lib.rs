//! Core domain model and lifecycle rules for listsync.
//!
//! Everything here is storage-agnostic: the store implementations and the
//! sync engine share these types and the pure decision functions below.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "listsync-core";

pub type SourceLinkId = i64;
pub type ItemId = i64;
pub type ChangeId = i64;
pub type RunId = i64;

/// Default number of log entries kept per run.
pub const DEFAULT_LOG_TRAIL_CAP: usize = 2000;
/// Default byte budget of a single log entry message.
pub const DEFAULT_LOG_ENTRY_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a closed, string-backed enum with `as_str`, `FromStr` and `Display`.
///
/// Parsing is case-insensitive and rejects anything outside the variant set.
macro_rules! closed_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = s.trim().to_ascii_lowercase();
                match normalized.as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseEnumError {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

closed_enum!(
    /// Lifecycle of an [`Item`] from first parse to marketplace removal.
    ItemStatus, "item status" {
        NotProcessed => "not_processed",
        Created => "created",
        Updated => "updated",
        Process => "process",
        Active => "active",
        Failed => "failed",
        Deleted => "deleted",
    }
);

impl ItemStatus {
    /// Terminal items are never overwritten by a later detail re-fetch.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Created | ItemStatus::Active | ItemStatus::Deleted)
    }
}

closed_enum!(
    ParseStatus, "parse status" {
        Pending => "pending",
        Parsed => "parsed",
    }
);

closed_enum!(
    ChangeStatus, "change status" {
        Process => "process",
        Completed => "completed",
    }
);

closed_enum!(
    ChangeKind, "change kind" {
        ToCreate => "to_create",
        ToDelete => "to_delete",
    }
);

closed_enum!(
    RunStatus, "run status" {
        Running => "running",
        Success => "success",
        Failed => "failed",
    }
);

closed_enum!(
    /// Every task type that opens a run in the ledger.
    TaskName, "task name" {
        ReconcileSource => "reconcile_source",
        RecheckSources => "recheck_sources",
        DrainCreate => "drain_create",
        DrainDelete => "drain_delete",
        SyncCreated => "sync_created",
        DeleteSource => "delete_source",
    }
);

impl TaskName {
    pub fn description(&self) -> &'static str {
        match self {
            TaskName::ReconcileSource => "Collect item URLs after a source link is registered",
            TaskName::RecheckSources => "Scheduled to_create/to_delete recheck of parsed sources",
            TaskName::DrainCreate => "Parse items queued in to_create",
            TaskName::DrainDelete => "Remove marketplace listings queued in to_delete",
            TaskName::SyncCreated => "Publish created items to the marketplace",
            TaskName::DeleteSource => "Retire a source link and its marketplace listings",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// A registered crawl target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLink {
    pub id: SourceLinkId,
    pub url: String,
    pub category: Option<String>,
    pub owner: Option<String>,
    pub parse_status: ParseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_recheck_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSourceLink {
    pub url: String,
    pub category: Option<String>,
    pub owner: Option<String>,
}

/// Descriptive attributes scraped for one listing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemFields {
    pub brand: String,
    pub model: Option<String>,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub price: Option<i64>,
    pub year: Option<i32>,
    pub mileage: Option<i64>,
    pub color: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
    /// Folder in the image store holding this item's photos, in listing order.
    pub image_folder: Option<String>,
}

impl ItemFields {
    /// Names of mandatory fields that are absent; empty means publishable.
    pub fn missing_mandatory(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.brand.trim().is_empty() {
            missing.push("brand");
        }
        if self.price.is_none() {
            missing.push("price");
        }
        if self.year.is_none() {
            missing.push("year");
        }
        missing
    }
}

/// One listing discovered under a source link, keyed by its URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// `None` once the owning source link has been retired.
    pub source_link_id: Option<SourceLinkId>,
    pub url: String,
    pub fields: ItemFields,
    pub remote_id: Option<i64>,
    pub status: ItemStatus,
    pub is_published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub kind: ChangeKind,
    pub source_link_id: SourceLinkId,
    pub item_url: String,
    pub status: ChangeStatus,
}

/// A pending ToCreate entry together with its owning source link URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCreate {
    pub record: ChangeRecord,
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub t: DateTime<Utc>,
    pub level: LogLevel,
    pub msg: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, msg: &str, max_bytes: usize) -> Self {
        Self {
            t: Utc::now(),
            level,
            msg: truncate_utf8(msg, max_bytes).to_string(),
        }
    }
}

/// Ordered, capped log lines of one run. Oldest entries are evicted first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogTrail {
    entries: VecDeque<LogEntry>,
}

impl LogTrail {
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    pub fn push(&mut self, entry: LogEntry, cap: usize) {
        self.entries.push_back(entry);
        let cap = cap.max(1);
        while self.entries.len() > cap {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub task_name: TaskName,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub logs: LogTrail,
}

/// Cuts `s` to at most `max_bytes`, never splitting a UTF-8 character.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Insert(ItemStatus),
    Overwrite(ItemStatus),
    /// Existing record is terminal; fields stay untouched.
    Skip { queue_deletion: bool },
}

/// Decides what a detail re-fetch may do to the stored record for a URL.
pub fn decide_upsert(existing: Option<ItemStatus>, explicit: Option<ItemStatus>) -> UpsertAction {
    match existing {
        None => UpsertAction::Insert(explicit.unwrap_or(ItemStatus::Created)),
        Some(current) if current.is_terminal() => UpsertAction::Skip {
            queue_deletion: explicit == Some(ItemStatus::Failed),
        },
        Some(_) => UpsertAction::Overwrite(explicit.unwrap_or(ItemStatus::Updated)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct UrlDiff {
    pub to_delete: Vec<String>,
    pub to_create: Vec<String>,
}

/// Diffs stored item URLs against a fresh crawl.
///
/// `to_delete` keeps the stored order, `to_create` keeps crawl order; both
/// are de-duplicated.
pub fn diff_urls(stored: &[String], fresh: &[String]) -> UrlDiff {
    let stored_set: HashSet<&str> = stored.iter().map(String::as_str).collect();
    let fresh_set: HashSet<&str> = fresh.iter().map(String::as_str).collect();

    let mut seen = HashSet::new();
    let to_delete = stored
        .iter()
        .filter(|url| !fresh_set.contains(url.as_str()) && seen.insert(url.as_str()))
        .cloned()
        .collect();

    let mut seen = HashSet::new();
    let to_create = fresh
        .iter()
        .filter(|url| !stored_set.contains(url.as_str()) && seen.insert(url.as_str()))
        .cloned()
        .collect();

    UrlDiff {
        to_delete,
        to_create,
    }
}

/// All ASCII digits of `text` read as one integer: `"12 300 $"` is 12300.
pub fn parse_digits(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// First decimal number in `text`, accepting `.` or `,` as the separator.
pub fn parse_decimal(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let mut number = String::new();
    let mut seen_separator = false;
    for c in text[start..].chars() {
        match c {
            '0'..='9' => number.push(c),
            '.' | ',' if !seen_separator => {
                seen_separator = true;
                number.push('.');
            }
            _ => break,
        }
    }
    number.trim_end_matches('.').parse().ok()
}

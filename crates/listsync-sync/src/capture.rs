//! Copies tracing events recorded under a `task_run` span into the trail of
//! that run, so collector and market warnings show up next to the ledger's
//! own lines.
//!
//! The layer only buffers; the ledger drains the buffer into the store the
//! next time the run logs, and when it finishes.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use listsync_core::{truncate_utf8, LogEntry, LogLevel, RunId};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const RUN_SPAN: &str = "task_run";

/// The ledger writes its own lines straight to the store.
const LEDGER_TARGET: &str = "listsync_sync::ledger";

/// Would echo the trail writes back into the trail.
const STORE_TARGET_PREFIX: &str = "sqlx";

#[derive(Debug, Clone)]
struct Captured {
    t: DateTime<Utc>,
    level: LogLevel,
    msg: String,
}

/// Shared buffer between the tracing layer and the run ledger.
#[derive(Debug, Clone)]
pub struct RunLogCapture {
    runs: Arc<Mutex<HashMap<RunId, VecDeque<Captured>>>>,
    cap: usize,
}

impl RunLogCapture {
    /// `cap` bounds the lines held per run between two drains.
    pub fn new(cap: usize) -> Self {
        Self {
            runs: Arc::default(),
            cap: cap.max(1),
        }
    }

    pub fn layer(&self) -> RunLogLayer {
        RunLogLayer {
            capture: self.clone(),
        }
    }

    /// Starts buffering for `run_id`. Events for runs nobody opened are dropped.
    pub fn open(&self, run_id: RunId) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.entry(run_id).or_default();
        }
    }

    pub fn close(&self, run_id: RunId) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(&run_id);
        }
    }

    /// Removes and returns what was captured for `run_id` so far, oldest first.
    pub fn drain(&self, run_id: RunId, entry_bytes: usize) -> Vec<LogEntry> {
        let Ok(mut runs) = self.runs.lock() else {
            return Vec::new();
        };
        let Some(buffer) = runs.get_mut(&run_id) else {
            return Vec::new();
        };
        buffer
            .drain(..)
            .map(|c| LogEntry {
                t: c.t,
                level: c.level,
                msg: truncate_utf8(&c.msg, entry_bytes).to_string(),
            })
            .collect()
    }

    fn push(&self, run_id: RunId, captured: Captured) {
        let Ok(mut runs) = self.runs.lock() else {
            return;
        };
        if let Some(buffer) = runs.get_mut(&run_id) {
            buffer.push_back(captured);
            while buffer.len() > self.cap {
                buffer.pop_front();
            }
        }
    }
}

/// Marks a `task_run` span with the run it belongs to.
struct RunTag(RunId);

pub struct RunLogLayer {
    capture: RunLogCapture,
}

impl<S> Layer<S> for RunLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != RUN_SPAN {
            return;
        }
        let mut visitor = RunIdVisitor(None);
        attrs.record(&mut visitor);
        if let (Some(run_id), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(RunTag(run_id));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let target = event.metadata().target();
        if target == LEDGER_TARGET || target.starts_with(STORE_TARGET_PREFIX) {
            return;
        }
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        let Some(run_id) = scope
            .into_iter()
            .find_map(|span| span.extensions().get::<RunTag>().map(|tag| tag.0))
        else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.capture.push(
            run_id,
            Captured {
                t: Utc::now(),
                level: level_of(event.metadata().level()),
                msg: visitor.finish(),
            },
        );
    }
}

fn level_of(level: &Level) -> LogLevel {
    match *level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warn,
        Level::INFO => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

struct RunIdVisitor(Option<RunId>);

impl Visit for RunIdVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "run_id" {
            self.0 = Some(value);
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "run_id" {
            self.0 = RunId::try_from(value).ok();
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

/// Renders an event as `message key=value ...`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }

    fn field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.field(field.name(), format_args!("{value:?}"));
        }
    }
}

//! Run records: one per task invocation, with a bounded log trail.

use std::sync::Arc;

use anyhow::{Context, Result};
use listsync_core::{LogEntry, LogLevel, RunId, RunStatus, TaskName};
use listsync_storage::{is_store_unavailable, ListingStore};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, info_span, warn, Span};

use crate::capture::RunLogCapture;

/// Summary a task hands back to the ledger when it completes.
pub trait TaskReport: Serialize {
    fn summary(&self) -> String;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<T> {
    Completed { run_id: RunId, report: T },
    /// The run failed and was recorded; the error was not propagated.
    Failed { run_id: RunId, message: String },
}

impl<T> RunOutcome<T> {
    pub fn run_id(&self) -> RunId {
        match self {
            Self::Completed { run_id, .. } | Self::Failed { run_id, .. } => *run_id,
        }
    }

    pub fn report(&self) -> Option<&T> {
        match self {
            Self::Completed { report, .. } => Some(report),
            Self::Failed { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

#[derive(Clone)]
pub struct RunLedger {
    store: Arc<dyn ListingStore>,
    trail_cap: usize,
    entry_bytes: usize,
    capture: Option<RunLogCapture>,
}

impl RunLedger {
    pub fn new(store: Arc<dyn ListingStore>, trail_cap: usize, entry_bytes: usize) -> Self {
        Self {
            store,
            trail_cap,
            entry_bytes,
            capture: None,
        }
    }

    /// Also records events other modules emit while a run is in progress.
    pub fn with_capture(mut self, capture: RunLogCapture) -> Self {
        self.capture = Some(capture);
        self
    }

    pub async fn start(&self, task: TaskName, details: Map<String, Value>) -> Result<RunScope> {
        let run_id = self
            .store
            .start_run(task, details)
            .await
            .with_context(|| format!("starting {task} run"))?;
        info!(run_id, task = task.as_str(), "run started");
        if let Some(capture) = &self.capture {
            capture.open(run_id);
        }
        Ok(RunScope {
            ledger: self.clone(),
            run_id,
            task,
            span: info_span!("task_run", run_id, task = task.as_str()),
        })
    }
}

/// Log sink for one running task. Consumed by [`RunScope::finish`], so
/// nothing can log into a run after it has been closed.
pub struct RunScope {
    ledger: RunLedger,
    run_id: RunId,
    task: TaskName,
    span: Span,
}

impl RunScope {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn task(&self) -> TaskName {
        self.task
    }

    /// Span the task body runs under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub async fn debug(&self, msg: &str) {
        self.log(LogLevel::Debug, msg).await;
    }

    pub async fn info(&self, msg: &str) {
        self.log(LogLevel::Info, msg).await;
    }

    pub async fn warn(&self, msg: &str) {
        self.log(LogLevel::Warn, msg).await;
    }

    pub async fn error(&self, msg: &str) {
        self.log(LogLevel::Error, msg).await;
    }

    pub async fn log(&self, level: LogLevel, msg: &str) {
        let run_id = self.run_id;
        let task = self.task.as_str();
        match level {
            LogLevel::Debug => debug!(run_id, task, "{msg}"),
            LogLevel::Info => info!(run_id, task, "{msg}"),
            LogLevel::Warn => warn!(run_id, task, "{msg}"),
            LogLevel::Error => error!(run_id, task, "{msg}"),
        }

        if let Some(capture) = &self.ledger.capture {
            for entry in capture.drain(run_id, self.ledger.entry_bytes) {
                self.append(entry).await;
            }
        }
        self.append(LogEntry::new(level, msg, self.ledger.entry_bytes)).await;
    }

    async fn append(&self, entry: LogEntry) {
        let run_id = self.run_id;
        if let Err(err) = self
            .ledger
            .store
            .append_run_log(run_id, entry, self.ledger.trail_cap)
            .await
        {
            warn!(run_id, error = %err, "dropping run log entry");
        }
    }

    /// Closes the run. Errors caused by an unreachable store propagate;
    /// every other failure is recorded and returned as `RunOutcome::Failed`.
    pub async fn finish<T: TaskReport>(self, result: Result<T>) -> Result<RunOutcome<T>> {
        let run_id = self.run_id;
        match result {
            Ok(report) => {
                let summary = report.summary();
                self.info(&summary).await;
                self.ledger
                    .store
                    .finish_run(run_id, RunStatus::Success, Some(&summary), report_details(&report))
                    .await
                    .with_context(|| format!("finishing run {run_id}"))?;
                Ok(RunOutcome::Completed { run_id, report })
            }
            Err(err) => {
                let message = format!("{err:#}");
                self.error(&message).await;
                let recorded = self
                    .ledger
                    .store
                    .finish_run(run_id, RunStatus::Failed, Some(&message), Map::new())
                    .await;
                if is_store_unavailable(&err) {
                    return Err(err);
                }
                if let Err(finish_err) = recorded {
                    if is_store_unavailable(&finish_err) {
                        return Err(finish_err);
                    }
                    warn!(run_id, error = %finish_err, "could not record failed run");
                }
                Ok(RunOutcome::Failed { run_id, message })
            }
        }
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        if let Some(capture) = &self.ledger.capture {
            capture.close(self.run_id);
        }
    }
}

fn report_details<T: Serialize>(report: &T) -> Map<String, Value> {
    match serde_json::to_value(report) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

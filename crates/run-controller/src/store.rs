//! Collaborator interfaces consumed by the run creator and the sweeper.
//!
//! Cancellation follows the usual async contract: every call returns a future
//! and dropping it (for example from a `tokio::select!` branch or a timeout)
//! abandons the call.

use crate::error::Result;
use crate::model::{Codespec, LogOptions, NewRun, Run, RunUpdate};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use std::pin::Pin;

/// A stream of raw log bytes, chunked arbitrarily.
pub type LogStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Durable record of run metadata and status.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert a `Pending` run with `resources_created = false` and assign its id.
    async fn create_run(&self, new_run: NewRun) -> Result<Run>;

    /// Apply `update` to the stored run. When `update.is_final` is set, the
    /// status, reason and `finished_at` of `run` are persisted and the record
    /// is frozen. `logs_archived_at` is only ever written once.
    async fn update_run(&self, run: &Run, update: RunUpdate) -> Result<()>;

    async fn get_run(&self, id: i64) -> Result<Option<Run>>;

    /// A bounded page of runs whose resources were never recorded as created.
    /// Empty once there are none left.
    async fn get_page_of_runs_missing_resources(&self) -> Result<Vec<Run>>;

    async fn delete_run(&self, id: i64) -> Result<()>;

    /// Runs newest first, optionally created after `since`.
    async fn list_runs(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
        continuation: Option<&str>,
    ) -> Result<(Vec<Run>, Option<String>)>;

    /// Move a non-terminal run to `Cancelling`. Returns the stored run, or
    /// `None` when it does not exist.
    async fn cancel_run(&self, id: i64) -> Result<Option<Run>>;
}

/// Resolves versioned codespec references.
#[async_trait]
pub trait CodespecResolver: Send + Sync {
    async fn get_latest_codespec(&self, name: &str) -> Result<Option<Codespec>>;

    async fn get_codespec_at_version(&self, name: &str, version: i32) -> Result<Option<Codespec>>;
}

/// Issues time-limited, direction-scoped access URIs for buffers.
#[async_trait]
pub trait BufferBinder: Send + Sync {
    /// `None` when the buffer does not exist.
    async fn resolve_access(&self, buffer_id: &str, writable: bool) -> Result<Option<String>>;
}

/// Live logs of a run, in the cluster's per-line-timestamped format when
/// timestamps are requested.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// `None` when the run or its logs cannot be found.
    async fn get_log_stream(&self, run_id: i64, options: &LogOptions) -> Result<Option<LogStream>>;
}

/// Long-term storage for run logs.
#[async_trait]
pub trait LogArchive: Send + Sync {
    async fn archive_logs(&self, run_id: i64, logs: LogStream) -> Result<()>;

    async fn get_archived_logs(&self, run_id: i64) -> Result<Option<LogStream>>;
}

#[must_use]
pub fn empty_log_stream() -> LogStream {
    Box::pin(stream::empty())
}

/// A log stream yielding `bytes` as a single chunk.
#[must_use]
pub fn log_stream_from(bytes: impl Into<Bytes>) -> LogStream {
    let bytes: Bytes = bytes.into();
    Box::pin(stream::once(async move { Ok(bytes) }))
}

/// Drains a log stream into memory.
pub async fn collect_log_stream(logs: LogStream) -> std::io::Result<Vec<u8>> {
    logs.try_fold(Vec::new(), |mut acc, chunk| async move {
        acc.extend_from_slice(&chunk);
        Ok(acc)
    })
    .await
}

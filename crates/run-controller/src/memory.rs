//! In-process implementations of the collaborator traits.
//!
//! `MemoryRepository` backs the binary when no external store is wired in and
//! is what the lifecycle tests run against. `FileLogArchive` keeps archived
//! logs in a directory.

use crate::error::{Error, Result};
use crate::model::{Codespec, LogOptions, NewRun, Run, RunStatus, RunUpdate};
use crate::store::{
    collect_log_stream, BufferBinder, CodespecResolver, LogArchive, LogSource, LogStream,
    RunRepository,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Maximum number of runs returned by one orphan page.
const MISSING_RESOURCES_PAGE_SIZE: usize = 100;

/// Runs younger than this are still being created and are not orphans yet.
const DEFAULT_ORPHAN_MIN_AGE: Duration = Duration::from_secs(60);

#[derive(Default)]
struct RepositoryState {
    next_id: i64,
    runs: BTreeMap<i64, Run>,
    codespecs: BTreeMap<String, BTreeMap<i32, Codespec>>,
}

pub struct MemoryRepository {
    state: Mutex<RepositoryState>,
    orphan_min_age: Duration,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RepositoryState::default()),
            orphan_min_age: DEFAULT_ORPHAN_MIN_AGE,
        }
    }

    /// Override how old a run without resources must be before it is reported as an orphan.
    #[must_use]
    pub fn with_orphan_min_age(mut self, age: Duration) -> Self {
        self.orphan_min_age = age;
        self
    }

    /// Store a codespec under its own `(name, version)`.
    pub async fn insert_codespec(&self, codespec: Codespec) {
        let mut state = self.state.lock().await;
        state
            .codespecs
            .entry(codespec.name.clone())
            .or_default()
            .insert(codespec.version, codespec);
    }

    pub async fn run_count(&self) -> usize {
        self.state.lock().await.runs.len()
    }
}

#[async_trait]
impl RunRepository for MemoryRepository {
    async fn create_run(&self, new_run: NewRun) -> Result<Run> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let run = Run::from_new_run(state.next_id, new_run, Utc::now());
        state.runs.insert(run.id, run.clone());
        debug!(run_id = run.id, "Inserted run record");
        Ok(run)
    }

    async fn update_run(&self, run: &Run, update: RunUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| Error::Store(format!("run {} not found", run.id)))?;

        if stored.is_final {
            debug!(run_id = run.id, "Ignoring update of a final run");
            return Ok(());
        }

        if let Some(created) = update.resources_created {
            stored.resources_created = created;
        }

        if let Some(at) = update.logs_archived_at {
            stored.logs_archived_at.get_or_insert(at);
        }

        if update.is_final {
            if !stored.status.is_terminal() {
                stored.status = run.status;
                stored.status_reason.clone_from(&run.status_reason);
                stored.finished_at = run.finished_at.or_else(|| Some(Utc::now()));
            }
            stored.is_final = true;
        }

        Ok(())
    }

    async fn get_run(&self, id: i64) -> Result<Option<Run>> {
        Ok(self.state.lock().await.runs.get(&id).cloned())
    }

    async fn get_page_of_runs_missing_resources(&self) -> Result<Vec<Run>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.orphan_min_age)
                .map_err(|e| Error::Store(e.to_string()))?;
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .filter(|run| !run.resources_created && run.created_at <= cutoff)
            .take(MISSING_RESOURCES_PAGE_SIZE)
            .cloned()
            .collect())
    }

    async fn delete_run(&self, id: i64) -> Result<()> {
        self.state.lock().await.runs.remove(&id);
        Ok(())
    }

    async fn list_runs(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
        continuation: Option<&str>,
    ) -> Result<(Vec<Run>, Option<String>)> {
        let before = continuation.map(parse_continuation).transpose()?;

        let state = self.state.lock().await;
        let mut matching = state
            .runs
            .values()
            .rev()
            .filter(|run| before.map_or(true, |before| run.id < before))
            .filter(|run| since.map_or(true, |since| run.created_at > since));

        let page: Vec<Run> = matching.by_ref().take(limit).cloned().collect();
        let next = match (page.last(), matching.next()) {
            (Some(last), Some(_)) => Some(last.id.to_string()),
            _ => None,
        };
        Ok((page, next))
    }

    async fn cancel_run(&self, id: i64) -> Result<Option<Run>> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.runs.get_mut(&id) else {
            return Ok(None);
        };
        if !stored.is_final && !stored.status.is_terminal() {
            stored.status = RunStatus::Cancelling;
        }
        Ok(Some(stored.clone()))
    }
}

fn parse_continuation(token: &str) -> Result<i64> {
    token
        .parse()
        .map_err(|_| Error::validation(format!("Invalid continuation token '{token}'")))
}

#[async_trait]
impl CodespecResolver for MemoryRepository {
    async fn get_latest_codespec(&self, name: &str) -> Result<Option<Codespec>> {
        let state = self.state.lock().await;
        Ok(state
            .codespecs
            .get(name)
            .and_then(|versions| versions.values().next_back())
            .cloned())
    }

    async fn get_codespec_at_version(&self, name: &str, version: i32) -> Result<Option<Codespec>> {
        let state = self.state.lock().await;
        Ok(state
            .codespecs
            .get(name)
            .and_then(|versions| versions.get(&version))
            .cloned())
    }
}

/// Buffers known to this process, addressed by id.
pub struct MemoryBufferStore {
    base_uri: String,
    validity: Duration,
    buffers: Mutex<BTreeMap<String, ()>>,
}

impl MemoryBufferStore {
    #[must_use]
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            base_uri: base_uri.into(),
            validity: Duration::from_secs(3600),
            buffers: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn add_buffer(&self, id: impl Into<String>) {
        self.buffers.lock().await.insert(id.into(), ());
    }
}

#[async_trait]
impl BufferBinder for MemoryBufferStore {
    async fn resolve_access(&self, buffer_id: &str, writable: bool) -> Result<Option<String>> {
        if !self.buffers.lock().await.contains_key(buffer_id) {
            return Ok(None);
        }

        let expiry = Utc::now()
            + chrono::Duration::from_std(self.validity).map_err(|e| Error::Store(e.to_string()))?;
        let permissions = if writable { "rw" } else { "r" };
        Ok(Some(format!(
            "{}/{buffer_id}?sp={permissions}&se={}",
            self.base_uri.trim_end_matches('/'),
            expiry.format("%Y-%m-%dT%H:%M:%SZ")
        )))
    }
}

/// Serves canned log chunks per run.
#[derive(Default)]
pub struct MemoryLogSource {
    logs: Mutex<HashMap<i64, Vec<Bytes>>>,
}

impl MemoryLogSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the chunks the source yields for `run_id`, in order.
    pub async fn set_logs(&self, run_id: i64, chunks: Vec<Bytes>) {
        self.logs.lock().await.insert(run_id, chunks);
    }
}

#[async_trait]
impl LogSource for MemoryLogSource {
    async fn get_log_stream(
        &self,
        run_id: i64,
        _options: &LogOptions,
    ) -> Result<Option<LogStream>> {
        let chunks = self.logs.lock().await.get(&run_id).cloned();
        Ok(chunks.map(|chunks| -> LogStream {
            Box::pin(stream::iter(chunks.into_iter().map(Ok)))
        }))
    }
}

/// Keeps archived logs in memory and counts archive calls per run.
#[derive(Default)]
pub struct MemoryLogArchive {
    archived: Mutex<HashMap<i64, (Vec<u8>, usize)>>,
}

impl MemoryLogArchive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn archived_bytes(&self, run_id: i64) -> Option<Vec<u8>> {
        self.archived
            .lock()
            .await
            .get(&run_id)
            .map(|(bytes, _)| bytes.clone())
    }

    pub async fn archive_count(&self, run_id: i64) -> usize {
        self.archived
            .lock()
            .await
            .get(&run_id)
            .map_or(0, |(_, count)| *count)
    }
}

#[async_trait]
impl LogArchive for MemoryLogArchive {
    async fn archive_logs(&self, run_id: i64, logs: LogStream) -> Result<()> {
        let bytes = collect_log_stream(logs).await?;
        let mut archived = self.archived.lock().await;
        let entry = archived.entry(run_id).or_insert_with(|| (Vec::new(), 0));
        entry.0 = bytes;
        entry.1 += 1;
        Ok(())
    }

    async fn get_archived_logs(&self, run_id: i64) -> Result<Option<LogStream>> {
        let archived = self.archived.lock().await;
        Ok(archived
            .get(&run_id)
            .map(|(bytes, _)| crate::store::log_stream_from(bytes.clone())))
    }
}

/// Writes each run's logs to `<directory>/<run id>.log`.
pub struct FileLogArchive {
    directory: PathBuf,
}

impl FileLogArchive {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path_for(&self, run_id: i64) -> PathBuf {
        self.directory.join(format!("{run_id}.log"))
    }
}

#[async_trait]
impl LogArchive for FileLogArchive {
    async fn archive_logs(&self, run_id: i64, mut logs: LogStream) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;

        // Write next to the final file and rename so readers never see a partial archive.
        let final_path = self.path_for(run_id);
        let partial_path = self.directory.join(format!("{run_id}.log.partial"));
        let mut file = tokio::fs::File::create(&partial_path).await?;
        let mut written = 0usize;
        while let Some(chunk) = logs.next().await {
            let chunk = chunk?;
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial_path, &final_path).await?;

        debug!(
            run_id,
            bytes = written,
            path = %final_path.display(),
            "Wrote log archive"
        );
        Ok(())
    }

    async fn get_archived_logs(&self, run_id: i64) -> Result<Option<LogStream>> {
        match tokio::fs::File::open(self.path_for(run_id)).await {
            Ok(file) => Ok(Some(Box::pin(ReaderStream::new(file)))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Archive(format!(
                "failed to open archived logs for run {run_id}: {e}"
            ))),
        }
    }
}

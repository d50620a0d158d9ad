//! Queries and requests on existing runs.

use super::reader::observed_status;
use crate::cluster::ClusterClient;
use crate::error::Result;
use crate::logging::reformat_log_stream;
use crate::metadata;
use crate::model::{LogOptions, Run, RunStatus};
use crate::store::{LogArchive, LogSource, LogStream, RunRepository};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 200;

pub struct RunManager {
    repository: Arc<dyn RunRepository>,
    cluster: Arc<dyn ClusterClient>,
    log_source: Arc<dyn LogSource>,
    log_archive: Arc<dyn LogArchive>,
}

impl RunManager {
    pub fn new(
        repository: Arc<dyn RunRepository>,
        cluster: Arc<dyn ClusterClient>,
        log_source: Arc<dyn LogSource>,
        log_archive: Arc<dyn LogArchive>,
    ) -> Self {
        Self {
            repository,
            cluster,
            log_source,
            log_archive,
        }
    }

    /// The stored run, with its status refined from the live job while it is not final.
    pub async fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let Some(mut run) = self.repository.get_run(id).await? else {
            return Ok(None);
        };

        if run.is_final || !run.resources_created || run.status.is_terminal() {
            return Ok(Some(run));
        }

        // A cancellation request stays visible until the sweeper finalizes it.
        if run.status != RunStatus::Cancelling {
            if let Some(job) = self.cluster.get_job(&metadata::job_name(id)).await? {
                run.status = observed_status(&job);
            }
        }
        Ok(Some(run))
    }

    pub async fn list_runs(
        &self,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
        continuation: Option<&str>,
    ) -> Result<(Vec<Run>, Option<String>)> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        self.repository.list_runs(limit, since, continuation).await
    }

    /// Request cancellation. The sweeper carries it out on its next pass.
    pub async fn cancel_run(&self, id: i64) -> Result<Option<Run>> {
        let run = self.repository.cancel_run(id).await?;
        if let Some(run) = &run {
            info!(run_id = id, status = %run.status, "Cancellation requested");
        }
        Ok(run)
    }

    /// Logs of a run: from the archive once archived, otherwise live from the cluster.
    pub async fn get_logs(&self, id: i64, options: &LogOptions) -> Result<Option<LogStream>> {
        let Some(run) = self.repository.get_run(id).await? else {
            return Ok(None);
        };

        if run.logs_archived_at.is_some() {
            debug!(run_id = id, "Serving archived logs");
            return self.log_archive.get_archived_logs(id).await;
        }

        let logs = self.log_source.get_log_stream(id, options).await?;
        Ok(match logs {
            Some(logs) if options.include_timestamps => Some(reformat_log_stream(logs)),
            logs => logs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::memory::{MemoryLogArchive, MemoryLogSource, MemoryRepository};
    use crate::model::{NewRun, RunCodeTarget, RunUpdate};
    use crate::runs::reader::tests::job;
    use crate::store::collect_log_stream;
    use bytes::Bytes;
    use k8s_openapi::api::batch::v1::JobStatus;

    struct Harness {
        manager: RunManager,
        repository: Arc<MemoryRepository>,
        cluster: Arc<FakeCluster>,
        logs: Arc<MemoryLogSource>,
        archive: Arc<MemoryLogArchive>,
    }

    fn harness() -> Harness {
        let repository = Arc::new(MemoryRepository::new());
        let cluster = Arc::new(FakeCluster::default());
        let logs = Arc::new(MemoryLogSource::new());
        let archive = Arc::new(MemoryLogArchive::new());
        let manager = RunManager::new(
            repository.clone(),
            cluster.clone(),
            logs.clone(),
            archive.clone(),
        );
        Harness {
            manager,
            repository,
            cluster,
            logs,
            archive,
        }
    }

    async fn created_run(repository: &MemoryRepository) -> Run {
        let run = repository
            .create_run(NewRun {
                job: RunCodeTarget::new("trainer/versions/1"),
                worker: None,
                cluster: None,
                timeout_seconds: Some(60),
            })
            .await
            .unwrap();
        repository
            .update_run(&run, RunUpdate::resources_created())
            .await
            .unwrap();
        repository.get_run(run.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_get_run_refines_status_from_job() {
        let h = harness();
        let run = created_run(&h.repository).await;
        let fetched = h.manager.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Pending);

        let status = JobStatus {
            active: Some(1),
            ..JobStatus::default()
        };
        let mut running = job(1, status);
        running.metadata.name = Some(metadata::job_name(run.id));
        h.cluster.insert_job(running);
        let fetched = h.manager.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Running);

        // The stored record is untouched.
        let stored = h.repository.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Pending);

        assert!(h.manager.get_run(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_run() {
        let h = harness();
        let run = created_run(&h.repository).await;
        let cancelled = h.manager.cancel_run(run.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelling);
        assert_eq!(
            h.manager.get_run(run.id).await.unwrap().unwrap().status,
            RunStatus::Cancelling
        );
        assert!(h.manager.cancel_run(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_runs_clamps_limit() {
        let h = harness();
        for _ in 0..3 {
            created_run(&h.repository).await;
        }
        let (runs, next) = h.manager.list_runs(Some(0), None, None).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(next.is_some());
        let (runs, _) = h.manager.list_runs(None, None, None).await.unwrap();
        assert_eq!(runs.len(), 3);
    }

    #[tokio::test]
    async fn test_get_logs_prefers_archive() {
        let h = harness();
        let run = created_run(&h.repository).await;
        h.logs
            .set_logs(run.id, vec![Bytes::from_static(b"connection refused\n")])
            .await;

        let options = LogOptions {
            include_timestamps: true,
            ..LogOptions::default()
        };
        let live = h.manager.get_logs(run.id, &options).await.unwrap().unwrap();
        assert_eq!(
            collect_log_stream(live).await.unwrap(),
            b"0001-01-01T00:00:00.000000000Z connection refused\n"
        );

        let raw = h
            .manager
            .get_logs(run.id, &LogOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            collect_log_stream(raw).await.unwrap(),
            b"connection refused\n"
        );


        h.archive
            .archive_logs(run.id, crate::store::log_stream_from("archived\n"))
            .await
            .unwrap();
        h.repository
            .update_run(&run, RunUpdate::logs_archived_at(Utc::now()))
            .await
            .unwrap();
        let archived = h.manager.get_logs(run.id, &options).await.unwrap().unwrap();
        assert_eq!(collect_log_stream(archived).await.unwrap(), b"archived\n");
    }
}

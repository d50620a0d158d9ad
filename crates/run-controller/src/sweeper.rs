//! Background reconciliation of runs against the cluster.
//!
//! Each sweep first removes runs whose creation never got as far as recording
//! its cluster objects, then walks every run job on the cluster and moves its
//! run along: archive logs, wait out the grace period, record the final
//! status, delete the objects. Every step is gated on a field of the run
//! record, so repeating a sweep after a crash never repeats a side effect
//! that already completed.

use crate::cluster::{ClusterClient, ResourceKind};
use crate::config::SweeperConfig;
use crate::error::Result;
use crate::logging::reformat_log_stream;
use crate::metadata::{self, FINALIZER_NAME, LABEL_JOB};
use crate::model::{LogOptions, Run, RunStatus, RunUpdate};
use crate::runs::reader::{has_job_failed, has_job_succeeded, update_run_from_job_and_pods};
use crate::store::{empty_log_stream, LogArchive, LogSource, RunRepository};
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const CANCELLED_REASON: &str = "Cancelled";

/// What a sweep does with one run job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// The job is still running.
    Skip,
    /// No run record exists for the job; delete its objects.
    DeleteOrphan,
    /// Archive logs and record the run as cancelled.
    CancelAndArchive,
    /// Archive logs; the final status waits for the grace period.
    ArchiveLogs,
    /// Logs were archived less than a grace period ago.
    Wait,
    /// Record the final status if not yet recorded and delete the objects.
    Finalize,
}

impl SweepAction {
    #[must_use]
    pub fn decide(job: &Job, run: Option<&Run>, now: DateTime<Utc>, grace: Duration) -> Self {
        let done = run.is_some_and(|run| run.status == RunStatus::Cancelling || run.is_final)
            || has_job_succeeded(job)
            || has_job_failed(job);
        if !done {
            return SweepAction::Skip;
        }

        let Some(run) = run else {
            return SweepAction::DeleteOrphan;
        };

        match (run.logs_archived_at, run.status) {
            (None, RunStatus::Cancelling) => SweepAction::CancelAndArchive,
            (None, _) => SweepAction::ArchiveLogs,
            (Some(archived_at), _) => {
                let settled = (now - archived_at)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed >= grace);
                if settled {
                    SweepAction::Finalize
                } else {
                    SweepAction::Wait
                }
            }
        }
    }
}

fn mark_cancelled(run: &mut Run, now: DateTime<Utc>) {
    run.status = RunStatus::Failed;
    run.status_reason = Some(CANCELLED_REASON.to_string());
    run.finished_at = Some(now);
}

pub struct RunSweeper {
    repository: Arc<dyn RunRepository>,
    cluster: Arc<dyn ClusterClient>,
    log_source: Arc<dyn LogSource>,
    log_archive: Arc<dyn LogArchive>,
    interval: Duration,
    archive_grace: Duration,
}

impl RunSweeper {
    pub fn new(
        config: &SweeperConfig,
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
            interval: config.interval(),
            archive_grace: config.archive_grace(),
        }
    }

    /// Spawn the sweep loop. It sweeps once per interval until the handle is stopped.
    pub fn start(self: Arc<Self>) -> SweeperHandle {
        let token = CancellationToken::new();
        let join = tokio::spawn(self.run(token.clone()));
        SweeperHandle { token, join }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            interval_seconds = self.interval.as_secs(),
            "Sweeper started"
        );
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }

            // An in-flight sweep is not interrupted by cancellation; stop() bounds the wait.
            debug!("Background sweep starting");
            match self.sweep_runs().await {
                Ok(()) => debug!("Background sweep completed"),
                Err(e) => error!(error = %e, "Error during background sweep"),
            }
        }
        info!("Sweeper stopped");
    }

    pub async fn sweep_runs(&self) -> Result<()> {
        self.sweep_runs_at(Utc::now()).await
    }

    /// One full sweep, treating `now` as the current time.
    #[instrument(skip(self))]
    pub async fn sweep_runs_at(&self, now: DateTime<Utc>) -> Result<()> {
        self.delete_runs_missing_resources().await?;

        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .cluster
                .list_jobs(LABEL_JOB, continuation.as_deref())
                .await?;

            for job in &page.items {
                if let Err(e) = self.sweep_job(job, now).await {
                    warn!(
                        job = job.metadata.name.as_deref().unwrap_or_default(),
                        error = %e,
                        "Failed to reconcile run job"
                    );
                }
            }

            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(())
    }

    /// Remove runs whose cluster objects were never recorded as created, with
    /// whatever objects their creation may have left behind.
    pub async fn delete_runs_missing_resources(&self) -> Result<()> {
        loop {
            let page = self.repository.get_page_of_runs_missing_resources().await?;
            if page.is_empty() {
                return Ok(());
            }
            for run in page {
                info!(run_id = run.id, "Deleting run that never created resources");
                self.delete_run_resources(run.id).await?;
                self.repository.delete_run(run.id).await?;
            }
        }
    }

    async fn sweep_job(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let Some(run_id) = metadata::run_id_from_labels(job.metadata.labels.as_ref(), LABEL_JOB)
        else {
            warn!(
                job = job.metadata.name.as_deref().unwrap_or_default(),
                "Job has no usable run id label"
            );
            return Ok(());
        };

        let run = self.repository.get_run(run_id).await?;
        let action = SweepAction::decide(job, run.as_ref(), now, self.archive_grace);
        debug!(run_id, ?action, "Sweeping run job");

        match (action, run) {
            (SweepAction::Skip | SweepAction::Wait, _) => {}
            (SweepAction::DeleteOrphan, _) | (_, None) => {
                info!(run_id, "Deleting resources of job without a run record");
                self.delete_run_resources(run_id).await?;
            }
            (SweepAction::CancelAndArchive, Some(mut run)) => {
                self.archive_logs(run_id).await?;
                mark_cancelled(&mut run, now);
                self.repository
                    .update_run(
                        &run,
                        RunUpdate {
                            logs_archived_at: Some(now),
                            is_final: true,
                            ..RunUpdate::default()
                        },
                    )
                    .await?;
                info!(run_id, "Cancelled run");
            }
            (SweepAction::ArchiveLogs, Some(run)) => {
                self.archive_logs(run_id).await?;
                self.repository
                    .update_run(&run, RunUpdate::logs_archived_at(now))
                    .await?;
            }
            (SweepAction::Finalize, Some(mut run)) => {
                if !run.is_final {
                    if run.status == RunStatus::Cancelling {
                        mark_cancelled(&mut run, now);
                    } else {
                        let pods = self
                            .cluster
                            .list_pods(&metadata::job_selector(run_id))
                            .await?;
                        update_run_from_job_and_pods(&mut run, job, &pods, now);
                    }
                    info!(
                        run_id,
                        status = %run.status,
                        reason = run.status_reason.as_deref().unwrap_or_default(),
                        "Finalizing terminated run"
                    );
                    self.repository
                        .update_run(&run, RunUpdate::final_status())
                        .await?;
                }
                self.delete_run_resources(run_id).await?;
            }
        }
        Ok(())
    }

    async fn archive_logs(&self, run_id: i64) -> Result<()> {
        let logs = match self
            .log_source
            .get_log_stream(run_id, &LogOptions::for_archive())
            .await?
        {
            Some(logs) => reformat_log_stream(logs),
            None => {
                warn!(run_id, "No logs found for run, archiving empty log");
                empty_log_stream()
            }
        };
        self.log_archive.archive_logs(run_id, logs).await?;
        info!(run_id, "Archived logs for run");
        Ok(())
    }

    /// Release the log finalizer on every run pod, then delete the run's objects.
    /// Safe to repeat; nothing left to delete is not an error.
    pub async fn delete_run_resources(&self, run_id: i64) -> Result<()> {
        let selector = metadata::run_selector(run_id);

        for pod in self.cluster.list_pods(&selector).await? {
            let Some(name) = pod.metadata.name.as_deref() else {
                continue;
            };
            let finalizers = pod.metadata.finalizers.clone().unwrap_or_default();
            if finalizers.iter().any(|f| f == FINALIZER_NAME) {
                let remaining = finalizers
                    .into_iter()
                    .filter(|f| f != FINALIZER_NAME)
                    .collect();
                self.cluster.patch_pod_finalizers(name, remaining).await?;
            }
        }

        for kind in ResourceKind::ALL {
            self.cluster.delete_collection(kind, &selector).await?;
        }
        debug!(run_id, "Deleted run resources");
        Ok(())
    }
}

/// Running sweep loop.
pub struct SweeperHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Cancel the loop and wait up to `deadline` for an in-flight sweep to finish.
    pub async fn stop(self, deadline: Duration) {
        self.token.cancel();
        let mut join = self.join;
        match tokio::time::timeout(deadline, &mut join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Sweeper task failed"),
            Err(_) => {
                warn!(
                    deadline_seconds = deadline.as_secs(),
                    "Shutdown deadline exceeded, abandoning in-flight sweep"
                );
                join.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::memory::{MemoryLogArchive, MemoryLogSource, MemoryRepository};
    use crate::model::{LogOptions, NewRun, RunCodeTarget};
    use crate::runs::reader::tests::{condition, job};
    use crate::store::LogStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const GRACE: Duration = Duration::from_secs(30);

    struct Harness {
        sweeper: Arc<RunSweeper>,
        repository: Arc<MemoryRepository>,
        cluster: Arc<FakeCluster>,
        logs: Arc<MemoryLogSource>,
        archive: Arc<MemoryLogArchive>,
    }

    fn harness_with(cluster: FakeCluster, repository: MemoryRepository) -> Harness {
        let repository = Arc::new(repository);
        let cluster = Arc::new(cluster);
        let logs = Arc::new(MemoryLogSource::new());
        let archive = Arc::new(MemoryLogArchive::new());
        let sweeper = Arc::new(RunSweeper::new(
            &SweeperConfig::default(),
            repository.clone(),
            cluster.clone(),
            logs.clone(),
            archive.clone(),
        ));
        Harness {
            sweeper,
            repository,
            cluster,
            logs,
            archive,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeCluster::default(), MemoryRepository::new())
    }

    fn new_run() -> NewRun {
        NewRun {
            job: RunCodeTarget::new("trainer/versions/1"),
            worker: None,
            cluster: Some("default".to_string()),
            timeout_seconds: Some(600),
        }
    }

    async fn created_run(repository: &MemoryRepository) -> Run {
        let run = repository.create_run(new_run()).await.unwrap();
        repository
            .update_run(&run, RunUpdate::resources_created())
            .await
            .unwrap();
        repository.get_run(run.id).await.unwrap().unwrap()
    }

    fn run_job(run_id: i64, status: JobStatus) -> Job {
        let mut job = job(1, status);
        job.metadata.name = Some(metadata::job_name(run_id));
        job.metadata.labels = Some(metadata::job_labels(run_id));
        job
    }

    fn running() -> JobStatus {
        JobStatus {
            active: Some(1),
            ..JobStatus::default()
        }
    }

    fn succeeded() -> JobStatus {
        JobStatus {
            succeeded: Some(1),
            conditions: Some(vec![condition("Complete", None, Utc::now())]),
            ..JobStatus::default()
        }
    }

    fn run_pod(run_id: i64) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-0-abcde", metadata::job_name(run_id))),
                labels: Some(metadata::job_labels(run_id)),
                finalizers: Some(vec![FINALIZER_NAME.to_string()]),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    fn stored_run(at: DateTime<Utc>, status: RunStatus) -> Run {
        let mut run = Run::from_new_run(1, new_run(), at);
        run.status = status;
        run.resources_created = true;
        run
    }

    #[test]
    fn test_decide_covers_every_case() {
        let now = Utc::now();
        let active = run_job(1, running());
        let done = run_job(1, succeeded());

        let decide = |job: &Job, run: Option<&Run>| SweepAction::decide(job, run, now, GRACE);
        let stored = stored_run(now, RunStatus::Running);
        let cancelling = stored_run(now, RunStatus::Cancelling);

        assert_eq!(decide(&active, None), SweepAction::Skip);
        assert_eq!(decide(&active, Some(&stored)), SweepAction::Skip);
        assert_eq!(decide(&done, None), SweepAction::DeleteOrphan);
        assert_eq!(
            decide(&active, Some(&cancelling)),
            SweepAction::CancelAndArchive
        );
        assert_eq!(decide(&done, Some(&stored)), SweepAction::ArchiveLogs);

        let mut archived = stored_run(now, RunStatus::Running);
        archived.logs_archived_at = Some(now - chrono::Duration::seconds(10));
        assert_eq!(decide(&done, Some(&archived)), SweepAction::Wait);
        archived.logs_archived_at = Some(now - chrono::Duration::seconds(30));
        assert_eq!(decide(&done, Some(&archived)), SweepAction::Finalize);

        // A final run is done even while its job keeps running.
        archived.is_final = true;
        assert_eq!(decide(&active, Some(&archived)), SweepAction::Finalize);
    }

    #[tokio::test]
    async fn test_orphan_sweep_is_idempotent() {
        let h = harness_with(
            FakeCluster::default(),
            MemoryRepository::new().with_orphan_min_age(Duration::ZERO),
        );
        let orphan = h.repository.create_run(new_run()).await.unwrap();
        let kept = created_run(&h.repository).await;
        h.cluster.insert_job(run_job(orphan.id, running()));
        h.cluster.insert_pod(run_pod(orphan.id));

        h.sweeper.delete_runs_missing_resources().await.unwrap();
        assert!(h.repository.get_run(orphan.id).await.unwrap().is_none());
        assert!(h.repository.get_run(kept.id).await.unwrap().is_some());
        assert_eq!(h.cluster.object_count(), 0);

        let calls = h.cluster.calls().len();
        h.sweeper.delete_runs_missing_resources().await.unwrap();
        assert_eq!(h.cluster.calls().len(), calls);
        assert_eq!(h.repository.run_count().await, 1);
    }

    #[tokio::test]
    async fn test_job_without_run_record_is_deleted_once_done() {
        let h = harness();
        h.cluster.insert_job(run_job(41, running()));
        h.cluster.insert_job(run_job(42, succeeded()));

        h.sweeper.sweep_runs_at(Utc::now()).await.unwrap();
        assert!(h.cluster.job(&metadata::job_name(41)).is_some());
        assert!(h.cluster.job(&metadata::job_name(42)).is_none());
    }

    #[tokio::test]
    async fn test_succeeded_run_lifecycle() {
        let h = harness();
        let run = created_run(&h.repository).await;
        let name = metadata::job_name(run.id);
        h.cluster.insert_job(run_job(run.id, running()));
        h.cluster.insert_pod(run_pod(run.id));
        let line = Bytes::from_static(b"2022-04-14T16:22:18.000000000Z done\n");
        h.logs.set_logs(run.id, vec![line]).await;

        let t0 = Utc::now();
        h.sweeper.sweep_runs_at(t0).await.unwrap();
        assert_eq!(h.archive.archive_count(run.id).await, 0);

        let finish = |job: &mut Job| job.status = Some(succeeded());
        h.cluster.update_job(&name, finish);

        h.sweeper.sweep_runs_at(t0).await.unwrap();
        let stored = h.repository.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.logs_archived_at, Some(t0));
        assert_eq!(stored.status, RunStatus::Pending);
        assert_eq!(
            h.archive.archived_bytes(run.id).await.unwrap(),
            b"2022-04-14T16:22:18.000000000Z done\n"
        );

        h.sweeper
            .sweep_runs_at(t0 + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert!(h.cluster.job(&name).is_some());

        h.sweeper
            .sweep_runs_at(t0 + chrono::Duration::seconds(31))
            .await
            .unwrap();
        let stored = h.repository.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert!(stored.is_final);
        assert!(h.cluster.job(&name).is_none());
        assert_eq!(h.cluster.object_count(), 0);
        assert_eq!(h.archive.archive_count(run.id).await, 1);

        let calls = h.cluster.calls();
        let position = |prefix: &str| calls.iter().position(|c| c.starts_with(prefix));
        let patch = position("patch Pod").unwrap();
        let delete = position("delete Job").unwrap();
        assert!(patch < delete);
    }

    #[tokio::test]
    async fn test_cancelled_run_lifecycle() {
        let h = harness();
        let run = created_run(&h.repository).await;
        let name = metadata::job_name(run.id);
        h.cluster.insert_job(run_job(run.id, running()));
        h.cluster.insert_pod(run_pod(run.id));
        h.repository.cancel_run(run.id).await.unwrap();

        let t0 = Utc::now();
        h.sweeper.sweep_runs_at(t0).await.unwrap();
        let stored = h.repository.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.status_reason.as_deref(), Some(CANCELLED_REASON));
        assert_eq!(stored.finished_at, Some(t0));
        assert_eq!(stored.logs_archived_at, Some(t0));
        assert!(h.cluster.job(&name).is_some());

        h.sweeper
            .sweep_runs_at(t0 + chrono::Duration::seconds(29))
            .await
            .unwrap();
        assert!(h.cluster.job(&name).is_some());

        h.sweeper
            .sweep_runs_at(t0 + chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert!(h.cluster.job(&name).is_none());
        assert_eq!(h.cluster.object_count(), 0);
        assert_eq!(h.archive.archive_count(run.id).await, 1);

        let stored = h.repository.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.status_reason.as_deref(), Some(CANCELLED_REASON));
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_success() {
        let h = harness();
        let run = created_run(&h.repository).await;
        h.cluster.insert_job(run_job(run.id, succeeded()));
        h.repository.cancel_run(run.id).await.unwrap();

        h.sweeper.sweep_runs_at(Utc::now()).await.unwrap();
        let stored = h.repository.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.status_reason.as_deref(), Some(CANCELLED_REASON));
    }

    #[tokio::test]
    async fn test_terminal_status_never_changes() {
        let h = harness();
        let run = created_run(&h.repository).await;
        h.cluster.insert_job(run_job(run.id, succeeded()));

        let t0 = Utc::now();
        h.sweeper.sweep_runs_at(t0).await.unwrap();
        h.sweeper
            .sweep_runs_at(t0 + chrono::Duration::seconds(60))
            .await
            .unwrap();
        let finished = h.repository.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);

        // A stale failed job for the same run reappears.
        let failed = JobStatus {
            failed: Some(1),
            ..JobStatus::default()
        };
        h.cluster.insert_job(run_job(run.id, failed));
        h.sweeper
            .sweep_runs_at(t0 + chrono::Duration::seconds(120))
            .await
            .unwrap();

        let stored = h.repository.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_eq!(stored.logs_archived_at, Some(t0));
        assert_eq!(stored.finished_at, finished.finished_at);
        assert_eq!(h.archive.archive_count(run.id).await, 1);
        assert!(h.cluster.job(&metadata::job_name(run.id)).is_none());
    }

    #[tokio::test]
    async fn test_sweep_drains_every_job_page() {
        let cluster = FakeCluster {
            page_size: 1,
            ..FakeCluster::default()
        };
        let h = harness_with(cluster, MemoryRepository::new());
        let mut ids = Vec::new();
        for _ in 0..3 {
            let run = created_run(&h.repository).await;
            h.cluster.insert_job(run_job(run.id, succeeded()));
            ids.push(run.id);
        }

        h.sweeper.sweep_runs_at(Utc::now()).await.unwrap();
        for id in ids {
            assert_eq!(h.archive.archive_count(id).await, 1);
        }
        let lists = h
            .cluster
            .calls()
            .iter()
            .filter(|c| c.starts_with("list Job"))
            .count();
        assert_eq!(lists, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_failing_sweeps_and_stops() {
        let cluster = FakeCluster {
            fail_job_lists: true,
            ..FakeCluster::default()
        };
        let h = harness_with(cluster, MemoryRepository::new());
        let handle = h.sweeper.clone().start();

        tokio::time::sleep(Duration::from_secs(95)).await;
        handle.stop(Duration::from_secs(5)).await;

        let sweeps = h
            .cluster
            .calls()
            .iter()
            .filter(|c| c.starts_with("list Job"))
            .count();
        assert_eq!(sweeps, 3);
    }

    struct HangingLogSource;

    #[async_trait]
    impl LogSource for HangingLogSource {
        async fn get_log_stream(
            &self,
            _run_id: i64,
            _options: &LogOptions,
        ) -> Result<Option<LogStream>> {

            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_gives_up_after_deadline() {
        let repository = Arc::new(MemoryRepository::new());
        let cluster = Arc::new(FakeCluster::default());
        let run = created_run(&repository).await;
        cluster.insert_job(run_job(run.id, succeeded()));

        let sweeper = Arc::new(RunSweeper::new(
            &SweeperConfig::default(),
            repository,
            cluster,
            Arc::new(HangingLogSource),
            Arc::new(MemoryLogArchive::new()),
        ));
        let handle = sweeper.start();

        // Let the first sweep start and block on the log source.
        tokio::time::sleep(Duration::from_secs(31)).await;
        let started = tokio::time::Instant::now();
        handle.stop(Duration::from_secs(2)).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}

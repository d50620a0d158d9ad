//! Run creation.
//!
//! A run is created in four phases: validate and resolve everything the run
//! refers to, persist the record, create the cluster objects, then record that
//! the objects exist. A crash between the last two leaves a record without
//! resources, which the sweeper's orphan pass removes.

use super::buffers::bind_buffers;
use super::codespec::resolve_codespec;
use super::objects::{RunObjectParams, RunObjects, WorkerGroup};
use super::resources::build_pod_template;
use crate::cluster::ClusterClient;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::model::{NewRun, Run, RunUpdate};
use crate::store::{BufferBinder, CodespecResolver, RunRepository};
use std::sync::Arc;
use tracing::{error, info, instrument};

pub struct RunCreator {
    config: Arc<ControllerConfig>,
    repository: Arc<dyn RunRepository>,
    codespecs: Arc<dyn CodespecResolver>,
    buffers: Arc<dyn BufferBinder>,
    cluster: Arc<dyn ClusterClient>,
}

/// Result of phase 1: the normalized request and the pod templates to build from.
struct ResolvedRun {
    new_run: NewRun,
    params: RunObjectParams,
}

impl RunCreator {
    pub fn new(
        config: Arc<ControllerConfig>,
        repository: Arc<dyn RunRepository>,
        codespecs: Arc<dyn CodespecResolver>,
        buffers: Arc<dyn BufferBinder>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            config,
            repository,
            codespecs,
            buffers,
            cluster,
        }
    }

    /// Create a run. Validation problems are reported before anything is persisted.
    #[instrument(skip(self, new_run), fields(codespec = %new_run.job.codespec))]
    pub async fn create_run(&self, new_run: NewRun) -> Result<Run> {
        let ResolvedRun {
            new_run,
            mut params,
        } = self.resolve(new_run).await?;

        let mut run = self.repository.create_run(new_run).await?;
        params.run_id = run.id;

        let objects = RunObjects::build(&params, &self.config)?;
        if let Err(e) = objects.apply(self.cluster.as_ref()).await {
            error!(
                run_id = run.id,
                error = %e,
                "Failed to create cluster objects for run"
            );
            return Err(e);
        }

        self.repository
            .update_run(&run, RunUpdate::resources_created())
            .await?;
        run.resources_created = true;

        info!(
            run_id = run.id,
            cluster = run.cluster.as_deref().unwrap_or_default(),
            job = %run.job.codespec,
            "Run created"
        );
        Ok(run)
    }

    async fn resolve(&self, mut new_run: NewRun) -> Result<ResolvedRun> {
        let (cluster_name, cluster) = match new_run.cluster.as_deref() {
            Some(name) => self
                .config
                .cluster(name)
                .ok_or_else(|| Error::validation(format!("Unknown cluster '{name}'")))?,
            // TODO: pick among declared clusters by capacity once more than one is active.
            None => self
                .config
                .primary_cluster()
                .ok_or_else(|| Error::ConfigError("no primary cluster configured".to_string()))?,
        };

        validate_replicas(new_run.job.replicas, "job")?;
        let storage_server_uri = self.config.storage_server.as_ref().map(|s| s.uri.as_str());

        let main_codespec = resolve_codespec(self.codespecs.as_ref(), &new_run.job.codespec).await?;
        let main = build_pod_template(
            &main_codespec,
            cluster_name,
            cluster,
            new_run.job.node_pool.as_deref(),
            storage_server_uri,
        )?;

        let worker = match new_run.worker.as_mut() {
            Some(target) => {
                validate_replicas(target.replicas, "worker")?;
                if let Some(argument) = target.buffers.keys().next() {
                    return Err(Error::validation(format!(
                        "Buffer argument '{argument}' cannot be bound to a worker; \
                         only the job can use buffers"
                    )));
                }
                let codespec = resolve_codespec(self.codespecs.as_ref(), &target.codespec).await?;
                let template = build_pod_template(
                    &codespec,
                    cluster_name,
                    cluster,
                    target.node_pool.as_deref(),
                    storage_server_uri,
                )?;
                target.codespec = codespec.normalized_ref();
                Some(WorkerGroup {
                    template,
                    replicas: target.replicas,
                    endpoints: codespec.endpoints.clone().unwrap_or_default(),
                })
            }
            None => None,
        };

        let buffers = bind_buffers(
            self.buffers.as_ref(),
            main_codespec.buffers.as_ref(),
            &new_run.job.buffers,
        )
        .await?;

        new_run.job.codespec = main_codespec.normalized_ref();
        new_run.cluster = Some(cluster_name.to_string());
        let timeout_seconds = *new_run
            .timeout_seconds
            .get_or_insert(self.config.runs.default_timeout_seconds);
        if timeout_seconds <= 0 {
            return Err(Error::validation("The run timeout must be a positive number of seconds"));
        }

        let params = RunObjectParams {
            run_id: 0,
            main,
            replicas: new_run.job.replicas,
            timeout_seconds,
            worker,
            buffers,
        };
        Ok(ResolvedRun { new_run, params })
    }
}

fn validate_replicas(replicas: i32, group: &str) -> Result<()> {
    if replicas < 1 {
        return Err(Error::validation(format!(
            "The {group} replica count must be at least 1, got {replicas}"
        )));
    }
    Ok(())
}

//! Cluster access for run objects.
//!
//! `ClusterClient` is the narrow set of namespaced primitives the creator and
//! the sweeper need. `KubeClusterClient` implements it over kube-rs and
//! `KubeLogSource` reads run logs from the job's pods.

use crate::error::{Error, Result};
use crate::metadata::{self, MAIN_CONTAINER_NAME};
use crate::model::LogOptions;
use crate::store::{LogSource, LogStream};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::{self, Debug};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Annotation the job controller sets on the pods of an indexed job.
const COMPLETION_INDEX_ANNOTATION: &str = "batch.kubernetes.io/job-completion-index";

/// Jobs fetched per list call while sweeping.
const JOB_PAGE_SIZE: u32 = 100;

/// Kinds of run object removed by label when a run is cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Job,
    StatefulSet,
    Secret,
    Service,
}

impl ResourceKind {
    /// Deletion order used when cleaning up a run.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Job,
        ResourceKind::StatefulSet,
        ResourceKind::Secret,
        ResourceKind::Service,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ResourceKind::Job => "Job",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Secret => "Secret",
            ResourceKind::Service => "Service",
        };
        f.write_str(kind)
    }
}

/// One page of a job listing.
#[derive(Debug, Default)]
pub struct JobPage {
    pub items: Vec<Job>,
    /// Token for the next page; `None` once the listing is exhausted.
    pub continuation: Option<String>,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<Job>;

    async fn create_stateful_set(&self, stateful_set: &StatefulSet) -> Result<StatefulSet>;

    async fn create_service(&self, service: &Service) -> Result<Service>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;

    async fn get_job(&self, name: &str) -> Result<Option<Job>>;

    async fn list_jobs(&self, selector: &str, continuation: Option<&str>) -> Result<JobPage>;

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>>;

    /// Replace the finalizers of a pod with a merge patch. A missing pod is not an error.
    async fn patch_pod_finalizers(&self, name: &str, finalizers: Vec<String>) -> Result<()>;

    /// Delete every object of `kind` matching `selector` with foreground propagation.
    /// Nothing matching is not an error.
    async fn delete_collection(&self, kind: ResourceKind, selector: &str) -> Result<()>;
}

/// `ClusterClient` over the Kubernetes API, scoped to one namespace.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
}

impl KubeClusterClient {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn delete_all<K>(&self, selector: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api();
        let list_params = ListParams::default().labels(selector);
        match api
            .delete_collection(&DeleteParams::foreground(), &list_params)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if e.is_not_found() {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_job(&self, job: &Job) -> Result<Job> {
        Ok(self.api::<Job>().create(&PostParams::default(), job).await?)
    }

    async fn create_stateful_set(&self, stateful_set: &StatefulSet) -> Result<StatefulSet> {
        Ok(self
            .api::<StatefulSet>()
            .create(&PostParams::default(), stateful_set)
            .await?)
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        Ok(self
            .api::<Service>()
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        Ok(self
            .api::<Secret>()
            .create(&PostParams::default(), secret)
            .await?)
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        Ok(self.api::<Job>().get_opt(name).await?)
    }

    async fn list_jobs(&self, selector: &str, continuation: Option<&str>) -> Result<JobPage> {
        let mut list_params = ListParams::default().labels(selector).limit(JOB_PAGE_SIZE);
        if let Some(token) = continuation {
            list_params = list_params.continue_token(token);
        }

        let list = self.api::<Job>().list(&list_params).await?;
        Ok(JobPage {
            continuation: list.metadata.continue_.filter(|token| !token.is_empty()),
            items: list.items,
        })
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .api::<Pod>()
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn patch_pod_finalizers(&self, name: &str, finalizers: Vec<String>) -> Result<()> {
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        match self
            .api::<Pod>()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if e.is_not_found() {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn delete_collection(&self, kind: ResourceKind, selector: &str) -> Result<()> {
        debug!(%kind, selector, "Deleting collection");
        match kind {
            ResourceKind::Job => self.delete_all::<Job>(selector).await,
            ResourceKind::StatefulSet => self.delete_all::<StatefulSet>(selector).await,
            ResourceKind::Secret => self.delete_all::<Secret>(selector).await,
            ResourceKind::Service => self.delete_all::<Service>(selector).await,
        }
    }
}

/// Reads a run's logs from the main container of each of its job pods,
/// concatenated in completion-index order.
#[derive(Clone)]
pub struct KubeLogSource {
    client: Client,
    namespace: String,
}

impl KubeLogSource {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

fn completion_index(pod: &Pod) -> i64 {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(COMPLETION_INDEX_ANNOTATION))
        .and_then(|index| index.parse().ok())
        .unwrap_or(i64::MAX)
}

fn log_params(options: &LogOptions) -> LogParams {
    LogParams {
        container: Some(MAIN_CONTAINER_NAME.to_string()),
        follow: options.follow,
        previous: options.previous,
        tail_lines: options.tail_lines,
        timestamps: options.include_timestamps,
        since_seconds: options
            .since
            .map(|since| (Utc::now() - since).num_seconds().max(1)),
        ..LogParams::default()
    }
}

#[async_trait]
impl LogSource for KubeLogSource {
    async fn get_log_stream(&self, run_id: i64, options: &LogOptions) -> Result<Option<LogStream>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut items = pods
            .list(&ListParams::default().labels(&metadata::job_selector(run_id)))
            .await?
            .items;
        if items.is_empty() {
            return Ok(None);
        }
        items.sort_by_key(completion_index);

        let names: Vec<String> = items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect();
        let params = log_params(options);

        // Pods are opened one at a time so a followed stream does not hold every pod open.
        let logs = stream::iter(names)
            .then(move |name| {
                let pods = pods.clone();
                let params = params.clone();
                async move {
                    let reader = pods
                        .log_stream(&name, &params)
                        .await
                        .map_err(std::io::Error::other)?;
                    Ok::<_, std::io::Error>(ReaderStream::new(Box::pin(reader).compat()))
                }
            })
            .try_flatten();

        Ok(Some(Box::pin(logs)))
    }
}

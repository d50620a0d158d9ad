//! The full set of cluster objects for a run, built in one pass and then
//! applied in dependency order.

use super::buffers::{BoundBuffer, BufferDirection};
use super::resources::PodTemplate;
use crate::cluster::ClusterClient;
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::metadata::{self, env_var_fragment, FINALIZER_NAME};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, EnvVar, Secret, Service, VolumeMount};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;

pub const WORKER_NODES_ENV: &str = "RUN_WORKER_NODES";

const NO_OP_VOLUME: &str = "no-op";
const NO_OP_MOUNT_PATH: &str = "/no-op/";
const NO_OP_ENTRYPOINT: &str = "/no-op/no-op";
/// Execute-only (0o111) for the no-op binary.
const NO_OP_DEFAULT_MODE: i32 = 0o111;

const BUFFER_SECRET_VOLUME: &str = "buffer-sas-tokens";
const BUFFER_SECRET_MOUNT_PATH: &str = "/etc/buffer-sas-tokens";
const PIPE_VOLUME: &str = "pipevolume";
const PIPE_MOUNT_PATH: &str = "/etc/buffer-fifos";

const IMAGE_PULL_INIT_CONTAINER: &str = "imagepull";
const WAIT_FOR_WORKER_INIT_CONTAINER: &str = "waitforworker";
const MKFIFO_INIT_CONTAINER: &str = "mkfifo";

/// A worker group that the main job connects out to.
#[derive(Debug, Clone)]
pub struct WorkerGroup {
    pub template: PodTemplate,
    pub replicas: i32,
    /// Endpoint name -> port declared by the worker codespec.
    pub endpoints: BTreeMap<String, i32>,
}

/// Everything phase 1 resolved for a run.
#[derive(Debug, Clone)]
pub struct RunObjectParams {
    pub run_id: i64,
    pub main: PodTemplate,
    pub replicas: i32,
    pub timeout_seconds: i64,
    pub worker: Option<WorkerGroup>,
    pub buffers: Vec<BoundBuffer>,
}

/// Cluster objects for one run.
#[derive(Debug, Clone)]
pub struct RunObjects {
    pub run_id: i64,
    pub job: Job,
    pub worker_service: Option<Service>,
    pub worker_stateful_set: Option<StatefulSet>,
    pub buffer_secret: Option<Secret>,
}

/// Stable DNS name of each worker replica.
#[must_use]
pub fn worker_host_names(run_id: i64, replicas: i32, namespace: &str) -> Vec<String> {
    let stateful_set = metadata::stateful_set_name(run_id);
    (0..replicas)
        .map(|i| format!("{stateful_set}-{i}.{stateful_set}.{namespace}.svc.cluster.local"))
        .collect()
}

#[must_use]
pub fn pipe_path(buffer_name: &str) -> String {
    format!("{PIPE_MOUNT_PATH}/{buffer_name}")
}

fn sidecar_name(buffer_name: &str) -> String {
    let name: String = buffer_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{name}-buffer-proxy")
}

fn env_var(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..VolumeMount::default()
    }
}

/// Shell script that blocks until every worker pod is ready and every worker name resolves.
fn wait_for_workers_script(run_id: i64, hosts: &[String]) -> String {
    let mut script = String::from("set -euo pipefail\n");
    script.push_str(&format!(
        "until kubectl wait --for=condition=ready pod -l {}={run_id} --timeout=60s; \
         do echo 'waiting for worker pods'; sleep 1; done;\n",
        metadata::LABEL_WORKER
    ));
    for host in hosts {
        script.push_str(&format!(
            "until nslookup {host} > /dev/null 2>&1; do echo 'waiting for {host}'; sleep 1; done;\n"
        ));
    }
    script
}

fn mkfifo_script(buffers: &[BoundBuffer]) -> String {
    buffers
        .iter()
        .map(|buffer| {
            let path = pipe_path(&buffer.name);
            format!("mkfifo {path} && chmod 666 {path}")
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

fn buffer_proxy_container(buffer: &BoundBuffer, image: &str) -> Container {
    let (mode, pipe_flag) = match buffer.direction {
        // The proxy reads from the buffer and feeds the pipe.
        BufferDirection::Input => ("read", "--output"),
        // The proxy drains the pipe into the buffer.
        BufferDirection::Output => ("write", "--input"),
    };
    Container {
        name: sidecar_name(&buffer.name),
        image: Some(image.to_string()),
        args: Some(vec![
            mode.to_string(),
            format!("{BUFFER_SECRET_MOUNT_PATH}/{}", buffer.name),
            pipe_flag.to_string(),
            pipe_path(&buffer.name),
            "--log-format".to_string(),
            "json".to_string(),
        ]),
        volume_mounts: Some(vec![
            mount(BUFFER_SECRET_VOLUME, BUFFER_SECRET_MOUNT_PATH, true),
            mount(PIPE_VOLUME, PIPE_MOUNT_PATH, false),
        ]),
        ..Container::default()
    }
}

impl RunObjects {
    /// Compose the objects for a run. Pure; nothing touches the cluster.
    pub fn build(params: &RunObjectParams, config: &ControllerConfig) -> Result<Self> {
        let run_id = params.run_id;
        let job_labels = metadata::job_labels(run_id);

        let mut main = params.main.container.clone();
        let mut main_env = main.env.take().unwrap_or_default();
        let mut main_mounts = main.volume_mounts.take().unwrap_or_default();
        let mut init_containers: Vec<Container> = Vec::new();
        let mut sidecars: Vec<Container> = Vec::new();
        let mut volumes: Vec<Value> = Vec::new();

        let mut worker_service = None;
        let mut worker_stateful_set = None;

        if let Some(worker) = &params.worker {
            let hosts = worker_host_names(run_id, worker.replicas, config.namespace());

            main_env.push(env_var(WORKER_NODES_ENV, serde_json::to_string(&hosts)?));
            for (endpoint, port) in &worker.endpoints {
                let addresses: Vec<String> =
                    hosts.iter().map(|host| format!("{host}:{port}")).collect();
                main_env.push(env_var(
                    format!("RUN_{}_WORKER_ENDPOINT_ADDRESSES", env_var_fragment(endpoint)),
                    serde_json::to_string(&addresses)?,
                ));
            }

            // Pulls the main image while the workers come up.
            init_containers.push(Container {
                name: IMAGE_PULL_INIT_CONTAINER.to_string(),
                image: main.image.clone(),
                command: Some(vec![NO_OP_ENTRYPOINT.to_string()]),
                volume_mounts: Some(vec![mount(NO_OP_VOLUME, NO_OP_MOUNT_PATH, true)]),
                ..Container::default()
            });
            init_containers.push(Container {
                name: WAIT_FOR_WORKER_INIT_CONTAINER.to_string(),
                image: Some(config.kubernetes.worker_waiter_image.clone()),
                command: Some(vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    wait_for_workers_script(run_id, &hosts),
                ]),
                ..Container::default()
            });
            volumes.push(json!({
                "name": NO_OP_VOLUME,
                "configMap": {
                    "name": config.kubernetes.no_op_config_map,
                    "defaultMode": NO_OP_DEFAULT_MODE
                }
            }));

            let (service, stateful_set) = build_worker_objects(run_id, worker)?;
            worker_service = Some(service);
            worker_stateful_set = Some(stateful_set);
        }

        let mut buffer_secret = None;
        if !params.buffers.is_empty() {
            let secret_name = metadata::secret_name(run_id);
            let string_data: BTreeMap<&str, &str> = params
                .buffers
                .iter()
                .map(|buffer| (buffer.name.as_str(), buffer.access_uri.as_str()))
                .collect();
            buffer_secret = Some(serde_json::from_value(json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {
                    "name": secret_name,
                    "labels": metadata::run_labels(run_id)
                },
                "stringData": string_data
            }))?);

            volumes.push(json!({
                "name": BUFFER_SECRET_VOLUME,
                "secret": { "secretName": secret_name }
            }));
            volumes.push(json!({ "name": PIPE_VOLUME, "emptyDir": {} }));

            init_containers.push(Container {
                name: MKFIFO_INIT_CONTAINER.to_string(),
                image: Some(config.buffers.fifo_init_image.clone()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    mkfifo_script(&params.buffers),
                ]),
                volume_mounts: Some(vec![mount(PIPE_VOLUME, PIPE_MOUNT_PATH, false)]),
                ..Container::default()
            });

            main_mounts.push(mount(PIPE_VOLUME, PIPE_MOUNT_PATH, false));
            for buffer in &params.buffers {
                main_env.push(env_var(
                    format!("{}_PIPE", env_var_fragment(&buffer.name)),
                    pipe_path(&buffer.name),
                ));
                sidecars.push(buffer_proxy_container(buffer, &config.buffers.buffer_proxy_image));
            }
        }

        main.env = (!main_env.is_empty()).then_some(main_env);
        main.volume_mounts = (!main_mounts.is_empty()).then_some(main_mounts);

        let mut containers = vec![main];
        containers.extend(sidecars);

        let mut pod_spec = json!({
            "containers": containers,
            "nodeSelector": params.main.node_selector,
            "tolerations": params.main.tolerations,
            "restartPolicy": "Never"
        });
        if !init_containers.is_empty() {
            pod_spec["initContainers"] = serde_json::to_value(&init_containers)?;
        }
        if !volumes.is_empty() {
            pod_spec["volumes"] = Value::Array(volumes);
        }
        if params.worker.is_some() {
            // The worker wait runs kubectl, which needs pod read access.
            pod_spec["serviceAccountName"] = json!(config.kubernetes.job_service_account);
        }

        let job: Job = serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": metadata::job_name(run_id),
                "labels": job_labels
            },
            "spec": {
                "completionMode": "Indexed",
                "completions": params.replicas,
                "parallelism": params.replicas,
                "backoffLimit": 0,
                "activeDeadlineSeconds": params.timeout_seconds,
                "manualSelector": true,
                "selector": { "matchLabels": job_labels },
                "template": {
                    "metadata": {
                        "labels": job_labels,
                        "finalizers": [FINALIZER_NAME]
                    },
                    "spec": pod_spec
                }
            }
        }))?;

        Ok(Self {
            run_id,
            job,
            worker_service,
            worker_stateful_set,
            buffer_secret,
        })
    }

    /// Create the objects. Workers go first since the job's init phase waits on their DNS names.
    pub async fn apply(&self, cluster: &dyn ClusterClient) -> Result<()> {
        if let Some(service) = &self.worker_service {
            cluster.create_service(service).await?;
        }
        if let Some(stateful_set) = &self.worker_stateful_set {
            cluster.create_stateful_set(stateful_set).await?;
        }
        if let Some(secret) = &self.buffer_secret {
            cluster.create_secret(secret).await?;
            info!(run_id = self.run_id, "Secret created");
        }
        cluster.create_job(&self.job).await?;
        Ok(())
    }
}

fn build_worker_objects(run_id: i64, worker: &WorkerGroup) -> Result<(Service, StatefulSet)> {
    let name = metadata::stateful_set_name(run_id);
    let labels = metadata::worker_labels(run_id);

    let mut container = worker.template.container.clone();
    if !worker.endpoints.is_empty() {
        container.ports = Some(serde_json::from_value(Value::Array(
            worker
                .endpoints
                .values()
                .map(|port| json!({ "containerPort": port }))
                .collect(),
        ))?);
    }

    let service: Service = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "labels": labels },
        "spec": {
            "clusterIP": "None",
            "selector": labels
        }
    }))?;

    let stateful_set: StatefulSet = serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": { "name": name, "labels": labels },
        "spec": {
            "serviceName": name,
            "replicas": worker.replicas,
            "podManagementPolicy": "Parallel",
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": {
                    "labels": labels,
                    "finalizers": [FINALIZER_NAME]
                },
                "spec": {
                    "containers": [container],
                    "nodeSelector": worker.template.node_selector,
                    "tolerations": worker.template.tolerations,
                    "restartPolicy": "Always"
                }
            }
        }
    }))?;

    Ok((service, stateful_set))
}

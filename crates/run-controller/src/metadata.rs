//! Shared Kubernetes metadata for run objects (labels, finalizer, names)

use std::collections::BTreeMap;

/// Label carried by every object that belongs to a run; value is the run id
pub const LABEL_RUN: &str = "runs.platform/run";
/// Label carried by the main job and its pods
pub const LABEL_JOB: &str = "runs.platform/job";
/// Label carried by the worker stateful set, its service and its pods
pub const LABEL_WORKER: &str = "runs.platform/worker";

/// Finalizer that keeps run pods around until their logs have been archived
pub const FINALIZER_NAME: &str = "runs.platform/logs-finalizer";

/// Name of the container running the codespec in every run pod
pub const MAIN_CONTAINER_NAME: &str = "main";

/// Taint/label pair reserving user node pools for runs
pub const RUN_POOL_KEY: &str = "runs.platform/pool";
pub const RUN_POOL_VALUE: &str = "run";

/// Node label naming the node pool a node belongs to
pub const NODE_POOL_LABEL: &str = "agentpool";

#[must_use]
pub fn job_name(run_id: i64) -> String {
    format!("run-{run_id}")
}

#[must_use]
pub fn stateful_set_name(run_id: i64) -> String {
    format!("run-{run_id}-worker")
}

#[must_use]
pub fn secret_name(run_id: i64) -> String {
    format!("run-{run_id}-buffers")
}

#[must_use]
pub fn run_selector(run_id: i64) -> String {
    format!("{LABEL_RUN}={run_id}")
}

/// Selects the main job and its pods, excluding workers.
#[must_use]
pub fn job_selector(run_id: i64) -> String {
    format!("{LABEL_JOB}={run_id}")
}

#[must_use]
pub fn run_labels(run_id: i64) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_RUN.to_string(), run_id.to_string())])
}

#[must_use]
pub fn job_labels(run_id: i64) -> BTreeMap<String, String> {
    let mut labels = run_labels(run_id);
    labels.insert(LABEL_JOB.to_string(), run_id.to_string());
    labels
}

#[must_use]
pub fn worker_labels(run_id: i64) -> BTreeMap<String, String> {
    let mut labels = run_labels(run_id);
    labels.insert(LABEL_WORKER.to_string(), run_id.to_string());
    labels
}

/// Extracts the run id from an object's labels.
#[must_use]
pub fn run_id_from_labels(labels: Option<&BTreeMap<String, String>>, key: &str) -> Option<i64> {
    labels
        .and_then(|labels| labels.get(key))
        .and_then(|raw| raw.trim().parse::<i64>().ok())
}

/// Turns a parameter name into the upper-case fragment of an environment variable.
#[must_use]
pub fn env_var_fragment(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

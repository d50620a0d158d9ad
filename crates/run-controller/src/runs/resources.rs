//! Pod templates and node placement for run containers.

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::metadata::{MAIN_CONTAINER_NAME, NODE_POOL_LABEL, RUN_POOL_KEY, RUN_POOL_VALUE};
use crate::model::{Codespec, OvercommittableResources};
use k8s_openapi::api::core::v1::{Container, EnvVar, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use tracing::debug;

pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

/// Taint carried by GPU node pools.
pub const GPU_TOLERATION_KEY: &str = "sku";
pub const GPU_TOLERATION_VALUE: &str = "gpu";

pub const STORAGE_SERVER_URI_ENV: &str = "STORAGE_SERVER_URI";

/// N-series VM sizes carry GPUs.
const GPU_VM_SIZE_PREFIX: &str = "standard_n";
/// NVv4 sizes have AMD accelerators that the device plugin does not expose.
const UNSUPPORTED_GPU_VM_SIZE_SUFFIX: &str = "_v4";

#[must_use]
pub fn node_pool_has_gpu(vm_size: &str) -> bool {
    let vm_size = vm_size.to_ascii_lowercase();
    vm_size.starts_with(GPU_VM_SIZE_PREFIX) && !vm_size.ends_with(UNSUPPORTED_GPU_VM_SIZE_SUFFIX)
}

/// Unparseable quantities count as non-zero.
fn quantity_is_zero(quantity: &Quantity) -> bool {
    quantity
        .0
        .trim()
        .parse::<f64>()
        .map(|value| value == 0.0)
        .unwrap_or(false)
}

/// The container and placement of one group of run pods, before any
/// run-specific plumbing is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct PodTemplate {
    pub container: Container,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
}

fn toleration(key: &str, value: &str) -> Toleration {
    Toleration {
        key: Some(key.to_string()),
        operator: Some("Equal".to_string()),
        value: Some(value.to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Toleration::default()
    }
}

fn resource_list(
    resources: Option<&OvercommittableResources>,
    gpu: Option<&Quantity>,
) -> Option<BTreeMap<String, Quantity>> {
    let mut list = BTreeMap::new();
    if let Some(resources) = resources {
        if let Some(cpu) = &resources.cpu {
            list.insert("cpu".to_string(), cpu.clone());
        }
        if let Some(memory) = &resources.memory {
            list.insert("memory".to_string(), memory.clone());
        }
    }
    if let Some(gpu) = gpu {
        list.insert(GPU_RESOURCE_NAME.to_string(), gpu.clone());
    }
    (!list.is_empty()).then_some(list)
}

/// Build the pod template for `codespec`, placed on `node_pool` of `cluster`
/// when one is given.
pub fn build_pod_template(
    codespec: &Codespec,
    cluster_name: &str,
    cluster: &ClusterConfig,
    node_pool: Option<&str>,
    storage_server_uri: Option<&str>,
) -> Result<PodTemplate> {
    let gpu = codespec.gpu().filter(|gpu| !quantity_is_zero(gpu));

    let mut node_selector =
        BTreeMap::from([(RUN_POOL_KEY.to_string(), RUN_POOL_VALUE.to_string())]);
    let mut tolerations = vec![toleration(RUN_POOL_KEY, RUN_POOL_VALUE)];
    let mut needs_gpu_toleration = gpu.is_some();

    if let Some(pool_name) = node_pool {
        let pool = cluster
            .node_pool(pool_name)
            .ok_or_else(|| Error::validation(format!("Unknown nodepool '{pool_name}'")))?;
        let has_gpu = node_pool_has_gpu(&pool.vm_size);
        if let (false, Some(gpu)) = (has_gpu, gpu) {
            return Err(Error::validation(format!(
                "Nodepool '{pool_name}' does not have GPUs and cannot satisfy GPU request '{}'",
                gpu.0
            )));
        }
        needs_gpu_toleration |= has_gpu;
        node_selector.insert(NODE_POOL_LABEL.to_string(), pool_name.to_string());
        debug!(
            cluster = cluster_name,
            pool = pool_name,
            has_gpu,
            "Placing pods on node pool"
        );
    }

    if needs_gpu_toleration {
        tolerations.push(toleration(GPU_TOLERATION_KEY, GPU_TOLERATION_VALUE));
    }

    let mut env: Vec<EnvVar> = codespec
        .env
        .iter()
        .flatten()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            value_from: None,
        })
        .collect();
    if let Some(uri) = storage_server_uri {
        env.push(EnvVar {
            name: STORAGE_SERVER_URI_ENV.to_string(),
            value: Some(uri.to_string()),
            value_from: None,
        });
    }

    let resources = codespec.resources.as_ref();
    let container = Container {
        name: MAIN_CONTAINER_NAME.to_string(),
        image: Some(codespec.image.clone()),
        command: codespec.command.clone(),
        args: codespec.args.clone(),
        env: (!env.is_empty()).then_some(env),
        resources: Some(ResourceRequirements {
            requests: resource_list(resources.and_then(|r| r.requests.as_ref()), gpu),
            limits: resource_list(resources.and_then(|r| r.limits.as_ref()), gpu),
            ..ResourceRequirements::default()
        }),
        ..Container::default()
    };

    Ok(PodTemplate {
        container,
        node_selector,
        tolerations,
    })
}

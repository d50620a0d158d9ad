//! Run and codespec data model.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle status of a run. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelling,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "Pending",
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelling => "Cancelling",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_replicas() -> i32 {
    1
}

/// What to run for one group of a run (the main job or the worker group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCodeTarget {
    /// `name` or `name/versions/N`
    pub codespec: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Buffer parameter name -> buffer id
    #[serde(default)]
    pub buffers: BTreeMap<String, String>,

    #[serde(default, rename = "nodePool", skip_serializing_if = "Option::is_none")]
    pub node_pool: Option<String>,
}

impl RunCodeTarget {
    pub fn new(codespec: impl Into<String>) -> Self {
        Self {
            codespec: codespec.into(),
            replicas: default_replicas(),
            buffers: BTreeMap::new(),
            node_pool: None,
        }
    }
}

/// A run request as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub job: RunCodeTarget,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<RunCodeTarget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    #[serde(default, rename = "timeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

/// The durable record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: i64,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    pub job: RunCodeTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<RunCodeTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resources_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_archived_at: Option<DateTime<Utc>>,
    /// Set once the terminal status has been persisted; the record is frozen afterwards.
    #[serde(default)]
    pub is_final: bool,
}

impl Run {
    /// A fresh `Pending` record for an accepted request.
    #[must_use]
    pub fn from_new_run(id: i64, new_run: NewRun, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: RunStatus::Pending,
            status_reason: None,
            cluster: new_run.cluster,
            job: new_run.job,
            worker: new_run.worker,
            timeout_seconds: new_run.timeout_seconds,
            created_at,
            finished_at: None,
            resources_created: false,
            logs_archived_at: None,
            is_final: false,
        }
    }
}

/// Fields the run store updates on an existing record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub resources_created: Option<bool>,
    pub logs_archived_at: Option<DateTime<Utc>>,
    /// Persist status, reason and `finished_at` from the supplied run and freeze the record.
    pub is_final: bool,
}

impl RunUpdate {
    #[must_use]
    pub fn resources_created() -> Self {
        Self {
            resources_created: Some(true),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn logs_archived_at(at: DateTime<Utc>) -> Self {
        Self {
            logs_archived_at: Some(at),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn final_status() -> Self {
        Self {
            is_final: true,
            ..Self::default()
        }
    }
}

/// CPU and memory quantities that may be requested or limited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OvercommittableResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodespecResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<OvercommittableResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<OvercommittableResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<Quantity>,
}

/// Named buffer parameters a codespec declares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferParameters {
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Immutable description of a container, identified by `(name, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Codespec {
    pub name: String,
    pub version: i32,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<CodespecResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffers: Option<BufferParameters>,
    /// Endpoint name -> port, used to address workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<BTreeMap<String, i32>>,
}

impl Codespec {
    /// Reference that pins this exact version.
    #[must_use]
    pub fn normalized_ref(&self) -> String {
        format!("{}/versions/{}", self.name, self.version)
    }

    #[must_use]
    pub fn gpu(&self) -> Option<&Quantity> {
        self.resources.as_ref().and_then(|r| r.gpu.as_ref())
    }
}

/// Options for reading the logs of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogOptions {
    pub include_timestamps: bool,
    pub tail_lines: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub follow: bool,
    pub previous: bool,
}

impl LogOptions {
    /// The options used when archiving: full history, timestamped.
    #[must_use]
    pub fn for_archive() -> Self {
        Self {
            include_timestamps: true,
            ..Self::default()
        }
    }
}

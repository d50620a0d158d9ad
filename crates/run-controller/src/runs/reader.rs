//! Classifies jobs and pods into run statuses.

use crate::metadata::MAIN_CONTAINER_NAME;
use crate::model::{Run, RunStatus};
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobCondition};
use k8s_openapi::api::core::v1::Pod;

const CONDITION_COMPLETE: &str = "Complete";
const CONDITION_FAILED: &str = "Failed";
const DEADLINE_EXCEEDED: &str = "DeadlineExceeded";

fn true_condition<'a>(job: &'a Job, kind: &str) -> Option<&'a JobCondition> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == kind && c.status == "True")
}

#[must_use]
pub fn has_job_succeeded(job: &Job) -> bool {
    if true_condition(job, CONDITION_COMPLETE).is_some() {
        return true;
    }
    let completions = job.spec.as_ref().and_then(|s| s.completions).unwrap_or(1);
    let succeeded = job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0);
    succeeded >= completions
}

/// The job, or any of its pods, failed.
#[must_use]
pub fn has_job_failed(job: &Job) -> bool {
    true_condition(job, CONDITION_FAILED).is_some()
        || job.status.as_ref().and_then(|s| s.failed).unwrap_or(0) > 0
}

/// Status as observed on the cluster, for runs that are not final yet.
#[must_use]
pub fn observed_status(job: &Job) -> RunStatus {
    if has_job_failed(job) {
        RunStatus::Failed
    } else if has_job_succeeded(job) {
        RunStatus::Succeeded
    } else if job.status.as_ref().and_then(|s| s.active).unwrap_or(0) > 0 {
        RunStatus::Running
    } else {
        RunStatus::Pending
    }
}

/// First non-zero exit of a main container, e.g. `OOMKilled: exited with code 137`.
fn container_failure(pods: &[Pod]) -> Option<String> {
    let mut pods: Vec<&Pod> = pods.iter().collect();
    pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    pods.into_iter()
        .filter_map(|pod| pod.status.as_ref()?.container_statuses.as_ref())
        .flatten()
        .filter(|status| status.name == MAIN_CONTAINER_NAME)
        .find_map(|status| {
            let terminated = status.state.as_ref()?.terminated.as_ref()?;
            if terminated.exit_code == 0 {
                return None;
            }
            Some(match terminated.reason.as_deref() {
                Some(reason) if reason != "Error" => {
                    format!("{reason}: exited with code {}", terminated.exit_code)
                }
                _ => format!("exited with code {}", terminated.exit_code),
            })
        })
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalStatus {
    pub status: RunStatus,
    pub reason: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Terminal status of a finished job.
#[must_use]
pub fn final_status(job: &Job, pods: &[Pod], now: DateTime<Utc>) -> FinalStatus {
    let failed = true_condition(job, CONDITION_FAILED);
    let finished_at = failed
        .or_else(|| true_condition(job, CONDITION_COMPLETE))
        .and_then(|c| c.last_transition_time.as_ref())
        .or_else(|| job.status.as_ref()?.completion_time.as_ref())
        .map_or(now, |time| time.0);

    if !has_job_failed(job) && has_job_succeeded(job) {
        return FinalStatus {
            status: RunStatus::Succeeded,
            reason: None,
            finished_at,
        };
    }

    let condition_reason = failed.and_then(|c| c.reason.clone());
    let reason = match condition_reason.as_deref() {
        Some(DEADLINE_EXCEEDED) => condition_reason.clone(),
        _ => container_failure(pods).or(condition_reason),
    };

    FinalStatus {
        status: RunStatus::Failed,
        reason: reason.or_else(|| Some("Failed".to_string())),
        finished_at,
    }
}

/// Copy the terminal status of `job` onto `run`.
pub fn update_run_from_job_and_pods(run: &mut Run, job: &Job, pods: &[Pod], now: DateTime<Utc>) {
    let FinalStatus {
        status,
        reason,
        finished_at,
    } = final_status(job, pods, now);
    run.status = status;
    run.status_reason = reason;
    run.finished_at = Some(finished_at);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobSpec, JobStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    pub(crate) fn job(completions: i32, status: JobStatus) -> Job {
        Job {
            metadata: ObjectMeta::default(),
            spec: Some(JobSpec {
                completions: Some(completions),
                ..JobSpec::default()
            }),
            status: Some(status),
        }
    }

    pub(crate) fn condition(kind: &str, reason: Option<&str>, at: DateTime<Utc>) -> JobCondition {
        JobCondition {
            type_: kind.to_string(),
            status: "True".to_string(),
            reason: reason.map(str::to_string),
            last_transition_time: Some(Time(at)),
            ..JobCondition::default()
        }
    }

    fn failed_pod(name: &str, exit_code: i32, reason: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: None,
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: MAIN_CONTAINER_NAME.to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code,
                            reason: reason.map(str::to_string),
                            ..ContainerStateTerminated::default()
                        }),
                        ..ContainerState::default()
                    }),
                    ..ContainerStatus::default()
                }]),
                ..PodStatus::default()
            }),
        }
    }

    fn counts(active: i32, succeeded: i32, failed: i32) -> Job {
        job(
            2,
            JobStatus {
                active: Some(active),
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..JobStatus::default()
            },
        )
    }

    #[test]
    fn test_observed_status() {
        assert_eq!(observed_status(&counts(0, 0, 0)), RunStatus::Pending);
        assert_eq!(observed_status(&counts(2, 0, 0)), RunStatus::Running);
        assert_eq!(observed_status(&counts(1, 1, 0)), RunStatus::Running);
        assert_eq!(observed_status(&counts(0, 2, 0)), RunStatus::Succeeded);
        assert_eq!(observed_status(&counts(1, 0, 1)), RunStatus::Failed);
    }

    #[test]
    fn test_final_status_success_uses_condition_time() {
        let at = Utc::now() - chrono::Duration::minutes(5);
        let status = JobStatus {
            succeeded: Some(1),
            conditions: Some(vec![condition(CONDITION_COMPLETE, None, at)]),
            ..JobStatus::default()
        };
        let result = final_status(&job(1, status), &[], Utc::now());
        assert_eq!(result.status, RunStatus::Succeeded);
        assert!(result.reason.is_none());
        assert_eq!(result.finished_at, at);
    }

    #[test]
    fn test_final_status_reports_exit_code() {
        let now = Utc::now();
        let backoff = condition(CONDITION_FAILED, Some("BackoffLimitExceeded"), now);
        let status = JobStatus {
            failed: Some(1),
            conditions: Some(vec![backoff]),
            ..JobStatus::default()
        };
        let pods = vec![
            failed_pod("b", 1, Some("Error")),
            failed_pod("a", 137, Some("OOMKilled")),
        ];
        let result = final_status(&job(2, status), &pods, now);
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(
            result.reason.as_deref(),
            Some("OOMKilled: exited with code 137")
        );

        let pods = vec![failed_pod("a", 3, Some("Error"))];
        let status = JobStatus {
            failed: Some(1),
            ..JobStatus::default()
        };
        let result = final_status(&job(1, status), &pods, now);
        assert_eq!(result.reason.as_deref(), Some("exited with code 3"));
        assert_eq!(result.finished_at, now);
    }

    #[test]
    fn test_final_status_deadline_exceeded() {
        let now = Utc::now();
        let deadline = condition(CONDITION_FAILED, Some(DEADLINE_EXCEEDED), now);
        let status = JobStatus {
            failed: Some(1),
            conditions: Some(vec![deadline]),


            ..JobStatus::default()
        };
        let pods = vec![failed_pod("a", 143, None)];
        let result = final_status(&job(1, status), &pods, now);
        assert_eq!(result.reason.as_deref(), Some(DEADLINE_EXCEEDED));
    }
}

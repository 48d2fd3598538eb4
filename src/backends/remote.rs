use crate::backends::local::record_launch_failure;
use crate::backends::{
    assemble_run_log, create_staged_run, ensure_run_exists, list_runs_with, RunListing, RunLog,
    RunStatus, RunnerBackend, ServiceInfo,
};
use crate::runs::error::{io_error, RunError};
use crate::runs::launcher::{validate_workflow_type, WorkflowType};
use crate::runs::reconcile::{finalize, terminal_from_markers, Reconciled};
use crate::runs::staging::RunSubmission;
use crate::runs::state::RunState;
use crate::runs::store::{RunPaths, RunRequest, RunStore};
use crate::shared::ids::RunId;
use crate::shared::logging::append_service_log;
use crate::shared::time::now_secs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;

/// Exit code recorded for a remotely cancelled job that reports none.
const EXIT_CODE_REMOTE_CANCELED: i32 = 143;
/// Exit code recorded for a remotely failed job that reports none.
const EXIT_CODE_REMOTE_FAILED: i32 = 255;

const SUBMISSION_PRIORITY: i64 = 500;

/// Typed client for the container-scheduling control plane. The bearer
/// credential is an opaque string supplied per call; this crate never
/// inspects it.
#[derive(Debug, Clone)]
pub struct SchedulerClient {
    api_base: String,
}

#[derive(Debug, Clone, Serialize)]
struct JobSubmission<'a> {
    priority: i64,
    #[serde(flatten)]
    request: &'a RunRequest,
}

#[derive(Debug, Clone, Deserialize)]
struct CreatedJob {
    job_id: String,
}

/// Remote job record as reported by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteJob {
    pub job_id: String,
    pub state: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default)]
    pub log: String,
}

impl SchedulerClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }

    pub fn create_job(&self, credential: &str, request: &RunRequest) -> Result<String, RunError> {
        let body = JobSubmission {
            priority: SUBMISSION_PRIORITY,
            request,
        };
        let response = ureq::post(&self.endpoint("v1/jobs"))
            .set("Authorization", &format!("Bearer {credential}"))
            .send_json(serde_json::to_value(&body).map_err(|e| RunError::Remote(e.to_string()))?)
            .map_err(|e| RunError::Remote(e.to_string()))?;
        let created = response
            .into_json::<CreatedJob>()
            .map_err(|e| RunError::Remote(e.to_string()))?;
        Ok(created.job_id)
    }

    pub fn get_job(&self, credential: &str, job_id: &str) -> Result<RemoteJob, RunError> {
        let path = format!("v1/jobs/{}", urlencoding::encode(job_id));
        let response = ureq::get(&self.endpoint(&path))
            .set("Authorization", &format!("Bearer {credential}"))
            .call()
            .map_err(|e| RunError::Remote(e.to_string()))?;
        response
            .into_json::<RemoteJob>()
            .map_err(|e| RunError::Remote(e.to_string()))
    }

    /// Cancellation is a priority drop to zero, acknowledged immediately by
    /// the control plane and acted on asynchronously.
    pub fn cancel_job(&self, credential: &str, job_id: &str) -> Result<(), RunError> {
        let path = format!("v1/jobs/{}/priority", urlencoding::encode(job_id));
        ureq::post(&self.endpoint(&path))
            .set("Authorization", &format!("Bearer {credential}"))
            .send_json(serde_json::json!({ "priority": 0 }))
            .map_err(|e| RunError::Remote(e.to_string()))?;
        Ok(())
    }
}

/// Submits each workflow as a job record on a remote container scheduler.
/// The remote job id plays the role the pid marker plays locally; the
/// non-blocking liveness probe becomes a status lookup, and terminal results
/// are memoized into the same on-disk markers so later queries never need
/// the control plane again.
pub struct RemoteBackend {
    store: RunStore,
    client: SchedulerClient,
    credential: Option<String>,
}

impl RemoteBackend {
    pub fn new(store: RunStore, client: SchedulerClient, credential: Option<String>) -> Self {
        Self {
            store,
            client,
            credential,
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    fn credential(&self) -> Result<&str, RunError> {
        self.credential
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                RunError::InvalidSubmission(
                    "remote backend requires a scheduler credential".to_string(),
                )
            })
    }

    fn reconcile_run(&self, run_id: &str) -> Result<Reconciled, RunError> {
        let paths = self.store.paths(run_id);
        if !paths.dir.is_dir() {
            return Err(RunError::UnknownRunId {
                run_id: run_id.to_string(),
            });
        }

        if let Some(code) = self.store.read_exit_code(&paths)? {
            return Ok(terminal_from_markers(&self.store, &paths, code));
        }

        let Some(job_id) = self.store.read_marker(&paths.remote_id_path())? else {
            // Recorded, but the job record has not been created yet.
            return Ok(Reconciled {
                state: RunState::Queued,
                exit_code: None,
            });
        };

        let job = self.client.get_job(self.credential()?, job_id.trim())?;
        match job.state.as_str() {
            "queued" => Ok(Reconciled {
                state: RunState::Queued,
                exit_code: None,
            }),
            "scheduling" => Ok(Reconciled {
                state: RunState::Initializing,
                exit_code: None,
            }),
            "running" => Ok(Reconciled {
                state: RunState::Running,
                exit_code: None,
            }),
            "complete" => self.memoize_terminal(&paths, &job, job.exit_code.unwrap_or(0)),
            "failed" => self.memoize_terminal(
                &paths,
                &job,
                job.exit_code.unwrap_or(EXIT_CODE_REMOTE_FAILED),
            ),
            "cancelled" => {
                if !self.store.cancel_requested(&paths) {
                    self.store.mark_canceled(&paths, now_secs())?;
                }
                let code = match job.exit_code {
                    Some(code) if code != 0 => code,
                    _ => EXIT_CODE_REMOTE_CANCELED,
                };
                self.memoize_terminal(&paths, &job, code)
            }
            other => Err(RunError::Remote(format!(
                "job `{}` reported unknown state `{other}`",
                job.job_id
            ))),
        }
    }

    /// Persists the remote outcome into the local capture files and the
    /// exit-code marker, making the terminal answer durable and offline.
    fn memoize_terminal(
        &self,
        paths: &RunPaths,
        job: &RemoteJob,
        exit_code: i32,
    ) -> Result<Reconciled, RunError> {
        let stdout_path = paths.stdout_path();
        let outputs = serde_json::to_string(&job.outputs).unwrap_or_else(|_| "{}".to_string());
        fs::write(&stdout_path, outputs).map_err(|e| io_error(&stdout_path, e))?;
        let stderr_path = paths.stderr_path();
        fs::write(&stderr_path, &job.log).map_err(|e| io_error(&stderr_path, e))?;

        let recorded = finalize(&self.store, paths, exit_code)?;
        Ok(terminal_from_markers(&self.store, paths, recorded))
    }
}

impl RunnerBackend for RemoteBackend {
    fn service_info(&self) -> ServiceInfo {
        let mut workflow_type_versions = BTreeMap::new();
        workflow_type_versions.insert(
            "CWL".to_string(),
            WorkflowType::Cwl
                .supported_versions()
                .iter()
                .map(|v| v.to_string())
                .collect(),
        );
        ServiceInfo {
            workflow_type_versions,
            supported_filesystem_protocols: vec![
                "file".to_string(),
                "http".to_string(),
                "https".to_string(),
            ],
            engine_version: "cwl-runner".to_string(),
        }
    }

    fn list_runs(
        &self,
        page_size: Option<usize>,
        page_token: Option<&str>,
    ) -> Result<RunListing, RunError> {
        list_runs_with(&self.store, page_size, page_token, |run_id| {
            self.reconcile_run(run_id).map(|r| r.state)
        })
    }

    fn run_workflow(&self, submission: RunSubmission) -> Result<RunId, RunError> {
        let workflow_type = validate_workflow_type(
            &submission.workflow_type,
            &submission.workflow_type_version,
        )?;
        if workflow_type != WorkflowType::Cwl {
            return Err(RunError::UnsupportedWorkflowType {
                workflow_type: submission.workflow_type.clone(),
                version: submission.workflow_type_version.clone(),
            });
        }
        let credential = self.credential()?.to_string();

        let now = now_secs();
        let (run_id, paths, request) = create_staged_run(&self.store, &submission, now)?;
        self.store.write_timestamp(&paths.starttime_path(), now)?;

        match self.client.create_job(&credential, &request) {
            Ok(job_id) => {
                let marker = paths.remote_id_path();
                fs::write(&marker, &job_id).map_err(|e| io_error(&marker, e))?;
                append_service_log(
                    self.store.state_root(),
                    "info",
                    "run.remote_submitted",
                    &format!("run_id={run_id} job_id={job_id}"),
                );
            }
            Err(err) => {
                // The identifier already exists; a failed remote submission
                // becomes a terminal record, like any other launch failure.
                record_launch_failure(&self.store, &paths, &err)?;
            }
        }
        Ok(run_id)
    }

    fn run_status(&self, run_id: &str) -> Result<RunStatus, RunError> {
        let reconciled = self.reconcile_run(run_id)?;
        Ok(RunStatus {
            run_id: run_id.to_string(),
            state: reconciled.state,
        })
    }

    fn run_log(&self, run_id: &str) -> Result<RunLog, RunError> {
        let paths = ensure_run_exists(&self.store, run_id)?;
        let reconciled = self.reconcile_run(run_id)?;
        assemble_run_log(&self.store, &paths, reconciled)
    }

    fn cancel_run(&self, run_id: &str) -> Result<RunId, RunError> {
        let paths = ensure_run_exists(&self.store, run_id)?;
        self.store.mark_canceled(&paths, now_secs())?;
        if let Some(job_id) = self.store.read_marker(&paths.remote_id_path())? {
            self.client.cancel_job(self.credential()?, job_id.trim())?;
        }
        append_service_log(
            self.store.state_root(),
            "info",
            "run.cancel",
            &format!("run_id={run_id}"),
        );
        RunId::parse(run_id).map_err(|_| RunError::UnknownRunId {
            run_id: run_id.to_string(),
        })
    }
}

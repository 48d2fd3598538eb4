use crate::backends::{
    assemble_run_log, create_staged_run, ensure_run_exists, list_runs_with, RunListing, RunLog,
    RunStatus, RunnerBackend, ServiceInfo,
};
use crate::runs::error::{io_error, RunError};
use crate::runs::launcher::{
    build_command, spawn_engine, validate_workflow_type, write_params_file, EngineCatalog,
    WorkflowType,
};
use crate::runs::process::{send_signal, ProcessRegistry, SIGTERM};
use crate::runs::reconcile::{finalize, reconcile, Reconciled};
use crate::runs::staging::RunSubmission;
use crate::runs::store::RunStore;
use crate::shared::ids::RunId;
use crate::shared::logging::append_service_log;
use crate::shared::time::now_secs;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

/// Exit code recorded when the engine executable could not be started at
/// all. Mirrors the shell's command-not-found convention.
const EXIT_CODE_LAUNCH_FAILURE: i32 = 127;

/// Runs each workflow as a direct child process of this server. The engine
/// pid marker plus the in-process child registry are enough to answer every
/// status query; nothing blocks on run completion.
pub struct LocalBackend {
    store: RunStore,
    catalog: EngineCatalog,
    registry: ProcessRegistry,
}

impl LocalBackend {
    pub fn new(store: RunStore, catalog: EngineCatalog) -> Self {
        Self {
            store,
            catalog,
            registry: ProcessRegistry::default(),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    fn reconcile_run(&self, run_id: &str) -> Result<Reconciled, RunError> {
        let paths = self.store.paths(run_id);
        let reconciled = reconcile(&self.store, &paths, &self.registry)?;
        if reconciled.state.is_terminal() {
            self.registry.remove(run_id);
        }
        Ok(reconciled)
    }
}

impl RunnerBackend for LocalBackend {
    fn service_info(&self) -> ServiceInfo {
        ServiceInfo {
            workflow_type_versions: supported_type_versions(),
            supported_filesystem_protocols: vec![
                "file".to_string(),
                "http".to_string(),
                "https".to_string(),
            ],
            engine_version: self.catalog.cwl_runner.clone(),
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

        let now = now_secs();
        let (run_id, paths, request) = create_staged_run(&self.store, &submission, now)?;
        self.store.write_timestamp(&paths.starttime_path(), now)?;
        write_params_file(&paths, &request)?;

        let command = build_command(
            &self.catalog,
            workflow_type,
            &request.workflow_url,
            &paths.params_path(),
            &request.workflow_engine_parameters,
        );

        match spawn_engine(&self.store, &paths, &command) {
            Ok(child) => {
                self.registry.insert(run_id.as_str(), child);
                append_service_log(
                    self.store.state_root(),
                    "info",
                    "run.launched",
                    &format!("run_id={run_id} cmd={}", command.join(" ")),
                );
            }
            Err(err) => {
                // The identifier is already allocated; a failed launch is a
                // terminal run record, not a synchronous error.
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
        if let Some(pid) = self.store.read_pid_marker(&paths)? {
            send_signal(pid, SIGTERM);
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

pub(crate) fn supported_type_versions() -> BTreeMap<String, Vec<String>> {
    let mut versions = BTreeMap::new();
    for (name, workflow_type) in [
        ("CWL", WorkflowType::Cwl),
        ("WDL", WorkflowType::Wdl),
        ("PY", WorkflowType::Py),
    ] {
        versions.insert(
            name.to_string(),
            workflow_type
                .supported_versions()
                .iter()
                .map(|v| v.to_string())
                .collect(),
        );
    }
    versions
}

/// Records a failed launch as an immediately terminal run: the error text
/// lands in the captured stderr and the exit-code marker is finalized.
pub(crate) fn record_launch_failure(
    store: &RunStore,
    paths: &crate::runs::store::RunPaths,
    err: &RunError,
) -> Result<(), RunError> {
    let stderr_path = paths.stderr_path();
    let mut stderr = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stderr_path)
        .map_err(|e| io_error(&stderr_path, e))?;
    writeln!(stderr, "{err}").map_err(|e| io_error(&stderr_path, e))?;
    finalize(store, paths, EXIT_CODE_LAUNCH_FAILURE)?;
    append_service_log(
        store.state_root(),
        "error",
        "run.launch_failed",
        &format!("run_id={} error={err}", paths.run_id),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::staging::Attachment;
    use crate::runs::state::RunState;
    use tempfile::tempdir;

    fn submission() -> RunSubmission {
        RunSubmission {
            workflow_url: Some("wf.cwl".to_string()),
            workflow_params: Some(serde_json::json!({"x": 1})),
            workflow_type: "CWL".to_string(),
            workflow_type_version: "v1.0".to_string(),
            attachments: vec![Attachment {
                filename: "wf.cwl".to_string(),
                bytes: b"cwlVersion: v1.0".to_vec(),
            }],
            ..RunSubmission::default()
        }
    }

    #[test]
    fn service_info_lists_all_supported_pairs() {
        let dir = tempdir().expect("temp dir");
        let backend = LocalBackend::new(RunStore::new(dir.path()), EngineCatalog::default());
        let info = backend.service_info();
        assert_eq!(
            info.workflow_type_versions["CWL"],
            vec!["v1.0", "v1.1", "v1.2"]
        );
        assert_eq!(info.workflow_type_versions["WDL"], vec!["draft-2"]);
        assert_eq!(info.workflow_type_versions["PY"], vec!["3"]);
        assert_eq!(info.engine_version, "cwl-runner");
    }

    #[test]
    fn unsupported_version_is_rejected_before_any_run_exists() {
        let dir = tempdir().expect("temp dir");
        let backend = LocalBackend::new(RunStore::new(dir.path()), EngineCatalog::default());
        let mut bad = submission();
        bad.workflow_type_version = "v9.9".to_string();

        let err = backend.run_workflow(bad).expect_err("must reject");
        assert!(matches!(err, RunError::UnsupportedWorkflowType { .. }));
        assert!(backend.store().list_run_ids().expect("listing").is_empty());
    }

    #[test]
    fn missing_engine_binary_yields_terminal_error_run() {
        let dir = tempdir().expect("temp dir");
        let catalog = EngineCatalog {
            cwl_runner: "definitely-not-a-real-engine-binary".to_string(),
            ..EngineCatalog::default()
        };
        let backend = LocalBackend::new(RunStore::new(dir.path()), catalog);

        let run_id = backend.run_workflow(submission()).expect("submit");
        let status = backend.run_status(run_id.as_str()).expect("status");
        assert_eq!(status.state, RunState::ExecutorError);

        let log = backend.run_log(run_id.as_str()).expect("log");
        assert_eq!(log.run_log.exit_code, Some(EXIT_CODE_LAUNCH_FAILURE));
        assert!(log.run_log.stderr.contains("definitely-not-a-real-engine"));
    }

    #[test]
    fn status_for_unknown_run_is_not_found() {
        let dir = tempdir().expect("temp dir");
        let backend = LocalBackend::new(RunStore::new(dir.path()), EngineCatalog::default());
        let err = backend.run_status("run-nope").expect_err("not found");
        assert!(matches!(err, RunError::UnknownRunId { .. }));
        let err = backend.cancel_run("run-nope").expect_err("not found");
        assert!(matches!(err, RunError::UnknownRunId { .. }));
    }
}

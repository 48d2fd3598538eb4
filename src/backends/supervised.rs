use crate::backends::local::{record_launch_failure, supported_type_versions};
use crate::backends::{
    assemble_run_log, create_staged_run, ensure_run_exists, list_runs_with, RunListing, RunLog,
    RunStatus, RunnerBackend, ServiceInfo,
};
use crate::runs::error::{io_error, json_error, RunError};
use crate::runs::launcher::{
    spawn_engine, validate_workflow_type, write_params_file, EngineCatalog, WorkflowType,
};
use crate::runs::process::{exit_code_from_status, send_signal, ProcessRegistry, SIGTERM};
use crate::runs::reconcile::{finalize, reconcile_detached, Reconciled};
use crate::runs::staging::RunSubmission;
use crate::runs::store::{RunPaths, RunStore};
use crate::shared::ids::RunId;
use crate::shared::logging::append_service_log;
use crate::shared::time::now_secs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const DEFAULT_JOBSTORE_DIR: &str = "jobstore_data";
const CLOUD_JOBSTORE_PREFIXES: [&str; 3] = ["aws", "google", "azure"];

/// Launch instructions handed from the server to the supervisor process
/// through the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub engine: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Runs each workflow under a supervising OS process spawned by re-executing
/// this crate's own binary. The supervisor owns the engine child, so a crash
/// in the launch path (or the engine) can never take the server down, and
/// the server can restart without losing the run. The supervisor map below
/// is a best-effort cancellation index only; state always comes from the
/// run directory markers.
pub struct SupervisedBackend {
    store: RunStore,
    catalog: EngineCatalog,
    supervisor_binary: PathBuf,
    supervisors: ProcessRegistry,
}

impl SupervisedBackend {
    pub fn new(store: RunStore, catalog: EngineCatalog, supervisor_binary: PathBuf) -> Self {
        Self {
            store,
            catalog,
            supervisor_binary,
            supervisors: ProcessRegistry::default(),
        }
    }

    pub fn with_current_exe(store: RunStore, catalog: EngineCatalog) -> Result<Self, RunError> {
        let exe = std::env::current_exe().map_err(|e| RunError::Spawn(e.to_string()))?;
        Ok(Self::new(store, catalog, exe))
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    fn reconcile_run(&self, run_id: &str) -> Result<Reconciled, RunError> {
        let paths = self.store.paths(run_id);
        let reconciled = reconcile_detached(&self.store, &paths)?;
        if reconciled.state.is_terminal() {
            self.supervisors.remove(run_id);
        }
        Ok(reconciled)
    }

    fn spawn_supervisor(&self, paths: &RunPaths) -> Result<u32, RunError> {
        let child = Command::new(&self.supervisor_binary)
            .arg("__supervise")
            .arg("--work-dir")
            .arg(&paths.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RunError::Spawn(format!("supervisor: {e}")))?;
        let pid = child.id();
        self.supervisors.insert(&paths.run_id, child);
        Ok(pid)
    }
}

impl RunnerBackend for SupervisedBackend {
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

        let spec = LaunchSpec {
            engine: self.catalog.engine_for(workflow_type).to_string(),
            extra_args: self.catalog.extra_args.clone(),
        };
        write_launch_spec(&paths, &spec)?;

        match self.spawn_supervisor(&paths) {
            Ok(pid) => append_service_log(
                self.store.state_root(),
                "info",
                "run.supervisor_spawned",
                &format!("run_id={run_id} supervisor_pid={pid}"),
            ),
            Err(err) => record_launch_failure(&self.store, &paths, &err)?,
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

        // Only effective while this server still holds the supervisor
        // handle; the engine pid marker covers the rest.
        if let Some(pid) = self.supervisors.pid_of(run_id) {
            send_signal(pid, SIGTERM);
        }
        if let Some(engine_pid) = self.store.read_pid_marker(&paths)? {
            send_signal(engine_pid, SIGTERM);
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

pub fn write_launch_spec(paths: &RunPaths, spec: &LaunchSpec) -> Result<(), RunError> {
    let path = paths.launch_spec_path();
    let body = serde_json::to_vec_pretty(spec).map_err(|e| json_error(&path, e))?;
    fs::write(&path, &body).map_err(|e| io_error(&path, e))
}

pub fn read_launch_spec(store: &RunStore, paths: &RunPaths) -> Result<LaunchSpec, RunError> {
    let path = paths.launch_spec_path();
    let raw = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
    serde_json::from_str(&raw).map_err(|e| json_error(&path, e))
}

/// Entry point of the `__supervise` process: performs the multi-step launch
/// the server deliberately keeps out of its own failure domain, blocks on
/// the engine, and records the terminal markers. Returns the engine's exit
/// code (or the launch-failure code) for the supervisor's own exit status.
pub fn run_supervisor(work_dir: &Path) -> Result<i32, RunError> {
    let (store, paths) = store_for_work_dir(work_dir)?;
    match launch_and_wait(&store, &paths) {
        Ok(code) => Ok(code),
        Err(err) => {
            record_launch_failure(&store, &paths, &err)?;
            Ok(127)
        }
    }
}

fn store_for_work_dir(work_dir: &Path) -> Result<(RunStore, RunPaths), RunError> {
    let invalid = || {
        RunError::Spawn(format!(
            "work dir {} is not a run directory",
            work_dir.display()
        ))
    };
    let run_id = work_dir
        .file_name()
        .and_then(|v| v.to_str())
        .ok_or_else(invalid)?
        .to_string();
    let state_root = work_dir
        .parent()
        .and_then(Path::parent)
        .ok_or_else(invalid)?;
    let store = RunStore::new(state_root);
    let paths = store.paths(&run_id);
    if !paths.dir.is_dir() {
        return Err(RunError::UnknownRunId { run_id });
    }
    Ok((store, paths))
}

fn launch_and_wait(store: &RunStore, paths: &RunPaths) -> Result<i32, RunError> {
    let request = store.load_request(paths)?;
    let workflow_type =
        validate_workflow_type(&request.workflow_type, &request.workflow_type_version)?;
    let spec = read_launch_spec(store, paths)?;

    let engine_args = resolve_jobstore_options(paths, &request.workflow_engine_parameters)?;
    let workflow_path = link_into_staging(
        paths,
        &request.workflow_url,
        workflow_type,
    )?;
    let params_path = link_params_into_staging(paths)?;

    let mut command = vec![spec.engine.clone()];
    command.extend(spec.extra_args.iter().cloned());
    command.extend(engine_args);
    command.push(workflow_path);
    if workflow_type != WorkflowType::Py {
        command.push(params_path);
    }

    let mut child = spawn_engine(store, paths, &command)?;
    let status = child.wait().map_err(|e| io_error(&paths.dir, e))?;
    let code = exit_code_from_status(status);
    finalize(store, paths, code)?;
    Ok(code)
}

/// Jobstore-aware option pass: pick up a caller-supplied `--job-store=`,
/// drop caller `--outdir=` overrides, keep every other engine parameter,
/// default the jobstore to a run-scoped location and persist it. Output
/// placement stays run-scoped unless the jobstore lives in a cloud store.
fn resolve_jobstore_options(
    paths: &RunPaths,
    engine_parameters: &[String],
) -> Result<Vec<String>, RunError> {
    let mut jobstore = None;
    let mut cloud = false;
    let mut args = Vec::new();

    for param in engine_parameters {
        if let Some(value) = param.strip_prefix("--job-store=") {
            jobstore = Some(value.to_string());
            cloud = CLOUD_JOBSTORE_PREFIXES
                .iter()
                .any(|prefix| value.starts_with(prefix));
        }
        if !param.starts_with("--outdir=") && !param.starts_with("-o=") {
            args.push(param.clone());
        }
    }

    if !cloud {
        args.push(format!("--outdir={}", paths.outdir().display()));
    }
    let jobstore = match jobstore {
        Some(value) => value,
        None => {
            let default = format!("file:{}", paths.dir.join(DEFAULT_JOBSTORE_DIR).display());
            args.push(format!("--job-store={default}"));
            default
        }
    };

    let jobstore_path = paths.jobstore_path();
    fs::write(&jobstore_path, &jobstore).map_err(|e| io_error(&jobstore_path, e))?;
    Ok(args)
}

/// Links a local workflow into the staging directory under a stable name,
/// falling back to a symlink when hard links cross devices. Remote locators
/// are handed to the engine untouched.
fn link_into_staging(
    paths: &RunPaths,
    workflow_url: &str,
    workflow_type: WorkflowType,
) -> Result<String, RunError> {
    let Some(source) = workflow_url.strip_prefix("file://") else {
        return Ok(workflow_url.to_string());
    };
    let extension = match workflow_type {
        WorkflowType::Cwl => "cwl",
        WorkflowType::Wdl => "wdl",
        WorkflowType::Py => "py",
    };
    let dest = paths.attachments_dir().join(format!("wes_workflow.{extension}"));
    link_or_symlink(Path::new(source), &dest)?;
    Ok(dest.display().to_string())
}

fn link_params_into_staging(paths: &RunPaths) -> Result<String, RunError> {
    let dest = paths.attachments_dir().join("wes_input.json");
    link_or_symlink(&paths.params_path(), &dest)?;
    Ok(dest.display().to_string())
}

fn link_or_symlink(source: &Path, dest: &Path) -> Result<(), RunError> {
    if dest.exists() {
        let _ = fs::remove_file(dest);
    }
    if fs::hard_link(source, dest).is_ok() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(source, dest).map_err(|e| io_error(dest, e))
    }
    #[cfg(not(unix))]
    {
        fs::copy(source, dest).map(|_| ()).map_err(|e| io_error(dest, e))
    }
}

pub mod local;
pub mod remote;
pub mod supervised;

use crate::runs::error::RunError;
use crate::runs::launcher::read_command;
use crate::runs::reconcile::Reconciled;
use crate::runs::staging::RunSubmission;
use crate::runs::state::RunState;
use crate::runs::store::{RunPaths, RunRequest, RunStore};
use crate::shared::ids::RunId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub use local::LocalBackend;
pub use remote::{RemoteBackend, SchedulerClient};
pub use supervised::SupervisedBackend;

/// Static capability descriptor returned by the capability query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub workflow_type_versions: BTreeMap<String, Vec<String>>,
    pub supported_filesystem_protocols: Vec<String>,
    pub engine_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub state: RunState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunListing {
    pub runs: Vec<RunStatus>,
    pub next_page_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub cmd: Vec<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Full run record: the original request, the reconciled state, the captured
/// streams, and the output document once the run is COMPLETE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    pub request: RunRequest,
    pub state: RunState,
    pub run_log: RunLogEntry,
    pub task_logs: Vec<Value>,
    pub outputs: Value,
}

/// The run-lifecycle contract every execution strategy satisfies. Submission
/// never blocks for completion; status and log queries reconcile from
/// durable markers; cancellation is an acknowledged best effort.
pub trait RunnerBackend {
    fn service_info(&self) -> ServiceInfo;

    fn list_runs(
        &self,
        page_size: Option<usize>,
        page_token: Option<&str>,
    ) -> Result<RunListing, RunError>;

    fn run_workflow(&self, submission: RunSubmission) -> Result<RunId, RunError>;

    fn run_status(&self, run_id: &str) -> Result<RunStatus, RunError>;

    fn run_log(&self, run_id: &str) -> Result<RunLog, RunError>;

    fn cancel_run(&self, run_id: &str) -> Result<RunId, RunError>;
}

/// Constructs the strategy the settings select. Each strategy is a separate
/// implementing type; nothing here dispatches on kind afterwards.
pub fn build_backend(
    settings: &crate::config::Settings,
) -> Result<Box<dyn RunnerBackend>, RunError> {
    let store = RunStore::new(&settings.state_root);
    let catalog = settings.engine_catalog();
    match settings.backend {
        crate::config::BackendKind::Local => Ok(Box::new(LocalBackend::new(store, catalog))),
        crate::config::BackendKind::Supervised => match &settings.supervisor_binary {
            Some(path) => Ok(Box::new(SupervisedBackend::new(store, catalog, path.clone()))),
            None => Ok(Box::new(SupervisedBackend::with_current_exe(store, catalog)?)),
        },
        crate::config::BackendKind::Remote => {
            let remote = settings.remote.clone().unwrap_or_default();
            Ok(Box::new(RemoteBackend::new(
                store,
                SchedulerClient::new(remote.api_base),
                remote.credential,
            )))
        }
    }
}

/// Applies the opaque continuation token and page size to a sorted id list.
/// The token is the last run id of the previous page; the next page resumes
/// strictly after it.
pub fn paginate(ids: Vec<String>, page_size: Option<usize>, page_token: Option<&str>) -> (Vec<String>, String) {
    let mut remaining = match page_token.filter(|token| !token.is_empty()) {
        Some(token) => ids.into_iter().filter(|id| id.as_str() > token).collect::<Vec<_>>(),
        None => ids,
    };

    let next_page_token = match page_size {
        Some(size) if size > 0 && remaining.len() > size => {
            remaining.truncate(size);
            remaining.last().cloned().unwrap_or_default()
        }
        _ => String::new(),
    };
    (remaining, next_page_token)
}

/// Shared listing walk: enumerate the store, reconcile each run with the
/// strategy's own state function, skip directories that stopped being runs
/// mid-walk.
pub fn list_runs_with<F>(
    store: &RunStore,
    page_size: Option<usize>,
    page_token: Option<&str>,
    mut state_of: F,
) -> Result<RunListing, RunError>
where
    F: FnMut(&str) -> Result<RunState, RunError>,
{
    let (ids, next_page_token) = paginate(store.list_run_ids()?, page_size, page_token);
    let mut runs = Vec::with_capacity(ids.len());
    for run_id in ids {
        match state_of(&run_id) {
            Ok(state) => runs.push(RunStatus { run_id, state }),
            Err(RunError::UnknownRunId { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(RunListing {
        runs,
        next_page_token,
    })
}

/// Assembles the full log record for backends that capture streams into the
/// run directory. The output document is the engine's stdout parsed as JSON,
/// exposed only once the run is COMPLETE.
pub fn assemble_run_log(
    store: &RunStore,
    paths: &RunPaths,
    reconciled: Reconciled,
) -> Result<RunLog, RunError> {
    let request = store.load_request(paths)?;
    let stdout = store.read_marker(&paths.stdout_path())?.unwrap_or_default();
    let stderr = store.read_marker(&paths.stderr_path())?.unwrap_or_default();

    let outputs = if reconciled.state == RunState::Complete {
        serde_json::from_str(&stdout).unwrap_or_else(|_| Value::Object(Default::default()))
    } else {
        Value::Object(Default::default())
    };

    Ok(RunLog {
        run_id: paths.run_id.clone(),
        request,
        state: reconciled.state,
        run_log: RunLogEntry {
            cmd: read_command(store, paths)?,
            start_time: store.read_timestamp(&paths.starttime_path())?,
            end_time: store.read_timestamp(&paths.endtime_path())?,
            stdout,
            stderr,
            exit_code: reconciled.exit_code,
        },
        task_logs: Vec::new(),
        outputs,
    })
}

/// Creates the run directory, stages attachments into it and persists the
/// request snapshot. A staging failure removes the half-created directory so
/// no run becomes observable. Shared by all strategies.
pub fn create_staged_run(
    store: &RunStore,
    submission: &RunSubmission,
    now: i64,
) -> Result<(RunId, RunPaths, RunRequest), RunError> {
    let run_id = store.allocate_run_id(now)?;
    let paths = store.paths(run_id.as_str());
    store.create_run_dirs(&paths)?;

    let request = match crate::runs::staging::stage_submission(&paths.attachments_dir(), submission)
    {
        Ok(request) => request,
        Err(err) => {
            store.discard_run(&paths);
            return Err(err);
        }
    };

    if let Err(err) = store.persist_request(&paths, &request) {
        store.discard_run(&paths);
        return Err(err);
    }
    Ok((run_id, paths, request))
}

pub(crate) fn ensure_run_exists(store: &RunStore, run_id: &str) -> Result<RunPaths, RunError> {
    let paths = store.paths(run_id);
    if !paths.dir.is_dir() {
        return Err(RunError::UnknownRunId {
            run_id: run_id.to_string(),
        });
    }
    Ok(paths)
}

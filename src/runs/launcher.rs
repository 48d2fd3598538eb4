use crate::runs::error::{io_error, json_error, RunError};
use crate::runs::store::{RunPaths, RunRequest, RunStore};
use std::fs;
use std::path::Path;
use std::process::{Child, Command, Stdio};

/// Workflow languages this service knows how to launch an engine for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowType {
    Cwl,
    Wdl,
    Py,
}

impl WorkflowType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cwl" => Some(WorkflowType::Cwl),
            "wdl" => Some(WorkflowType::Wdl),
            "py" => Some(WorkflowType::Py),
            _ => None,
        }
    }

    pub fn supported_versions(self) -> &'static [&'static str] {
        match self {
            WorkflowType::Cwl => &["v1.0", "v1.1", "v1.2"],
            WorkflowType::Wdl => &["draft-2"],
            WorkflowType::Py => &["3"],
        }
    }
}

/// Engine executables used per workflow type, overridable from settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCatalog {
    pub cwl_runner: String,
    pub wdl_runner: String,
    pub script_interpreter: String,
    pub extra_args: Vec<String>,
}

impl Default for EngineCatalog {
    fn default() -> Self {
        Self {
            cwl_runner: "cwl-runner".to_string(),
            wdl_runner: "wdl-runner".to_string(),
            script_interpreter: "python3".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl EngineCatalog {
    pub fn engine_for(&self, workflow_type: WorkflowType) -> &str {
        match workflow_type {
            WorkflowType::Cwl => &self.cwl_runner,
            WorkflowType::Wdl => &self.wdl_runner,
            WorkflowType::Py => &self.script_interpreter,
        }
    }
}

/// Checks the declared type/version pair against the supported set. Runs
/// before any directory or process is created; failures are synchronous.
pub fn validate_workflow_type(
    workflow_type: &str,
    version: &str,
) -> Result<WorkflowType, RunError> {
    let unsupported = || RunError::UnsupportedWorkflowType {
        workflow_type: workflow_type.to_string(),
        version: version.to_string(),
    };
    let parsed = WorkflowType::parse(workflow_type).ok_or_else(unsupported)?;
    if !parsed.supported_versions().contains(&version) {
        return Err(unsupported());
    }
    Ok(parsed)
}

/// Builds the engine command line. CWL and WDL engines take the workflow
/// plus the params document; script workflows take only the workflow file.
pub fn build_command(
    catalog: &EngineCatalog,
    workflow_type: WorkflowType,
    workflow_location: &str,
    params_path: &Path,
    engine_parameters: &[String],
) -> Vec<String> {
    let mut command = vec![catalog.engine_for(workflow_type).to_string()];
    command.extend(catalog.extra_args.iter().cloned());
    command.extend(engine_parameters.iter().cloned());
    command.push(local_path_or_url(workflow_location));
    if workflow_type != WorkflowType::Py {
        command.push(params_path.display().to_string());
    }
    command
}

/// Engines resolve plain paths everywhere; strip the `file://` scheme that
/// staging produced and pass every other locator through untouched.
pub fn local_path_or_url(location: &str) -> String {
    match location.strip_prefix("file://") {
        Some(path) => path.to_string(),
        None => location.to_string(),
    }
}

/// Writes the params document the engine command references.
pub fn write_params_file(paths: &RunPaths, request: &RunRequest) -> Result<(), RunError> {
    let path = paths.params_path();
    let body =
        serde_json::to_vec_pretty(&request.workflow_params).map_err(|e| json_error(&path, e))?;
    fs::write(&path, &body).map_err(|e| io_error(&path, e))
}

/// Starts the engine with stdout/stderr redirected to the run-scoped capture
/// files and cwd set to the run's output directory. The command line and the
/// child pid are persisted before control returns, so a restarted server can
/// still find the process.
pub fn spawn_engine(
    store: &RunStore,
    paths: &RunPaths,
    command: &[String],
) -> Result<Child, RunError> {
    let cmd_path = paths.cmd_path();
    let encoded = serde_json::to_vec(command).map_err(|e| json_error(&cmd_path, e))?;
    fs::write(&cmd_path, &encoded).map_err(|e| io_error(&cmd_path, e))?;

    let stdout_path = paths.stdout_path();
    let stdout = fs::File::create(&stdout_path).map_err(|e| io_error(&stdout_path, e))?;
    let stderr_path = paths.stderr_path();
    let stderr = fs::File::create(&stderr_path).map_err(|e| io_error(&stderr_path, e))?;

    let (program, args) = command
        .split_first()
        .ok_or_else(|| RunError::Spawn("empty engine command".to_string()))?;

    let child = Command::new(program)
        .args(args)
        .current_dir(paths.outdir())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|err| RunError::Spawn(format!("{program}: {err}")))?;

    store.write_pid_marker(paths, child.id())?;
    Ok(child)
}

/// Reads back the persisted command line, if the launch got that far.
pub fn read_command(store: &RunStore, paths: &RunPaths) -> Result<Vec<String>, RunError> {
    match store.read_marker(&paths.cmd_path())? {
        Some(raw) => {
            serde_json::from_str(&raw).map_err(|e| json_error(&paths.cmd_path(), e))
        }
        None => Ok(Vec::new()),
    }
}

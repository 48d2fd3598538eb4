use crate::runs::error::{io_error, json_error, RunError};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::{generate_run_id, RunId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const RUN_ID_MAX_GENERATION_ATTEMPTS: usize = 16;

/// Immutable snapshot of a submission, written once to `request.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub workflow_url: String,
    pub workflow_params: Value,
    pub workflow_type: String,
    pub workflow_type_version: String,
    #[serde(default)]
    pub workflow_engine_parameters: Vec<String>,
    #[serde(default)]
    pub tags: Map<String, Value>,
}

/// Marker-file catalog for one run directory. The file set is the on-disk
/// contract the reconciler depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_id: String,
    pub dir: PathBuf,
}

impl RunPaths {
    pub fn request_path(&self) -> PathBuf {
        self.dir.join("request.json")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.dir.join("attachments")
    }

    pub fn outdir(&self) -> PathBuf {
        self.dir.join("outdir")
    }

    pub fn params_path(&self) -> PathBuf {
        self.dir.join("input.json")
    }

    pub fn cmd_path(&self) -> PathBuf {
        self.dir.join("cmd")
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.dir.join("stdout")
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.dir.join("stderr")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join("pid")
    }

    pub fn exit_code_path(&self) -> PathBuf {
        self.dir.join("exit_code")
    }

    pub fn cancel_path(&self) -> PathBuf {
        self.dir.join("cancel")
    }

    pub fn starttime_path(&self) -> PathBuf {
        self.dir.join("starttime")
    }

    pub fn endtime_path(&self) -> PathBuf {
        self.dir.join("endtime")
    }

    pub fn jobstore_path(&self) -> PathBuf {
        self.dir.join("jobstore")
    }

    pub fn remote_id_path(&self) -> PathBuf {
        self.dir.join("remote_id")
    }

    pub fn launch_spec_path(&self) -> PathBuf {
        self.dir.join("launch.json")
    }
}

/// Durable per-run record store rooted at `<state_root>/runs`.
#[derive(Debug, Clone)]
pub struct RunStore {
    state_root: PathBuf,
}

impl RunStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn runs_root(&self) -> PathBuf {
        self.state_root.join("runs")
    }

    pub fn paths(&self, run_id: &str) -> RunPaths {
        RunPaths {
            run_id: run_id.to_string(),
            dir: self.runs_root().join(run_id),
        }
    }

    pub fn run_exists(&self, run_id: &str) -> bool {
        self.paths(run_id).dir.is_dir()
    }

    pub fn allocate_run_id(&self, now: i64) -> Result<RunId, RunError> {
        for _ in 0..RUN_ID_MAX_GENERATION_ATTEMPTS {
            let run_id = generate_run_id(now).map_err(RunError::IdAllocation)?;
            if !self.run_exists(run_id.as_str()) {
                return Ok(run_id);
            }
        }
        Err(RunError::IdAllocation(format!(
            "no unused id after {RUN_ID_MAX_GENERATION_ATTEMPTS} attempts"
        )))
    }

    pub fn create_run_dirs(&self, paths: &RunPaths) -> Result<(), RunError> {
        for dir in [&paths.dir, &paths.attachments_dir(), &paths.outdir()] {
            fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }
        Ok(())
    }

    pub fn persist_request(&self, paths: &RunPaths, request: &RunRequest) -> Result<(), RunError> {
        let path = paths.request_path();
        let body = serde_json::to_vec_pretty(request).map_err(|e| json_error(&path, e))?;
        fs::write(&path, &body).map_err(|e| io_error(&path, e))
    }

    pub fn load_request(&self, paths: &RunPaths) -> Result<RunRequest, RunError> {
        let path = paths.request_path();
        let raw = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        serde_json::from_str(&raw).map_err(|e| json_error(&path, e))
    }

    pub fn write_pid_marker(&self, paths: &RunPaths, pid: u32) -> Result<(), RunError> {
        let path = paths.pid_path();
        atomic_write_file(&path, pid.to_string().as_bytes()).map_err(|e| io_error(&path, e))
    }

    pub fn read_pid_marker(&self, paths: &RunPaths) -> Result<Option<u32>, RunError> {
        Ok(self
            .read_marker(&paths.pid_path())?
            .and_then(|raw| raw.trim().parse::<u32>().ok()))
    }

    pub fn clear_pid_marker(&self, paths: &RunPaths) {
        let _ = fs::remove_file(paths.pid_path());
    }

    pub fn write_exit_code(&self, paths: &RunPaths, exit_code: i32) -> Result<(), RunError> {
        let path = paths.exit_code_path();
        atomic_write_file(&path, exit_code.to_string().as_bytes()).map_err(|e| io_error(&path, e))
    }

    pub fn read_exit_code(&self, paths: &RunPaths) -> Result<Option<i32>, RunError> {
        Ok(self
            .read_marker(&paths.exit_code_path())?
            .and_then(|raw| raw.trim().parse::<i32>().ok()))
    }

    pub fn write_timestamp(&self, path: &Path, now: i64) -> Result<(), RunError> {
        fs::write(path, now.to_string()).map_err(|e| io_error(path, e))
    }

    pub fn read_timestamp(&self, path: &Path) -> Result<Option<i64>, RunError> {
        Ok(self
            .read_marker(path)?
            .and_then(|raw| raw.trim().parse::<i64>().ok()))
    }

    pub fn mark_canceled(&self, paths: &RunPaths, now: i64) -> Result<(), RunError> {
        self.write_timestamp(&paths.cancel_path(), now)
    }

    pub fn cancel_requested(&self, paths: &RunPaths) -> bool {
        paths.cancel_path().exists()
    }

    /// Reads a marker file, treating absence as `None`.
    pub fn read_marker(&self, path: &Path) -> Result<Option<String>, RunError> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(Some(raw)),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(io_error(path, source)),
        }
    }

    /// Enumerates run directories in lexicographic order. The ordering is
    /// stable within a single call, which is all pagination relies on.
    pub fn list_run_ids(&self) -> Result<Vec<String>, RunError> {
        let root = self.runs_root();
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&root, source)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| io_error(&root, source))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Removes a half-created run directory after a staging failure so the
    /// identifier is never observable as a run.
    pub fn discard_run(&self, paths: &RunPaths) {
        let _ = fs::remove_dir_all(&paths.dir);
    }
}

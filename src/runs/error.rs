use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid run submission: {0}")]
    InvalidSubmission(String),
    #[error("unsupported workflow type `{workflow_type}` with version `{version}`")]
    UnsupportedWorkflowType {
        workflow_type: String,
        version: String,
    },
    #[error("workflow run `{run_id}` not found")]
    UnknownRunId { run_id: String },
    #[error("failed to stage attachment `{name}`: {reason}")]
    Staging { name: String, reason: String },
    #[error("failed to spawn workflow engine: {0}")]
    Spawn(String),
    #[error("failed to allocate a unique run id: {0}")]
    IdAllocation(String),
    #[error("remote scheduler request failed: {0}")]
    Remote(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn io_error(path: &Path, source: std::io::Error) -> RunError {
    RunError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub fn json_error(path: &Path, source: serde_json::Error) -> RunError {
    RunError::Json {
        path: path.display().to_string(),
        source,
    }
}

use crate::runs::error::{io_error, RunError};
use crate::runs::store::RunRequest;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_DESCRIPTOR_NAME: &str = "workflow.descriptor";

/// One named byte stream supplied alongside the submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// The raw inputs of a submit operation, before staging resolves them into
/// an immutable [`RunRequest`].
#[derive(Debug, Clone, Default)]
pub struct RunSubmission {
    pub workflow_url: Option<String>,
    pub workflow_descriptor: Option<String>,
    pub workflow_params: Option<Value>,
    pub workflow_type: String,
    pub workflow_type_version: String,
    pub workflow_engine_parameters: Vec<String>,
    pub tags: Map<String, Value>,
    pub attachments: Vec<Attachment>,
}

/// Materializes the submission's attachments under `staging_dir` and returns
/// the resolved request. Filenames are confined to the staging directory;
/// traversal and absolute components are rejected outright.
pub fn stage_submission(
    staging_dir: &Path,
    submission: &RunSubmission,
) -> Result<RunRequest, RunError> {
    for attachment in &submission.attachments {
        let relative = sanitize_attachment_name(&attachment.filename)?;
        let dest = staging_dir.join(&relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        fs::write(&dest, &attachment.bytes).map_err(|e| io_error(&dest, e))?;
    }

    let workflow_url = resolve_workflow_url(staging_dir, submission)?;

    let workflow_params = submission
        .workflow_params
        .clone()
        .ok_or_else(|| RunError::InvalidSubmission("missing workflow_params".to_string()))?;

    Ok(RunRequest {
        workflow_url,
        workflow_params,
        workflow_type: submission.workflow_type.clone(),
        workflow_type_version: submission.workflow_type_version.clone(),
        workflow_engine_parameters: submission.workflow_engine_parameters.clone(),
        tags: submission.tags.clone(),
    })
}

fn resolve_workflow_url(
    staging_dir: &Path,
    submission: &RunSubmission,
) -> Result<String, RunError> {
    if let Some(descriptor) = &submission.workflow_descriptor {
        let name = match submission.workflow_url.as_deref() {
            Some(url) if !url.contains(':') && !url.is_empty() => sanitize_attachment_name(url)?,
            _ => PathBuf::from(DEFAULT_DESCRIPTOR_NAME),
        };
        let dest = staging_dir.join(&name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        fs::write(&dest, descriptor.as_bytes()).map_err(|e| io_error(&dest, e))?;
        return Ok(file_locator(staging_dir, &name)?);
    }

    let workflow_url = submission
        .workflow_url
        .as_deref()
        .filter(|url| !url.is_empty())
        .ok_or_else(|| RunError::InvalidSubmission("missing workflow_url".to_string()))?;

    if workflow_url.contains(':') {
        // Remote and file locators pass through verbatim.
        return Ok(workflow_url.to_string());
    }

    if submission.attachments.is_empty() {
        return Err(RunError::InvalidSubmission(format!(
            "relative workflow_url `{workflow_url}` requires at least one workflow attachment"
        )));
    }
    let relative = sanitize_attachment_name(workflow_url)?;
    file_locator(staging_dir, &relative)
}

fn file_locator(staging_dir: &Path, relative: &Path) -> Result<String, RunError> {
    let root = fs::canonicalize(staging_dir).map_err(|e| io_error(staging_dir, e))?;
    Ok(format!("file://{}", root.join(relative).display()))
}

/// Collapses a supplied filename into a safe path relative to the staging
/// directory. Empty and `.` segments are dropped; `..` segments and absolute
/// paths fail the submission rather than being silently resolved.
pub fn sanitize_attachment_name(raw: &str) -> Result<PathBuf, RunError> {
    if raw.starts_with('/') {
        return Err(staging_error(raw, "absolute paths are not allowed"));
    }

    let mut parts = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(staging_error(
                    raw,
                    "parent directory traversal is not allowed",
                ))
            }
            other => parts.push(sanitize_component(other)),
        }
    }

    if parts.is_empty() {
        return Err(staging_error(raw, "empty filename"));
    }
    Ok(parts.iter().collect())
}

fn sanitize_component(segment: &str) -> String {
    segment
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn staging_error(name: &str, reason: &str) -> RunError {
    RunError::Staging {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn base_submission() -> RunSubmission {
        RunSubmission {
            workflow_url: Some("workflow.cwl".to_string()),
            workflow_params: Some(serde_json::json!({"input": "x"})),
            workflow_type: "CWL".to_string(),
            workflow_type_version: "v1.0".to_string(),
            attachments: vec![Attachment {
                filename: "workflow.cwl".to_string(),
                bytes: b"cwlVersion: v1.0".to_vec(),
            }],
            ..RunSubmission::default()
        }
    }

    #[test]
    fn sanitize_rejects_traversal_and_absolute_names() {
        assert!(sanitize_attachment_name("../etc/passwd").is_err());
        assert!(sanitize_attachment_name("dir/../other").is_err());
        assert!(sanitize_attachment_name("/etc/passwd").is_err());
        assert!(sanitize_attachment_name("").is_err());
        assert!(sanitize_attachment_name("./.").is_err());
    }

    #[test]
    fn sanitize_flattens_odd_characters_and_keeps_nesting() {
        let cleaned = sanitize_attachment_name("data/sub dir/in put.txt").expect("sanitize");
        assert_eq!(cleaned, PathBuf::from("data/sub_dir/in_put.txt"));
        let dotted = sanitize_attachment_name("./a/./b.cwl").expect("sanitize");
        assert_eq!(dotted, PathBuf::from("a/b.cwl"));
    }

    #[test]
    fn relative_workflow_url_resolves_against_staged_attachment() {
        let dir = tempdir().expect("temp dir");
        let request = stage_submission(dir.path(), &base_submission()).expect("stage");
        assert!(request.workflow_url.starts_with("file://"));
        assert!(request.workflow_url.ends_with("/workflow.cwl"));
        let staged = dir.path().join("workflow.cwl");
        assert_eq!(
            fs::read_to_string(staged).expect("read staged"),
            "cwlVersion: v1.0"
        );
    }

    #[test]
    fn relative_workflow_url_without_attachments_is_invalid() {
        let dir = tempdir().expect("temp dir");
        let mut submission = base_submission();
        submission.attachments.clear();
        let err = stage_submission(dir.path(), &submission).expect_err("must fail");
        assert!(matches!(err, RunError::InvalidSubmission(_)));
    }

    #[test]
    fn missing_workflow_params_is_invalid() {
        let dir = tempdir().expect("temp dir");
        let mut submission = base_submission();
        submission.workflow_params = None;
        let err = stage_submission(dir.path(), &submission).expect_err("must fail");
        assert!(matches!(err, RunError::InvalidSubmission(_)));
    }

    #[test]
    fn inline_descriptor_is_written_and_url_rewritten() {
        let dir = tempdir().expect("temp dir");
        let mut submission = base_submission();
        submission.attachments.clear();
        submission.workflow_url = None;
        submission.workflow_descriptor = Some("cwlVersion: v1.2".to_string());

        let request = stage_submission(dir.path(), &submission).expect("stage");
        assert!(request.workflow_url.starts_with("file://"));
        assert!(request.workflow_url.ends_with("/workflow.descriptor"));
        let written = fs::read_to_string(dir.path().join("workflow.descriptor")).expect("read");
        assert_eq!(written, "cwlVersion: v1.2");
    }

    #[test]
    fn remote_locator_passes_through_verbatim() {
        let dir = tempdir().expect("temp dir");
        let mut submission = base_submission();
        submission.attachments.clear();
        submission.workflow_url = Some("https://example.com/wf.cwl".to_string());
        let request = stage_submission(dir.path(), &submission).expect("stage");
        assert_eq!(request.workflow_url, "https://example.com/wf.cwl");
    }

    #[test]
    fn nested_attachments_stay_inside_the_staging_directory() {
        let dir = tempdir().expect("temp dir");
        let mut submission = base_submission();
        submission.attachments.push(Attachment {
            filename: "data/inner/ref.fa".to_string(),
            bytes: b">chr1".to_vec(),
        });
        stage_submission(dir.path(), &submission).expect("stage");
        assert!(dir.path().join("data/inner/ref.fa").is_file());
    }
}

use runyard::backends::create_staged_run;
use runyard::runs::error::RunError;
use runyard::runs::staging::{Attachment, RunSubmission};
use runyard::runs::store::RunStore;
use std::fs;
use tempfile::tempdir;

fn submission_with_attachments(attachments: Vec<Attachment>) -> RunSubmission {
    RunSubmission {
        workflow_url: Some("main.cwl".to_string()),
        workflow_params: Some(serde_json::json!({"threads": 4})),
        workflow_type: "CWL".to_string(),
        workflow_type_version: "v1.0".to_string(),
        attachments,
        ..RunSubmission::default()
    }
}

#[test]
fn staged_run_persists_request_with_rewritten_workflow_url() {
    let dir = tempdir().expect("temp dir");
    let store = RunStore::new(dir.path());
    let submission = submission_with_attachments(vec![
        Attachment {
            filename: "main.cwl".to_string(),
            bytes: b"cwlVersion: v1.0".to_vec(),
        },
        Attachment {
            filename: "lib/tools.cwl".to_string(),
            bytes: b"cwlVersion: v1.0".to_vec(),
        },
    ]);

    let (run_id, paths, request) =
        create_staged_run(&store, &submission, 1_700_000_000).expect("stage");
    assert!(store.run_exists(run_id.as_str()));
    assert!(request.workflow_url.starts_with("file://"));
    assert!(request.workflow_url.ends_with("/main.cwl"));

    // Attachments live inside the run's own staging directory.
    assert!(paths.attachments_dir().join("main.cwl").is_file());
    assert!(paths.attachments_dir().join("lib/tools.cwl").is_file());

    // The persisted snapshot round-trips identically.
    let loaded = store.load_request(&paths).expect("load request");
    assert_eq!(loaded, request);
}

#[test]
fn traversal_attachment_fails_and_leaves_no_run_behind() {
    let dir = tempdir().expect("temp dir");
    let store = RunStore::new(dir.path());
    let submission = submission_with_attachments(vec![
        Attachment {
            filename: "main.cwl".to_string(),
            bytes: b"cwlVersion: v1.0".to_vec(),
        },
        Attachment {
            filename: "../escape.txt".to_string(),
            bytes: b"nope".to_vec(),
        },
    ]);

    let err = create_staged_run(&store, &submission, 1_700_000_000).expect_err("must fail");
    assert!(matches!(err, RunError::Staging { .. }));
    assert!(store.list_run_ids().expect("listing").is_empty());

    // Nothing escaped the (discarded) staging area either.
    assert!(!dir.path().join("escape.txt").exists());
    assert!(!dir.path().parent().expect("parent").join("escape.txt").exists());
}

#[test]
fn missing_params_fails_without_creating_a_run() {
    let dir = tempdir().expect("temp dir");
    let store = RunStore::new(dir.path());
    let mut submission = submission_with_attachments(vec![Attachment {
        filename: "main.cwl".to_string(),
        bytes: b"cwlVersion: v1.0".to_vec(),
    }]);
    submission.workflow_params = None;

    let err = create_staged_run(&store, &submission, 1_700_000_000).expect_err("must fail");
    assert!(matches!(err, RunError::InvalidSubmission(_)));
    assert!(store.list_run_ids().expect("listing").is_empty());
}

#[test]
fn staged_runs_allocate_unique_ids_and_disjoint_directories() {
    let dir = tempdir().expect("temp dir");
    let store = RunStore::new(dir.path());
    let submission = submission_with_attachments(vec![Attachment {
        filename: "main.cwl".to_string(),
        bytes: b"cwlVersion: v1.0".to_vec(),
    }]);

    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..8 {
        let (run_id, paths, _) =
            create_staged_run(&store, &submission, 1_700_000_000).expect("stage");
        assert!(seen.insert(run_id.to_string()), "duplicate id {run_id}");
        assert!(paths.dir.ends_with(run_id.as_str()));
    }
    assert_eq!(store.list_run_ids().expect("listing").len(), 8);
}

#[test]
fn attachment_bytes_survive_staging_verbatim() {
    let dir = tempdir().expect("temp dir");
    let store = RunStore::new(dir.path());
    let payload: Vec<u8> = (0..=255).collect();
    let submission = submission_with_attachments(vec![
        Attachment {
            filename: "main.cwl".to_string(),
            bytes: b"cwlVersion: v1.0".to_vec(),
        },
        Attachment {
            filename: "data/blob.bin".to_string(),
            bytes: payload.clone(),
        },
    ]);

    let (_, paths, _) = create_staged_run(&store, &submission, 1_700_000_000).expect("stage");
    let staged = fs::read(paths.attachments_dir().join("data/blob.bin")).expect("read blob");
    assert_eq!(staged, payload);
}

use runyard::runs::store::{RunRequest, RunStore};
use serde_json::Map;
use tempfile::tempdir;

#[test]
fn run_directory_layout_matches_the_marker_contract() {
    let store = RunStore::new("/srv/runyard");
    let paths = store.paths("run-1");

    assert_eq!(paths.dir, std::path::PathBuf::from("/srv/runyard/runs/run-1"));
    assert_eq!(paths.request_path(), paths.dir.join("request.json"));
    assert_eq!(paths.attachments_dir(), paths.dir.join("attachments"));
    assert_eq!(paths.outdir(), paths.dir.join("outdir"));
    assert_eq!(paths.params_path(), paths.dir.join("input.json"));
    assert_eq!(paths.cmd_path(), paths.dir.join("cmd"));
    assert_eq!(paths.stdout_path(), paths.dir.join("stdout"));
    assert_eq!(paths.stderr_path(), paths.dir.join("stderr"));
    assert_eq!(paths.pid_path(), paths.dir.join("pid"));
    assert_eq!(paths.exit_code_path(), paths.dir.join("exit_code"));
    assert_eq!(paths.cancel_path(), paths.dir.join("cancel"));
    assert_eq!(paths.starttime_path(), paths.dir.join("starttime"));
    assert_eq!(paths.endtime_path(), paths.dir.join("endtime"));
    assert_eq!(paths.jobstore_path(), paths.dir.join("jobstore"));
    assert_eq!(paths.remote_id_path(), paths.dir.join("remote_id"));
    assert_eq!(paths.launch_spec_path(), paths.dir.join("launch.json"));
}

#[test]
fn request_snapshot_defaults_optional_fields_on_load() {
    let dir = tempdir().expect("temp dir");
    let store = RunStore::new(dir.path());
    let paths = store.paths("run-sparse");
    store.create_run_dirs(&paths).expect("create dirs");

    // A snapshot written without the optional fields still loads.
    std::fs::write(
        paths.request_path(),
        r#"{
  "workflow_url": "file:///stage/wf.cwl",
  "workflow_params": {"a": 1},
  "workflow_type": "CWL",
  "workflow_type_version": "v1.0"
}"#,
    )
    .expect("write request");

    let loaded = store.load_request(&paths).expect("load");
    assert_eq!(loaded.workflow_url, "file:///stage/wf.cwl");
    assert!(loaded.workflow_engine_parameters.is_empty());
    assert!(loaded.tags.is_empty());
}

#[test]
fn tags_round_trip_with_the_request() {
    let dir = tempdir().expect("temp dir");
    let store = RunStore::new(dir.path());
    let paths = store.paths("run-tags");
    store.create_run_dirs(&paths).expect("create dirs");

    let mut tags = Map::new();
    tags.insert("project".to_string(), serde_json::json!("genomics"));
    tags.insert("priority".to_string(), serde_json::json!(2));
    let request = RunRequest {
        workflow_url: "https://example.com/wf.cwl".to_string(),
        workflow_params: serde_json::json!({}),
        workflow_type: "CWL".to_string(),
        workflow_type_version: "v1.1".to_string(),
        workflow_engine_parameters: Vec::new(),
        tags,
    };
    store.persist_request(&paths, &request).expect("persist");
    let loaded = store.load_request(&paths).expect("load");
    assert_eq!(loaded.tags["project"], serde_json::json!("genomics"));
    assert_eq!(loaded, request);
}

#[test]
fn timestamps_round_trip_and_tolerate_absence() {
    let dir = tempdir().expect("temp dir");
    let store = RunStore::new(dir.path());
    let paths = store.paths("run-times");
    store.create_run_dirs(&paths).expect("create dirs");

    assert_eq!(
        store.read_timestamp(&paths.starttime_path()).expect("read"),
        None
    );
    store
        .write_timestamp(&paths.starttime_path(), 1_700_000_123)
        .expect("write");
    assert_eq!(
        store.read_timestamp(&paths.starttime_path()).expect("read"),
        Some(1_700_000_123)
    );
}

#[test]
fn files_in_the_runs_root_are_not_listed_as_runs() {
    let dir = tempdir().expect("temp dir");
    let store = RunStore::new(dir.path());
    store
        .create_run_dirs(&store.paths("run-real"))
        .expect("create dirs");
    std::fs::write(store.runs_root().join("stray-file"), b"junk").expect("stray file");

    assert_eq!(store.list_run_ids().expect("listing"), vec!["run-real"]);
}

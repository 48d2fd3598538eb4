use crate::runs::error::{io_error, RunError};
use crate::runs::process::{is_process_alive, ProcessRegistry, ReapStatus};
use crate::runs::state::RunState;
use crate::runs::store::{RunPaths, RunStore};
use crate::shared::logging::append_service_log;
use crate::shared::time::now_secs;
use std::fs;
use std::io::{ErrorKind, Write};

/// Exit code recorded when a run's process vanished without leaving a wait
/// status behind (server crash mid-write, external reaping).
pub const EXIT_CODE_UNRECONCILED: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub state: RunState,
    pub exit_code: Option<i32>,
}

/// Derives the current lifecycle state from the run's durable markers
/// without blocking. Safe to call concurrently from any number of query
/// paths; the only mutation is the idempotent terminal-marker write.
///
/// Marker hierarchy: exit code → pid probe → cmd (launch begun) → request
/// only. A missing run directory is a not-found error, not a state.
pub fn reconcile(
    store: &RunStore,
    paths: &RunPaths,
    registry: &ProcessRegistry,
) -> Result<Reconciled, RunError> {
    if !paths.dir.is_dir() {
        return Err(RunError::UnknownRunId {
            run_id: paths.run_id.clone(),
        });
    }

    if let Some(code) = store.read_exit_code(paths)? {
        return Ok(terminal_from_markers(store, paths, code));
    }

    if store.read_pid_marker(paths)?.is_some() {
        return probe_process(store, paths, registry);
    }

    if paths.cmd_path().exists() {
        return Ok(Reconciled {
            state: RunState::Initializing,
            exit_code: None,
        });
    }

    Ok(Reconciled {
        state: RunState::Queued,
        exit_code: None,
    })
}

/// Reconciles a run whose process handle lives in another process (the
/// supervised strategy's engine belongs to the supervisor, not the server).
/// Liveness degrades to the signal-0 probe; the true exit code is written by
/// whichever process owns the child.
pub fn reconcile_detached(store: &RunStore, paths: &RunPaths) -> Result<Reconciled, RunError> {
    reconcile(store, paths, &ProcessRegistry::default())
}

fn probe_process(
    store: &RunStore,
    paths: &RunPaths,
    registry: &ProcessRegistry,
) -> Result<Reconciled, RunError> {
    match registry.try_reap(&paths.run_id) {
        Some(ReapStatus::StillRunning) => Ok(Reconciled {
            state: RunState::Running,
            exit_code: None,
        }),
        Some(ReapStatus::Exited(code)) => {
            let recorded = finalize(store, paths, code)?;
            Ok(terminal_from_markers(store, paths, recorded))
        }
        None => {
            // Not a child of this server process; fall back to a signal-0
            // liveness probe. A pid that is gone entirely can no longer
            // report a wait status, so the run degrades to the sentinel
            // instead of hanging in RUNNING forever.
            let pid = store.read_pid_marker(paths)?.unwrap_or(0);
            if is_process_alive(pid) {
                return Ok(Reconciled {
                    state: RunState::Running,
                    exit_code: None,
                });
            }
            let recorded = finalize(store, paths, EXIT_CODE_UNRECONCILED)?;
            Ok(terminal_from_markers(store, paths, recorded))
        }
    }
}

/// Records the terminal result. Concurrent callers racing here all derive
/// the same value from the same wait status; a sentinel writer never
/// overwrites a real exit code that won the race.
pub fn finalize(store: &RunStore, paths: &RunPaths, exit_code: i32) -> Result<i32, RunError> {
    let recorded = match write_exit_code_if_absent(paths, exit_code)? {
        Some(existing) => existing,
        None => exit_code,
    };
    if !paths.endtime_path().exists() {
        store.write_timestamp(&paths.endtime_path(), now_secs())?;
    }
    store.clear_pid_marker(paths);
    append_service_log(
        store.state_root(),
        "info",
        "run.terminal",
        &format!("run_id={} exit_code={recorded}", paths.run_id),
    );
    Ok(recorded)
}

/// Create-only write of the exit-code marker. Returns the previously
/// recorded value when another reconciler already finished the transition.
fn write_exit_code_if_absent(paths: &RunPaths, exit_code: i32) -> Result<Option<i32>, RunError> {
    let path = paths.exit_code_path();
    match fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path)
    {
        Ok(mut file) => {
            file.write_all(exit_code.to_string().as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|e| io_error(&path, e))?;
            Ok(None)
        }
        Err(source) if source.kind() == ErrorKind::AlreadyExists => {
            let raw = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
            Ok(raw.trim().parse::<i32>().ok())
        }
        Err(source) => Err(io_error(&path, source)),
    }
}

/// Maps a recorded exit code to its terminal state. A non-zero exit with a
/// durable cancel marker reads as CANCELED; exit zero is always COMPLETE,
/// even if a cancel arrived too late to matter.
pub fn terminal_from_markers(store: &RunStore, paths: &RunPaths, exit_code: i32) -> Reconciled {
    let state = if exit_code == 0 {
        RunState::Complete
    } else if store.cancel_requested(paths) {
        RunState::Canceled
    } else {
        RunState::ExecutorError
    };
    Reconciled {
        state,
        exit_code: Some(exit_code),
    }
}

use std::collections::BTreeMap;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

pub const SIGTERM: &str = "-TERM";
pub const SIGKILL: &str = "-KILL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapStatus {
    StillRunning,
    Exited(i32),
}

/// Best-effort index from run id to the child handle this server process
/// launched. It exists to reap exits and to deliver cancellation signals;
/// it is never the source of truth for state, so a freshly restarted server
/// legitimately starts empty and still answers every status query.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    children: Mutex<BTreeMap<String, Child>>,
}

impl ProcessRegistry {
    pub fn insert(&self, run_id: &str, child: Child) {
        let mut children = self.children.lock().expect("process registry poisoned");
        children.insert(run_id.to_string(), child);
    }

    pub fn pid_of(&self, run_id: &str) -> Option<u32> {
        let children = self.children.lock().expect("process registry poisoned");
        children.get(run_id).map(|child| child.id())
    }

    /// Non-blocking wait on the registered child. Returns `None` when this
    /// server never launched the run (or already removed it).
    pub fn try_reap(&self, run_id: &str) -> Option<ReapStatus> {
        let mut children = self.children.lock().expect("process registry poisoned");
        let child = children.get_mut(run_id)?;
        match child.try_wait() {
            Ok(None) => Some(ReapStatus::StillRunning),
            Ok(Some(status)) => {
                children.remove(run_id);
                Some(ReapStatus::Exited(exit_code_from_status(status)))
            }
            Err(_) => None,
        }
    }

    /// Drops the entry once the run is observed terminal, reaping the child
    /// if it has already exited.
    pub fn remove(&self, run_id: &str) {
        let mut children = self.children.lock().expect("process registry poisoned");
        if let Some(mut child) = children.remove(run_id) {
            let _ = child.try_wait();
        }
    }

    pub fn len(&self) -> usize {
        self.children.lock().expect("process registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(unix)]
pub fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        // Killed by signal: report the conventional 128+N so cancellation
        // never reads as a clean exit.
        None => 128 + status.signal().unwrap_or(0),
    }
}

#[cfg(not(unix))]
pub fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(255)
}

pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        false
    }
}

pub fn send_signal(pid: u32, signal: &str) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}

//! Blocking subprocess execution with a hard deadline.
//!
//! Every external call the fleet makes (wp-cli, unzip, the cache clear
//! command) goes through [`run_with_timeout`]. A call that outlives its
//! deadline is killed and reported as an error; it never hangs the rollout.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{FleetError, Result};

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// The most useful diagnostic text: stderr when present, else stdout,
    /// capped to the last 4KB.
    pub fn diagnostic(&self) -> String {
        const MAX: usize = 4 * 1024;
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if text.len() <= MAX {
            return text.to_string();
        }
        let mut start = text.len() - MAX;
        while !text.is_char_boundary(start) {
            start += 1;
        }
        text[start..].to_string()
    }
}

/// Run `cmd` to completion or until `timeout` elapses.
///
/// Spawn failures and timeouts are `FleetError::Runtime`; a non-zero exit is
/// an `Ok` with `success == false` so callers decide what it means.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<ExecOutput> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| FleetError::Runtime(format!("failed to spawn {program}: {e}")))?;

    let pid = child.id();

    // Drain pipes on their own threads so a chatty child cannot block on a full buffer.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_thread = std::thread::spawn(move || read_all(stdout));
    let stderr_thread = std::thread::spawn(move || read_all(stderr));

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(child.wait());
    });

    let status = match rx.recv_timeout(timeout) {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(FleetError::Runtime(format!("{program}: wait failed: {e}"))),
        Err(_) => {
            kill_process(pid);
            tracing::warn!(program = %program, pid, timeout_secs = timeout.as_secs(), "command timed out");
            return Err(FleetError::Runtime(format!(
                "{program} timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    Ok(ExecOutput {
        success: status.success(),
        stdout: stdout_thread.join().unwrap_or_default(),
        stderr: stderr_thread.join().unwrap_or_default(),
    })
}

fn read_all<R: Read>(pipe: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut r) = pipe {
        let _ = r.read_to_string(&mut buf);
    }
    buf
}

/// SIGKILL by pid. Best-effort.
fn kill_process(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

//! Subprocess control shared by the script runner and the iteration supervisor:
//! process-group spawning, combined-stream capture, and escalated signal delivery
//! (TERM, then KILL after a grace period).

use anyhow::{Context, Result};
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Grace period between TERM and KILL when escalating signal delivery.
pub const SIGNAL_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ShellOutcome {
    pub exit_code: i32,
    pub output: String,
}

/// Spawn `command` via `sh -c`, in its own process group, with `env` layered on top of
/// the inherited environment and stdout+stderr combined into one stream.
pub fn spawn_shell(command: &str, work_dir: &Path, env: &[(String, String)]) -> Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in env {
        cmd.env(k, v);
    }
    // New process group so the whole subtree can be signalled together.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd.spawn().context("failed to spawn shell command")
}

/// Send `signal` to the process group headed by `pid`.
pub fn signal_group(pid: i32, signal: i32) {
    unsafe {
        libc::kill(-pid, signal);
    }
}

pub fn terminate_group(pid: i32) {
    signal_group(pid, libc::SIGTERM);
}

pub fn kill_group(pid: i32) {
    signal_group(pid, libc::SIGKILL);
}

/// TERM the group, wait up to `grace` for the child to exit, then KILL if it hasn't.
pub async fn escalate(child: &mut Child, pid: i32, grace: Duration) {
    terminate_group(pid);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        kill_group(pid);
        let _ = child.wait().await;
    }
}

async fn drain(mut reader: impl AsyncRead + Unpin, into: &mut String) {
    let mut lines = BufReader::new(&mut reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        into.push_str(&line);
        into.push('\n');
    }
}

/// Run `command` to completion, or terminate it (exit code 124) if it outlives
/// `timeout`. Stdout and stderr are captured and concatenated in the returned output.
pub async fn run_shell_with_timeout(
    command: &str,
    work_dir: &Path,
    env: &[(String, String)],
    timeout: Duration,
) -> Result<ShellOutcome> {
    let mut child = spawn_shell(command, work_dir, env)?;
    let pid = child.id().context("child has no pid")? as i32;

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");
    let mut output = String::new();

    let wait_fut = async {
        let mut out = String::new();
        let mut err = String::new();
        tokio::join!(drain(&mut stdout, &mut out), drain(&mut stderr, &mut err));
        let status = child.wait().await;
        (out, err, status)
    };

    match tokio::time::timeout(timeout, wait_fut).await {
        Ok((out, err, status)) => {
            output.push_str(&out);
            output.push_str(&err);
            let code = status
                .context("failed to wait for child")?
                .code()
                .unwrap_or(-1);
            Ok(ShellOutcome {
                exit_code: code,
                output,
            })
        }
        Err(_) => {
            escalate(&mut child, pid, SIGNAL_GRACE_PERIOD).await;
            output.push_str("script timed out\n");
            Ok(ShellOutcome {
                exit_code: 124,
                output,
            })
        }
    }
}

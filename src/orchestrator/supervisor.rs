//! Iteration orchestrator (§4.7): the centrepiece "fresh context every iteration"
//! supervisor loop. Each phase attempt is a new operating-system process; state only
//! passes through the issue state file and whatever artefacts the agent writes to the
//! worktree.

use crate::config::Config;
use crate::engine::WorkflowEngine;
use crate::errors::{ConflictError, NotFoundError};
use crate::issue_state::{self, IssueState};
use crate::orchestrator::RunRecord;
use crate::process;
use crate::script_runner;
use crate::value::Context;
use crate::watchers::log_watcher::LogWatcher;
use crate::watchers::sdk_watcher::SdkOutputWatcher;
use crate::workflow::{PhaseType, Workflow};
use crate::workflow_loader;
use anyhow::{Context as _, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

const COMPLETION_PROMISE: &str = "<promise>COMPLETE</promise>";
const TICK_INTERVAL: Duration = Duration::from_millis(500);
const SUPERVISE_POLL: Duration = Duration::from_millis(250);

/// Parameters supplied to `Supervisor::start`.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub max_iterations: u32,
    pub inactivity_timeout: Duration,
    pub iteration_timeout: Duration,
    pub max_buffer_size: Option<usize>,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            inactivity_timeout: Duration::from_secs(600),
            iteration_timeout: Duration::from_secs(3600),
            max_buffer_size: None,
        }
    }
}

struct ActiveIssue {
    owner: String,
    repo: String,
    number: u64,
}

/// Drives the fresh-context-every-iteration loop for one issue at a time. Cheaply
/// cloneable: internal state lives behind an `Arc` so the HTTP server and the CLI can
/// share one supervisor.
#[derive(Clone)]
pub struct Supervisor {
    config: Config,
    record: Arc<Mutex<RunRecord>>,
    issue: Arc<Mutex<Option<ActiveIssue>>>,
    stop_flag: Arc<AtomicBool>,
    force_flag: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let viewer_log_path = config.data_dir.join("viewer-run.log");
        Self {
            config,
            record: Arc::new(Mutex::new(RunRecord::idle(viewer_log_path))),
            issue: Arc::new(Mutex::new(None)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            force_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn status(&self) -> RunRecord {
        self.record.lock().await.clone()
    }

    pub async fn active_issue(&self) -> Option<(String, String, u64)> {
        self.issue
            .lock()
            .await
            .as_ref()
            .map(|i| (i.owner.clone(), i.repo.clone(), i.number))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Change the active issue. Rejected while a run is in progress.
    pub async fn set_issue(&self, owner: &str, repo: &str, number: u64) -> Result<()> {
        let record = self.record.lock().await;
        if record.running {
            return Err(ConflictError::RunningIssueSwitch.into());
        }
        drop(record);
        let mut issue = self.issue.lock().await;
        *issue = Some(ActiveIssue {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        });
        Ok(())
    }

    /// Launch the supervisor loop as a background task. Fails fast if already running,
    /// no issue is selected, or the worktree does not exist.
    pub async fn start(&self, params: RunParams) -> Result<()> {
        {
            let record = self.record.lock().await;
            if record.running {
                return Err(ConflictError::AlreadyRunning {
                    issue_ref: record.issue_ref.clone().unwrap_or_default(),
                }
                .into());
            }
        }

        let issue_guard = self.issue.lock().await;
        let active = issue_guard.as_ref().ok_or(NotFoundError::NoActiveIssue)?;
        let worktree = self
            .config
            .worktree_path(&active.owner, &active.repo, active.number);
        if !worktree.exists() {
            return Err(NotFoundError::Worktree(worktree).into());
        }
        let owner = active.owner.clone();
        let repo = active.repo.clone();
        let number = active.number;
        drop(issue_guard);

        self.stop_flag.store(false, Ordering::SeqCst);
        self.force_flag.store(false, Ordering::SeqCst);

        let state_dir = self.config.issues_dir().join(&owner).join(&repo).join(number.to_string());
        let viewer_log_path = state_dir.join("viewer-run.log");

        {
            let mut record = self.record.lock().await;
            *record = RunRecord {
                running: true,
                current_iteration: 0,
                max_iterations: params.max_iterations,
                inactivity_timeout: params.inactivity_timeout,
                iteration_timeout: params.iteration_timeout,
                completed_via_promise: false,
                completed_via_state: false,
                completion_reason: None,
                started_at: Some(Utc::now()),
                ended_at: None,
                return_code: None,
                viewer_log_path: viewer_log_path.clone(),
                last_error: None,
                issue_ref: Some(format!("{owner}/{repo}#{number}")),
            };
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            let outcome = supervisor
                .run_loop(owner, repo, number, worktree, state_dir, params)
                .await;
            let mut record = supervisor.record.lock().await;
            record.running = false;
            record.ended_at = Some(Utc::now());
            if let Err(err) = outcome {
                record.last_error = Some(err.to_string());
            }
        });

        Ok(())
    }

    /// Signal the loop to stop. If `force`, the current subprocess group is KILLed
    /// instead of TERMinated. Waits until the supervisor task has recorded completion.
    pub async fn stop(&self, force: bool) -> Result<()> {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.force_flag.store(force, Ordering::SeqCst);
        loop {
            if !self.record.lock().await.running {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn run_loop(
        &self,
        owner: String,
        repo: String,
        number: u64,
        worktree: PathBuf,
        state_dir: PathBuf,
        params: RunParams,
    ) -> Result<()> {
        let issues_dir = self.config.issues_dir();
        let last_run_log = state_dir.join("last-run.log");
        let sdk_output = state_dir.join("sdk-output.json");
        let progress_path = state_dir.join("progress.txt");

        let log_watcher = LogWatcher::new(&last_run_log);
        let sdk_watcher = SdkOutputWatcher::new(&sdk_output);

        let mut workflow: Option<Workflow> = None;
        let mut workflow_name = String::new();

        for iteration in 1..=params.max_iterations {
            if self.stop_flag.load(Ordering::SeqCst) {
                self.finish("stop requested", false, false).await;
                return Ok(());
            }

            {
                let mut record = self.record.lock().await;
                record.current_iteration = iteration;
            }
            append_viewer_log(
                &state_dir.join("viewer-run.log"),
                &format!("[ITERATION {iteration}/{}] starting", params.max_iterations),
            );
            append_progress(
                &progress_path,
                &format!("Iteration {iteration} of {}", params.max_iterations),
            );

            if let Err(err) = ensure_state_symlink(&worktree, &state_dir) {
                append_viewer_log(
                    &state_dir.join("viewer-run.log"),
                    &format!("[ERROR] failed to set up .jeeves-state symlink: {err}"),
                );
                tokio::time::sleep(TICK_INTERVAL).await;
                continue;
            }

            let mut state = issue_state::load(&issues_dir, &owner, &repo, number)
                .context("failed to load issue state")?;

            if workflow.is_none() || workflow_name != state.workflow {
                workflow_name = state.workflow.clone();
                workflow = Some(
                    workflow_loader::load_workflow_by_name(&workflow_name, &self.config.workflows_dir())
                        .context("failed to load workflow")?,
                );
            }
            let wf = workflow.as_ref().expect("workflow loaded above");
            let engine = WorkflowEngine::new(wf);

            let Some(phase) = wf.phase(&state.phase).cloned() else {
                append_viewer_log(
                    &state_dir.join("viewer-run.log"),
                    &format!("[ERROR] phase '{}' is not defined in workflow '{}'", state.phase, wf.name),
                );
                tokio::time::sleep(TICK_INTERVAL).await;
                continue;
            };

            if phase.kind == PhaseType::Terminal {
                self.finish(
                    &format!("reached terminal phase: {}", state.phase),
                    false,
                    true,
                )
                .await;
                return Ok(());
            }

            let context = Context::new(serde_json::json!({"status": state.status}));

            match phase.kind {
                PhaseType::Script => {
                    let result = script_runner::run_with_timeout(
                        &phase,
                        &worktree,
                        &context,
                        self.config.script_timeout,
                    )
                    .await
                    .context("script phase failed to run")?;
                    for (key, value) in result.status_updates {
                        state.status.insert(key, value);
                    }
                    issue_state::save(&issues_dir, &state).context("failed to save issue state")?;
                    append_viewer_log(
                        &state_dir.join("viewer-run.log"),
                        &format!("[SCRIPT] phase '{}' exited {}", state.phase, result.exit_code),
                    );
                }
                PhaseType::Execute | PhaseType::Evaluate => {
                    let Some(prompt_name) = phase.prompt.as_deref() else {
                        append_viewer_log(
                            &state_dir.join("viewer-run.log"),
                            &format!("[ERROR] phase '{}' has no prompt configured", state.phase),
                        );
                        tokio::time::sleep(TICK_INTERVAL).await;
                        continue;
                    };
                    let prompt_path = self.config.prompts_dir().join(prompt_name);
                    if !prompt_path.exists() {
                        return Err(NotFoundError::Prompt(prompt_path).into());
                    }

                    self.run_agent_iteration(
                        &prompt_path,
                        &worktree,
                        &state_dir,
                        &last_run_log,
                        &sdk_output,
                        &params,
                        &log_watcher,
                    )
                    .await?;
                }
                PhaseType::Terminal => unreachable!("handled above"),
            }

            if self.stop_flag.load(Ordering::SeqCst) {
                self.finish("stop requested", false, false).await;
                return Ok(());
            }

            let state = issue_state::load(&issues_dir, &owner, &repo, number)
                .context("failed to reload issue state after iteration")?;
            let reload_context = Context::new(serde_json::json!({"status": state.status}));

            if let Some(next) = engine.evaluate_transitions(&state.phase, &reload_context) {
                let mut next_state = state.clone();
                let from = next_state.phase.clone();
                next_state.phase = next.clone();
                issue_state::save(&issues_dir, &next_state)
                    .context("failed to save transitioned issue state")?;
                append_viewer_log(
                    &state_dir.join("viewer-run.log"),
                    &format!("[TRANSITION] {from} → {next}"),
                );
                if wf.is_terminal(&next) {
                    self.finish(
                        &format!("reached terminal phase: {next}"),
                        false,
                        true,
                    )
                    .await;
                    return Ok(());
                }
            }

            if promise_found(&sdk_output, &last_run_log) {
                self.finish("completion promise found in output", true, false)
                    .await;
                return Ok(());
            }

            tokio::time::sleep(TICK_INTERVAL).await;
        }

        self.finish("reached maximum iterations", false, false).await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_agent_iteration(
        &self,
        prompt_path: &Path,
        worktree: &Path,
        state_dir: &Path,
        last_run_log: &Path,
        sdk_output: &Path,
        params: &RunParams,
        log_watcher: &LogWatcher,
    ) -> Result<()> {
        let mut argv = vec![
            "--prompt".to_string(),
            prompt_path.display().to_string(),
            "--output".to_string(),
            sdk_output.display().to_string(),
            "--text-output".to_string(),
            last_run_log.display().to_string(),
            "--work-dir".to_string(),
            worktree.display().to_string(),
            "--state-dir".to_string(),
            state_dir.display().to_string(),
        ];
        if let Some(max) = params.max_buffer_size {
            argv.push("--max-buffer-size".to_string());
            argv.push(max.to_string());
        }

        let command = format!(
            "{} {}",
            self.config.agent_cmd,
            argv.iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = process::spawn_shell(&command, worktree, &[])
            .context("failed to spawn agent subprocess")?;
        let pid = child.id().context("agent child has no pid")? as i32;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let viewer_log_path = state_dir.join("viewer-run.log");

        let out_path = viewer_log_path.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                append_viewer_log(&out_path, &line);
            }
        });
        let err_path = viewer_log_path.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                append_viewer_log(&err_path, &line);
            }
        });

        let deadline = Instant::now() + params.iteration_timeout;
        let mut last_activity = Instant::now();
        let mut last_log_mtime = mtime_of(last_run_log);
        let mut last_sdk_mtime = mtime_of(sdk_output);

        let exit_reason = loop {
            if let Ok(Some(status)) = child.try_wait() {
                break ExitReason::Exited(status.code().unwrap_or(-1));
            }
            if self.stop_flag.load(Ordering::SeqCst) {
                break ExitReason::Stopped;
            }

            let now_log_mtime = mtime_of(last_run_log);
            let now_sdk_mtime = mtime_of(sdk_output);
            if now_log_mtime != last_log_mtime || now_sdk_mtime != last_sdk_mtime {
                last_log_mtime = now_log_mtime;
                last_sdk_mtime = now_sdk_mtime;
                last_activity = Instant::now();
            }

            if Instant::now() > deadline {
                break ExitReason::IterationTimeout;
            }
            if last_activity.elapsed() > params.inactivity_timeout {
                break ExitReason::Inactivity;
            }

            tokio::time::sleep(SUPERVISE_POLL).await;
        };

        match exit_reason {
            ExitReason::Exited(code) => {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                let _ = log_watcher.get_new_lines();
                self.record.lock().await.return_code = Some(code);
                if code != 0 {
                    append_viewer_log(
                        &viewer_log_path,
                        &format!("[WARN] agent exited with non-zero status {code}"),
                    );
                }
            }
            ExitReason::Inactivity => {
                append_viewer_log(
                    &viewer_log_path,
                    &format!(
                        "[ERROR] Iteration inactive for {:?}, terminating process group",
                        last_activity.elapsed()
                    ),
                );
                let force = self.force_flag.load(Ordering::SeqCst);
                if force {
                    process::kill_group(pid);
                    let _ = child.wait().await;
                } else {
                    process::escalate(&mut child, pid, process::SIGNAL_GRACE_PERIOD).await;
                }
                stdout_task.abort();
                stderr_task.abort();
            }
            ExitReason::IterationTimeout => {
                append_viewer_log(&viewer_log_path, "[ERROR] iteration timeout, terminating process group");
                process::escalate(&mut child, pid, process::SIGNAL_GRACE_PERIOD).await;
                stdout_task.abort();
                stderr_task.abort();
            }
            ExitReason::Stopped => {
                let force = self.force_flag.load(Ordering::SeqCst);
                if force {
                    process::kill_group(pid);
                } else {
                    process::terminate_group(pid);
                }
                let _ = tokio::time::timeout(process::SIGNAL_GRACE_PERIOD, child.wait()).await;
                stdout_task.abort();
                stderr_task.abort();
            }
        }

        Ok(())
    }

    async fn finish(&self, reason: &str, via_promise: bool, via_state: bool) {
        let mut record = self.record.lock().await;
        record.completion_reason = Some(reason.to_string());
        record.completed_via_promise = via_promise;
        record.completed_via_state = via_state;
        record.running = false;
        record.ended_at = Some(Utc::now());
    }
}

enum ExitReason {
    Exited(i32),
    Inactivity,
    IterationTimeout,
    Stopped,
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

fn append_viewer_log(path: &Path, line: &str) {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(f, "{line}");
    }
}

fn append_progress(path: &Path, line: &str) {
    append_viewer_log(path, line);
}

/// Ensure `<worktree>/.jeeves` resolves to `state_dir`, (re-)creating the symlink if
/// it is missing or broken.
fn ensure_state_symlink(worktree: &Path, state_dir: &Path) -> Result<()> {
    let link = worktree.join(".jeeves");
    if link.symlink_metadata().is_ok() && std::fs::metadata(&link).is_ok() {
        return Ok(());
    }
    let _ = std::fs::remove_file(&link);
    std::fs::create_dir_all(worktree)
        .with_context(|| format!("failed to create worktree directory {}", worktree.display()))?;
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state directory {}", state_dir.display()))?;
    #[cfg(unix)]
    std::os::unix::fs::symlink(state_dir, &link)
        .with_context(|| format!("failed to symlink {} -> {}", link.display(), state_dir.display()))?;
    Ok(())
}

/// Scan the SDK output's message contents and the tail of the text log for the
/// completion marker.
fn promise_found(sdk_output: &Path, last_run_log: &Path) -> bool {
    if let Ok(body) = std::fs::read_to_string(sdk_output)
        && let Ok(doc) = serde_json::from_str::<serde_json::Value>(&body)
        && let Some(messages) = doc.get("messages").and_then(|m| m.as_array())
    {
        for message in messages {
            if let Some(content) = message.get("content") {
                let text = content.to_string();
                if text.contains(COMPLETION_PROMISE) {
                    return true;
                }
            }
        }
    }
    if let Ok(tail) = std::fs::read_to_string(last_run_log)
        && tail.contains(COMPLETION_PROMISE)
    {
        return true;
    }
    false
}

fn shell_quote(arg: &str) -> String {
    if arg.chars().all(|c| c.is_alphanumeric() || "-_./".contains(c)) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

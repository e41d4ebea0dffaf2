//! Ambient configuration (§3.6): directory layout resolution and runtime defaults.
//!
//! Resolution order per field: explicit CLI flag, then a `JEEVES_*` environment
//! variable, then `<data_dir>/jeeves.toml`, then the built-in default.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 600;
const DEFAULT_ITERATION_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_LOG_POLL_MS: u64 = 100;
const DEFAULT_SDK_POLL_MS: u64 = 100;
const DEFAULT_STATE_POLL_MS: u64 = 500;
const DEFAULT_HEARTBEAT_MS: u64 = 15_000;
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:4173";
const DEFAULT_AGENT_CMD: &str = "jeeves-agent";

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub agent_cmd: String,
    pub log_poll_interval: Duration,
    pub sdk_poll_interval: Duration,
    pub state_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub inactivity_timeout: Duration,
    pub iteration_timeout: Duration,
    pub script_timeout: Duration,
    pub bind_addr: String,
    pub verbose: bool,
    /// Whether the observation server accepts run-control and state-mutating requests
    /// from non-loopback clients. Defaults to `false`; see `server::routes`.
    pub allow_remote_run: bool,
}

/// Overrides a caller (typically the CLI) has already resolved from flags; fields left
/// `None` fall through to the environment, then the on-disk file, then the default.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub agent_cmd: Option<String>,
    pub bind_addr: Option<String>,
    pub verbose: Option<bool>,
    pub allow_remote_run: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    agent_cmd: Option<String>,
    bind_addr: Option<String>,
    verbose: Option<bool>,
    allow_remote_run: Option<bool>,
    inactivity_timeout_secs: Option<u64>,
    iteration_timeout_secs: Option<u64>,
    script_timeout_secs: Option<u64>,
}

impl Config {
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self> {
        let data_dir = match overrides.data_dir {
            Some(dir) => dir,
            None => match std::env::var("JEEVES_DATA_DIR") {
                Ok(v) => PathBuf::from(v),
                Err(_) => default_data_dir()?,
            },
        };

        let file_config = read_file_config(&data_dir)?;

        let agent_cmd = overrides
            .agent_cmd
            .or_else(|| std::env::var("JEEVES_AGENT_CMD").ok())
            .or(file_config.agent_cmd)
            .unwrap_or_else(|| DEFAULT_AGENT_CMD.to_string());

        let bind_addr = overrides
            .bind_addr
            .or_else(|| std::env::var("JEEVES_BIND_ADDR").ok())
            .or(file_config.bind_addr)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let verbose = overrides
            .verbose
            .or_else(|| std::env::var("JEEVES_VERBOSE").ok().map(|v| v != "0" && v != "false"))
            .or(file_config.verbose)
            .unwrap_or(false);

        let allow_remote_run = overrides
            .allow_remote_run
            .or_else(|| {
                std::env::var("JEEVES_ALLOW_REMOTE_RUN")
                    .ok()
                    .map(|v| v != "0" && v != "false")
            })
            .or(file_config.allow_remote_run)
            .unwrap_or(false);

        let inactivity_timeout = Duration::from_secs(
            env_u64("JEEVES_INACTIVITY_TIMEOUT_SECS")
                .or(file_config.inactivity_timeout_secs)
                .unwrap_or(DEFAULT_INACTIVITY_TIMEOUT_SECS),
        );
        let iteration_timeout = Duration::from_secs(
            env_u64("JEEVES_ITERATION_TIMEOUT_SECS")
                .or(file_config.iteration_timeout_secs)
                .unwrap_or(DEFAULT_ITERATION_TIMEOUT_SECS),
        );
        let script_timeout = Duration::from_secs(
            env_u64("JEEVES_SCRIPT_TIMEOUT_SECS")
                .or(file_config.script_timeout_secs)
                .unwrap_or(DEFAULT_SCRIPT_TIMEOUT_SECS),
        );

        Ok(Self {
            data_dir,
            agent_cmd,
            log_poll_interval: Duration::from_millis(DEFAULT_LOG_POLL_MS),
            sdk_poll_interval: Duration::from_millis(DEFAULT_SDK_POLL_MS),
            state_poll_interval: Duration::from_millis(DEFAULT_STATE_POLL_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            inactivity_timeout,
            iteration_timeout,
            script_timeout,
            bind_addr,
            verbose,
            allow_remote_run,
        })
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.data_dir.join("worktrees")
    }

    pub fn issues_dir(&self) -> PathBuf {
        self.data_dir.join("issues")
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.data_dir.join("workflows")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.data_dir.join("prompts")
    }

    pub fn active_issue_file(&self) -> PathBuf {
        self.data_dir.join("active-issue.json")
    }

    pub fn recent_file(&self) -> PathBuf {
        self.data_dir.join("recent.json")
    }

    pub fn worktree_path(&self, owner: &str, repo: &str, number: u64) -> PathBuf {
        self.worktrees_dir()
            .join(owner)
            .join(repo)
            .join(format!("issue-{number}"))
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.repos_dir(),
            self.worktrees_dir(),
            self.issues_dir(),
            self.workflows_dir(),
            self.prompts_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        crate::workflow_loader::ensure_default_workflow(&self.workflows_dir())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn read_file_config(data_dir: &Path) -> Result<FileConfig> {
    let path = data_dir.join("jeeves.toml");
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let body = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&body).with_context(|| format!("failed to parse {}", path.display()))
}

fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::data_dir().context("could not determine a platform data directory")?;
    Ok(home.join("jeeves"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn explicit_override_wins_over_everything() {
        let dir = tempdir().unwrap();
        let config = Config::resolve(ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            agent_cmd: Some("custom-agent".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.agent_cmd, "custom-agent");
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn file_config_fills_in_when_no_override_or_env() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("jeeves.toml"),
            "agent_cmd = \"from-file-agent\"\nbind_addr = \"0.0.0.0:9000\"\n",
        )
        .unwrap();
        let config = Config::resolve(ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.agent_cmd, "from-file-agent");
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
    }

    #[test]
    fn falls_back_to_built_in_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::resolve(ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.agent_cmd, DEFAULT_AGENT_CMD);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.iteration_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn ensure_directories_creates_the_full_layout() {
        let dir = tempdir().unwrap();
        let config = Config::resolve(ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        config.ensure_directories().unwrap();
        assert!(config.repos_dir().exists());
        assert!(config.worktrees_dir().exists());
        assert!(config.issues_dir().exists());
        assert!(config.workflows_dir().exists());
        assert!(config.prompts_dir().exists());
        assert!(config.workflows_dir().join("default.yaml").exists());
    }

    #[test]
    fn allow_remote_run_defaults_to_false_and_honors_override() {
        let dir = tempdir().unwrap();
        let config = Config::resolve(ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        assert!(!config.allow_remote_run);

        let config = Config::resolve(ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            allow_remote_run: Some(true),
            ..Default::default()
        })
        .unwrap();
        assert!(config.allow_remote_run);
    }

    #[test]
    fn worktree_path_matches_documented_layout() {
        let dir = tempdir().unwrap();
        let config = Config::resolve(ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        let path = config.worktree_path("acme", "widgets", 42);
        assert_eq!(
            path,
            dir.path().join("worktrees/acme/widgets/issue-42")
        );
    }
}

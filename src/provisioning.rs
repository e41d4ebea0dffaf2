//! Provisioning stub (§4.10): a minimal, explicitly non-authoritative collaborator
//! that lays out the directory skeleton a worktree needs to start an iteration. It does
//! not invoke git or the GitHub CLI — callers that need a real repository checkout wire
//! in their own provisioner ahead of the orchestrator. This exists so the CLI binary and
//! integration tests have something to drive end-to-end without a network dependency.

use crate::config::Config;
use crate::issue_state::{self, IssueRef, IssueState};
use crate::workflow_loader;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;

/// Result of provisioning a local issue: the paths a caller will want to print or feed
/// back into the supervisor via `set_issue`.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub worktree: PathBuf,
    pub state_dir: PathBuf,
    pub branch: String,
}

/// Create `repos/`, the worktree directory, the issue state directory, the `.jeeves`
/// symlink, and an initial `issue.json` (phase set to the named workflow's start phase)
/// if one does not already exist. Idempotent: calling it again for the same issue
/// leaves an existing `issue.json` untouched.
pub fn provision(
    config: &Config,
    owner: &str,
    repo: &str,
    number: u64,
    workflow: &str,
) -> Result<Provisioned> {
    config.ensure_directories()?;

    let repo_dir = config.repos_dir().join(owner).join(repo);
    std::fs::create_dir_all(&repo_dir)
        .with_context(|| format!("failed to create repo directory {}", repo_dir.display()))?;

    let worktree = config.worktree_path(owner, repo, number);
    std::fs::create_dir_all(&worktree)
        .with_context(|| format!("failed to create worktree directory {}", worktree.display()))?;

    let state_dir = config.issues_dir().join(owner).join(repo).join(number.to_string());
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create issue state directory {}", state_dir.display()))?;

    let branch = format!("issue/{number}");

    let issues_dir = config.issues_dir();
    if issue_state::load(&issues_dir, owner, repo, number).is_err() {
        let start_phase = workflow_loader::load_workflow_by_name(workflow, &config.workflows_dir())
            .with_context(|| format!("failed to resolve start phase for workflow '{workflow}'"))?
            .start;
        let initial = IssueState {
            owner: owner.to_string(),
            repo: repo.to_string(),
            issue: IssueRef {
                number,
                title: None,
                url: None,
            },
            branch: branch.clone(),
            workflow: workflow.to_string(),
            phase: start_phase,
            status: HashMap::new(),
            design_doc: None,
            pull_request: None,
            tasks: None,
            notes: String::new(),
        };
        issue_state::save(&issues_dir, &initial).context("failed to write initial issue state")?;
    }

    link_state_dir(&worktree, &state_dir)?;

    Ok(Provisioned {
        worktree,
        state_dir,
        branch,
    })
}

fn link_state_dir(worktree: &std::path::Path, state_dir: &std::path::Path) -> Result<()> {
    let link = worktree.join(".jeeves");
    if link.symlink_metadata().is_ok() {
        return Ok(());
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(state_dir, &link).with_context(|| {
        format!(
            "failed to symlink {} -> {}",
            link.display(),
            state_dir.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> Config {
        Config::resolve(ConfigOverrides {
            data_dir: Some(dir.to_path_buf()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn provision_creates_full_skeleton_and_initial_state() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let result = provision(&config, "acme", "widgets", 7, "default").unwrap();

        assert!(result.worktree.exists());
        assert!(result.state_dir.exists());
        assert_eq!(result.branch, "issue/7");

        let state = issue_state::load(&config.issues_dir(), "acme", "widgets", 7).unwrap();
        assert_eq!(state.workflow, "default");
        assert_eq!(state.phase, "design");

        let link = result.worktree.join(".jeeves");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
    }

    #[test]
    fn provision_is_idempotent_and_preserves_existing_state() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        provision(&config, "acme", "widgets", 7, "default").unwrap();

        let mut state = issue_state::load(&config.issues_dir(), "acme", "widgets", 7).unwrap();
        state.phase = "design".to_string();
        issue_state::save(&config.issues_dir(), &state).unwrap();

        provision(&config, "acme", "widgets", 7, "default").unwrap();

        let reloaded = issue_state::load(&config.issues_dir(), "acme", "widgets", 7).unwrap();
        assert_eq!(reloaded.phase, "design");
    }

    #[test]
    fn provision_creates_repo_directory() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        provision(&config, "acme", "widgets", 1, "default").unwrap();
        assert!(config.repos_dir().join("acme").join("widgets").exists());
    }
}

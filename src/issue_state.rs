//! Issue state store (§3.2/§4.9): the durable JSON hand-off between iterations.
//!
//! The agent subprocess and the orchestrator cooperate by strict ordering (agent
//! writes, then exits; orchestrator reads on the next loop tick), so this module only
//! needs atomic writes, not cross-process locking.

use crate::errors::{NotFoundError, ValidationError};
use crate::tasks::TaskList;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullRequestRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueState {
    pub owner: String,
    pub repo: String,
    pub issue: IssueRef,
    pub branch: String,
    #[serde(default = "default_workflow_name")]
    pub workflow: String,
    pub phase: String,
    #[serde(default)]
    pub status: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "designDoc")]
    pub design_doc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "pullRequest")]
    pub pull_request: Option<PullRequestRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TaskList>,
    #[serde(default)]
    pub notes: String,
}

fn default_workflow_name() -> String {
    "default".to_string()
}

impl IssueState {
    pub fn issue_ref(&self) -> String {
        format!("{}/{}#{}", self.owner, self.repo, self.issue.number)
    }
}

/// Shallow listing entry returned by `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueDescriptor {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub phase: String,
    pub workflow: String,
}

fn state_path(issues_dir: &Path, owner: &str, repo: &str, number: u64) -> PathBuf {
    issues_dir
        .join(owner)
        .join(repo)
        .join(number.to_string())
        .join("issue.json")
}

/// Read `issue.json` for `(owner, repo, number)`. Not-found and malformed are distinct
/// error kinds.
pub fn load(issues_dir: &Path, owner: &str, repo: &str, number: u64) -> Result<IssueState> {
    let path = state_path(issues_dir, owner, repo, number);
    if !path.exists() {
        return Err(NotFoundError::IssueState {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        }
        .into());
    }
    let body = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).map_err(|e| {
        ValidationError::MalformedState {
            path: path.clone(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Atomic write (temp file + rename) into the issue's state directory.
pub fn save(issues_dir: &Path, state: &IssueState) -> Result<()> {
    let path = state_path(issues_dir, &state.owner, &state.repo, state.issue.number);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directories for {}", path.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(state).context("failed to serialize issue state")?;
    std::fs::write(&tmp_path, body)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, &path).with_context(|| {
        let _ = std::fs::remove_file(&tmp_path);
        format!("failed to rename {} to {}", tmp_path.display(), path.display())
    })
}

/// Walk the issues directory tree, returning sorted shallow descriptors. Unreadable or
/// malformed entries are silently skipped, optionally filtered by owner and/or repo.
pub fn list(
    issues_dir: &Path,
    owner: Option<&str>,
    repo: Option<&str>,
) -> Result<Vec<IssueDescriptor>> {
    let mut out = Vec::new();
    if !issues_dir.exists() {
        return Ok(out);
    }

    for owner_entry in std::fs::read_dir(issues_dir)
        .with_context(|| format!("failed to read {}", issues_dir.display()))?
        .flatten()
    {
        let owner_name = owner_entry.file_name().to_string_lossy().into_owned();
        if owner.is_some_and(|o| o != owner_name) {
            continue;
        }
        let Ok(repo_entries) = std::fs::read_dir(owner_entry.path()) else {
            continue;
        };
        for repo_entry in repo_entries.flatten() {
            let repo_name = repo_entry.file_name().to_string_lossy().into_owned();
            if repo.is_some_and(|r| r != repo_name) {
                continue;
            }
            let Ok(number_entries) = std::fs::read_dir(repo_entry.path()) else {
                continue;
            };
            for number_entry in number_entries.flatten() {
                let issue_path = number_entry.path().join("issue.json");
                let Ok(body) = std::fs::read_to_string(&issue_path) else {
                    continue;
                };
                let Ok(state) = serde_json::from_str::<IssueState>(&body) else {
                    continue;
                };
                out.push(IssueDescriptor {
                    owner: owner_name.clone(),
                    repo: repo_name.clone(),
                    number: state.issue.number,
                    phase: state.phase,
                    workflow: state.workflow,
                });
            }
        }
    }

    out.sort_by(|a, b| {
        (a.owner.as_str(), a.repo.as_str(), a.number).cmp(&(b.owner.as_str(), b.repo.as_str(), b.number))
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(number: u64) -> IssueState {
        IssueState {
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            issue: IssueRef {
                number,
                title: Some("Title".to_string()),
                url: None,
            },
            branch: format!("issue/{number}"),
            workflow: "default".to_string(),
            phase: "design".to_string(),
            status: HashMap::new(),
            design_doc: None,
            pull_request: None,
            tasks: None,
            notes: String::new(),
        }
    }

    #[test]
    fn load_missing_state_is_not_found() {
        let dir = tempdir().unwrap();
        let err = load(dir.path(), "acme", "widgets", 1).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let state = sample(42);
        save(dir.path(), &state).unwrap();
        let loaded = load(dir.path(), "acme", "widgets", 42).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        save(dir.path(), &sample(1)).unwrap();
        let state_dir = dir.path().join("acme").join("widgets").join("1");
        let names: Vec<_> = std::fs::read_dir(&state_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["issue.json"]);
    }

    #[test]
    fn load_malformed_json_is_reported_distinctly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acme").join("widgets").join("1");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("issue.json"), "not json").unwrap();
        let err = load(dir.path(), "acme", "widgets", 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::MalformedState { .. })
        ));
    }

    #[test]
    fn list_returns_sorted_descriptors_and_skips_unreadable_entries() {
        let dir = tempdir().unwrap();
        save(dir.path(), &sample(2)).unwrap();
        save(dir.path(), &sample(1)).unwrap();
        let garbage = dir.path().join("acme").join("widgets").join("garbage");
        std::fs::create_dir_all(&garbage).unwrap();

        let descriptors = list(dir.path(), None, None).unwrap();
        let numbers: Vec<u64> = descriptors.iter().map(|d| d.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn list_filters_by_owner_and_repo() {
        let dir = tempdir().unwrap();
        save(dir.path(), &sample(1)).unwrap();
        let mut other = sample(5);
        other.owner = "other".to_string();
        save(dir.path(), &other).unwrap();

        let descriptors = list(dir.path(), Some("acme"), None).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].owner, "acme");
    }

    #[test]
    fn list_on_missing_directory_returns_empty() {
        let dir = tempdir().unwrap();
        let descriptors = list(&dir.path().join("nope"), None, None).unwrap();
        assert!(descriptors.is_empty());
    }
}

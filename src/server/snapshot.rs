//! Derived state snapshot (§4.8): a cheap, human/UI-friendly summary of the active
//! issue recomputed on every `state` event and on `GET /api/state`.

use crate::config::Config;
use crate::orchestrator::RunRecord;
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::OnceLock;

fn iteration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Iteration\s+(\d+)\s+of\s+(\d+)").unwrap())
}

fn started_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Started:\s*(.+)").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueMode {
    Prd,
    Issue,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub mode: IssueMode,
    pub status: serde_json::Map<String, serde_json::Value>,
    pub progress_lines: Vec<String>,
    pub iteration: Option<u32>,
    pub max_iterations: Option<u32>,
    pub started_at: Option<String>,
    pub run: RunRecord,
}

const MAX_PROGRESS_LINES: usize = 100;

/// Recompute the snapshot for `(owner, repo, number)`'s progress file and issue state,
/// combined with the current run record. Missing files degrade gracefully: an absent
/// `issue.json` yields `mode: unknown` and an empty status map rather than an error.
pub fn compute(
    config: &Config,
    owner: &str,
    repo: &str,
    number: u64,
    run: RunRecord,
) -> StateSnapshot {
    let state_dir = config
        .issues_dir()
        .join(owner)
        .join(repo)
        .join(number.to_string());

    let status = crate::issue_state::load(&config.issues_dir(), owner, repo, number)
        .ok()
        .map(|s| {
            serde_json::to_value(&s.status)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default()
        })
        .unwrap_or_default();

    let mode = if status.is_empty() {
        IssueMode::Unknown
    } else {
        IssueMode::Issue
    };

    let progress_path = state_dir.join("progress.txt");
    let progress_lines = tail_lines(&progress_path, MAX_PROGRESS_LINES);

    let mut iteration = None;
    let mut max_iterations = None;
    let mut started_at = None;
    for line in progress_lines.iter().rev() {
        if iteration.is_none()
            && let Some(caps) = iteration_re().captures(line)
        {
            iteration = caps.get(1).and_then(|m| m.as_str().parse().ok());
            max_iterations = caps.get(2).and_then(|m| m.as_str().parse().ok());
        }
        if started_at.is_none()
            && let Some(caps) = started_re().captures(line)
        {
            started_at = caps.get(1).map(|m| m.as_str().trim().to_string());
        }
        if iteration.is_some() && started_at.is_some() {
            break;
        }
    }

    StateSnapshot {
        mode,
        status,
        progress_lines,
        iteration,
        max_iterations,
        started_at,
        run,
    }
}

/// The snapshot shape for when no issue is currently selected.
pub fn compute_unselected(run: RunRecord) -> StateSnapshot {
    StateSnapshot {
        mode: IssueMode::Unknown,
        status: serde_json::Map::new(),
        progress_lines: Vec::new(),
        iteration: None,
        max_iterations: None,
        started_at: None,
        run,
    }
}

fn tail_lines(path: &Path, max_lines: usize) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(max_lines);
    all[start..].iter().map(|s| s.to_string()).collect()
}

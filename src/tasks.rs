//! Task decomposition model (§3.3): an optional ordered checklist an issue's execute
//! phases can work through one at a time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub summary: String,
    #[serde(default, rename = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, rename = "filesAllowed")]
    pub files_allowed: Vec<String>,
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Vec<String>,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "pending".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default, rename = "decomposedFrom")]
    pub decomposed_from: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// Save as pretty-printed JSON, creating parent directories if needed.
pub fn save_tasks(task_list: &TaskList, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directories for {}", path.display()))?;
    }
    let body = serde_json::to_string_pretty(task_list).context("failed to serialize task list")?;
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}

pub fn load_tasks(path: &Path) -> Result<TaskList> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("failed to parse {}", path.display()))
}

/// First in_progress task, else the first pending one.
pub fn get_current_task(task_list: &TaskList) -> Option<&Task> {
    task_list
        .tasks
        .iter()
        .find(|t| t.status == "in_progress")
        .or_else(|| task_list.tasks.iter().find(|t| t.status == "pending"))
}

pub fn get_task_by_id<'a>(task_list: &'a TaskList, id: &str) -> Option<&'a Task> {
    task_list.tasks.iter().find(|t| t.id == id)
}

pub fn get_task_by_id_mut<'a>(task_list: &'a mut TaskList, id: &str) -> Option<&'a mut Task> {
    task_list.tasks.iter_mut().find(|t| t.id == id)
}

/// Mark `id` passed or failed, returning whether a pending task remains afterward.
pub fn advance_task(task_list: &mut TaskList, id: &str, passed: bool) -> bool {
    match get_task_by_id_mut(task_list, id) {
        Some(task) => task.status = if passed { "passed" } else { "failed" }.to_string(),
        None => return false,
    }
    task_list.tasks.iter().any(|t| t.status == "pending" || t.status == "in_progress")
}

pub fn all_tasks_complete(task_list: &TaskList) -> bool {
    task_list.tasks.iter().all(|t| t.status == "passed")
}

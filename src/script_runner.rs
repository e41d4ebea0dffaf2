//! Script phase runner (§4.4): executes a templated shell command with status mapping.

use crate::process;
use crate::value::{Context, substitute};
use crate::workflow::Phase;
use anyhow::{Context as _, Result};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ScriptResult {
    pub exit_code: i32,
    pub output: String,
    pub status_updates: HashMap<String, Json>,
}

/// Run `phase.command` (substituting `${...}` references into it from `context`) under
/// `work_dir`, exporting the flattened context as environment variables. Absent a
/// configured command, returns exit 1 with an explanatory message and no updates.
pub async fn run(phase: &Phase, work_dir: &Path, context: &Context) -> Result<ScriptResult> {
    run_with_timeout(phase, work_dir, context, DEFAULT_SCRIPT_TIMEOUT).await
}

pub async fn run_with_timeout(
    phase: &Phase,
    work_dir: &Path,
    context: &Context,
    timeout: Duration,
) -> Result<ScriptResult> {
    let Some(command_template) = phase.command.as_deref() else {
        return Ok(ScriptResult {
            exit_code: 1,
            output: "No command specified".to_string(),
            status_updates: HashMap::new(),
        });
    };

    let command = substitute(command_template, context);
    let env = context.flatten_env();

    let outcome = process::run_shell_with_timeout(&command, work_dir, &env, timeout)
        .await
        .context("failed to execute script phase")?;

    let status_updates = mapping_for(phase, outcome.exit_code);

    if let Some(output_file) = &phase.output_file {
        let path = work_dir.join(output_file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directories for {}", path.display()))?;
        }
        std::fs::write(&path, &outcome.output)
            .with_context(|| format!("failed to write script output to {}", path.display()))?;
    }

    Ok(ScriptResult {
        exit_code: outcome.exit_code,
        output: outcome.output,
        status_updates,
    })
}

fn mapping_for(phase: &Phase, exit_code: i32) -> HashMap<String, Json> {
    let keyword = if exit_code == 0 { "success" } else { "failure" };
    phase
        .status_mapping
        .get(keyword)
        .cloned()
        .unwrap_or_default()
}

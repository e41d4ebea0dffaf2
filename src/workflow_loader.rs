//! Strict YAML loader for workflow documents (§3.1/§4.2).
//!
//! Unknown keys on phases, transitions, or the `workflow` block are rejected via
//! `#[serde(deny_unknown_fields)]`. All structural problems are collected and reported
//! together rather than failing on the first one.

use crate::errors::{NotFoundError, ValidationError};
use crate::workflow::{Phase, PhaseType, Transition, VALID_MODELS, Workflow};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWorkflowMeta {
    name: String,
    version: u32,
    start: String,
    #[serde(default)]
    default_model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTransition {
    to: String,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    auto: bool,
    #[serde(default)]
    priority: i32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPhase {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    output_file: Option<String>,
    #[serde(default)]
    status_mapping: HashMap<String, HashMap<String, serde_json::Value>>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    allowed_writes: Option<Vec<String>>,
    #[serde(default)]
    transitions: Vec<RawTransition>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    workflow: RawWorkflowMeta,
    #[serde(default)]
    phases: HashMap<String, RawPhase>,
}

fn parse_phase_type(raw: &str) -> Option<PhaseType> {
    match raw {
        "execute" => Some(PhaseType::Execute),
        "evaluate" => Some(PhaseType::Evaluate),
        "script" => Some(PhaseType::Script),
        "terminal" => Some(PhaseType::Terminal),
        _ => None,
    }
}

fn validate_model(model: Option<&str>, context: &str) -> Result<(), String> {
    match model {
        None => Ok(()),
        Some(m) if VALID_MODELS.contains(&m) => Ok(()),
        Some(m) => Err(format!("Invalid model '{m}' in {context}")),
    }
}

/// Parse and validate a workflow document from `path`. All validation errors are
/// collected and returned together as a single `ValidationError::Workflow`.
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file at {}", path.display()))?;
    parse_workflow(&text).with_context(|| format!("loading workflow from {}", path.display()))
}

/// Parse and validate a workflow document already held in memory.
pub fn parse_workflow(text: &str) -> Result<Workflow> {
    let raw: RawFile =
        serde_yaml::from_str(text).context("failed to parse workflow YAML document")?;

    let mut errors = Vec::new();
    let mut phases = HashMap::new();

    for (name, raw_phase) in raw.phases.iter() {
        let Some(kind) = parse_phase_type(&raw_phase.kind) else {
            errors.push(format!(
                "Invalid phase type '{}' for phase '{name}'",
                raw_phase.kind
            ));
            continue;
        };

        if matches!(kind, PhaseType::Execute | PhaseType::Evaluate) && raw_phase.prompt.is_none() {
            errors.push(format!(
                "Phase '{name}' ({}) requires a prompt",
                kind.as_str()
            ));
        }
        if kind == PhaseType::Script && raw_phase.command.is_none() {
            errors.push(format!("Phase '{name}' (script) requires a command"));
        }
        if let Err(e) = validate_model(raw_phase.model.as_deref(), &format!("phase '{name}'")) {
            errors.push(e);
        }

        for t in &raw_phase.transitions {
            if !raw.phases.contains_key(&t.to) {
                errors.push(format!(
                    "Phase '{name}' has a transition to unknown phase '{}'",
                    t.to
                ));
            }
        }

        phases.insert(
            name.clone(),
            Phase {
                name: name.clone(),
                kind,
                prompt: raw_phase.prompt.clone(),
                command: raw_phase.command.clone(),
                output_file: raw_phase.output_file.clone(),
                status_mapping: raw_phase.status_mapping.clone(),
                model: raw_phase.model.clone(),
                allowed_writes: raw_phase
                    .allowed_writes
                    .clone()
                    .unwrap_or_else(|| vec![".jeeves/*".to_string()]),
                transitions: raw_phase
                    .transitions
                    .iter()
                    .map(|t| Transition {
                        to: t.to.clone(),
                        when: t.when.clone(),
                        auto: t.auto,
                        priority: t.priority,
                    })
                    .collect(),
            },
        );
    }

    if !raw.phases.contains_key(&raw.workflow.start) {
        errors.push(format!("Start phase '{}' does not exist", raw.workflow.start));
    }
    if let Err(e) = validate_model(raw.workflow.default_model.as_deref(), "workflow default_model")
    {
        errors.push(e);
    }
    if !phases.values().any(Phase::is_terminal) {
        errors.push("Workflow has no terminal phase".to_string());
    }

    if !errors.is_empty() {
        return Err(ValidationError::Workflow(errors).into());
    }

    Ok(Workflow {
        name: raw.workflow.name,
        version: raw.workflow.version,
        start: raw.workflow.start,
        default_model: raw.workflow.default_model,
        phases,
    })
}

/// Load a named workflow from a catalog directory (`<dir>/<name>.yaml`).
pub fn load_workflow_by_name(name: &str, workflows_dir: &Path) -> Result<Workflow> {
    let path = workflows_dir.join(format!("{name}.yaml"));
    if !path.exists() {
        return Err(NotFoundError::Workflow(format!("workflow '{name}' not found at {}", path.display())).into());
    }
    load_workflow(&path)
}

/// The design → implement → review → complete workflow shipped with the crate, so a
/// fresh data directory is runnable without hand-authoring YAML first.
pub const DEFAULT_WORKFLOW_YAML: &str = include_str!("../assets/workflows/default.yaml");

/// Write the packaged default workflow into `workflows_dir` if nothing is there yet.
/// Never overwrites a `default.yaml` a caller has customised.
pub fn ensure_default_workflow(workflows_dir: &Path) -> Result<()> {
    let path = workflows_dir.join("default.yaml");
    if path.exists() {
        return Ok(());
    }
    std::fs::write(&path, DEFAULT_WORKFLOW_YAML)
        .with_context(|| format!("failed to write default workflow to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn load_minimal_workflow() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "test.yaml",
            r#"
workflow:
  name: test
  version: 1
  start: design

phases:
  design:
    prompt: design.md
    type: execute
    transitions:
      - to: complete
        auto: true
  complete:
    type: terminal
"#,
        );
        let wf = load_workflow(&path).unwrap();
        assert_eq!(wf.name, "test");
        assert_eq!(wf.start, "design");
        assert_eq!(wf.phases.len(), 2);
        assert_eq!(wf.phases["design"].kind, PhaseType::Execute);
        assert_eq!(wf.phases["complete"].kind, PhaseType::Terminal);
    }

    #[test]
    fn load_workflow_with_guards() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "test.yaml",
            r#"
workflow:
  name: test
  version: 1
  start: review

phases:
  review:
    prompt: review.md
    type: evaluate
    transitions:
      - to: fix
        when: "status.needsChanges == true"
      - to: complete
        when: "status.approved == true"
  fix:
    prompt: fix.md
    type: execute
    transitions:
      - to: review
        auto: true
  complete:
    type: terminal
"#,
        );
        let wf = load_workflow(&path).unwrap();
        assert_eq!(wf.phases["review"].transitions.len(), 2);
        assert_eq!(
            wf.phases["review"].transitions[0].when.as_deref(),
            Some("status.needsChanges == true")
        );
    }

    #[test]
    fn load_script_phase() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "test.yaml",
            r#"
workflow:
  name: test
  version: 1
  start: ci_check

phases:
  ci_check:
    type: script
    command: "gh run list --json conclusion"
    output_file: ".jeeves/ci-status.txt"
    status_mapping:
      success:
        ciPassed: true
      failure:
        ciFailed: true
    transitions:
      - to: complete
        when: "status.ciPassed == true"
  complete:
    type: terminal
"#,
        );
        let wf = load_workflow(&path).unwrap();
        let ci = &wf.phases["ci_check"];
        assert_eq!(ci.kind, PhaseType::Script);
        assert_eq!(ci.command.as_deref(), Some("gh run list --json conclusion"));
        assert_eq!(
            ci.status_mapping["success"]["ciPassed"],
            serde_json::json!(true)
        );
    }

    #[test]
    fn invalid_transition_target_raises() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "test.yaml",
            r#"
workflow:
  name: test
  version: 1
  start: design

phases:
  design:
    prompt: design.md
    type: execute
    transitions:
      - to: nonexistent
        auto: true
"#,
        );
        let err = load_workflow(&path).unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn invalid_start_phase_raises() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "test.yaml",
            r#"
workflow:
  name: test
  version: 1
  start: nonexistent

phases:
  design:
    prompt: design.md
    type: execute
"#,
        );
        let err = load_workflow(&path).unwrap_err();
        assert!(err.to_string().contains("Start phase"));
    }

    #[test]
    fn execute_phase_requires_prompt() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "test.yaml",
            r#"
workflow:
  name: test
  version: 1
  start: design

phases:
  design:
    type: execute
    transitions:
      - to: complete
        auto: true
  complete:
    type: terminal
"#,
        );
        let err = load_workflow(&path).unwrap_err();
        assert!(err.to_string().contains("requires a prompt"));
    }

    #[test]
    fn script_phase_requires_command() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "test.yaml",
            r#"
workflow:
  name: test
  version: 1
  start: ci

phases:
  ci:
    type: script
    transitions:
      - to: complete
        auto: true
  complete:
    type: terminal
"#,
        );
        let err = load_workflow(&path).unwrap_err();
        assert!(err.to_string().contains("requires a command"));
    }

    #[test]
    fn invalid_phase_type_raises() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "test.yaml",
            r#"
workflow:
  name: test
  version: 1
  start: design

phases:
  design:
    type: invalid_type
    prompt: design.md
"#,
        );
        let err = load_workflow(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid phase type"));
    }

    #[test]
    fn invalid_phase_model_raises() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "test.yaml",
            r#"
workflow:
  name: test
  version: 1
  start: design

phases:
  design:
    prompt: design.md
    type: execute
    model: invalid_model
    transitions:
      - to: complete
        auto: true
  complete:
    type: terminal
"#,
        );
        let err = load_workflow(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid model"));
    }

    #[test]
    fn load_workflow_by_name_not_found() {
        let dir = tempdir().unwrap();
        let err = load_workflow_by_name("nonexistent", dir.path()).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn validate_model_accepts_known_models_and_none() {
        for model in VALID_MODELS {
            assert!(validate_model(Some(model), "ctx").is_ok());
        }
        assert!(validate_model(None, "ctx").is_ok());
        assert!(validate_model(Some("invalid"), "ctx").is_err());
    }

    #[test]
    fn packaged_default_workflow_parses_and_validates() {
        let wf = parse_workflow(DEFAULT_WORKFLOW_YAML).unwrap();
        assert_eq!(wf.name, "default");
        assert_eq!(wf.start, "design");
        assert!(wf.is_terminal("complete"));
        assert!(!wf.is_terminal("design"));
    }

    #[test]
    fn ensure_default_workflow_writes_once_and_never_overwrites() {
        let dir = tempdir().unwrap();
        ensure_default_workflow(dir.path()).unwrap();
        let path = dir.path().join("default.yaml");
        assert!(path.exists());

        std::fs::write(&path, "custom: true").unwrap();
        ensure_default_workflow(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "custom: true");
    }
}

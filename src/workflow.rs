//! The workflow data model: an immutable graph loaded once from a declarative YAML
//! document. Construction happens in `workflow_loader`; this module only owns the
//! in-memory shape and read-only lookups over it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The model tags the orchestrator recognises (opaque beyond validation).
pub const VALID_MODELS: &[&str] = &["sonnet", "opus", "haiku"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseType {
    Execute,
    Evaluate,
    Script,
    Terminal,
}

impl PhaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseType::Execute => "execute",
            PhaseType::Evaluate => "evaluate",
            PhaseType::Script => "script",
            PhaseType::Terminal => "terminal",
        }
    }
}

/// A directed edge out of a phase with an optional boolean guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub to: String,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub priority: i32,
}

impl Transition {
    /// A transition with no guard is only "automatically satisfied" when `auto` is
    /// explicitly set; an absent guard and absent `auto` is not unconditionally true
    /// (it is treated as a guard of the empty string, which does evaluate to true —
    /// the two are equivalent in effect but `auto` documents author intent).
    pub fn is_unconditional(&self) -> bool {
        self.auto || self.when.as_deref().is_none_or(str::is_empty)
    }
}

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PhaseType,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub status_mapping: HashMap<String, HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_allowed_writes")]
    pub allowed_writes: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

fn default_allowed_writes() -> Vec<String> {
    vec![".jeeves/*".to_string()]
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        self.kind == PhaseType::Terminal
    }
}

/// An immutable phase graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub version: u32,
    pub start: String,
    #[serde(default)]
    pub default_model: Option<String>,
    pub phases: HashMap<String, Phase>,
}

impl Workflow {
    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.get(name)
    }

    pub fn start_phase(&self) -> Option<&Phase> {
        self.phase(&self.start)
    }

    pub fn prompt_for(&self, name: &str) -> Option<&str> {
        self.phase(name).and_then(|p| p.prompt.as_deref())
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.phase(name).is_some_and(Phase::is_terminal)
    }

    /// Phase model override, else workflow default, else `None`. Returns `None` if the
    /// named phase does not exist and there is no workflow default either.
    pub fn get_effective_model(&self, name: &str) -> Option<&str> {
        match self.phase(name).and_then(|p| p.model.as_deref()) {
            Some(model) => Some(model),
            None => self.default_model.as_deref(),
        }
    }
}

//! Pure workflow engine (§4.5): resolves the current phase and picks the first
//! satisfied transition. Never touches disk.

use crate::guards;
use crate::value::Context;
use crate::workflow::{Phase, Workflow};

pub struct WorkflowEngine<'a> {
    workflow: &'a Workflow,
}

impl<'a> WorkflowEngine<'a> {
    pub fn new(workflow: &'a Workflow) -> Self {
        Self { workflow }
    }

    pub fn get_phase(&self, name: &str) -> Option<&Phase> {
        self.workflow.phase(name)
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.workflow.is_terminal(name)
    }

    /// Iterate `current_phase`'s transitions in declared order and return the target
    /// of the first one whose guard is satisfied, or `None` if none are (stay put).
    /// A guard syntax error is treated as unsatisfied, never propagated.
    pub fn evaluate_transitions(&self, current_phase: &str, context: &Context) -> Option<String> {
        let phase = self.workflow.phase(current_phase)?;
        for transition in &phase.transitions {
            if transition.auto {
                return Some(transition.to.clone());
            }
            let guard = transition.when.as_deref().unwrap_or("");
            match guards::evaluate(guard, context) {
                Ok(true) => return Some(transition.to.clone()),
                Ok(false) => continue,
                Err(_) => continue,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{PhaseType, Transition};
    use serde_json::json;
    use std::collections::HashMap;

    fn workflow() -> Workflow {
        let mut phases = HashMap::new();
        phases.insert(
            "review".to_string(),
            Phase {
                name: "review".to_string(),
                kind: PhaseType::Evaluate,
                prompt: Some("review.md".into()),
                command: None,
                output_file: None,
                status_mapping: HashMap::new(),
                model: None,
                allowed_writes: vec![".jeeves/*".into()],
                transitions: vec![
                    Transition {
                        to: "fix".into(),
                        when: Some("status.needsChanges == true".into()),
                        auto: false,
                        priority: 0,
                    },
                    Transition {
                        to: "done".into(),
                        when: Some("status.approved == true".into()),
                        auto: false,
                        priority: 1,
                    },
                ],
            },
        );
        phases.insert(
            "fix".to_string(),
            Phase {
                name: "fix".to_string(),
                kind: PhaseType::Execute,
                prompt: Some("fix.md".into()),
                command: None,
                output_file: None,
                status_mapping: HashMap::new(),
                model: None,
                allowed_writes: vec![".jeeves/*".into()],
                transitions: vec![Transition {
                    to: "review".into(),
                    when: None,
                    auto: true,
                    priority: 0,
                }],
            },
        );
        phases.insert(
            "done".to_string(),
            Phase {
                name: "done".to_string(),
                kind: PhaseType::Terminal,
                prompt: None,
                command: None,
                output_file: None,
                status_mapping: HashMap::new(),
                model: None,
                allowed_writes: vec![".jeeves/*".into()],
                transitions: vec![],
            },
        );
        Workflow {
            name: "test".into(),
            version: 1,
            start: "review".into(),
            default_model: None,
            phases,
        }
    }

    #[test]
    fn picks_first_satisfied_transition_in_declared_order() {
        let wf = workflow();
        let engine = WorkflowEngine::new(&wf);
        let ctx = Context::new(json!({"status": {"needsChanges": true, "approved": true}}));
        assert_eq!(
            engine.evaluate_transitions("review", &ctx),
            Some("fix".to_string())
        );
    }

    #[test]
    fn returns_none_when_no_transition_satisfied() {
        let wf = workflow();
        let engine = WorkflowEngine::new(&wf);
        let ctx = Context::new(json!({"status": {}}));
        assert_eq!(engine.evaluate_transitions("review", &ctx), None);
    }

    #[test]
    fn auto_transition_is_unconditional() {
        let wf = workflow();
        let engine = WorkflowEngine::new(&wf);
        let ctx = Context::new(json!({}));
        assert_eq!(
            engine.evaluate_transitions("fix", &ctx),
            Some("review".to_string())
        );
    }

    #[test]
    fn terminal_phase_never_transitions() {
        let wf = workflow();
        let engine = WorkflowEngine::new(&wf);
        let ctx = Context::new(json!({"anything": "goes"}));
        assert_eq!(engine.evaluate_transitions("done", &ctx), None);
        assert!(engine.is_terminal("done"));
    }
}

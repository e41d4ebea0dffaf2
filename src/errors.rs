//! Typed error hierarchy for the orchestrator core.
//!
//! Each enum groups the error kinds one subsystem can raise. Call sites that need to
//! discriminate match on these; call sites that just need to propagate use `anyhow`.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while parsing or validating a workflow document or issue state.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("workflow validation failed:\n{}", .0.join("\n"))]
    Workflow(Vec<String>),

    #[error("malformed issue state at {path}: {message}")]
    MalformedState { path: PathBuf, message: String },

    #[error("unrecognised model tag: {0}")]
    UnknownModel(String),
}

/// Errors for resources the orchestrator expected to already exist.
#[derive(Debug, Error)]
pub enum NotFoundError {
    #[error("worktree not found: {0}")]
    Worktree(PathBuf),

    #[error("prompt file not found: {0}")]
    Prompt(PathBuf),

    #[error("issue state not found for {owner}/{repo}#{number}")]
    IssueState {
        owner: String,
        repo: String,
        number: u64,
    },

    #[error("workflow not found: {0}")]
    Workflow(String),

    #[error("no issue selected; call set_issue first")]
    NoActiveIssue,
}

/// Errors raised when an operation conflicts with the orchestrator's current state.
#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("orchestrator already running for {issue_ref}")]
    AlreadyRunning { issue_ref: String },

    #[error("cannot modify issue state while the orchestrator is running")]
    RunningStateEdit,

    #[error("cannot change the active issue while the orchestrator is running")]
    RunningIssueSwitch,
}

/// Timeouts the supervisor handles internally (never propagated as a hard failure).
#[derive(Debug, Error)]
pub enum TimeoutError {
    #[error("iteration exceeded wall-clock timeout of {0:?}")]
    IterationWallClock(std::time::Duration),

    #[error("iteration inactive for {0:?}")]
    Inactivity(std::time::Duration),

    #[error("child did not exit within grace period of {0:?} after signal")]
    ChildWaitGrace(std::time::Duration),
}

/// A child agent process misbehaving in a way that does not abort the run.
#[derive(Debug, Error)]
pub enum TransientChildFailure {
    #[error("agent exited with non-zero status {0}")]
    NonZeroExit(i32),

    #[error("stdout reader task failed: {0}")]
    ReaderFailed(String),
}

/// Top-level error type returned by fallible library entry points.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("failed to write {path}: {source}")]
    StateWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors the HTTP observation server maps onto status codes.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_formats_all_messages() {
        let err = ValidationError::Workflow(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "workflow validation failed:\na\nb");
    }

    #[test]
    fn conflict_error_carries_issue_ref() {
        let err = ConflictError::AlreadyRunning {
            issue_ref: "acme/widgets#42".into(),
        };
        assert!(err.to_string().contains("acme/widgets#42"));
    }

    #[test]
    fn orchestrator_error_wraps_not_found() {
        let err: OrchestratorError = NotFoundError::Worktree(PathBuf::from("/tmp/x")).into();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[test]
    fn server_error_from_anyhow() {
        let err: ServerError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, ServerError::Internal(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ValidationError::UnknownModel("gpt4".into()));
        assert_std_error(&NotFoundError::Workflow("default".into()));
        assert_std_error(&ConflictError::RunningStateEdit);
        assert_std_error(&TimeoutError::Inactivity(std::time::Duration::from_secs(5)));
        assert_std_error(&TransientChildFailure::NonZeroExit(1));
    }
}

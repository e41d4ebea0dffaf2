//! HTTP surface (§6): the observation server's request/response endpoints. Errors flow
//! through `ServerError` so the status-code mapping lives in one place.

use crate::errors::{ConflictError, NotFoundError, ServerError};
use crate::orchestrator::supervisor::RunParams;
use crate::server::sse;
use crate::server::{AppState, SharedState};
use crate::watchers::log_watcher::LogWatcher;
use crate::watchers::sdk_watcher::SdkOutputWatcher;
use crate::workflow_loader;
use axum::extract::{ConnectInfo, Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::CorsLayer;

/// Reject a run-control or state-mutating request that did not originate from
/// loopback, unless the server was started with `--allow-remote-run`.
fn require_local_or_allowed(state: &AppState, addr: SocketAddr) -> Result<(), ServerError> {
    if state.config.allow_remote_run || addr.ip().is_loopback() {
        return Ok(());
    }
    Err(ServerError::Forbidden(
        "run control is only allowed from localhost; restart the server with \
         --allow-remote-run to enable it"
            .to_string(),
    ))
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/stream", get(sse::stream_handler))
        .route("/api/logs", get(get_logs))
        .route("/api/sdk-output", get(get_sdk_output))
        .route("/api/sdk-output/messages", get(get_sdk_messages))
        .route("/api/sdk-output/tool-calls", get(get_sdk_tool_calls))
        .route("/api/run", get(get_run).post(post_run))
        .route("/api/run/logs", get(get_run_logs))
        .route("/api/run/stop", post(post_run_stop))
        .route("/api/issue/status", post(post_issue_status))
        .route("/api/issues/select", post(post_issues_select))
        .route("/api/workflows", get(get_workflows))
        .route("/api/workflow/{name}/full", get(get_workflow_full))
        .route("/api/workflow/{name}", post(post_workflow).delete(delete_workflow))
        .route("/api/workflow/{name}/validate", post(post_workflow_validate))
        .route("/api/workflow/{name}/duplicate", post(post_workflow_duplicate))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

async fn active_issue_or_bad_request(
    state: &AppState,
) -> Result<(String, String, u64), ServerError> {
    state
        .supervisor
        .active_issue()
        .await
        .ok_or_else(|| ServerError::BadRequest("no active issue selected".to_string()))
}

async fn get_state(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ServerError> {
    let run = state.supervisor.status().await;
    let active = state.supervisor.active_issue().await;
    let snapshot = match &active {
        Some((owner, repo, number)) => {
            crate::server::snapshot::compute(&state.config, owner, repo, *number, run)
        }
        None => crate::server::snapshot::compute_unselected(run),
    };
    Ok(Json(serde_json::to_value(snapshot).map_err(|e| ServerError::Internal(e.into()))?))
}

async fn get_logs(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ServerError> {
    let (owner, repo, number) = active_issue_or_bad_request(&state).await?;
    let path = state
        .config
        .issues_dir()
        .join(owner)
        .join(repo)
        .join(number.to_string())
        .join("last-run.log");
    let watcher = LogWatcher::new(path);
    let lines = watcher.get_all_lines(500);
    Ok(Json(json!({"lines": lines})))
}

async fn get_sdk_output(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ServerError> {
    let (owner, repo, number) = active_issue_or_bad_request(&state).await?;
    let path = state
        .config
        .issues_dir()
        .join(owner)
        .join(repo)
        .join(number.to_string())
        .join("sdk-output.json");
    let watcher = SdkOutputWatcher::new(path);
    match watcher.read_full() {
        Some(output) => Ok(Json(serde_json::to_value(output).map_err(|e| ServerError::Internal(e.into()))?)),
        None => Ok(Json(json!(null))),
    }
}

async fn get_sdk_messages(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ServerError> {
    let (owner, repo, number) = active_issue_or_bad_request(&state).await?;
    let path = state
        .config
        .issues_dir()
        .join(owner)
        .join(repo)
        .join(number.to_string())
        .join("sdk-output.json");
    let watcher = SdkOutputWatcher::new(path);
    let messages = watcher.read_full().map(|o| o.messages).unwrap_or_default();
    Ok(Json(json!({"messages": messages})))
}

async fn get_sdk_tool_calls(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ServerError> {
    let (owner, repo, number) = active_issue_or_bad_request(&state).await?;
    let path = state
        .config
        .issues_dir()
        .join(owner)
        .join(repo)
        .join(number.to_string())
        .join("sdk-output.json");
    let watcher = SdkOutputWatcher::new(path);
    let tool_calls = watcher.read_full().map(|o| o.tool_calls).unwrap_or_default();
    Ok(Json(json!({"tool_calls": tool_calls})))
}

async fn get_run(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let run = state.supervisor.status().await;
    Json(serde_json::to_value(run).unwrap_or_default())
}

async fn get_run_logs(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ServerError> {
    let run = state.supervisor.status().await;
    let watcher = LogWatcher::new(run.viewer_log_path.clone());
    Ok(Json(json!({"lines": watcher.get_all_lines(500)})))
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    issue_ref: Option<String>,
    max_iterations: u32,
    inactivity_timeout_sec: u64,
    iteration_timeout_sec: u64,
    max_buffer_size: Option<usize>,
}

async fn post_run(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<RunRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    require_local_or_allowed(&state, addr)?;
    if body.max_iterations == 0 {
        return Err(ServerError::BadRequest("max_iterations must be greater than zero".to_string()));
    }

    if let Some(issue_ref) = &body.issue_ref {
        let (owner, repo, number) = parse_issue_ref(issue_ref)
            .ok_or_else(|| ServerError::BadRequest(format!("malformed issue_ref: {issue_ref}")))?;
        state.supervisor.set_issue(&owner, &repo, number).await.map_err(to_server_error)?;
    }

    let params = RunParams {
        max_iterations: body.max_iterations,
        inactivity_timeout: Duration::from_secs(body.inactivity_timeout_sec),
        iteration_timeout: Duration::from_secs(body.iteration_timeout_sec),
        max_buffer_size: body.max_buffer_size,
    };
    state.supervisor.start(params).await.map_err(to_server_error)?;
    Ok(Json(json!({"started": true})))
}

#[derive(Debug, Deserialize, Default)]
struct StopRequest {
    #[serde(default)]
    force: bool,
}

async fn post_run_stop(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<StopRequest>>,
) -> Result<Json<serde_json::Value>, ServerError> {
    require_local_or_allowed(&state, addr)?;
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    state.supervisor.stop(force).await.map_err(|e| ServerError::Internal(e))?;
    Ok(Json(json!({"stopped": true})))
}

#[derive(Debug, Deserialize)]
struct IssueStatusRequest {
    phase: String,
}

async fn post_issue_status(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<IssueStatusRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    require_local_or_allowed(&state, addr)?;
    let run = state.supervisor.status().await;
    if run.running {
        return Err(ConflictError::RunningStateEdit.into());
    }
    let (owner, repo, number) = active_issue_or_bad_request(&state).await?;
    let mut issue_state = crate::issue_state::load(&state.config.issues_dir(), &owner, &repo, number)
        .map_err(|e| match e.downcast::<NotFoundError>() {
            Ok(nf) => ServerError::NotFound(nf),
            Err(e) => ServerError::Internal(e),
        })?;
    issue_state.phase = body.phase;
    crate::issue_state::save(&state.config.issues_dir(), &issue_state).map_err(|e| ServerError::Internal(e))?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct SelectIssueRequest {
    owner: String,
    repo: String,
    number: u64,
}

async fn post_issues_select(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<SelectIssueRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    require_local_or_allowed(&state, addr)?;
    state
        .supervisor
        .set_issue(&body.owner, &body.repo, body.number)
        .await
        .map_err(to_server_error)?;
    Ok(Json(json!({"ok": true})))
}

async fn get_workflows(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ServerError> {
    let dir = state.config.workflows_dir();
    let mut names = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str())
                && entry.path().extension().is_some_and(|e| e == "yaml" || e == "yml")
            {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(Json(json!({"workflows": names})))
}

async fn get_workflow_full(
    State(state): State<SharedState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let workflow = workflow_loader::load_workflow_by_name(&name, &state.config.workflows_dir())
        .map_err(|e| match e.downcast::<NotFoundError>() {
            Ok(nf) => ServerError::NotFound(nf),
            Err(e) => ServerError::Internal(e),
        })?;
    Ok(Json(serde_json::to_value(workflow).map_err(|e| ServerError::Internal(e.into()))?))
}

async fn post_workflow_validate(
    State(state): State<SharedState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let path = state.config.workflows_dir().join(format!("{name}.yaml"));
    match workflow_loader::load_workflow(&path) {
        Ok(_) => Ok(Json(json!({"valid": true, "errors": []}))),
        Err(e) => Ok(Json(json!({"valid": false, "errors": [e.to_string()]}))),
    }
}

#[derive(Debug, Deserialize)]
struct PutWorkflowRequest {
    yaml: String,
}

/// Create or overwrite a workflow's YAML document. Rejects documents that fail
/// validation rather than writing them to the catalog.
async fn post_workflow(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxumPath(name): AxumPath<String>,
    Json(body): Json<PutWorkflowRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    require_local_or_allowed(&state, addr)?;
    workflow_loader::parse_workflow(&body.yaml)
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let path = state.config.workflows_dir().join(format!("{name}.yaml"));
    std::fs::write(&path, &body.yaml)
        .map_err(|e| ServerError::Internal(anyhow::Error::new(e)))?;
    Ok(Json(json!({"ok": true})))
}

async fn delete_workflow(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    require_local_or_allowed(&state, addr)?;
    let path = state.config.workflows_dir().join(format!("{name}.yaml"));
    if !path.exists() {
        return Err(NotFoundError::Workflow(name).into());
    }
    std::fs::remove_file(&path).map_err(|e| ServerError::Internal(anyhow::Error::new(e)))?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct DuplicateWorkflowRequest {
    to: String,
}

async fn post_workflow_duplicate(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AxumPath(name): AxumPath<String>,
    Json(body): Json<DuplicateWorkflowRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    require_local_or_allowed(&state, addr)?;
    let src = state.config.workflows_dir().join(format!("{name}.yaml"));
    if !src.exists() {
        return Err(NotFoundError::Workflow(name).into());
    }
    let dest = state.config.workflows_dir().join(format!("{}.yaml", body.to));
    std::fs::copy(&src, &dest).map_err(|e| ServerError::Internal(anyhow::Error::new(e)))?;
    Ok(Json(json!({"ok": true})))
}

fn parse_issue_ref(issue_ref: &str) -> Option<(String, String, u64)> {
    let (owner_repo, number) = issue_ref.split_once('#')?;
    let (owner, repo) = owner_repo.split_once('/')?;
    let number: u64 = number.parse().ok()?;
    Some((owner.to_string(), repo.to_string(), number))
}

fn to_server_error(err: anyhow::Error) -> ServerError {
    if let Some(nf) = err.downcast_ref::<NotFoundError>() {
        return ServerError::NotFound(clone_not_found(nf));
    }
    if let Some(conflict) = err.downcast_ref::<ConflictError>() {
        return ServerError::Conflict(clone_conflict(conflict));
    }
    ServerError::Internal(err)
}

fn clone_not_found(err: &NotFoundError) -> NotFoundError {
    match err {
        NotFoundError::Worktree(p) => NotFoundError::Worktree(p.clone()),
        NotFoundError::Prompt(p) => NotFoundError::Prompt(p.clone()),
        NotFoundError::IssueState { owner, repo, number } => NotFoundError::IssueState {
            owner: owner.clone(),
            repo: repo.clone(),
            number: *number,
        },
        NotFoundError::Workflow(name) => NotFoundError::Workflow(name.clone()),
        NotFoundError::NoActiveIssue => NotFoundError::NoActiveIssue,
    }
}

fn clone_conflict(err: &ConflictError) -> ConflictError {
    match err {
        ConflictError::AlreadyRunning { issue_ref } => ConflictError::AlreadyRunning {
            issue_ref: issue_ref.clone(),
        },
        ConflictError::RunningStateEdit => ConflictError::RunningStateEdit,
        ConflictError::RunningIssueSwitch => ConflictError::RunningIssueSwitch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;
    use crate::orchestrator::Supervisor;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config::resolve(ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        config.ensure_directories().unwrap();
        std::mem::forget(dir);
        let state = Arc::new(AppState {
            supervisor: Supervisor::new(config.clone()),
            config,
        });
        router(state)
    }

    #[tokio::test]
    async fn get_state_without_active_issue_returns_ok() {
        let app = test_app();
        let req = Request::builder().uri("/api/state").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_logs_without_active_issue_is_bad_request() {
        let app = test_app();
        let req = Request::builder().uri("/api/logs").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    fn with_loopback_peer(mut req: Request<Body>) -> Request<Body> {
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9999))));
        req
    }

    #[tokio::test]
    async fn post_run_with_unselected_issue_and_no_issue_ref_is_bad_request() {
        let app = test_app();
        let req = with_loopback_peer(
            Request::builder()
                .method("POST")
                .uri("/api/run")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"max_iterations": 3, "inactivity_timeout_sec": 5, "iteration_timeout_sec": 5}).to_string(),
                ))
                .unwrap(),
        );
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn post_run_from_remote_peer_is_forbidden_by_default() {
        let app = test_app();
        let mut req = Request::builder()
            .method("POST")
            .uri("/api/run")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"max_iterations": 3, "inactivity_timeout_sec": 5, "iteration_timeout_sec": 5}).to_string(),
            ))
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 5], 443))));
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn post_run_from_remote_peer_is_allowed_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config::resolve(ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            allow_remote_run: Some(true),
            ..Default::default()
        })
        .unwrap();
        config.ensure_directories().unwrap();
        let state = Arc::new(AppState {
            supervisor: Supervisor::new(config.clone()),
            config,
        });
        let app = router(state);

        let mut req = Request::builder()
            .method("POST")
            .uri("/api/run")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"max_iterations": 3, "inactivity_timeout_sec": 5, "iteration_timeout_sec": 5}).to_string(),
            ))
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 5], 443))));
        let resp = app.oneshot(req).await.unwrap();
        // No issue selected and none provided, so this still fails, but past the
        // forbidden check: proves the remote peer was let through.
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_workflows_lists_yaml_catalog() {
        let app_state_dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config::resolve(ConfigOverrides {
            data_dir: Some(app_state_dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        config.ensure_directories().unwrap();
        std::fs::write(config.workflows_dir().join("default.yaml"), "name: default\n").unwrap();
        let state = Arc::new(AppState {
            supervisor: Supervisor::new(config.clone()),
            config,
        });
        let app = router(state);

        let req = Request::builder().uri("/api/workflows").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["workflows"], json!(["default"]));
    }
}

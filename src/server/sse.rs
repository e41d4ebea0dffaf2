//! SSE event multiplexer (§4.8): combines the log tail watcher, the SDK output
//! watcher, and the derived state snapshot into one ordered, named-event stream per
//! connection. Cursors live on the connection task, not globally, so observers never
//! block each other.

use crate::server::snapshot::{self, StateSnapshot};
use crate::server::AppState;
use crate::watchers::log_watcher::LogWatcher;
use crate::watchers::sdk_watcher::SdkOutputWatcher;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const CHANNEL_CAPACITY: usize = 256;

pub async fn stream_handler(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY);
    tokio::spawn(run_connection(state, tx));
    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

async fn run_connection(state: Arc<AppState>, tx: mpsc::Sender<Event>) {
    // Padding byte to flush through any proxy buffering.
    let _ = tx.send(Event::default().comment(" ")).await;

    let mut active = state.supervisor.active_issue().await;
    let mut log_watcher = active.as_ref().map(|(owner, repo, number)| {
        let path = state
            .config
            .issues_dir()
            .join(owner)
            .join(repo)
            .join(number.to_string())
            .join("last-run.log");
        LogWatcher::new(path)
    });
    let mut sdk_watcher = active.as_ref().map(|(owner, repo, number)| {
        let path = state
            .config
            .issues_dir()
            .join(owner)
            .join(repo)
            .join(number.to_string())
            .join("sdk-output.json");
        SdkOutputWatcher::new(path)
    });

    let initial_snapshot = compute_snapshot(&state, active.as_ref()).await;
    let mut last_state_signature = serde_json::to_string(&initial_snapshot).unwrap_or_default();
    if tx.send(snapshot_event(&initial_snapshot)).await.is_err() {
        return;
    }

    if let Some(watcher) = &sdk_watcher
        && !send_sdk_replay(&tx, watcher).await
    {
        return;
    }

    let mut log_interval = tokio::time::interval(state.config.log_poll_interval);
    let mut sdk_interval = tokio::time::interval(state.config.sdk_poll_interval);
    let mut state_interval = tokio::time::interval(state.config.state_poll_interval);
    let mut heartbeat_interval = tokio::time::interval(state.config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = log_interval.tick() => {
                let current = state.supervisor.active_issue().await;
                if current != active {
                    active = current.clone();
                    log_watcher = active.as_ref().map(|(owner, repo, number)| {
                        let path = state.config.issues_dir().join(owner).join(repo).join(number.to_string()).join("last-run.log");
                        LogWatcher::new(path)
                    });
                    sdk_watcher = active.as_ref().map(|(owner, repo, number)| {
                        let path = state.config.issues_dir().join(owner).join(repo).join(number.to_string()).join("sdk-output.json");
                        SdkOutputWatcher::new(path)
                    });
                    let event = Event::default().event("logs").json_data(json!({"reset": true})).unwrap();
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                if let Some(watcher) = &log_watcher {
                    let (lines, changed) = watcher.get_new_lines();
                    if changed {
                        let event = Event::default().event("logs").json_data(json!({"lines": lines})).unwrap();
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
            _ = sdk_interval.tick() => {
                if let Some(watcher) = &sdk_watcher {
                    let updates = watcher.get_updates();
                    if updates.changed {
                        let total = watcher.total_message_count();
                        let start_index = total - updates.new_messages.len();
                        if !emit_sdk_updates(&tx, &updates.new_messages, &updates.new_tool_calls, start_index).await {
                            return;
                        }
                    }
                }
            }
            _ = state_interval.tick() => {
                let snapshot = compute_snapshot(&state, active.as_ref()).await;
                let signature = serde_json::to_string(&snapshot).unwrap_or_default();
                if signature != last_state_signature {
                    last_state_signature = signature;
                    if tx.send(snapshot_event(&snapshot)).await.is_err() {
                        return;
                    }
                }
            }
            _ = heartbeat_interval.tick() => {
                let event = Event::default().event("heartbeat").json_data(json!({})).unwrap();
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn compute_snapshot(state: &AppState, active: Option<&(String, String, u64)>) -> StateSnapshot {
    let run = state.supervisor.status().await;
    match active {
        Some((owner, repo, number)) => snapshot::compute(&state.config, owner, repo, *number, run),
        None => snapshot::compute_unselected(run),
    }
}

fn snapshot_event(snapshot: &StateSnapshot) -> Event {
    Event::default()
        .event("state")
        .json_data(snapshot)
        .unwrap_or_else(|_| Event::default().event("state").data("{}"))
}

/// Emit the initial SDK replay sequence: `sdk-init`, one `sdk-message` per message, a
/// `sdk-tool-start`/`sdk-tool-complete` pair per tool call, and `sdk-complete` if the
/// session has ended. Returns `false` if the connection went away mid-replay.
async fn send_sdk_replay(tx: &mpsc::Sender<Event>, watcher: &SdkOutputWatcher) -> bool {
    let Some(output) = watcher.read_full() else {
        return true;
    };

    let init = Event::default()
        .event("sdk-init")
        .json_data(json!({"session_id": output.session_id}))
        .unwrap();
    if tx.send(init).await.is_err() {
        return false;
    }

    if !emit_sdk_updates(tx, &output.messages, &output.tool_calls, 0).await {
        return false;
    }

    if output.ended_at.is_some() {
        let status = if output.success { "success" } else { "error" };
        let complete = Event::default()
            .event("sdk-complete")
            .json_data(json!({"status": status}))
            .unwrap();
        if tx.send(complete).await.is_err() {
            return false;
        }
    }

    // Advance the watcher's cursor so subsequent `get_updates` calls only see deltas.
    watcher.get_updates();
    true
}

async fn emit_sdk_updates(
    tx: &mpsc::Sender<Event>,
    messages: &[crate::watchers::sdk_watcher::SdkMessage],
    tool_calls: &[crate::watchers::sdk_watcher::ToolCall],
    start_index: usize,
) -> bool {
    let total = start_index + messages.len();
    for (offset, message) in messages.iter().enumerate() {
        let event = Event::default()
            .event("sdk-message")
            .json_data(json!({
                "index": start_index + offset,
                "total": total,
                "message": message,
            }))
            .unwrap();
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    for tool_call in tool_calls {
        let start = Event::default()
            .event("sdk-tool-start")
            .json_data(json!({"tool_use_id": tool_call.tool_use_id, "name": tool_call.name}))
            .unwrap();
        if tx.send(start).await.is_err() {
            return false;
        }
        let complete = Event::default()
            .event("sdk-tool-complete")
            .json_data(json!({"tool_use_id": tool_call.tool_use_id, "is_error": tool_call.is_error}))
            .unwrap();
        if tx.send(complete).await.is_err() {
            return false;
        }
    }
    true
}

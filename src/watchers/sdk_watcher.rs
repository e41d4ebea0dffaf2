//! SDK output watcher (§4.6.2): tracks `sdk-output.json`'s `(mtime, size)` plus the
//! message/tool-call counts already delivered, and yields only the new entries.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "tool_use")]
    pub tool_use: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "tool_use_id")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "session_id")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub input: HashMap<String, Json>,
    #[serde(rename = "tool_use_id")]
    pub tool_use_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "duration_ms")]
    pub duration_ms: Option<u64>,
    #[serde(default, rename = "is_error")]
    pub is_error: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default, rename = "cache_creation")]
    pub cache_creation: u64,
    #[serde(default, rename = "cache_read")]
    pub cache_read: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    #[serde(default, rename = "message_count")]
    pub message_count: u64,
    #[serde(default, rename = "tool_call_count")]
    pub tool_call_count: u64,
    #[serde(default, rename = "duration_seconds")]
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkOutput {
    pub schema: String,
    #[serde(rename = "session_id")]
    pub session_id: String,
    #[serde(rename = "started_at")]
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ended_at")]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub messages: Vec<SdkMessage>,
    #[serde(default, rename = "tool_calls")]
    pub tool_calls: Vec<ToolCall>,
    pub stats: Stats,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct State {
    last_mtime: Option<SystemTime>,
    last_size: u64,
    last_message_count: usize,
    last_tool_count: usize,
}

pub struct SdkOutputWatcher {
    path: PathBuf,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
pub struct SdkUpdates {
    pub new_messages: Vec<SdkMessage>,
    pub new_tool_calls: Vec<ToolCall>,
    pub changed: bool,
}

impl SdkOutputWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(State {
                last_mtime: None,
                last_size: 0,
                last_message_count: 0,
                last_tool_count: 0,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// New messages and tool calls since the previous call. Malformed JSON and
    /// unreadable files return an empty, unchanged delta rather than an error.
    pub fn get_updates(&self) -> SdkUpdates {
        let mut state = self.state.lock().unwrap();

        let Ok(metadata) = fs::metadata(&self.path) else {
            state.last_mtime = None;
            state.last_size = 0;
            state.last_message_count = 0;
            state.last_tool_count = 0;
            return SdkUpdates::default();
        };

        let size = metadata.len();
        let mtime = metadata.modified().ok();
        if mtime == state.last_mtime && size == state.last_size {
            return SdkUpdates::default();
        }
        state.last_mtime = mtime;
        state.last_size = size;

        let Ok(body) = fs::read_to_string(&self.path) else {
            return SdkUpdates::default();
        };
        let Ok(output) = serde_json::from_str::<SdkOutput>(&body) else {
            return SdkUpdates::default();
        };

        let new_messages = output
            .messages
            .get(state.last_message_count..)
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        let new_tool_calls = output
            .tool_calls
            .get(state.last_tool_count..)
            .map(<[_]>::to_vec)
            .unwrap_or_default();

        state.last_message_count = output.messages.len();
        state.last_tool_count = output.tool_calls.len();

        let changed = !new_messages.is_empty() || !new_tool_calls.is_empty();
        SdkUpdates {
            new_messages,
            new_tool_calls,
            changed,
        }
    }

    /// Read the current document without advancing any cursor. Used for the initial
    /// SSE replay before the watcher's indices are fast-forwarded.
    pub fn read_full(&self) -> Option<SdkOutput> {
        let body = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&body).ok()
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_mtime = None;
        state.last_size = 0;
        state.last_message_count = 0;
        state.last_tool_count = 0;
    }

    /// Total message count as of the most recent `get_updates`/`read_full` call. Used
    /// by observers to compute a running `{index, total}` pair without re-reading the
    /// file.
    pub fn total_message_count(&self) -> usize {
        self.state.lock().unwrap().last_message_count
    }
}

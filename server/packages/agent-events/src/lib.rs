use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

pub mod adapters;

pub use adapters::{get_adapter, Adapter, AdapterError, EventParser, Framework, ParseScratch};

/// One line of agent stdout: `{"type": ..., "data": {...}}`.
///
/// Claude Messages-API stream events carry their fields at the top level
/// (`index`, `delta`, `content_block`, ...), so unknown keys are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type", default = "unknown_type")]
    pub event_type: String,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn unknown_type() -> String {
    "unknown".to_string()
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("event line is not a json object")]
    NotAnObject,
}

impl RawEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            extra: Map::new(),
        }
    }

    pub fn parse_line(line: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(line.trim())?;
        if !value.is_object() {
            return Err(EnvelopeError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Looks a key up in `data` first, then at the top level.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data
            .get(key)
            .filter(|value| !value.is_null())
            .or_else(|| self.extra.get(key).filter(|value| !value.is_null()))
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.field(key).and_then(as_u64_lenient)
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("type".to_string(), Value::String(self.event_type.clone()));
        map.insert("data".to_string(), self.data.clone());
        Value::Object(map)
    }
}

pub(crate) fn as_u64_lenient(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Status,
    TextDelta,
    ThinkingDelta,
    ToolUseStart,
    ToolUseDelta,
    ToolUseEnd,
    ToolResult,
    TodoCreate,
    TodoUpdate,
    TodoDone,
    Usage,
    Result,
    Error,
    Done,
    Raw,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Status => "status",
            Self::TextDelta => "text_delta",
            Self::ThinkingDelta => "thinking_delta",
            Self::ToolUseStart => "tool_use_start",
            Self::ToolUseDelta => "tool_use_delta",
            Self::ToolUseEnd => "tool_use_end",
            Self::ToolResult => "tool_result",
            Self::TodoCreate => "todo_create",
            Self::TodoUpdate => "todo_update",
            Self::TodoDone => "todo_done",
            Self::Usage => "usage",
            Self::Result => "result",
            Self::Error => "error",
            Self::Done => "done",
            Self::Raw => "raw",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Done)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingSource {
    /// Model reasoning, either a discrete thought or a streamed fragment.
    Thinking,
    ThinkTool,
    Subagent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    fn from_str_lenient(value: &str) -> Self {
        match value {
            "in_progress" | "in-progress" | "active" => Self::InProgress,
            "completed" | "done" => Self::Completed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct TodoItem {
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
}

impl TodoItem {
    pub fn from_value(value: &Value) -> Self {
        let content = value
            .get("content")
            .and_then(Value::as_str)
            .or_else(|| value.get("activeForm").and_then(Value::as_str))
            .or_else(|| value.as_str())
            .unwrap_or_default()
            .to_string();
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .map(TodoStatus::from_str_lenient)
            .unwrap_or_default();
        Self { content, status }
    }
}

/// Token counts as reported by the agent; absent counts stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn from_value(value: &Value) -> Self {
        fn count(value: &Value, keys: &[&str]) -> Option<u64> {
            keys.iter()
                .find_map(|key| value.get(*key).and_then(as_u64_lenient))
        }
        Self {
            input_tokens: count(value, &["input_tokens"]),
            output_tokens: count(value, &["output_tokens"]),
            reasoning_tokens: count(value, &["reasoning_tokens"]),
            cached_tokens: count(value, &["cached_tokens", "cache_read_input_tokens"]),
            total_tokens: count(value, &["total_tokens"]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.reasoning_tokens.is_none()
            && self.cached_tokens.is_none()
            && self.total_tokens.is_none()
    }
}

/// Final summary reported by the agent runtime at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u64>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum NormalizedEvent {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default)]
        metadata: Value,
    },
    Status {
        message: String,
    },
    TextDelta {
        delta: String,
    },
    ThinkingDelta {
        delta: String,
        source: ThinkingSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subagent: Option<String>,
    },
    ToolUseStart {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolUseDelta {
        id: String,
        partial_json: String,
    },
    ToolUseEnd {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        output: Value,
    },
    TodoCreate {
        items: Vec<TodoItem>,
    },
    TodoUpdate {
        items: Vec<TodoItem>,
    },
    TodoDone {
        item: TodoItem,
        index: usize,
    },
    Usage {
        usage: TokenUsage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
        #[serde(default)]
        total: bool,
    },
    Result(RunResult),
    Error {
        message: String,
    },
    Done,
    Raw {
        payload: Value,
    },
}

impl NormalizedEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Start { .. } => EventKind::Start,
            Self::Status { .. } => EventKind::Status,
            Self::TextDelta { .. } => EventKind::TextDelta,
            Self::ThinkingDelta { .. } => EventKind::ThinkingDelta,
            Self::ToolUseStart { .. } => EventKind::ToolUseStart,
            Self::ToolUseDelta { .. } => EventKind::ToolUseDelta,
            Self::ToolUseEnd { .. } => EventKind::ToolUseEnd,
            Self::ToolResult { .. } => EventKind::ToolResult,
            Self::TodoCreate { .. } => EventKind::TodoCreate,
            Self::TodoUpdate { .. } => EventKind::TodoUpdate,
            Self::TodoDone { .. } => EventKind::TodoDone,
            Self::Usage { .. } => EventKind::Usage,
            Self::Result(_) => EventKind::Result,
            Self::Error { .. } => EventKind::Error,
            Self::Done => EventKind::Done,
            Self::Raw { .. } => EventKind::Raw,
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn text(delta: impl Into<String>) -> Self {
        Self::TextDelta {
            delta: delta.into(),
        }
    }

    pub fn thinking(delta: impl Into<String>) -> Self {
        Self::ThinkingDelta {
            delta: delta.into(),
            source: ThinkingSource::Thinking,
            subagent: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use mobox_error::MoboxError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    as_u64_lenient, EnvelopeError, NormalizedEvent, RawEvent, RunResult, ThinkingSource, TodoItem,
    TokenUsage,
};

pub mod claude;
pub mod deepagents;

pub use claude::ClaudeAdapter;
pub use deepagents::DeepAgentsAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Claude,
    #[serde(alias = "langchain")]
    DeepAgents,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::DeepAgents => "deepagents",
        }
    }

    pub fn all() -> &'static [Framework] {
        &[Self::Claude, Self::DeepAgents]
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = AdapterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "deepagents" | "langchain" => Ok(Self::DeepAgents),
            _ => Err(AdapterError::UnsupportedFramework(value.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unsupported framework: {0}")]
    UnsupportedFramework(String),
}

impl From<AdapterError> for MoboxError {
    fn from(value: AdapterError) -> Self {
        match value {
            AdapterError::UnsupportedFramework(framework) => {
                MoboxError::UnsupportedFramework { framework }
            }
        }
    }
}

/// Closed set of framework adapters. Adding a framework means adding a variant.
#[derive(Debug, Clone)]
pub enum Adapter {
    Claude(ClaudeAdapter),
    DeepAgents(DeepAgentsAdapter),
}

impl Adapter {
    pub fn for_framework(framework: Framework) -> Self {
        match framework {
            Framework::Claude => Self::Claude(ClaudeAdapter),
            Framework::DeepAgents => Self::DeepAgents(DeepAgentsAdapter),
        }
    }

    pub fn framework(&self) -> Framework {
        match self {
            Self::Claude(_) => Framework::Claude,
            Self::DeepAgents(_) => Framework::DeepAgents,
        }
    }

    /// Maps one raw event to a normalized event. Never fails on well-formed
    /// input; unrecognized shapes come back as `NormalizedEvent::Raw`.
    pub fn parse(&self, raw: &RawEvent, scratch: &mut ParseScratch) -> NormalizedEvent {
        match self {
            Self::Claude(adapter) => adapter.parse(raw, scratch),
            Self::DeepAgents(adapter) => adapter.parse(raw, scratch),
        }
    }
}

pub fn get_adapter(framework: &str) -> Result<Adapter, AdapterError> {
    Ok(Adapter::for_framework(framework.parse()?))
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ToolBlock {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub partial_json: String,
}

/// Per-stream adapter state. Owned by the stream, passed into every parse.
#[derive(Debug, Default)]
pub struct ParseScratch {
    pub(crate) tool_blocks: HashMap<u64, ToolBlock>,
    pub(crate) pending_searches: VecDeque<String>,
    next_id: u64,
    sdk_session_id: Option<String>,
}

impl ParseScratch {
    pub fn sdk_session_id(&self) -> Option<&str> {
        self.sdk_session_id.as_deref()
    }

    pub(crate) fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{}", self.next_id)
    }

    pub(crate) fn capture_session_id(&mut self, id: &str) {
        if !id.is_empty() {
            self.sdk_session_id = Some(id.to_string());
        }
    }
}

/// An adapter paired with the scratch state of one stream.
#[derive(Debug)]
pub struct EventParser {
    adapter: Adapter,
    scratch: ParseScratch,
}

impl EventParser {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            scratch: ParseScratch::default(),
        }
    }

    pub fn for_framework(framework: &str) -> Result<Self, AdapterError> {
        Ok(Self::new(get_adapter(framework)?))
    }

    pub fn framework(&self) -> Framework {
        self.adapter.framework()
    }

    pub fn parse(&mut self, raw: &RawEvent) -> NormalizedEvent {
        self.adapter.parse(raw, &mut self.scratch)
    }

    pub fn parse_line(&mut self, line: &str) -> Result<NormalizedEvent, EnvelopeError> {
        let raw = RawEvent::parse_line(line)?;
        Ok(self.parse(&raw))
    }

    pub fn sdk_session_id(&self) -> Option<&str> {
        self.scratch.sdk_session_id()
    }
}

/// Vocabulary shared by every agent runner script regardless of framework.
pub(crate) fn parse_common(raw: &RawEvent, scratch: &mut ParseScratch) -> Option<NormalizedEvent> {
    let event = match raw.event_type.as_str() {
        "start" => NormalizedEvent::Start {
            model: raw.str_field("model").map(str::to_string),
            metadata: raw.data.clone(),
        },
        "status" => NormalizedEvent::status(raw.str_field("message").unwrap_or_default()),
        "text" => NormalizedEvent::text(raw.str_field("content").unwrap_or_default()),
        "thinking" => NormalizedEvent::ThinkingDelta {
            delta: discrete_thought(raw.str_field("content").unwrap_or_default()),
            source: ThinkingSource::Thinking,
            subagent: None,
        },
        "think" => NormalizedEvent::ThinkingDelta {
            delta: discrete_thought(raw.str_field("thought").unwrap_or_default()),
            source: ThinkingSource::ThinkTool,
            subagent: None,
        },
        "tool_result" => NormalizedEvent::ToolResult {
            tool_use_id: raw.str_field("tool_use_id").map(str::to_string),
            output: raw.data.clone(),
        },
        "result" => {
            let result = run_result(&raw.data);
            if let Some(id) = result.session_id.as_deref() {
                scratch.capture_session_id(id);
            }
            NormalizedEvent::Result(result)
        }
        "usage" | "usage_total" => NormalizedEvent::Usage {
            usage: TokenUsage::from_value(&raw.data),
            stop_reason: raw.str_field("stop_reason").map(str::to_string),
            total: raw.event_type == "usage_total",
        },
        "todos" | "todo_create" => NormalizedEvent::TodoCreate {
            items: todo_items(raw.field("items")),
        },
        "todo_update" => NormalizedEvent::TodoUpdate {
            items: todo_items(raw.field("items")),
        },
        "todo_done" => NormalizedEvent::TodoDone {
            item: raw
                .field("item")
                .map(TodoItem::from_value)
                .unwrap_or_default(),
            index: raw.u64_field("index").unwrap_or(0) as usize,
        },
        "done" => NormalizedEvent::Done,
        _ => return None,
    };
    Some(event)
}

pub(crate) fn raw_passthrough(raw: &RawEvent) -> NormalizedEvent {
    NormalizedEvent::Raw {
        payload: raw.to_value(),
    }
}

/// Discrete thoughts end with a newline so they read as separate lines once
/// concatenated. Empty thoughts stay empty.
pub(crate) fn discrete_thought(text: &str) -> String {
    if text.is_empty() || text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}

pub(crate) fn todo_items(value: Option<&Value>) -> Vec<TodoItem> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().map(TodoItem::from_value).collect())
        .unwrap_or_default()
}

pub(crate) fn empty_input() -> Value {
    Value::Object(Map::new())
}

fn run_result(data: &Value) -> RunResult {
    let session_id = ["session_id", "sessionId"].iter().find_map(|key| {
        data.get(*key).and_then(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    });
    RunResult {
        session_id,
        duration_ms: data.get("duration_ms").and_then(as_u64_lenient),
        num_turns: data.get("num_turns").and_then(as_u64_lenient),
        is_error: data
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        total_cost_usd: data.get("total_cost_usd").and_then(Value::as_f64),
        usage: data
            .get("usage")
            .filter(|usage| usage.is_object())
            .map(TokenUsage::from_value),
    }
}

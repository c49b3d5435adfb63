use axum::response::sse::Event;
use mobox_agent_events::TodoItem;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reasoning blocks come in two flavours: agent status narration and model thinking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningVariant {
    Processing,
    Thinking,
}

impl ReasoningVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Thinking => "thinking",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BlockMetadata {
    pub variant: ReasoningVariant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<TodoItem>>,
}

/// `providerMetadata` attached to every reasoning frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderMetadata {
    pub mobox: BlockMetadata,
}

impl ProviderMetadata {
    pub fn variant(variant: ReasoningVariant) -> Self {
        Self {
            mobox: BlockMetadata {
                variant,
                todos: None,
            },
        }
    }

    pub fn with_todos(variant: ReasoningVariant, todos: Vec<TodoItem>) -> Self {
        Self {
            mobox: BlockMetadata {
                variant,
                todos: Some(todos),
            },
        }
    }
}

/// One frame of the UI message stream sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutputFrame {
    #[serde(rename_all = "camelCase")]
    Start { message_id: String },
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    #[serde(rename_all = "camelCase")]
    ReasoningStart {
        id: String,
        provider_metadata: ProviderMetadata,
    },
    #[serde(rename_all = "camelCase")]
    ReasoningDelta {
        id: String,
        delta: String,
        provider_metadata: ProviderMetadata,
    },
    #[serde(rename_all = "camelCase")]
    ReasoningEnd {
        id: String,
        provider_metadata: ProviderMetadata,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable { tool_call_id: String, output: Value },
    DataUsage { data: Value },
    /// Unrecognized agent output. Marked transient so clients do not keep it
    /// in message history.
    DataRaw { data: Value, transient: bool },
    Finish,
    #[serde(rename_all = "camelCase")]
    Error { error_text: String },
    Done,
}

impl OutputFrame {
    pub fn error(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::Error {
            error_text: if text.trim().is_empty() {
                "An error occurred".to_string()
            } else {
                text
            },
        }
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolInputDelta { .. } => "tool-input-delta",
            Self::ToolInputAvailable { .. } => "tool-input-available",
            Self::ToolOutputAvailable { .. } => "tool-output-available",
            Self::DataUsage { .. } => "data-usage",
            Self::DataRaw { .. } => "data-raw",
            Self::Finish => "finish",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Payload of the SSE `data:` field. `done` is the literal `[DONE]` marker.
    pub fn sse_data(&self) -> String {
        match self {
            Self::Done => "[DONE]".to_string(),
            frame => serde_json::to_string(frame).unwrap_or_else(|err| {
                tracing::error!(frame = frame.frame_type(), error = %err, "failed to encode frame");
                r#"{"type":"error","errorText":"An error occurred"}"#.to_string()
            }),
        }
    }

    pub fn to_sse_event(&self) -> Event {
        Event::default().data(self.sse_data())
    }

    /// Full wire encoding, `data: <payload>\n\n`.
    pub fn encode_sse(&self) -> String {
        format!("data: {}\n\n", self.sse_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_use_ui_stream_field_names() {
        let frame = OutputFrame::ReasoningDelta {
            id: "processing_1".to_string(),
            delta: "Searching\n".to_string(),
            provider_metadata: ProviderMetadata::variant(ReasoningVariant::Processing),
        };
        assert_eq!(
            serde_json::to_value(&frame).expect("serialize"),
            json!({
                "type": "reasoning-delta",
                "id": "processing_1",
                "delta": "Searching\n",
                "providerMetadata": {"mobox": {"variant": "processing"}}
            })
        );

        let frame = OutputFrame::ToolInputStart {
            tool_call_id: "call_1".to_string(),
            tool_name: "grep".to_string(),
        };
        assert_eq!(
            frame.sse_data(),
            r#"{"type":"tool-input-start","toolCallId":"call_1","toolName":"grep"}"#
        );
    }

    #[test]
    fn done_and_errors_encode_specially() {
        assert_eq!(OutputFrame::Done.encode_sse(), "data: [DONE]\n\n");
        assert_eq!(OutputFrame::Finish.encode_sse(), "data: {\"type\":\"finish\"}\n\n");
        assert_eq!(
            OutputFrame::error(""),
            OutputFrame::Error {
                error_text: "An error occurred".to_string()
            }
        );
    }
}

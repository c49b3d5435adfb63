use serde_json::{json, Value};

use crate::{NormalizedEvent, RawEvent, TodoItem, TokenUsage};

use super::{empty_input, parse_common, raw_passthrough, todo_items, ParseScratch, ToolBlock};

/// Claude Agent SDK runner output, plus the Messages-API streaming format
/// (`message_start`, `content_block_*`, `message_delta`, ...).
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeAdapter;

impl ClaudeAdapter {
    pub fn parse(&self, raw: &RawEvent, scratch: &mut ParseScratch) -> NormalizedEvent {
        match raw.event_type.as_str() {
            "message_start" => message_start(raw, scratch),
            "content_block_start" => content_block_start(raw, scratch),
            "content_block_delta" => content_block_delta(raw, scratch),
            "content_block_stop" => content_block_stop(raw, scratch),
            "message_delta" => {
                let delta = raw.field("delta");
                NormalizedEvent::Usage {
                    usage: raw
                        .field("usage")
                        .map(TokenUsage::from_value)
                        .unwrap_or_default(),
                    stop_reason: delta
                        .and_then(|delta| delta.get("stop_reason"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    total: false,
                }
            }
            "message_stop" => NormalizedEvent::Done,
            "ping" => raw_passthrough(raw),
            "error" => {
                let message = raw
                    .field("error")
                    .and_then(|error| error.get("message"))
                    .and_then(Value::as_str)
                    .or_else(|| raw.str_field("message"))
                    .filter(|message| !message.is_empty())
                    .unwrap_or("An error occurred");
                NormalizedEvent::error(message)
            }
            "tool_use" => tool_use(raw, scratch),
            "subagent_spawn" => {
                let subagent_type = raw.str_field("subagent_type").unwrap_or("subagent");
                let message = match raw.str_field("description") {
                    Some(description) if !description.is_empty() => {
                        format!("Spawning {subagent_type}: {description}")
                    }
                    _ => format!("Spawning {subagent_type}..."),
                };
                NormalizedEvent::status(message)
            }
            _ => parse_common(raw, scratch).unwrap_or_else(|| raw_passthrough(raw)),
        }
    }
}

fn message_start(raw: &RawEvent, scratch: &mut ParseScratch) -> NormalizedEvent {
    let message = raw.field("message");
    if let Some(id) = message.and_then(|m| m.get("id")).and_then(Value::as_str) {
        scratch.capture_session_id(id);
    }
    NormalizedEvent::Start {
        model: message
            .and_then(|m| m.get("model"))
            .and_then(Value::as_str)
            .map(str::to_string),
        metadata: json!({
            "usage": message
                .and_then(|m| m.get("usage"))
                .cloned()
                .unwrap_or_else(empty_input),
        }),
    }
}

fn block_index(raw: &RawEvent) -> u64 {
    raw.u64_field("index").unwrap_or(0)
}

fn content_block_start(raw: &RawEvent, scratch: &mut ParseScratch) -> NormalizedEvent {
    let index = block_index(raw);
    let Some(block) = raw.field("content_block") else {
        return raw_passthrough(raw);
    };
    match block.get("type").and_then(Value::as_str) {
        Some("text") => NormalizedEvent::text(""),
        Some("thinking") => NormalizedEvent::thinking(""),
        Some("tool_use") => {
            let id = block
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| scratch.next_id("call"));
            let name = block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let input = block.get("input").cloned().unwrap_or_else(empty_input);
            scratch.tool_blocks.insert(
                index,
                ToolBlock {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                    partial_json: String::new(),
                },
            );
            NormalizedEvent::ToolUseStart { id, name, input }
        }
        _ => raw_passthrough(raw),
    }
}

fn content_block_delta(raw: &RawEvent, scratch: &mut ParseScratch) -> NormalizedEvent {
    let index = block_index(raw);
    let Some(delta) = raw.field("delta") else {
        return raw_passthrough(raw);
    };
    let text_of = |key: &str| {
        delta
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    match delta.get("type").and_then(Value::as_str) {
        Some("text_delta") => NormalizedEvent::text(text_of("text")),
        // Streamed fragments are passed through untouched.
        Some("thinking_delta") => NormalizedEvent::thinking(text_of("thinking")),
        Some("input_json_delta") => match scratch.tool_blocks.get_mut(&index) {
            Some(block) => {
                let partial_json = text_of("partial_json");
                block.partial_json.push_str(&partial_json);
                NormalizedEvent::ToolUseDelta {
                    id: block.id.clone(),
                    partial_json,
                }
            }
            None => raw_passthrough(raw),
        },
        _ => raw_passthrough(raw),
    }
}

fn content_block_stop(raw: &RawEvent, scratch: &mut ParseScratch) -> NormalizedEvent {
    let index = block_index(raw);
    let Some(block) = scratch.tool_blocks.remove(&index) else {
        return raw_passthrough(raw);
    };
    let input = if block.partial_json.trim().is_empty() {
        block.input
    } else {
        match serde_json::from_str::<Value>(&block.partial_json) {
            Ok(input) => input,
            Err(err) => {
                tracing::warn!(
                    tool_id = %block.id,
                    error = %err,
                    "tool input json did not parse; forwarding raw text"
                );
                Value::String(block.partial_json)
            }
        }
    };
    NormalizedEvent::ToolUseEnd {
        id: block.id,
        name: block.name,
        input,
    }
}

fn tool_use(raw: &RawEvent, scratch: &mut ParseScratch) -> NormalizedEvent {
    let name = raw.str_field("name").unwrap_or("unknown");
    let input = raw.field("input").cloned().unwrap_or_else(empty_input);
    if name == "TodoWrite" {
        let items: Vec<TodoItem> = todo_items(input.get("todos"));
        if !items.is_empty() {
            return NormalizedEvent::TodoUpdate { items };
        }
    }
    let id = raw
        .str_field("id")
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| scratch.next_id("call"));
    NormalizedEvent::ToolUseStart {
        id,
        name: name.to_string(),
        input,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RawEvent, TodoStatus};

    fn parse(adapter: &ClaudeAdapter, scratch: &mut ParseScratch, line: &str) -> NormalizedEvent {
        let raw = RawEvent::parse_line(line).expect("valid line");
        adapter.parse(&raw, scratch)
    }

    #[test]
    fn todo_write_becomes_todo_update() {
        let mut scratch = ParseScratch::default();
        let event = parse(
            &ClaudeAdapter,
            &mut scratch,
            r#"{"type":"tool_use","data":{"name":"TodoWrite","input":{"todos":[
                {"activeForm":"Reading docs","status":"in_progress"},
                {"content":"Write summary"}
            ]}}}"#,
        );
        let NormalizedEvent::TodoUpdate { items } = event else {
            panic!("expected todo update, got {event:?}");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].content, "Reading docs");
        assert_eq!(items[0].status, TodoStatus::InProgress);
        assert_eq!(items[1].status, TodoStatus::Pending);
    }

    #[test]
    fn tool_input_is_assembled_across_deltas() {
        let adapter = ClaudeAdapter;
        let mut scratch = ParseScratch::default();
        let start = parse(
            &adapter,
            &mut scratch,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"grep","input":{}}}"#,
        );
        assert_eq!(start.kind(), crate::EventKind::ToolUseStart);
        parse(
            &adapter,
            &mut scratch,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"pattern\":"}}"#,
        );
        parse(
            &adapter,
            &mut scratch,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"fn main\"}"}}"#,
        );
        let end = parse(
            &adapter,
            &mut scratch,
            r#"{"type":"content_block_stop","index":1}"#,
        );
        assert_eq!(
            end,
            NormalizedEvent::ToolUseEnd {
                id: "toolu_1".to_string(),
                name: "grep".to_string(),
                input: json!({"pattern": "fn main"}),
            }
        );
        let stop_again = parse(
            &adapter,
            &mut scratch,
            r#"{"type":"content_block_stop","index":1}"#,
        );
        assert_eq!(stop_again.kind(), crate::EventKind::Raw);
    }

    #[test]
    fn subagent_spawn_without_description() {
        let mut scratch = ParseScratch::default();
        let event = parse(
            &ClaudeAdapter,
            &mut scratch,
            r#"{"type":"subagent_spawn","data":{"subagent_type":"researcher"}}"#,
        );
        assert_eq!(event, NormalizedEvent::status("Spawning researcher..."));
    }

    #[test]
    fn empty_tool_use_id_gets_generated_one() {
        let mut scratch = ParseScratch::default();
        let first = parse(
            &ClaudeAdapter,
            &mut scratch,
            r#"{"type":"tool_use","data":{"id":"","name":"grep","input":{}}}"#,
        );
        let second = parse(
            &ClaudeAdapter,
            &mut scratch,
            r#"{"type":"tool_use","data":{"name":"grep","input":{}}}"#,
        );
        let ids: Vec<String> = [first, second]
            .into_iter()
            .map(|event| match event {
                NormalizedEvent::ToolUseStart { id, .. } => id,
                other => panic!("expected tool start, got {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["call_1".to_string(), "call_2".to_string()]);
    }
}

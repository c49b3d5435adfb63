use serde_json::{json, Value};

use crate::{NormalizedEvent, RawEvent, ThinkingSource};

use super::{empty_input, parse_common, raw_passthrough, ParseScratch};

/// LangChain DeepAgents runner output. Also selected by `langchain`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepAgentsAdapter;

impl DeepAgentsAdapter {
    pub fn parse(&self, raw: &RawEvent, scratch: &mut ParseScratch) -> NormalizedEvent {
        match raw.event_type.as_str() {
            "tool_use" | "tool_call_start" => NormalizedEvent::ToolUseStart {
                id: raw
                    .str_field("id")
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| scratch.next_id("call")),
                name: raw.str_field("name").unwrap_or("unknown").to_string(),
                input: raw.field("input").cloned().unwrap_or_else(empty_input),
            },
            "search" => {
                let id = raw
                    .str_field("id")
                    .map(str::to_string)
                    .unwrap_or_else(|| scratch.next_id("search"));
                scratch.pending_searches.push_back(id.clone());
                NormalizedEvent::ToolUseStart {
                    id,
                    name: "internet_search".to_string(),
                    input: json!({
                        "query": raw.str_field("query").unwrap_or_default(),
                        "topic": raw.str_field("topic").unwrap_or("general"),
                    }),
                }
            }
            "search_result" => {
                // Results arrive in the order the searches were issued.
                let tool_use_id = raw
                    .str_field("tool_use_id")
                    .map(str::to_string)
                    .or_else(|| scratch.pending_searches.pop_front());
                NormalizedEvent::ToolResult {
                    tool_use_id,
                    output: json!({
                        "count": raw.u64_field("count").unwrap_or(0),
                        "results": raw.field("results").cloned().unwrap_or_else(|| Value::Array(Vec::new())),
                    }),
                }
            }
            "subagent_start" => {
                let agent = raw.str_field("agent").unwrap_or("unknown");
                let task = raw.str_field("task").unwrap_or_default();
                NormalizedEvent::ThinkingDelta {
                    delta: format!("Starting {agent}: {task}\n"),
                    source: ThinkingSource::Subagent,
                    subagent: Some(agent.to_string()),
                }
            }
            "subagent_complete" => {
                let agent = raw.str_field("agent").unwrap_or("unknown");
                NormalizedEvent::ThinkingDelta {
                    delta: format!("{agent} completed.\n"),
                    source: ThinkingSource::Subagent,
                    subagent: Some(agent.to_string()),
                }
            }
            "error" => NormalizedEvent::error(
                raw.str_field("message")
                    .filter(|message| !message.is_empty())
                    .unwrap_or("An error occurred"),
            ),
            _ => parse_common(raw, scratch).unwrap_or_else(|| raw_passthrough(raw)),
        }
    }
}

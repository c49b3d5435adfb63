use mobox_agent_events::{NormalizedEvent, TodoItem, TodoStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::formatter::todo_done_line;

/// Running token and cost totals for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.cost_usd <= 0.0
    }
}

/// Event kept for the session audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorSnapshot {
    pub text: String,
    pub thinking: String,
    pub status_lines: Vec<String>,
    pub todos: Vec<TodoItem>,
    pub usage: UsageTotals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    pub events: Vec<AuditEvent>,
}

/// Collects the durable transcript of one stream. Fed every normalized event
/// in the same order the formatter sees them.
#[derive(Debug, Default)]
pub struct Accumulator {
    state: AccumulatorSnapshot,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &NormalizedEvent) {
        let state = &mut self.state;
        match event {
            NormalizedEvent::TextDelta { delta } => state.text.push_str(delta),
            NormalizedEvent::ThinkingDelta { delta, .. } => state.thinking.push_str(delta),
            NormalizedEvent::Status { message } => {
                if !message.is_empty() {
                    state.status_lines.push(message.clone());
                }
            }
            NormalizedEvent::TodoCreate { items } => {
                if !items.is_empty() {
                    state
                        .status_lines
                        .push(format!("Planning: {} tasks", items.len()));
                    state.todos = items.clone();
                }
            }
            NormalizedEvent::TodoUpdate { items } => {
                if !items.is_empty() {
                    state
                        .status_lines
                        .push(format!("Updated: {} tasks", items.len()));
                    state.todos = items.clone();
                }
            }
            NormalizedEvent::TodoDone { item, index } => {
                state.status_lines.push(todo_done_line(item));
                if let Some(todo) = state.todos.get_mut(*index) {
                    if !item.content.is_empty() {
                        todo.content = item.content.clone();
                    }
                    todo.status = TodoStatus::Completed;
                }
            }
            NormalizedEvent::Usage { usage, total, .. } => {
                let input = usage.input_tokens.unwrap_or(0);
                let output = usage.output_tokens.unwrap_or(0);
                let totals = &mut state.usage;
                if *total {
                    totals.input_tokens = input;
                    totals.output_tokens = output;
                    totals.total_tokens = usage.total_tokens.unwrap_or(input + output);
                } else {
                    totals.input_tokens += input;
                    totals.output_tokens += output;
                    totals.total_tokens = totals.input_tokens + totals.output_tokens;
                }
            }
            NormalizedEvent::Result(result) => {
                if let Some(id) = &result.session_id {
                    state.sdk_session_id = Some(id.clone());
                }
                if let Some(cost) = result.total_cost_usd {
                    state.usage.cost_usd = cost;
                }
                if let Some(usage) = &result.usage {
                    let totals = &mut state.usage;
                    totals.input_tokens = usage.input_tokens.unwrap_or(totals.input_tokens);
                    totals.output_tokens = usage.output_tokens.unwrap_or(totals.output_tokens);
                    totals.total_tokens = usage
                        .total_tokens
                        .unwrap_or(totals.input_tokens + totals.output_tokens);
                }
            }
            _ => {}
        }
        self.record_audit(event);
    }

    pub fn snapshot(&self) -> AccumulatorSnapshot {
        self.state.clone()
    }

    pub fn into_snapshot(self) -> AccumulatorSnapshot {
        self.state
    }

    fn record_audit(&mut self, event: &NormalizedEvent) {
        let (event_type, event_name) = match event {
            NormalizedEvent::ToolUseStart { name, .. } => ("tool_use", Some(name.clone())),
            NormalizedEvent::ToolResult { .. } => ("tool_result", None),
            NormalizedEvent::Result(_) => ("result", None),
            NormalizedEvent::Error { .. } => ("error", None),
            NormalizedEvent::TodoCreate { .. } => ("todo_create", None),
            NormalizedEvent::TodoUpdate { .. } => ("todo_update", None),
            NormalizedEvent::TodoDone { .. } => ("todo_done", None),
            _ => return,
        };
        let data = serde_json::to_value(event)
            .ok()
            .and_then(|mut value| value.get_mut("payload").map(Value::take))
            .unwrap_or(Value::Null);
        self.state.events.push(AuditEvent {
            event_type: event_type.to_string(),
            event_name,
            data,
        });
    }
}

use std::time::Instant;

use mobox_agent_events::{NormalizedEvent, RunResult, TodoItem, TokenUsage};
use serde_json::{json, Value};

use super::frames::{OutputFrame, ProviderMetadata, ReasoningVariant};

const TODO_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Reasoning(ReasoningVariant),
    Text,
}

impl BlockKind {
    fn id_prefix(&self) -> &'static str {
        match self {
            Self::Reasoning(variant) => variant.as_str(),
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone)]
struct OpenBlock {
    kind: BlockKind,
    id: String,
    opened_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Streaming,
    /// An error frame went out; only `finish` remains.
    Errored,
    Finished,
}

/// Turns normalized events into UI stream frames.
///
/// Exactly one block may be open at a time, so a processing block, a thinking
/// block and the text block can never overlap. Closing always precedes opening.
#[derive(Debug)]
pub struct Formatter {
    message_id: String,
    started: bool,
    open: Option<OpenBlock>,
    text_opened: bool,
    next_block: u64,
    phase: Phase,
}

impl Formatter {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            started: false,
            open: None,
            text_opened: false,
            next_block: 0,
            phase: Phase::Streaming,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn open_block(&self) -> Option<(BlockKind, &str)> {
        self.open.as_ref().map(|block| (block.kind, block.id.as_str()))
    }

    pub fn is_terminated(&self) -> bool {
        self.phase != Phase::Streaming
    }

    /// Emits `start` the first time it is called.
    pub fn begin(&mut self) -> Vec<OutputFrame> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        out
    }

    pub fn format(&mut self, event: &NormalizedEvent) -> Vec<OutputFrame> {
        let mut out = Vec::new();
        if self.phase != Phase::Streaming {
            tracing::debug!(kind = %event.kind(), "event after stream termination ignored");
            return out;
        }
        self.ensure_started(&mut out);

        match event {
            NormalizedEvent::Start { .. } => {}
            NormalizedEvent::Status { message } => {
                if !message.is_empty() {
                    self.reasoning(
                        &mut out,
                        ReasoningVariant::Processing,
                        format!("{message}\n"),
                        None,
                    );
                }
            }
            NormalizedEvent::TodoCreate { items } => self.todo_list(&mut out, "Planning", items),
            NormalizedEvent::TodoUpdate { items } => self.todo_list(&mut out, "Updated", items),
            NormalizedEvent::TodoDone { item, .. } => {
                let line = format!("{}\n", todo_done_line(item));
                self.reasoning(&mut out, ReasoningVariant::Processing, line, None);
            }
            NormalizedEvent::ThinkingDelta { delta, .. } => {
                if !delta.is_empty() {
                    self.reasoning(&mut out, ReasoningVariant::Thinking, delta.clone(), None);
                }
            }
            NormalizedEvent::TextDelta { delta } => {
                if !delta.is_empty() {
                    self.text(&mut out, delta);
                }
            }
            NormalizedEvent::ToolUseStart { id, name, input } => {
                out.push(OutputFrame::ToolInputStart {
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                });
                if has_content(input) {
                    out.push(OutputFrame::ToolInputAvailable {
                        tool_call_id: id.clone(),
                        tool_name: name.clone(),
                        input: input.clone(),
                    });
                }
            }
            NormalizedEvent::ToolUseDelta { id, partial_json } => {
                if !partial_json.is_empty() {
                    out.push(OutputFrame::ToolInputDelta {
                        tool_call_id: id.clone(),
                        input_text_delta: partial_json.clone(),
                    });
                }
            }
            NormalizedEvent::ToolUseEnd { id, name, input } => {
                out.push(OutputFrame::ToolInputAvailable {
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                    input: input.clone(),
                });
            }
            NormalizedEvent::ToolResult {
                tool_use_id,
                output,
            } => match tool_use_id {
                Some(id) => out.push(OutputFrame::ToolOutputAvailable {
                    tool_call_id: id.clone(),
                    output: output.clone(),
                }),
                None => tracing::debug!("tool result without a tool call id dropped"),
            },
            NormalizedEvent::Usage {
                usage,
                stop_reason,
                total,
            } => {
                if !usage.is_empty() || stop_reason.is_some() {
                    out.push(OutputFrame::DataUsage {
                        data: usage_data(usage, stop_reason.as_deref(), *total),
                    });
                }
            }
            NormalizedEvent::Result(result) => {
                if result.total_cost_usd.is_some() || result.duration_ms.is_some() {
                    out.push(OutputFrame::DataUsage {
                        data: run_summary(result),
                    });
                }
            }
            NormalizedEvent::Error { message } => {
                self.close_open(&mut out);
                out.push(OutputFrame::error(message.clone()));
                self.phase = Phase::Errored;
            }
            NormalizedEvent::Done => {
                self.close_open(&mut out);
                out.push(OutputFrame::Finish);
                out.push(OutputFrame::Done);
                self.phase = Phase::Finished;
            }
            NormalizedEvent::Raw { payload } => out.push(OutputFrame::DataRaw {
                data: payload.clone(),
                transient: true,
            }),
        }
        out
    }

    /// Closes whatever is open and ends the stream. No-op once finished.
    pub fn finish(&mut self) -> Vec<OutputFrame> {
        let mut out = Vec::new();
        if self.phase == Phase::Finished {
            return out;
        }
        self.ensure_started(&mut out);
        self.close_open(&mut out);
        out.push(OutputFrame::Finish);
        out.push(OutputFrame::Done);
        self.phase = Phase::Finished;
        out
    }

    /// Lazily formats a whole event sequence, finishing the stream if the
    /// events did not.
    pub fn render<I>(mut self, events: I) -> impl Iterator<Item = OutputFrame>
    where
        I: IntoIterator<Item = NormalizedEvent>,
    {
        let mut events = events.into_iter();
        let mut pending = self.begin().into_iter();
        let mut exhausted = false;
        std::iter::from_fn(move || loop {
            if let Some(frame) = pending.next() {
                return Some(frame);
            }
            if exhausted {
                return None;
            }
            pending = match events.next() {
                Some(event) => self.format(&event).into_iter(),
                None => {
                    exhausted = true;
                    self.finish().into_iter()
                }
            };
        })
    }

    fn ensure_started(&mut self, out: &mut Vec<OutputFrame>) {
        if !self.started {
            self.started = true;
            out.push(OutputFrame::Start {
                message_id: self.message_id.clone(),
            });
        }
    }

    fn todo_list(&mut self, out: &mut Vec<OutputFrame>, verb: &str, items: &[TodoItem]) {
        if items.is_empty() {
            return;
        }
        let line = format!("{verb}: {} tasks\n", items.len());
        self.reasoning(
            out,
            ReasoningVariant::Processing,
            line,
            Some(items.to_vec()),
        );
    }

    fn reasoning(
        &mut self,
        out: &mut Vec<OutputFrame>,
        variant: ReasoningVariant,
        delta: String,
        todos: Option<Vec<TodoItem>>,
    ) {
        if self.text_opened {
            tracing::debug!(
                variant = variant.as_str(),
                "reasoning after text started; not rendered"
            );
            return;
        }
        let kind = BlockKind::Reasoning(variant);
        let id = self.switch_to(out, kind);
        let provider_metadata = match todos {
            Some(todos) => ProviderMetadata::with_todos(variant, todos),
            None => ProviderMetadata::variant(variant),
        };
        out.push(OutputFrame::ReasoningDelta {
            id,
            delta,
            provider_metadata,
        });
    }

    fn text(&mut self, out: &mut Vec<OutputFrame>, delta: &str) {
        let id = self.switch_to(out, BlockKind::Text);
        self.text_opened = true;
        out.push(OutputFrame::TextDelta {
            id,
            delta: delta.to_string(),
        });
    }

    /// Makes `kind` the open block, closing any other block first. Returns its id.
    fn switch_to(&mut self, out: &mut Vec<OutputFrame>, kind: BlockKind) -> String {
        if let Some(block) = &self.open {
            if block.kind == kind {
                return block.id.clone();
            }
        }
        self.close_open(out);

        self.next_block += 1;
        let id = format!("{}_{}", kind.id_prefix(), self.next_block);
        out.push(match kind {
            BlockKind::Reasoning(variant) => OutputFrame::ReasoningStart {
                id: id.clone(),
                provider_metadata: ProviderMetadata::variant(variant),
            },
            BlockKind::Text => OutputFrame::TextStart { id: id.clone() },
        });
        self.open = Some(OpenBlock {
            kind,
            id: id.clone(),
            opened_at: Instant::now(),
        });
        id
    }

    fn close_open(&mut self, out: &mut Vec<OutputFrame>) {
        let Some(block) = self.open.take() else {
            return;
        };
        tracing::trace!(
            block_id = %block.id,
            open_ms = block.opened_at.elapsed().as_millis() as u64,
            "block closed"
        );
        out.push(match block.kind {
            BlockKind::Reasoning(variant) => OutputFrame::ReasoningEnd {
                id: block.id,
                provider_metadata: ProviderMetadata::variant(variant),
            },
            BlockKind::Text => OutputFrame::TextEnd { id: block.id },
        });
    }
}

pub(crate) fn todo_done_line(item: &TodoItem) -> String {
    let content = if item.content.is_empty() {
        "Task"
    } else {
        item.content.as_str()
    };
    let preview: String = content.chars().take(TODO_PREVIEW_CHARS).collect();
    format!("Completed: {preview}...")
}

fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn usage_data(usage: &TokenUsage, stop_reason: Option<&str>, total: bool) -> Value {
    json!({
        "inputTokens": usage.input_tokens,
        "outputTokens": usage.output_tokens,
        "reasoningTokens": usage.reasoning_tokens,
        "cachedTokens": usage.cached_tokens,
        "stopReason": stop_reason,
        "isTotal": total,
    })
}

fn run_summary(result: &RunResult) -> Value {
    json!({
        "totalCostUSD": result.total_cost_usd,
        "numTurns": result.num_turns,
        "durationMs": result.duration_ms,
        "sdkSessionId": result.session_id,
        "isError": result.is_error,
    })
}

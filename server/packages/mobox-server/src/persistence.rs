use std::collections::HashMap;

use async_trait::async_trait;
use mobox_agent_events::TodoItem;
use mobox_error::MoboxError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::stream::accumulator::{AccumulatorSnapshot, AuditEvent, UsageTotals};

const TITLE_CHARS: usize = 50;

fn now() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Session title derived from the first prompt.
pub fn title_from_prompt(prompt: &str) -> String {
    let trimmed = prompt.trim();
    let mut title: String = trimmed.chars().take(TITLE_CHARS).collect();
    if trimmed.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    title
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub session_id: String,
    pub message_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub session_id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    pub data: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<TodoItem>>,
}

impl TurnMetadata {
    pub fn is_empty(&self) -> bool {
        self.processing.is_none() && self.thinking.is_none() && self.todos.is_none()
    }
}

/// What the bridge hands to the store when a stream ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedTurn {
    pub content: String,
    pub metadata: TurnMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    #[serde(default)]
    pub events: Vec<AuditEvent>,
}

impl PersistedTurn {
    pub fn from_snapshot(snapshot: AccumulatorSnapshot) -> Self {
        let non_empty = |value: String| (!value.is_empty()).then_some(value);
        Self {
            content: snapshot.text,
            metadata: TurnMetadata {
                processing: (!snapshot.status_lines.is_empty()).then_some(snapshot.status_lines),
                thinking: non_empty(snapshot.thinking),
                todos: (!snapshot.todos.is_empty()).then_some(snapshot.todos),
            },
            usage: (!snapshot.usage.is_empty()).then_some(snapshot.usage),
            sdk_session_id: snapshot.sdk_session_id,
            events: snapshot.events,
        }
    }

    /// An assistant message is only worth storing if the agent produced
    /// something the user can see.
    pub fn has_message(&self) -> bool {
        !self.content.is_empty() || !self.metadata.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub id: Option<String>,
    pub title: String,
    pub agent_id: String,
    pub agent_name: Option<String>,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(&self, session: NewSession) -> Result<Session, MoboxError>;
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, MoboxError>;
    async fn list_sessions(&self) -> Result<Vec<Session>, MoboxError>;
    async fn add_message(
        &self,
        session_id: &str,
        role: Role,
        content: String,
        metadata: Value,
    ) -> Result<ChatMessage, MoboxError>;
    /// Messages oldest first.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, MoboxError>;
    async fn update_title(&self, session_id: &str, title: String) -> Result<(), MoboxError>;
    async fn delete_session(&self, session_id: &str) -> Result<(), MoboxError>;
    async fn save_turn(&self, session_id: &str, turn: PersistedTurn) -> Result<(), MoboxError>;
    async fn usage(&self, session_id: &str) -> Result<Vec<UsageRecord>, MoboxError>;
    async fn events(&self, session_id: &str) -> Result<Vec<StoredEvent>, MoboxError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<ChatMessage>>,
    usage: HashMap<String, Vec<UsageRecord>>,
    events: HashMap<String, Vec<StoredEvent>>,
}

#[derive(Debug, Default)]
pub struct MemoryChatStore {
    state: RwLock<MemoryState>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn session_not_found(session_id: &str) -> MoboxError {
    MoboxError::SessionNotFound {
        session_id: session_id.to_string(),
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_session(&self, new: NewSession) -> Result<Session, MoboxError> {
        let created_at = now();
        let session = Session {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            title: new.title,
            agent_id: new.agent_id,
            agent_name: new.agent_name,
            sdk_session_id: None,
            created_at: created_at.clone(),
            updated_at: created_at,
        };
        let mut state = self.state.write().await;
        if state.sessions.contains_key(&session.id) {
            return Err(MoboxError::InvalidRequest {
                message: format!("session {} already exists", session.id),
            });
        }
        state.sessions.insert(session.id.clone(), session.clone());
        tracing::debug!(session_id = %session.id, agent_id = %session.agent_id, "created session");
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, MoboxError> {
        Ok(self.state.read().await.sessions.get(session_id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, MoboxError> {
        let mut sessions: Vec<_> = self.state.read().await.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn add_message(
        &self,
        session_id: &str,
        role: Role,
        content: String,
        metadata: Value,
    ) -> Result<ChatMessage, MoboxError> {
        let mut state = self.state.write().await;
        let created_at = now();
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        session.updated_at = created_at.clone();
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content,
            metadata,
            created_at,
        };
        state
            .messages
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, MoboxError> {
        let state = self.state.read().await;
        if !state.sessions.contains_key(session_id) {
            return Err(session_not_found(session_id));
        }
        Ok(state.messages.get(session_id).cloned().unwrap_or_default())
    }

    async fn update_title(&self, session_id: &str, title: String) -> Result<(), MoboxError> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        session.title = title;
        session.updated_at = now();
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), MoboxError> {
        let mut state = self.state.write().await;
        if state.sessions.remove(session_id).is_none() {
            return Err(session_not_found(session_id));
        }
        state.messages.remove(session_id);
        state.usage.remove(session_id);
        state.events.remove(session_id);
        tracing::info!(session_id, "deleted session");
        Ok(())
    }

    async fn save_turn(&self, session_id: &str, turn: PersistedTurn) -> Result<(), MoboxError> {
        let message_id = if turn.has_message() {
            let metadata = serde_json::to_value(&turn.metadata).unwrap_or(Value::Null);
            let message = self
                .add_message(session_id, Role::Assistant, turn.content.clone(), metadata)
                .await?;
            Some(message.id)
        } else {
            tracing::debug!(session_id, "turn produced no assistant output");
            None
        };

        let created_at = now();
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        if let Some(sdk_session_id) = &turn.sdk_session_id {
            session.sdk_session_id = Some(sdk_session_id.clone());
        }
        session.updated_at = created_at.clone();

        if let Some(usage) = turn.usage {
            state
                .usage
                .entry(session_id.to_string())
                .or_default()
                .push(UsageRecord {
                    session_id: session_id.to_string(),
                    message_id,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    total_tokens: usage.total_tokens,
                    cost_usd: usage.cost_usd,
                    created_at: created_at.clone(),
                });
        }
        let events = state.events.entry(session_id.to_string()).or_default();
        events.extend(turn.events.into_iter().map(|event| StoredEvent {
            session_id: session_id.to_string(),
            event_type: event.event_type,
            event_name: event.event_name,
            data: event.data,
            created_at: created_at.clone(),
        }));
        Ok(())
    }

    async fn usage(&self, session_id: &str) -> Result<Vec<UsageRecord>, MoboxError> {
        Ok(self
            .state
            .read()
            .await
            .usage
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn events(&self, session_id: &str) -> Result<Vec<StoredEvent>, MoboxError> {
        Ok(self
            .state
            .read()
            .await
            .events
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    UnsupportedFramework,
    AgentNotFound,
    AgentMisconfigured,
    MissingCredentials,
    SessionNotFound,
    NoActiveStream,
    RegistryUnavailable,
    SandboxFailed,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:mobox:error:invalid_request",
            Self::UnsupportedFramework => "urn:mobox:error:unsupported_framework",
            Self::AgentNotFound => "urn:mobox:error:agent_not_found",
            Self::AgentMisconfigured => "urn:mobox:error:agent_misconfigured",
            Self::MissingCredentials => "urn:mobox:error:missing_credentials",
            Self::SessionNotFound => "urn:mobox:error:session_not_found",
            Self::NoActiveStream => "urn:mobox:error:no_active_stream",
            Self::RegistryUnavailable => "urn:mobox:error:registry_unavailable",
            Self::SandboxFailed => "urn:mobox:error:sandbox_failed",
            Self::StreamError => "urn:mobox:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::UnsupportedFramework => "Unsupported Framework",
            Self::AgentNotFound => "Agent Not Found",
            Self::AgentMisconfigured => "Agent Misconfigured",
            Self::MissingCredentials => "Service Temporarily Unavailable",
            Self::SessionNotFound => "Session Not Found",
            Self::NoActiveStream => "No Active Stream",
            Self::RegistryUnavailable => "Stream Registry Unavailable",
            Self::SandboxFailed => "Sandbox Failed",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UnsupportedFramework => 400,
            Self::AgentNotFound => 404,
            Self::AgentMisconfigured => 400,
            Self::MissingCredentials => 500,
            Self::SessionNotFound => 404,
            Self::NoActiveStream => 404,
            Self::RegistryUnavailable => 503,
            Self::SandboxFailed => 502,
            Self::StreamError => 502,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Error shape surfaced to API consumers alongside problem details.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AgentError {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Error)]
pub enum MoboxError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unsupported framework: {framework}")]
    UnsupportedFramework { framework: String },
    #[error("agent '{agent}' not found")]
    AgentNotFound { agent: String },
    #[error("agent '{agent}' is misconfigured: {message}")]
    AgentMisconfigured { agent: String, message: String },
    #[error("missing credentials for agent '{agent}'")]
    MissingCredentials {
        agent: String,
        required: Vec<String>,
    },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("no active stream for session {session_id}")]
    NoActiveStream { session_id: String },
    #[error("stream registry unavailable: {message}")]
    RegistryUnavailable { message: String },
    #[error("sandbox failed for agent '{agent}'")]
    SandboxFailed {
        agent: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl MoboxError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::UnsupportedFramework { .. } => ErrorType::UnsupportedFramework,
            Self::AgentNotFound { .. } => ErrorType::AgentNotFound,
            Self::AgentMisconfigured { .. } => ErrorType::AgentMisconfigured,
            Self::MissingCredentials { .. } => ErrorType::MissingCredentials,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::NoActiveStream { .. } => ErrorType::NoActiveStream,
            Self::RegistryUnavailable { .. } => ErrorType::RegistryUnavailable,
            Self::SandboxFailed { .. } => ErrorType::SandboxFailed,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    pub fn to_agent_error(&self) -> AgentError {
        let (agent, session_id, details) = match self {
            Self::InvalidRequest { .. } => (None, None, None),
            Self::UnsupportedFramework { framework } => {
                let mut map = Map::new();
                map.insert("framework".to_string(), Value::String(framework.clone()));
                (None, None, Some(Value::Object(map)))
            }
            Self::AgentNotFound { agent } => (Some(agent.clone()), None, None),
            Self::AgentMisconfigured { agent, message } => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(message.clone()));
                (Some(agent.clone()), None, Some(Value::Object(map)))
            }
            // Variable names stay server-side; only the agent is reported.
            Self::MissingCredentials { agent, .. } => (Some(agent.clone()), None, None),
            Self::SessionNotFound { session_id } => (None, Some(session_id.clone()), None),
            Self::NoActiveStream { session_id } => (None, Some(session_id.clone()), None),
            Self::RegistryUnavailable { message } | Self::StreamError { message } => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(message.clone()));
                (None, None, Some(Value::Object(map)))
            }
            Self::SandboxFailed {
                agent,
                exit_code,
                stderr,
            } => {
                let mut map = Map::new();
                if let Some(code) = exit_code {
                    map.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stderr) = stderr {
                    map.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
                (
                    Some(agent.clone()),
                    None,
                    if map.is_empty() {
                        None
                    } else {
                        Some(Value::Object(map))
                    },
                )
            }
        };

        AgentError {
            type_: self.error_type(),
            message: self.to_string(),
            agent,
            session_id,
            details,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let detail = match self {
            Self::MissingCredentials { .. } => "Service temporarily unavailable".to_string(),
            other => other.to_string(),
        };
        let mut problem = ProblemDetails::new(self.error_type(), Some(detail));
        let agent_error = self.to_agent_error();

        let mut extensions = Map::new();
        if let Some(agent) = agent_error.agent {
            extensions.insert("agent".to_string(), Value::String(agent));
        }
        if let Some(session_id) = agent_error.session_id {
            extensions.insert("sessionId".to_string(), Value::String(session_id));
        }
        if let Some(details) = agent_error.details {
            extensions.insert("details".to_string(), details);
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<MoboxError> for ProblemDetails {
    fn from(value: MoboxError) -> Self {
        value.to_problem_details()
    }
}

impl From<&MoboxError> for ProblemDetails {
    fn from(value: &MoboxError) -> Self {
        value.to_problem_details()
    }
}

impl From<MoboxError> for AgentError {
    fn from(value: MoboxError) -> Self {
        value.to_agent_error()
    }
}

impl From<&MoboxError> for AgentError {
    fn from(value: &MoboxError) -> Self {
        value.to_agent_error()
    }
}

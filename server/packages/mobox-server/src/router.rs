use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use mobox_error::{AgentError, ErrorType, MoboxError, ProblemDetails};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

use crate::agents::{AgentCatalog, AgentInfo};
use crate::persistence::{title_from_prompt, ChatMessage, ChatStore, NewSession, Role, Session};
use crate::sandbox::{LaunchRequest, Sandbox};
use crate::stream::{OutputFrame, StreamBridge, StreamHub, StreamRegistry, StreamRequest};

mod types;
pub use types::*;

/// Title given to sessions created before their first prompt.
pub const CHAT_TITLE_PLACEHOLDER: &str = "New Chat";
const DEFAULT_PAGE_SIZE: usize = 30;
const MAX_PAGE_SIZE: usize = 100;

pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct AppState {
    catalog: AgentCatalog,
    sandbox: Arc<dyn Sandbox>,
    store: Arc<dyn ChatStore>,
    bridge: StreamBridge,
    env: EnvLookup,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("catalog", &self.catalog)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Resumption is enabled when a registry is supplied.
    pub fn new(
        catalog: AgentCatalog,
        sandbox: Arc<dyn Sandbox>,
        store: Arc<dyn ChatStore>,
        registry: Option<StreamRegistry>,
    ) -> Self {
        let bridge = StreamBridge::new(StreamHub::new(), registry, Some(store.clone()));
        Self {
            catalog,
            sandbox,
            store,
            bridge,
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Replaces the process environment as the source of agent secrets.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    pub fn store(&self) -> Arc<dyn ChatStore> {
        self.store.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/agents", get(list_agents))
        .route("/agents/:agent_id", get(get_agent))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:session_id", delete(delete_session))
        .route("/sessions/:session_id/messages", get(get_messages))
        .route("/chat", post(post_chat))
        .route("/chat/:session_id/stream", get(resume_stream))
        .with_state(shared.clone());

    let mut router = Router::new()
        .nest("/v1", v1_router)
        .fallback(not_found)
        .layer(PropagateRequestIdLayer::x_request_id());

    let http_logging = match std::env::var("MOBOX_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                let request_id = req
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri(),
                    request_id = %request_id
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }
    router = router.layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_agents,
        get_agent,
        list_sessions,
        create_session,
        delete_session,
        get_messages,
        post_chat,
        resume_stream
    ),
    components(
        schemas(
            HealthResponse,
            AgentInfo,
            AgentListResponse,
            Session,
            SessionListResponse,
            CreateSessionRequest,
            DeleteSessionResponse,
            ChatMessage,
            Role,
            PaginatedMessagesResponse,
            ChatRequest,
            ProblemDetails,
            ErrorType,
            AgentError
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "agents", description = "Agent catalog"),
        (name = "sessions", description = "Chat sessions"),
        (name = "chat", description = "Agent turns streamed as UI message frames")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Mobox(#[from] MoboxError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Mobox(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        }
        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(problem),
        )
            .into_response()
    }
}

async fn not_found() -> Response {
    let problem = ProblemDetails::new(ErrorType::InvalidRequest, Some("route not found".to_string()));
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(ProblemDetails {
            status: 404,
            title: "Not Found".to_string(),
            ..problem
        }),
    )
        .into_response()
}

/// Wraps a frame stream in the SSE response the UI client expects.
fn sse_response<S>(frames: S, session_id: &str) -> Response
where
    S: Stream<Item = OutputFrame> + Send + 'static,
{
    let events = frames.map(|frame| Ok::<Event, Infallible>(frame.to_sse_event()));
    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(
        "x-vercel-ai-ui-message-stream",
        HeaderValue::from_static("v1"),
    );
    if let Ok(value) = HeaderValue::from_str(session_id) {
        headers.insert("x-session-id", value);
    }
    response
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/agents",
    responses((status = 200, body = AgentListResponse)),
    tag = "agents"
)]
async fn list_agents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AgentListResponse>, ApiError> {
    let agents = state.catalog.list().await?;
    Ok(Json(AgentListResponse { agents }))
}

#[utoipa::path(
    get,
    path = "/v1/agents/{agent_id}",
    responses(
        (status = 200, body = AgentInfo),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    params(("agent_id" = String, Path, description = "Agent directory name")),
    tag = "agents"
)]
async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentInfo>, ApiError> {
    Ok(Json(state.catalog.load(&agent_id).await?))
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    responses((status = 200, body = SessionListResponse)),
    tag = "sessions"
)]
async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let sessions = state.store.list_sessions().await?;
    Ok(Json(SessionListResponse { sessions }))
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, body = Session),
        (status = 400, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    if request.agent_id.trim().is_empty() {
        return Err(MoboxError::InvalidRequest {
            message: "agentId is required".to_string(),
        }
        .into());
    }
    let session = state
        .store
        .create_session(NewSession {
            id: None,
            title: request
                .title
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| CHAT_TITLE_PLACEHOLDER.to_string()),
            agent_id: request.agent_id,
            agent_name: request.agent_name,
        })
        .await?;
    tracing::info!(session_id = %session.id, agent_id = %session.agent_id, "created session");
    Ok((StatusCode::CREATED, Json(session)))
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}",
    responses(
        (status = 200, body = DeleteSessionResponse),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<DeleteSessionResponse>, ApiError> {
    state.store.delete_session(&session_id).await?;
    Ok(Json(DeleteSessionResponse {
        message: format!("Chat session {session_id} deleted successfully"),
        deleted_id: session_id,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/messages",
    responses(
        (status = 200, body = PaginatedMessagesResponse),
        (status = 404, body = ProblemDetails)
    ),
    params(
        ("session_id" = String, Path, description = "Session id"),
        MessagesQuery
    ),
    tag = "sessions"
)]
async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<PaginatedMessagesResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let requested_offset = query.offset.unwrap_or(0);
    let all = state.store.list_messages(&session_id).await?;
    let total = all.len();
    // Offset 0 means "the newest page", still returned oldest first.
    let offset = if requested_offset == 0 {
        total.saturating_sub(limit)
    } else {
        requested_offset.min(total)
    };
    let messages: Vec<_> = all.into_iter().skip(offset).take(limit).collect();
    let has_more = offset + messages.len() < total;
    Ok(Json(PaginatedMessagesResponse {
        messages,
        total,
        limit,
        offset,
        has_more,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "UI message stream", content_type = "text/event-stream"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 500, body = ProblemDetails),
        (status = 502, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let prompt = request.prompt.trim();
    if prompt.is_empty() {
        return Err(MoboxError::InvalidRequest {
            message: "prompt must not be empty".to_string(),
        }
        .into());
    }
    let requested_id = match request.session_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => {
            Uuid::parse_str(id).map_err(|_| MoboxError::InvalidRequest {
                message: "sessionId must be a UUID".to_string(),
            })?;
            Some(id.to_string())
        }
        _ => None,
    };

    let existing = match &requested_id {
        Some(id) => state.store.get_session(id).await?,
        None => None,
    };
    let agent_id = match (&existing, request.agent_id.as_deref()) {
        (Some(session), _) => session.agent_id.clone(),
        (None, Some(agent_id)) if !agent_id.trim().is_empty() => agent_id.to_string(),
        _ => {
            return Err(MoboxError::InvalidRequest {
                message: "agentId is required when creating a new session".to_string(),
            }
            .into())
        }
    };
    let agent = state.catalog.load(&agent_id).await?;
    let framework = agent.framework()?;

    let is_new = existing.is_none();
    let session = match existing {
        Some(session) => {
            if session.title == CHAT_TITLE_PLACEHOLDER {
                state
                    .store
                    .update_title(&session.id, title_from_prompt(prompt))
                    .await?;
            }
            session
        }
        None => {
            let session = state
                .store
                .create_session(NewSession {
                    id: requested_id,
                    title: title_from_prompt(prompt),
                    agent_id: agent.id.clone(),
                    agent_name: Some(agent.name.clone()),
                })
                .await?;
            tracing::info!(session_id = %session.id, agent_id = %agent.id, "created session for chat");
            session
        }
    };

    state
        .store
        .add_message(&session.id, Role::User, prompt.to_string(), Value::Null)
        .await?;

    let env = agent.resolve_env(|name| (state.env)(name))?;

    let history = if is_new {
        None
    } else {
        let messages = state.store.list_messages(&session.id).await?;
        let history: Vec<Value> = messages
            .iter()
            .map(|message| serde_json::json!({"role": message.role, "content": message.content}))
            .collect();
        serde_json::to_string_pretty(&history).ok()
    };

    let process = state
        .sandbox
        .launch(LaunchRequest {
            session_id: session.id.clone(),
            agent_id: agent.id.clone(),
            agent_dir: agent.dir.clone(),
            command: agent.command.clone(),
            prompt: prompt.to_string(),
            history,
            env,
            timeout: agent.timeout(),
            idle_timeout: agent.idle_timeout(),
        })
        .await
        .map_err(|err| {
            tracing::error!(session_id = %session.id, agent_id = %agent.id, error = %err, "sandbox launch failed");
            err.into_mobox(&agent.id)
        })?;

    let stream_request = StreamRequest {
        session_id: session.id.clone(),
        stream_id: Uuid::new_v4().to_string(),
        message_id: format!("msg_{}", Uuid::new_v4().simple()),
        framework,
    };
    tracing::info!(
        session_id = %stream_request.session_id,
        stream_id = %stream_request.stream_id,
        framework = %framework,
        "starting agent stream"
    );
    let (frames, _task) = state.bridge.start(stream_request, process).await;
    Ok(sse_response(ReceiverStream::new(frames), &session.id))
}

#[utoipa::path(
    get,
    path = "/v1/chat/{session_id}/stream",
    responses(
        (status = 200, description = "Replay of the live stream followed by new frames", content_type = "text/event-stream"),
        (status = 204, description = "No active stream for the session")
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "chat"
)]
async fn resume_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match live_frames(&state, &session_id).await {
        Ok((stream_id, frames)) => {
            tracing::info!(session_id = %session_id, stream_id = %stream_id, "resuming stream");
            sse_response(frames, &session_id)
        }
        Err(err) => {
            tracing::debug!(session_id = %session_id, error = %err, "nothing to resume");
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

/// The registry-tracked stream for a session, if it is still running.
async fn live_frames(
    state: &AppState,
    session_id: &str,
) -> Result<(String, impl Stream<Item = OutputFrame> + Send + 'static), MoboxError> {
    let no_active_stream = || MoboxError::NoActiveStream {
        session_id: session_id.to_string(),
    };
    let registry = state.bridge.registry().ok_or_else(no_active_stream)?;
    let entry = registry.get(session_id).await.map_err(|err| {
        tracing::warn!(session_id = %session_id, error = %err, "stream registry lookup failed");
        MoboxError::from(err)
    })?;
    let entry = entry.ok_or_else(no_active_stream)?;
    let frames = state
        .bridge
        .hub()
        .subscribe(&entry.stream_id)
        .await
        .ok_or_else(no_active_stream)?;
    Ok((entry.stream_id, frames))
}

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use mobox_server::agents::AgentCatalog;
use mobox_server::persistence::{ChatStore, MemoryChatStore, Role};
use mobox_server::router::{build_router, AppState};
use mobox_server::sandbox::ScriptedSandbox;
use mobox_server::stream::StreamRegistry;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

const ECHO_AGENT: &str = r#"
name: Echo
description: Replies politely
framework: deepagents
command: ["python", "agent.py"]
"#;

const KEYED_AGENT: &str = r#"
name: Keyed
framework: claude
env_vars:
  - ANTHROPIC_API_KEY
"#;

struct TestApp {
    app: Router,
    store: Arc<dyn ChatStore>,
    sandbox: ScriptedSandbox,
    _agents_dir: TempDir,
}

impl TestApp {
    fn new() -> Self {
        Self::with_env(|_| None)
    }

    fn with_env<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let agents_dir = tempfile::tempdir().expect("create agents dir");
        write_agent(agents_dir.path(), "echo", ECHO_AGENT);
        write_agent(agents_dir.path(), "keyed", KEYED_AGENT);

        let sandbox = ScriptedSandbox::from_lines([
            json!({"type": "status", "data": {"message": "Reading prompt"}}).to_string(),
            json!({"type": "text", "data": {"content": "Hi there"}}).to_string(),
            json!({"type": "done", "data": {}}).to_string(),
        ]);
        let store: Arc<dyn ChatStore> = Arc::new(MemoryChatStore::new());
        let state = AppState::new(
            AgentCatalog::new(agents_dir.path()),
            Arc::new(sandbox.clone()),
            store.clone(),
            Some(StreamRegistry::in_memory(Duration::from_secs(60))),
        )
        .with_env_lookup(lookup);

        Self {
            app: build_router(state),
            store,
            sandbox,
            _agents_dir: agents_dir,
        }
    }

    /// Persistence finishes just after the client sees `[DONE]`.
    async fn wait_for_messages(&self, session_id: &str, count: usize) -> Vec<Value> {
        for _ in 0..100 {
            let (status, _, body) = send_request(
                &self.app,
                Method::GET,
                &format!("/v1/sessions/{session_id}/messages"),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            let messages = parse_json(&body)["messages"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session {session_id} never reached {count} messages");
    }
}

fn write_agent(root: &Path, id: &str, manifest: &str) {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).expect("create agent dir");
    std::fs::write(dir.join("agent.yaml"), manifest).expect("write manifest");
}

async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let request_body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };

    let request = builder.body(request_body).expect("build request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();

    (status, headers, bytes.to_vec())
}

fn parse_json(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).expect("valid json")
    }
}

/// Payloads of every `data:` line in an SSE body.
fn sse_payloads(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

#[path = "chat_api/chat_stream.rs"]
mod chat_stream;
#[path = "chat_api/sessions.rs"]
mod sessions;

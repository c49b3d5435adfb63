use super::*;

#[tokio::test]
async fn chat_streams_ui_message_frames() {
    let test_app = TestApp::new();
    let (status, headers, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({"prompt": "Say hi", "agentId": "echo"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(header_str(&headers, "content-type").starts_with("text/event-stream"));
    assert_eq!(header_str(&headers, "cache-control"), "no-cache");
    assert_eq!(header_str(&headers, "x-accel-buffering"), "no");
    assert_eq!(header_str(&headers, "x-vercel-ai-ui-message-stream"), "v1");
    assert!(!header_str(&headers, "x-request-id").is_empty());
    let session_id = header_str(&headers, "x-session-id").to_string();
    assert!(uuid::Uuid::parse_str(&session_id).is_ok());

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    let types: Vec<String> = payloads[..payloads.len() - 1]
        .iter()
        .map(|payload| {
            serde_json::from_str::<Value>(payload).expect("json frame")["type"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    assert_eq!(
        types,
        vec![
            "start",
            "reasoning-start",
            "reasoning-delta",
            "reasoning-end",
            "text-start",
            "text-delta",
            "text-end",
            "finish",
        ]
    );
    let start: Value = serde_json::from_str(&payloads[0]).expect("start frame");
    assert!(start["messageId"]
        .as_str()
        .is_some_and(|id| id.starts_with("msg_")));
    let reasoning: Value = serde_json::from_str(&payloads[2]).expect("reasoning delta");
    assert_eq!(reasoning["delta"], "Reading prompt\n");
    assert_eq!(reasoning["providerMetadata"]["mobox"]["variant"], "processing");

    let messages = test_app.wait_for_messages(&session_id, 2).await;
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "Say hi");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "Hi there");
    assert_eq!(
        messages[1]["metadata"]["processing"],
        json!(["Reading prompt"])
    );

    let launches = test_app.sandbox.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].prompt, "Say hi");
    assert_eq!(launches[0].session_id, session_id);
    assert!(launches[0].history.is_none());
    assert_eq!(launches[0].command, vec!["python", "agent.py"]);
}

#[tokio::test]
async fn follow_up_turn_sends_history() {
    let test_app = TestApp::new();
    let (_, headers, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({"prompt": "Say hi", "agentId": "echo"})),
    )
    .await;
    let session_id = header_str(&headers, "x-session-id").to_string();
    test_app.wait_for_messages(&session_id, 2).await;

    // The session remembers its agent; no agentId needed.
    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({"prompt": "And again", "sessionId": session_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    test_app.wait_for_messages(&session_id, 4).await;

    let launches = test_app.sandbox.launches();
    assert_eq!(launches.len(), 2);
    let history: Vec<Value> =
        serde_json::from_str(launches[1].history.as_deref().expect("history")).expect("json");
    assert_eq!(
        history,
        vec![
            json!({"role": "user", "content": "Say hi"}),
            json!({"role": "assistant", "content": "Hi there"}),
            json!({"role": "user", "content": "And again"}),
        ]
    );
}

#[tokio::test]
async fn chat_with_client_chosen_session_id() {
    let test_app = TestApp::new();
    let session_id = uuid::Uuid::new_v4().to_string();
    let (status, headers, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({"prompt": "Hello", "agentId": "echo", "sessionId": session_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(header_str(&headers, "x-session-id"), session_id);

    let session = test_app
        .store
        .get_session(&session_id)
        .await
        .expect("get session")
        .expect("session created");
    assert_eq!(session.agent_id, "echo");
    assert_eq!(session.agent_name.as_deref(), Some("Echo"));
    assert_eq!(session.title, "Hello");
}

#[tokio::test]
async fn chat_rejects_bad_requests() {
    let test_app = TestApp::new();
    let cases = [
        (
            json!({"prompt": "hi"}),
            StatusCode::BAD_REQUEST,
            "agentId is required when creating a new session",
        ),
        (
            json!({"prompt": "   ", "agentId": "echo"}),
            StatusCode::BAD_REQUEST,
            "prompt must not be empty",
        ),
        (
            json!({"prompt": "hi", "agentId": "echo", "sessionId": "not-a-uuid"}),
            StatusCode::BAD_REQUEST,
            "sessionId must be a UUID",
        ),
        (
            json!({"prompt": "hi", "agentId": "ghost"}),
            StatusCode::NOT_FOUND,
            "ghost",
        ),
        (
            json!({"prompt": "hi", "agentId": "../echo"}),
            StatusCode::NOT_FOUND,
            "../echo",
        ),
    ];

    for (body, expected, detail) in cases {
        let (status, headers, bytes) =
            send_request(&test_app.app, Method::POST, "/v1/chat", Some(body.clone())).await;
        assert_eq!(status, expected, "request {body}");
        assert_eq!(
            header_str(&headers, "content-type"),
            "application/problem+json"
        );
        let problem = parse_json(&bytes);
        assert_eq!(problem["status"], expected.as_u16());
        assert!(
            problem["detail"]
                .as_str()
                .is_some_and(|text| text.contains(detail)),
            "detail {problem} should mention {detail}"
        );
    }
    assert!(test_app.sandbox.launches().is_empty());
}

#[tokio::test]
async fn missing_credentials_hide_details() {
    let test_app = TestApp::new();
    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({"prompt": "hi", "agentId": "keyed"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let problem = parse_json(&body);
    assert_eq!(problem["detail"], "Service temporarily unavailable");
    assert!(!problem.to_string().contains("ANTHROPIC_API_KEY"));
    assert!(test_app.sandbox.launches().is_empty());
}

#[tokio::test]
async fn credentials_are_forwarded_from_lookup() {
    let test_app = TestApp::with_env(|name| {
        (name == "ANTHROPIC_API_KEY").then(|| "sk-test".to_string())
    });
    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({"prompt": "hi", "agentId": "keyed"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sse_payloads(&body).last().map(String::as_str), Some("[DONE]"));

    let launches = test_app.sandbox.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(
        launches[0].env.get("ANTHROPIC_API_KEY").map(String::as_str),
        Some("sk-test")
    );
}

#[tokio::test]
async fn resume_without_active_stream_is_no_content() {
    let test_app = TestApp::new();
    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/chat/unknown-session/stream",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());

    // A finished stream is no longer resumable.
    let (_, headers, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({"prompt": "Say hi", "agentId": "echo"})),
    )
    .await;
    let session_id = header_str(&headers, "x-session-id").to_string();
    test_app.wait_for_messages(&session_id, 2).await;

    let uri = format!("/v1/chat/{session_id}/stream");
    let mut status = StatusCode::OK;
    for _ in 0..100 {
        (status, _, _) = send_request(&test_app.app, Method::GET, &uri, None).await;
        if status == StatusCode::NO_CONTENT {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn stored_user_message_uses_trimmed_prompt() {
    let test_app = TestApp::new();
    let (_, headers, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({"prompt": "  padded prompt \n", "agentId": "echo"})),
    )
    .await;
    let session_id = header_str(&headers, "x-session-id").to_string();
    let messages = test_app
        .store
        .list_messages(&session_id)
        .await
        .expect("messages");
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "padded prompt");
}

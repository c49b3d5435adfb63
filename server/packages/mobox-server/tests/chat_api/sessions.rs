use super::*;

async fn seed_messages(test_app: &TestApp, count: usize) -> String {
    let (status, _, body) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({"agentId": "echo"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = parse_json(&body)["id"]
        .as_str()
        .expect("session id")
        .to_string();
    for n in 0..count {
        test_app
            .store
            .add_message(&session_id, Role::User, format!("m{n}"), Value::Null)
            .await
            .expect("add message");
    }
    session_id
}

fn contents(page: &Value) -> Vec<String> {
    page["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .map(|message| message["content"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let test_app = TestApp::new();
    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body), json!({"status": "healthy"}));

    let (status, headers, body) =
        send_request(&test_app.app, Method::GET, "/v1/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        header_str(&headers, "content-type"),
        "application/problem+json"
    );
    assert_eq!(parse_json(&body)["status"], 404);
}

#[tokio::test]
async fn openapi_document_lists_chat_routes() {
    let test_app = TestApp::new();
    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    let doc = parse_json(&body);
    assert!(doc["paths"]["/v1/chat"]["post"].is_object());
    assert!(doc["paths"]["/v1/chat/{session_id}/stream"]["get"].is_object());
}

#[tokio::test]
async fn agents_are_listed_by_name() {
    let test_app = TestApp::new();
    let (status, _, body) = send_request(&test_app.app, Method::GET, "/v1/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    let agents = parse_json(&body)["agents"].clone();
    let names: Vec<_> = agents
        .as_array()
        .expect("agents")
        .iter()
        .map(|agent| agent["name"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(names, vec!["Echo", "Keyed"]);

    let (status, _, body) =
        send_request(&test_app.app, Method::GET, "/v1/agents/keyed", None).await;
    assert_eq!(status, StatusCode::OK);
    let agent = parse_json(&body);
    assert_eq!(agent["framework"], "claude");
    assert_eq!(agent["envVars"], json!(["ANTHROPIC_API_KEY"]));
    assert_eq!(agent["timeoutSecs"], 600);
    assert!(agent.get("command").is_none());

    let (status, _, _) =
        send_request(&test_app.app, Method::GET, "/v1/agents/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn placeholder_title_is_replaced_by_first_prompt() {
    let test_app = TestApp::new();
    let session_id = seed_messages(&test_app, 0).await;
    let session = test_app
        .store
        .get_session(&session_id)
        .await
        .expect("get")
        .expect("session");
    assert_eq!(session.title, "New Chat");

    let long_prompt = "Summarize the quarterly numbers for every region we operate in";
    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/chat",
        Some(json!({"prompt": long_prompt, "sessionId": session_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, _, body) = send_request(&test_app.app, Method::GET, "/v1/sessions", None).await;
    let sessions = parse_json(&body)["sessions"].clone();
    assert_eq!(sessions[0]["id"], session_id.as_str());
    let title = sessions[0]["title"].as_str().expect("title");
    assert!(title.ends_with("..."));
    assert_eq!(title.chars().count(), 53);
}

#[tokio::test]
async fn create_session_requires_agent() {
    let test_app = TestApp::new();
    let (status, _, _) = send_request(
        &test_app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({"agentId": " "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn messages_default_to_newest_page() {
    let test_app = TestApp::new();
    let session_id = seed_messages(&test_app, 35).await;
    let uri = format!("/v1/sessions/{session_id}/messages");

    let (status, _, body) = send_request(&test_app.app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let page = parse_json(&body);
    assert_eq!(page["total"], 35);
    assert_eq!(page["limit"], 30);
    assert_eq!(page["offset"], 5);
    assert_eq!(page["hasMore"], false);
    let newest = contents(&page);
    assert_eq!(newest.len(), 30);
    assert_eq!(newest.first().map(String::as_str), Some("m5"));
    assert_eq!(newest.last().map(String::as_str), Some("m34"));

    let (_, _, body) =
        send_request(&test_app.app, Method::GET, &format!("{uri}?limit=10&offset=5"), None).await;
    let page = parse_json(&body);
    assert_eq!(page["offset"], 5);
    assert_eq!(page["hasMore"], true);
    assert_eq!(contents(&page).first().map(String::as_str), Some("m5"));
    assert_eq!(contents(&page).len(), 10);

    let (_, _, body) =
        send_request(&test_app.app, Method::GET, &format!("{uri}?limit=500"), None).await;
    assert_eq!(parse_json(&body)["limit"], 100);

    let (_, _, body) =
        send_request(&test_app.app, Method::GET, &format!("{uri}?limit=0"), None).await;
    let page = parse_json(&body);
    assert_eq!(page["limit"], 1);
    assert_eq!(contents(&page), vec!["m34".to_string()]);
}

#[tokio::test]
async fn messages_for_unknown_session_are_not_found() {
    let test_app = TestApp::new();
    let (status, _, body) = send_request(
        &test_app.app,
        Method::GET,
        "/v1/sessions/missing/messages",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse_json(&body)["sessionId"], "missing");
}

#[tokio::test]
async fn delete_session_removes_history() {
    let test_app = TestApp::new();
    let session_id = seed_messages(&test_app, 3).await;
    let uri = format!("/v1/sessions/{session_id}");

    let (status, _, body) = send_request(&test_app.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        parse_json(&body),
        json!({
            "message": format!("Chat session {session_id} deleted successfully"),
            "deletedId": session_id,
        })
    );

    let (status, _, _) = send_request(&test_app.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = send_request(
        &test_app.app,
        Method::GET,
        &format!("{uri}/messages"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

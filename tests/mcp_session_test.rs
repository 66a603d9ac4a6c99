//! Session lifecycle tests against a mock MCP server.

mod common;

use common::mock_mcp::{named_tool, MockMcpConfig, MockMcpServer};
use mcp_completions_gateway::{
    config::ClientInfo,
    mcp::{McpError, McpSessionManager},
};
use serde_json::json;

fn manager() -> McpSessionManager {
    McpSessionManager::new(reqwest::Client::new(), ClientInfo::default())
}

#[tokio::test]
async fn handshake_discovers_tools_once() {
    let server = MockMcpServer::start(MockMcpConfig::default()).await;
    let sessions = manager();

    let tools = sessions.tools(&server.url(), None).await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "search");
    assert_eq!(tools[0].description.as_deref(), Some("Web search"));
    assert!(tools[0].input_schema.is_some());
    assert_eq!(server.init_count(), 1);

    // Second lookup reuses the cached session.
    sessions.tools(&server.url(), None).await.unwrap();
    assert_eq!(server.init_count(), 1);
}

#[tokio::test]
async fn tool_call_carries_the_session_id() {
    let server = MockMcpServer::start(MockMcpConfig::default()).await;
    let sessions = manager();

    let payload = sessions
        .call_tool(&server.url(), None, "search", json!({"q": "x"}))
        .await
        .unwrap();
    assert_eq!(payload["result"]["content"][0]["text"], json!("found"));

    let calls = server.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["name"], json!("search"));
    assert_eq!(calls[0]["arguments"], json!({"q": "x"}));
    assert_eq!(calls[0]["session"], json!("sess-1"));
}

#[tokio::test]
async fn expired_session_is_dropped_and_reinitialized() {
    let server = MockMcpServer::start(MockMcpConfig {
        expire_first_call: true,
        ..Default::default()
    })
    .await;
    let sessions = manager();

    let err = sessions
        .call_tool(&server.url(), None, "search", json!({"q": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::SessionExpired));
    assert_eq!(
        err.to_string(),
        "Session expired, please retry the request"
    );
    assert_eq!(server.init_count(), 1);

    // The next use re-initialises and goes through.
    sessions
        .call_tool(&server.url(), None, "search", json!({"q": "x"}))
        .await
        .unwrap();
    assert_eq!(server.init_count(), 2);
    assert_eq!(server.calls().len(), 1);
    // A fresh session id was issued for the retry.
    assert_eq!(server.calls()[0]["session"], json!("sess-2"));
}

#[tokio::test]
async fn unauthorized_call_names_the_host() {
    let server = MockMcpServer::start(MockMcpConfig {
        required_auth: Some("Bearer good".to_string()),
        ..Default::default()
    })
    .await;
    let sessions = manager();

    // Initialise with valid credentials, then present a bad token on the
    // call itself.
    sessions
        .tools(&server.url(), Some("Bearer good"))
        .await
        .unwrap();
    let err = sessions
        .call_tool(&server.url(), Some("Bearer bad"), "search", json!({}))
        .await
        .unwrap_err();

    match err {
        McpError::Auth(host) => assert_eq!(host, "127.0.0.1"),
        other => panic!("expected auth error, got: {}", other),
    }
}

#[tokio::test]
async fn init_failure_when_auth_is_missing() {
    let server = MockMcpServer::start(MockMcpConfig {
        required_auth: Some("Bearer good".to_string()),
        ..Default::default()
    })
    .await;
    let sessions = manager();

    let err = sessions.tools(&server.url(), None).await.unwrap_err();
    assert!(matches!(err, McpError::Http { status: 401, .. }));
}

#[tokio::test]
async fn event_stream_responses_are_parsed() {
    let server = MockMcpServer::start(MockMcpConfig {
        sse_responses: true,
        ..Default::default()
    })
    .await;
    let sessions = manager();

    let tools = sessions.tools(&server.url(), None).await.unwrap();
    assert_eq!(tools.len(), 1);

    let payload = sessions
        .call_tool(&server.url(), None, "search", json!({"q": "x"}))
        .await
        .unwrap();
    assert_eq!(payload["result"]["content"][0]["text"], json!("found"));
}

#[tokio::test]
async fn rpc_error_during_listing_fails_initialization() {
    let server = MockMcpServer::start(MockMcpConfig {
        tools: vec![named_tool("a")],
        fail_tools_list: true,
        ..Default::default()
    })
    .await;
    let sessions = manager();

    let err = sessions.tools(&server.url(), None).await.unwrap_err();
    match err {
        McpError::Rpc(message) => assert!(message.contains("listing unavailable")),
        other => panic!("expected rpc error, got: {}", other),
    }
}

#[tokio::test]
async fn unreachable_server_is_a_connect_error() {
    let sessions = manager();
    let err = sessions
        .tools("http://127.0.0.1:1/mcp", None)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Connect(_)));
}

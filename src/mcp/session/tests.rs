use super::*;
use crate::mcp::test_support::{stdio_config, FakeServer, MemoryTransport};
use serde_json::json;

fn object_schema() -> Value {
    json!({"type": "object", "properties": {"q": {"type": "string"}}})
}

async fn establish(server: FakeServer) -> (McpSession, Arc<MemoryTransport>) {
    let transport = MemoryTransport::new(Arc::new(server));
    let session = McpSession::establish(
        &stdio_config("alpha"),
        transport.clone(),
        SessionOptions::default(),
    )
    .await
    .expect("handshake");
    (session, transport)
}

#[tokio::test]
async fn handshake_sends_initialize_then_initialized() {
    let (session, transport) = establish(FakeServer::new("alpha")).await;

    assert_eq!(
        transport.sent_methods(),
        vec!["initialize", "notifications/initialized"]
    );
    let initialize = &transport.sent_messages()[0];
    assert_eq!(initialize["params"]["clientInfo"]["name"], "mcpchat");

    let identity = session.identity().expect("identity");
    assert_eq!(identity.name, "alpha");
    assert_eq!(identity.protocol_version, "2025-06-18");
    assert!(session.is_alive());
    session.ping().await.expect("ping");
}

#[tokio::test]
async fn list_tools_follows_cursors() {
    let mut server = FakeServer::new("alpha");
    for index in 0..5 {
        server = server.with_tool(&format!("tool_{index}"), object_schema());
    }
    server.page_size = Some(2);
    let (session, transport) = establish(server).await;

    let tools = session.list_tools().await.expect("tools");
    let names: Vec<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();
    assert_eq!(names, vec!["tool_0", "tool_1", "tool_2", "tool_3", "tool_4"]);
    assert_eq!(
        transport
            .sent_methods()
            .iter()
            .filter(|method| *method == "tools/list")
            .count(),
        3
    );
}

#[tokio::test]
async fn tool_lists_are_capped() {
    let mut server = FakeServer::new("alpha");
    for index in 0..(MCP_MAX_LIST_ITEMS + 20) {
        server = server.with_tool(&format!("tool_{index}"), object_schema());
    }
    server.page_size = Some(30);
    let (session, _) = establish(server).await;

    let tools = session.list_tools().await.expect("tools");
    assert_eq!(tools.len(), MCP_MAX_LIST_ITEMS);
}

#[tokio::test]
async fn unsupported_list_is_empty() {
    let (session, _) = establish(FakeServer::new("alpha")).await;
    assert!(session.list_prompts().await.expect("prompts").is_empty());
}

#[tokio::test]
async fn tool_failures_are_distinct_from_channel_failures() {
    let server = FakeServer::new("alpha")
        .with_tool("explode", object_schema())
        .with_handler(|_, _| {
            Ok(json!({
                "content": [{"type": "text", "text": "kaboom"}],
                "isError": true
            }))
        });
    let (session, transport) = establish(server).await;

    let err = session
        .call_tool("explode", Map::new())
        .await
        .expect_err("tool error");
    assert!(matches!(&err, SessionError::Tool { message, .. } if message == "kaboom"));
    assert!(!err.is_connection_failure());

    let err = session
        .call_tool("missing", Map::new())
        .await
        .expect_err("unknown tool");
    assert!(matches!(&err, SessionError::Tool { message, .. } if message.contains("Unknown tool")));

    transport.sever();
    let err = session
        .call_tool("explode", Map::new())
        .await
        .expect_err("severed channel");
    assert!(err.is_connection_failure());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!session.is_alive());
    assert_eq!(session.channel_error().as_deref(), Some("MCP channel closed."));
}

#[tokio::test]
async fn call_tool_passes_arguments() {
    let server = FakeServer::new("alpha")
        .with_tool("echo", object_schema())
        .with_handler(|_, args| {
            Ok(json!({
                "content": [{"type": "text", "text": args["q"].as_str().unwrap_or("-")}]
            }))
        });
    let (session, _) = establish(server).await;

    let mut args = Map::new();
    args.insert("q".to_string(), json!("hello"));
    let output = session.call_tool("echo", args).await.expect("call");
    assert_eq!(output.joined_text(), "hello");
}

#[tokio::test]
async fn concurrent_calls_are_correlated_by_id() {
    let server = FakeServer::new("alpha")
        .with_tool("echo", object_schema())
        .with_handler(|_, args| {
            Ok(json!({
                "content": [{"type": "text", "text": args["q"].as_str().unwrap_or("-")}]
            }))
        });
    let (session, _) = establish(server).await;
    let session = Arc::new(session);

    let calls = (0..10).map(|index| {
        let session = session.clone();
        tokio::spawn(async move {
            let mut args = Map::new();
            args.insert("q".to_string(), json!(format!("call-{index}")));
            let output = session.call_tool("echo", args).await.expect("call");
            (index, output.joined_text())
        })
    });
    for handle in calls {
        let (index, text) = handle.await.expect("join");
        assert_eq!(text, format!("call-{index}"));
    }
}

#[tokio::test]
async fn prompts_and_resources_round_trip() {
    let mut server = FakeServer::new("alpha");
    server.resources = vec![json!({
        "uri": "file:///notes.txt",
        "name": "notes",
        "mimeType": "text/plain"
    })];
    let (session, _) = establish(server).await;

    let resources = session.list_resources().await.expect("resources");
    assert_eq!(resources[0].uri, "file:///notes.txt");

    let read = session
        .read_resource("file:///notes.txt")
        .await
        .expect("read");
    assert_eq!(
        read.contents[0].text.as_deref(),
        Some("contents of file:///notes.txt")
    );

    let prompt = session
        .get_prompt(
            "explain",
            HashMap::from([("topic".to_string(), "tides".to_string())]),
        )
        .await
        .expect("prompt");
    assert_eq!(
        prompt.messages[0].content.as_text(),
        Some("Tell me about tides")
    );
}

#[tokio::test]
async fn unanswered_requests_time_out() {
    let server = FakeServer::new("alpha")
        .with_tool("slow", object_schema())
        .silent_on("tools/call");
    let transport = MemoryTransport::new(Arc::new(server));
    let session = McpSession::establish(
        &stdio_config("alpha"),
        transport,
        SessionOptions {
            request_timeout: Duration::from_millis(50),
        },
    )
    .await
    .expect("handshake");

    let err = session
        .call_tool("slow", Map::new())
        .await
        .expect_err("timeout");
    assert!(matches!(
        err,
        SessionError::Transport(TransportError::Timeout(_))
    ));
    assert!(session.pending.lock().await.is_empty());
    assert!(session.is_alive());
}

#[tokio::test]
async fn closed_session_rejects_calls() {
    let (session, transport) = establish(FakeServer::new("alpha")).await;
    session.close().await.expect("close");

    assert_eq!(transport.close_count(), 1);
    assert!(!session.is_alive());
    assert!(matches!(
        session.list_tools().await,
        Err(SessionError::Closed)
    ));
}

#[tokio::test]
async fn handshake_failure_surfaces_as_error() {
    let transport =
        MemoryTransport::new(Arc::new(FakeServer::new("alpha").silent_on("initialize")));
    let result = McpSession::establish(
        &stdio_config("alpha"),
        transport,
        SessionOptions {
            request_timeout: Duration::from_millis(50),
        },
    )
    .await;
    assert!(matches!(
        result,
        Err(SessionError::Transport(TransportError::Timeout(_)))
    ));
}

use super::{
    apply_custom_headers, apply_json_post_headers, apply_protocol_version_header, encode_message,
    ensure_success, require_url, McpTransport, TransportError, MCP_SESSION_ID_HEADER,
};
use crate::core::config::McpServerConfig;
use crate::mcp::protocol::server_messages_from_value;
use crate::utils::sse::{is_event_stream_content_type, sse_data_payload, SseLineBuffer};
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SESSION_DELETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Streamable HTTP: every client message is a POST; replies arrive either as
/// a JSON body or as an event stream on that POST's response.
pub struct StreamableHttpTransport {
    server_id: String,
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: StdMutex<Option<String>>,
    protocol_version: StdMutex<Option<String>>,
    inbound_tx: mpsc::UnboundedSender<ServerMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<ServerMessage>>,
    cancel: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(config: &McpServerConfig, client: reqwest::Client) -> Result<Self, TransportError> {
        let url = require_url(config)?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            server_id: config.id.clone(),
            client,
            url,
            headers: config.headers.clone().unwrap_or_default(),
            session_id: StdMutex::new(None),
            protocol_version: StdMutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            cancel: CancellationToken::new(),
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn protocol_version(&self) -> Option<String> {
        self.protocol_version.lock().ok().and_then(|guard| guard.clone())
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = apply_custom_headers(
            apply_protocol_version_header(builder, self.protocol_version().as_deref()),
            &self.headers,
        );
        if let Some(session_id) = self.session_id() {
            builder = builder.header(MCP_SESSION_ID_HEADER, session_id);
        }
        builder
    }

    fn remember_session_id(&self, response: &reqwest::Response) {
        let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
        else {
            return;
        };
        if let Ok(mut guard) = self.session_id.lock() {
            if guard.as_deref() != Some(session_id.as_str()) {
                debug!(server_id = %self.server_id, "MCP HTTP session established");
                *guard = Some(session_id);
            }
        }
    }
}

/// Forwards every message from an event-stream response body until the body
/// ends or the transport is cancelled.
fn spawn_event_stream_pump(
    server_id: String,
    response: reqwest::Response,
    inbound: mpsc::UnboundedSender<ServerMessage>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        let mut buffer = SseLineBuffer::default();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => return,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    for line in buffer.push(&chunk) {
                        forward_data_line(&line, &inbound);
                    }
                }
                Some(Err(err)) => {
                    debug!(server_id = %server_id, error = %err, "MCP HTTP event stream failed");
                    return;
                }
                None => {
                    for line in buffer.finish() {
                        forward_data_line(&line, &inbound);
                    }
                    return;
                }
            }
        }
    });
}

fn forward_data_line(line: &str, inbound: &mpsc::UnboundedSender<ServerMessage>) {
    let Some(payload) = sse_data_payload(line) else {
        return;
    };
    if payload.is_empty() {
        return;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        for message in server_messages_from_value(value) {
            let _ = inbound.send(message);
        }
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let payload = encode_message(&message)?;
        debug!(server_id = %self.server_id, url = %self.url, "Sending MCP HTTP message");

        let response = self
            .request(apply_json_post_headers(self.client.post(&self.url)))
            .body(payload)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        self.remember_session_id(&response);

        if response.status() == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            spawn_event_stream_pump(
                self.server_id.clone(),
                response,
                self.inbound_tx.clone(),
                self.cancel.clone(),
            );
            return Ok(());
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(value) => {
                for message in server_messages_from_value(value) {
                    let _ = self.inbound_tx.send(message);
                }
            }
            Err(err) => {
                debug!(server_id = %self.server_id, error = %err, "Ignoring non-JSON MCP HTTP body");
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<ServerMessage, TransportError> {
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            message = inbound.recv() => message.ok_or(TransportError::Closed),
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.cancel.cancel();

        if self.session_id().is_none() {
            return Ok(());
        }
        let request = self
            .request(self.client.delete(&self.url))
            .timeout(SESSION_DELETE_TIMEOUT);
        match request.send().await {
            Ok(response) => {
                debug!(server_id = %self.server_id, status = %response.status(), "MCP HTTP session deleted");
            }
            Err(err) => {
                debug!(server_id = %self.server_id, error = %err, "MCP HTTP session delete failed");
            }
        }
        Ok(())
    }

    fn set_protocol_version(&self, protocol_version: &str) {
        if let Ok(mut guard) = self.protocol_version.lock() {
            *guard = Some(protocol_version.to_string());
        }
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::McpTransportKind;
    use crate::mcp::protocol::{initialized_notification, request_message, response_id};
    use crate::mcp::transport::build_mcp_http_client;
    use crate::mcp::transport::test_server::{bind, read_request, respond, CapturedRequest};
    use rust_mcp_schema::schema_utils::RequestFromClient;
    use rust_mcp_schema::RequestId;

    fn ping(id: i64) -> ClientMessage {
        request_message(RequestFromClient::PingRequest(None), RequestId::Integer(id))
            .expect("ping message")
    }

    fn transport_for(url: &str) -> StreamableHttpTransport {
        let mut config =
            McpServerConfig::remote("remote", "Remote", McpTransportKind::StreamableHttp, url);
        config.headers = Some(HashMap::from([(
            "Authorization".to_string(),
            "Bearer secret".to_string(),
        )]));
        let client = build_mcp_http_client(Some(Duration::from_secs(5))).expect("client");
        StreamableHttpTransport::new(&config, client).expect("transport")
    }

    #[tokio::test]
    async fn routes_json_and_event_stream_replies_and_tracks_session() {
        let (listener, url) = bind().await;
        let (captured_tx, mut captured_rx) = mpsc::unbounded_channel::<CapturedRequest>();

        tokio::spawn(async move {
            for index in 0..3 {
                let (mut stream, _) = listener.accept().await.expect("accept");
                let Some(request) = read_request(&mut stream).await else {
                    return;
                };
                let _ = captured_tx.send(request);
                match index {
                    0 => {
                        respond(
                            &mut stream,
                            "200 OK",
                            "application/json",
                            "mcp-session-id: session-1\r\n",
                            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
                        )
                        .await
                    }
                    1 => {
                        respond(
                            &mut stream,
                            "202 Accepted",
                            "application/json",
                            "",
                            "",
                        )
                        .await
                    }
                    _ => {
                        respond(
                            &mut stream,
                            "200 OK",
                            "Text/Event-Stream; Charset=UTF-8",
                            "",
                            "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\n\n",
                        )
                        .await
                    }
                }
            }
        });

        let transport = transport_for(&url);
        transport.send(ping(1)).await.expect("first send");
        let first = transport.receive().await.expect("json reply");
        assert_eq!(response_id(&first), Some(&RequestId::Integer(1)));

        transport.set_protocol_version("2025-06-18");
        transport
            .send(initialized_notification().expect("notification"))
            .await
            .expect("notification send");
        transport.send(ping(2)).await.expect("second send");
        let second = transport.receive().await.expect("sse reply");
        assert_eq!(response_id(&second), Some(&RequestId::Integer(2)));

        let initial = captured_rx.recv().await.expect("captured initial");
        assert!(initial.request_line.starts_with("POST "));
        assert_eq!(initial.header("authorization"), Some("Bearer secret"));
        assert_eq!(
            initial.header("accept"),
            Some("application/json, text/event-stream")
        );
        assert_eq!(initial.header("mcp-session-id"), None);
        assert_eq!(initial.json()["method"], "ping");

        let notification = captured_rx.recv().await.expect("captured notification");
        assert_eq!(notification.header("mcp-session-id"), Some("session-1"));
        assert_eq!(notification.header("mcp-protocol-version"), Some("2025-06-18"));
        assert_eq!(notification.json()["method"], "notifications/initialized");
    }

    #[tokio::test]
    async fn non_success_status_is_an_http_error() {
        let (listener, url) = bind().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let _ = read_request(&mut stream).await;
            respond(&mut stream, "401 Unauthorized", "text/plain", "", "nope").await;
        });

        let transport = transport_for(&url);
        let err = transport.send(ping(1)).await.expect_err("401 must fail");
        match err {
            TransportError::Http { status, body } => {
                assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
                assert_eq!(body, "nope");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_unblocks_receive() {
        let transport = transport_for("http://127.0.0.1:9/mcp");
        transport.close().await.expect("close");
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport.send(ping(1)).await,
            Err(TransportError::Closed)
        ));
    }
}

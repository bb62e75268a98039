use super::{
    apply_custom_headers, apply_json_post_headers, encode_message, ensure_success, require_url,
    McpTransport, TransportError, MCP_EVENT_STREAM_ACCEPT,
};
use crate::core::config::McpServerConfig;
use crate::mcp::protocol::server_messages_from_value;
use crate::utils::sse::{SseEvent, SseEventDecoder, SseLineBuffer};
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const ENDPOINT_EVENT: &str = "endpoint";
const MESSAGE_EVENT: &str = "message";

/// Legacy HTTP+SSE transport: one long-lived GET stream carries server
/// messages, and client messages are POSTed to the endpoint the stream
/// announces first.
pub struct SseTransport {
    server_id: String,
    client: reqwest::Client,
    endpoint: reqwest::Url,
    headers: HashMap<String, String>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<ServerMessage>>,
    cancel: CancellationToken,
}

impl SseTransport {
    /// Opens the event stream and waits for the `endpoint` event.
    pub async fn connect(
        config: &McpServerConfig,
        client: reqwest::Client,
    ) -> Result<Self, TransportError> {
        let url = require_url(config)?;
        let stream_url = reqwest::Url::parse(&url).map_err(|err| TransportError::InvalidEndpoint {
            endpoint: url.clone(),
            reason: err.to_string(),
        })?;
        let headers = config.headers.clone().unwrap_or_default();

        let request = apply_custom_headers(
            client
                .get(stream_url.clone())
                .header("Accept", MCP_EVENT_STREAM_ACCEPT),
            &headers,
        );
        let response = ensure_success(request.send().await?).await?;
        debug!(server_id = %config.id, url = %stream_url, "MCP SSE stream opened");

        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        spawn_listener(
            config.id.clone(),
            response,
            endpoint_tx,
            inbound_tx,
            cancel.clone(),
        );

        let announced = endpoint_rx.await.map_err(|_| TransportError::MissingEndpoint)?;
        let endpoint = stream_url
            .join(announced.trim())
            .map_err(|err| TransportError::InvalidEndpoint {
                endpoint: announced.clone(),
                reason: err.to_string(),
            })?;
        debug!(server_id = %config.id, endpoint = %endpoint, "MCP SSE endpoint announced");
        guard.disarm();

        Ok(Self {
            server_id: config.id.clone(),
            client,
            endpoint,
            headers,
            inbound_rx: Mutex::new(inbound_rx),
            cancel,
        })
    }
}

fn spawn_listener(
    server_id: String,
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    inbound: mpsc::UnboundedSender<ServerMessage>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        let mut lines = SseLineBuffer::default();
        let mut decoder = SseEventDecoder::default();
        let mut endpoint_tx = Some(endpoint_tx);

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => break,
            };
            let batch = match chunk {
                Some(Ok(chunk)) => lines.push(&chunk),
                Some(Err(err)) => {
                    debug!(server_id = %server_id, error = %err, "MCP SSE stream failed");
                    break;
                }
                None => {
                    let rest = lines.finish();
                    for line in rest {
                        if let Some(event) = decoder.decode_line(&line) {
                            route_event(&server_id, event, &mut endpoint_tx, &inbound);
                        }
                    }
                    break;
                }
            };
            for line in batch {
                if let Some(event) = decoder.decode_line(&line) {
                    route_event(&server_id, event, &mut endpoint_tx, &inbound);
                }
            }
        }
        debug!(server_id = %server_id, "MCP SSE listener stopped");
    });
}

fn route_event(
    server_id: &str,
    event: SseEvent,
    endpoint_tx: &mut Option<oneshot::Sender<String>>,
    inbound: &mpsc::UnboundedSender<ServerMessage>,
) {
    match event.event.as_str() {
        ENDPOINT_EVENT => {
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(event.data);
            }
        }
        MESSAGE_EVENT => match serde_json::from_str::<serde_json::Value>(&event.data) {
            Ok(value) => {
                for message in server_messages_from_value(value) {
                    let _ = inbound.send(message);
                }
            }
            Err(err) => {
                debug!(server_id = %server_id, error = %err, "Ignoring malformed MCP SSE message");
            }
        },
        other => {
            debug!(server_id = %server_id, event = %other, "Ignoring MCP SSE event");
        }
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let payload = encode_message(&message)?;
        let request = apply_custom_headers(
            apply_json_post_headers(self.client.post(self.endpoint.clone())),
            &self.headers,
        )
        .body(payload);
        ensure_success(request.send().await?).await?;
        debug!(server_id = %self.server_id, "MCP SSE message posted");
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
        self.cancel.cancel();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::McpTransportKind;
    use crate::mcp::protocol::{request_message, response_id};
    use crate::mcp::transport::build_mcp_http_client;
    use crate::mcp::transport::test_server::{bind, read_request, respond};
    use rust_mcp_schema::schema_utils::RequestFromClient;
    use rust_mcp_schema::RequestId;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn resolves_endpoint_and_routes_messages() {
        let (listener, url) = bind().await;
        let (posted_tx, mut posted_rx) = mpsc::unbounded_channel::<(String, serde_json::Value)>();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept stream");
            let _ = read_request(&mut stream).await;
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n";
            stream.write_all(head.as_bytes()).await.expect("head");
            stream
                .write_all(b"event: endpoint\ndata: /messages?sessionId=abc\n\n")
                .await
                .expect("endpoint");
            stream.flush().await.expect("flush");

            let (mut post, _) = listener.accept().await.expect("accept post");
            let request = read_request(&mut post).await.expect("post request");
            let _ = posted_tx.send((request.request_line.clone(), request.json()));
            respond(&mut post, "202 Accepted", "text/plain", "", "Accepted").await;

            stream
                .write_all(b"event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\n\n")
                .await
                .expect("message");
            stream.flush().await.expect("flush");
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let config = McpServerConfig::remote(
            "legacy",
            "Legacy",
            McpTransportKind::Sse,
            format!("{url}/sse"),
        );
        let client = build_mcp_http_client(None).expect("client");
        let transport = SseTransport::connect(&config, client)
            .await
            .expect("connect");
        assert_eq!(
            transport.endpoint.as_str(),
            format!("{url}/messages?sessionId=abc")
        );

        let message = request_message(RequestFromClient::PingRequest(None), RequestId::Integer(3))
            .expect("ping");
        transport.send(message).await.expect("post");

        let (request_line, body) = posted_rx.recv().await.expect("posted");
        assert!(request_line.starts_with("POST /messages?sessionId=abc"));
        assert_eq!(body["method"], "ping");

        let reply = transport.receive().await.expect("reply");
        assert_eq!(response_id(&reply), Some(&RequestId::Integer(3)));

        transport.close().await.expect("close");
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn stream_without_endpoint_fails_to_connect() {
        let (listener, url) = bind().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let _ = read_request(&mut stream).await;
            respond(
                &mut stream,
                "200 OK",
                "text/event-stream",
                "",
                "event: message\ndata: {}\n\n",
            )
            .await;
        });

        let config = McpServerConfig::remote("legacy", "Legacy", McpTransportKind::Sse, url);
        let client = build_mcp_http_client(None).expect("client");
        assert!(matches!(
            SseTransport::connect(&config, client).await,
            Err(TransportError::MissingEndpoint)
        ));
    }
}

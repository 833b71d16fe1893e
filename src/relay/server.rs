//! WebSocket control connections.
//!
//! `GET /ws` upgrades to a WebSocket. Every socket is one control connection
//! with its own [`SessionRouter`]: inbound text frames go to the router, a
//! writer task serializes the router's outbound frames back onto the socket,
//! and when the socket closes the router is torn down.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::web::Data;
use poem::web::websocket::{Message, WebSocket, WebSocketStream};
use poem::{Endpoint, EndpointExt, IntoResponse, Route, Server, get, handler};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::error::Result;
use super::router::{Registry, SessionRouter};
use super::types::OutboundFrame;

#[handler]
fn health() -> &'static str {
    "ok"
}

#[handler]
fn control_socket(ws: WebSocket, registry: Data<&Arc<Registry>>) -> impl IntoResponse {
    let registry = registry.0.clone();
    ws.on_upgrade(move |socket| run_connection(socket, registry))
}

async fn run_connection(socket: WebSocketStream, registry: Arc<Registry>) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let router = SessionRouter::new(registry, outbound_tx);
    let identity = router.identity().to_string();
    info!("Control connection {} opened", identity);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => router.handle_text(&text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => router.handle_text(text),
                Err(_) => debug!("Dropped non-UTF-8 binary frame from {}", identity),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Control connection {} read error: {}", identity, e);
                break;
            }
        }
    }

    router.teardown().await;
    writer.abort();
    info!("Control connection {} closed", identity);
}

/// HTTP routes: the control socket and a health probe.
pub fn app(registry: Arc<Registry>) -> impl Endpoint {
    Route::new()
        .at("/ws", get(control_socket))
        .at("/health", get(health))
        .data(registry)
        .with(Tracing)
}

/// Serve control connections on `0.0.0.0:<port>` until the server stops.
pub async fn serve(port: u16, registry: Arc<Registry>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!("Session relay listening on {}", addr);

    Server::new(TcpListener::bind(addr))
        .name("Session Relay")
        .run(app(registry))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ssh::RemoteShellPool;
    use crate::relay::ssh::pool::tests::FakeConnector;
    use crate::relay::tail::LogTailer;
    use crate::relay::terminal::LocalTerminalPool;
    use crate::relay::terminal::direct::DirectBackend;
    use crate::relay::terminal::manager::tests::settings;
    use poem::test::TestClient;
    use std::time::Duration;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::from_parts(
            RemoteShellPool::new(Arc::new(FakeConnector)),
            LocalTerminalPool::with_backend(Arc::new(DirectBackend), settings()),
            LogTailer::new(Duration::from_millis(10)),
        ))
    }

    mod routes {
        use super::*;

        #[tokio::test]
        async fn test_health() {
            let client = TestClient::new(app(registry()));
            let resp = client.get("/health").send().await;
            resp.assert_status_is_ok();
            resp.assert_text("ok").await;
        }

        #[tokio::test]
        async fn test_ws_requires_upgrade() {
            let client = TestClient::new(app(registry()));
            let resp = client.get("/ws").send().await;
            assert!(!resp.0.status().is_success());
        }
    }
}

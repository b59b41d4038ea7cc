//! The WebSocket endpoint.
//!
//! One reader loop per connection plus a writer task draining the
//! connection's outbound channel. Unparseable frames get a
//! `res{ok:false}` with id `"unknown"`; everything else runs through
//! the server's request pipeline.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use pv_protocol::{ResponseMessage, WireMessage};

use crate::server::{GatewayServer, RequestContext};

/// Constant-time token comparison via SHA-256 digests; hashing
/// normalizes lengths so `ct_eq` always compares 32 bytes.
fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Optional pre-shared token; checked only when the server has
    /// one configured.
    pub token: Option<String>,
}

/// GET /ws — upgrade to the gateway protocol.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<GatewayServer>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let expected = server.gateway.config.default_config().server.token;
    if !expected.is_empty() {
        let provided = query.token.as_deref().unwrap_or("");
        if !token_eq(provided, &expected) {
            return (
                axum::http::StatusCode::UNAUTHORIZED,
                "invalid or missing token",
            )
                .into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, server))
        .into_response()
}

async fn handle_socket(socket: WebSocket, server: Arc<GatewayServer>) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (connection, mut outbound_rx) = server.gateway.connections.accept().await;
    let connection_id = connection.connection_id.clone();

    // Writer task: drain the outbound channel into the socket.
    let writer = tokio::spawn(async move {
        while let Some(json) = outbound_rx.recv().await {
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let ctx = RequestContext {
        connection_id: Some(connection_id.clone()),
        user_id: "default_user".into(),
    };

    // Reader loop.
    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => match WireMessage::parse(&text) {
                Ok(WireMessage::Request(request)) => {
                    let response = server.handle_request(&ctx, request).await;
                    connection.send_response(response);
                }
                Ok(other) => {
                    tracing::warn!(
                        connection_id = %connection_id,
                        frame = ?std::mem::discriminant(&other),
                        "unexpected frame type from client"
                    );
                }
                Err(e) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "bad frame");
                    connection.send_response(ResponseMessage::invalid_format(e));
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                connection.touch();
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    server.gateway.connections.disconnect(&connection_id).await;
}

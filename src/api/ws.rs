// =============================================================================
// WebSocket Handler — live event stream for arena subscribers
// =============================================================================
//
// Clients connect to `/api/v1/arena/ws?token=<token>` and receive:
//   1. A replay of the last 500 non-tick events (the orchestrator ring).
//   2. Every event from then on, including per-tick composite state.
//
// Each connection registers as an orchestrator subscriber. The subscriber
// sink must never block, so it only pushes onto an unbounded channel; this
// task drains the channel into the socket. Connecting to a paused session
// resumes it; the last connection dropping starts the auto-pause clock.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::api::ApiContext;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Upgrade handler; the token rides in the query string.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<ApiContext>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if !validate_token(&query.token.unwrap_or_default()) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted");
    ws.on_upgrade(move |socket| handle_connection(socket, ctx))
        .into_response()
}

async fn handle_connection(socket: WebSocket, ctx: Arc<ApiContext>) {
    let (mut sender, mut receiver) = socket.split();

    // Replay the ring before going live so late subscribers can rebuild.
    for event in ctx.orchestrator.event_buffer() {
        if let Ok(text) = serde_json::to_string(&event) {
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
    }

    // Live subscription: the sink is a non-blocking channel push.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let subscriber_id = ctx
        .orchestrator
        .subscribe(Box::new(move |event| {
            if let Ok(text) = serde_json::to_string(event) {
                let _ = tx.send(text);
            }
        }))
        .await;

    loop {
        tokio::select! {
            // ── Drain events to the socket ──────────────────────────────
            maybe_text = rx.recv() => {
                match maybe_text {
                    Some(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            debug!("WebSocket send failed; disconnecting");
                            break;
                        }
                    }
                    None => break,
                }
            }

            // ── Handle incoming frames ──────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket closed by client");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/binary/pong frames need no action.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error; disconnecting");
                        break;
                    }
                }
            }
        }
    }

    ctx.orchestrator.unsubscribe(subscriber_id);
    debug!(subscriber_id, "WebSocket cleanup complete");
}

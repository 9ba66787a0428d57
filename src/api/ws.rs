// =============================================================================
// WebSocket Handler — engine events and state snapshots for the UI
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate full StateSnapshot on connect.
//   2. A fresh snapshot whenever the state version changes (checked every
//      500 ms), wrapped as {"type":"snapshot", ...}.
//   3. Every engine event (connected, disconnected, trade-detected,
//      trade-executed, trade-skipped, error, log) as it happens.
//
// Ping frames get Pong replies; a lagging client skips missed events rather
// than stalling the engine.
// =============================================================================

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::api::rest::ApiContext;

/// Snapshot change-detection cadence.
const PUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Upgrade handler; token comes as a query parameter because headers are
/// awkward for browser WebSocket clients.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ApiContext>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if !validate_token(&query.token.unwrap_or_default()) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted");
    ws.on_upgrade(move |socket| handle_connection(socket, ctx))
        .into_response()
}

async fn handle_connection(socket: WebSocket, ctx: ApiContext) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = ctx.state.events.subscribe();

    // Initial snapshot.
    let mut last_version = ctx.state.current_state_version();
    if send_snapshot(&mut sender, &ctx).await.is_err() {
        return;
    }

    let mut push = interval(PUSH_INTERVAL);

    loop {
        tokio::select! {
            // ── Engine events, forwarded as they happen ─────────────────
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "WebSocket client lagged; events skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            // ── Snapshot push on version change ─────────────────────────
            _ = push.tick() => {
                let version = ctx.state.current_state_version();
                if version != last_version {
                    if send_snapshot(&mut sender, &ctx).await.is_err() {
                        break;
                    }
                    last_version = version;
                }
            }

            // ── Client frames ───────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }
}

/// Serialize and send the current snapshot, tagged for the client.
async fn send_snapshot<S>(sender: &mut S, ctx: &ApiContext) -> Result<(), ()>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let snapshot = ctx.state.build_snapshot();
    let mut wrapped = match serde_json::to_value(&snapshot) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to serialize snapshot");
            return Ok(());
        }
    };
    if let Some(obj) = wrapped.as_object_mut() {
        obj.insert("type".to_string(), serde_json::json!("snapshot"));
    }

    sender
        .send(Message::Text(wrapped.to_string()))
        .await
        .map_err(|e| {
            debug!(error = %e, "WebSocket send failed");
        })
}

//! Duplex channel upgrade and bridge loop.
//!
//! A split sender/receiver over an axum `WebSocket`, fanned in with
//! `tokio::select!` between a broadcast subscription (PTY output) and parsed
//! inbound messages carrying `{"type": ...}` input/resize/init frames.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::pty::PtyPipeline;
use crate::router::{client_id, AppState};
use crate::session::Session;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    cols: Option<u16>,
    rows: Option<u16>,
}

/// Client -> server control frame. A frame that fails to parse as this shape
/// is treated as raw PTY input.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Init {
        commands: Vec<String>,
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default)]
        silent: Option<bool>,
    },
}

#[derive(Serialize)]
struct InitCompleteFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn channel_upgrade(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ChannelQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let client = client_id(&headers, Some(peer));
    let channel_id = Uuid::new_v4();

    if let Err(e) = state.rate_limiter.admit_channel(&client, channel_id) {
        return e.into_response();
    }

    let attached = match state.sessions.attach(id).await {
        Ok(a) => a,
        Err(e) => {
            state.rate_limiter.release_channel(&client, channel_id);
            return e.into_response();
        }
    };

    let cols = query.cols.unwrap_or(80);
    let rows = query.rows.unwrap_or(24);
    if let Err(e) = attached.pty.resize(cols, rows) {
        warn!(session = %id, error = %e, "initial resize failed");
    }

    ws.on_upgrade(move |socket| {
        bridge(
            socket,
            state,
            attached.session,
            attached.pty,
            attached.needs_init,
            client,
            channel_id,
        )
    })
}

async fn bridge(
    socket: WebSocket,
    state: AppState,
    session: Arc<Session>,
    pty: Arc<PtyPipeline>,
    needs_init: bool,
    client: String,
    channel_id: Uuid,
) {
    let (mut sender, mut receiver) = socket.split();
    use futures_util::{SinkExt, StreamExt};

    let _ = sender
        .send(Message::Text(
            json!({"type": "connected", "sessionId": session.id, "environment": session.environment}).to_string(),
        ))
        .await;

    if needs_init {
        let result = state.sessions.run_init(&session, &pty).await;
        let frame = match &result {
            Ok(()) => InitCompleteFrame { kind: "initComplete", success: true, error: None },
            Err(e) => InitCompleteFrame { kind: "initComplete", success: false, error: Some(e.clone()) },
        };
        if sender
            .send(Message::Text(serde_json::to_string(&frame).unwrap_or_default()))
            .await
            .is_err()
        {
            cleanup(&state, &session, &client, channel_id).await;
            return;
        }
    }

    let mut output = pty.subscribe_output();

    loop {
        tokio::select! {
            chunk = output.recv() => {
                match chunk {
                    Ok(bytes) => {
                        state.sessions.touch(session.id);
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(session = %session.id, skipped, "output subscriber lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = pty.wait_exited() => {
                let _ = sender
                    .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                        code: 1000,
                        reason: "shell exited".into(),
                    })))
                    .await;
                break;
            }
            incoming = receiver.next() => {
                let Some(incoming) = incoming else { break };
                let msg = match incoming {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(session = %session.id, error = %e, "channel receive error");
                        break;
                    }
                };
                match msg {
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Text(text) => {
                        if !handle_inbound_text(&state, &session, &pty, &client, &mut sender, text).await {
                            break;
                        }
                    }
                    Message::Binary(data) => {
                        if admit_command(&state, &session, &client, &mut sender).await {
                            state.sessions.touch(session.id);
                            if pty.write_input(data).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    cleanup(&state, &session, &client, channel_id).await;
}

/// Returns `false` if the bridge loop should terminate (write failure).
async fn handle_inbound_text(
    state: &AppState,
    session: &Arc<Session>,
    pty: &Arc<PtyPipeline>,
    client: &str,
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    text: String,
) -> bool {
    use futures_util::SinkExt;

    if !admit_command(state, session, client, sender).await {
        return true;
    }
    state.sessions.touch(session.id);

    match serde_json::from_str::<ClientFrame>(&text) {
        Ok(ClientFrame::Input { data }) => pty.write_input(data.into_bytes()).is_ok(),
        Ok(ClientFrame::Resize { cols, rows }) => {
            let _ = pty.resize(cols, rows);
            true
        }
        Ok(ClientFrame::Init { commands, silent, .. }) => {
            pty.set_silent(silent.unwrap_or(true));
            let mut ok = true;
            for cmd in commands {
                let mut line = cmd.into_bytes();
                line.push(b'\n');
                if pty.write_input(line).is_err() {
                    ok = false;
                    break;
                }
            }
            pty.set_silent(false);
            ok
        }
        // Not valid control JSON: treated as raw input.
        Err(_) => pty.write_input(text.into_bytes()).is_ok(),
    }
}

/// Checks the per-client command rate limit; on rejection, sends an `error`
/// control frame and returns `false` so the caller skips the message's effect
/// without tearing down the channel.
async fn admit_command(
    state: &AppState,
    session: &Arc<Session>,
    client: &str,
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) -> bool {
    use futures_util::SinkExt;

    if let Err(e) = state.rate_limiter.admit_command(client) {
        debug!(session = %session.id, client, "command rate limit hit");
        let AppError::TooManyRequests { reason, .. } = &e else { return true };
        let _ = sender
            .send(Message::Text(json!({"type": "error", "message": reason}).to_string()))
            .await;
        return false;
    }
    true
}

async fn cleanup(state: &AppState, session: &Arc<Session>, client: &str, channel_id: Uuid) {
    state.rate_limiter.release_channel(client, channel_id);
    state.sessions.mark_channel_closed(session.id);
    info!(session = %session.id, "channel detached");
}

//! Bidirectional conversation endpoint
//!
//! `/ws/conversation/{conversation_id}?token=<token>`. The gate runs before
//! anything else; a rejected connection closes with its 4xxx code and never
//! sees an envelope. An admitted connection gets a single-writer task (all
//! envelopes flow through one channel, so server→client order is exactly
//! construction order), a registry entry that supersedes any prior
//! connection, and a session actor that owns the pipeline.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use super::auth::verify_connection;
use super::registry::Outbound;
use super::ServerState;
use crate::pipeline::SessionActor;
use crate::protocol::{decode_client_envelope, ClientPayload, ServerEnvelope, ERR_MALFORMED};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

pub async fn ws_handler(
    Path(conversation_id): Path<i64>,
    Query(query): Query<WsQuery>,
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, state, conversation_id, query.token))
}

async fn handle_session(mut socket: WebSocket, state: ServerState, conv_id: i64, token: String) {
    let user_id = match verify_connection(&state.store, &state.jwt_secret, conv_id, &token).await {
        Ok(user_id) => user_id,
        Err(rejection) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: rejection.close_code(),
                    reason: rejection.reason().into(),
                })))
                .await;
            return;
        }
    };
    info!(conv_id, user_id, "conversation connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(64);

    // Single writer: every server envelope for this connection goes through
    // this task, so per-connection ordering is the channel's send order
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Envelope(envelope) => {
                    let text = serde_json::to_string(&envelope).unwrap_or_default();
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                    break;
                }
            }
        }
    });

    let cancelled = Arc::new(Notify::new());
    let ticket = state.registry.admit(conv_id, tx.clone(), cancelled.clone());
    let _ = state.store.set_ws_connected(conv_id, true).await;
    let _ = state.store.touch_last_active(conv_id).await;

    let actor = SessionActor::new(
        conv_id,
        user_id,
        state.config.clone(),
        state.store.clone(),
        state.registry.clone(),
        state.providers.clone(),
    );
    actor.announce_state().await;

    // A session seeded with an initial user message starts its first turn
    // without waiting for audio
    if let Ok(Some(session)) = state.store.load_session(conv_id).await {
        if let Some(initial) = session.initial_user_message {
            if !initial.trim().is_empty() {
                actor.clone().spawn_turn(initial).await;
            }
        }
    }

    let idle_timeout = Duration::from_secs(state.config.pipeline.idle_timeout_secs);
    let mut idle_deadline = tokio::time::Instant::now() + idle_timeout;
    let mut listening_check = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = cancelled.notified() => {
                debug!(conv_id, "superseded by a new connection");
                break;
            }
            _ = listening_check.tick() => {
                if actor.listening_timed_out() {
                    info!(conv_id, "listening timeout");
                    let _ = tx.send(Outbound::Close { code: 1000, reason: "Listening timeout".to_string() }).await;
                    break;
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                info!(conv_id, "idle timeout");
                let _ = tx.send(Outbound::Close { code: 1000, reason: "Idle timeout".to_string() }).await;
                break;
            }
            received = ws_rx.next() => {
                idle_deadline = tokio::time::Instant::now() + idle_timeout;
                match received {
                    None => break,
                    Some(Err(e)) => {
                        debug!(conv_id, "socket error: {}", e);
                        break;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(conv_id, "closed by client");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => handle_envelope(&actor, conv_id, text.as_str()).await,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    actor.shutdown().await;
    // Only clear the connected flag if this registration is still current;
    // a superseding admit owns it now otherwise
    if state.registry.remove(conv_id, ticket) {
        let _ = state.store.set_ws_connected(conv_id, false).await;
    }
    writer.abort();
    info!(conv_id, "conversation disconnected");
}

async fn handle_envelope(actor: &Arc<SessionActor>, conv_id: i64, raw: &str) {
    let envelope = match decode_client_envelope(raw, conv_id) {
        Ok(envelope) => envelope,
        Err(reason) => {
            debug!(conv_id, "rejected envelope: {}", reason);
            actor.send(ServerEnvelope::error(conv_id, ERR_MALFORMED, &reason, true)).await;
            return;
        }
    };

    match envelope.payload {
        ClientPayload::Ping {} => actor.on_ping().await,
        ClientPayload::ClientHello { audio } => actor.on_client_hello(audio).await,
        ClientPayload::MicStart { stream_id } => actor.clone().on_mic_start(&stream_id).await,
        ClientPayload::UserAudioChunk { stream_id, seq, data_b64, .. } => {
            actor.clone().on_audio_chunk(&stream_id, seq, &data_b64).await
        }
        ClientPayload::MicEnd { stream_id, last_seq } => actor.on_mic_end(&stream_id, last_seq).await,
        ClientPayload::Image { image_url } => actor.on_image(&image_url).await,
        ClientPayload::Interrupt {} => actor.on_interrupt().await,
    }
}

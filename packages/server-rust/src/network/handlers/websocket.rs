//! Realtime WebSocket endpoint.
//!
//! A connection registers in `Connecting`, must send `AUTH` within the auth
//! timeout, and only then joins its authorized rooms. Frames are named
//! `MsgPack` in binary messages. Outbound traffic goes through the
//! connection's bounded channel and a dedicated write task, so slow sockets
//! never block room emitters.

use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use hse_core::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::AppState;
use crate::realtime::{ConnectionHandle, OutboundMessage};

/// Close code for policy violations (RFC 6455 §7.4.1).
const POLICY_VIOLATION: u16 = 1008;

/// Upgrades to a realtime connection. Refused while the server is not ready.
pub async fn ws_upgrade_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if !state.shutdown.health_state().accepts_traffic() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let cfg = &state.config.connection;
    ws.write_buffer_size(cfg.ws_write_buffer_size)
        .max_write_buffer_size(cfg.ws_max_write_buffer_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let _in_flight = state.shutdown.in_flight_guard();
    let cfg = state.config.connection.clone();
    let (handle, rx) = state.rooms.registry().register(&cfg);
    metrics::gauge!("hse_realtime_connections").increment(1.0);
    debug!(connection_id = %handle.id, "realtime connection opened");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, rx, cfg.send_timeout));

    tokio::select! {
        () = run_session(&state, &handle, stream) => {}
        // Socket gone, or a close frame was written.
        _ = &mut writer => {}
    }

    let id = handle.id;
    state.rooms.disconnect(id);
    // Last sender: the write loop flushes what is queued and exits.
    drop(handle);
    if !writer.is_finished() {
        let _ = tokio::time::timeout(cfg.send_timeout, writer).await;
    }
    metrics::gauge!("hse_realtime_connections").decrement(1.0);
    debug!(connection_id = %id, "realtime connection closed");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundMessage>,
    send_timeout: Duration,
) {
    while let Some(msg) = rx.recv().await {
        let (message, last) = match msg {
            OutboundMessage::Binary(bytes) => (Message::Binary(bytes.into()), false),
            OutboundMessage::Close(reason) => (
                Message::Close(Some(CloseFrame {
                    code: POLICY_VIOLATION,
                    reason: reason.unwrap_or_default().into(),
                })),
                true,
            ),
        };
        match tokio::time::timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) if !last => {}
            _ => break,
        }
    }
    let _ = sink.close().await;
}

/// Queues `frame` on the connection. `false` if it could not be delivered.
async fn reply(handle: &ConnectionHandle, frame: &ServerFrame, timeout: Duration) -> bool {
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(connection_id = %handle.id, error = %e, "failed to encode realtime frame");
            return false;
        }
    };
    handle
        .send_timeout(OutboundMessage::Binary(bytes), timeout)
        .await
        .is_ok()
}

async fn fail_auth(state: &AppState, handle: &ConnectionHandle, error: &str) {
    state.rooms.reject(handle, error);
    let timeout = state.config.connection.send_timeout;
    let frame = ServerFrame::AuthFail {
        error: error.to_string(),
    };
    if reply(handle, &frame, timeout).await {
        let _ = handle
            .send_timeout(OutboundMessage::Close(Some(error.to_string())), timeout)
            .await;
    }
}

/// Next client frame. `None` when the socket closed or errored.
/// Undecodable frames yield `Some(None)`.
async fn next_frame<S, E>(stream: &mut S) -> Option<Option<ClientFrame>>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    loop {
        match stream.next().await? {
            Ok(Message::Binary(bytes)) => return Some(ClientFrame::decode(&bytes).ok()),
            Ok(Message::Text(_)) => return Some(None),
            Ok(Message::Close(_)) | Err(_) => return None,
            // Transport-level ping/pong is answered by the socket itself.
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
        }
    }
}

/// Drives one connection's inbound side: authentication, then room
/// membership and heartbeats until the socket closes, idles out, or the
/// server drains.
async fn run_session<S, E>(state: &AppState, handle: &ConnectionHandle, mut stream: S)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    let cfg = &state.config.connection;
    let mut shutdown = state.shutdown.shutdown_receiver();

    if !state.rooms.begin_auth(handle) {
        return;
    }
    let first = tokio::time::timeout(cfg.auth_timeout, next_frame(&mut stream)).await;
    let token = match first {
        Err(_) => return fail_auth(state, handle, "authentication timeout").await,
        Ok(None) => return,
        Ok(Some(Some(ClientFrame::Auth { token }))) => token,
        Ok(Some(_)) => return fail_auth(state, handle, "first frame must be AUTH").await,
    };
    let principal = match state.verifier.verify(&token) {
        Ok(principal) => principal,
        Err(e) => return fail_auth(state, handle, &e.to_string()).await,
    };
    let rooms = state.rooms.authorize(handle, principal);
    if !reply(handle, &ServerFrame::AuthAck { rooms }, cfg.send_timeout).await {
        return;
    }

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                let _ = handle.try_send(OutboundMessage::Close(Some("server shutting down".into())));
                return;
            }
            next = tokio::time::timeout(cfg.idle_timeout, next_frame(&mut stream)) => next,
        };
        let frame = match frame {
            Err(_) => {
                debug!(connection_id = %handle.id, "closing idle realtime connection");
                let _ = handle.try_send(OutboundMessage::Close(Some("idle timeout".into())));
                return;
            }
            Ok(None) => return,
            Ok(Some(frame)) => frame,
        };
        handle.metadata.write().last_heartbeat = Instant::now();

        let response = match frame {
            Some(ClientFrame::Subscribe { room }) => match state.rooms.subscribe(handle, &room) {
                Ok(room) => ServerFrame::Subscribed { room },
                Err(e) => ServerFrame::SubscribeDenied {
                    room,
                    error: e.to_string(),
                },
            },
            Some(ClientFrame::Unsubscribe { room }) => {
                match state.rooms.unsubscribe(handle, &room) {
                    Ok(room) => ServerFrame::Unsubscribed { room },
                    Err(e) => ServerFrame::SubscribeDenied {
                        room,
                        error: e.to_string(),
                    },
                }
            }
            Some(ClientFrame::Ping { timestamp }) => ServerFrame::Pong { timestamp },
            Some(ClientFrame::Auth { .. }) => {
                debug!(connection_id = %handle.id, "ignoring repeated AUTH frame");
                continue;
            }
            None => {
                debug!(connection_id = %handle.id, "ignoring undecodable realtime frame");
                continue;
            }
        };
        if !reply(handle, &response, cfg.send_timeout).await {
            return;
        }
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session (client): framed bidirectional message transport.
//!
//! An inbound reader and an outbound writer run as independent concurrent
//! tasks sharing only the outbound queue and a `done` cancellation signal —
//! holding a lock across either task's network I/O is never required, since
//! the Broadcaster reaches this connection only by enqueuing into the same
//! bounded `outbound_tx` the router's direct responses also use, keeping a
//! single serialization point for everything this connection ever writes.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::router::{self, InboundContext, InboundEnvelope};
use crate::state::AppState;

/// Depth of the per-session outbound queue. Bounded so a stalled client
/// cannot grow server memory without limit; broadcast traffic drops past
/// this point per the Broadcaster's own policy, while this connection's own
/// request/response traffic applies backpressure to itself only.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Drives one client connection end to end: splits the socket, spawns the
/// outbound writer, runs the inbound reader inline, and tears down
/// subscriptions on exit regardless of why the connection ended.
pub async fn run(state: Arc<AppState>, socket: WebSocket) {
    let session_key = Uuid::new_v4();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Value>(OUTBOUND_QUEUE_CAPACITY);
    let (ws_sink, ws_stream) = socket.split();

    let done = tokio_util::sync::CancellationToken::new();
    let last_pong_at = Arc::new(AtomicI64::new(now_millis()));

    let writer = tokio::spawn(outbound_loop(
        state.clone(),
        ws_sink,
        outbound_rx,
        done.clone(),
        last_pong_at.clone(),
    ));

    let mut ctx = InboundContext::new(session_key, outbound_tx);
    inbound_loop(&state, &mut ctx, ws_stream, &done, &last_pong_at).await;

    done.cancel();
    let _ = writer.await;

    router::cleanup(&state, &ctx).await;
    state.release_connection();
    debug!(session = %session_key, "session closed");
}

async fn inbound_loop(
    state: &Arc<AppState>,
    ctx: &mut InboundContext,
    mut ws_stream: futures_util::stream::SplitStream<WebSocket>,
    done: &tokio_util::sync::CancellationToken,
    last_pong_at: &Arc<AtomicI64>,
) {
    let idle_timeout = state.config.idle_timeout();

    loop {
        tokio::select! {
            _ = done.cancelled() => break,

            _ = state.shutdown.cancelled() => {
                let _ = ctx.outbound_tx.send(json!({ "type": "shutdown" })).await;
                break;
            }

            _ = tokio::time::sleep(idle_timeout) => {
                debug!(session = %ctx.session_key, ?idle_timeout, "closing idle session");
                break;
            }

            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(state, ctx, &text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong_at.store(now_millis(), Ordering::Relaxed);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping frames carry no protocol meaning here
                    Some(Err(e)) => {
                        debug!(session = %ctx.session_key, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_frame(state: &Arc<AppState>, ctx: &mut InboundContext, text: &str) {
    let envelope: InboundEnvelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            let err = ApiError::Validation(format!("malformed frame: {e}"));
            let _ = ctx.outbound_tx.send(serde_json::to_value(err.to_error_body(None)).unwrap_or(json!({}))).await;
            return;
        }
    };

    let project_id = envelope.project_id.clone();
    match router::dispatch(state, ctx, envelope).await {
        Ok(Some(frame)) => {
            let _ = ctx.outbound_tx.send(frame).await;
        }
        Ok(None) => {}
        Err(e) => {
            let frame = e.to_error_body(project_id.as_deref());
            let _ = ctx.outbound_tx.send(serde_json::to_value(frame).unwrap_or(json!({}))).await;
        }
    }
}

async fn outbound_loop(
    state: Arc<AppState>,
    mut ws_sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Value>,
    done: tokio_util::sync::CancellationToken,
    last_pong_at: Arc<AtomicI64>,
) {
    let mut ping_interval = tokio::time::interval(state.config.ping_interval());
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let pong_timeout = state.config.pong_timeout();

    loop {
        tokio::select! {
            _ = done.cancelled() => break,

            _ = ping_interval.tick() => {
                let age = now_millis() - last_pong_at.load(Ordering::Relaxed);
                if age > pong_timeout.as_millis() as i64 {
                    debug!("closing session after missed pong within {pong_timeout:?}");
                    break;
                }
                if ws_sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            msg = outbound_rx.recv() => {
                match msg {
                    Some(value) => {
                        let text = match serde_json::to_string(&value) {
                            Ok(t) => t,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize outbound frame");
                                continue;
                            }
                        };
                        if ws_sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = ws_sink.close().await;
}

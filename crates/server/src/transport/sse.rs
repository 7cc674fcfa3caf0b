// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/v1/spectate/stream` — per-chunk spectator feed as Server-Sent Events.
//! Bootstraps with `session_ready` then either a resync (`chunk_static` +
//! `chunk_delta` behind a `resync_required` hint) or the replay tail, then
//! forwards live events with a heartbeat on idle.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use dungeonclaw_core::auth::Role;

use crate::error::ApiError;
use crate::state::AppState;
use crate::transport::http::{extract_bearer, resolve_chunk_id};

#[derive(Debug, Deserialize)]
pub struct SpectateQuery {
    pub chunk_id: String,
    #[serde(default)]
    pub last_event_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

fn authorize_spectator(state: &AppState, headers: &HeaderMap, query_token: Option<&str>) -> Result<(), ApiError> {
    let token = extract_bearer(headers).or(query_token).unwrap_or_default();
    if !token.is_empty() && token == state.config.dev_token() && state.config.enable_dev_spectator_session {
        return Ok(());
    }
    state.auth.validate_session(token, Role::Spectator, None)?;
    Ok(())
}

fn frame(event_id: Option<&str>, name: &str, data: Value) -> Event {
    let mut event = Event::default().event(name).data(data.to_string());
    if let Some(id) = event_id {
        event = event.id(id);
    }
    event
}

/// `GET /v1/spectate/stream?chunk_id=…`
pub async fn spectate_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SpectateQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize_spectator(&state, &headers, query.token.as_deref())?;

    let chunk_id = resolve_chunk_id(&query.chunk_id);
    let last_event_id =
        headers.get("last-event-id").and_then(|v| v.to_str().ok()).map(str::to_owned).or(query.last_event_id.clone());

    let (listener, live_events) = state.engine.register_chunk_listener(&chunk_id).await?;
    let (chunk_static, chunk_delta, resync_required, replay_events) =
        state.engine.open_spectator_feed(&chunk_id, last_event_id.as_deref()).await?;

    let channel_id = format!("sse-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

    let mut bootstrap = vec![frame(None, "session_ready", json!({"role": "spectator", "chunk_id": chunk_id, "channel_id": channel_id}))];

    if resync_required {
        bootstrap.push(frame(None, "resync_required", json!({"chunk_id": chunk_id, "snapshot_url": format!("/v1/chunks/{chunk_id}/snapshot")})));
        bootstrap.push(frame(None, "chunk_static", chunk_static));
        bootstrap.push(frame(None, "chunk_delta", chunk_delta));
    } else if !replay_events.is_empty() {
        for record in &replay_events {
            let id = record.get("event_id").and_then(Value::as_str).map(str::to_owned);
            let name = record.get("name").and_then(Value::as_str).unwrap_or("message").to_owned();
            let payload = record.get("payload").cloned().unwrap_or(Value::Null);
            bootstrap.push(frame(id.as_deref(), &name, payload));
        }
    } else {
        bootstrap.push(frame(None, "chunk_static", chunk_static));
        bootstrap.push(frame(None, "chunk_delta", chunk_delta));
    }

    let bootstrap_stream = stream::iter(bootstrap.into_iter().map(Ok::<_, Infallible>));

    let engine = &state.engine;
    let _ = engine; // kept alive via the Arc captured below
    let keepalive_state = Arc::clone(&state);
    let live_chunk_id = chunk_id.clone();
    let live_stream = live_event_stream(keepalive_state, live_chunk_id, listener, live_events);

    let combined = bootstrap_stream.chain(live_stream);

    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));

    Ok((headers, Sse::new(combined).keep_alive(KeepAlive::new().interval(state.config.sse_keepalive_interval()).text(":"))))
}

/// Turns the chunk listener into an SSE event stream, injecting a
/// `heartbeat` carrying the current tick whenever the queue sits idle past
/// the configured keepalive window, and ending after `chunk_closed`.
fn live_event_stream(
    state: Arc<AppState>,
    chunk_id: String,
    listener: dungeonclaw_core::Listener,
    events: tokio::sync::mpsc::Receiver<dungeonclaw_core::EngineEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        let mut events = events;
        let keepalive = state.config.sse_keepalive_interval();
        loop {
            match tokio::time::timeout(keepalive, events.recv()).await {
                Ok(Some(ev)) => {
                    let ended = ev.kind == "chunk_closed";
                    let payload = ev.payload.clone();
                    if tx.send(Ok(frame(None, ev.kind, payload))).await.is_err() {
                        break;
                    }
                    if ended {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    let heartbeat = frame(None, "heartbeat", json!({"chunk_id": chunk_id, "tick": state.engine.tick().await}));
                    if tx.send(Ok(heartbeat)).await.is_err() {
                        break;
                    }
                }
            }
        }
        state.engine.unregister_chunk_listener(&chunk_id, &listener).await;
    });

    ReceiverStream::new(rx)
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/v1/agent/ws` — the agent command channel. Binds a session to a
//! connection-scoped `channel_id`, relays `command_req`/`command_answer`
//! through the challenge service, and forwards the engine's per-agent
//! listener events (`command_result`, `chunk_static`, `chunk_delta`,
//! `chunk_transition`) to the socket.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{json, Value};

use dungeonclaw_core::auth::Role;
use dungeonclaw_core::challenge::{IssueRequest, VerifyRequest};
use dungeonclaw_core::Reason;

use crate::error::error_payload;
use crate::state::AppState;
use crate::transport::http::extract_bearer;

#[derive(Debug, Deserialize)]
pub struct AgentWsQuery {
    pub agent_id: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct CommandReqPayload {
    client_cmd_id: String,
    cmd: Value,
}

#[derive(Debug, Deserialize)]
struct CommandAnswerProof {
    proof_nonce: String,
}

#[derive(Debug, Deserialize)]
struct CommandAnswerPayload {
    server_cmd_id: String,
    sig: String,
    #[serde(default)]
    proof: Option<CommandAnswerProof>,
}

struct PendingCommand {
    cmd: Value,
}

/// `GET /v1/agent/ws?agent_id=…`
pub async fn agent_ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentWsQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = extract_bearer(&headers).map(str::to_owned).or(query.token.clone()).unwrap_or_default();
    ws.on_upgrade(move |socket| handle_agent_ws(socket, state, query.agent_id, token))
}

async fn send(socket: &mut WebSocket, kind: &str, payload: Value) -> bool {
    let frame = json!({"type": kind, "payload": payload});
    socket.send(Message::Text(frame.to_string().into())).await.is_ok()
}

async fn handle_agent_ws(mut socket: WebSocket, state: Arc<AppState>, agent_id: String, token: String) {
    let session = match state.auth.validate_session(&token, Role::Agent, Some(agent_id.as_str())) {
        Ok(session) => session,
        Err(reason) => {
            let _ = send(&mut socket, "error", error_payload(reason)).await;
            let _ = socket.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1008,
                reason: reason.as_str().into(),
            }))).await;
            return;
        }
    };

    if state.engine.ensure_agent(&agent_id).await.is_err() {
        let _ = send(&mut socket, "error", error_payload(Reason::NoSpawnAvailable)).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let channel_id = format!("ws-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let (listener, mut events) = state.engine.register_listener(&agent_id).await;
    let mut pending_commands: HashMap<String, PendingCommand> = HashMap::new();

    if !send(&mut socket, "session_ready", json!({"agent_id": agent_id, "channel_id": channel_id, "role": "agent"})).await {
        state.engine.unregister_listener(&agent_id, &listener).await;
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_message(&mut socket, &state, &agent_id, &channel_id, &session, &mut pending_commands, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            event = events.recv() => {
                match event {
                    Some(ev) => {
                        if !send(&mut socket, ev.kind, ev.payload).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    for server_cmd_id in pending_commands.keys() {
        state.auth.release_agent_lock(&agent_id, server_cmd_id);
    }
    state.engine.unregister_listener(&agent_id, &listener).await;
}

async fn handle_client_message(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    agent_id: &str,
    channel_id: &str,
    session: &dungeonclaw_core::auth::Session,
    pending_commands: &mut HashMap<String, PendingCommand>,
    raw: &str,
) -> bool {
    let envelope: WsEnvelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(_) => return send(socket, "error", error_payload(Reason::InvalidCmd)).await,
    };

    match envelope.kind.as_str() {
        "ping" => send(socket, "heartbeat", json!({"ok": true})).await,

        "command_req" => {
            let Ok(req) = serde_json::from_value::<CommandReqPayload>(envelope.payload) else {
                return send(socket, "error", json!({"reason": Reason::InvalidCmd.as_str()})).await;
            };

            let cmd_type = req.cmd.get("type").and_then(Value::as_str).unwrap_or("");
            if cmd_type != "move_to" && cmd_type != "say" {
                return send(socket, "command_ack", json!({"server_cmd_id": "", "accepted": false, "reason": Reason::InvalidCmd.as_str()})).await;
            }

            if cmd_type == "say" {
                return handle_say(socket, state, req).await;
            }

            let placeholder = format!("busy_{agent_id}");
            if !state.auth.acquire_agent_lock(agent_id, &placeholder) {
                return send(socket, "command_ack", json!({"server_cmd_id": "", "accepted": false, "reason": Reason::Busy.as_str()})).await;
            }

            let challenge = state.challenges.issue(IssueRequest {
                agent_id,
                session_jti: &session.jti,
                channel_id,
                client_cmd_id: &req.client_cmd_id,
                cmd: &req.cmd,
                difficulty: None,
            });
            state.auth.release_agent_lock(agent_id, &placeholder);
            state.auth.acquire_agent_lock(agent_id, &challenge.server_cmd_id);
            pending_commands.insert(challenge.server_cmd_id.clone(), PendingCommand { cmd: req.cmd });

            send(socket, "command_challenge", json!({
                "client_cmd_id": challenge.client_cmd_id,
                "server_cmd_id": challenge.server_cmd_id,
                "nonce": challenge.nonce,
                "expires_at": challenge.expires_at,
                "difficulty": challenge.difficulty,
                "channel_id": channel_id,
                "sig_alg": "HMAC-SHA256",
                "pow_alg": "sha256-leading-hex-zeroes",
            })).await
        }

        "command_answer" => {
            let Ok(answer) = serde_json::from_value::<CommandAnswerPayload>(envelope.payload) else {
                return send(socket, "error", json!({"reason": Reason::InvalidCmd.as_str()})).await;
            };

            let Some(pending) = pending_commands.get(&answer.server_cmd_id) else {
                return send(socket, "command_ack", json!({"server_cmd_id": answer.server_cmd_id, "accepted": false, "reason": Reason::ExpiredChallenge.as_str()})).await;
            };

            let verify = state.challenges.verify_answer(VerifyRequest {
                server_cmd_id: &answer.server_cmd_id,
                agent_id,
                session_jti: &session.jti,
                channel_id,
                session_cmd_secret: &session.cmd_secret,
                sig: &answer.sig,
                proof_nonce: answer.proof.as_ref().map(|p| p.proof_nonce.as_str()),
            });

            let Err(reason) = verify else {
                return complete_move(socket, state, agent_id, pending_commands, answer.server_cmd_id).await;
            };

            state.auth.release_agent_lock(agent_id, &answer.server_cmd_id);
            pending_commands.remove(&answer.server_cmd_id);
            send(socket, "command_ack", json!({"server_cmd_id": answer.server_cmd_id, "accepted": false, "reason": reason.as_str()})).await
        }

        _ => send(socket, "error", error_payload(Reason::UnsupportedMessageType)).await,
    }
}

async fn handle_say(socket: &mut WebSocket, state: &Arc<AppState>, req: CommandReqPayload) -> bool {
    let server_cmd_id = format!("say-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let tick = state.engine.tick().await;
    if !send(socket, "command_ack", json!({"server_cmd_id": server_cmd_id, "accepted": true, "echo": req.cmd, "started_tick": tick})).await {
        return false;
    }
    send(socket, "command_result", json!({"server_cmd_id": server_cmd_id, "status": "completed", "ended_tick": tick})).await
}

/// Admits the verified `move_to` into the engine. `command_result` for this
/// command is not sent here — it arrives later from the engine's listener
/// fan-out once the command actually resolves over ticks.
async fn complete_move(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    agent_id: &str,
    pending_commands: &mut HashMap<String, PendingCommand>,
    server_cmd_id: String,
) -> bool {
    let Some(pending) = pending_commands.remove(&server_cmd_id) else {
        return send(socket, "command_ack", json!({"server_cmd_id": server_cmd_id, "accepted": false, "reason": Reason::ExpiredChallenge.as_str()})).await;
    };

    let target_x = pending.cmd.get("x").and_then(Value::as_i64).unwrap_or_default() as i32;
    let target_y = pending.cmd.get("y").and_then(Value::as_i64).unwrap_or_default() as i32;

    let result = state.engine.submit_move_command(agent_id, &server_cmd_id, target_x, target_y).await;
    state.auth.release_agent_lock(agent_id, &server_cmd_id);

    match result {
        Ok(started_tick) => {
            send(socket, "command_ack", json!({
                "server_cmd_id": server_cmd_id,
                "accepted": true,
                "echo": pending.cmd,
                "started_tick": started_tick,
            })).await
        }
        Err(reason) => {
            send(socket, "command_ack", json!({"server_cmd_id": server_cmd_id, "accepted": false, "reason": reason.as_str()})).await
        }
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST handlers: accounts, keys, sessions, dev routes, chunk snapshots.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use dungeonclaw_core::auth::Role;
use dungeonclaw_core::engine::ROOT_CHUNK_ID;
use dungeonclaw_core::Reason;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub account_id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub account_id: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateKeyResponse {
    pub key_id: String,
    pub key_prefix: String,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub api_key: String,
    pub role: String,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_token: String,
    pub session_jti: String,
    pub role: &'static str,
    pub cmd_secret: String,
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct DevMoveToRequest {
    pub agent_id: String,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Serialize)]
pub struct DevMoveToResponse {
    pub server_cmd_id: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_tick: Option<u64>,
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

pub fn resolve_chunk_id(chunk_id: &str) -> String {
    if chunk_id.trim() == "demo" {
        ROOT_CHUNK_ID.to_owned()
    } else {
        chunk_id.trim().to_owned()
    }
}

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// `POST /v1/signup`
pub async fn signup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> Result<Json<SignupResponse>, ApiError> {
    let account = state.auth.create_account(&req.email, &req.password)?;
    Ok(Json(SignupResponse { account_id: account.id, email: account.email }))
}

/// `POST /v1/keys`
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateKeyRequest>,
) -> Result<Json<CreateKeyResponse>, ApiError> {
    let (key, raw) = state.auth.create_api_key(&req.account_id, req.label)?;
    Ok(Json(CreateKeyResponse { key_id: key.id, key_prefix: key.key_prefix, api_key: raw }))
}

/// `POST /v1/sessions`
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let role = Role::parse(&req.role).ok_or(Reason::InvalidCmd)?;
    let session = state.auth.create_session(&req.api_key, role, req.agent_id)?;
    Ok(Json(CreateSessionResponse {
        session_token: session.token,
        session_jti: session.jti,
        role: session.role.as_str(),
        cmd_secret: session.cmd_secret,
        expires_at: session.expires_at,
    }))
}

/// `POST /v1/dev/spectator-session`
pub async fn dev_spectator_session(State(state): State<Arc<AppState>>) -> Result<Json<CreateSessionResponse>, ApiError> {
    if !state.config.enable_dev_spectator_session {
        return Err(Reason::DevSpectatorSessionDisabled.into());
    }
    let session = state.auth.create_dev_spectator_session();
    Ok(Json(CreateSessionResponse {
        session_token: session.token,
        session_jti: session.jti,
        role: session.role.as_str(),
        cmd_secret: session.cmd_secret,
        expires_at: session.expires_at,
    }))
}

/// `POST /v1/dev/agent/move-to` — bypasses the challenge protocol entirely
/// when the dev flag is on, reachable by any `agent`/`spectator` session or
/// the literal dev bearer token.
pub async fn dev_agent_move_to(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<DevMoveToRequest>,
) -> Result<Json<DevMoveToResponse>, ApiError> {
    if !state.config.enable_dev_spectator_session {
        return Err(Reason::DevDebugRouteDisabled.into());
    }

    let token = extract_bearer(&headers).ok_or(Reason::InvalidSession)?;
    if token != state.config.dev_token() {
        let session = state.auth.get_session(token).ok_or(Reason::InvalidSession)?;
        if !matches!(session.role, Role::Agent | Role::Spectator) {
            return Err(Reason::InvalidScope.into());
        }
    }

    if let Err(reason) = state.engine.ensure_agent(&req.agent_id).await {
        return Ok(Json(DevMoveToResponse { server_cmd_id: String::new(), accepted: false, reason: Some(reason.as_str()), started_tick: None }));
    }

    let server_cmd_id = format!("dev-{}", uuid::Uuid::new_v4().simple());
    match state.engine.submit_move_command(&req.agent_id, &server_cmd_id, req.x, req.y).await {
        Ok(started_tick) => {
            Ok(Json(DevMoveToResponse { server_cmd_id, accepted: true, reason: None, started_tick: Some(started_tick) }))
        }
        Err(reason) => {
            Ok(Json(DevMoveToResponse { server_cmd_id: String::new(), accepted: false, reason: Some(reason.as_str()), started_tick: None }))
        }
    }
}

async fn authorize_chunk_read(state: &AppState, headers: &HeaderMap) -> Result<(), Reason> {
    let token = extract_bearer(headers).ok_or(Reason::InvalidSession)?;
    if token == state.config.dev_token() && state.config.enable_dev_spectator_session {
        return Ok(());
    }
    let session = state.auth.get_session(token).ok_or(Reason::InvalidSession)?;
    if !matches!(session.role, Role::Agent | Role::Spectator | Role::OwnerSpectator) {
        return Err(Reason::InvalidScope);
    }
    Ok(())
}

/// `GET /v1/chunks/{id}/snapshot`
pub async fn chunk_snapshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chunk_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize_chunk_read(&state, &headers).await?;
    let resolved = resolve_chunk_id(&chunk_id);
    let chunk_static = state.engine.chunk_static_payload(&resolved).await?;
    let latest_delta = state.engine.chunk_delta_payload(&resolved).await?;
    Ok(Json(json!({"chunk_static": chunk_static, "latest_delta": latest_delta})))
}

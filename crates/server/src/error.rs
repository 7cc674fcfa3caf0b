// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Translation of core `Reason`s into HTTP responses and WS/SSE error frames.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use dungeonclaw_core::Reason;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub reason: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// A wire-ready wrapper that turns any `Reason` into an axum response with
/// the status the reason is defined to carry.
pub struct ApiError(pub Reason);

impl ApiError {
    pub fn to_response(&self, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: ErrorBody { reason: self.0.as_str(), message: message.into() } };
        (status, Json(body))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        self.to_response(self.0.as_str()).into_response()
    }
}

impl From<Reason> for ApiError {
    fn from(reason: Reason) -> Self {
        ApiError(reason)
    }
}

/// The WS/SSE wire shape for a recoverable error: `{type:"error", payload:{reason}}`.
pub fn error_payload(reason: Reason) -> serde_json::Value {
    serde_json::json!({"reason": reason.as_str()})
}

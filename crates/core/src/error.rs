// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stable wire-string reasons surfaced to clients. Each variant's
//! [`Reason::as_str`] is the literal string sent over HTTP/WS/SSE and must
//! never change once shipped.

use std::fmt;

/// A recoverable error reason, sent as a structured `reason` field rather
/// than an exception. Unrecoverable failures close the connection instead
/// of producing a `Reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    // Auth
    InvalidSession,
    InvalidScope,
    AgentMismatch,
    InvalidApiKey,
    AgentIdRequired,
    EmailAlreadyExists,
    AccountNotFound,
    // Protocol
    InvalidCmd,
    UnsupportedMessageType,
    Busy,
    ExpiredChallenge,
    AuthFailed,
    // World
    AgentNotFound,
    ChunkNotFound,
    OutOfBounds,
    Unreachable,
    Blocked,
    NoSpawnAvailable,
    InvalidDirection,
    // Dev gates
    DevSpectatorSessionDisabled,
    DevDebugRouteDisabled,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidSession => "invalid_session",
            Self::InvalidScope => "invalid_scope",
            Self::AgentMismatch => "agent_mismatch",
            Self::InvalidApiKey => "invalid_api_key",
            Self::AgentIdRequired => "agent_id_required",
            Self::EmailAlreadyExists => "email_already_exists",
            Self::AccountNotFound => "account_not_found",
            Self::InvalidCmd => "invalid_cmd",
            Self::UnsupportedMessageType => "unsupported_message_type",
            Self::Busy => "busy",
            Self::ExpiredChallenge => "expired_challenge",
            Self::AuthFailed => "auth_failed",
            Self::AgentNotFound => "agent_not_found",
            Self::ChunkNotFound => "chunk_not_found",
            Self::OutOfBounds => "out_of_bounds",
            Self::Unreachable => "unreachable",
            Self::Blocked => "blocked",
            Self::NoSpawnAvailable => "no_spawn_available",
            Self::InvalidDirection => "invalid_direction",
            Self::DevSpectatorSessionDisabled => "dev_spectator_session_disabled",
            Self::DevDebugRouteDisabled => "dev_debug_route_disabled",
        }
    }

    /// The HTTP status an equivalent REST error should carry. WS/SSE paths
    /// surface the same reason as a structured field instead.
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidSession
            | Self::InvalidApiKey
            | Self::AuthFailed
            | Self::DevSpectatorSessionDisabled
            | Self::DevDebugRouteDisabled => 401,
            Self::InvalidScope | Self::AgentMismatch => 403,
            Self::AgentIdRequired
            | Self::InvalidCmd
            | Self::UnsupportedMessageType
            | Self::OutOfBounds
            | Self::InvalidDirection => 400,
            Self::AccountNotFound | Self::AgentNotFound | Self::ChunkNotFound => 404,
            Self::Busy | Self::EmailAlreadyExists => 409,
            Self::ExpiredChallenge => 410,
            Self::Unreachable | Self::Blocked | Self::NoSpawnAvailable => 422,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("{0}")]
pub struct CoreError(pub Reason);

impl CoreError {
    pub fn reason(self) -> Reason {
        self.0
    }
}

impl From<Reason> for CoreError {
    fn from(reason: Reason) -> Self {
        CoreError(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings_match_snake_case_names() {
        assert_eq!(Reason::InvalidSession.as_str(), "invalid_session");
        assert_eq!(Reason::DevDebugRouteDisabled.as_str(), "dev_debug_route_disabled");
        assert_eq!(Reason::Blocked.as_str(), "blocked");
    }
}

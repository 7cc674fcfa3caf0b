// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory accounts, API keys, and sessions, plus the per-agent command
//! lock that serializes challenge issuance ahead of the tick engine's own
//! active-move-slot bookkeeping.
//!
//! Grounded in `app/services/auth_store.py`.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Reason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    OwnerSpectator,
    Spectator,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "agent" => Some(Role::Agent),
            "owner_spectator" => Some(Role::OwnerSpectator),
            "spectator" => Some(Role::Spectator),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::OwnerSpectator => "owner_spectator",
            Role::Spectator => "spectator",
        }
    }

    fn requires_agent_id(self) -> bool {
        matches!(self, Role::Agent | Role::OwnerSpectator)
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub email: String,
    password_hash: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: String,
    pub account_id: String,
    /// First 12 chars of the raw key, safe to display back to the owner.
    pub key_prefix: String,
    key_hash: String,
    pub label: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub jti: String,
    pub account_id: String,
    pub role: Role,
    pub agent_id: Option<String>,
    pub cmd_secret: String,
    pub expires_at: i64,
}

fn sha256_hex(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

fn token_urlsafe(num_bytes: usize) -> String {
    let mut bytes = vec![0u8; num_bytes];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct Store {
    accounts_by_id: HashMap<String, Account>,
    accounts_by_email: HashMap<String, String>,
    keys_by_id: HashMap<String, ApiKey>,
    sessions_by_token: HashMap<String, Session>,
    busy_agents: HashMap<String, String>,
}

/// Single-process account/session directory. All state lives for the
/// lifetime of the server; nothing is persisted.
pub struct AuthStore {
    session_ttl_seconds: i64,
    inner: Mutex<Store>,
    clock: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl AuthStore {
    pub fn new(session_ttl_seconds: i64) -> Self {
        Self::with_clock(session_ttl_seconds, now_unix)
    }

    pub fn with_clock(session_ttl_seconds: i64, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        Self {
            session_ttl_seconds,
            inner: Mutex::new(Store {
                accounts_by_id: HashMap::new(),
                accounts_by_email: HashMap::new(),
                keys_by_id: HashMap::new(),
                sessions_by_token: HashMap::new(),
                busy_agents: HashMap::new(),
            }),
            clock: Box::new(clock),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_account(&self, email: &str, password: &str) -> Result<Account, Reason> {
        let normalized = email.trim().to_lowercase();
        let mut store = self.lock();
        if store.accounts_by_email.contains_key(&normalized) {
            return Err(Reason::EmailAlreadyExists);
        }

        let account = Account {
            id: format!("acc_{}", Uuid::new_v4().simple()),
            email: normalized.clone(),
            password_hash: sha256_hex(password),
            created_at: (self.clock)(),
        };
        store.accounts_by_id.insert(account.id.clone(), account.clone());
        store.accounts_by_email.insert(normalized, account.id.clone());
        Ok(account)
    }

    /// Returns the key record and the raw key (only ever shown once).
    pub fn create_api_key(&self, account_id: &str, label: Option<String>) -> Result<(ApiKey, String), Reason> {
        let mut store = self.lock();
        if !store.accounts_by_id.contains_key(account_id) {
            return Err(Reason::AccountNotFound);
        }

        let raw_key = format!("dcw_{}", token_urlsafe(24));
        let key = ApiKey {
            id: format!("key_{}", Uuid::new_v4().simple()),
            account_id: account_id.to_owned(),
            key_prefix: raw_key.chars().take(12).collect(),
            key_hash: sha256_hex(&raw_key),
            label,
            created_at: (self.clock)(),
        };
        store.keys_by_id.insert(key.id.clone(), key.clone());
        Ok((key, raw_key))
    }

    fn issue_session(&self, account_id: &str, role: Role, agent_id: Option<String>) -> Session {
        let issued_at = (self.clock)();
        Session {
            token: format!("sess_{}", token_urlsafe(24)),
            jti: format!("jti_{}", Uuid::new_v4().simple()),
            account_id: account_id.to_owned(),
            role,
            agent_id,
            cmd_secret: token_urlsafe(32),
            expires_at: issued_at + self.session_ttl_seconds,
        }
    }

    pub fn create_session(
        &self,
        api_key_raw: &str,
        role: Role,
        agent_id: Option<String>,
    ) -> Result<Session, Reason> {
        if role.requires_agent_id() && agent_id.is_none() {
            return Err(Reason::AgentIdRequired);
        }
        let agent_id = if role == Role::Spectator { None } else { agent_id };

        let key_hash = sha256_hex(api_key_raw);
        let mut store = self.lock();
        let account_id = store
            .keys_by_id
            .values()
            .find(|k| k.key_hash == key_hash)
            .map(|k| k.account_id.clone())
            .ok_or(Reason::InvalidApiKey)?;

        let session = self.issue_session(&account_id, role, agent_id);
        store.sessions_by_token.insert(session.token.clone(), session.clone());
        Ok(session)
    }

    pub fn create_dev_spectator_session(&self) -> Session {
        let session = self.issue_session("acc_dev_spectator", Role::Spectator, None);
        self.lock().sessions_by_token.insert(session.token.clone(), session.clone());
        session
    }

    pub fn create_dev_owner_session(&self, agent_id: &str) -> Result<Session, Reason> {
        if agent_id.is_empty() {
            return Err(Reason::AgentIdRequired);
        }
        let session = self.issue_session("acc_dev_owner", Role::OwnerSpectator, Some(agent_id.to_owned()));
        self.lock().sessions_by_token.insert(session.token.clone(), session.clone());
        Ok(session)
    }

    pub fn get_session(&self, token: &str) -> Option<Session> {
        let mut store = self.lock();
        let session = store.sessions_by_token.get(token)?;
        if session.expires_at <= (self.clock)() {
            store.sessions_by_token.remove(token);
            return None;
        }
        Some(session.clone())
    }

    pub fn validate_session(&self, token: &str, role: Role, agent_id: Option<&str>) -> Result<Session, Reason> {
        let session = self.get_session(token).ok_or(Reason::InvalidSession)?;
        if session.role != role {
            return Err(Reason::InvalidScope);
        }
        if role.requires_agent_id() && session.agent_id.as_deref() != agent_id {
            return Err(Reason::AgentMismatch);
        }
        Ok(session)
    }

    /// Reserves the single allowed in-flight command slot for `agent_id`.
    /// Returns `false` (without mutating state) if another command already
    /// holds the slot.
    pub fn acquire_agent_lock(&self, agent_id: &str, server_cmd_id: &str) -> bool {
        let mut store = self.lock();
        match store.busy_agents.get(agent_id) {
            Some(current) if current != server_cmd_id => false,
            _ => {
                store.busy_agents.insert(agent_id.to_owned(), server_cmd_id.to_owned());
                true
            }
        }
    }

    pub fn release_agent_lock(&self, agent_id: &str, server_cmd_id: &str) {
        let mut store = self.lock();
        if store.busy_agents.get(agent_id).map(String::as_str) == Some(server_cmd_id) {
            store.busy_agents.remove(agent_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn store_with_clock(now: Arc<AtomicI64>, ttl: i64) -> AuthStore {
        AuthStore::with_clock(ttl, move || now.load(Ordering::SeqCst))
    }

    #[test]
    fn duplicate_email_is_rejected() {
        let store = AuthStore::new(3600);
        store.create_account("a@example.com", "pw").unwrap_or_else(|e| panic!("{e}"));
        let result = store.create_account("A@Example.com ", "pw2");
        assert_eq!(result.err(), Some(Reason::EmailAlreadyExists));
    }

    #[test]
    fn session_roundtrip_agent_role() {
        let store = AuthStore::new(3600);
        let account = store.create_account("a@example.com", "pw").unwrap_or_else(|e| panic!("{e}"));
        let (_, raw_key) = store.create_api_key(&account.id, None).unwrap_or_else(|e| panic!("{e}"));

        let missing_agent = store.create_session(&raw_key, Role::Agent, None);
        assert_eq!(missing_agent.err(), Some(Reason::AgentIdRequired));

        let session = store
            .create_session(&raw_key, Role::Agent, Some("a1".to_owned()))
            .unwrap_or_else(|e| panic!("{e}"));
        let validated = store
            .validate_session(&session.token, Role::Agent, Some("a1"))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(validated.agent_id.as_deref(), Some("a1"));

        let mismatch = store.validate_session(&session.token, Role::Agent, Some("other"));
        assert_eq!(mismatch.err(), Some(Reason::AgentMismatch));

        let wrong_scope = store.validate_session(&session.token, Role::Spectator, None);
        assert_eq!(wrong_scope.err(), Some(Reason::InvalidScope));
    }

    #[test]
    fn expired_session_is_pruned_on_access() {
        let now = Arc::new(AtomicI64::new(1_000));
        let store = store_with_clock(Arc::clone(&now), 10);
        let account = store.create_account("a@example.com", "pw").unwrap_or_else(|e| panic!("{e}"));
        let (_, raw_key) = store.create_api_key(&account.id, None).unwrap_or_else(|e| panic!("{e}"));
        let session = store
            .create_session(&raw_key, Role::Spectator, None)
            .unwrap_or_else(|e| panic!("{e}"));

        now.store(1_020, Ordering::SeqCst);
        assert!(store.get_session(&session.token).is_none());
    }

    #[test]
    fn agent_lock_is_exclusive_until_released() {
        let store = AuthStore::new(3600);
        assert!(store.acquire_agent_lock("a1", "cmd-1"));
        assert!(!store.acquire_agent_lock("a1", "cmd-2"));
        // Re-acquiring with the same holder is idempotent.
        assert!(store.acquire_agent_lock("a1", "cmd-1"));
        store.release_agent_lock("a1", "cmd-1");
        assert!(store.acquire_agent_lock("a1", "cmd-2"));
    }

    #[test]
    fn invalid_api_key_is_rejected() {
        let store = AuthStore::new(3600);
        let result = store.create_session("not-a-real-key", Role::Spectator, None);
        assert_eq!(result.err(), Some(Reason::InvalidApiKey));
    }
}

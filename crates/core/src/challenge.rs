// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-command challenge issue/verify state machine: HMAC-SHA256 signature
//! binding plus an optional sha256 proof-of-work, guaranteeing at-most-once
//! acceptance of a command.
//!
//! Grounded in `app/services/challenge_service.py`.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Reason;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Issued,
    Consumed,
    Expired,
}

#[derive(Debug, Clone)]
pub struct ChallengeRecord {
    pub server_cmd_id: String,
    pub client_cmd_id: String,
    pub agent_id: String,
    pub session_jti: String,
    pub channel_id: String,
    pub cmd_hash: String,
    pub nonce: String,
    pub expires_at: i64,
    pub difficulty: u32,
    pub status: ChallengeStatus,
    pub created_at: i64,
}

/// Who is asking to have a command challenged: the binding key for both the
/// signature payload and the later `verify` call.
pub struct IssueRequest<'a> {
    pub agent_id: &'a str,
    pub session_jti: &'a str,
    pub channel_id: &'a str,
    pub client_cmd_id: &'a str,
    pub cmd: &'a Value,
    pub difficulty: Option<u32>,
}

pub struct VerifyRequest<'a> {
    pub server_cmd_id: &'a str,
    pub agent_id: &'a str,
    pub session_jti: &'a str,
    pub channel_id: &'a str,
    pub session_cmd_secret: &'a str,
    pub sig: &'a str,
    pub proof_nonce: Option<&'a str>,
}

/// Issues and verifies per-command challenges. Clock is injectable for tests.
pub struct ChallengeService {
    challenge_expires_seconds: i64,
    challenge_ttl_seconds: i64,
    default_difficulty: u32,
    records: Mutex<HashMap<String, ChallengeRecord>>,
    clock: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl ChallengeService {
    pub fn new(
        challenge_expires_seconds: i64,
        challenge_ttl_seconds: i64,
        default_difficulty: u32,
    ) -> Self {
        Self::with_clock(
            challenge_expires_seconds,
            challenge_ttl_seconds,
            default_difficulty,
            || {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0)
            },
        )
    }

    pub fn with_clock(
        challenge_expires_seconds: i64,
        challenge_ttl_seconds: i64,
        default_difficulty: u32,
        clock: impl Fn() -> i64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            challenge_expires_seconds,
            challenge_ttl_seconds,
            default_difficulty,
            records: Mutex::new(HashMap::new()),
            clock: Box::new(clock),
        }
    }

    /// Canonical sha256 of `cmd`, serialized with sorted keys and compact
    /// separators. Relies on `serde_json::Value`'s default `BTreeMap`-backed
    /// object representation (sorted) and its compact `Display`.
    pub fn hash_cmd(cmd: &Value) -> String {
        let canonical = cmd.to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn build_sig_payload(
        session_jti: &str,
        channel_id: &str,
        agent_id: &str,
        server_cmd_id: &str,
        client_cmd_id: &str,
        cmd_hash: &str,
        nonce: &str,
        expires_at: i64,
        difficulty: u32,
    ) -> String {
        format!(
            "v1|{session_jti}|{channel_id}|{agent_id}|{server_cmd_id}|{client_cmd_id}|{cmd_hash}|{nonce}|{expires_at}|{difficulty}"
        )
    }

    pub fn sign(secret: &str, payload: &str) -> String {
        // `new_from_slice` never fails for HMAC (any key length is valid).
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    fn verify_signature(secret: &str, payload: &str, sig: &str) -> bool {
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(payload.as_bytes());
        let Ok(given) = URL_SAFE_NO_PAD.decode(sig) else {
            return false;
        };
        // `verify_slice` is constant-time.
        mac.verify_slice(&given).is_ok()
    }

    pub fn verify_pow(nonce: &str, cmd_hash: &str, proof_nonce: &str, difficulty: u32) -> bool {
        let payload = format!("{nonce}|{cmd_hash}|{proof_nonce}");
        let mut hasher = Sha256::new();
        hasher.update(payload.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest.starts_with(&"0".repeat(difficulty as usize))
    }

    fn purge_old_records(&self, now: i64, records: &mut HashMap<String, ChallengeRecord>) {
        records.retain(|_, record| now <= record.created_at + self.challenge_ttl_seconds);
    }

    pub fn issue(&self, req: IssueRequest<'_>) -> ChallengeRecord {
        let now = (self.clock)();
        let difficulty = req.difficulty.unwrap_or(self.default_difficulty);

        let record = ChallengeRecord {
            server_cmd_id: format!("cmd_{}", &Uuid::new_v4().simple().to_string()[..12]),
            client_cmd_id: req.client_cmd_id.to_owned(),
            agent_id: req.agent_id.to_owned(),
            session_jti: req.session_jti.to_owned(),
            channel_id: req.channel_id.to_owned(),
            cmd_hash: Self::hash_cmd(req.cmd),
            nonce: {
                let mut bytes = [0u8; 16];
                rand::Rng::fill(&mut rand::rng(), &mut bytes);
                URL_SAFE_NO_PAD.encode(bytes)
            },
            expires_at: now + self.challenge_expires_seconds,
            difficulty,
            status: ChallengeStatus::Issued,
            created_at: now,
        };

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        self.purge_old_records(now, &mut records);
        records.insert(record.server_cmd_id.clone(), record.clone());
        record
    }

    pub fn get(&self, server_cmd_id: &str) -> Option<ChallengeRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(server_cmd_id).cloned()
    }

    pub fn verify_answer(&self, req: VerifyRequest<'_>) -> Result<(), Reason> {
        let now = (self.clock)();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());

        let record = records.get_mut(req.server_cmd_id).ok_or(Reason::ExpiredChallenge)?;

        if record.status != ChallengeStatus::Issued {
            return Err(Reason::ExpiredChallenge);
        }

        if now > record.expires_at {
            record.status = ChallengeStatus::Expired;
            return Err(Reason::ExpiredChallenge);
        }

        if record.agent_id != req.agent_id
            || record.session_jti != req.session_jti
            || record.channel_id != req.channel_id
        {
            return Err(Reason::AuthFailed);
        }

        let payload = Self::build_sig_payload(
            &record.session_jti,
            &record.channel_id,
            &record.agent_id,
            &record.server_cmd_id,
            &record.client_cmd_id,
            &record.cmd_hash,
            &record.nonce,
            record.expires_at,
            record.difficulty,
        );
        if !Self::verify_signature(req.session_cmd_secret, &payload, req.sig) {
            return Err(Reason::AuthFailed);
        }

        if record.difficulty > 0 {
            let proof_nonce = req.proof_nonce.ok_or(Reason::AuthFailed)?;
            if !Self::verify_pow(&record.nonce, &record.cmd_hash, proof_nonce, record.difficulty) {
                return Err(Reason::AuthFailed);
            }
        }

        record.status = ChallengeStatus::Consumed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn service_with_clock(now: Arc<AtomicI64>) -> ChallengeService {
        ChallengeService::with_clock(5, 10, 2, move || now.load(Ordering::SeqCst))
    }

    fn base_issue(cmd: &Value) -> IssueRequest<'_> {
        IssueRequest {
            agent_id: "a1",
            session_jti: "jti-1",
            channel_id: "ws-1",
            client_cmd_id: "c1",
            cmd,
            difficulty: None,
        }
    }

    fn answer_for(record: &ChallengeRecord, secret: &str) -> (String, Option<String>) {
        let payload = ChallengeService::build_sig_payload(
            &record.session_jti,
            &record.channel_id,
            &record.agent_id,
            &record.server_cmd_id,
            &record.client_cmd_id,
            &record.cmd_hash,
            &record.nonce,
            record.expires_at,
            record.difficulty,
        );
        let sig = ChallengeService::sign(secret, &payload);

        let mut proof_nonce = None;
        if record.difficulty > 0 {
            let mut n: u64 = 0;
            loop {
                let candidate = n.to_string();
                if ChallengeService::verify_pow(&record.nonce, &record.cmd_hash, &candidate, record.difficulty)
                {
                    proof_nonce = Some(candidate);
                    break;
                }
                n += 1;
            }
        }
        (sig, proof_nonce)
    }

    #[test]
    fn issue_then_verify_succeeds_then_replay_fails() {
        let now = Arc::new(AtomicI64::new(1_000));
        let service = service_with_clock(now);
        let cmd = serde_json::json!({"type": "move_to", "x": 1, "y": 2});
        let record = service.issue(base_issue(&cmd));
        let (sig, proof_nonce) = answer_for(&record, "secret");

        let result = service.verify_answer(VerifyRequest {
            server_cmd_id: &record.server_cmd_id,
            agent_id: "a1",
            session_jti: "jti-1",
            channel_id: "ws-1",
            session_cmd_secret: "secret",
            sig: &sig,
            proof_nonce: proof_nonce.as_deref(),
        });
        assert!(result.is_ok());

        let replay = service.verify_answer(VerifyRequest {
            server_cmd_id: &record.server_cmd_id,
            agent_id: "a1",
            session_jti: "jti-1",
            channel_id: "ws-1",
            session_cmd_secret: "secret",
            sig: &sig,
            proof_nonce: proof_nonce.as_deref(),
        });
        assert_eq!(replay, Err(Reason::ExpiredChallenge));
    }

    #[test]
    fn expiry_marks_record_expired() {
        let now = Arc::new(AtomicI64::new(1_000));
        let service = service_with_clock(Arc::clone(&now));
        let cmd = serde_json::json!({"type": "move_to", "x": 1, "y": 2});
        let record = service.issue(base_issue(&cmd));
        let (sig, proof_nonce) = answer_for(&record, "secret");

        now.store(10_000, Ordering::SeqCst);
        let result = service.verify_answer(VerifyRequest {
            server_cmd_id: &record.server_cmd_id,
            agent_id: "a1",
            session_jti: "jti-1",
            channel_id: "ws-1",
            session_cmd_secret: "secret",
            sig: &sig,
            proof_nonce: proof_nonce.as_deref(),
        });
        assert_eq!(result, Err(Reason::ExpiredChallenge));
    }

    #[test]
    fn signature_binds_every_field() {
        let now = Arc::new(AtomicI64::new(1_000));
        let service = service_with_clock(now);
        let cmd = serde_json::json!({"type": "move_to", "x": 1, "y": 2});
        let record = service.issue(base_issue(&cmd));
        let (sig, proof_nonce) = answer_for(&record, "secret");

        let mutations: Vec<Box<dyn Fn(&mut VerifyRequest<'_>)>> = vec![
            Box::new(|r| r.agent_id = "other"),
            Box::new(|r| r.session_jti = "other-jti"),
            Box::new(|r| r.channel_id = "other-channel"),
            Box::new(|r| r.session_cmd_secret = "wrong-secret"),
        ];

        for mutate in mutations {
            let mut req = VerifyRequest {
                server_cmd_id: &record.server_cmd_id,
                agent_id: "a1",
                session_jti: "jti-1",
                channel_id: "ws-1",
                session_cmd_secret: "secret",
                sig: &sig,
                proof_nonce: proof_nonce.as_deref(),
            };
            mutate(&mut req);
            assert_eq!(service.get(&record.server_cmd_id).map(|r| r.status), Some(ChallengeStatus::Issued));
            let result = service.verify_answer(req);
            assert_eq!(result, Err(Reason::AuthFailed));
        }
    }

    #[test]
    fn pow_requires_matching_leading_zeroes() {
        assert!(!ChallengeService::verify_pow("n", "h", "wrong", 1));
        let mut n = 0u64;
        loop {
            let candidate = n.to_string();
            if ChallengeService::verify_pow("n", "h", &candidate, 1) {
                break;
            }
            n += 1;
            assert!(n < 10_000_000, "pow search should converge quickly at difficulty 1");
        }
    }
}

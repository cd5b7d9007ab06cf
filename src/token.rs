//! Action token codec.
//!
//! A token is `base64url(payload).base64url(hmac)` where the payload is
//! `version | approval id | action | issued-at | nonce` and the MAC is
//! HMAC-SHA256 under the server-held secret. Authenticity needs no lookup;
//! replay is rejected separately by the state store.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::models::approval::ApprovalAction;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: u8 = 1;
const NONCE_LEN: usize = 8;
const PAYLOAD_LEN: usize = 1 + 8 + 1 + 8 + NONCE_LEN;
const MAC_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("action link has expired")]
    Expired,

    #[error("action link failed authentication")]
    Tampered,

    #[error("action link is malformed")]
    Malformed,
}

/// Fields recovered from a token that passed authentication and expiry checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub approval_id: i64,
    pub action: ApprovalAction,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenCodec {
    key: Zeroizing<[u8; 32]>,
    ttl: Duration,
}

impl TokenCodec {
    pub fn new(key: [u8; 32], ttl: Duration) -> Self {
        Self {
            key: Zeroizing::new(key),
            ttl,
        }
    }

    pub fn from_hex(secret_hex: &str, ttl: Duration) -> anyhow::Result<Self> {
        Ok(Self::new(parse_secret(secret_hex)?, ttl))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        issued_at + self.ttl
    }

    pub fn issue(&self, approval_id: i64, action: ApprovalAction, now: DateTime<Utc>) -> String {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0] = TOKEN_VERSION;
        payload[1..9].copy_from_slice(&approval_id.to_be_bytes());
        payload[9] = action.to_byte();
        payload[10..18].copy_from_slice(&now.timestamp().to_be_bytes());
        rand::thread_rng().fill_bytes(&mut payload[18..]);

        let mac = self.sign(&payload);
        format!("{}.{}", URL_SAFE_NO_PAD.encode(payload), URL_SAFE_NO_PAD.encode(mac))
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<VerifiedToken, TokenError> {
        let (payload_b64, mac_b64) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let mac = URL_SAFE_NO_PAD.decode(mac_b64).map_err(|_| TokenError::Malformed)?;
        if payload.len() != PAYLOAD_LEN || mac.len() != MAC_LEN {
            return Err(TokenError::Malformed);
        }

        let expected = self.sign(&payload);
        if !bool::from(expected.as_slice().ct_eq(&mac)) {
            return Err(TokenError::Tampered);
        }

        if payload[0] != TOKEN_VERSION {
            return Err(TokenError::Malformed);
        }
        let approval_id = i64::from_be_bytes(payload[1..9].try_into().map_err(|_| TokenError::Malformed)?);
        let action = ApprovalAction::from_byte(payload[9]).ok_or(TokenError::Malformed)?;
        let issued_secs = i64::from_be_bytes(payload[10..18].try_into().map_err(|_| TokenError::Malformed)?);
        let issued_at = Utc
            .timestamp_opt(issued_secs, 0)
            .single()
            .ok_or(TokenError::Malformed)?;

        let expires_at = self.expires_at(issued_at);
        if now > expires_at {
            return Err(TokenError::Expired);
        }

        Ok(VerifiedToken {
            approval_id,
            action,
            issued_at,
            expires_at,
        })
    }

    fn sign(&self, payload: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key[..]).expect("HMAC can take key of any size");
        mac.update(payload);
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }
}

/// Digest the store records for a token, so raw tokens are never persisted.
pub fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}

/// Fresh random signing secret, hex encoded.
pub fn generate_secret() -> String {
    let mut key = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(&mut key[..]);
    hex::encode(&key[..])
}

pub fn parse_secret(hex: &str) -> anyhow::Result<[u8; 32]> {
    if hex.len() != 64 {
        anyhow::bail!(
            "LINK_TOKEN_SECRET must be 64 hex chars (32 bytes), got {} chars",
            hex.len()
        );
    }
    let bytes = hex::decode(hex)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn codec() -> TokenCodec {
        TokenCodec::from_hex(KEY, Duration::days(7)).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let codec = codec();
        let token = codec.issue(42, ApprovalAction::Approve, t0());
        let verified = codec.verify(&token, t0()).unwrap();
        assert_eq!(verified.approval_id, 42);
        assert_eq!(verified.action, ApprovalAction::Approve);
        assert_eq!(verified.issued_at, t0());
        assert_eq!(verified.expires_at, t0() + Duration::days(7));
    }

    #[test]
    fn test_expiry_boundary() {
        let codec = codec();
        let token = codec.issue(42, ApprovalAction::Deny, t0());
        let ttl = codec.ttl();
        assert!(codec.verify(&token, t0() + ttl).is_ok());
        assert_eq!(
            codec.verify(&token, t0() + ttl + Duration::seconds(1)),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let codec = codec();
        let token = codec.issue(7, ApprovalAction::RequestInfo, t0());
        let (p, m) = token.split_once('.').unwrap();
        let payload = URL_SAFE_NO_PAD.decode(p).unwrap();
        let mac = URL_SAFE_NO_PAD.decode(m).unwrap();

        for i in 0..payload.len() * 8 {
            let mut mutated = payload.clone();
            mutated[i / 8] ^= 1 << (i % 8);
            let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(&mutated), m);
            assert_eq!(codec.verify(&forged, t0()), Err(TokenError::Tampered), "payload bit {}", i);
        }
        for i in 0..mac.len() * 8 {
            let mut mutated = mac.clone();
            mutated[i / 8] ^= 1 << (i % 8);
            let forged = format!("{}.{}", p, URL_SAFE_NO_PAD.encode(&mutated));
            assert_eq!(codec.verify(&forged, t0()), Err(TokenError::Tampered), "mac bit {}", i);
        }
    }

    #[test]
    fn test_mutated_text_never_verifies() {
        let codec = codec();
        let token = codec.issue(7, ApprovalAction::Approve, t0());
        for (i, c) in token.char_indices() {
            let replacement = if c == 'A' { 'B' } else { 'A' };
            let mut forged = token.clone();
            forged.replace_range(i..i + c.len_utf8(), &replacement.to_string());
            assert!(codec.verify(&forged, t0()).is_err(), "position {}", i);
        }
    }

    #[test]
    fn test_other_key_is_tampered() {
        let token = codec().issue(1, ApprovalAction::Approve, t0());
        let other = TokenCodec::new([9u8; 32], Duration::days(7));
        assert_eq!(other.verify(&token, t0()), Err(TokenError::Tampered));
    }

    #[test]
    fn test_malformed_inputs() {
        let codec = codec();
        for bad in ["", "nodot", "a.b", "!!!.???", "AAAA.AAAA"] {
            assert_eq!(codec.verify(bad, t0()), Err(TokenError::Malformed), "input {:?}", bad);
        }
    }

    #[test]
    fn test_tokens_are_unique_and_digest_stable() {
        let codec = codec();
        let a = codec.issue(1, ApprovalAction::Approve, t0());
        let b = codec.issue(1, ApprovalAction::Approve, t0());
        assert_ne!(a, b);
        assert_eq!(digest(&a), digest(&a));
        assert_ne!(digest(&a), digest(&b));
        assert_eq!(digest(&a).len(), 64);
    }

    #[test]
    fn test_parse_secret() {
        assert!(parse_secret(KEY).is_ok());
        assert!(parse_secret("abcd").is_err());
        assert!(parse_secret(&"zz".repeat(32)).is_err());
        assert_eq!(generate_secret().len(), 64);
    }
}

use crate::error::{ProxyError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use uuid::Uuid;

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Anonymous session state carried entirely by the client as an encrypted
/// token. The server never stores it between requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// User-agent + IP captured at creation; informational only
    pub client_fingerprint: String,
    /// Opaque preference bag, round-tripped untouched
    #[serde(default)]
    pub preferences: HashMap<String, serde_json::Value>,
    pub request_count: u64,
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Result of resolving an inbound token
#[derive(Debug)]
pub struct ResolvedSession {
    pub record: SessionRecord,
    /// True when the inbound token was absent, invalid, or expired and a
    /// fresh record was minted
    pub is_new: bool,
}

/// Encrypts and decrypts session records with AES-256-GCM.
///
/// Each token derives a fresh key via PBKDF2-SHA256 from the master key and
/// a per-token salt; the salt doubles as associated authenticated data. The
/// wire layout is `base64(salt ∥ nonce ∥ auth_tag ∥ ciphertext)`.
pub struct SessionEnvelope {
    master_key: Vec<u8>,
    timeout: Duration,
    max_age: Duration,
}

impl SessionEnvelope {
    pub fn new(master_key: &str, timeout_seconds: u64, max_age_seconds: u64) -> Self {
        Self {
            master_key: master_key.as_bytes().to_vec(),
            timeout: Duration::seconds(timeout_seconds as i64),
            max_age: Duration::seconds(max_age_seconds as i64),
        }
    }

    /// Mint a brand-new record counting the current request
    pub fn mint(&self, fingerprint: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: Uuid::new_v4(),
            created_at: now,
            last_accessed_at: now,
            expires_at: now + self.timeout,
            client_fingerprint: fingerprint.to_string(),
            preferences: HashMap::new(),
            request_count: 1,
            last_request_at: Some(now),
        }
    }

    /// Decode the inbound token and advance the session for this request.
    ///
    /// Invalid, expired, or over-age tokens all produce a fresh record; the
    /// prior session state is unrecoverable by design.
    pub fn resolve(&self, token: Option<&str>, fingerprint: &str) -> ResolvedSession {
        let record = token.and_then(|t| match self.decrypt(t) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Discarding session token: {e}");
                None
            }
        });

        match record {
            Some(mut record) if self.is_live(&record) => {
                let now = Utc::now();
                record.last_accessed_at = now;
                record.expires_at = now + self.timeout;
                record.request_count += 1;
                record.last_request_at = Some(now);
                ResolvedSession {
                    record,
                    is_new: false,
                }
            }
            _ => ResolvedSession {
                record: self.mint(fingerprint),
                is_new: true,
            },
        }
    }

    /// A record is live while unexpired and within the absolute age bound
    fn is_live(&self, record: &SessionRecord) -> bool {
        let now = Utc::now();
        now < record.expires_at && now - record.created_at <= self.max_age
    }

    /// Encrypt a record into a client-carried token
    pub fn encrypt(&self, record: &SessionRecord) -> Result<String> {
        let plaintext = serde_json::to_vec(record)?;

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = self.cipher_for(&salt)?;
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &plaintext,
                    aad: &salt,
                },
            )
            .map_err(|_| ProxyError::Crypto("session encryption failed".to_string()))?;

        // The AEAD appends the tag to the ciphertext; the token layout
        // carries it between the nonce and the ciphertext.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut raw = Vec::with_capacity(SALT_LEN + NONCE_LEN + TAG_LEN + ciphertext.len());
        raw.extend_from_slice(&salt);
        raw.extend_from_slice(&nonce_bytes);
        raw.extend_from_slice(tag);
        raw.extend_from_slice(ciphertext);

        Ok(BASE64.encode(raw))
    }

    /// Decrypt a token. Any parse, format, or authentication failure maps
    /// to `InvalidSession`.
    pub fn decrypt(&self, token: &str) -> Result<SessionRecord> {
        let raw = BASE64
            .decode(token)
            .map_err(|_| ProxyError::InvalidSession)?;
        if raw.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(ProxyError::InvalidSession);
        }

        let (salt, rest) = raw.split_at(SALT_LEN);
        let (nonce_bytes, rest) = rest.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let cipher = self.cipher_for(salt)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: &sealed,
                    aad: salt,
                },
            )
            .map_err(|_| ProxyError::InvalidSession)?;

        serde_json::from_slice(&plaintext).map_err(|_| ProxyError::InvalidSession)
    }

    /// Key derivation runs per token so every token gets a unique key
    fn cipher_for(&self, salt: &[u8]) -> Result<Aes256Gcm> {
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(&self.master_key, salt, PBKDF2_ITERATIONS, &mut key);

        Aes256Gcm::new_from_slice(&key)
            .map_err(|_| ProxyError::Crypto("session key derivation failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> SessionEnvelope {
        SessionEnvelope::new("test-master-key", 1800, 7 * 24 * 3600)
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let env = envelope();
        let record = env.mint("Mozilla/5.0|203.0.113.9");

        let token = env.encrypt(&record).unwrap();
        let decrypted = env.decrypt(&token).unwrap();

        assert_eq!(decrypted, record);
    }

    #[test]
    fn tokens_are_unique_per_encryption() {
        let env = envelope();
        let record = env.mint("fp");

        // Fresh salt and nonce every time
        let token1 = env.encrypt(&record).unwrap();
        let token2 = env.encrypt(&record).unwrap();
        assert_ne!(token1, token2);
        assert_eq!(env.decrypt(&token1).unwrap(), env.decrypt(&token2).unwrap());
    }

    #[test]
    fn any_single_byte_perturbation_fails() {
        let env = envelope();
        let token = env.encrypt(&env.mint("fp")).unwrap();
        let raw = BASE64.decode(&token).unwrap();

        // Sample positions across salt, nonce, tag, and ciphertext
        for pos in [0, SALT_LEN, SALT_LEN + NONCE_LEN, raw.len() - 1] {
            let mut tampered = raw.clone();
            tampered[pos] ^= 0x01;
            let tampered_token = BASE64.encode(&tampered);
            assert!(
                matches!(
                    env.decrypt(&tampered_token),
                    Err(ProxyError::InvalidSession)
                ),
                "tampering at byte {pos} was not detected"
            );
        }
    }

    #[test]
    fn wrong_master_key_fails() {
        let env = envelope();
        let other = SessionEnvelope::new("different-key", 1800, 7 * 24 * 3600);

        let token = env.encrypt(&env.mint("fp")).unwrap();
        assert!(matches!(
            other.decrypt(&token),
            Err(ProxyError::InvalidSession)
        ));
    }

    #[test]
    fn garbage_tokens_fail_closed() {
        let env = envelope();
        assert!(env.decrypt("not base64 !!!").is_err());
        assert!(env.decrypt("").is_err());
        assert!(env.decrypt(&BASE64.encode(b"too short")).is_err());
    }

    #[test]
    fn resolve_continues_valid_session() {
        let env = envelope();
        let token = env.encrypt(&env.mint("fp")).unwrap();

        let resolved = env.resolve(Some(&token), "fp");
        assert!(!resolved.is_new);
        assert_eq!(resolved.record.request_count, 2);
        assert!(resolved.record.expires_at > resolved.record.created_at);
    }

    #[test]
    fn resolve_mints_on_missing_or_tampered_token() {
        let env = envelope();

        let fresh = env.resolve(None, "fp");
        assert!(fresh.is_new);
        assert_eq!(fresh.record.request_count, 1);

        let token = env.encrypt(&env.mint("fp")).unwrap();
        let mut raw = BASE64.decode(&token).unwrap();
        raw[SALT_LEN + 3] ^= 0x80;
        let tampered = BASE64.encode(&raw);

        let resolved = env.resolve(Some(&tampered), "fp");
        assert!(resolved.is_new);
        assert_eq!(resolved.record.request_count, 1);
    }

    #[test]
    fn resolve_rejects_idle_expired_session() {
        let env = SessionEnvelope::new("test-master-key", 0, 7 * 24 * 3600);
        let mut record = env.mint("fp");
        record.expires_at = Utc::now() - Duration::seconds(1);

        let token = env.encrypt(&record).unwrap();
        let resolved = env.resolve(Some(&token), "fp");
        assert!(resolved.is_new);
        assert_ne!(resolved.record.id, record.id);
    }

    #[test]
    fn resolve_enforces_absolute_lifetime() {
        let env = envelope();
        let mut record = env.mint("fp");
        // Created longer ago than the 7-day bound, but recently touched
        record.created_at = Utc::now() - Duration::days(8);
        record.expires_at = Utc::now() + Duration::seconds(600);

        let token = env.encrypt(&record).unwrap();
        let resolved = env.resolve(Some(&token), "fp");
        assert!(resolved.is_new);
    }

    #[test]
    fn preferences_round_trip_untouched() {
        let env = envelope();
        let mut record = env.mint("fp");
        record
            .preferences
            .insert("units".to_string(), serde_json::json!("metric"));

        let token = env.encrypt(&record).unwrap();
        let decrypted = env.decrypt(&token).unwrap();
        assert_eq!(
            decrypted.preferences.get("units"),
            Some(&serde_json::json!("metric"))
        );
    }
}

//! HMAC-SHA256 worker tokens.
//!
//! A token is `<workerId>.<expiresAtMillis>.<hex hmac>` where the MAC covers
//! `<workerId>:<expiresAtMillis>` under the coordinator secret. Verification is
//! stateless, so tokens survive a coordinator restart as long as the secret
//! does.

use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use banklock_common::WorkerId;

use crate::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Minimum secret length accepted by [`TokenSigner::new`].
pub const MIN_SECRET_LEN: usize = 16;

/// A freshly minted token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub worker_id: WorkerId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Mints and verifies worker tokens.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenSigner {
    /// Create a signer from a shared secret.
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.len() < MIN_SECRET_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        Ok(Self {
            secret: secret.to_vec(),
            ttl,
        })
    }

    /// Token lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a token for `worker_id` valid from `now` for the configured TTL.
    pub fn issue(&self, worker_id: &WorkerId, now: DateTime<Utc>) -> IssuedToken {
        let expires_at = now + self.ttl;
        let expires_ms = expires_at.timestamp_millis();
        let signature = hex::encode(self.mac(worker_id.as_str(), expires_ms).finalize().into_bytes());

        IssuedToken {
            worker_id: worker_id.clone(),
            token: format!("{}.{}.{}", worker_id, expires_ms, signature),
            expires_at,
        }
    }

    /// Verify `token` for `worker_id` at `now`, returning its expiry.
    pub fn verify(&self, worker_id: &WorkerId, token: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        // Worker ids may contain dots; the last two segments are fixed.
        let mut parts = token.rsplitn(3, '.');
        let signature = parts.next().ok_or(CryptoError::MalformedToken)?;
        let expires_ms: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(CryptoError::MalformedToken)?;
        let claimed_worker = parts.next().ok_or(CryptoError::MalformedToken)?;

        if claimed_worker != worker_id.as_str() {
            return Err(CryptoError::WorkerMismatch);
        }

        let signature = hex::decode(signature).map_err(|_| CryptoError::MalformedToken)?;
        self.mac(claimed_worker, expires_ms)
            .verify_slice(&signature)
            .map_err(|_| CryptoError::InvalidSignature)?;

        let expires_at = Utc
            .timestamp_millis_opt(expires_ms)
            .single()
            .ok_or(CryptoError::MalformedToken)?;
        if now > expires_at {
            return Err(CryptoError::Expired);
        }

        Ok(expires_at)
    }

    fn mac(&self, worker_id: &str, expires_ms: i64) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(worker_id.as_bytes());
        mac.update(b":");
        mac.update(expires_ms.to_string().as_bytes());
        mac
    }
}

/// Generate a random hex secret suitable for [`TokenSigner::new`].
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

//! Server dialback (XEP-0220) keys.
//!
//! The originating server sends `<db:result>` carrying a key derived from a
//! secret only it knows. The receiving server relays that key back to the
//! originating domain's authoritative server over a separate stream as
//! `<db:verify>`, which recomputes the key for the same tuple:
//!
//! ```text
//! key = hex(HMAC-SHA256(hex(SHA-256(secret)), receiving + " " + originating + " " + stream_id))
//! ```
//!
//! A [`DialbackToken`] carries the secret from the moment the key is sent
//! until the single verification request for its stream id arrives.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Length of the random dialback secret in bytes.
const SECRET_LEN: usize = 32;

/// Generate a fresh random secret, hex encoded.
pub fn generate_secret() -> String {
    let bytes: [u8; SECRET_LEN] = rand::random();
    hex::encode(bytes)
}

fn keyed_mac(secret: &str, receiving: &str, originating: &str, stream_id: &str) -> HmacSha256 {
    let hashed_secret = hex::encode(Sha256::digest(secret.as_bytes()));
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(hashed_secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(receiving.as_bytes());
    mac.update(b" ");
    mac.update(originating.as_bytes());
    mac.update(b" ");
    mac.update(stream_id.as_bytes());
    mac
}

/// Derive the dialback key for `(receiving, originating, stream_id)`.
pub fn dialback_key(secret: &str, receiving: &str, originating: &str, stream_id: &str) -> String {
    hex::encode(keyed_mac(secret, receiving, originating, stream_id).finalize().into_bytes())
}

/// Constant-time check of a presented key against the tuple it claims to cover.
pub fn verify_key(secret: &str, receiving: &str, originating: &str, stream_id: &str, key: &str) -> bool {
    let Ok(presented) = hex::decode(key.trim()) else {
        return false;
    };
    keyed_mac(secret, receiving, originating, stream_id)
        .verify_slice(&presented)
        .is_ok()
}

/// The secret behind one outbound dialback attempt.
///
/// Owned by the outbound session while it waits for `<db:result type='valid'>`
/// and parked in the router under its stream id, from which it is taken
/// exactly once by the first `<db:verify>` naming that id.
#[derive(Clone, PartialEq, Eq)]
pub struct DialbackToken {
    secret: String,
    /// Our domain, the one asserting its identity.
    pub originating: String,
    /// The peer domain the key was sent to.
    pub receiving: String,
    pub stream_id: String,
}

impl DialbackToken {
    /// New token with a freshly generated secret.
    pub fn generate(originating: &str, receiving: &str, stream_id: &str) -> Self {
        Self {
            secret: generate_secret(),
            originating: originating.to_owned(),
            receiving: receiving.to_owned(),
            stream_id: stream_id.to_owned(),
        }
    }

    /// The key sent in `<db:result>`.
    pub fn key(&self) -> String {
        dialback_key(&self.secret, &self.receiving, &self.originating, &self.stream_id)
    }

    /// Check a `<db:verify>` request. `from` is the verifying (receiving)
    /// domain, `to` is ours.
    pub fn verify(&self, from: &str, to: &str, stream_id: &str, key: &str) -> bool {
        stream_id == self.stream_id && verify_key(&self.secret, from, to, stream_id, key)
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for DialbackToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialbackToken")
            .field("originating", &self.originating)
            .field("receiving", &self.receiving)
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

//! Read-only views of an established context: the session key and the
//! authenticated identity.

use std::collections::BTreeMap;
use std::fmt;

use kagi_mech::Features;
use kagi_mech::crypto::hash::HASH_LEN;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Attribute naming the wrapper mechanism that chose the inner one.
pub const ATTR_NEGOTIATED_BY: &str = "negotiated_by";

/// Attribute carrying the fingerprint of the peer's static key.
pub const ATTR_PEER_KEY: &str = "peer_key_fingerprint";

/// Symmetric key shared by both peers of an established context.
///
/// Zeroized on drop, compared in constant time, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; HASH_LEN]);

impl SessionKey {
    pub const LEN: usize = HASH_LEN;

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Who the peer is and what the negotiation granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// The authenticated peer principal.
    pub principal: String,
    /// Features both sides agreed to (`SEAL` implies `SIGN`).
    pub features: Features,
    /// Mechanism that authenticated the peer.
    pub mechanism: &'static str,
    /// Whether each side authenticated the other.
    pub mutual: bool,
    pub attributes: BTreeMap<String, String>,
}

impl SessionInfo {
    pub fn new(principal: impl Into<String>, mechanism: &'static str, features: Features) -> Self {
        Self {
            principal: principal.into(),
            features,
            mechanism,
            mutual: false,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_mutual(mut self, mutual: bool) -> Self {
        self.mutual = mutual;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

use core::fmt;

use zeroize::Zeroizing;

use crate::crypto::hash::HASH_LEN;
use crate::features::Features;
use crate::keys::PublicKey;

/// What the caller must do next to advance an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Call `write_message()` to produce the next message.
    WriteMessage,
    /// Call `read_message()` with the peer's message.
    ReadMessage,
    /// The exchange is complete. Call `established()`.
    Complete,
}

/// Outcome of a completed exchange.
pub struct Established {
    pub(crate) session_key: Zeroizing<[u8; HASH_LEN]>,
    pub(crate) peer: String,
    pub(crate) peer_key: Option<PublicKey>,
    pub(crate) features: Features,
    pub(crate) mutual: bool,
}

impl Established {
    /// Key shared by both sides; identical on initiator and acceptor.
    pub fn session_key(&self) -> &[u8; HASH_LEN] {
        &self.session_key
    }

    /// The authenticated peer principal.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// The peer's static key, when the mechanism authenticates one.
    pub fn peer_key(&self) -> Option<&PublicKey> {
        self.peer_key.as_ref()
    }

    /// Features both sides agreed to.
    pub fn features(&self) -> Features {
        self.features
    }

    /// Whether each side authenticated the other.
    pub fn mutual(&self) -> bool {
        self.mutual
    }
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("peer", &self.peer)
            .field("peer_key", &self.peer_key)
            .field("features", &self.features)
            .field("mutual", &self.mutual)
            .finish_non_exhaustive()
    }
}

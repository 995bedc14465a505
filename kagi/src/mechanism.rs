//! The provider interface every mechanism implements.

use std::sync::Arc;

use kagi_mech::{Credentials, Features};

use crate::error::Result;
use crate::registry::Registry;
use crate::session::{SessionInfo, SessionKey};

/// Which side of the exchange a context plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiator.
    Client,
    /// Acceptor.
    Server,
}

/// Result of one step of the token exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Update {
    /// This side has nothing left to do once `output` reaches the peer.
    pub finished: bool,
    /// Token for the peer. May be empty.
    pub output: Vec<u8>,
}

impl Update {
    pub fn more(output: Vec<u8>) -> Self {
        Self {
            finished: false,
            output,
        }
    }

    pub fn done(output: Vec<u8>) -> Self {
        Self {
            finished: true,
            output,
        }
    }
}

/// Configuration a provider is built from.
#[derive(Clone)]
pub struct MechanismOptions {
    pub role: Role,
    pub credentials: Option<Arc<Credentials>>,
    pub features: Features,
    /// Registry the owning context resolved the mechanism from; wrappers use
    /// it to find their sub-mechanisms.
    pub registry: Arc<Registry>,
}

impl MechanismOptions {
    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }
}

/// One concrete mechanism's side of an exchange.
///
/// Providers are driven by a [`SecurityContext`](crate::SecurityContext),
/// which handles chunking and state; `update` always receives one whole peer
/// message, or the empty token when this side speaks first.
pub trait Mechanism: Send {
    /// Consume a peer message and produce the next one.
    fn update(&mut self, input: &[u8]) -> Result<Update>;

    /// Total length of the message starting with `prefix`, or `None` while
    /// the prefix is too short to tell.
    ///
    /// The default treats every token as complete as delivered, which only
    /// works when the peer never splits messages.
    fn message_len(&self, prefix: &[u8]) -> Option<usize> {
        Some(prefix.len())
    }

    fn is_established(&self) -> bool;

    fn session_key(&self) -> Result<SessionKey>;

    fn session_info(&self) -> Result<SessionInfo>;

    /// Protect a message for the peer.
    fn wrap(&mut self, message: &[u8]) -> Result<Vec<u8>>;

    /// Check and strip the protection of a peer message.
    fn unwrap(&mut self, token: &[u8]) -> Result<Vec<u8>>;
}

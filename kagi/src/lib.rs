#![deny(unsafe_code)]

//! # kagi
//!
//! Pluggable authentication-mechanism negotiation built on the
//! [`kagi-mech`] exchanges.
//!
//! This crate provides:
//!
//! - [`SecurityContext`], one side of a token exchange with message
//!   protection once established
//! - [`Registry`] of mechanisms, selectable by name or SASL name
//! - The built-in mechanisms `krb5`, `ntlmssp` and the `spnego` wrapper
//! - [`ContextBuilder`] for constructing configured contexts
//!
//! ## Quick Start
//!
//! ```rust
//! use kagi::{ContextBuilder, Credentials, Features, KeyPair, Selector};
//! use rand_core::OsRng;
//!
//! let client_kp = KeyPair::generate(&mut OsRng);
//! let server_kp = KeyPair::generate(&mut OsRng);
//!
//! let mut client = ContextBuilder::client()
//!     .with_credentials(
//!         Credentials::new("alice")
//!             .with_keypair(client_kp.clone())
//!             .with_service("host/db", server_kp.public),
//!     )
//!     .with_features(Features::SEAL)
//!     .start(Selector::Auto)
//!     .unwrap();
//! let mut server = ContextBuilder::server()
//!     .with_credentials(
//!         Credentials::new("host/db")
//!             .with_keypair(server_kp)
//!             .with_peer("alice", client_kp.public),
//!     )
//!     .with_features(Features::SEAL)
//!     .start(Selector::Auto)
//!     .unwrap();
//!
//! let token = client.update(&[]).unwrap().output;
//! let reply = server.update(&token).unwrap();
//! assert!(reply.finished);
//! assert!(client.update(&reply.output).unwrap().finished);
//!
//! let sealed = server.wrap(b"Hello Client").unwrap();
//! assert_eq!(client.unwrap(&sealed).unwrap(), b"Hello Client");
//! ```

pub mod context;
pub mod error;
pub mod framing;
pub mod mechanism;
pub mod registry;
pub mod session;
pub mod spnego;

pub(crate) mod active_exchange;

pub use kagi_mech::{Credentials, Features, KeyPair, PublicKey};

pub use context::{SecurityContext, Selector, State};
pub use error::{Error, Result};
pub use mechanism::{Mechanism, MechanismOptions, Role, Update};
pub use registry::{MechanismDescriptor, MechanismFactory, Registry, UsablePredicate};
pub use session::{ATTR_NEGOTIATED_BY, ATTR_PEER_KEY, SessionInfo, SessionKey};

use std::sync::Arc;

/// Builder for a configured [`SecurityContext`].
///
/// Uses [`Registry::global`] unless another registry is supplied.
#[derive(Debug)]
pub struct ContextBuilder {
    role: Role,
    registry: Option<Arc<Registry>>,
    credentials: Option<Arc<Credentials>>,
    features: Features,
    max_update_size: Option<usize>,
}

impl ContextBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            registry: None,
            credentials: None,
            features: Features::NONE,
            max_update_size: None,
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_credentials(mut self, credentials: impl Into<Arc<Credentials>>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    /// Request `features` in addition to any requested earlier.
    pub fn with_features(mut self, features: Features) -> Self {
        self.features |= features;
        self
    }

    pub fn with_max_update_size(mut self, size: usize) -> Self {
        self.max_update_size = Some(size);
        self
    }

    /// Build an unstarted context.
    ///
    /// Returns an error if the max update size is zero.
    pub fn build(self) -> Result<SecurityContext> {
        let registry = self.registry.unwrap_or_else(Registry::global);
        let mut ctx = SecurityContext::new(self.role, registry);
        if let Some(credentials) = self.credentials {
            ctx.set_credentials(credentials)?;
        }
        ctx.want_feature(self.features)?;
        if let Some(size) = self.max_update_size {
            ctx.set_max_update_size(size)?;
        }
        Ok(ctx)
    }

    /// Build the context and select its mechanism.
    pub fn start(self, selector: Selector<'_>) -> Result<SecurityContext> {
        let mut ctx = self.build()?;
        ctx.start(selector)?;
        Ok(ctx)
    }
}

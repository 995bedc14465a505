//! Credential material handed to the mechanisms by the caller.
//!
//! The engine never persists or inspects credentials beyond what a mechanism
//! needs for the current role. Secrets are zeroized on drop and never printed.

use std::collections::BTreeMap;
use std::fmt;

use zeroize::Zeroizing;

use crate::crypto::hash::{self, HASH_LEN};
use crate::keys::{KeyPair, PublicKey};

/// Key derived from a principal's password.
pub type PasswordKey = Zeroizing<[u8; HASH_LEN]>;

const PASSWORD_KEY_LABEL: &[u8] = b"kagi password key v1";

/// Normalized form of a principal name used for table lookups.
///
/// Principals are compared ASCII case-insensitively, as account names are.
pub fn normalize_principal(principal: &str) -> String {
    principal.to_ascii_lowercase()
}

/// Derive the challenge/response key for `principal` from `password`.
pub fn password_key(principal: &str, password: &str) -> PasswordKey {
    let salt = hash::hash(PASSWORD_KEY_LABEL);
    hash::hmac_parts(
        &salt,
        &[
            normalize_principal(principal).as_bytes(),
            &[0],
            password.as_bytes(),
        ],
    )
}

/// Credentials for one local principal.
///
/// Which fields are required depends on the mechanism and role:
///
/// | mechanism | initiator                  | acceptor                     |
/// |-----------|----------------------------|------------------------------|
/// | ticket    | keypair + service          | keypair + trusted initiators |
/// | challenge | password                   | at least one account         |
#[derive(Clone)]
pub struct Credentials {
    principal: String,
    password_key: Option<PasswordKey>,
    keypair: Option<KeyPair>,
    service: Option<(String, PublicKey)>,
    peers: BTreeMap<String, PublicKey>,
    accounts: BTreeMap<String, PasswordKey>,
}

impl Credentials {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            password_key: None,
            keypair: None,
            service: None,
            peers: BTreeMap::new(),
            accounts: BTreeMap::new(),
        }
    }

    /// Attach the local principal's password.
    pub fn with_password(mut self, password: &str) -> Self {
        self.password_key = Some(password_key(&self.principal, password));
        self
    }

    /// Attach the local static keypair.
    pub fn with_keypair(mut self, keypair: KeyPair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// The service this principal authenticates to with the ticket mechanism.
    pub fn with_service(mut self, principal: impl Into<String>, key: PublicKey) -> Self {
        self.service = Some((principal.into(), key));
        self
    }

    /// Trust `principal` as a ticket initiator holding `key`.
    pub fn with_peer(mut self, principal: &str, key: PublicKey) -> Self {
        self.peers.insert(normalize_principal(principal), key);
        self
    }

    /// Accept `principal` with `password` in the challenge/response mechanism.
    pub fn with_account(mut self, principal: &str, password: &str) -> Self {
        self.accounts
            .insert(normalize_principal(principal), password_key(principal, password));
        self
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn keypair(&self) -> Option<&KeyPair> {
        self.keypair.as_ref()
    }

    pub fn password_key(&self) -> Option<&PasswordKey> {
        self.password_key.as_ref()
    }

    pub fn service(&self) -> Option<(&str, &PublicKey)> {
        self.service.as_ref().map(|(name, key)| (name.as_str(), key))
    }

    pub fn peer_key(&self, principal: &str) -> Option<&PublicKey> {
        self.peers.get(&normalize_principal(principal))
    }

    pub fn account_key(&self, principal: &str) -> Option<&PasswordKey> {
        self.accounts.get(&normalize_principal(principal))
    }

    pub fn has_accounts(&self) -> bool {
        !self.accounts.is_empty()
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("principal", &self.principal)
            .field("password", &self.password_key.as_ref().map(|_| "[REDACTED]"))
            .field("keypair", &self.keypair)
            .field("service", &self.service)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("accounts", &self.accounts.keys().collect::<Vec<_>>())
            .finish()
    }
}

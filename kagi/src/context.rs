//! The per-connection negotiation context.
//!
//! `SecurityContext` owns one mechanism provider and drives it through the
//! token exchange: it enforces the state machine, splits and reassembles
//! messages that exceed the transport's size limit, and exposes message
//! protection and the session key once the provider completes.

use std::sync::Arc;

use kagi_mech::crypto::hash;
use kagi_mech::{Credentials, Features};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::framing::{Assembly, InboundAssembler, OutboundChunks};
use crate::mechanism::{Mechanism, MechanismOptions, Role, Update};
use crate::registry::{MechanismDescriptor, Registry};
use crate::session::{SessionInfo, SessionKey};

/// Lifecycle of a context. `Established` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No mechanism selected yet.
    Unstarted,
    Negotiating,
    Established,
    Failed,
}

/// How [`SecurityContext::start`] picks its mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector<'a> {
    /// Registered mechanism name, matched exactly.
    Name(&'a str),
    /// SASL name, matched case-insensitively.
    SaslName(&'a str),
    /// The registry's negotiation wrapper.
    Auto,
}

/// One side of an authentication exchange.
///
/// ```rust
/// use std::sync::Arc;
/// use kagi::{Credentials, Features, Registry, SecurityContext};
///
/// let registry = Arc::new(Registry::with_defaults());
/// let mut client = SecurityContext::client(registry.clone());
/// let mut server = SecurityContext::server(registry);
///
/// client.set_credentials(Arc::new(Credentials::new("alice").with_password("pw"))).unwrap();
/// server.set_credentials(Arc::new(Credentials::new("server").with_account("alice", "pw"))).unwrap();
/// client.want_feature(Features::SEAL).unwrap();
/// server.want_feature(Features::SEAL).unwrap();
/// client.start_mech_by_name("ntlmssp").unwrap();
/// server.start_mech_by_name("ntlmssp").unwrap();
///
/// let (mut to_server, mut to_client) = (Vec::new(), Vec::new());
/// let (mut client_done, mut server_done) = (false, false);
/// while !client_done || !server_done {
///     if !client_done {
///         let update = client.update(&to_client).unwrap();
///         client_done = update.finished;
///         to_server = update.output;
///     }
///     if !server_done {
///         let update = server.update(&to_server).unwrap();
///         server_done = update.finished;
///         to_client = update.output;
///     }
/// }
///
/// let sealed = client.wrap(b"Hello Server").unwrap();
/// assert_eq!(server.unwrap(&sealed).unwrap(), b"Hello Server");
/// assert_eq!(client.session_key().unwrap(), server.session_key().unwrap());
/// ```
pub struct SecurityContext {
    role: Role,
    registry: Arc<Registry>,
    state: State,
    descriptor: Option<MechanismDescriptor>,
    mechanism: Option<Box<dyn Mechanism>>,
    credentials: Option<Arc<Credentials>>,
    features: Features,
    max_update_size: Option<usize>,
    outbound: OutboundChunks,
    inbound: InboundAssembler,
    /// Set by the first `update`; configuration is frozen from then on.
    streaming: bool,
}

impl SecurityContext {
    pub fn new(role: Role, registry: Arc<Registry>) -> Self {
        Self {
            role,
            registry,
            state: State::Unstarted,
            descriptor: None,
            mechanism: None,
            credentials: None,
            features: Features::NONE,
            max_update_size: None,
            outbound: OutboundChunks::default(),
            inbound: InboundAssembler::default(),
            streaming: false,
        }
    }

    pub fn client(registry: Arc<Registry>) -> Self {
        Self::new(Role::Client, registry)
    }

    pub fn server(registry: Arc<Registry>) -> Self {
        Self::new(Role::Server, registry)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Name of the selected mechanism, once started.
    pub fn mechanism_name(&self) -> Option<&'static str> {
        self.descriptor.map(|d| d.name)
    }

    /// Features requested by this side.
    pub fn features(&self) -> Features {
        self.features
    }

    pub fn max_update_size(&self) -> Option<usize> {
        self.max_update_size
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn credentials(&self) -> Option<&Arc<Credentials>> {
        self.credentials.as_ref()
    }

    // ===== Configuration =====

    fn ensure_configurable(&self) -> Result<()> {
        if self.state == State::Failed {
            return Err(Error::AlreadyFailed);
        }
        if self.streaming {
            return Err(Error::InvalidState(
                "configuration is fixed once tokens are exchanged",
            ));
        }
        Ok(())
    }

    fn options(&self) -> MechanismOptions {
        MechanismOptions {
            role: self.role,
            credentials: self.credentials.clone(),
            features: self.features,
            registry: self.registry.clone(),
        }
    }

    /// Rebuild the provider so it sees the current configuration.
    fn instantiate(&mut self) {
        if let Some(descriptor) = self.descriptor {
            self.mechanism = Some((descriptor.factory)(self.options()));
        }
    }

    pub fn set_credentials(&mut self, credentials: Arc<Credentials>) -> Result<()> {
        self.ensure_configurable()?;
        self.credentials = Some(credentials);
        self.instantiate();
        Ok(())
    }

    /// Add `feature` to the requested set.
    pub fn want_feature(&mut self, feature: Features) -> Result<()> {
        self.ensure_configurable()?;
        self.features |= feature;
        self.instantiate();
        Ok(())
    }

    /// Cap the size of every token this side emits. Larger mechanism
    /// messages are sent in chunks over several rounds.
    pub fn set_max_update_size(&mut self, size: usize) -> Result<()> {
        self.ensure_configurable()?;
        if size == 0 {
            return Err(Error::InvalidState("max update size must be non-zero"));
        }
        self.max_update_size = Some(size);
        Ok(())
    }

    // ===== Mechanism selection =====

    /// Select a mechanism and move to `Negotiating`.
    ///
    /// On failure nothing changes and the context stays `Unstarted`.
    pub fn start(&mut self, selector: Selector<'_>) -> Result<()> {
        if self.state != State::Unstarted {
            return Err(Error::InvalidState("mechanism already started"));
        }
        let descriptor = *match selector {
            Selector::Name(name) => self.registry.lookup_by_name(name)?,
            Selector::SaslName(name) => self.registry.lookup_by_sasl_name(name)?,
            Selector::Auto => self
                .registry
                .negotiator()
                .ok_or_else(|| Error::UnknownMechanism("auto".to_owned()))?,
        };
        debug!(
            "Starting {} as {:?} (requested {:?})",
            descriptor.name, self.role, self.features
        );
        self.descriptor = Some(descriptor);
        self.instantiate();
        self.state = State::Negotiating;
        Ok(())
    }

    pub fn start_mech_by_name(&mut self, name: &str) -> Result<()> {
        self.start(Selector::Name(name))
    }

    pub fn start_mech_by_sasl_name(&mut self, sasl_name: &str) -> Result<()> {
        self.start(Selector::SaslName(sasl_name))
    }

    /// Start the first mechanism of `preferences` (SASL names, most preferred
    /// first) that the registry knows.
    pub fn start_mech_by_sasl_list(&mut self, preferences: &[&str]) -> Result<()> {
        let found = preferences
            .iter()
            .copied()
            .find(|name| self.registry.lookup_by_sasl_name(name).is_ok());
        match found {
            Some(name) => self.start(Selector::SaslName(name)),
            None => Err(Error::UnknownMechanism(preferences.join(","))),
        }
    }

    // ===== Token exchange =====

    /// Process the peer's token and produce the next one.
    ///
    /// Feed each output to the peer and the peer's output back here until
    /// both sides report `finished`. The first call on the side that speaks
    /// first takes the empty token.
    pub fn update(&mut self, input: &[u8]) -> Result<Update> {
        match self.state {
            State::Negotiating => {}
            State::Failed => return Err(Error::AlreadyFailed),
            State::Unstarted => return Err(Error::InvalidState("no mechanism started")),
            State::Established => return Err(Error::InvalidState("context already established")),
        }
        self.streaming = true;

        match self.step(input) {
            Ok(update) => Ok(update),
            Err(err) => {
                warn!(
                    "{} negotiation failed as {:?}: {}",
                    self.mechanism_name().unwrap_or("unknown"),
                    self.role,
                    err
                );
                self.state = State::Failed;
                self.outbound.clear();
                self.inbound.clear();
                Err(err)
            }
        }
    }

    fn step(&mut self, input: &[u8]) -> Result<Update> {
        if self.outbound.is_draining() {
            if !input.is_empty() {
                return Err(Error::Negotiation(
                    "peer sent a token while a chunked message was pending".into(),
                ));
            }
            let (output, finished) = self
                .outbound
                .next()
                .ok_or(Error::InvalidState("no chunk pending"))?;
            return Ok(self.emit(output, finished));
        }

        let mechanism = self
            .mechanism
            .as_mut()
            .ok_or(Error::InvalidState("no mechanism started"))?;

        let message = if input.is_empty() {
            if self.inbound.is_partial() {
                return Err(Error::Negotiation(
                    "empty token while a chunked message was incomplete".into(),
                ));
            }
            Vec::new()
        } else {
            let assembly = self
                .inbound
                .ingest(input, |prefix| mechanism.message_len(prefix))
                .map_err(|e| Error::Negotiation(e.to_string()))?;
            match assembly {
                Assembly::Complete(message) => message,
                Assembly::Partial => {
                    debug!("Buffered {} byte chunk, waiting for more", input.len());
                    return Ok(Update::more(Vec::new()));
                }
            }
        };

        let update = mechanism.update(&message)?;
        let (output, finished) =
            self.outbound
                .load(update.output, self.max_update_size, update.finished);
        Ok(self.emit(output, finished))
    }

    fn emit(&mut self, output: Vec<u8>, finished: bool) -> Update {
        if finished {
            self.state = State::Established;
            debug!(
                "{} established as {:?}",
                self.mechanism_name().unwrap_or("unknown"),
                self.role
            );
        }
        Update { finished, output }
    }

    // ===== Established context =====

    fn established(&self) -> Result<&dyn Mechanism> {
        match (self.state, &self.mechanism) {
            (State::Established, Some(mechanism)) => Ok(&**mechanism),
            (State::Failed, _) => Err(Error::AlreadyFailed),
            _ => Err(Error::NotEstablished),
        }
    }

    fn established_mut(&mut self) -> Result<&mut Box<dyn Mechanism>> {
        match (self.state, &mut self.mechanism) {
            (State::Established, Some(mechanism)) => Ok(mechanism),
            (State::Failed, _) => Err(Error::AlreadyFailed),
            _ => Err(Error::NotEstablished),
        }
    }

    /// Whether the mechanism has completed and protection is available.
    pub fn is_established(&self) -> bool {
        self.established().is_ok_and(|m| m.is_established())
    }

    /// Protect `message` for the peer: sealed if `SEAL` was granted,
    /// integrity-protected otherwise.
    pub fn wrap(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.established_mut()?.wrap(message)
    }

    /// Verify and strip protection from a token produced by the peer's `wrap`.
    pub fn unwrap(&mut self, token: &[u8]) -> Result<Vec<u8>> {
        self.established_mut()?.unwrap(token)
    }

    pub fn session_key(&self) -> Result<SessionKey> {
        self.established()?.session_key()
    }

    pub fn session_info(&self) -> Result<SessionInfo> {
        self.established()?.session_info()
    }

    /// Derive `out.len()` bytes bound to the session key, `label` and
    /// `context` (RFC 5705 style). Both peers derive the same bytes.
    pub fn export_keying_material(&self, label: &[u8], context: &[u8], out: &mut [u8]) -> Result<()> {
        let key = self.session_key()?;
        let prk = hash::hmac(key.as_bytes(), label);
        if !hash::hkdf_expand(&prk, context, out) {
            return Err(Error::InvalidState("exporter output too long"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("mechanism", &self.mechanism_name())
            .field("features", &self.features)
            .field("max_update_size", &self.max_update_size)
            .finish_non_exhaustive()
    }
}

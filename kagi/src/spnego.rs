//! `spnego`: negotiates which registered mechanism to run, then runs it in
//! an inner [`SecurityContext`].
//!
//! ```text
//!   -> NegInit  { offered mechanisms, optimistic token for the first }
//!   <- NegResp  { incomplete, chosen mechanism, token }
//!   -> NegResp  { incomplete, "", token }
//!   ...
//!   <- NegResp  { completed, chosen mechanism, final token, MIC }
//! ```
//!
//! The server picks the first offered mechanism it can use. The optimistic
//! token is only consumed when that is the first one offered; otherwise the
//! client restarts its inner context with the server's choice. The MIC
//! binds the offer list as the server saw it to the inner session key, so a
//! list stripped in transit fails on the client.
//!
//! A server here with no usable offered mechanism fails its own context with
//! [`Error::NoCompatibleMechanism`] and sends nothing. Clients still accept
//! [`NegState::Reject`] from acceptors that do answer a refused offer, and
//! fail the same way.

use kagi_mech::crypto::hash::{self, HASH_LEN};
use kagi_mech::wire::{self, FrameWriter, Reader};
use kagi_mech::Credentials;
use tracing::debug;
use zeroize::Zeroizing;

use crate::context::SecurityContext;
use crate::error::{Error, Result};
use crate::mechanism::{Mechanism, MechanismOptions, Role, Update};
use crate::registry::MechanismDescriptor;
use crate::session::{ATTR_NEGOTIATED_BY, SessionInfo, SessionKey};

pub const SPNEGO: MechanismDescriptor = MechanismDescriptor {
    name: "spnego",
    sasl_name: "GSS-SPNEGO",
    negotiates: true,
    factory: spnego_factory,
    usable: spnego_usable,
};

/// Frame kind of the client's opening message.
pub const NEG_INIT: u8 = 0x21;
/// Frame kind of every later message, in both directions.
pub const NEG_RESP: u8 = 0x22;

const MIC_LABEL: &[u8] = b"kagi spnego mic";

fn spnego_factory(options: MechanismOptions) -> Box<dyn Mechanism> {
    Box::new(SpnegoMechanism::new(options))
}

/// Usability is decided per sub-mechanism when the offer is built.
fn spnego_usable(_: Role, _: &Credentials) -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegState {
    Incomplete,
    Completed,
    /// Sent by acceptors that answer a refused offer; never emitted here.
    Reject,
}

impl NegState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Incomplete => 0,
            Self::Completed => 1,
            Self::Reject => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Incomplete),
            1 => Ok(Self::Completed),
            2 => Ok(Self::Reject),
            _ => Err(kagi_mech::Error::BadMessage.into()),
        }
    }
}

/// The client's offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegInit {
    pub mechs: Vec<String>,
    /// First message of `mechs[0]`, sent before the server has chosen.
    pub token: Option<Vec<u8>>,
}

impl NegInit {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let count = u8::try_from(self.mechs.len())
            .map_err(|_| Error::Negotiation("too many mechanisms offered".into()))?;
        let mut w = FrameWriter::new(NEG_INIT);
        w.put_u8(count);
        for mech in &self.mechs {
            w.put_str(mech)?;
        }
        match &self.token {
            Some(token) => {
                w.put_u8(1).put_bytes(token)?;
            }
            None => {
                w.put_u8(0);
            }
        }
        Ok(w.finish()?)
    }

    pub fn decode(message: &[u8]) -> Result<Self> {
        let mut r = Reader::new(wire::expect_frame(message, NEG_INIT)?);
        let count = r.u8()?;
        let mut mechs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            mechs.push(r.str()?.to_owned());
        }
        let token = match r.u8()? {
            0 => None,
            1 => Some(r.bytes()?.to_vec()),
            _ => return Err(kagi_mech::Error::BadMessage.into()),
        };
        r.finish()?;
        Ok(Self { mechs, token })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegResp {
    pub state: NegState,
    /// The server's choice; empty in client messages.
    pub mech: String,
    pub token: Vec<u8>,
    /// Mechanism-list MIC, present only with `Completed`.
    pub mic: Vec<u8>,
}

impl NegResp {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = FrameWriter::new(NEG_RESP);
        w.put_u8(self.state.to_u8());
        w.put_str(&self.mech)?.put_bytes(&self.token)?.put_bytes(&self.mic)?;
        Ok(w.finish()?)
    }

    pub fn decode(message: &[u8]) -> Result<Self> {
        let mut r = Reader::new(wire::expect_frame(message, NEG_RESP)?);
        let state = NegState::from_u8(r.u8()?)?;
        let mech = r.str()?.to_owned();
        let token = r.bytes()?.to_vec();
        let mic = r.bytes()?.to_vec();
        r.finish()?;
        Ok(Self {
            state,
            mech,
            token,
            mic,
        })
    }
}

/// MIC over `mechs` keyed from the inner session key.
fn mech_list_mic(key: &SessionKey, mechs: &[String]) -> Zeroizing<[u8; HASH_LEN]> {
    let mic_key = hash::hmac(key.as_bytes(), MIC_LABEL);
    let mut list = Vec::new();
    for mech in mechs {
        list.extend_from_slice(&(mech.len() as u32).to_be_bytes());
        list.extend_from_slice(mech.as_bytes());
    }
    hash::hmac(&*mic_key, &list)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Negotiating,
    Complete,
}

pub(crate) struct SpnegoMechanism {
    options: MechanismOptions,
    phase: Phase,
    /// Offer as sent (client) or received (server); covered by the MIC.
    offer: Vec<String>,
    /// The server has named its choice (client side).
    selected: bool,
    inner: Option<Box<SecurityContext>>,
}

impl SpnegoMechanism {
    fn new(options: MechanismOptions) -> Self {
        Self {
            options,
            phase: Phase::Start,
            offer: Vec::new(),
            selected: false,
            inner: None,
        }
    }

    /// Whether `descriptor` can run as a sub-mechanism on this side.
    fn usable(&self, descriptor: &MechanismDescriptor) -> bool {
        !descriptor.negotiates
            && self
                .options
                .credentials
                .as_deref()
                .is_some_and(|creds| (descriptor.usable)(self.options.role, creds))
    }

    fn inner_context(&self, name: &str) -> Result<Box<SecurityContext>> {
        let mut ctx = SecurityContext::new(self.options.role, self.options.registry.clone());
        if let Some(creds) = &self.options.credentials {
            ctx.set_credentials(creds.clone())?;
        }
        ctx.want_feature(self.options.features)?;
        ctx.start_mech_by_name(name)?;
        Ok(Box::new(ctx))
    }

    fn inner(&self) -> Result<&SecurityContext> {
        self.inner.as_deref().ok_or(Error::NotEstablished)
    }

    fn inner_mut(&mut self) -> Result<&mut SecurityContext> {
        self.inner.as_deref_mut().ok_or(Error::NotEstablished)
    }

    fn ensure_complete(&self) -> Result<()> {
        if self.phase == Phase::Complete {
            Ok(())
        } else {
            Err(Error::NotEstablished)
        }
    }

    // ===== Client =====

    fn client_start(&mut self, input: &[u8]) -> Result<Update> {
        if !input.is_empty() {
            return Err(Error::Negotiation("client speaks first".into()));
        }
        let offer: Vec<String> = self
            .options
            .registry
            .enumerate()
            .filter(|d| self.usable(d))
            .map(|d| d.name.to_owned())
            .collect();
        let first = offer.first().ok_or(Error::NoCompatibleMechanism)?;

        let mut inner = self.inner_context(first)?;
        let optimistic = inner.update(&[])?.output;
        debug!("Offering {:?}", offer);

        let message = NegInit {
            mechs: offer.clone(),
            token: (!optimistic.is_empty()).then_some(optimistic),
        }
        .encode()?;
        self.offer = offer;
        self.inner = Some(inner);
        self.phase = Phase::Negotiating;
        Ok(Update::more(message))
    }

    fn client_continue(&mut self, input: &[u8]) -> Result<Update> {
        let resp = NegResp::decode(input)?;
        if resp.state == NegState::Reject {
            return Err(Error::NoCompatibleMechanism);
        }

        let current = self.inner()?.mechanism_name();
        if !self.selected {
            if !self.offer.contains(&resp.mech) {
                return Err(Error::Negotiation(format!(
                    "server chose {:?}, which was not offered",
                    resp.mech
                )));
            }
            if current != Some(resp.mech.as_str()) {
                debug!("Server chose {}, restarting inner context", resp.mech);
                self.inner = Some(self.inner_context(&resp.mech)?);
            }
            self.selected = true;
        } else if !resp.mech.is_empty() && current != Some(resp.mech.as_str()) {
            return Err(Error::Negotiation("server changed mechanism".into()));
        }

        let inner = self.inner_mut()?;
        let output = if inner.is_established() {
            if !resp.token.is_empty() {
                return Err(Error::Negotiation("token after inner mechanism completed".into()));
            }
            Vec::new()
        } else {
            inner.update(&resp.token)?.output
        };
        let inner_done = inner.is_established();

        match resp.state {
            NegState::Completed => {
                if !inner_done || !output.is_empty() {
                    return Err(Error::Negotiation(
                        "server completed before the inner mechanism".into(),
                    ));
                }
                self.verify_mic(&resp.mic)?;
                self.phase = Phase::Complete;
                Ok(Update::done(Vec::new()))
            }
            _ if output.is_empty() => Err(Error::Negotiation("no token for the server".into())),
            _ => {
                let message = NegResp {
                    state: NegState::Incomplete,
                    mech: String::new(),
                    token: output,
                    mic: Vec::new(),
                }
                .encode()?;
                Ok(Update::more(message))
            }
        }
    }

    fn verify_mic(&self, mic: &[u8]) -> Result<()> {
        let key = self.inner()?.session_key()?;
        let expected = mech_list_mic(&key, &self.offer);
        if !hash::mac_eq(&*expected, mic) {
            return Err(Error::Negotiation("mechanism list MIC mismatch".into()));
        }
        Ok(())
    }

    // ===== Server =====

    fn server_start(&mut self, input: &[u8]) -> Result<Update> {
        let init = NegInit::decode(input)?;
        let registry = self.options.registry.clone();
        let chosen = init.mechs.iter().position(|name| {
            registry
                .lookup_by_name(name)
                .is_ok_and(|descriptor| self.usable(descriptor))
        });
        let Some(index) = chosen else {
            debug!("No usable mechanism in offer {:?}", init.mechs);
            return Err(Error::NoCompatibleMechanism);
        };

        let name = init.mechs[index].clone();
        let mut inner = self.inner_context(&name)?;
        let output = match &init.token {
            Some(token) if index == 0 => inner.update(token)?.output,
            _ => Vec::new(),
        };
        debug!("Selected {} from offer {:?}", name, init.mechs);

        self.offer = init.mechs;
        self.inner = Some(inner);
        self.phase = Phase::Negotiating;
        self.respond(name, output)
    }

    fn server_continue(&mut self, input: &[u8]) -> Result<Update> {
        let resp = NegResp::decode(input)?;
        if resp.state != NegState::Incomplete {
            return Err(Error::Negotiation("unexpected state from client".into()));
        }
        let inner = self.inner_mut()?;
        let output = inner.update(&resp.token)?.output;
        let mech = inner.mechanism_name().unwrap_or_default().to_owned();
        self.respond(mech, output)
    }

    fn respond(&mut self, mech: String, token: Vec<u8>) -> Result<Update> {
        let inner = self.inner()?;
        if !inner.is_established() {
            let message = NegResp {
                state: NegState::Incomplete,
                mech,
                token,
                mic: Vec::new(),
            }
            .encode()?;
            return Ok(Update::more(message));
        }

        let key = inner.session_key()?;
        let mic = mech_list_mic(&key, &self.offer).to_vec();
        let message = NegResp {
            state: NegState::Completed,
            mech,
            token,
            mic,
        }
        .encode()?;
        self.phase = Phase::Complete;
        Ok(Update::done(message))
    }
}

impl Mechanism for SpnegoMechanism {
    fn update(&mut self, input: &[u8]) -> Result<Update> {
        match (self.phase, self.options.role) {
            (Phase::Start, Role::Client) => self.client_start(input),
            (Phase::Start, Role::Server) => self.server_start(input),
            (Phase::Negotiating, Role::Client) => self.client_continue(input),
            (Phase::Negotiating, Role::Server) => self.server_continue(input),
            (Phase::Complete, _) => Err(Error::InvalidState("negotiation already complete")),
        }
    }

    fn message_len(&self, prefix: &[u8]) -> Option<usize> {
        wire::frame_len(prefix)
    }

    fn is_established(&self) -> bool {
        self.phase == Phase::Complete
    }

    fn session_key(&self) -> Result<SessionKey> {
        self.ensure_complete()?;
        self.inner()?.session_key()
    }

    fn session_info(&self) -> Result<SessionInfo> {
        self.ensure_complete()?;
        Ok(self
            .inner()?
            .session_info()?
            .with_attribute(ATTR_NEGOTIATED_BY, SPNEGO.name))
    }

    fn wrap(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.ensure_complete()?;
        self.inner_mut()?.wrap(message)
    }

    fn unwrap(&mut self, token: &[u8]) -> Result<Vec<u8>> {
        self.ensure_complete()?;
        self.inner_mut()?.unwrap(token)
    }
}

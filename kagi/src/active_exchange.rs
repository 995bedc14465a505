//! Built-in exchange mechanisms: `krb5` (ticket) and `ntlmssp`
//! (challenge/response).
//!
//! `ActiveExchange` puts both kagi-mech state machines behind one interface;
//! `ExchangeMechanism` adapts it to the [`Mechanism`] trait and keys the
//! protection channel once the exchange completes.

use kagi_mech::{
    Action, ChallengeExchange, Credentials, Established, Features, Protection, TicketExchange,
    wire,
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::mechanism::{Mechanism, MechanismOptions, Role, Update};
use crate::registry::MechanismDescriptor;
use crate::session::{ATTR_PEER_KEY, SessionInfo, SessionKey};

pub const KRB5: MechanismDescriptor = MechanismDescriptor {
    name: "krb5",
    sasl_name: "GSSAPI",
    negotiates: false,
    factory: krb5_factory,
    usable: krb5_usable,
};

pub const NTLMSSP: MechanismDescriptor = MechanismDescriptor {
    name: "ntlmssp",
    sasl_name: "NTLM",
    negotiates: false,
    factory: ntlmssp_factory,
    usable: ntlmssp_usable,
};

fn krb5_factory(options: MechanismOptions) -> Box<dyn Mechanism> {
    Box::new(ExchangeMechanism::new(Kind::Ticket, options))
}

fn krb5_usable(role: Role, creds: &Credentials) -> bool {
    match role {
        Role::Client => creds.keypair().is_some() && creds.service().is_some(),
        Role::Server => creds.keypair().is_some() && creds.has_peers(),
    }
}

fn ntlmssp_factory(options: MechanismOptions) -> Box<dyn Mechanism> {
    Box::new(ExchangeMechanism::new(Kind::Challenge, options))
}

fn ntlmssp_usable(role: Role, creds: &Credentials) -> bool {
    match role {
        Role::Client => creds.password_key().is_some(),
        Role::Server => creds.has_accounts(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Ticket,
    Challenge,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Self::Ticket => KRB5.name,
            Self::Challenge => NTLMSSP.name,
        }
    }
}

/// Either built-in state machine, boxed to keep the enum small.
enum ActiveExchange {
    Ticket(Box<TicketExchange>),
    Challenge(Box<ChallengeExchange>),
}

impl ActiveExchange {
    fn start(kind: Kind, role: Role, creds: &Credentials, wanted: Features) -> Result<Self> {
        Ok(match (kind, role) {
            (Kind::Ticket, Role::Client) => {
                Self::Ticket(Box::new(TicketExchange::new_initiator(creds, wanted)?))
            }
            (Kind::Ticket, Role::Server) => {
                Self::Ticket(Box::new(TicketExchange::new_acceptor(creds, wanted)?))
            }
            (Kind::Challenge, Role::Client) => {
                Self::Challenge(Box::new(ChallengeExchange::new_initiator(creds, wanted)?))
            }
            (Kind::Challenge, Role::Server) => {
                Self::Challenge(Box::new(ChallengeExchange::new_acceptor(creds, wanted)?))
            }
        })
    }

    fn next_action(&self) -> Action {
        match self {
            Self::Ticket(x) => x.next_action(),
            Self::Challenge(x) => x.next_action(),
        }
    }

    fn write_message(&mut self) -> Result<Vec<u8>, kagi_mech::Error> {
        match self {
            Self::Ticket(x) => x.write_message(),
            Self::Challenge(x) => x.write_message(),
        }
    }

    fn read_message(&mut self, message: &[u8]) -> Result<(), kagi_mech::Error> {
        match self {
            Self::Ticket(x) => x.read_message(message),
            Self::Challenge(x) => x.read_message(message),
        }
    }

    fn established(&self) -> Result<Established, kagi_mech::Error> {
        match self {
            Self::Ticket(x) => x.established(),
            Self::Challenge(x) => x.established(),
        }
    }
}

/// A completed exchange and the channel keyed from it.
struct Completed {
    established: Established,
    protection: Protection,
}

pub(crate) struct ExchangeMechanism {
    kind: Kind,
    options: MechanismOptions,
    /// Built on the first update, so credentials may be attached after start.
    exchange: Option<ActiveExchange>,
    completed: Option<Completed>,
}

impl ExchangeMechanism {
    fn new(kind: Kind, options: MechanismOptions) -> Self {
        Self {
            kind,
            options,
            exchange: None,
            completed: None,
        }
    }

    fn exchange(&mut self) -> Result<&mut ActiveExchange> {
        if self.exchange.is_none() {
            let creds = self
                .options
                .credentials
                .as_deref()
                .ok_or(Error::MissingCredentials("no credentials attached"))?;
            let exchange =
                ActiveExchange::start(self.kind, self.options.role, creds, self.options.features)?;
            self.exchange = Some(exchange);
        }
        self.exchange
            .as_mut()
            .ok_or(Error::InvalidState("exchange not started"))
    }

    fn completed(&self) -> Result<&Completed> {
        self.completed.as_ref().ok_or(Error::NotEstablished)
    }
}

impl Mechanism for ExchangeMechanism {
    fn update(&mut self, input: &[u8]) -> Result<Update> {
        if self.completed.is_some() {
            return Err(Error::InvalidState("exchange already complete"));
        }
        let exchange = self.exchange()?;

        match (exchange.next_action(), input.is_empty()) {
            (Action::ReadMessage, false) => exchange.read_message(input)?,
            (Action::ReadMessage, true) => {
                return Err(Error::Negotiation("expected a token from the peer".into()));
            }
            (_, false) => {
                return Err(Error::Negotiation("unexpected token from the peer".into()));
            }
            (_, true) => {}
        }

        let output = match exchange.next_action() {
            Action::WriteMessage => exchange.write_message()?,
            _ => Vec::new(),
        };

        if exchange.next_action() != Action::Complete {
            return Ok(Update::more(output));
        }

        let established = exchange.established()?;
        let protection = Protection::new(
            established.session_key(),
            self.options.is_client(),
            established.features(),
        );
        debug!(
            "{} exchange complete, peer {}",
            self.kind.name(),
            established.peer()
        );
        self.completed = Some(Completed {
            established,
            protection,
        });
        self.exchange = None;
        Ok(Update::done(output))
    }

    fn message_len(&self, prefix: &[u8]) -> Option<usize> {
        wire::frame_len(prefix)
    }

    fn is_established(&self) -> bool {
        self.completed.is_some()
    }

    fn session_key(&self) -> Result<SessionKey> {
        Ok(SessionKey::from_bytes(
            *self.completed()?.established.session_key(),
        ))
    }

    fn session_info(&self) -> Result<SessionInfo> {
        let established = &self.completed()?.established;
        let info = SessionInfo::new(established.peer(), self.kind.name(), established.features())
            .with_mutual(established.mutual());
        Ok(match established.peer_key() {
            Some(key) => info.with_attribute(ATTR_PEER_KEY, key.fingerprint()),
            None => info,
        })
    }

    fn wrap(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let completed = self.completed.as_mut().ok_or(Error::NotEstablished)?;
        Ok(completed.protection.wrap(message)?)
    }

    fn unwrap(&mut self, token: &[u8]) -> Result<Vec<u8>> {
        let completed = self.completed.as_mut().ok_or(Error::NotEstablished)?;
        Ok(completed.protection.unwrap(token)?)
    }
}

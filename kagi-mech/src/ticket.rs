use rand_core::{CryptoRngCore, OsRng};
use x25519_dalek::StaticSecret as DalekStaticSecret;

use crate::credentials::{Credentials, normalize_principal};
use crate::crypto::aead::AEAD_TAG_LEN;
use crate::crypto::hash;
use crate::crypto::x25519::{self, DH_LEN};
use crate::error::Error;
use crate::exchange::{Action, Established};
use crate::features::Features;
use crate::keys::{KeyPair, PublicKey};
use crate::symmetric_state::SymmetricState;
use crate::wire::{self, FrameWriter, Reader};

/// Fixed ciphersuite of the ticket exchange.
pub const PROTOCOL_NAME: &str = "Kagi_Ticket_IK_25519_ChaChaPoly_BLAKE2s";

/// Frame kind of the initiator's request.
pub const AP_REQ: u8 = 0x01;
/// Frame kind of the acceptor's reply.
pub const AP_REP: u8 = 0x02;

const PAYLOAD: u8 = 0x00;
const PROLOGUE: &[u8] = b"kagi ticket v1";
const SESSION_KEY_LABEL: &[u8] = b"kagi session key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InitiatorWriteReq,
    InitiatorReadRep,
    AcceptorReadReq,
    AcceptorWriteRep,
    Complete,
}

/// Ticket-based mutual authentication between a client principal and a
/// named service, both holding X25519 static keys.
///
/// The client knows the service key in advance; the service knows which
/// client keys it trusts. Two messages, IK pattern:
///
/// ```text
///   <- s
///   ...
///   -> e, es, s, ss    AP-REQ { client, service, requested features }
///   <- e, ee, se       AP-REP { granted features }
/// ```
///
/// The acceptor completes after writing AP-REP, the initiator after
/// reading it. Both sides then derive the same session key.
pub struct TicketExchange {
    symmetric: SymmetricState,
    phase: Phase,
    is_initiator: bool,
    credentials: Credentials,
    local: KeyPair,
    wanted: Features,
    granted: Features,
    /// Peer principal: the service for an initiator, the client for an acceptor.
    peer: Option<String>,
    rs: Option<PublicKey>,
    e: Option<DalekStaticSecret>,
    re: Option<[u8; DH_LEN]>,
}

impl TicketExchange {
    /// Start as the client. Needs a keypair and a target service.
    pub fn new_initiator(credentials: &Credentials, wanted: Features) -> Result<Self, Error> {
        let local = credentials.keypair().ok_or(Error::MissingCredentials)?.clone();
        let (service, service_key) = credentials.service().ok_or(Error::MissingCredentials)?;

        let mut symmetric = SymmetricState::initialize(PROTOCOL_NAME);
        symmetric.mix_hash(PROLOGUE);
        // <- s
        symmetric.mix_hash(service_key.as_bytes());

        Ok(Self {
            symmetric,
            phase: Phase::InitiatorWriteReq,
            is_initiator: true,
            local,
            wanted,
            granted: Features::NONE,
            peer: Some(service.to_owned()),
            rs: Some(*service_key),
            e: None,
            re: None,
            credentials: credentials.clone(),
        })
    }

    /// Start as the service. Needs a keypair; clients are checked against
    /// the trusted peers of `credentials`.
    pub fn new_acceptor(credentials: &Credentials, wanted: Features) -> Result<Self, Error> {
        let local = credentials.keypair().ok_or(Error::MissingCredentials)?.clone();

        let mut symmetric = SymmetricState::initialize(PROTOCOL_NAME);
        symmetric.mix_hash(PROLOGUE);
        // <- s (our own)
        symmetric.mix_hash(local.public.as_bytes());

        Ok(Self {
            symmetric,
            phase: Phase::AcceptorReadReq,
            is_initiator: false,
            local,
            wanted,
            granted: Features::NONE,
            peer: None,
            rs: None,
            e: None,
            re: None,
            credentials: credentials.clone(),
        })
    }

    pub fn next_action(&self) -> Action {
        match self.phase {
            Phase::InitiatorWriteReq | Phase::AcceptorWriteRep => Action::WriteMessage,
            Phase::InitiatorReadRep | Phase::AcceptorReadReq => Action::ReadMessage,
            Phase::Complete => Action::Complete,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn write_message(&mut self) -> Result<Vec<u8>, Error> {
        self.write_message_with_rng(&mut OsRng)
    }

    /// Write the next message with a specific RNG (useful for testing).
    pub fn write_message_with_rng(&mut self, rng: &mut impl CryptoRngCore) -> Result<Vec<u8>, Error> {
        match self.phase {
            Phase::InitiatorWriteReq => self.write_req(rng),
            Phase::AcceptorWriteRep => self.write_rep(rng),
            _ => Err(Error::WrongState),
        }
    }

    pub fn read_message(&mut self, message: &[u8]) -> Result<(), Error> {
        match self.phase {
            Phase::AcceptorReadReq => self.read_req(message),
            Phase::InitiatorReadRep => self.read_rep(message),
            _ => Err(Error::WrongState),
        }
    }

    /// Session key and peer identity of the completed exchange.
    pub fn established(&self) -> Result<Established, Error> {
        if self.phase != Phase::Complete {
            return Err(Error::WrongState);
        }
        Ok(Established {
            session_key: self.symmetric.derive(SESSION_KEY_LABEL),
            peer: self.peer.clone().ok_or(Error::WrongState)?,
            peer_key: self.rs,
            features: self.granted,
            mutual: true,
        })
    }

    fn remote_static(&self) -> Result<[u8; DH_LEN], Error> {
        self.rs.map(|k| *k.as_bytes()).ok_or(Error::WrongState)
    }

    // ===== AP-REQ: [e(32)][enc s(32+16)][enc payload] =====

    fn write_req(&mut self, rng: &mut impl CryptoRngCore) -> Result<Vec<u8>, Error> {
        let rs = self.remote_static()?;
        let service = self.peer.as_deref().ok_or(Error::WrongState)?;

        let mut payload = FrameWriter::new(PAYLOAD);
        payload
            .put_str(self.credentials.principal())?
            .put_str(service)?
            .put_u32(self.wanted.bits());
        let payload = payload.finish()?;

        // -> e
        let (e, e_pub) = x25519::ephemeral(rng);
        self.symmetric.mix_hash(&e_pub);

        // -> es
        let es = x25519::dh(&e, &rs)?;
        self.symmetric.mix_key(es.as_bytes());
        self.e = Some(e);

        // -> s
        let enc_s = self.symmetric.encrypt_and_hash(self.local.public.as_bytes())?;

        // -> ss
        let ss = x25519::dh(self.local.secret.inner(), &rs)?;
        self.symmetric.mix_key(ss.as_bytes());

        let enc_payload = self.symmetric.encrypt_and_hash(&payload)?;

        let mut frame = FrameWriter::new(AP_REQ);
        frame.put_raw(&e_pub).put_raw(&enc_s).put_raw(&enc_payload);
        let frame = frame.finish()?;

        self.phase = Phase::InitiatorReadRep;
        Ok(frame)
    }

    fn read_req(&mut self, message: &[u8]) -> Result<(), Error> {
        let mut r = Reader::new(wire::expect_frame(message, AP_REQ)?);

        // -> e
        let re = r.array::<DH_LEN>()?;
        self.symmetric.mix_hash(&re);

        // -> es
        let es = x25519::dh(self.local.secret.inner(), &re)?;
        self.symmetric.mix_key(es.as_bytes());

        // -> s; failing here means the client used another service key.
        let enc_s = r.raw(DH_LEN + AEAD_TAG_LEN)?;
        let s = self
            .symmetric
            .decrypt_and_hash(enc_s)
            .map_err(|_| Error::AuthenticationFailed)?;
        let mut rs = [0u8; DH_LEN];
        if s.len() != DH_LEN {
            return Err(Error::BadMessage);
        }
        rs.copy_from_slice(&s);

        // -> ss
        let ss = x25519::dh(self.local.secret.inner(), &rs)?;
        self.symmetric.mix_key(ss.as_bytes());

        let payload = self.symmetric.decrypt_and_hash(r.rest())?;
        let mut p = Reader::new(wire::expect_frame(&payload, PAYLOAD)?);
        let client = p.str()?;
        let service = p.str()?;
        let requested = Features::from_bits_truncate(p.u32()?);
        p.finish()?;

        if normalize_principal(service) != normalize_principal(self.credentials.principal()) {
            return Err(Error::AuthenticationFailed);
        }
        let trusted = self
            .credentials
            .peer_key(client)
            .ok_or(Error::AuthenticationFailed)?;
        if !hash::mac_eq(trusted.as_bytes(), &rs) {
            return Err(Error::AuthenticationFailed);
        }

        self.granted = Features::negotiate(self.wanted, requested);
        self.peer = Some(client.to_owned());
        self.rs = Some(PublicKey::from_bytes(rs));
        self.re = Some(re);
        self.phase = Phase::AcceptorWriteRep;
        Ok(())
    }

    // ===== AP-REP: [e(32)][enc payload] =====

    fn write_rep(&mut self, rng: &mut impl CryptoRngCore) -> Result<Vec<u8>, Error> {
        let re = self.re.ok_or(Error::WrongState)?;
        let rs = self.remote_static()?;

        let mut payload = FrameWriter::new(PAYLOAD);
        payload.put_u32(self.granted.bits());
        let payload = payload.finish()?;

        // <- e
        let (e, e_pub) = x25519::ephemeral(rng);
        self.symmetric.mix_hash(&e_pub);

        // <- ee
        let ee = x25519::dh(&e, &re)?;
        self.symmetric.mix_key(ee.as_bytes());

        // <- se
        let se = x25519::dh(&e, &rs)?;
        self.symmetric.mix_key(se.as_bytes());

        let enc_payload = self.symmetric.encrypt_and_hash(&payload)?;

        let mut frame = FrameWriter::new(AP_REP);
        frame.put_raw(&e_pub).put_raw(&enc_payload);
        let frame = frame.finish()?;

        self.phase = Phase::Complete;
        Ok(frame)
    }

    fn read_rep(&mut self, message: &[u8]) -> Result<(), Error> {
        let mut r = Reader::new(wire::expect_frame(message, AP_REP)?);

        // <- e
        let re = r.array::<DH_LEN>()?;
        self.symmetric.mix_hash(&re);

        // <- ee
        let e = self.e.as_ref().ok_or(Error::WrongState)?;
        let ee = x25519::dh(e, &re)?;
        self.symmetric.mix_key(ee.as_bytes());

        // <- se
        let se = x25519::dh(self.local.secret.inner(), &re)?;
        self.symmetric.mix_key(se.as_bytes());

        // Only the holder of the service secret can produce this payload.
        let payload = self
            .symmetric
            .decrypt_and_hash(r.rest())
            .map_err(|_| Error::AuthenticationFailed)?;
        let mut p = Reader::new(wire::expect_frame(&payload, PAYLOAD)?);
        let granted = Features::from_bits_truncate(p.u32()?);
        p.finish()?;

        if !self.wanted.normalized().contains(granted) {
            return Err(Error::BadMessage);
        }

        self.granted = granted;
        self.re = Some(re);
        self.phase = Phase::Complete;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn parties() -> (Credentials, Credentials) {
        let client_kp = KeyPair::from_secret_bytes([1u8; 32]);
        let service_kp = KeyPair::from_secret_bytes([2u8; 32]);
        let client = Credentials::new("alice@EXAMPLE")
            .with_keypair(client_kp.clone())
            .with_service("host/server", service_kp.public);
        let service = Credentials::new("host/server")
            .with_keypair(service_kp)
            .with_peer("alice@example", client_kp.public);
        (client, service)
    }

    fn run(
        client: &mut TicketExchange,
        service: &mut TicketExchange,
    ) -> Result<(), Error> {
        let mut rng = StdRng::seed_from_u64(7);
        let req = client.write_message_with_rng(&mut rng)?;
        service.read_message(&req)?;
        let rep = service.write_message_with_rng(&mut rng)?;
        client.read_message(&rep)
    }

    #[test]
    fn exchange_establishes_matching_keys() {
        let (c, s) = parties();
        let mut client = TicketExchange::new_initiator(&c, Features::SEAL).unwrap();
        let mut service = TicketExchange::new_acceptor(&s, Features::SIGN | Features::SEAL).unwrap();
        assert_eq!(client.next_action(), Action::WriteMessage);
        assert_eq!(service.next_action(), Action::ReadMessage);

        run(&mut client, &mut service).unwrap();
        assert_eq!(client.next_action(), Action::Complete);
        assert_eq!(service.next_action(), Action::Complete);

        let ce = client.established().unwrap();
        let se = service.established().unwrap();
        assert_eq!(ce.session_key(), se.session_key());
        assert_eq!(ce.peer(), "host/server");
        assert_eq!(se.peer(), "alice@EXAMPLE");
        assert_eq!(ce.features(), Features::SIGN | Features::SEAL);
        assert_eq!(se.features(), ce.features());
        assert!(ce.mutual() && se.mutual());
    }

    #[test]
    fn untrusted_client_rejected() {
        let (c, _) = parties();
        let service_kp = KeyPair::from_secret_bytes([2u8; 32]);
        let s = Credentials::new("host/server").with_keypair(service_kp);
        let mut client = TicketExchange::new_initiator(&c, Features::SIGN).unwrap();
        let mut service = TicketExchange::new_acceptor(&s, Features::SIGN).unwrap();
        assert_eq!(run(&mut client, &mut service), Err(Error::AuthenticationFailed));
    }

    #[test]
    fn wrong_service_key_rejected() {
        let (c, s) = parties();
        let imposter = KeyPair::from_secret_bytes([3u8; 32]);
        let c = c.with_service("host/server", imposter.public);
        let mut client = TicketExchange::new_initiator(&c, Features::SIGN).unwrap();
        let mut service = TicketExchange::new_acceptor(&s, Features::SIGN).unwrap();
        assert_eq!(run(&mut client, &mut service), Err(Error::AuthenticationFailed));
    }

    #[test]
    fn ticket_for_other_service_rejected() {
        let (c, s) = parties();
        let service_pub = s.keypair().unwrap().public;
        let c = c.with_service("host/other", service_pub);
        let mut client = TicketExchange::new_initiator(&c, Features::SIGN).unwrap();
        let mut service = TicketExchange::new_acceptor(&s, Features::SIGN).unwrap();
        assert_eq!(run(&mut client, &mut service), Err(Error::AuthenticationFailed));
    }

    #[test]
    fn missing_keypair_is_reported() {
        let creds = Credentials::new("alice");
        assert_eq!(
            TicketExchange::new_initiator(&creds, Features::NONE).err(),
            Some(Error::MissingCredentials)
        );
        assert_eq!(
            TicketExchange::new_acceptor(&creds, Features::NONE).err(),
            Some(Error::MissingCredentials)
        );
    }

    #[test]
    fn tampered_reply_rejected() {
        let (c, s) = parties();
        let mut client = TicketExchange::new_initiator(&c, Features::SIGN).unwrap();
        let mut service = TicketExchange::new_acceptor(&s, Features::SIGN).unwrap();
        let req = client.write_message().unwrap();
        service.read_message(&req).unwrap();
        let mut rep = service.write_message().unwrap();
        let last = rep.len() - 1;
        rep[last] ^= 0x01;
        assert_eq!(client.read_message(&rep), Err(Error::AuthenticationFailed));
    }

    #[test]
    fn out_of_order_calls_rejected() {
        let (c, _) = parties();
        let mut client = TicketExchange::new_initiator(&c, Features::SIGN).unwrap();
        assert_eq!(client.read_message(&[AP_REP, 0, 0]), Err(Error::WrongState));
        assert!(client.established().is_err());
    }
}

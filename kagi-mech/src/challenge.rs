use rand_core::{CryptoRngCore, OsRng};
use zeroize::Zeroizing;

use crate::credentials::{Credentials, PasswordKey, normalize_principal};
use crate::crypto::hash::{self, HASH_LEN};
use crate::error::Error;
use crate::exchange::{Action, Established};
use crate::features::Features;
use crate::wire::{self, FrameWriter, Reader};

/// Frame kind of the client's opening message.
pub const NEGOTIATE: u8 = 0x11;
/// Frame kind of the server's challenge.
pub const CHALLENGE: u8 = 0x12;
/// Frame kind of the client's proof.
pub const AUTHENTICATE: u8 = 0x13;

const NONCE_LEN: usize = 32;
const PROOF_LABEL: &[u8] = b"kagi authenticate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InitiatorWriteNegotiate,
    InitiatorReadChallenge,
    InitiatorWriteAuthenticate,
    AcceptorReadNegotiate,
    AcceptorWriteChallenge,
    AcceptorReadAuthenticate,
    Complete,
}

/// Three-message challenge/response over a shared password key.
///
/// ```text
///   -> NEGOTIATE     { requested }
///   <- CHALLENGE     { granted, server nonce, target }
///   -> AUTHENTICATE  { principal, client nonce, granted, proof }
/// ```
///
/// Every message is absorbed into a transcript hash. The password key and
/// the transcript give `(proof key, session key)`; the proof is a MAC under
/// the proof key. Only the client proves anything, so the client completes
/// as soon as AUTHENTICATE is written and neither side reports mutual
/// authentication.
pub struct ChallengeExchange {
    phase: Phase,
    is_initiator: bool,
    credentials: Credentials,
    wanted: Features,
    granted: Features,
    transcript: [u8; HASH_LEN],
    server_nonce: Option<[u8; NONCE_LEN]>,
    peer: Option<String>,
    session_key: Option<Zeroizing<[u8; HASH_LEN]>>,
}

impl ChallengeExchange {
    /// Start as the client. Needs a password.
    pub fn new_initiator(credentials: &Credentials, wanted: Features) -> Result<Self, Error> {
        if credentials.password_key().is_none() {
            return Err(Error::MissingCredentials);
        }
        Ok(Self::new(credentials, wanted, true, Phase::InitiatorWriteNegotiate))
    }

    /// Start as the server. Needs at least one account.
    pub fn new_acceptor(credentials: &Credentials, wanted: Features) -> Result<Self, Error> {
        if !credentials.has_accounts() {
            return Err(Error::MissingCredentials);
        }
        Ok(Self::new(credentials, wanted, false, Phase::AcceptorReadNegotiate))
    }

    fn new(credentials: &Credentials, wanted: Features, is_initiator: bool, phase: Phase) -> Self {
        Self {
            phase,
            is_initiator,
            credentials: credentials.clone(),
            wanted,
            granted: Features::NONE,
            transcript: hash::hash(b"kagi challenge v1"),
            server_nonce: None,
            peer: None,
            session_key: None,
        }
    }

    pub fn next_action(&self) -> Action {
        match self.phase {
            Phase::InitiatorWriteNegotiate
            | Phase::InitiatorWriteAuthenticate
            | Phase::AcceptorWriteChallenge => Action::WriteMessage,
            Phase::InitiatorReadChallenge
            | Phase::AcceptorReadNegotiate
            | Phase::AcceptorReadAuthenticate => Action::ReadMessage,
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
            Phase::InitiatorWriteNegotiate => self.write_negotiate(),
            Phase::AcceptorWriteChallenge => self.write_challenge(rng),
            Phase::InitiatorWriteAuthenticate => self.write_authenticate(rng),
            _ => Err(Error::WrongState),
        }
    }

    pub fn read_message(&mut self, message: &[u8]) -> Result<(), Error> {
        match self.phase {
            Phase::AcceptorReadNegotiate => self.read_negotiate(message),
            Phase::InitiatorReadChallenge => self.read_challenge(message),
            Phase::AcceptorReadAuthenticate => self.read_authenticate(message),
            _ => Err(Error::WrongState),
        }
    }

    pub fn established(&self) -> Result<Established, Error> {
        if self.phase != Phase::Complete {
            return Err(Error::WrongState);
        }
        let session_key = self.session_key.as_ref().ok_or(Error::WrongState)?;
        Ok(Established {
            session_key: Zeroizing::new(**session_key),
            peer: self.peer.clone().ok_or(Error::WrongState)?,
            peer_key: None,
            features: self.granted,
            mutual: false,
        })
    }

    fn absorb(&mut self, message: &[u8]) {
        self.transcript = hash::hash_two(&self.transcript, message);
    }

    /// `(proof key, session key)` for `principal` over the transcript so far.
    fn derive(
        &self,
        key: &PasswordKey,
        principal: &str,
        client_nonce: &[u8; NONCE_LEN],
    ) -> Result<(Zeroizing<[u8; HASH_LEN]>, Zeroizing<[u8; HASH_LEN]>), Error> {
        let server_nonce = self.server_nonce.ok_or(Error::WrongState)?;
        let binding = hash::hmac_parts(
            &self.transcript,
            &[
                normalize_principal(principal).as_bytes(),
                &[0],
                &server_nonce,
                client_nonce,
            ],
        );
        Ok(hash::hkdf2(key, &*binding))
    }

    // ===== NEGOTIATE =====

    fn write_negotiate(&mut self) -> Result<Vec<u8>, Error> {
        let mut frame = FrameWriter::new(NEGOTIATE);
        frame.put_u32(self.wanted.bits());
        let frame = frame.finish()?;
        self.absorb(&frame);
        self.phase = Phase::InitiatorReadChallenge;
        Ok(frame)
    }

    fn read_negotiate(&mut self, message: &[u8]) -> Result<(), Error> {
        let mut r = Reader::new(wire::expect_frame(message, NEGOTIATE)?);
        let requested = Features::from_bits_truncate(r.u32()?);
        r.finish()?;
        self.granted = Features::negotiate(self.wanted, requested);
        self.absorb(message);
        self.phase = Phase::AcceptorWriteChallenge;
        Ok(())
    }

    // ===== CHALLENGE =====

    fn write_challenge(&mut self, rng: &mut impl CryptoRngCore) -> Result<Vec<u8>, Error> {
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);

        let mut frame = FrameWriter::new(CHALLENGE);
        frame.put_u32(self.granted.bits()).put_raw(&nonce);
        frame.put_str(self.credentials.principal())?;
        let frame = frame.finish()?;

        self.absorb(&frame);
        self.server_nonce = Some(nonce);
        self.phase = Phase::AcceptorReadAuthenticate;
        Ok(frame)
    }

    fn read_challenge(&mut self, message: &[u8]) -> Result<(), Error> {
        let mut r = Reader::new(wire::expect_frame(message, CHALLENGE)?);
        let granted = Features::from_bits_truncate(r.u32()?);
        let nonce = r.array::<NONCE_LEN>()?;
        let target = r.str()?;
        r.finish()?;

        if !self.wanted.normalized().contains(granted) {
            return Err(Error::BadMessage);
        }

        self.granted = granted;
        self.server_nonce = Some(nonce);
        self.peer = Some(target.to_owned());
        self.absorb(message);
        self.phase = Phase::InitiatorWriteAuthenticate;
        Ok(())
    }

    // ===== AUTHENTICATE =====

    fn write_authenticate(&mut self, rng: &mut impl CryptoRngCore) -> Result<Vec<u8>, Error> {
        let key = self
            .credentials
            .password_key()
            .ok_or(Error::MissingCredentials)?
            .clone();
        let principal = self.credentials.principal().to_owned();

        let mut client_nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut client_nonce);

        let (proof_key, session_key) = self.derive(&key, &principal, &client_nonce)?;
        let proof = hash::hmac(&*proof_key, PROOF_LABEL);

        let mut frame = FrameWriter::new(AUTHENTICATE);
        frame.put_str(&principal)?;
        frame
            .put_raw(&client_nonce)
            .put_u32(self.granted.bits())
            .put_raw(&*proof);
        let frame = frame.finish()?;

        self.session_key = Some(session_key);
        self.absorb(&frame);
        self.phase = Phase::Complete;
        Ok(frame)
    }

    fn read_authenticate(&mut self, message: &[u8]) -> Result<(), Error> {
        let mut r = Reader::new(wire::expect_frame(message, AUTHENTICATE)?);
        let principal = r.str()?;
        let client_nonce = r.array::<NONCE_LEN>()?;
        let granted = Features::from_bits_truncate(r.u32()?);
        let proof = r.raw(HASH_LEN)?;
        r.finish()?;

        if granted != self.granted {
            return Err(Error::BadMessage);
        }

        let key = self
            .credentials
            .account_key(principal)
            .ok_or(Error::AuthenticationFailed)?
            .clone();
        let (proof_key, session_key) = self.derive(&key, principal, &client_nonce)?;
        let expected = hash::hmac(&*proof_key, PROOF_LABEL);
        if !hash::mac_eq(&*expected, proof) {
            return Err(Error::AuthenticationFailed);
        }

        self.session_key = Some(session_key);
        self.peer = Some(principal.to_owned());
        self.absorb(message);
        self.phase = Phase::Complete;
        Ok(())
    }
}

use crate::cipher_state::{CipherState, SIGN_TAG_LEN};
use crate::crypto::aead::AEAD_TAG_LEN;
use crate::crypto::hash::{self, HASH_LEN};
use crate::error::Error;
use crate::features::Features;

const MODE_SIGN: u8 = 0x01;
const MODE_SEAL: u8 = 0x02;
const KEY_LABEL: &[u8] = b"kagi protection";

/// Per-message protection after an exchange completes.
///
/// Holds two [`CipherState`]s split from the session key, one per
/// direction. With `SEAL` granted, messages are AEAD-sealed; otherwise they
/// travel in the clear with a MAC. Both modes bind a sequence counter, so
/// replayed, reordered or altered messages fail to unwrap.
///
/// Wire form: `[mode u8][payload]` where payload is `ciphertext || tag` when
/// sealed and `message || tag16` when signed.
pub struct Protection {
    send: CipherState,
    recv: CipherState,
    seal: bool,
}

impl Protection {
    pub fn new(session_key: &[u8; HASH_LEN], is_initiator: bool, features: Features) -> Self {
        let (i2a, a2i) = hash::hkdf2(session_key, KEY_LABEL);
        let (send, recv) = if is_initiator { (i2a, a2i) } else { (a2i, i2a) };
        Self {
            send: CipherState::with_key(*send),
            recv: CipherState::with_key(*recv),
            seal: features.contains(Features::SEAL),
        }
    }

    /// Whether outgoing messages are encrypted.
    pub fn seals(&self) -> bool {
        self.seal
    }

    /// Bytes added to every wrapped message.
    pub fn overhead(&self) -> usize {
        1 + if self.seal { AEAD_TAG_LEN } else { SIGN_TAG_LEN }
    }

    pub fn wrap(&mut self, message: &[u8]) -> Result<Vec<u8>, Error> {
        if self.seal {
            let mut out = Vec::with_capacity(message.len() + self.overhead());
            out.push(MODE_SEAL);
            out.extend_from_slice(&self.send.encrypt_with_ad(&[MODE_SEAL], message)?);
            Ok(out)
        } else {
            let tag = self.send.sign(&[MODE_SIGN], message)?;
            let mut out = Vec::with_capacity(message.len() + self.overhead());
            out.push(MODE_SIGN);
            out.extend_from_slice(message);
            out.extend_from_slice(&tag);
            Ok(out)
        }
    }

    pub fn unwrap(&mut self, wrapped: &[u8]) -> Result<Vec<u8>, Error> {
        let (&mode, body) = wrapped.split_first().ok_or(Error::IntegrityFailure)?;
        let expected = if self.seal { MODE_SEAL } else { MODE_SIGN };
        if mode != expected {
            return Err(Error::IntegrityFailure);
        }

        if self.seal {
            self.recv
                .decrypt_with_ad(&[MODE_SEAL], body)
                .map_err(|_| Error::IntegrityFailure)
        } else {
            if body.len() < SIGN_TAG_LEN {
                return Err(Error::IntegrityFailure);
            }
            let (message, tag) = body.split_at(body.len() - SIGN_TAG_LEN);
            self.recv.verify(&[MODE_SIGN], message, tag)?;
            Ok(message.to_vec())
        }
    }
}

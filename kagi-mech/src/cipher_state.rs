use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::aead::{self, AEAD_KEY_LEN};
use crate::crypto::hash;
use crate::error::Error;

/// Length of the truncated MAC carried by signed messages.
pub const SIGN_TAG_LEN: usize = 16;

/// One direction of a keyed channel: an AEAD/MAC key and a sequence counter.
///
/// During an exchange an empty state passes data through unchanged (Noise
/// CipherState semantics). Once established, every successful operation
/// advances the counter; a failed check leaves it untouched.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CipherState {
    key: Option<[u8; AEAD_KEY_LEN]>,
    #[zeroize(skip)]
    nonce: u64,
}

impl CipherState {
    pub fn empty() -> Self {
        Self {
            key: None,
            nonce: 0,
        }
    }

    pub fn with_key(key: [u8; AEAD_KEY_LEN]) -> Self {
        let mut cs = Self::empty();
        cs.initialize_key(key);
        cs
    }

    /// Install a key, resetting the counter to zero.
    pub fn initialize_key(&mut self, key: [u8; AEAD_KEY_LEN]) {
        self.key = Some(key);
        self.nonce = 0;
    }

    fn next_nonce(&self) -> Result<u64, Error> {
        // 2^64-1 stays reserved (Noise spec §11.3).
        if self.nonce == u64::MAX {
            return Err(Error::NonceExhausted);
        }
        Ok(self.nonce)
    }

    /// Encrypt with associated data; returns `ciphertext || tag`.
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_vec());
        };
        let nonce = self.next_nonce()?;
        let out = aead::seal(key, nonce, ad, plaintext)?;
        self.nonce += 1;
        Ok(out)
    }

    /// Decrypt `ciphertext || tag` with associated data.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let Some(key) = &self.key else {
            return Ok(ciphertext.to_vec());
        };
        let nonce = self.next_nonce()?;
        let out = aead::open(key, nonce, ad, ciphertext)?;
        self.nonce += 1;
        Ok(out)
    }

    /// MAC over `ad || data` bound to the current counter.
    pub fn sign(&mut self, ad: &[u8], data: &[u8]) -> Result<[u8; SIGN_TAG_LEN], Error> {
        let key = self.key.as_ref().ok_or(Error::WrongState)?;
        let nonce = self.next_nonce()?;
        let tag = Self::mac(key, nonce, ad, data);
        self.nonce += 1;
        Ok(tag)
    }

    /// Check a tag produced by the peer's [`sign`](Self::sign).
    pub fn verify(&mut self, ad: &[u8], data: &[u8], tag: &[u8]) -> Result<(), Error> {
        let key = self.key.as_ref().ok_or(Error::WrongState)?;
        let nonce = self.next_nonce()?;
        let expected = Self::mac(key, nonce, ad, data);
        if !hash::mac_eq(&expected, tag) {
            return Err(Error::IntegrityFailure);
        }
        self.nonce += 1;
        Ok(())
    }

    fn mac(key: &[u8; AEAD_KEY_LEN], nonce: u64, ad: &[u8], data: &[u8]) -> [u8; SIGN_TAG_LEN] {
        let full = hash::hmac_parts(key, &[&nonce.to_be_bytes(), ad, data]);
        let mut tag = [0u8; SIGN_TAG_LEN];
        tag.copy_from_slice(&full[..SIGN_TAG_LEN]);
        tag
    }
}

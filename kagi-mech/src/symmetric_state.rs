use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::cipher_state::CipherState;
use crate::crypto::aead::AEAD_KEY_LEN;
use crate::crypto::hash::{self, HASH_LEN};
use crate::error::Error;

/// Chaining key and transcript hash of an exchange (Noise SymmetricState).
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SymmetricState {
    cipher: CipherState,
    ck: Zeroizing<[u8; HASH_LEN]>,
    h: [u8; HASH_LEN],
}

impl SymmetricState {
    /// Start from a protocol name: padded if it fits, hashed otherwise.
    pub fn initialize(protocol_name: &str) -> Self {
        let name = protocol_name.as_bytes();
        let h = if name.len() <= HASH_LEN {
            let mut h = [0u8; HASH_LEN];
            h[..name.len()].copy_from_slice(name);
            h
        } else {
            hash::hash(name)
        };

        Self {
            cipher: CipherState::empty(),
            ck: Zeroizing::new(h),
            h,
        }
    }

    /// `(ck, k) = HKDF(ck, ikm)`, then key the cipher with `k`.
    pub fn mix_key(&mut self, input_key_material: &[u8]) {
        let (new_ck, temp_k) = hash::hkdf2(&self.ck, input_key_material);
        *self.ck = *new_ck;

        let mut key = [0u8; AEAD_KEY_LEN];
        key.copy_from_slice(&*temp_k);
        self.cipher.initialize_key(key);
        key.zeroize();
    }

    /// `h = HASH(h || data)`
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.h = hash::hash_two(&self.h, data);
    }

    /// Encrypt under the transcript hash as AD, then absorb the ciphertext.
    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let ct = self.cipher.encrypt_with_ad(&self.h, plaintext)?;
        self.mix_hash(&ct);
        Ok(ct)
    }

    /// Decrypt under the transcript hash as AD, then absorb the ciphertext.
    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let pt = self.cipher.decrypt_with_ad(&self.h, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(pt)
    }

    #[cfg(test)]
    fn handshake_hash(&self) -> &[u8; HASH_LEN] {
        &self.h
    }

    /// Derive an additional symmetric key bound to the final chaining key
    /// and transcript.
    pub fn derive(&self, label: &[u8]) -> Zeroizing<[u8; HASH_LEN]> {
        let (_, _, out) = hash::hkdf3(&self.ck, &hash::hash_two(label, &self.h));
        out
    }
}

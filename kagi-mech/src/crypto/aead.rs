use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::error::Error;

/// AEAD key length in bytes.
pub const AEAD_KEY_LEN: usize = 32;
/// AEAD tag length in bytes.
pub const AEAD_TAG_LEN: usize = 16;
/// AEAD nonce length in bytes.
pub const AEAD_NONCE_LEN: usize = 12;

/// Encrypt `plaintext`, returning `ciphertext || tag`.
pub fn seal(
    key: &[u8; AEAD_KEY_LEN],
    nonce: u64,
    ad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(
            &Nonce::from(make_nonce(nonce)),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| Error::CryptoFailed)
}

/// Decrypt `ciphertext || tag`, verifying the tag.
pub fn open(
    key: &[u8; AEAD_KEY_LEN],
    nonce: u64,
    ad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
    if ciphertext.len() < AEAD_TAG_LEN {
        return Err(Error::BadMessage);
    }
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(
            &Nonce::from(make_nonce(nonce)),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| Error::CryptoFailed)
}

/// 4 zero bytes followed by the little-endian counter (Noise ChaChaPoly layout).
fn make_nonce(n: u64) -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce[4..].copy_from_slice(&n.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; AEAD_KEY_LEN] = [0x42; AEAD_KEY_LEN];

    #[test]
    fn seal_open_round_trip() {
        let ct = seal(&KEY, 7, b"ad", b"hello").unwrap();
        assert_eq!(ct.len(), 5 + AEAD_TAG_LEN);
        assert_eq!(open(&KEY, 7, b"ad", &ct).unwrap(), b"hello");
    }

    #[test]
    fn open_rejects_wrong_nonce_or_ad() {
        let ct = seal(&KEY, 0, b"ad", b"hello").unwrap();
        assert_eq!(open(&KEY, 1, b"ad", &ct), Err(Error::CryptoFailed));
        assert_eq!(open(&KEY, 0, b"xx", &ct), Err(Error::CryptoFailed));
    }

    #[test]
    fn open_rejects_short_input() {
        assert_eq!(open(&KEY, 0, b"", &[0u8; 8]), Err(Error::BadMessage));
    }

    #[test]
    fn empty_plaintext_is_tag_only() {
        let ct = seal(&KEY, 0, b"", b"").unwrap();
        assert_eq!(ct.len(), AEAD_TAG_LEN);
        assert!(open(&KEY, 0, b"", &ct).unwrap().is_empty());
    }
}

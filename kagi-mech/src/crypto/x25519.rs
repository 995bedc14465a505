use rand_core::CryptoRngCore;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as DalekPublicKey, StaticSecret as DalekStaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::Error;

/// DH output / public key length in bytes (X25519 = 32).
pub const DH_LEN: usize = 32;

/// A Diffie-Hellman shared secret. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; DH_LEN]);

impl core::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; DH_LEN] {
        &self.0
    }
}

/// Fresh ephemeral secret and its public bytes.
pub fn ephemeral(rng: &mut impl CryptoRngCore) -> (DalekStaticSecret, [u8; DH_LEN]) {
    let secret = DalekStaticSecret::random_from_rng(rng);
    let public = DalekPublicKey::from(&secret).to_bytes();
    (secret, public)
}

/// DH between a local secret and remote public key bytes.
///
/// Rejects the all-zero output a low-order remote point produces
/// (RFC 7748 Section 6.1).
pub fn dh(local: &DalekStaticSecret, remote: &[u8; DH_LEN]) -> Result<SharedSecret, Error> {
    let shared = local.diffie_hellman(&DalekPublicKey::from(*remote));
    if bool::from(shared.as_bytes().ct_eq(&[0u8; DH_LEN])) {
        return Err(Error::BadKey);
    }
    Ok(SharedSecret(*shared.as_bytes()))
}

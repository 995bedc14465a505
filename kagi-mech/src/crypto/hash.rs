use blake2::{Blake2s256, Digest};
use hmac::{Mac, SimpleHmac};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Hash output length (BLAKE2s = 32 bytes).
pub const HASH_LEN: usize = 32;

type HmacBlake2s = SimpleHmac<Blake2s256>;

/// BLAKE2s-256 of `input`.
pub fn hash(input: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&Blake2s256::digest(input));
    out
}

/// BLAKE2s-256 of `a || b` without allocating.
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    hasher.update(a);
    hasher.update(b);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// HMAC-BLAKE2s over the concatenation of `parts`.
pub fn hmac_parts(key: &[u8], parts: &[&[u8]]) -> Zeroizing<[u8; HASH_LEN]> {
    let Ok(mut mac) = <HmacBlake2s as Mac>::new_from_slice(key) else {
        unreachable!("SimpleHmac accepts keys of any length")
    };
    for part in parts {
        mac.update(part);
    }
    let mut out = Zeroizing::new([0u8; HASH_LEN]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// HMAC-BLAKE2s per [RFC 2104](https://datatracker.ietf.org/doc/html/rfc2104).
pub fn hmac(key: &[u8], data: &[u8]) -> Zeroizing<[u8; HASH_LEN]> {
    hmac_parts(key, &[data])
}

/// Constant-time comparison of two MACs.
pub fn mac_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// HKDF with 2 output blocks (Noise spec Section 5.3 shape).
pub fn hkdf2(
    chaining_key: &[u8; HASH_LEN],
    input_key_material: &[u8],
) -> (Zeroizing<[u8; HASH_LEN]>, Zeroizing<[u8; HASH_LEN]>) {
    let temp_key = hmac(chaining_key, input_key_material);
    let output1 = hmac(&*temp_key, &[0x01]);
    let output2 = hmac_parts(&*temp_key, &[&*output1, &[0x02]]);
    (output1, output2)
}

/// Three zeroized HKDF output blocks.
pub type HkdfOutput3 = (
    Zeroizing<[u8; HASH_LEN]>,
    Zeroizing<[u8; HASH_LEN]>,
    Zeroizing<[u8; HASH_LEN]>,
);

/// HKDF with 3 output blocks; the third is used for session key derivation.
pub fn hkdf3(chaining_key: &[u8; HASH_LEN], input_key_material: &[u8]) -> HkdfOutput3 {
    let temp_key = hmac(chaining_key, input_key_material);
    let output1 = hmac(&*temp_key, &[0x01]);
    let output2 = hmac_parts(&*temp_key, &[&*output1, &[0x02]]);
    let output3 = hmac_parts(&*temp_key, &[&*output2, &[0x03]]);
    (output1, output2, output3)
}

/// HKDF-Expand per [RFC 5869 Section 2.3](https://datatracker.ietf.org/doc/html/rfc5869#section-2.3).
///
/// Fills `output` from the pseudorandom key `prk` and `info`. Returns `false`
/// if more than 255 × [`HASH_LEN`] bytes are requested.
pub fn hkdf_expand(prk: &[u8; HASH_LEN], info: &[u8], output: &mut [u8]) -> bool {
    let blocks = output.len().div_ceil(HASH_LEN);
    if blocks > 255 {
        return false;
    }

    let mut prev: Option<Zeroizing<[u8; HASH_LEN]>> = None;
    for (i, chunk) in output.chunks_mut(HASH_LEN).enumerate() {
        let counter = [(i + 1) as u8];
        let block = match &prev {
            Some(p) => hmac_parts(prk, &[&**p, info, &counter]),
            None => hmac_parts(prk, &[info, &counter]),
        };
        chunk.copy_from_slice(&block[..chunk.len()]);
        prev = Some(block);
    }
    true
}

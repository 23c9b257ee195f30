pub mod hash;
pub mod ring;

pub use hash::{fast_hash, slow_hash, PowAlgo};
pub use ring::{
    check_ring_signature, check_single_signature, derive_key_image, generate_keys,
    generate_ring_signature, key_image_in_domain, sign_single, RingError,
};

pub type Hash = [u8; 32];

pub const NULL_HASH: Hash = [0u8; 32];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PublicKey(pub [u8; 32]);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SecretKey(pub [u8; 32]);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct KeyImage(pub [u8; 32]);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn null() -> Self {
        Self([0u8; 64])
    }
}

pub fn hash_to_hex(hash: &Hash) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

pub fn hash_from_hex(input: &str) -> Option<Hash> {
    let hex = input.trim();
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, byte_out) in out.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&hex[start..start + 2], 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let mut hash = [0u8; 32];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let hex = hash_to_hex(&hash);
        assert_eq!(hex.len(), 64);
        assert_eq!(hash_from_hex(&hex), Some(hash));
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert_eq!(hash_from_hex("abc"), None);
        assert_eq!(hash_from_hex(&"zz".repeat(32)), None);
    }
}

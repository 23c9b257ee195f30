//! Ring signatures and key images over ristretto255.
//!
//! The scheme is the classic one-of-many spend proof: a signature over a ring
//! of one-time output keys proves the signer owns one of them, and the key
//! image `I = x * Hp(P)` deterministically tags the spent output without
//! revealing which ring member it was.

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::{Digest, Keccak256, Keccak512};

use crate::{Hash, KeyImage, PublicKey, SecretKey, Signature};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RingError {
    InvalidKey,
    InvalidKeyImage,
    InvalidSignature,
    EmptyRing,
    SignerNotInRing,
}

impl std::fmt::Display for RingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RingError::InvalidKey => write!(f, "public key is not a valid curve point"),
            RingError::InvalidKeyImage => write!(f, "key image is not in the valid domain"),
            RingError::InvalidSignature => write!(f, "signature scalar is not canonical"),
            RingError::EmptyRing => write!(f, "ring must contain at least one key"),
            RingError::SignerNotInRing => write!(f, "secret index outside the ring"),
        }
    }
}

impl std::error::Error for RingError {}

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Keccak512::new();
    for part in parts {
        hasher.update(part);
    }
    let wide: [u8; 64] = hasher.finalize().into();
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn hash_to_point(key: &PublicKey) -> RistrettoPoint {
    let mut hasher = Keccak512::new();
    hasher.update(b"umbra/hash-to-point");
    hasher.update(key.0);
    let wide: [u8; 64] = hasher.finalize().into();
    RistrettoPoint::from_uniform_bytes(&wide)
}

fn decompress_key(key: &PublicKey) -> Result<RistrettoPoint, RingError> {
    CompressedRistretto::from_slice(&key.0)
        .ok()
        .and_then(|compressed| compressed.decompress())
        .ok_or(RingError::InvalidKey)
}

fn decompress_image(image: &KeyImage) -> Result<RistrettoPoint, RingError> {
    let point = CompressedRistretto::from_slice(&image.0)
        .ok()
        .and_then(|compressed| compressed.decompress())
        .ok_or(RingError::InvalidKeyImage)?;
    if point.is_identity() {
        return Err(RingError::InvalidKeyImage);
    }
    Ok(point)
}

fn scalar_from_bytes(bytes: &[u8; 32]) -> Result<Scalar, RingError> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes)).ok_or(RingError::InvalidSignature)
}

fn random_scalar() -> Scalar {
    let mut wide = [0u8; 64];
    OsRng.fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Valid curve point derived from a domain tag; nobody knows its secret key.
/// Used for provably unspendable outputs such as the genesis coinbase.
pub fn public_key_from_tag(tag: &[u8]) -> PublicKey {
    let mut hasher = Keccak512::new();
    hasher.update(b"umbra/tagged-key");
    hasher.update(tag);
    let wide: [u8; 64] = hasher.finalize().into();
    PublicKey(RistrettoPoint::from_uniform_bytes(&wide).compress().to_bytes())
}

pub fn generate_keys() -> (PublicKey, SecretKey) {
    let secret = random_scalar();
    let public = RistrettoPoint::mul_base(&secret);
    (
        PublicKey(public.compress().to_bytes()),
        SecretKey(secret.to_bytes()),
    )
}

pub fn derive_key_image(public: &PublicKey, secret: &SecretKey) -> Result<KeyImage, RingError> {
    let x = scalar_from_bytes(&secret.0).map_err(|_| RingError::InvalidKey)?;
    let image = x * hash_to_point(public);
    Ok(KeyImage(image.compress().to_bytes()))
}

/// Rejects key images outside the prime-order group: a non-canonical encoding
/// or the identity element can never be produced by an honest spend.
pub fn key_image_in_domain(image: &KeyImage) -> bool {
    decompress_image(image).is_ok()
}

pub fn generate_ring_signature(
    prefix_hash: &Hash,
    image: &KeyImage,
    ring: &[PublicKey],
    secret: &SecretKey,
    secret_index: usize,
) -> Result<Vec<Signature>, RingError> {
    if ring.is_empty() {
        return Err(RingError::EmptyRing);
    }
    if secret_index >= ring.len() {
        return Err(RingError::SignerNotInRing);
    }

    let image_point = decompress_image(image)?;
    let x = scalar_from_bytes(&secret.0).map_err(|_| RingError::InvalidKey)?;

    let mut challenges = vec![Scalar::ZERO; ring.len()];
    let mut responses = vec![Scalar::ZERO; ring.len()];
    let mut left = Vec::with_capacity(ring.len());
    let mut right = Vec::with_capacity(ring.len());
    let mut challenge_sum = Scalar::ZERO;
    let mut nonce = Scalar::ZERO;

    for (index, member) in ring.iter().enumerate() {
        let member_point = decompress_key(member)?;
        let base = hash_to_point(member);
        if index == secret_index {
            nonce = random_scalar();
            left.push(RistrettoPoint::mul_base(&nonce));
            right.push(nonce * base);
        } else {
            let challenge = random_scalar();
            let response = random_scalar();
            challenges[index] = challenge;
            responses[index] = response;
            challenge_sum += challenge;
            left.push(RistrettoPoint::mul_base(&response) + challenge * member_point);
            right.push(response * base + challenge * image_point);
        }
    }

    let total = ring_challenge(prefix_hash, &left, &right);
    challenges[secret_index] = total - challenge_sum;
    responses[secret_index] = nonce - challenges[secret_index] * x;

    Ok(ring
        .iter()
        .enumerate()
        .map(|(index, _)| {
            let mut bytes = [0u8; 64];
            bytes[..32].copy_from_slice(&challenges[index].to_bytes());
            bytes[32..].copy_from_slice(&responses[index].to_bytes());
            Signature(bytes)
        })
        .collect())
}

pub fn check_ring_signature(
    prefix_hash: &Hash,
    image: &KeyImage,
    ring: &[PublicKey],
    signatures: &[Signature],
) -> bool {
    if ring.is_empty() || ring.len() != signatures.len() {
        return false;
    }
    let Ok(image_point) = decompress_image(image) else {
        return false;
    };

    let mut left = Vec::with_capacity(ring.len());
    let mut right = Vec::with_capacity(ring.len());
    let mut challenge_sum = Scalar::ZERO;

    for (member, signature) in ring.iter().zip(signatures) {
        let Ok(member_point) = decompress_key(member) else {
            return false;
        };
        let mut challenge_bytes = [0u8; 32];
        let mut response_bytes = [0u8; 32];
        challenge_bytes.copy_from_slice(&signature.0[..32]);
        response_bytes.copy_from_slice(&signature.0[32..]);
        let (Ok(challenge), Ok(response)) = (
            scalar_from_bytes(&challenge_bytes),
            scalar_from_bytes(&response_bytes),
        ) else {
            return false;
        };

        let base = hash_to_point(member);
        left.push(RistrettoPoint::mul_base(&response) + challenge * member_point);
        right.push(response * base + challenge * image_point);
        challenge_sum += challenge;
    }

    ring_challenge(prefix_hash, &left, &right) == challenge_sum
}

/// Verifies one signature of a multisignature input: a plain Schnorr proof of
/// knowledge of the secret behind a single output key.
pub fn check_single_signature(
    prefix_hash: &Hash,
    key: &PublicKey,
    signature: &Signature,
) -> bool {
    let Ok(point) = decompress_key(key) else {
        return false;
    };
    let mut challenge_bytes = [0u8; 32];
    let mut response_bytes = [0u8; 32];
    challenge_bytes.copy_from_slice(&signature.0[..32]);
    response_bytes.copy_from_slice(&signature.0[32..]);
    let (Ok(challenge), Ok(response)) = (
        scalar_from_bytes(&challenge_bytes),
        scalar_from_bytes(&response_bytes),
    ) else {
        return false;
    };

    let commitment = RistrettoPoint::mul_base(&response) + challenge * point;
    hash_to_scalar(&[prefix_hash, &key.0, &commitment.compress().to_bytes()]) == challenge
}

pub fn sign_single(
    prefix_hash: &Hash,
    key: &PublicKey,
    secret: &SecretKey,
) -> Result<Signature, RingError> {
    let x = scalar_from_bytes(&secret.0).map_err(|_| RingError::InvalidKey)?;
    let nonce = random_scalar();
    let commitment = RistrettoPoint::mul_base(&nonce);
    let challenge = hash_to_scalar(&[prefix_hash, &key.0, &commitment.compress().to_bytes()]);
    let response = nonce - challenge * x;

    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(&challenge.to_bytes());
    bytes[32..].copy_from_slice(&response.to_bytes());
    Ok(Signature(bytes))
}

fn ring_challenge(prefix_hash: &Hash, left: &[RistrettoPoint], right: &[RistrettoPoint]) -> Scalar {
    let mut hasher = Keccak256::new();
    hasher.update(prefix_hash);
    for point in left {
        hasher.update(point.compress().to_bytes());
    }
    for point in right {
        hasher.update(point.compress().to_bytes());
    }
    let narrow: [u8; 32] = hasher.finalize().into();
    let mut wide = [0u8; 64];
    wide[..32].copy_from_slice(&narrow);
    Scalar::from_bytes_mod_order_wide(&wide)
}

use sha3::{Digest, Keccak256};

use crate::Hash;

/// Hash used for object identities, tx prefixes, and the block hash chain.
pub fn fast_hash(data: &[u8]) -> Hash {
    let digest = Keccak256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Memory-hard proof-of-work families recognised by the block major version.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowAlgo {
    Cn,
    CnGpu,
    CnCpu,
}

impl PowAlgo {
    fn domain(self) -> (&'static [u8], usize) {
        match self {
            PowAlgo::Cn => (b"umbra/pow/cn", 8),
            PowAlgo::CnGpu => (b"umbra/pow/cn-gpu", 12),
            PowAlgo::CnCpu => (b"umbra/pow/cn-cpu", 16),
        }
    }
}

/// CPU-bound long hash over a block hashing blob. Each algorithm variant is a
/// distinct domain-separated iterated permutation; the chain never mixes
/// variants at one height because the major version selects exactly one.
pub fn slow_hash(data: &[u8], algo: PowAlgo) -> Hash {
    let (tag, rounds) = algo.domain();
    let mut hasher = Keccak256::new();
    hasher.update(tag);
    hasher.update((data.len() as u64).to_le_bytes());
    hasher.update(data);
    let mut state: [u8; 32] = hasher.finalize().into();
    for round in 0..rounds {
        let mut hasher = Keccak256::new();
        hasher.update(state);
        hasher.update([round as u8]);
        state = hasher.finalize().into();
    }
    state
}

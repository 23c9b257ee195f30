//! Block model: header, pre-v5 merge-mining envelope, identity hash, and the
//! hashing blob consumed by the proof-of-work long hash.

use umbrad_crypto::{fast_hash, Hash, NULL_HASH};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::transaction::{Transaction, TransactionInput};

pub const BLOCK_MAJOR_VERSION_1: u8 = 1;
pub const BLOCK_MAJOR_VERSION_2: u8 = 2;
pub const BLOCK_MAJOR_VERSION_3: u8 = 3;
pub const BLOCK_MAJOR_VERSION_4: u8 = 4;
pub const BLOCK_MAJOR_VERSION_5: u8 = 5;

pub const BLOCK_MINOR_VERSION_0: u8 = 0;
pub const BLOCK_MINOR_VERSION_1: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub nonce: u32,
    pub timestamp: u64,
    pub previous_block_hash: Hash,
}

/// Merge-mining envelope carried by v2..v4 blocks: the header of the parent
/// chain's block whose coinbase commits to this chain's block hash.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParentBlock {
    pub major_version: u8,
    pub minor_version: u8,
    pub previous_block_hash: Hash,
    pub transaction_count: u16,
    pub base_transaction_branch: Vec<Hash>,
    pub base_transaction: Transaction,
    pub blockchain_branch: Vec<Hash>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub parent_block: Option<ParentBlock>,
    pub base_transaction: Transaction,
    pub transaction_hashes: Vec<Hash>,
}

pub fn has_parent_block(major_version: u8) -> bool {
    (BLOCK_MAJOR_VERSION_2..BLOCK_MAJOR_VERSION_5).contains(&major_version)
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.major_version);
        encoder.write_u8(self.minor_version);
        encoder.write_u32_le(self.nonce);
        encoder.write_u64_le(self.timestamp);
        encoder.write_hash(&self.previous_block_hash);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            major_version: decoder.read_u8()?,
            minor_version: decoder.read_u8()?,
            nonce: decoder.read_u32_le()?,
            timestamp: decoder.read_u64_le()?,
            previous_block_hash: decoder.read_hash()?,
        })
    }
}

impl Encodable for ParentBlock {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.major_version);
        encoder.write_u8(self.minor_version);
        encoder.write_hash(&self.previous_block_hash);
        encoder.write_u16_le(self.transaction_count);
        encoder.write_varint(self.base_transaction_branch.len() as u64);
        for hash in &self.base_transaction_branch {
            encoder.write_hash(hash);
        }
        self.base_transaction.consensus_encode(encoder);
        encoder.write_varint(self.blockchain_branch.len() as u64);
        for hash in &self.blockchain_branch {
            encoder.write_hash(hash);
        }
    }
}

impl Decodable for ParentBlock {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let major_version = decoder.read_u8()?;
        let minor_version = decoder.read_u8()?;
        let previous_block_hash = decoder.read_hash()?;
        let transaction_count = decoder.read_u16_le()?;
        let branch_len = decoder.read_varint()? as usize;
        let mut base_transaction_branch = Vec::with_capacity(branch_len);
        for _ in 0..branch_len {
            base_transaction_branch.push(decoder.read_hash()?);
        }
        let base_transaction = Transaction::consensus_decode(decoder)?;
        let chain_branch_len = decoder.read_varint()? as usize;
        let mut blockchain_branch = Vec::with_capacity(chain_branch_len);
        for _ in 0..chain_branch_len {
            blockchain_branch.push(decoder.read_hash()?);
        }
        Ok(Self {
            major_version,
            minor_version,
            previous_block_hash,
            transaction_count,
            base_transaction_branch,
            base_transaction,
            blockchain_branch,
        })
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        if let Some(parent) = &self.parent_block {
            parent.consensus_encode(encoder);
        }
        self.base_transaction.consensus_encode(encoder);
        encoder.write_varint(self.transaction_hashes.len() as u64);
        for hash in &self.transaction_hashes {
            encoder.write_hash(hash);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let parent_block = if has_parent_block(header.major_version) {
            Some(ParentBlock::consensus_decode(decoder)?)
        } else {
            None
        };
        let base_transaction = Transaction::consensus_decode(decoder)?;
        let count = decoder.read_varint()? as usize;
        let mut transaction_hashes = Vec::with_capacity(count);
        for _ in 0..count {
            transaction_hashes.push(decoder.read_hash()?);
        }
        Ok(Self {
            header,
            parent_block,
            base_transaction,
            transaction_hashes,
        })
    }
}

impl Block {
    /// Identity hash: header, transaction merkle root, and transaction count.
    pub fn hash(&self) -> Hash {
        fast_hash(&self.hashing_blob())
    }

    /// Blob fed to both the identity hash and the proof-of-work long hash.
    /// The nonce lives in the header, so grinding the nonce reshuffles the
    /// whole blob. v2..v4 blocks append the merge-mining envelope.
    pub fn hashing_blob(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.consensus_encode(&mut encoder);
        encoder.write_hash(&self.merkle_root());
        encoder.write_varint(self.transaction_hashes.len() as u64 + 1);
        if let Some(parent) = &self.parent_block {
            parent.consensus_encode(&mut encoder);
        }
        encoder.into_inner()
    }

    /// Hash the merge-mining envelope commits to: the blob without the
    /// envelope itself.
    pub fn aux_hash(&self) -> Hash {
        let mut encoder = Encoder::new();
        self.header.consensus_encode(&mut encoder);
        encoder.write_hash(&self.merkle_root());
        encoder.write_varint(self.transaction_hashes.len() as u64 + 1);
        fast_hash(&encoder.into_inner())
    }

    pub fn merkle_root(&self) -> Hash {
        let mut hashes = Vec::with_capacity(self.transaction_hashes.len() + 1);
        hashes.push(self.base_transaction.hash());
        hashes.extend_from_slice(&self.transaction_hashes);
        tree_hash(&hashes)
    }

    /// Height claimed by the coinbase input; `None` when the coinbase is
    /// malformed.
    pub fn height(&self) -> Option<u32> {
        match self.base_transaction.prefix.inputs.as_slice() {
            [TransactionInput::Base(input)] => Some(input.block_index),
            _ => None,
        }
    }

    pub fn binary_size(&self) -> usize {
        crate::encoding::encode(self).len()
    }

    pub fn is_genesis(&self) -> bool {
        self.header.previous_block_hash == NULL_HASH
    }
}

pub fn tree_hash(hashes: &[Hash]) -> Hash {
    match hashes {
        [] => NULL_HASH,
        [single] => *single,
        _ => {
            let mut layer: Vec<Hash> = hashes.to_vec();
            while layer.len() > 1 {
                let mut next = Vec::with_capacity(layer.len().div_ceil(2));
                for pair in layer.chunks(2) {
                    if pair.len() == 2 {
                        let mut buf = [0u8; 64];
                        buf[..32].copy_from_slice(&pair[0]);
                        buf[32..].copy_from_slice(&pair[1]);
                        next.push(fast_hash(&buf));
                    } else {
                        next.push(pair[0]);
                    }
                }
                layer = next;
            }
            layer[0]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};
    use crate::transaction::{BaseInput, KeyOutput, OutputTarget, TransactionOutput, TransactionPrefix};
    use umbrad_crypto::generate_keys;

    fn coinbase(height: u32) -> Transaction {
        let (key, _) = generate_keys();
        Transaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_time: u64::from(height) + 10,
                inputs: vec![TransactionInput::Base(BaseInput {
                    block_index: height,
                })],
                outputs: vec![TransactionOutput {
                    amount: 1_000,
                    target: OutputTarget::Key(KeyOutput { key }),
                }],
                extra: Vec::new(),
            },
            signatures: Vec::new(),
        }
    }

    fn sample_block(major_version: u8) -> Block {
        let parent_block = has_parent_block(major_version).then(|| ParentBlock {
            major_version: BLOCK_MAJOR_VERSION_1,
            minor_version: BLOCK_MINOR_VERSION_0,
            previous_block_hash: [1u8; 32],
            transaction_count: 1,
            base_transaction_branch: vec![[2u8; 32]],
            base_transaction: coinbase(0),
            blockchain_branch: Vec::new(),
        });
        Block {
            header: BlockHeader {
                major_version,
                minor_version: BLOCK_MINOR_VERSION_0,
                nonce: 77,
                timestamp: 1_650_000_000,
                previous_block_hash: [4u8; 32],
            },
            parent_block,
            base_transaction: coinbase(12),
            transaction_hashes: vec![[8u8; 32], [9u8; 32]],
        }
    }

    #[test]
    fn block_round_trip_v1() {
        let block = sample_block(BLOCK_MAJOR_VERSION_1);
        let decoded: Block = decode(&encode(&block)).expect("decode");
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn block_round_trip_with_parent() {
        let block = sample_block(BLOCK_MAJOR_VERSION_3);
        let decoded: Block = decode(&encode(&block)).expect("decode");
        assert_eq!(decoded, block);
    }

    #[test]
    fn nonce_changes_the_hash() {
        let mut block = sample_block(BLOCK_MAJOR_VERSION_1);
        let before = block.hash();
        block.header.nonce += 1;
        assert_ne!(block.hash(), before);
    }

    #[test]
    fn height_comes_from_the_coinbase() {
        let block = sample_block(BLOCK_MAJOR_VERSION_1);
        assert_eq!(block.height(), Some(12));
    }

    #[test]
    fn tree_hash_handles_odd_counts() {
        let a = fast_hash(b"a");
        let b = fast_hash(b"b");
        let c = fast_hash(b"c");
        assert_eq!(tree_hash(&[a]), a);
        assert_ne!(tree_hash(&[a, b]), tree_hash(&[b, a]));
        assert_ne!(tree_hash(&[a, b, c]), tree_hash(&[a, b]));
    }
}

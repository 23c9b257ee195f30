//! Persisted block records: the full block plus the cumulative chain state
//! at its height and the per-transaction global output indexes.

use umbrad_crypto::Hash;
use umbrad_primitives::block::Block;
use umbrad_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use umbrad_primitives::transaction::Transaction;

/// Locates a confirmed transaction as (block height, position within block).
/// Position 0 is the coinbase.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TransactionIndex {
    pub block: u32,
    pub transaction: u16,
}

impl TransactionIndex {
    pub const ENCODED_LEN: usize = 6;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.block.to_le_bytes());
        out[4..6].copy_from_slice(&self.transaction.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            block: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            transaction: u16::from_le_bytes(bytes[4..6].try_into().ok()?),
        })
    }
}

impl Encodable for TransactionIndex {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.block);
        encoder.write_u16_le(self.transaction);
    }
}

impl Decodable for TransactionIndex {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            block: decoder.read_u32_le()?,
            transaction: decoder.read_u16_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionEntry {
    pub tx: Transaction,
    /// Index of each output within `o/<amount>` at the time it was pushed.
    pub global_output_indexes: Vec<u32>,
}

impl Encodable for TransactionEntry {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.tx.consensus_encode(encoder);
        encoder.write_varint(self.global_output_indexes.len() as u64);
        for index in &self.global_output_indexes {
            encoder.write_u32_le(*index);
        }
    }
}

impl Decodable for TransactionEntry {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let tx = Transaction::consensus_decode(decoder)?;
        let count = decoder.read_varint()? as usize;
        let mut global_output_indexes = Vec::with_capacity(count);
        for _ in 0..count {
            global_output_indexes.push(decoder.read_u32_le()?);
        }
        Ok(Self {
            tx,
            global_output_indexes,
        })
    }
}

/// The canonical per-block record under `B/<hash>/b`. Transaction 0 is the
/// coinbase; `transactions` mirrors the block's hash list in order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockEntry {
    pub block: Block,
    pub height: u32,
    pub block_cumulative_size: u64,
    pub cumulative_difficulty: u64,
    pub already_generated_coins: u64,
    pub transactions: Vec<TransactionEntry>,
}

impl Encodable for BlockEntry {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.block.consensus_encode(encoder);
        encoder.write_u32_le(self.height);
        encoder.write_u64_le(self.block_cumulative_size);
        encoder.write_u64_le(self.cumulative_difficulty);
        encoder.write_u64_le(self.already_generated_coins);
        encoder.write_varint(self.transactions.len() as u64);
        for transaction in &self.transactions {
            transaction.consensus_encode(encoder);
        }
    }
}

impl Decodable for BlockEntry {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let block = Block::consensus_decode(decoder)?;
        let height = decoder.read_u32_le()?;
        let block_cumulative_size = decoder.read_u64_le()?;
        let cumulative_difficulty = decoder.read_u64_le()?;
        let already_generated_coins = decoder.read_u64_le()?;
        let count = decoder.read_varint()? as usize;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(TransactionEntry::consensus_decode(decoder)?);
        }
        Ok(Self {
            block,
            height,
            block_cumulative_size,
            cumulative_difficulty,
            already_generated_coins,
            transactions,
        })
    }
}

impl BlockEntry {
    pub fn hash(&self) -> Hash {
        self.block.hash()
    }
}

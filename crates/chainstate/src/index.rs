//! Key construction and record codecs for the eight index key-spaces.
//!
//! Every composite key is an ASCII prefix, then SQLite4 varints for numeric
//! components (so lexicographic order is numeric order), then raw binary
//! keys.

use umbrad_crypto::{Hash, KeyImage};
use umbrad_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use umbrad_primitives::varint::{read_varint_sqlite4, write_varint_sqlite4};

use crate::entry::TransactionIndex;

pub const BLOCK_INDEX_PREFIX: &[u8] = b"b/";
pub const BLOCK_PREFIX: &[u8] = b"B/";
pub const BLOCK_SUFFIX: &[u8] = b"/b";
pub const TRANSACTIONS_INDEX_PREFIX: &[u8] = b"t/";
pub const SPENT_KEY_IMAGES_PREFIX: &[u8] = b"k/";
pub const OUTPUTS_INDEX_PREFIX: &[u8] = b"o/";
pub const MULTISIGNATURE_OUTPUTS_PREFIX: &[u8] = b"m/";
pub const PAYMENT_ID_INDEX_PREFIX: &[u8] = b"p/";
pub const TIMESTAMP_INDEX_PREFIX: &[u8] = b"T/";
pub const GENERATED_TRANSACTIONS_PREFIX: &[u8] = b"g/";

fn prefixed(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

pub fn block_index_key(height: u32) -> Vec<u8> {
    prefixed(BLOCK_INDEX_PREFIX, &write_varint_sqlite4(height as u64))
}

pub fn block_entry_key(hash: &Hash) -> Vec<u8> {
    let mut key = prefixed(BLOCK_PREFIX, hash);
    key.extend_from_slice(BLOCK_SUFFIX);
    key
}

pub fn transaction_index_key(hash: &Hash) -> Vec<u8> {
    prefixed(TRANSACTIONS_INDEX_PREFIX, hash)
}

pub fn spent_key_image_key(image: &KeyImage) -> Vec<u8> {
    prefixed(SPENT_KEY_IMAGES_PREFIX, &image.0)
}

pub fn outputs_key(amount: u64) -> Vec<u8> {
    prefixed(OUTPUTS_INDEX_PREFIX, &write_varint_sqlite4(amount))
}

pub fn multisignature_outputs_key(amount: u64) -> Vec<u8> {
    prefixed(MULTISIGNATURE_OUTPUTS_PREFIX, &write_varint_sqlite4(amount))
}

pub fn payment_id_key(payment_id: &Hash) -> Vec<u8> {
    prefixed(PAYMENT_ID_INDEX_PREFIX, payment_id)
}

pub fn timestamp_key(timestamp: u64) -> Vec<u8> {
    prefixed(TIMESTAMP_INDEX_PREFIX, &write_varint_sqlite4(timestamp))
}

pub fn generated_transactions_key(height: u32) -> Vec<u8> {
    prefixed(
        GENERATED_TRANSACTIONS_PREFIX,
        &write_varint_sqlite4(height as u64),
    )
}

/// Height recovered from a `b/<height>` key.
pub fn height_from_block_index_key(key: &[u8]) -> Option<u32> {
    let suffix = key.strip_prefix(BLOCK_INDEX_PREFIX)?;
    let (height, consumed) = read_varint_sqlite4(suffix)?;
    if consumed != suffix.len() {
        return None;
    }
    u32::try_from(height).ok()
}

pub fn timestamp_from_key(key: &[u8]) -> Option<u64> {
    let suffix = key.strip_prefix(TIMESTAMP_INDEX_PREFIX)?;
    let (timestamp, consumed) = read_varint_sqlite4(suffix)?;
    (consumed == suffix.len()).then_some(timestamp)
}

pub fn hash_from_value(value: &[u8]) -> Option<Hash> {
    value.try_into().ok()
}

/// `o/<amount>` record: ordered list of output locations, append-only on
/// push, popped from the tail on pop.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OutputsEntry {
    pub outputs: Vec<(TransactionIndex, u16)>,
}

impl Encodable for OutputsEntry {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.outputs.len() as u64);
        for (index, output) in &self.outputs {
            index.consensus_encode(encoder);
            encoder.write_u16_le(*output);
        }
    }
}

impl Decodable for OutputsEntry {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let count = decoder.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(count);
        for _ in 0..count {
            let index = TransactionIndex::consensus_decode(decoder)?;
            let output = decoder.read_u16_le()?;
            outputs.push((index, output));
        }
        Ok(Self { outputs })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MultisignatureOutputUsage {
    pub transaction_index: TransactionIndex,
    pub output_index: u16,
    pub is_used: bool,
}

/// `m/<amount>` record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MultisignatureOutputsEntry {
    pub outputs: Vec<MultisignatureOutputUsage>,
}

impl Encodable for MultisignatureOutputsEntry {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.outputs.len() as u64);
        for usage in &self.outputs {
            usage.transaction_index.consensus_encode(encoder);
            encoder.write_u16_le(usage.output_index);
            encoder.write_u8(u8::from(usage.is_used));
        }
    }
}

impl Decodable for MultisignatureOutputsEntry {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let count = decoder.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(count);
        for _ in 0..count {
            let transaction_index = TransactionIndex::consensus_decode(decoder)?;
            let output_index = decoder.read_u16_le()?;
            let is_used = decoder.read_u8()? != 0;
            outputs.push(MultisignatureOutputUsage {
                transaction_index,
                output_index,
                is_used,
            });
        }
        Ok(Self { outputs })
    }
}

/// `p/<payment-id>` record: hashes of confirmed transactions carrying the id.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PaymentIdEntry {
    pub transaction_hashes: Vec<Hash>,
}

impl Encodable for PaymentIdEntry {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.transaction_hashes.len() as u64);
        for hash in &self.transaction_hashes {
            encoder.write_hash(hash);
        }
    }
}

impl Decodable for PaymentIdEntry {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let count = decoder.read_varint()? as usize;
        let mut transaction_hashes = Vec::with_capacity(count);
        for _ in 0..count {
            transaction_hashes.push(decoder.read_hash()?);
        }
        Ok(Self { transaction_hashes })
    }
}

/// `T/<timestamp>` record: blocks mined in that second.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TimestampEntry {
    pub blocks: Vec<(u32, Hash)>,
}

impl Encodable for TimestampEntry {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.blocks.len() as u64);
        for (height, hash) in &self.blocks {
            encoder.write_u32_le(*height);
            encoder.write_hash(hash);
        }
    }
}

impl Decodable for TimestampEntry {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let count = decoder.read_varint()? as usize;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let height = decoder.read_u32_le()?;
            let hash = decoder.read_hash()?;
            blocks.push((height, hash));
        }
        Ok(Self { blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbrad_primitives::encoding::{decode, encode};

    #[test]
    fn block_index_keys_sort_by_height() {
        let heights = [0u32, 1, 240, 241, 3_000, 70_000, 16_777_216, u32::MAX];
        for window in heights.windows(2) {
            assert!(block_index_key(window[0]) < block_index_key(window[1]));
        }
        assert_eq!(height_from_block_index_key(&block_index_key(3_000)), Some(3_000));
        assert_eq!(height_from_block_index_key(b"b/"), None);
        assert_eq!(height_from_block_index_key(b"t/xx"), None);
    }

    #[test]
    fn outputs_entry_round_trip() {
        let entry = OutputsEntry {
            outputs: vec![
                (
                    TransactionIndex {
                        block: 5,
                        transaction: 0,
                    },
                    2,
                ),
                (
                    TransactionIndex {
                        block: 6,
                        transaction: 3,
                    },
                    0,
                ),
            ],
        };
        let decoded: OutputsEntry = decode(&encode(&entry)).expect("decode");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn timestamp_entry_round_trip() {
        let entry = TimestampEntry {
            blocks: vec![(10, [1u8; 32]), (11, [2u8; 32])],
        };
        let decoded: TimestampEntry = decode(&encode(&entry)).expect("decode");
        assert_eq!(decoded, entry);
    }
}

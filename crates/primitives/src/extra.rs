//! Tag-length parsing of the opaque transaction `extra` field.
//!
//! Layout: a stream of tagged records. Tag `0x00` is padding and terminates
//! parsing, `0x01` carries the transaction public key, `0x02` a free-form
//! nonce whose first byte `0x00` marks an embedded payment id, `0x03` the
//! merge-mining tag (depth varint plus merkle root).

use umbrad_crypto::{Hash, PublicKey};

pub const TX_EXTRA_TAG_PADDING: u8 = 0x00;
pub const TX_EXTRA_TAG_PUBKEY: u8 = 0x01;
pub const TX_EXTRA_TAG_NONCE: u8 = 0x02;
pub const TX_EXTRA_TAG_MERGE_MINING: u8 = 0x03;

pub const TX_EXTRA_NONCE_PAYMENT_ID: u8 = 0x00;
pub const TX_EXTRA_NONCE_MAX_SIZE: usize = 255;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MergeMiningTag {
    pub depth: u64,
    pub merkle_root: Hash,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExtraField {
    Padding,
    PublicKey(PublicKey),
    Nonce(Vec<u8>),
    MergeMiningTag(MergeMiningTag),
}

pub fn parse_extra(extra: &[u8]) -> Vec<ExtraField> {
    let mut fields = Vec::new();
    let mut cursor = 0usize;
    while cursor < extra.len() {
        match extra[cursor] {
            TX_EXTRA_TAG_PADDING => {
                fields.push(ExtraField::Padding);
                break;
            }
            TX_EXTRA_TAG_PUBKEY => {
                let Some(bytes) = extra.get(cursor + 1..cursor + 33) else {
                    break;
                };
                let mut key = [0u8; 32];
                key.copy_from_slice(bytes);
                fields.push(ExtraField::PublicKey(PublicKey(key)));
                cursor += 33;
            }
            TX_EXTRA_TAG_NONCE => {
                let Some(len) = extra.get(cursor + 1).copied() else {
                    break;
                };
                let len = len as usize;
                let Some(payload) = extra.get(cursor + 2..cursor + 2 + len) else {
                    break;
                };
                fields.push(ExtraField::Nonce(payload.to_vec()));
                cursor += 2 + len;
            }
            TX_EXTRA_TAG_MERGE_MINING => {
                let Some(len) = extra.get(cursor + 1).copied() else {
                    break;
                };
                let len = len as usize;
                let Some(payload) = extra.get(cursor + 2..cursor + 2 + len) else {
                    break;
                };
                if let Some(tag) = parse_merge_mining_payload(payload) {
                    fields.push(ExtraField::MergeMiningTag(tag));
                }
                cursor += 2 + len;
            }
            _ => break,
        }
    }
    fields
}

fn parse_merge_mining_payload(payload: &[u8]) -> Option<MergeMiningTag> {
    let mut depth = 0u64;
    let mut shift = 0u32;
    let mut cursor = 0usize;
    loop {
        let byte = *payload.get(cursor)?;
        cursor += 1;
        depth |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    let bytes = payload.get(cursor..cursor + 32)?;
    let mut merkle_root = [0u8; 32];
    merkle_root.copy_from_slice(bytes);
    Some(MergeMiningTag { depth, merkle_root })
}

fn write_leb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn payment_id_from_extra(extra: &[u8]) -> Option<Hash> {
    for field in parse_extra(extra) {
        if let ExtraField::Nonce(nonce) = field {
            if nonce.len() == 33 && nonce[0] == TX_EXTRA_NONCE_PAYMENT_ID {
                let mut id = [0u8; 32];
                id.copy_from_slice(&nonce[1..]);
                return Some(id);
            }
        }
    }
    None
}

pub fn merge_mining_tag_from_extra(extra: &[u8]) -> Option<MergeMiningTag> {
    for field in parse_extra(extra) {
        if let ExtraField::MergeMiningTag(tag) = field {
            return Some(tag);
        }
    }
    None
}

pub fn tx_public_key_from_extra(extra: &[u8]) -> Option<PublicKey> {
    for field in parse_extra(extra) {
        if let ExtraField::PublicKey(key) = field {
            return Some(key);
        }
    }
    None
}

pub fn append_tx_public_key_to_extra(extra: &mut Vec<u8>, key: &PublicKey) {
    extra.push(TX_EXTRA_TAG_PUBKEY);
    extra.extend_from_slice(&key.0);
}

pub fn append_payment_id_to_extra(extra: &mut Vec<u8>, payment_id: &Hash) {
    extra.push(TX_EXTRA_TAG_NONCE);
    extra.push(33);
    extra.push(TX_EXTRA_NONCE_PAYMENT_ID);
    extra.extend_from_slice(payment_id);
}

pub fn append_extra_nonce_to_extra(extra: &mut Vec<u8>, nonce: &[u8]) -> bool {
    if nonce.len() > TX_EXTRA_NONCE_MAX_SIZE {
        return false;
    }
    extra.push(TX_EXTRA_TAG_NONCE);
    extra.push(nonce.len() as u8);
    extra.extend_from_slice(nonce);
    true
}

pub fn append_merge_mining_tag_to_extra(extra: &mut Vec<u8>, tag: &MergeMiningTag) -> bool {
    let mut payload = Vec::with_capacity(40);
    write_leb128(&mut payload, tag.depth);
    payload.extend_from_slice(&tag.merkle_root);
    if payload.len() > u8::MAX as usize {
        return false;
    }
    extra.push(TX_EXTRA_TAG_MERGE_MINING);
    extra.push(payload.len() as u8);
    extra.extend_from_slice(&payload);
    true
}

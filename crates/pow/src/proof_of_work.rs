//! Proof-of-work validation: long-hash selection by block version plus the
//! merge-mining envelope rules for pre-v5 blocks.

use umbrad_crypto::{slow_hash, Hash, PowAlgo};
use umbrad_primitives::block::{
    has_parent_block, Block, BLOCK_MAJOR_VERSION_3, BLOCK_MAJOR_VERSION_5,
};
use umbrad_primitives::extra::merge_mining_tag_from_extra;

use crate::difficulty::check_hash;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PowError {
    /// The hash does not meet the target difficulty.
    InsufficientWork,
    /// v2..v4 block without the mandatory merge-mining envelope.
    MissingParentBlock,
    /// Envelope coinbase lacks the merge-mining tag.
    MissingMergeMiningTag,
    /// The tag does not commit to this block.
    MergeMiningTagMismatch,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InsufficientWork => write!(f, "proof of work below target difficulty"),
            PowError::MissingParentBlock => write!(f, "block version requires a parent block"),
            PowError::MissingMergeMiningTag => {
                write!(f, "parent coinbase lacks a merge-mining tag")
            }
            PowError::MergeMiningTagMismatch => {
                write!(f, "merge-mining tag does not commit to the block")
            }
        }
    }
}

impl std::error::Error for PowError {}

pub fn pow_algo_for_version(major_version: u8) -> PowAlgo {
    if major_version >= BLOCK_MAJOR_VERSION_5 {
        PowAlgo::CnCpu
    } else if major_version >= BLOCK_MAJOR_VERSION_3 {
        PowAlgo::CnGpu
    } else {
        PowAlgo::Cn
    }
}

pub fn get_block_long_hash(block: &Block) -> Hash {
    slow_hash(
        &block.hashing_blob(),
        pow_algo_for_version(block.header.major_version),
    )
}

/// Validates the merge-mining envelope when the version mandates one, then
/// checks the long hash against the target difficulty. Returns the long hash
/// so callers can log it.
pub fn check_proof_of_work(block: &Block, difficulty: u64) -> Result<Hash, PowError> {
    if has_parent_block(block.header.major_version) {
        let parent = block
            .parent_block
            .as_ref()
            .ok_or(PowError::MissingParentBlock)?;
        let tag = merge_mining_tag_from_extra(&parent.base_transaction.prefix.extra)
            .ok_or(PowError::MissingMergeMiningTag)?;
        if tag.depth != 0 || tag.merkle_root != block.aux_hash() {
            return Err(PowError::MergeMiningTagMismatch);
        }
    }

    let hash = get_block_long_hash(block);
    if !check_hash(&hash, difficulty) {
        return Err(PowError::InsufficientWork);
    }
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbrad_crypto::generate_keys;
    use umbrad_primitives::block::{
        BlockHeader, ParentBlock, BLOCK_MAJOR_VERSION_1, BLOCK_MAJOR_VERSION_2,
        BLOCK_MINOR_VERSION_0,
    };
    use umbrad_primitives::extra::{append_merge_mining_tag_to_extra, MergeMiningTag};
    use umbrad_primitives::transaction::{
        BaseInput, KeyOutput, OutputTarget, Transaction, TransactionInput, TransactionOutput,
        TransactionPrefix,
    };

    fn coinbase(height: u32, extra: Vec<u8>) -> Transaction {
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
                extra,
            },
            signatures: Vec::new(),
        }
    }

    fn v1_block() -> Block {
        Block {
            header: BlockHeader {
                major_version: BLOCK_MAJOR_VERSION_1,
                minor_version: BLOCK_MINOR_VERSION_0,
                nonce: 0,
                timestamp: 1_600_000_000,
                previous_block_hash: [1u8; 32],
            },
            parent_block: None,
            base_transaction: coinbase(3, Vec::new()),
            transaction_hashes: Vec::new(),
        }
    }

    #[test]
    fn v1_passes_at_unit_difficulty() {
        let block = v1_block();
        let hash = check_proof_of_work(&block, 1).expect("pow");
        assert_eq!(hash, get_block_long_hash(&block));
    }

    #[test]
    fn algo_selection_follows_version() {
        assert_eq!(pow_algo_for_version(1), PowAlgo::Cn);
        assert_eq!(pow_algo_for_version(2), PowAlgo::Cn);
        assert_eq!(pow_algo_for_version(3), PowAlgo::CnGpu);
        assert_eq!(pow_algo_for_version(4), PowAlgo::CnGpu);
        assert_eq!(pow_algo_for_version(5), PowAlgo::CnCpu);
    }

    #[test]
    fn v2_requires_committing_envelope() {
        let mut block = v1_block();
        block.header.major_version = BLOCK_MAJOR_VERSION_2;
        assert_eq!(
            check_proof_of_work(&block, 1),
            Err(PowError::MissingParentBlock)
        );

        block.parent_block = Some(ParentBlock {
            major_version: BLOCK_MAJOR_VERSION_1,
            minor_version: BLOCK_MINOR_VERSION_0,
            previous_block_hash: [2u8; 32],
            transaction_count: 1,
            base_transaction_branch: Vec::new(),
            base_transaction: coinbase(0, Vec::new()),
            blockchain_branch: Vec::new(),
        });
        assert_eq!(
            check_proof_of_work(&block, 1),
            Err(PowError::MissingMergeMiningTag)
        );

        let mut extra = Vec::new();
        append_merge_mining_tag_to_extra(
            &mut extra,
            &MergeMiningTag {
                depth: 0,
                merkle_root: [9u8; 32],
            },
        );
        block
            .parent_block
            .as_mut()
            .expect("parent")
            .base_transaction = coinbase(0, extra);
        assert_eq!(
            check_proof_of_work(&block, 1),
            Err(PowError::MergeMiningTagMismatch)
        );

        let mut extra = Vec::new();
        append_merge_mining_tag_to_extra(
            &mut extra,
            &MergeMiningTag {
                depth: 0,
                merkle_root: block.aux_hash(),
            },
        );
        block
            .parent_block
            .as_mut()
            .expect("parent")
            .base_transaction = coinbase(0, extra);
        assert!(check_proof_of_work(&block, 1).is_ok());
    }
}

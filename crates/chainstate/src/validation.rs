//! Stateless consensus predicates: everything that can be checked from a
//! block, a handful of chain-derived numbers, and the currency parameters.

use umbrad_consensus::math::median_value;
use umbrad_consensus::{Amount, Currency};
use umbrad_primitives::block::{Block, BLOCK_MAJOR_VERSION_5};
use umbrad_primitives::extra::merge_mining_tag_from_extra;
use umbrad_primitives::transaction::TransactionInput;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VerificationError {
    WrongVersion { found: u8, expected: u8 },
    MergeMiningTagForbidden,
    WrongPreviousHash,
    TimestampTooFarInFuture,
    TimestampBelowMedian,
    DifficultyOverhead,
    ProofOfWork(&'static str),
    CheckpointMismatch,
    AlternativeBranchForbidden,
    PoissonCheckFailed,
    CoinbaseInputCount,
    CoinbaseInputType,
    CoinbaseSignatures,
    CoinbaseWrongHeight { found: u32, expected: u32 },
    CoinbaseWrongUnlockTime { found: u64, expected: u64 },
    CoinbaseOutputOverflow,
    CoinbaseWrongReward { found: Amount, expected: Amount },
    BlockRewardOversized,
    CumulativeSizeExceeded { size: u64, limit: u64 },
    MissingTransaction,
    MalformedCoinbaseHeight,
    InputEmptyRing,
    InputKeyImageDomain,
    InputKeyImageSpent,
    InputInvalidRingMember,
    InputLocked,
    InputSignatureMismatch,
    InputRingSignatureInvalid,
    InputMultisignatureInvalid,
    InputUnexpectedType,
    InputOverflow,
}

impl std::fmt::Display for VerificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationError::WrongVersion { found, expected } => {
                write!(f, "block major version {found}, expected {expected}")
            }
            VerificationError::MergeMiningTagForbidden => {
                write!(f, "merge mining tag in coinbase extra of a v5+ block")
            }
            VerificationError::WrongPreviousHash => {
                write!(f, "previous block hash does not match the chain tail")
            }
            VerificationError::TimestampTooFarInFuture => {
                write!(f, "block timestamp too far in the future")
            }
            VerificationError::TimestampBelowMedian => {
                write!(f, "block timestamp below the median of recent blocks")
            }
            VerificationError::DifficultyOverhead => write!(f, "difficulty computation overflowed"),
            VerificationError::ProofOfWork(reason) => write!(f, "proof of work: {reason}"),
            VerificationError::CheckpointMismatch => write!(f, "block contradicts a checkpoint"),
            VerificationError::AlternativeBranchForbidden => {
                write!(f, "alternative branch below the last checkpoint")
            }
            VerificationError::PoissonCheckFailed => {
                write!(f, "alternative chain timestamps fail the Poisson check")
            }
            VerificationError::CoinbaseInputCount => {
                write!(f, "coinbase must have exactly one input")
            }
            VerificationError::CoinbaseInputType => {
                write!(f, "coinbase input must be a base input")
            }
            VerificationError::CoinbaseSignatures => {
                write!(f, "coinbase must not carry signatures")
            }
            VerificationError::CoinbaseWrongHeight { found, expected } => {
                write!(f, "coinbase claims height {found}, expected {expected}")
            }
            VerificationError::CoinbaseWrongUnlockTime { found, expected } => {
                write!(f, "coinbase unlock time {found}, expected {expected}")
            }
            VerificationError::CoinbaseOutputOverflow => {
                write!(f, "coinbase output amounts overflow")
            }
            VerificationError::CoinbaseWrongReward { found, expected } => {
                write!(f, "coinbase pays {found}, allowed reward is {expected}")
            }
            VerificationError::BlockRewardOversized => {
                write!(f, "block too large for any reward")
            }
            VerificationError::CumulativeSizeExceeded { size, limit } => {
                write!(f, "cumulative block size {size} exceeds limit {limit}")
            }
            VerificationError::MissingTransaction => {
                write!(f, "referenced transaction not found in the pool")
            }
            VerificationError::MalformedCoinbaseHeight => {
                write!(f, "coinbase height field is malformed")
            }
            VerificationError::InputEmptyRing => write!(f, "key input carries no ring offsets"),
            VerificationError::InputKeyImageDomain => {
                write!(f, "key image outside the valid domain")
            }
            VerificationError::InputKeyImageSpent => write!(f, "key image already spent"),
            VerificationError::InputInvalidRingMember => {
                write!(f, "ring references an invalid output")
            }
            VerificationError::InputLocked => write!(f, "referenced output is still locked"),
            VerificationError::InputSignatureMismatch => {
                write!(f, "signature count does not match the ring size")
            }
            VerificationError::InputRingSignatureInvalid => write!(f, "ring signature invalid"),
            VerificationError::InputMultisignatureInvalid => {
                write!(f, "multisignature input invalid")
            }
            VerificationError::InputUnexpectedType => {
                write!(f, "unexpected input type in transaction")
            }
            VerificationError::InputOverflow => write!(f, "input amounts overflow"),
        }
    }
}

impl std::error::Error for VerificationError {}

/// Structural coinbase checks that need no chain state beyond the height.
pub fn prevalidate_coinbase(
    block: &Block,
    height: u32,
    currency: &Currency,
) -> Result<(), VerificationError> {
    let coinbase = &block.base_transaction;
    if coinbase.prefix.inputs.len() != 1 {
        return Err(VerificationError::CoinbaseInputCount);
    }
    if !coinbase.signatures.is_empty() {
        return Err(VerificationError::CoinbaseSignatures);
    }
    let TransactionInput::Base(input) = &coinbase.prefix.inputs[0] else {
        return Err(VerificationError::CoinbaseInputType);
    };
    if input.block_index != height {
        return Err(VerificationError::CoinbaseWrongHeight {
            found: input.block_index,
            expected: height,
        });
    }

    let expected_unlock = u64::from(height)
        + u64::from(currency.mined_money_unlock_window(block.header.major_version));
    if coinbase.prefix.unlock_time != expected_unlock {
        return Err(VerificationError::CoinbaseWrongUnlockTime {
            found: coinbase.prefix.unlock_time,
            expected: expected_unlock,
        });
    }

    if !coinbase.check_outs_overflow() {
        return Err(VerificationError::CoinbaseOutputOverflow);
    }
    Ok(())
}

/// Exact-match reward check. Returns `(reward, emission_change)` on success.
pub fn validate_coinbase_reward(
    block: &Block,
    currency: &Currency,
    last_block_sizes: &[u64],
    cumulative_block_size: u64,
    already_generated_coins: Amount,
    fee: Amount,
) -> Result<(Amount, i64), VerificationError> {
    let miner_reward: Amount = block.base_transaction.output_amount();
    let median = median_value(last_block_sizes);

    let (reward, emission_change) = currency
        .get_block_reward(
            block.header.major_version,
            median as usize,
            cumulative_block_size as usize,
            already_generated_coins,
            fee,
        )
        .ok_or(VerificationError::BlockRewardOversized)?;

    if miner_reward != reward {
        return Err(VerificationError::CoinbaseWrongReward {
            found: miner_reward,
            expected: reward,
        });
    }
    Ok((reward, emission_change))
}

/// Median-window timestamp rule. `timestamps` are the most recent main-chain
/// (or spliced alternative) timestamps, oldest first.
pub fn check_block_timestamp(
    timestamps: &[u64],
    block: &Block,
    currency: &Currency,
    now: u64,
) -> Result<(), VerificationError> {
    let window = currency.timestamp_check_window(block.header.major_version);
    if block.header.timestamp
        > now + currency.block_future_time_limit(block.header.major_version)
    {
        return Err(VerificationError::TimestampTooFarInFuture);
    }
    if timestamps.len() < window {
        return Ok(());
    }
    let median = median_value(&timestamps[timestamps.len() - window..]);
    if block.header.timestamp < median {
        return Err(VerificationError::TimestampBelowMedian);
    }
    Ok(())
}

pub fn check_cumulative_size(
    currency: &Currency,
    cumulative_size: u64,
    height: u64,
) -> Result<(), VerificationError> {
    let limit = currency.max_block_cumulative_size(height) as u64;
    if cumulative_size > limit {
        return Err(VerificationError::CumulativeSizeExceeded {
            size: cumulative_size,
            limit,
        });
    }
    Ok(())
}

/// v5 removed merged mining outright.
pub fn check_merge_mining_tag_allowed(block: &Block) -> Result<(), VerificationError> {
    if block.header.major_version >= BLOCK_MAJOR_VERSION_5
        && merge_mining_tag_from_extra(&block.base_transaction.prefix.extra).is_some()
    {
        return Err(VerificationError::MergeMiningTagForbidden);
    }
    Ok(())
}

/// Unlock-time gate: heights compare against the spending height plus a
/// small allowance, timestamps against the last block time plus the
/// equivalent seconds.
pub fn is_spend_time_unlocked(
    currency: &Currency,
    unlock_time: u64,
    height: u32,
    last_block_timestamp: u64,
) -> bool {
    if unlock_time < currency.max_block_height() {
        u64::from(height.saturating_sub(1)) + currency.locked_tx_allowed_delta_blocks()
            >= unlock_time
    } else {
        last_block_timestamp + currency.locked_tx_allowed_delta_seconds() >= unlock_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbrad_consensus::{currency, Network};
    use umbrad_primitives::block::{
        BlockHeader, BLOCK_MAJOR_VERSION_1, BLOCK_MINOR_VERSION_0,
    };
    use umbrad_primitives::transaction::{
        BaseInput, KeyOutput, OutputTarget, Transaction, TransactionOutput, TransactionPrefix,
    };
    use umbrad_crypto::generate_keys;

    fn block_with_coinbase(height: u32, reward: Amount, currency: &Currency) -> Block {
        let (key, _) = generate_keys();
        let unlock = u64::from(height)
            + u64::from(currency.mined_money_unlock_window(BLOCK_MAJOR_VERSION_1));
        Block {
            header: BlockHeader {
                major_version: BLOCK_MAJOR_VERSION_1,
                minor_version: BLOCK_MINOR_VERSION_0,
                nonce: 0,
                timestamp: 1_600_000_000,
                previous_block_hash: [0u8; 32],
            },
            parent_block: None,
            base_transaction: Transaction {
                prefix: TransactionPrefix {
                    version: 1,
                    unlock_time: unlock,
                    inputs: vec![TransactionInput::Base(BaseInput {
                        block_index: height,
                    })],
                    outputs: vec![TransactionOutput {
                        amount: reward,
                        target: OutputTarget::Key(KeyOutput { key }),
                    }],
                    extra: Vec::new(),
                },
                signatures: Vec::new(),
            },
            transaction_hashes: Vec::new(),
        }
    }

    #[test]
    fn coinbase_shape_is_enforced() {
        let currency = currency(Network::Mainnet);
        let block = block_with_coinbase(4, 10, &currency);
        assert!(prevalidate_coinbase(&block, 4, &currency).is_ok());

        assert!(matches!(
            prevalidate_coinbase(&block, 5, &currency),
            Err(VerificationError::CoinbaseWrongHeight { .. })
        ));

        let mut wrong_unlock = block.clone();
        wrong_unlock.base_transaction.prefix.unlock_time += 1;
        assert!(matches!(
            prevalidate_coinbase(&wrong_unlock, 4, &currency),
            Err(VerificationError::CoinbaseWrongUnlockTime { .. })
        ));
    }

    #[test]
    fn reward_must_match_exactly() {
        let currency = currency(Network::Mainnet);
        let expected = currency.base_reward(0);

        let exact = block_with_coinbase(1, expected, &currency);
        assert!(validate_coinbase_reward(&exact, &currency, &[], 1_000, 0, 0).is_ok());

        let under = block_with_coinbase(1, expected - 1, &currency);
        assert!(matches!(
            validate_coinbase_reward(&under, &currency, &[], 1_000, 0, 0),
            Err(VerificationError::CoinbaseWrongReward { .. })
        ));

        let over = block_with_coinbase(1, expected + 1, &currency);
        assert!(matches!(
            validate_coinbase_reward(&over, &currency, &[], 1_000, 0, 0),
            Err(VerificationError::CoinbaseWrongReward { .. })
        ));
    }

    #[test]
    fn timestamp_median_boundary() {
        let currency = currency(Network::Mainnet);
        let window = currency.timestamp_check_window(BLOCK_MAJOR_VERSION_1);
        let timestamps: Vec<u64> = (0..window as u64).map(|i| 1_000 + i).collect();
        let median = median_value(&timestamps);

        let mut block = block_with_coinbase(window as u32, 10, &currency);
        block.header.timestamp = median;
        assert!(check_block_timestamp(&timestamps, &block, &currency, median).is_ok());

        block.header.timestamp = median - 1;
        assert!(matches!(
            check_block_timestamp(&timestamps, &block, &currency, median),
            Err(VerificationError::TimestampBelowMedian)
        ));
    }

    #[test]
    fn short_history_skips_median_rule() {
        let currency = currency(Network::Mainnet);
        let block = block_with_coinbase(1, 10, &currency);
        assert!(check_block_timestamp(&[1_000_000], &block, &currency, 1_600_000_000).is_ok());
    }

    #[test]
    fn future_limit_is_enforced() {
        let currency = currency(Network::Mainnet);
        let mut block = block_with_coinbase(1, 10, &currency);
        let now = 1_600_000_000;
        block.header.timestamp =
            now + currency.block_future_time_limit(BLOCK_MAJOR_VERSION_1) + 1;
        assert!(matches!(
            check_block_timestamp(&[], &block, &currency, now),
            Err(VerificationError::TimestampTooFarInFuture)
        ));
    }

    #[test]
    fn unlock_time_as_height_and_timestamp() {
        let currency = currency(Network::Mainnet);
        // Height-interpreted.
        assert!(is_spend_time_unlocked(&currency, 10, 10, 0));
        assert!(!is_spend_time_unlocked(&currency, 50, 10, 0));
        // Timestamp-interpreted.
        let stamp = currency.max_block_height() + 1_000;
        assert!(is_spend_time_unlocked(&currency, stamp, 10, stamp));
        assert!(!is_spend_time_unlocked(
            &currency,
            stamp,
            10,
            stamp - currency.locked_tx_allowed_delta_seconds() - 1
        ));
    }
}

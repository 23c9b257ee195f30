//! Currency parameters: everything the validation and mining paths need to
//! know about a concrete network deployment.

use umbrad_crypto::{Hash, PublicKey, NULL_HASH};
use umbrad_primitives::block::{
    Block, BlockHeader, BLOCK_MAJOR_VERSION_1, BLOCK_MAJOR_VERSION_2, BLOCK_MAJOR_VERSION_5,
    BLOCK_MINOR_VERSION_0,
};
use umbrad_primitives::extra::append_tx_public_key_to_extra;
use umbrad_primitives::transaction::{
    BaseInput, KeyOutput, OutputTarget, Transaction, TransactionInput, TransactionOutput,
    TransactionPrefix,
};

use crate::constants::*;
use crate::money::Amount;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/// Heights at which each major version activates. `None` means the version is
/// adopted by miner voting instead of a scheduled height.
#[derive(Clone, Copy, Debug)]
pub struct UpgradeHeights {
    pub v2: Option<u32>,
    pub v3: Option<u32>,
    pub v4: Option<u32>,
    pub v5: Option<u32>,
}

impl UpgradeHeights {
    pub fn height_for(&self, target_version: u8) -> Option<u32> {
        match target_version {
            2 => self.v2,
            3 => self.v3,
            4 => self.v4,
            5 => self.v5,
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Currency {
    pub network: Network,
    pub upgrade_heights: UpgradeHeights,
    pub genesis_timestamp: u64,
    pub genesis_nonce: u32,
    pub minimum_fee: Amount,
    pub upgrade_voting_window: u32,
    pub upgrade_voting_threshold: u32,
    pub max_upgrade_distance: u32,
}

impl Currency {
    pub fn difficulty_target(&self) -> u64 {
        DIFFICULTY_TARGET
    }

    pub fn max_block_height(&self) -> u64 {
        MAX_BLOCK_HEIGHT
    }

    pub fn mined_money_unlock_window(&self, major_version: u8) -> u32 {
        if major_version >= BLOCK_MAJOR_VERSION_5 {
            MINED_MONEY_UNLOCK_WINDOW_V5
        } else {
            MINED_MONEY_UNLOCK_WINDOW
        }
    }

    pub fn timestamp_check_window(&self, major_version: u8) -> usize {
        if major_version >= BLOCK_MAJOR_VERSION_5 {
            TIMESTAMP_CHECK_WINDOW_V5
        } else {
            TIMESTAMP_CHECK_WINDOW
        }
    }

    pub fn block_future_time_limit(&self, major_version: u8) -> u64 {
        if major_version >= BLOCK_MAJOR_VERSION_5 {
            BLOCK_FUTURE_TIME_LIMIT_V5
        } else {
            BLOCK_FUTURE_TIME_LIMIT
        }
    }

    pub fn locked_tx_allowed_delta_blocks(&self) -> u64 {
        LOCKED_TX_ALLOWED_DELTA_BLOCKS
    }

    pub fn locked_tx_allowed_delta_seconds(&self) -> u64 {
        LOCKED_TX_ALLOWED_DELTA_SECONDS
    }

    pub fn reward_blocks_window(&self) -> usize {
        REWARD_BLOCKS_WINDOW
    }

    pub fn full_reward_zone(&self, major_version: u8) -> usize {
        if major_version >= BLOCK_MAJOR_VERSION_2 {
            BLOCK_GRANTED_FULL_REWARD_ZONE_V2
        } else {
            BLOCK_GRANTED_FULL_REWARD_ZONE
        }
    }

    pub fn max_block_cumulative_size(&self, height: u64) -> usize {
        let growth = height
            .saturating_mul(MAX_BLOCK_SIZE_GROWTH_SPEED_NUMERATOR)
            / MAX_BLOCK_SIZE_GROWTH_SPEED_DENOMINATOR;
        MAX_BLOCK_SIZE_INITIAL.saturating_add(growth as usize)
    }

    /// Number of trailing (timestamp, cumulative difficulty) pairs the
    /// difficulty formula for the given version consumes.
    pub fn difficulty_blocks_count(&self, major_version: u8) -> usize {
        match major_version {
            0..=2 => DIFFICULTY_WINDOW + DIFFICULTY_LAG,
            3 | 4 => DIFFICULTY_WINDOW_V3 + 1,
            _ => DIFFICULTY_WINDOW_V5 + 1,
        }
    }

    pub fn base_reward(&self, already_generated_coins: Amount) -> Amount {
        (MONEY_SUPPLY - already_generated_coins) >> EMISSION_SPEED_FACTOR
    }

    /// Reward for a block of `current_block_size` given the median size of
    /// the reward window. Oversized blocks shrink the reward quadratically;
    /// blocks past twice the median earn nothing and are invalid.
    pub fn get_block_reward(
        &self,
        major_version: u8,
        median_size: usize,
        current_block_size: usize,
        already_generated_coins: Amount,
        fee: Amount,
    ) -> Option<(Amount, i64)> {
        let base_reward = self.base_reward(already_generated_coins);
        let median_size = median_size.max(self.full_reward_zone(major_version));
        if current_block_size > 2 * median_size {
            return None;
        }

        let penalized_base = penalized_amount(base_reward, median_size, current_block_size);
        let penalized_fee = if major_version >= BLOCK_MAJOR_VERSION_2 {
            penalized_amount(fee, median_size, current_block_size)
        } else {
            fee
        };

        let reward = penalized_base + penalized_fee;
        let emission_change = penalized_base as i64 - (fee - penalized_fee) as i64;
        Some((reward, emission_change))
    }

    pub fn minimal_fee(&self) -> Amount {
        self.minimum_fee
    }

    pub fn stake_for_difficulty(&self, difficulty: u64) -> Amount {
        difficulty.saturating_mul(STAKE_TO_DIFFICULTY_RATIO)
    }

    /// Deterministic genesis block synthesized from the network parameters.
    pub fn genesis_block(&self) -> Block {
        let reward = self.base_reward(0);
        let base_transaction = Transaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_time: u64::from(self.mined_money_unlock_window(BLOCK_MAJOR_VERSION_1)),
                inputs: vec![TransactionInput::Base(BaseInput { block_index: 0 })],
                outputs: vec![TransactionOutput {
                    amount: reward,
                    target: OutputTarget::Key(KeyOutput {
                        key: genesis_output_key(self.network),
                    }),
                }],
                extra: genesis_extra(),
            },
            signatures: Vec::new(),
        };
        Block {
            header: BlockHeader {
                major_version: BLOCK_MAJOR_VERSION_1,
                minor_version: BLOCK_MINOR_VERSION_0,
                nonce: self.genesis_nonce,
                timestamp: self.genesis_timestamp,
                previous_block_hash: NULL_HASH,
            },
            parent_block: None,
            base_transaction,
            transaction_hashes: Vec::new(),
        }
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_block().hash()
    }
}

fn genesis_extra() -> Vec<u8> {
    let mut extra = Vec::with_capacity(33);
    append_tx_public_key_to_extra(&mut extra, &PublicKey([0u8; 32]));
    extra
}

fn penalized_amount(amount: Amount, median_size: usize, current_block_size: usize) -> Amount {
    if current_block_size <= median_size {
        return amount;
    }
    // amount * (2 * median - size) * size / median^2, in 128-bit space.
    let amount = amount as u128;
    let median = median_size as u128;
    let size = current_block_size as u128;
    let product = amount * (2 * median - size);
    let product = (product / median) * size / median;
    product as Amount
}

fn genesis_output_key(network: Network) -> PublicKey {
    let tag: &[u8] = match network {
        Network::Mainnet => b"umbra/genesis/mainnet",
        Network::Testnet => b"umbra/genesis/testnet",
        Network::Regtest => b"umbra/genesis/regtest",
    };
    umbrad_crypto::ring::public_key_from_tag(tag)
}

pub fn currency(network: Network) -> Currency {
    match network {
        Network::Mainnet => Currency {
            network,
            upgrade_heights: UpgradeHeights {
                v2: Some(60_000),
                v3: Some(216_000),
                v4: Some(266_000),
                v5: None,
            },
            genesis_timestamp: 1_464_595_534,
            genesis_nonce: 10_000,
            minimum_fee: 100_000_000,
            upgrade_voting_window: UPGRADE_VOTING_WINDOW,
            upgrade_voting_threshold: UPGRADE_VOTING_THRESHOLD,
            max_upgrade_distance: MAX_UPGRADE_DISTANCE,
        },
        Network::Testnet => Currency {
            network,
            upgrade_heights: UpgradeHeights {
                v2: Some(100),
                v3: Some(200),
                v4: Some(300),
                v5: Some(400),
            },
            genesis_timestamp: 1_464_595_534,
            genesis_nonce: 10_001,
            minimum_fee: 100_000_000,
            upgrade_voting_window: UPGRADE_VOTING_WINDOW,
            upgrade_voting_threshold: UPGRADE_VOTING_THRESHOLD,
            max_upgrade_distance: MAX_UPGRADE_DISTANCE,
        },
        Network::Regtest => Currency {
            network,
            upgrade_heights: UpgradeHeights {
                v2: None,
                v3: None,
                v4: None,
                v5: None,
            },
            genesis_timestamp: 1_464_595_534,
            genesis_nonce: 10_002,
            minimum_fee: 0,
            upgrade_voting_window: 8,
            upgrade_voting_threshold: UPGRADE_VOTING_THRESHOLD,
            max_upgrade_distance: 16,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_stable_per_network() {
        let mainnet = currency(Network::Mainnet);
        let testnet = currency(Network::Testnet);
        assert_eq!(mainnet.genesis_hash(), mainnet.genesis_hash());
        assert_ne!(mainnet.genesis_hash(), testnet.genesis_hash());
        assert_eq!(mainnet.genesis_block().height(), Some(0));
    }

    #[test]
    fn reward_unpenalized_at_or_below_median() {
        let currency = currency(Network::Mainnet);
        let generated = 0;
        let base = currency.base_reward(generated);
        let (reward, emission) = currency
            .get_block_reward(BLOCK_MAJOR_VERSION_1, 0, 10_000, generated, 0)
            .expect("reward");
        assert_eq!(reward, base);
        assert_eq!(emission, base as i64);
    }

    #[test]
    fn reward_penalized_above_median() {
        let currency = currency(Network::Mainnet);
        let zone = currency.full_reward_zone(BLOCK_MAJOR_VERSION_2);
        let base = currency.base_reward(0);
        let (reward, _) = currency
            .get_block_reward(BLOCK_MAJOR_VERSION_2, zone, zone + zone / 2, 0, 0)
            .expect("reward");
        assert!(reward < base);

        assert_eq!(
            currency.get_block_reward(BLOCK_MAJOR_VERSION_2, zone, 2 * zone + 1, 0, 0),
            None
        );
    }

    #[test]
    fn fees_join_the_reward() {
        let currency = currency(Network::Mainnet);
        let fee = 12_345;
        let base = currency.base_reward(0);
        let (reward, emission) = currency
            .get_block_reward(BLOCK_MAJOR_VERSION_2, 0, 1_000, 0, fee)
            .expect("reward");
        assert_eq!(reward, base + fee);
        assert_eq!(emission, base as i64);
    }

    #[test]
    fn cumulative_size_limit_grows_with_height() {
        let currency = currency(Network::Mainnet);
        let at_zero = currency.max_block_cumulative_size(0);
        let later = currency.max_block_cumulative_size(1_000_000);
        assert_eq!(at_zero, MAX_BLOCK_SIZE_INITIAL);
        assert!(later > at_zero);
    }
}

//! Node core: owns the chain manager and the memory pool, wires the miner,
//! and serves the block-template path.

use std::sync::Arc;

use umbrad_chainstate::{
    BlockAddResult, Blockchain, ChainError, RandomOutsRequest, RandomOutsResponse,
};
use umbrad_consensus::constants::COINBASE_BLOB_RESERVED_SIZE;
use umbrad_consensus::math::median_value;
use umbrad_consensus::{Checkpoints, Currency};
use umbrad_crypto::{generate_keys, hash_to_hex, Hash, PublicKey};
use umbrad_log::{log_error, log_info};
use umbrad_miner::{BlockTemplate, Miner, MinerHandler};
use umbrad_primitives::block::{
    has_parent_block, Block, BlockHeader, ParentBlock, BLOCK_MAJOR_VERSION_1,
    BLOCK_MINOR_VERSION_0,
};
use umbrad_primitives::extra::{append_extra_nonce_to_extra, append_tx_public_key_to_extra};
use umbrad_primitives::transaction::{
    BaseInput, KeyOutput, OutputTarget, Transaction, TransactionInput, TransactionOutput,
    TransactionPrefix,
};
use umbrad_storage::{KeyValueBackend, OpenMode};

use crate::mempool::{Mempool, MempoolError};

pub struct Core {
    chain: Arc<Blockchain>,
    mempool: Arc<Mempool>,
    mine_target: PublicKey,
}

impl Core {
    pub fn new(
        currency: Currency,
        checkpoints: Checkpoints,
        backend: Arc<dyn KeyValueBackend>,
        mode: OpenMode,
        mine_target: Option<PublicKey>,
    ) -> Result<Self, ChainError> {
        let chain = Arc::new(Blockchain::new(currency, checkpoints, backend, mode)?);
        let mine_target = mine_target.unwrap_or_else(|| generate_keys().0);
        Ok(Self {
            chain,
            mempool: Arc::new(Mempool::new()),
            mine_target,
        })
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn handle_incoming_block(
        &self,
        block: &Block,
        miner: Option<&Miner>,
    ) -> Result<BlockAddResult, ChainError> {
        if let Some(miner) = miner {
            miner.pause();
        }
        let result = self.chain.add_block(block, self.mempool.as_ref());
        if let Some(miner) = miner {
            miner.resume();
        }
        result
    }

    pub fn handle_incoming_transaction(&self, tx: Transaction) -> Result<Hash, MempoolError> {
        self.mempool.add_transaction(tx, &self.chain)
    }

    pub fn random_outputs(
        &self,
        request: &RandomOutsRequest,
    ) -> Result<RandomOutsResponse, ChainError> {
        self.chain.random_outputs_by_amount(request)
    }

    /// Assembles a candidate block over the current tip: pool transactions
    /// capped at the penalty-free zone, coinbase paying the exact allowed
    /// reward.
    pub fn build_template(&self, extra_nonce: &[u8]) -> Result<BlockTemplate, ChainError> {
        let height = self.chain.block_count();
        let version = self.chain.next_block_major_version();
        let difficulty = self.chain.next_block_difficulty()?;
        let previous_block_hash = self.chain.tail_hash()?;
        let currency = self.chain.currency();

        let sizes = self
            .chain
            .last_blocks_sizes(currency.reward_blocks_window())?;
        let median_size =
            median_value(&sizes).max(currency.full_reward_zone(version) as u64);

        let budget = median_size.saturating_sub(COINBASE_BLOB_RESERVED_SIZE as u64);
        let (hashes, txs_size, fee) = self.mempool.pick_for_block(budget);

        let already_generated = self.chain.coins_in_circulation()?;
        // The reward depends on the block size, which includes the coinbase;
        // a probe coinbase settles the size since the amount is fixed-width.
        let probe = self.coinbase_for_reward(0, height, version, extra_nonce);
        let cumulative = txs_size + probe.binary_size() as u64;
        let reward = match currency.get_block_reward(
            version,
            median_size as usize,
            cumulative as usize,
            already_generated,
            fee,
        ) {
            Some((reward, _)) => reward,
            None => {
                log_error!("template oversized for any reward, mining an empty block");
                currency.base_reward(already_generated)
            }
        };
        let base_transaction = self.coinbase_for_reward(reward, height, version, extra_nonce);

        let parent_block = has_parent_block(version).then(|| ParentBlock {
            major_version: BLOCK_MAJOR_VERSION_1,
            minor_version: BLOCK_MINOR_VERSION_0,
            previous_block_hash,
            transaction_count: 1,
            base_transaction_branch: Vec::new(),
            base_transaction: Transaction {
                prefix: TransactionPrefix {
                    version: 1,
                    unlock_time: 0,
                    inputs: vec![TransactionInput::Base(BaseInput {
                        block_index: height,
                    })],
                    outputs: Vec::new(),
                    extra: Vec::new(),
                },
                signatures: Vec::new(),
            },
            blockchain_branch: Vec::new(),
        });

        let block = Block {
            header: BlockHeader {
                major_version: version,
                minor_version: BLOCK_MINOR_VERSION_0,
                nonce: 0,
                timestamp: unix_time(),
                previous_block_hash,
            },
            parent_block,
            base_transaction,
            transaction_hashes: hashes,
        };

        Ok(BlockTemplate {
            block,
            difficulty,
            height,
        })
    }

    fn coinbase_for_reward(
        &self,
        reward: u64,
        height: u32,
        version: u8,
        extra_nonce: &[u8],
    ) -> Transaction {
        let currency = self.chain.currency();
        let mut extra = Vec::new();
        let (ephemeral, _) = generate_keys();
        append_tx_public_key_to_extra(&mut extra, &ephemeral);
        if !extra_nonce.is_empty() {
            append_extra_nonce_to_extra(&mut extra, extra_nonce);
        }
        Transaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_time: u64::from(height)
                    + u64::from(currency.mined_money_unlock_window(version)),
                inputs: vec![TransactionInput::Base(BaseInput {
                    block_index: height,
                })],
                outputs: vec![TransactionOutput {
                    amount: reward,
                    target: OutputTarget::Key(KeyOutput {
                        key: self.mine_target,
                    }),
                }],
                extra,
            },
            signatures: Vec::new(),
        }
    }

    pub fn on_synchronized(&self) -> Result<(), ChainError> {
        log_info!("node synchronized with the network");
        self.chain.on_synchronized()
    }
}

/// Miner-facing adapter over the core.
pub struct CoreMinerHandler {
    core: Arc<Core>,
}

impl CoreMinerHandler {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }
}

impl MinerHandler for CoreMinerHandler {
    fn build_block_template(&self, extra_nonce: &[u8]) -> Result<BlockTemplate, String> {
        self.core
            .build_template(extra_nonce)
            .map_err(|err| err.to_string())
    }

    fn handle_block_found(&self, block: Block) -> bool {
        match self.core.handle_incoming_block(&block, None) {
            Ok(BlockAddResult::AddedToMain) | Ok(BlockAddResult::SwitchedToAlt) => true,
            Ok(other) => {
                log_error!(
                    "mined block {} not accepted: {:?}",
                    hash_to_hex(&block.hash()),
                    other
                );
                false
            }
            Err(err) => {
                log_error!("mined block rejected with storage error: {err}");
                false
            }
        }
    }

    fn next_block_difficulty(&self) -> u64 {
        self.core.chain().next_block_difficulty().unwrap_or(0)
    }
}

fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

//! The chain manager: main-chain push/pop, alternative-chain tracking,
//! reorganization arbitration, and the read paths served to wallets,
//! explorers, and the protocol layer.
//!
//! All mutating operations are serialized by one inner lock; the ingest path
//! acquires the transaction-pool session before that lock and never in the
//! other order. The cached block count is readable without the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use rand::Rng;

use umbrad_consensus::constants::{
    DB_COMMIT_PERIOD, DB_SCHEMA_VERSION, DIFFICULTY_TARGET, POISSON_CHECK_DEPTH,
    POISSON_CHECK_TRIGGER, POISSON_LOG_P_REJECT,
};
use umbrad_consensus::math::{median_value, poisson_log_p_tail};
use umbrad_consensus::{Checkpoints, Currency};
use umbrad_crypto::{check_ring_signature, check_single_signature, key_image_in_domain, KeyImage};
use umbrad_crypto::{hash_to_hex, Hash, PublicKey, NULL_HASH};
use umbrad_log::{log_debug, log_error, log_info, log_trace, log_warn};
use umbrad_primitives::block::Block;
use umbrad_primitives::encoding::{decode, encode};
use umbrad_primitives::extra::payment_id_from_extra;
use umbrad_primitives::transaction::{
    relative_output_offsets_to_absolute, KeyInput, MultisignatureInput, OutputTarget, Transaction,
    TransactionInput,
};
use umbrad_pow::{check_proof_of_work, next_difficulty};
use umbrad_storage::{Database, KeyValueBackend, OpenMode, StoreError};

use crate::entry::{BlockEntry, TransactionEntry, TransactionIndex};
use crate::index::{
    block_entry_key, block_index_key, generated_transactions_key, hash_from_value,
    height_from_block_index_key, multisignature_outputs_key, outputs_key, payment_id_key,
    spent_key_image_key, timestamp_key, transaction_index_key, MultisignatureOutputsEntry,
    OutputsEntry, PaymentIdEntry, TimestampEntry, BLOCK_INDEX_PREFIX, TIMESTAMP_INDEX_PREFIX,
};
use crate::messages::{BlockchainMessage, BlockchainObserver, MessageQueues};
use crate::pool::{NoopPool, PoolSession, TransactionPool};
use crate::upgrade::{expected_major_version_for_height, UpgradeDetector, VersionView};
use crate::validation::{
    check_block_timestamp, check_cumulative_size, check_merge_mining_tag_allowed,
    is_spend_time_unlocked, prevalidate_coinbase, validate_coinbase_reward, VerificationError,
};

use umbrad_primitives::varint::{read_varint_sqlite4, write_varint_sqlite4};

#[derive(Debug)]
pub enum ChainError {
    Storage(StoreError),
    ConfigMismatch(String),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Storage(err) => write!(f, "{err}"),
            ChainError::ConfigMismatch(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Storage(err)
    }
}

/// Outcome of [`Blockchain::add_block`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockAddResult {
    AddedToMain,
    AddedAsAlternative,
    AlreadyExists,
    SwitchedToAlt,
    VerificationFailed(VerificationError),
    MarkedOrphan,
}

/// Verification or storage failure inside a push path.
enum BlockError {
    Verification(VerificationError),
    Storage(StoreError),
}

impl From<VerificationError> for BlockError {
    fn from(err: VerificationError) -> Self {
        BlockError::Verification(err)
    }
}

impl From<StoreError> for BlockError {
    fn from(err: StoreError) -> Self {
        BlockError::Storage(err)
    }
}

#[derive(Clone, Debug)]
pub struct RandomOutsRequest {
    pub amounts: Vec<u64>,
    pub outs_count: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RandomOutEntry {
    pub global_amount_index: u32,
    pub out_key: PublicKey,
}

#[derive(Clone, Debug)]
pub struct RandomOutsForAmount {
    pub amount: u64,
    pub outs: Vec<RandomOutEntry>,
}

#[derive(Clone, Debug, Default)]
pub struct RandomOutsResponse {
    pub outs: Vec<RandomOutsForAmount>,
}

struct ChainInner {
    db: Database,
    alternative_chains: HashMap<Hash, BlockEntry>,
    checkpoints: Checkpoints,
    detectors: Vec<UpgradeDetector>,
    current_cumulative_size_limit: u64,
    synchronized: bool,
    last_generated_tx_number: u64,
}

impl VersionView for ChainInner {
    fn block_count(&self) -> u32 {
        match self.db.last_in_prefix(BLOCK_INDEX_PREFIX, None) {
            Ok(Some((key, _))) => height_from_block_index_key(&key)
                .map(|height| height + 1)
                .unwrap_or(0),
            _ => 0,
        }
    }

    fn block_version_at(&self, height: u32) -> Option<(u8, u8)> {
        let hash = self
            .db
            .get(&block_index_key(height))
            .ok()
            .flatten()
            .and_then(|value| hash_from_value(&value))?;
        let bytes = self.db.get(&block_entry_key(&hash)).ok().flatten()?;
        let entry: BlockEntry = decode(&bytes).ok()?;
        Some((
            entry.block.header.major_version,
            entry.block.header.minor_version,
        ))
    }
}

pub struct Blockchain {
    currency: Currency,
    inner: Mutex<ChainInner>,
    block_count: AtomicU32,
    observers: Mutex<Vec<Arc<dyn BlockchainObserver>>>,
    queues: Mutex<MessageQueues>,
}

impl Blockchain {
    /// Opens (or creates) the chain database and brings the in-memory state
    /// up: genesis, upgrade detectors, size limit, checkpoint re-validation.
    pub fn new(
        currency: Currency,
        checkpoints: Checkpoints,
        backend: Arc<dyn KeyValueBackend>,
        mode: OpenMode,
    ) -> Result<Self, ChainError> {
        let db = Database::open(backend, mode, DB_SCHEMA_VERSION).map_err(|err| match err {
            StoreError::VersionMismatch { found, expected } => ChainError::ConfigMismatch(
                format!("database schema version {found:?}, this build expects {expected:?}"),
            ),
            other => ChainError::Storage(other),
        })?;

        let chain = Self {
            currency,
            inner: Mutex::new(ChainInner {
                db,
                alternative_chains: HashMap::new(),
                checkpoints,
                detectors: (2u8..=5).map(UpgradeDetector::new).collect(),
                current_cumulative_size_limit: 0,
                synchronized: false,
                last_generated_tx_number: 1,
            }),
            block_count: AtomicU32::new(0),
            observers: Mutex::new(Vec::new()),
            queues: Mutex::new(MessageQueues::new()),
        };
        chain.init()?;
        Ok(chain)
    }

    fn init(&self) -> Result<(), ChainError> {
        let mut inner = self.lock_inner();
        let inner = &mut *inner;

        match self.tip(inner)? {
            None => {
                let genesis = self.currency.genesis_block();
                let id = genesis.hash();
                log_info!("empty store, inserting genesis block {}", hash_to_hex(&id));
                let noop = NoopPool;
                let mut session = noop.session();
                if let Err(err) =
                    self.push_block_with_transactions(inner, session.as_mut(), &genesis, &[], &id)
                {
                    return Err(match err {
                        BlockError::Storage(err) => ChainError::Storage(err),
                        BlockError::Verification(err) => ChainError::ConfigMismatch(format!(
                            "generated genesis block failed validation: {err}"
                        )),
                    });
                }
                inner.db.commit()?;
            }
            Some(_) => {
                let stored = self
                    .block_hash_at(inner, 0)?
                    .ok_or_else(|| StoreError::Backend("missing genesis index entry".into()))?;
                let expected = self.currency.genesis_hash();
                if stored != expected {
                    return Err(ChainError::ConfigMismatch(format!(
                        "genesis block mismatch: store has {}, configuration expects {}; \
                         wrong network or data directory",
                        hash_to_hex(&stored),
                        hash_to_hex(&expected)
                    )));
                }
            }
        }

        self.block_count
            .store(inner.block_count(), Ordering::Relaxed);

        inner.last_generated_tx_number = match inner
            .db
            .last_in_prefix(crate::index::GENERATED_TRANSACTIONS_PREFIX, None)?
        {
            Some((_, value)) => read_varint_sqlite4(&value)
                .map(|(count, _)| count)
                .ok_or_else(|| StoreError::Backend("corrupt generated-tx counter".into()))?,
            None => 1,
        };

        let mut detectors = std::mem::take(&mut inner.detectors);
        for detector in &mut detectors {
            detector.init(&self.currency, inner);
        }
        inner.detectors = detectors;

        self.update_size_limit(inner)?;
        self.enforce_checkpoints(inner)?;
        Ok(())
    }

    /// Re-validates the stored chain against the configured checkpoint set
    /// and rolls back to the last agreeing checkpoint on mismatch.
    fn enforce_checkpoints(&self, inner: &mut ChainInner) -> Result<(), ChainError> {
        let count = self.block_count.load(Ordering::Relaxed);
        let mut last_valid = 0u32;
        let heights: Vec<u32> = inner.checkpoints.heights().collect();
        for height in heights {
            if count <= height {
                return Ok(());
            }
            let stored = self
                .block_hash_at(inner, height)?
                .ok_or_else(|| StoreError::Backend("height index gap".into()))?;
            let (valid, _) = inner.checkpoints.check_block(height, &stored);
            if valid {
                last_valid = height;
            } else {
                log_error!(
                    "stored block at height {height} contradicts checkpoint, rolling back to {last_valid}"
                );
                self.rollback_to_inner(inner, last_valid)?;
                inner.db.commit()?;
                return Ok(());
            }
        }
        Ok(())
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ChainInner> {
        self.inner.lock().expect("chain lock")
    }

    // ---- ingestion ----------------------------------------------------

    /// Top-level ingestion state machine. Takes the pool session before the
    /// chain lock; callers must not hold either.
    pub fn add_block(
        &self,
        block: &Block,
        pool: &dyn TransactionPool,
    ) -> Result<BlockAddResult, ChainError> {
        let id = block.hash();
        let mut session = pool.session();
        let result = {
            let mut inner = self.lock_inner();
            let inner = &mut *inner;

            if self.have_block_inner(inner, &id)? {
                log_trace!("block {} already exists", hash_to_hex(&id));
                BlockAddResult::AlreadyExists
            } else if block.header.previous_block_hash == self.tail_hash_inner(inner)? {
                match self.push_block_to_main(inner, session.as_mut(), block, &id) {
                    Ok(()) => {
                        self.queues
                            .lock()
                            .expect("queue lock")
                            .send(&BlockchainMessage::NewBlock(id));
                        BlockAddResult::AddedToMain
                    }
                    Err(BlockError::Verification(err)) => BlockAddResult::VerificationFailed(err),
                    Err(BlockError::Storage(err)) => return Err(err.into()),
                }
            } else {
                log_debug!(
                    "handling alternative block {} (prev {})",
                    hash_to_hex(&id),
                    hash_to_hex(&block.header.previous_block_hash)
                );
                match self.handle_alternative(inner, session.as_mut(), block, &id, true) {
                    Ok(result) => result,
                    Err(BlockError::Verification(err)) => BlockAddResult::VerificationFailed(err),
                    Err(BlockError::Storage(err)) => return Err(err.into()),
                }
            }
        };

        if matches!(
            result,
            BlockAddResult::AddedToMain | BlockAddResult::SwitchedToAlt
        ) {
            let observers = self.observers.lock().expect("observer lock").clone();
            for observer in observers {
                observer.blockchain_updated();
            }
        }
        Ok(result)
    }

    fn push_block_to_main(
        &self,
        inner: &mut ChainInner,
        pool: &mut dyn PoolSession,
        block: &Block,
        id: &Hash,
    ) -> Result<(), BlockError> {
        let mut transactions = Vec::with_capacity(block.transaction_hashes.len());
        for hash in &block.transaction_hashes {
            match pool.take(hash) {
                Some((tx, _, _)) => transactions.push(tx),
                None => {
                    log_info!(
                        "block {} references transaction {} missing from the pool",
                        hash_to_hex(id),
                        hash_to_hex(hash)
                    );
                    for tx in transactions {
                        pool.add(tx, true);
                    }
                    return Err(VerificationError::MissingTransaction.into());
                }
            }
        }

        match self.push_block_with_transactions(inner, pool, block, &transactions, id) {
            Ok(()) => Ok(()),
            Err(err) => {
                for tx in transactions {
                    pool.add(tx, true);
                }
                Err(err)
            }
        }
    }

    fn push_block_with_transactions(
        &self,
        inner: &mut ChainInner,
        _pool: &mut dyn PoolSession,
        block: &Block,
        transactions: &[Transaction],
        id: &Hash,
    ) -> Result<(), BlockError> {
        let height = self.block_count.load(Ordering::Relaxed);

        let expected_version =
            expected_major_version_for_height(&self.currency, &inner.detectors, height);
        if block.header.major_version != expected_version {
            log_trace!(
                "block {} has major version {} at height {height}, expected {expected_version}",
                hash_to_hex(id),
                block.header.major_version
            );
            return Err(VerificationError::WrongVersion {
                found: block.header.major_version,
                expected: expected_version,
            }
            .into());
        }

        check_merge_mining_tag_allowed(block)?;

        let tip = self.tip(inner)?;
        let tail_hash = tip
            .as_ref()
            .map(|(hash, _)| *hash)
            .unwrap_or(NULL_HASH);
        if block.header.previous_block_hash != tail_hash {
            log_info!(
                "block {} has wrong previous hash {}, expected {}",
                hash_to_hex(id),
                hash_to_hex(&block.header.previous_block_hash),
                hash_to_hex(&tail_hash)
            );
            return Err(VerificationError::WrongPreviousHash.into());
        }

        let in_checkpoint_zone = inner.checkpoints.is_in_checkpoint_zone(height);

        let difficulty = self.difficulty_for_next_block_inner(inner)?;
        if difficulty == 0 {
            log_error!("difficulty overhead at height {height}");
            return Err(VerificationError::DifficultyOverhead.into());
        }

        if in_checkpoint_zone {
            let (valid, _) = inner.checkpoints.check_block(height, id);
            if !valid {
                log_error!("checkpoint validation failed at height {height}");
                return Err(VerificationError::CheckpointMismatch.into());
            }
        } else {
            self.check_block_timestamp_main(inner, block)?;
            check_proof_of_work(block, difficulty).map_err(|err| {
                log_info!(
                    "block {} has too weak proof of work for difficulty {difficulty}",
                    hash_to_hex(id)
                );
                VerificationError::ProofOfWork(pow_reason(err))
            })?;
        }

        prevalidate_coinbase(block, height, &self.currency)?;

        let miner_tx_hash = block.base_transaction.hash();
        let mut entry = BlockEntry {
            block: block.clone(),
            height,
            block_cumulative_size: 0,
            cumulative_difficulty: 0,
            already_generated_coins: 0,
            transactions: vec![TransactionEntry {
                tx: block.base_transaction.clone(),
                global_output_indexes: Vec::new(),
            }],
        };

        let mut transaction_index = TransactionIndex {
            block: height,
            transaction: 0,
        };
        self.push_transaction(inner, &mut entry, &miner_tx_hash, transaction_index)?;

        let coinbase_size = block.base_transaction.binary_size() as u64;
        let mut cumulative_size = coinbase_size;
        let mut fee_total: u64 = 0;

        for (position, tx) in transactions.iter().enumerate() {
            let tx_hash = block.transaction_hashes[position];

            let output_amount = tx.output_amount();
            let input_amount = tx.input_amount();
            if output_amount > input_amount {
                self.pop_transactions(inner, &entry, &miner_tx_hash);
                return Err(VerificationError::InputOverflow.into());
            }
            let fee = input_amount - output_amount;

            if !in_checkpoint_zone {
                if let Err(err) = self.check_transaction_inputs_inner(inner, tx) {
                    log_info!(
                        "block {} has transaction {} with invalid inputs",
                        hash_to_hex(id),
                        hash_to_hex(&tx_hash)
                    );
                    self.pop_transactions(inner, &entry, &miner_tx_hash);
                    return Err(err);
                }
            }

            entry.transactions.push(TransactionEntry {
                tx: tx.clone(),
                global_output_indexes: Vec::new(),
            });
            transaction_index.transaction += 1;
            if let Err(err) = self.push_transaction(inner, &mut entry, &tx_hash, transaction_index)
            {
                entry.transactions.pop();
                self.pop_transactions(inner, &entry, &miner_tx_hash);
                return Err(err);
            }

            cumulative_size += tx.binary_size() as u64;
            fee_total += fee;
        }

        if let Err(err) =
            check_cumulative_size(&self.currency, cumulative_size, u64::from(height))
        {
            self.pop_transactions(inner, &entry, &miner_tx_hash);
            return Err(err.into());
        }

        let already_generated = tip
            .as_ref()
            .map(|(_, entry)| entry.already_generated_coins)
            .unwrap_or(0);
        let last_sizes =
            self.back_blocks_sizes_inner(inner, self.currency.reward_blocks_window())?;
        let (reward, emission_change) = match validate_coinbase_reward(
            block,
            &self.currency,
            &last_sizes,
            cumulative_size,
            already_generated,
            fee_total,
        ) {
            Ok(values) => values,
            Err(err) => {
                log_info!("block {} has invalid coinbase reward", hash_to_hex(id));
                self.pop_transactions(inner, &entry, &miner_tx_hash);
                return Err(err.into());
            }
        };

        entry.block_cumulative_size = cumulative_size;
        entry.cumulative_difficulty = difficulty
            + tip
                .as_ref()
                .map(|(_, entry)| entry.cumulative_difficulty)
                .unwrap_or(0);
        entry.already_generated_coins = already_generated.saturating_add_signed(emission_change);

        self.store_block_entry(inner, &entry, id)?;
        self.commit_by_cadence(inner, height)?;
        self.block_count.store(height + 1, Ordering::Relaxed);

        self.update_size_limit(inner)?;
        let mut detectors = std::mem::take(&mut inner.detectors);
        for detector in &mut detectors {
            detector.block_pushed(&self.currency, inner);
        }
        inner.detectors = detectors;

        log_debug!(
            "block {} added at height {height}, difficulty {difficulty}, reward {}, fees {}",
            hash_to_hex(id),
            umbrad_consensus::format_amount(reward),
            umbrad_consensus::format_amount(fee_total),
        );
        Ok(())
    }

    /// Writes the block record and the height, timestamp, and generated-tx
    /// projections.
    fn store_block_entry(
        &self,
        inner: &mut ChainInner,
        entry: &BlockEntry,
        id: &Hash,
    ) -> Result<(), StoreError> {
        inner.db.put(block_entry_key(id), encode(entry), true)?;
        inner
            .db
            .put(block_index_key(entry.height), id.to_vec(), true)?;

        let ts_key = timestamp_key(entry.block.header.timestamp);
        let mut stamp_entry: TimestampEntry = match inner.db.get(&ts_key)? {
            Some(bytes) => decode(&bytes)
                .map_err(|_| StoreError::Backend("corrupt timestamp index entry".into()))?,
            None => TimestampEntry::default(),
        };
        stamp_entry.blocks.push((entry.height, *id));
        inner.db.put(ts_key, encode(&stamp_entry), false)?;

        if entry.height > 0 {
            inner.last_generated_tx_number += entry.block.transaction_hashes.len() as u64 + 1;
            inner.db.put(
                generated_transactions_key(entry.height),
                write_varint_sqlite4(inner.last_generated_tx_number),
                true,
            )?;
        }
        Ok(())
    }

    /// Commit every block once synchronized with the network, every
    /// `DB_COMMIT_PERIOD` heights while catching up.
    fn commit_by_cadence(&self, inner: &mut ChainInner, height: u32) -> Result<(), StoreError> {
        let catching_up =
            inner.checkpoints.is_in_checkpoint_zone(height) || !inner.synchronized;
        if catching_up {
            if height != 0 && height % DB_COMMIT_PERIOD == 0 {
                inner.db.commit()?;
                log_info!("blockchain synchronized to height {height}");
            }
        } else {
            inner.db.commit()?;
        }
        Ok(())
    }

    // ---- transaction indexing -----------------------------------------

    fn push_transaction(
        &self,
        inner: &mut ChainInner,
        entry: &mut BlockEntry,
        tx_hash: &Hash,
        index: TransactionIndex,
    ) -> Result<(), BlockError> {
        let t_key = transaction_index_key(tx_hash);
        match inner.db.put(t_key.clone(), index.encode().to_vec(), true) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                log_error!(
                    "duplicate transaction {} pushed to the chain",
                    hash_to_hex(tx_hash)
                );
                return Err(VerificationError::MissingTransaction.into());
            }
            Err(err) => return Err(err.into()),
        }

        let transaction = entry.transactions[index.transaction as usize].tx.clone();

        if !multisignature_inputs_distinct(&transaction) {
            log_error!(
                "transaction {} spends a multisignature output twice",
                hash_to_hex(tx_hash)
            );
            let _ = inner.db.delete(t_key, true);
            return Err(VerificationError::InputMultisignatureInvalid.into());
        }

        let key_images: Vec<KeyImage> = transaction
            .prefix
            .inputs
            .iter()
            .filter_map(|input| match input {
                TransactionInput::Key(input) => Some(input.key_image),
                _ => None,
            })
            .collect();
        for (position, image) in key_images.iter().enumerate() {
            match inner.db.put(
                spent_key_image_key(image),
                write_varint_sqlite4(u64::from(entry.height)),
                true,
            ) {
                Ok(()) => {}
                Err(StoreError::AlreadyExists(_)) => {
                    log_error!(
                        "double spend pushed to the chain in transaction {}",
                        hash_to_hex(tx_hash)
                    );
                    // Batched inserts are undone in reverse before bailing.
                    for undo in key_images[..position].iter().rev() {
                        let _ = inner.db.delete(spent_key_image_key(undo), true);
                    }
                    let _ = inner.db.delete(t_key, true);
                    return Err(VerificationError::InputKeyImageSpent.into());
                }
                Err(err) => return Err(err.into()),
            }
        }

        for input in &transaction.prefix.inputs {
            if let TransactionInput::Multisignature(input) = input {
                let key = multisignature_outputs_key(input.amount);
                let mut outputs: MultisignatureOutputsEntry = match inner.db.get(&key)? {
                    Some(bytes) => decode(&bytes).map_err(|_| {
                        StoreError::Backend("corrupt multisignature index entry".into())
                    })?,
                    None => MultisignatureOutputsEntry::default(),
                };
                match outputs.outputs.get_mut(input.output_index as usize) {
                    Some(usage) => usage.is_used = true,
                    None => {
                        log_error!(
                            "multisignature input references missing output {} of amount {}",
                            input.output_index,
                            input.amount
                        );
                        return Err(VerificationError::InputMultisignatureInvalid.into());
                    }
                }
                inner.db.put(key, encode(&outputs), false)?;
            }
        }

        let mut global_indexes = Vec::with_capacity(transaction.prefix.outputs.len());
        for (position, output) in transaction.prefix.outputs.iter().enumerate() {
            match &output.target {
                OutputTarget::Key(_) => {
                    let key = outputs_key(output.amount);
                    let mut outputs: OutputsEntry = match inner.db.get(&key)? {
                        Some(bytes) => decode(&bytes).map_err(|_| {
                            StoreError::Backend("corrupt outputs index entry".into())
                        })?,
                        None => OutputsEntry::default(),
                    };
                    global_indexes.push(outputs.outputs.len() as u32);
                    outputs.outputs.push((index, position as u16));
                    inner.db.put(key, encode(&outputs), false)?;
                }
                OutputTarget::Multisignature(_) => {
                    let key = multisignature_outputs_key(output.amount);
                    let mut outputs: MultisignatureOutputsEntry = match inner.db.get(&key)? {
                        Some(bytes) => decode(&bytes).map_err(|_| {
                            StoreError::Backend("corrupt multisignature index entry".into())
                        })?,
                        None => MultisignatureOutputsEntry::default(),
                    };
                    global_indexes.push(outputs.outputs.len() as u32);
                    outputs.outputs.push(crate::index::MultisignatureOutputUsage {
                        transaction_index: index,
                        output_index: position as u16,
                        is_used: false,
                    });
                    inner.db.put(key, encode(&outputs), false)?;
                }
            }
        }
        entry.transactions[index.transaction as usize].global_output_indexes = global_indexes;

        if let Some(payment_id) = payment_id_from_extra(&transaction.prefix.extra) {
            let key = payment_id_key(&payment_id);
            let mut ids: PaymentIdEntry = match inner.db.get(&key)? {
                Some(bytes) => decode(&bytes)
                    .map_err(|_| StoreError::Backend("corrupt payment id entry".into()))?,
                None => PaymentIdEntry::default(),
            };
            ids.transaction_hashes.push(*tx_hash);
            inner.db.put(key, encode(&ids), false)?;
        }

        Ok(())
    }

    /// Undoes every index effect of one transaction. Divergence from the
    /// expected tail values signals a corrupted store: logged at ERROR, the
    /// engine continues.
    fn pop_transaction(&self, inner: &mut ChainInner, transaction: &Transaction, tx_hash: &Hash) {
        let index = match inner.db.get(&transaction_index_key(tx_hash)) {
            Ok(Some(bytes)) => match TransactionIndex::decode(&bytes) {
                Some(index) => index,
                None => {
                    log_error!("chain consistency broken: corrupt transaction index entry");
                    return;
                }
            },
            _ => {
                log_error!(
                    "chain consistency broken: no index entry for transaction {}",
                    hash_to_hex(tx_hash)
                );
                return;
            }
        };

        let output_count = transaction.prefix.outputs.len();
        for (reverse_position, output) in transaction.prefix.outputs.iter().rev().enumerate() {
            let position = output_count - 1 - reverse_position;
            match &output.target {
                OutputTarget::Key(_) => {
                    let key = outputs_key(output.amount);
                    let mut outputs: OutputsEntry = match read_record(&inner.db, &key) {
                        Some(entry) => entry,
                        None => {
                            log_error!(
                                "chain consistency broken: no outputs list for amount {}",
                                output.amount
                            );
                            continue;
                        }
                    };
                    let Some((tail_index, tail_position)) = outputs.outputs.last().copied()
                    else {
                        log_error!("chain consistency broken: outputs list empty on pop");
                        continue;
                    };
                    if tail_index != index {
                        log_error!("chain consistency broken: popping wrong transaction index");
                        continue;
                    }
                    if tail_position as usize != position {
                        log_error!("chain consistency broken: popping wrong output position");
                        continue;
                    }
                    outputs.outputs.pop();
                    if outputs.outputs.is_empty() {
                        if inner.db.delete(key, true).is_err() {
                            log_error!("failed to delete drained outputs list");
                        }
                    } else if inner.db.put(key, encode(&outputs), false).is_err() {
                        log_error!("failed to rewrite outputs list");
                    }
                }
                OutputTarget::Multisignature(_) => {
                    let key = multisignature_outputs_key(output.amount);
                    let mut outputs: MultisignatureOutputsEntry =
                        match read_record(&inner.db, &key) {
                            Some(entry) => entry,
                            None => {
                                log_error!(
                                    "chain consistency broken: no multisignature list for amount {}",
                                    output.amount
                                );
                                continue;
                            }
                        };
                    let Some(tail) = outputs.outputs.last().copied() else {
                        log_error!(
                            "chain consistency broken: multisignature list empty on pop"
                        );
                        continue;
                    };
                    if tail.is_used {
                        log_error!("chain consistency broken: removing a used multisignature output");
                        continue;
                    }
                    if tail.transaction_index != index || tail.output_index as usize != position {
                        log_error!("chain consistency broken: popping wrong multisignature output");
                        continue;
                    }
                    outputs.outputs.pop();
                    if outputs.outputs.is_empty() {
                        if inner.db.delete(key, true).is_err() {
                            log_error!("failed to delete drained multisignature list");
                        }
                    } else if inner.db.put(key, encode(&outputs), false).is_err() {
                        log_error!("failed to rewrite multisignature list");
                    }
                }
            }
        }

        for input in &transaction.prefix.inputs {
            match input {
                TransactionInput::Key(input) => {
                    let key = spent_key_image_key(&input.key_image);
                    match inner.db.get(&key) {
                        Ok(Some(_)) => {
                            if inner.db.delete(key, true).is_err() {
                                log_error!("failed to delete spent key image");
                            }
                        }
                        _ => {
                            log_error!("chain consistency broken: spent key image not found");
                        }
                    }
                }
                TransactionInput::Multisignature(input) => {
                    let key = multisignature_outputs_key(input.amount);
                    let mut outputs: MultisignatureOutputsEntry =
                        match read_record(&inner.db, &key) {
                            Some(entry) => entry,
                            None => {
                                log_error!(
                                    "chain consistency broken: no multisignature list for amount {}",
                                    input.amount
                                );
                                continue;
                            }
                        };
                    match outputs.outputs.get_mut(input.output_index as usize) {
                        Some(usage) if usage.is_used => usage.is_used = false,
                        Some(_) => {
                            log_error!(
                                "chain consistency broken: multisignature output not marked used"
                            );
                        }
                        None => {
                            log_error!(
                                "chain consistency broken: multisignature output index out of range"
                            );
                            continue;
                        }
                    }
                    if inner.db.put(key, encode(&outputs), false).is_err() {
                        log_error!("failed to rewrite multisignature list");
                    }
                }
                TransactionInput::Base(_) => {}
            }
        }

        if let Some(payment_id) = payment_id_from_extra(&transaction.prefix.extra) {
            let key = payment_id_key(&payment_id);
            match read_record::<PaymentIdEntry>(&inner.db, &key) {
                Some(mut ids) => {
                    if ids.transaction_hashes.last() == Some(tx_hash) {
                        ids.transaction_hashes.pop();
                    } else {
                        log_error!("chain consistency broken: payment id tail mismatch");
                        ids.transaction_hashes.retain(|hash| hash != tx_hash);
                    }
                    if ids.transaction_hashes.is_empty() {
                        if inner.db.delete(key, true).is_err() {
                            log_error!("failed to delete drained payment id entry");
                        }
                    } else if inner.db.put(key, encode(&ids), false).is_err() {
                        log_error!("failed to rewrite payment id entry");
                    }
                }
                None => log_error!("chain consistency broken: payment id entry missing"),
            }
        }

        if inner.db.delete(transaction_index_key(tx_hash), true).is_err() {
            log_error!(
                "chain consistency broken: could not delete transaction {}",
                hash_to_hex(tx_hash)
            );
        }
    }

    fn pop_transactions(&self, inner: &mut ChainInner, entry: &BlockEntry, miner_tx_hash: &Hash) {
        for position in (1..entry.transactions.len()).rev() {
            self.pop_transaction(
                inner,
                &entry.transactions[position].tx.clone(),
                &entry.block.transaction_hashes[position - 1],
            );
        }
        self.pop_transaction(inner, &entry.block.base_transaction.clone(), miner_tx_hash);
    }

    // ---- pop / rollback ------------------------------------------------

    /// Pops the tip block, re-presenting its transactions to the pool.
    fn pop_block(
        &self,
        inner: &mut ChainInner,
        pool: &mut dyn PoolSession,
    ) -> Result<Block, StoreError> {
        let entry = self.remove_last_block(inner)?;
        for transaction in entry.transactions.iter().skip(1) {
            pool.add(transaction.tx.clone(), true);
        }
        Ok(entry.block)
    }

    fn remove_last_block(&self, inner: &mut ChainInner) -> Result<BlockEntry, StoreError> {
        let Some((hash, entry)) = self.tip(inner)? else {
            log_error!("attempt to pop a block from an empty chain");
            return Err(StoreError::Backend("pop from empty chain".into()));
        };
        log_debug!("removing last block at height {}", entry.height);

        let miner_tx_hash = entry.block.base_transaction.hash();
        self.pop_transactions(inner, &entry, &miner_tx_hash);

        let ts_key = timestamp_key(entry.block.header.timestamp);
        match read_record::<TimestampEntry>(&inner.db, &ts_key) {
            Some(mut stamp_entry) => {
                if stamp_entry.blocks.last() == Some(&(entry.height, hash)) {
                    stamp_entry.blocks.pop();
                } else {
                    log_error!("chain consistency broken: timestamp index tail mismatch");
                    stamp_entry
                        .blocks
                        .retain(|(height, id)| !(*height == entry.height && *id == hash));
                }
                if stamp_entry.blocks.is_empty() {
                    inner.db.delete(ts_key, false)?;
                } else {
                    inner.db.put(ts_key, encode(&stamp_entry), false)?;
                }
            }
            None => log_error!("chain consistency broken: timestamp index entry missing"),
        }

        if entry.height > 0 {
            inner.last_generated_tx_number = inner
                .last_generated_tx_number
                .saturating_sub(entry.block.transaction_hashes.len() as u64 + 1);
            inner
                .db
                .delete(generated_transactions_key(entry.height), false)?;
        }

        inner.db.delete(block_entry_key(&hash), true)?;
        inner.db.delete(block_index_key(entry.height), true)?;
        self.block_count.store(entry.height, Ordering::Relaxed);

        let mut detectors = std::mem::take(&mut inner.detectors);
        for detector in &mut detectors {
            detector.block_popped(inner);
        }
        inner.detectors = detectors;

        Ok(entry)
    }

    fn rollback_to_inner(&self, inner: &mut ChainInner, height: u32) -> Result<(), StoreError> {
        while height + 1 < self.block_count.load(Ordering::Relaxed) {
            self.remove_last_block(inner)?;
        }
        Ok(())
    }

    /// Discards every block above `height` without re-presenting their
    /// transactions to the pool.
    pub fn rollback_to(&self, height: u32) -> Result<(), ChainError> {
        let mut inner = self.lock_inner();
        let inner = &mut *inner;
        self.rollback_to_inner(inner, height)?;
        inner.db.commit()?;
        Ok(())
    }

    // ---- alternative chains and reorganization -------------------------

    fn handle_alternative(
        &self,
        inner: &mut ChainInner,
        pool: &mut dyn PoolSession,
        block: &Block,
        id: &Hash,
        send_alternative_message: bool,
    ) -> Result<BlockAddResult, BlockError> {
        let claimed_height = block
            .height()
            .ok_or(VerificationError::MalformedCoinbaseHeight)?;
        if claimed_height == 0 {
            log_error!(
                "alternative block {} claims height 0",
                hash_to_hex(id)
            );
            return Err(VerificationError::MalformedCoinbaseHeight.into());
        }

        let chain_height = self.block_count.load(Ordering::Relaxed);
        if !inner
            .checkpoints
            .is_alternative_block_allowed(chain_height, claimed_height)
        {
            log_trace!(
                "alternative block {} at height {claimed_height} rejected below checkpoint",
                hash_to_hex(id)
            );
            return Err(VerificationError::AlternativeBranchForbidden.into());
        }

        let expected_version =
            expected_major_version_for_height(&self.currency, &inner.detectors, claimed_height);
        if block.header.major_version != expected_version {
            return Err(VerificationError::WrongVersion {
                found: block.header.major_version,
                expected: expected_version,
            }
            .into());
        }

        // Cumulative size from whatever the pool knows; missing transactions
        // make the figure imprecise, which only biases this early check.
        let mut cumulative_size = block.base_transaction.binary_size() as u64;
        for hash in &block.transaction_hashes {
            match pool.get(hash) {
                Some((_, size, _)) => cumulative_size += size as u64,
                None => log_trace!(
                    "alternative block {} has unknown transaction {}, size imprecise",
                    hash_to_hex(id),
                    hash_to_hex(hash)
                ),
            }
        }
        check_cumulative_size(&self.currency, cumulative_size, u64::from(claimed_height))?;

        let main_prev_height = self.main_chain_height_of(inner, &block.header.previous_block_hash)?;
        let has_alt_prev = inner
            .alternative_chains
            .contains_key(&block.header.previous_block_hash);
        if main_prev_height.is_none() && !has_alt_prev {
            log_info!(
                "block {} recognized as orphaned, prev {}",
                hash_to_hex(id),
                hash_to_hex(&block.header.previous_block_hash)
            );
            return Ok(BlockAddResult::MarkedOrphan);
        }

        // Assemble the branch oldest-first by walking parent pointers
        // through the alternative map.
        let mut branch: Vec<(Hash, BlockEntry)> = Vec::new();
        let mut cursor = block.header.previous_block_hash;
        while let Some(entry) = inner.alternative_chains.get(&cursor) {
            branch.push((cursor, entry.clone()));
            cursor = entry.block.header.previous_block_hash;
        }
        branch.reverse();

        let height;
        let mut timestamps: Vec<u64>;
        if let Some((_, first)) = branch.first() {
            if chain_height <= first.height {
                log_error!("alternative branch starts past the main chain tip");
                return Err(StoreError::Backend("broken alternative branch".into()).into());
            }
            let connect = self
                .block_hash_at(inner, first.height - 1)?
                .ok_or_else(|| StoreError::Backend("height index gap".into()))?;
            if connect != first.block.header.previous_block_hash {
                log_error!("alternative branch does not connect to the main chain");
                return Err(StoreError::Backend("broken alternative branch".into()).into());
            }
            timestamps = branch
                .iter()
                .map(|(_, entry)| entry.block.header.timestamp)
                .collect();
            timestamps = self.complete_timestamps(
                inner,
                block.header.major_version,
                first.height - 1,
                timestamps,
            )?;
            height = branch.last().map(|(_, entry)| entry.height + 1).expect("non-empty");
        } else {
            let prev_height = main_prev_height.expect("checked above");
            timestamps =
                self.complete_timestamps(inner, block.header.major_version, prev_height, Vec::new())?;
            height = prev_height + 1;
        }

        if branch.len() + 1 >= POISSON_CHECK_TRIGGER {
            self.poisson_check(inner, &branch, block)?;
        }

        let (checkpoint_ok, is_checkpoint) = inner.checkpoints.check_block(height, id);
        if !checkpoint_ok {
            log_error!("checkpoint validation failed for alternative block");
            return Err(VerificationError::CheckpointMismatch.into());
        }

        check_merge_mining_tag_allowed(block)?;
        check_block_timestamp(&timestamps, block, &self.currency, adjusted_time())?;

        let difficulty = self.difficulty_for_alternative(inner, &branch, height)?;
        if difficulty == 0 {
            log_error!("difficulty overhead on alternative chain");
            return Err(VerificationError::DifficultyOverhead.into());
        }
        // Proof of work is always checked for alternative blocks, checkpoint
        // zone or not.
        check_proof_of_work(block, difficulty)
            .map_err(|err| VerificationError::ProofOfWork(pow_reason(err)))?;

        prevalidate_coinbase(block, height, &self.currency)?;

        let parent_cumulative = match branch.last() {
            Some((_, entry)) => entry.cumulative_difficulty,
            None => {
                let prev_height = main_prev_height.expect("checked above");
                self.block_entry_at(inner, prev_height)?.cumulative_difficulty
            }
        };

        let entry = BlockEntry {
            block: block.clone(),
            height,
            block_cumulative_size: cumulative_size,
            cumulative_difficulty: parent_cumulative + difficulty,
            already_generated_coins: 0,
            transactions: Vec::new(),
        };
        inner.alternative_chains.insert(*id, entry.clone());

        let tip_cumulative = self
            .tip(inner)?
            .map(|(_, entry)| entry.cumulative_difficulty)
            .unwrap_or(0);

        let mut promoted: Vec<Hash> = branch.iter().map(|(hash, _)| *hash).collect();
        promoted.push(*id);

        if is_checkpoint {
            log_info!(
                "###### REORGANIZE forced by checkpoint at height {height}, branch length {}",
                promoted.len()
            );
            self.switch_to_alternative(inner, pool, promoted, true)?;
            Ok(BlockAddResult::SwitchedToAlt)
        } else if entry.cumulative_difficulty > tip_cumulative {
            log_info!(
                "###### REORGANIZE at height {}, branch difficulty {} beats main {}",
                branch.first().map(|(_, e)| e.height).unwrap_or(height),
                entry.cumulative_difficulty,
                tip_cumulative
            );
            self.switch_to_alternative(inner, pool, promoted, false)?;
            Ok(BlockAddResult::SwitchedToAlt)
        } else {
            log_info!(
                "block {} added as alternative at height {height}, difficulty {difficulty}",
                hash_to_hex(id)
            );
            if send_alternative_message {
                self.queues
                    .lock()
                    .expect("queue lock")
                    .send(&BlockchainMessage::NewAlternativeBlock(*id));
            }
            Ok(BlockAddResult::AddedAsAlternative)
        }
    }

    /// Timestamp plausibility for long reorganizations: block arrival is
    /// Poisson; a branch claiming far more blocks than the elapsed time
    /// supports is rejected.
    fn poisson_check(
        &self,
        inner: &ChainInner,
        branch: &[(Hash, BlockEntry)],
        block: &Block,
    ) -> Result<(), BlockError> {
        let branch_length = branch.len() as u64 + 1;
        let mut high_timestamp = block.header.timestamp;
        for (_, entry) in branch {
            high_timestamp = high_timestamp.max(entry.block.header.timestamp);
        }

        let future_limit = self
            .currency
            .block_future_time_limit(block.header.major_version);
        if high_timestamp > adjusted_time() + future_limit {
            log_error!(
                "alternative chain tip timestamp {high_timestamp} fails the future-time check"
            );
            return Err(VerificationError::PoissonCheckFailed.into());
        }

        log_warn!("Poisson check triggered by reorganization size {branch_length}");

        let mut low_block = match branch.first() {
            Some((_, entry)) => entry.block.header.previous_block_hash,
            None => block.header.previous_block_hash,
        };
        let mut failed_checks = 0u64;
        let mut performed = 0u64;
        for depth in 1..=POISSON_CHECK_DEPTH as u64 {
            if low_block == NULL_HASH {
                break;
            }
            let Some(entry) = self.block_entry_by_hash_inner(inner, &low_block)? else {
                break;
            };
            performed = depth;
            let low_timestamp = entry.block.header.timestamp;
            low_block = entry.block.header.previous_block_hash;

            if low_timestamp >= high_timestamp {
                log_info!("Poisson check at depth {depth} skipped: non-increasing timestamps");
                failed_checks += 1;
                continue;
            }

            let lambda = (high_timestamp - low_timestamp) as f64 / DIFFICULTY_TARGET as f64;
            if poisson_log_p_tail(lambda, branch_length + depth) < POISSON_LOG_P_REJECT {
                log_info!(
                    "Poisson check at depth {depth} failed: dt {} for {} blocks",
                    high_timestamp - low_timestamp,
                    branch_length + depth
                );
                failed_checks += 1;
            }
        }

        log_info!("Poisson check result: {failed_checks} fails out of {performed}");
        if failed_checks > performed / 2 {
            log_error!("rejecting alternative chain: failed the Poisson check");
            return Err(VerificationError::PoissonCheckFailed.into());
        }
        Ok(())
    }

    /// Difficulty for the next block of an alternative branch, splicing main
    /// chain history below the split point when the branch alone is shorter
    /// than the difficulty window.
    fn difficulty_for_alternative(
        &self,
        inner: &ChainInner,
        branch: &[(Hash, BlockEntry)],
        candidate_height: u32,
    ) -> Result<u64, BlockError> {
        let chain_height = self.block_count.load(Ordering::Relaxed);
        let version =
            expected_major_version_for_height(&self.currency, &inner.detectors, chain_height);
        let window = self.currency.difficulty_blocks_count(version);

        let mut timestamps = Vec::with_capacity(window);
        let mut cumulative_difficulties = Vec::with_capacity(window);

        if branch.len() < window {
            let stop = branch
                .first()
                .map(|(_, entry)| entry.height)
                .unwrap_or(candidate_height);
            let main_count = (window - branch.len()).min(stop as usize);
            let mut start = stop as usize - main_count;
            if start == 0 {
                start = 1;
            }
            for height in start..stop as usize {
                let entry = self.block_entry_at(inner, height as u32)?;
                timestamps.push(entry.block.header.timestamp);
                cumulative_difficulties.push(entry.cumulative_difficulty);
            }
            for (_, entry) in branch {
                timestamps.push(entry.block.header.timestamp);
                cumulative_difficulties.push(entry.cumulative_difficulty);
            }
        } else {
            for (_, entry) in &branch[branch.len() - window..] {
                timestamps.push(entry.block.header.timestamp);
                cumulative_difficulties.push(entry.cumulative_difficulty);
            }
        }

        Ok(next_difficulty(version, &timestamps, &cumulative_difficulties))
    }

    /// Rolls the main chain back to the split height and replays the
    /// alternative branch. On a mid-replay failure the original chain is
    /// restored; failure of that restoration is unrecoverable.
    fn switch_to_alternative(
        &self,
        inner: &mut ChainInner,
        pool: &mut dyn PoolSession,
        branch_hashes: Vec<Hash>,
        discard_disconnected: bool,
    ) -> Result<(), BlockError> {
        let (split_height, common_ancestor) = {
            let first = branch_hashes
                .first()
                .and_then(|hash| inner.alternative_chains.get(hash))
                .ok_or_else(|| StoreError::Backend("empty alternative branch".into()))?;
            (first.height, first.block.header.previous_block_hash)
        };

        if self.block_count.load(Ordering::Relaxed) <= split_height {
            log_error!("chain shorter than the reorganization split height");
            return Err(StoreError::Backend("bad split height".into()).into());
        }

        let mut disconnected: Vec<Block> = Vec::new();
        while self.block_count.load(Ordering::Relaxed) > split_height {
            let block = self.pop_block(inner, pool)?;
            disconnected.insert(0, block);
        }

        for (position, hash) in branch_hashes.iter().enumerate() {
            let Some(entry) = inner.alternative_chains.get(hash).cloned() else {
                log_error!("alternative branch entry vanished during reorganization");
                self.rollback_switching(inner, pool, &disconnected, split_height);
                return Err(StoreError::Backend("broken alternative branch".into()).into());
            };
            if let Err(err) = self.push_block_to_main(inner, pool, &entry.block, hash) {
                log_info!("failed to switch to alternative blockchain");
                self.rollback_switching(inner, pool, &disconnected, split_height);
                for stale in &branch_hashes[position..] {
                    inner.alternative_chains.remove(stale);
                }
                return Err(err);
            }
        }

        if !discard_disconnected {
            for block in &disconnected {
                let id = block.hash();
                if let Err(err) = self.handle_alternative(inner, pool, block, &id, false) {
                    let reason = match err {
                        BlockError::Verification(err) => err.to_string(),
                        BlockError::Storage(err) => err.to_string(),
                    };
                    log_warn!("failed to keep ex-main-chain block as alternative: {reason}");
                    break;
                }
            }
        }

        let mut from_common_root = Vec::with_capacity(branch_hashes.len() + 1);
        from_common_root.push(common_ancestor);
        for hash in &branch_hashes {
            inner.alternative_chains.remove(hash);
            from_common_root.push(*hash);
        }

        inner.db.commit()?;
        self.queues
            .lock()
            .expect("queue lock")
            .send(&BlockchainMessage::ChainSwitch(from_common_root));
        log_info!(
            "REORGANIZE SUCCESS at height {split_height}, new chain length {}",
            self.block_count.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// Restores the previously disconnected main chain after a failed branch
    /// replay. A failure here means both chains are unusable: abort.
    fn rollback_switching(
        &self,
        inner: &mut ChainInner,
        pool: &mut dyn PoolSession,
        original: &[Block],
        rollback_height: u32,
    ) {
        let unwind = (|| -> Result<(), BlockError> {
            while self.block_count.load(Ordering::Relaxed) > rollback_height {
                self.pop_block(inner, pool)?;
            }
            for block in original {
                let id = block.hash();
                self.push_block_to_main(inner, pool, block, &id)?;
            }
            Ok(())
        })();

        if unwind.is_err() {
            log_error!(
                "PANIC: failed to re-add original chain blocks during reorganization rollback"
            );
            std::process::abort();
        }
        log_info!("reorganization rollback succeeded");
    }

    // ---- input validation ----------------------------------------------

    /// Full stateful input validation. Returns the greatest main-chain
    /// height referenced by the transaction's rings.
    fn check_transaction_inputs_inner(
        &self,
        inner: &ChainInner,
        transaction: &Transaction,
    ) -> Result<u32, BlockError> {
        let prefix_hash = transaction.prefix_hash();
        let current_height = self.block_count.load(Ordering::Relaxed);
        let last_timestamp = self
            .tip(inner)?
            .map(|(_, entry)| entry.block.header.timestamp)
            .unwrap_or(0);
        let in_checkpoint_zone = inner.checkpoints.is_in_checkpoint_zone(current_height);

        let mut max_referenced_height = 0u32;
        for (input_position, input) in transaction.prefix.inputs.iter().enumerate() {
            match input {
                TransactionInput::Base(_) => {
                    return Err(VerificationError::InputUnexpectedType.into());
                }
                TransactionInput::Key(key_input) => {
                    let height = self.check_key_input(
                        inner,
                        key_input,
                        &prefix_hash,
                        transaction.signatures.get(input_position),
                        current_height,
                        last_timestamp,
                        in_checkpoint_zone,
                    )?;
                    max_referenced_height = max_referenced_height.max(height);
                }
                TransactionInput::Multisignature(multisig_input) => {
                    let height = self.check_multisignature_input(
                        inner,
                        multisig_input,
                        &prefix_hash,
                        transaction.signatures.get(input_position),
                        current_height,
                        last_timestamp,
                        in_checkpoint_zone,
                    )?;
                    max_referenced_height = max_referenced_height.max(height);
                }
            }
        }
        Ok(max_referenced_height)
    }

    #[allow(clippy::too_many_arguments)]
    fn check_key_input(
        &self,
        inner: &ChainInner,
        input: &KeyInput,
        prefix_hash: &Hash,
        signatures: Option<&Vec<umbrad_crypto::Signature>>,
        current_height: u32,
        last_timestamp: u64,
        in_checkpoint_zone: bool,
    ) -> Result<u32, BlockError> {
        if input.output_indexes.is_empty() {
            return Err(VerificationError::InputEmptyRing.into());
        }
        if !key_image_in_domain(&input.key_image) {
            log_error!("transaction uses a key image outside the valid domain");
            return Err(VerificationError::InputKeyImageDomain.into());
        }
        if inner.db.get(&spent_key_image_key(&input.key_image))?.is_some() {
            return Err(VerificationError::InputKeyImageSpent.into());
        }

        let absolute = relative_output_offsets_to_absolute(&input.output_indexes)
            .ok_or(VerificationError::InputInvalidRingMember)?;
        let outputs: OutputsEntry = match inner.db.get(&outputs_key(input.amount))? {
            Some(bytes) => decode(&bytes)
                .map_err(|_| StoreError::Backend("corrupt outputs index entry".into()))?,
            None => {
                log_info!("no outputs recorded for ring amount {}", input.amount);
                return Err(VerificationError::InputInvalidRingMember.into());
            }
        };

        let mut ring = Vec::with_capacity(absolute.len());
        let mut max_height = 0u32;
        for offset in &absolute {
            let Some((tx_index, output_position)) = outputs.outputs.get(*offset as usize) else {
                log_info!(
                    "ring offset {} out of range for amount {}",
                    offset,
                    input.amount
                );
                return Err(VerificationError::InputInvalidRingMember.into());
            };
            let referenced = self.transaction_by_index(inner, *tx_index)?;
            if !is_spend_time_unlocked(
                &self.currency,
                referenced.tx.prefix.unlock_time,
                current_height,
                last_timestamp,
            ) {
                return Err(VerificationError::InputLocked.into());
            }
            let output = referenced
                .tx
                .prefix
                .outputs
                .get(*output_position as usize)
                .ok_or_else(|| StoreError::Backend("outputs index out of range".into()))?;
            match &output.target {
                OutputTarget::Key(target) => ring.push(target.key),
                OutputTarget::Multisignature(_) => {
                    return Err(VerificationError::InputInvalidRingMember.into());
                }
            }
            max_height = max_height.max(tx_index.block);
        }

        let signatures = signatures.ok_or(VerificationError::InputSignatureMismatch)?;
        if signatures.len() != ring.len() {
            log_error!(
                "signature count {} does not match ring size {}",
                signatures.len(),
                ring.len()
            );
            return Err(VerificationError::InputSignatureMismatch.into());
        }
        // Checkpoints vouch for everything beneath them.
        if !in_checkpoint_zone
            && !check_ring_signature(prefix_hash, &input.key_image, &ring, signatures)
        {
            log_error!("invalid ring signature");
            return Err(VerificationError::InputRingSignatureInvalid.into());
        }
        Ok(max_height)
    }

    #[allow(clippy::too_many_arguments)]
    fn check_multisignature_input(
        &self,
        inner: &ChainInner,
        input: &MultisignatureInput,
        prefix_hash: &Hash,
        signatures: Option<&Vec<umbrad_crypto::Signature>>,
        current_height: u32,
        last_timestamp: u64,
        in_checkpoint_zone: bool,
    ) -> Result<u32, BlockError> {
        let outputs: MultisignatureOutputsEntry =
            match inner.db.get(&multisignature_outputs_key(input.amount))? {
                Some(bytes) => decode(&bytes)
                    .map_err(|_| StoreError::Backend("corrupt multisignature index entry".into()))?,
                None => {
                    log_debug!(
                        "multisignature input with unknown amount {}",
                        input.amount
                    );
                    return Err(VerificationError::InputMultisignatureInvalid.into());
                }
            };
        let Some(usage) = outputs.outputs.get(input.output_index as usize) else {
            return Err(VerificationError::InputMultisignatureInvalid.into());
        };
        if usage.is_used {
            return Err(VerificationError::InputMultisignatureInvalid.into());
        }

        let referenced = self.transaction_by_index(inner, usage.transaction_index)?;
        if !is_spend_time_unlocked(
            &self.currency,
            referenced.tx.prefix.unlock_time,
            current_height,
            last_timestamp,
        ) {
            return Err(VerificationError::InputLocked.into());
        }
        let output = referenced
            .tx
            .prefix
            .outputs
            .get(usage.output_index as usize)
            .ok_or_else(|| StoreError::Backend("multisignature index out of range".into()))?;
        let OutputTarget::Multisignature(target) = &output.target else {
            return Err(VerificationError::InputMultisignatureInvalid.into());
        };
        if input.signature_count != target.required_signature_count {
            return Err(VerificationError::InputMultisignatureInvalid.into());
        }

        let signatures = signatures.ok_or(VerificationError::InputSignatureMismatch)?;
        if signatures.len() != input.signature_count as usize {
            return Err(VerificationError::InputSignatureMismatch.into());
        }
        if !in_checkpoint_zone {
            // Each signature must match a fresh key, scanned in order.
            let mut signature_iter = signatures.iter();
            let mut current = signature_iter.next();
            for key in &target.keys {
                let Some(signature) = current else {
                    break;
                };
                if check_single_signature(prefix_hash, key, signature) {
                    current = signature_iter.next();
                }
            }
            if current.is_some() {
                return Err(VerificationError::InputMultisignatureInvalid.into());
            }
        }
        Ok(usage.transaction_index.block)
    }

    // ---- difficulty and timestamps --------------------------------------

    fn difficulty_for_next_block_inner(&self, inner: &ChainInner) -> Result<u64, BlockError> {
        let count = self.block_count.load(Ordering::Relaxed);
        if count == 0 {
            return Ok(1);
        }
        let version = expected_major_version_for_height(&self.currency, &inner.detectors, count);
        let window = self.currency.difficulty_blocks_count(version) as u32;
        let start = count.saturating_sub(window);

        let mut timestamps = Vec::with_capacity(window as usize);
        let mut cumulative_difficulties = Vec::with_capacity(window as usize);
        for height in start..count {
            let entry = self.block_entry_at(inner, height)?;
            timestamps.push(entry.block.header.timestamp);
            cumulative_difficulties.push(entry.cumulative_difficulty);
        }
        Ok(next_difficulty(version, &timestamps, &cumulative_difficulties))
    }

    fn check_block_timestamp_main(
        &self,
        inner: &ChainInner,
        block: &Block,
    ) -> Result<(), BlockError> {
        let count = self.block_count.load(Ordering::Relaxed);
        let timestamps = if count == 0 {
            Vec::new()
        } else {
            self.complete_timestamps(inner, block.header.major_version, count - 1, Vec::new())?
        };
        check_block_timestamp(&timestamps, block, &self.currency, adjusted_time())?;
        Ok(())
    }

    /// Prepends main-chain timestamps ending at `top_height` until the window
    /// for the version is filled. `timestamps` arrive oldest-first and stay
    /// that way.
    fn complete_timestamps(
        &self,
        inner: &ChainInner,
        major_version: u8,
        top_height: u32,
        timestamps: Vec<u64>,
    ) -> Result<Vec<u64>, BlockError> {
        let window = self.currency.timestamp_check_window(major_version);
        if timestamps.len() >= window {
            return Ok(timestamps);
        }
        let needed = window - timestamps.len();
        let start = (u64::from(top_height) + 1).saturating_sub(needed as u64) as u32;

        let mut completed = Vec::with_capacity(window);
        for height in start..=top_height {
            let entry = self.block_entry_at(inner, height)?;
            completed.push(entry.block.header.timestamp);
        }
        completed.extend(timestamps);
        Ok(completed)
    }

    fn update_size_limit(&self, inner: &mut ChainInner) -> Result<(), StoreError> {
        let count = self.block_count.load(Ordering::Relaxed);
        let version = expected_major_version_for_height(&self.currency, &inner.detectors, count);
        let full_reward_zone = self.currency.full_reward_zone(version) as u64;

        let sizes = match self.back_blocks_sizes_inner(inner, self.currency.reward_blocks_window())
        {
            Ok(sizes) => sizes,
            Err(err) => {
                return Err(match err {
                    BlockError::Storage(err) => err,
                    BlockError::Verification(_) => {
                        StoreError::Backend("unexpected validation error".into())
                    }
                })
            }
        };
        let median = median_value(&sizes).max(full_reward_zone);
        inner.current_cumulative_size_limit = median * 2;
        Ok(())
    }

    fn back_blocks_sizes_inner(
        &self,
        inner: &ChainInner,
        count: usize,
    ) -> Result<Vec<u64>, BlockError> {
        let chain_count = self.block_count.load(Ordering::Relaxed);
        let take = (count as u32).min(chain_count);
        let start = chain_count - take;
        let mut sizes = Vec::with_capacity(take as usize);
        for height in start..chain_count {
            let entry = self.block_entry_at(inner, height)?;
            sizes.push(entry.block_cumulative_size);
        }
        Ok(sizes)
    }

    // ---- chain reads ----------------------------------------------------

    fn tip(&self, inner: &ChainInner) -> Result<Option<(Hash, BlockEntry)>, StoreError> {
        let Some((_, value)) = inner.db.last_in_prefix(BLOCK_INDEX_PREFIX, None)? else {
            return Ok(None);
        };
        let hash = hash_from_value(&value)
            .ok_or_else(|| StoreError::Backend("corrupt height index value".into()))?;
        let entry = self
            .block_entry_by_hash_inner(inner, &hash)?
            .ok_or_else(|| StoreError::Backend("dangling height index entry".into()))?;
        Ok(Some((hash, entry)))
    }

    fn tail_hash_inner(&self, inner: &ChainInner) -> Result<Hash, StoreError> {
        Ok(match inner.db.last_in_prefix(BLOCK_INDEX_PREFIX, None)? {
            Some((_, value)) => hash_from_value(&value)
                .ok_or_else(|| StoreError::Backend("corrupt height index value".into()))?,
            None => NULL_HASH,
        })
    }

    fn block_hash_at(&self, inner: &ChainInner, height: u32) -> Result<Option<Hash>, StoreError> {
        Ok(inner
            .db
            .get(&block_index_key(height))?
            .and_then(|value| hash_from_value(&value)))
    }

    fn block_entry_by_hash_inner(
        &self,
        inner: &ChainInner,
        hash: &Hash,
    ) -> Result<Option<BlockEntry>, StoreError> {
        match inner.db.get(&block_entry_key(hash))? {
            Some(bytes) => Ok(Some(decode(&bytes).map_err(|_| {
                StoreError::Backend("corrupt block entry".into())
            })?)),
            None => Ok(None),
        }
    }

    fn block_entry_at(&self, inner: &ChainInner, height: u32) -> Result<BlockEntry, StoreError> {
        let hash = self
            .block_hash_at(inner, height)?
            .ok_or_else(|| StoreError::Backend("height index gap".into()))?;
        self.block_entry_by_hash_inner(inner, &hash)?
            .ok_or_else(|| StoreError::Backend("dangling height index entry".into()))
    }

    fn main_chain_height_of(
        &self,
        inner: &ChainInner,
        hash: &Hash,
    ) -> Result<Option<u32>, StoreError> {
        Ok(self
            .block_entry_by_hash_inner(inner, hash)?
            .map(|entry| entry.height))
    }

    fn have_block_inner(&self, inner: &ChainInner, hash: &Hash) -> Result<bool, StoreError> {
        if inner.alternative_chains.contains_key(hash) {
            return Ok(true);
        }
        Ok(inner.db.get(&block_entry_key(hash))?.is_some())
    }

    fn transaction_by_index(
        &self,
        inner: &ChainInner,
        index: TransactionIndex,
    ) -> Result<TransactionEntry, StoreError> {
        let entry = self.block_entry_at(inner, index.block)?;
        entry
            .transactions
            .get(index.transaction as usize)
            .cloned()
            .ok_or_else(|| StoreError::Backend("transaction index out of range".into()))
    }

    // ---- public API -----------------------------------------------------

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    /// Number of blocks on the main chain, genesis included. Lock-free.
    pub fn block_count(&self) -> u32 {
        self.block_count.load(Ordering::Relaxed)
    }

    pub fn tip_height(&self) -> u32 {
        self.block_count().saturating_sub(1)
    }

    pub fn tail_hash(&self) -> Result<Hash, ChainError> {
        let inner = self.lock_inner();
        Ok(self.tail_hash_inner(&inner)?)
    }

    pub fn have_block(&self, hash: &Hash) -> Result<bool, ChainError> {
        let inner = self.lock_inner();
        Ok(self.have_block_inner(&inner, hash)?)
    }

    pub fn is_block_in_main_chain(&self, hash: &Hash) -> Result<bool, ChainError> {
        let inner = self.lock_inner();
        Ok(self.block_entry_by_hash_inner(&inner, hash)?.is_some())
    }

    pub fn have_transaction(&self, hash: &Hash) -> Result<bool, ChainError> {
        let inner = self.lock_inner();
        Ok(inner.db.get(&transaction_index_key(hash))?.is_some())
    }

    pub fn have_spent_key_image(&self, image: &KeyImage) -> Result<bool, ChainError> {
        let inner = self.lock_inner();
        Ok(inner.db.get(&spent_key_image_key(image))?.is_some())
    }

    /// Full input validation against the current chain view, for pool
    /// admission. The outer error is storage, the inner the consensus
    /// verdict with the maximum referenced main-chain height on success.
    pub fn validate_transaction_inputs(
        &self,
        transaction: &Transaction,
    ) -> Result<Result<u32, VerificationError>, ChainError> {
        let inner = self.lock_inner();
        match self.check_transaction_inputs_inner(&inner, transaction) {
            Ok(height) => Ok(Ok(height)),
            Err(BlockError::Verification(err)) => Ok(Err(err)),
            Err(BlockError::Storage(err)) => Err(err.into()),
        }
    }

    /// True when any key input of the transaction is already spent on the
    /// main chain. Used by the pool to drop conflicting candidates.
    pub fn have_spent_key_images(&self, transaction: &Transaction) -> Result<bool, ChainError> {
        let inner = self.lock_inner();
        for input in &transaction.prefix.inputs {
            if let TransactionInput::Key(input) = input {
                if inner.db.get(&spent_key_image_key(&input.key_image))?.is_some() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        let inner = self.lock_inner();
        if let Some(entry) = self.block_entry_by_hash_inner(&inner, hash)? {
            return Ok(Some(entry.block));
        }
        Ok(inner
            .alternative_chains
            .get(hash)
            .map(|entry| entry.block.clone()))
    }

    pub fn block_entry_by_height(&self, height: u32) -> Result<Option<BlockEntry>, ChainError> {
        let inner = self.lock_inner();
        if height >= self.block_count() {
            return Ok(None);
        }
        Ok(Some(self.block_entry_at(&inner, height)?))
    }

    pub fn block_by_height(&self, height: u32) -> Result<Option<Block>, ChainError> {
        Ok(self.block_entry_by_height(height)?.map(|entry| entry.block))
    }

    pub fn block_id_by_height(&self, height: u32) -> Result<Option<Hash>, ChainError> {
        let inner = self.lock_inner();
        Ok(self.block_hash_at(&inner, height)?)
    }

    pub fn block_height_by_hash(&self, hash: &Hash) -> Result<Option<u32>, ChainError> {
        let inner = self.lock_inner();
        Ok(self.main_chain_height_of(&inner, hash)?)
    }

    pub fn block_difficulty(&self, height: u32) -> Result<Option<u64>, ChainError> {
        let inner = self.lock_inner();
        if height >= self.block_count() {
            return Ok(None);
        }
        if height == 0 {
            return Ok(Some(1));
        }
        let entry = self.block_entry_at(&inner, height)?;
        let parent = self.block_entry_at(&inner, height - 1)?;
        Ok(Some(
            entry.cumulative_difficulty - parent.cumulative_difficulty,
        ))
    }

    pub fn block_cumulative_difficulty(&self, height: u32) -> Result<Option<u64>, ChainError> {
        let inner = self.lock_inner();
        if height >= self.block_count() {
            return Ok(None);
        }
        Ok(Some(
            self.block_entry_at(&inner, height)?.cumulative_difficulty,
        ))
    }

    /// Average difficulty of the `window` blocks ending at `height`.
    pub fn avg_difficulty(&self, height: u32, window: u32) -> Result<u64, ChainError> {
        let inner = self.lock_inner();
        let height = height.min(self.tip_height());
        if height == 0 || window == 0 {
            return Ok(1);
        }
        let start = height.saturating_sub(window);
        let top = self.block_entry_at(&inner, height)?.cumulative_difficulty;
        let bottom = self.block_entry_at(&inner, start)?.cumulative_difficulty;
        let span = (height - start) as u64;
        Ok(((top - bottom) / span.max(1)).max(1))
    }

    pub fn next_block_difficulty(&self) -> Result<u64, ChainError> {
        let inner = self.lock_inner();
        match self.difficulty_for_next_block_inner(&inner) {
            Ok(difficulty) => Ok(difficulty),
            Err(BlockError::Storage(err)) => Err(err.into()),
            Err(BlockError::Verification(_)) => Ok(0),
        }
    }

    pub fn block_timestamp(&self, height: u32) -> Result<Option<u64>, ChainError> {
        let inner = self.lock_inner();
        if height >= self.block_count() {
            return Ok(None);
        }
        Ok(Some(
            self.block_entry_at(&inner, height)?.block.header.timestamp,
        ))
    }

    pub fn coins_in_circulation(&self) -> Result<u64, ChainError> {
        let inner = self.lock_inner();
        Ok(self
            .tip(&inner)?
            .map(|(_, entry)| entry.already_generated_coins)
            .unwrap_or(0))
    }

    pub fn coins_in_circulation_at(&self, height: u32) -> Result<Option<u64>, ChainError> {
        let inner = self.lock_inner();
        if height >= self.block_count() {
            return Ok(None);
        }
        Ok(Some(
            self.block_entry_at(&inner, height)?.already_generated_coins,
        ))
    }

    /// Cumulative count of transactions up to and including `height`.
    pub fn generated_transactions_count(&self, height: u32) -> Result<Option<u64>, ChainError> {
        let inner = self.lock_inner();
        if height >= self.block_count() {
            return Ok(None);
        }
        if height == 0 {
            return Ok(Some(1));
        }
        match inner.db.get(&generated_transactions_key(height))? {
            Some(value) => Ok(read_varint_sqlite4(&value).map(|(count, _)| count)),
            None => Ok(None),
        }
    }

    pub fn total_transactions(&self) -> Result<u64, ChainError> {
        self.generated_transactions_count(self.tip_height())
            .map(|count| count.unwrap_or(0))
    }

    pub fn current_cumulative_size_limit(&self) -> u64 {
        self.lock_inner().current_cumulative_size_limit
    }

    /// Cumulative sizes of the last `count` blocks, oldest first.
    pub fn last_blocks_sizes(&self, count: usize) -> Result<Vec<u64>, ChainError> {
        let inner = self.lock_inner();
        match self.back_blocks_sizes_inner(&inner, count) {
            Ok(sizes) => Ok(sizes),
            Err(BlockError::Storage(err)) => Err(err.into()),
            Err(BlockError::Verification(_)) => Ok(Vec::new()),
        }
    }

    /// Forces any buffered writes to the backend, regardless of cadence.
    pub fn flush(&self) -> Result<(), ChainError> {
        let mut inner = self.lock_inner();
        inner.db.commit()?;
        Ok(())
    }

    /// Expected major version of the next block.
    pub fn next_block_major_version(&self) -> u8 {
        let inner = self.lock_inner();
        expected_major_version_for_height(&self.currency, &inner.detectors, self.block_count())
    }

    pub fn is_in_checkpoint_zone(&self, height: u32) -> bool {
        self.lock_inner().checkpoints.is_in_checkpoint_zone(height)
    }

    /// Installs a checkpoint at runtime. If the stored main chain already
    /// covers the height with a different block, everything from that height
    /// up is rolled back so the vouched branch can be adopted.
    pub fn add_checkpoint(&self, height: u32, hash: Hash) -> Result<bool, ChainError> {
        let mut inner = self.lock_inner();
        let inner = &mut *inner;
        if !inner.checkpoints.add_checkpoint(height, hash) {
            return Ok(false);
        }
        if height == 0 || height >= self.block_count.load(Ordering::Relaxed) {
            return Ok(true);
        }
        let stored = self
            .block_hash_at(inner, height)?
            .ok_or_else(|| StoreError::Backend("height index gap".into()))?;
        if stored != hash {
            log_error!(
                "stored block at height {height} contradicts a new checkpoint, rolling back"
            );
            self.rollback_to_inner(inner, height - 1)?;
            inner.db.commit()?;
        }
        Ok(true)
    }

    /// Flips the sync flag: from now on every block commits individually.
    pub fn on_synchronized(&self) -> Result<(), ChainError> {
        let mut inner = self.lock_inner();
        inner.synchronized = true;
        inner.db.commit()?;
        Ok(())
    }

    pub fn transaction_by_hash(&self, hash: &Hash) -> Result<Option<Transaction>, ChainError> {
        let inner = self.lock_inner();
        let Some(index) = self.transaction_index_of(&inner, hash)? else {
            return Ok(None);
        };
        Ok(Some(self.transaction_by_index(&inner, index)?.tx))
    }

    pub fn transaction_index(
        &self,
        hash: &Hash,
    ) -> Result<Option<TransactionIndex>, ChainError> {
        let inner = self.lock_inner();
        self.transaction_index_of(&inner, hash).map_err(Into::into)
    }

    fn transaction_index_of(
        &self,
        inner: &ChainInner,
        hash: &Hash,
    ) -> Result<Option<TransactionIndex>, StoreError> {
        Ok(inner
            .db
            .get(&transaction_index_key(hash))?
            .and_then(|bytes| TransactionIndex::decode(&bytes)))
    }

    /// Block hash and height containing a confirmed transaction.
    pub fn block_containing_transaction(
        &self,
        hash: &Hash,
    ) -> Result<Option<(Hash, u32)>, ChainError> {
        let inner = self.lock_inner();
        let Some(index) = self.transaction_index_of(&inner, hash)? else {
            return Ok(None);
        };
        let block_hash = self
            .block_hash_at(&inner, index.block)?
            .ok_or_else(|| StoreError::Backend("height index gap".into()))?;
        Ok(Some((block_hash, index.block)))
    }

    pub fn transaction_output_global_indexes(
        &self,
        hash: &Hash,
    ) -> Result<Option<Vec<u32>>, ChainError> {
        let inner = self.lock_inner();
        let Some(index) = self.transaction_index_of(&inner, hash)? else {
            return Ok(None);
        };
        Ok(Some(
            self.transaction_by_index(&inner, index)?.global_output_indexes,
        ))
    }

    /// Multisignature output by `(amount, global index)`, as referenced by
    /// wallet-signed deposits.
    pub fn multisignature_output_by_global_index(
        &self,
        amount: u64,
        global_index: u32,
    ) -> Result<Option<(Transaction, u16)>, ChainError> {
        let inner = self.lock_inner();
        let outputs: MultisignatureOutputsEntry =
            match inner.db.get(&multisignature_outputs_key(amount))? {
                Some(bytes) => decode(&bytes)
                    .map_err(|_| StoreError::Backend("corrupt multisignature index entry".into()))?,
                None => return Ok(None),
            };
        let Some(usage) = outputs.outputs.get(global_index as usize) else {
            return Ok(None);
        };
        let entry = self.transaction_by_index(&inner, usage.transaction_index)?;
        Ok(Some((entry.tx, usage.output_index)))
    }

    pub fn transaction_ids_by_payment_id(
        &self,
        payment_id: &Hash,
    ) -> Result<Vec<Hash>, ChainError> {
        let inner = self.lock_inner();
        match inner.db.get(&payment_id_key(payment_id))? {
            Some(bytes) => {
                let entry: PaymentIdEntry = decode(&bytes)
                    .map_err(|_| StoreError::Backend("corrupt payment id entry".into()))?;
                Ok(entry.transaction_hashes)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Main-chain block ids mined within `[begin, end]`, capped at `limit`;
    /// the second value is the total count within the window.
    pub fn block_ids_by_timestamp(
        &self,
        begin: u64,
        end: u64,
        limit: u32,
    ) -> Result<(Vec<Hash>, u32), ChainError> {
        let inner = self.lock_inner();
        let mut hashes = Vec::new();
        let mut total = 0u32;
        let middle = write_varint_sqlite4(begin);
        let mut scan_error = None;
        inner.db.for_each_prefix(
            TIMESTAMP_INDEX_PREFIX,
            Some(&middle),
            false,
            &mut |key, value| {
                let Some(timestamp) = crate::index::timestamp_from_key(key) else {
                    scan_error = Some(StoreError::Backend("corrupt timestamp key".into()));
                    return false;
                };
                if timestamp > end {
                    return false;
                }
                let Ok(entry) = decode::<TimestampEntry>(value) else {
                    scan_error = Some(StoreError::Backend("corrupt timestamp entry".into()));
                    return false;
                };
                for (_, hash) in entry.blocks {
                    total += 1;
                    if hashes.len() < limit as usize {
                        hashes.push(hash);
                    }
                }
                true
            },
        )?;
        match scan_error {
            Some(err) => Err(err.into()),
            None => Ok((hashes, total)),
        }
    }

    /// First main-chain height at or after `start_height` whose timestamp
    /// reaches `timestamp`.
    pub fn lower_bound_by_timestamp(
        &self,
        timestamp: u64,
        start_height: u32,
    ) -> Result<Option<u32>, ChainError> {
        let inner = self.lock_inner();
        let count = self.block_count();
        for height in start_height..count {
            let entry = self.block_entry_at(&inner, height)?;
            if entry.block.header.timestamp >= timestamp {
                return Ok(Some(height));
            }
        }
        Ok(None)
    }

    /// Main-chain ids from `start_height`, at most `max_count`.
    pub fn block_ids(&self, start_height: u32, max_count: u32) -> Result<Vec<Hash>, ChainError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let inner = self.lock_inner();
        let mut ids = Vec::new();
        let middle = write_varint_sqlite4(u64::from(start_height));
        inner.db.for_each_prefix(
            BLOCK_INDEX_PREFIX,
            Some(&middle),
            false,
            &mut |_, value| {
                if let Some(hash) = hash_from_value(value) {
                    ids.push(hash);
                }
                ids.len() < max_count as usize
            },
        )?;
        Ok(ids)
    }

    /// Geometrically thinning ancestor list ending at the genesis block.
    pub fn build_sparse_chain(&self, start: Option<Hash>) -> Result<Vec<Hash>, ChainError> {
        let inner = self.lock_inner();
        let start_height = match start {
            Some(hash) => match self.main_chain_height_of(&inner, &hash)? {
                Some(height) => height,
                None => return Ok(Vec::new()),
            },
            None => self.tip_height(),
        };

        let mut ids = Vec::new();
        let mut offset = 0u32;
        let mut step = 1u32;
        loop {
            let Some(height) = start_height.checked_sub(offset) else {
                break;
            };
            let hash = self
                .block_hash_at(&inner, height)?
                .ok_or_else(|| StoreError::Backend("height index gap".into()))?;
            ids.push(hash);
            if height == 0 {
                return Ok(ids);
            }
            offset += step;
            if ids.len() >= 10 {
                step = step.saturating_mul(2);
            }
        }
        let genesis = self
            .block_hash_at(&inner, 0)?
            .ok_or_else(|| StoreError::Backend("height index gap".into()))?;
        ids.push(genesis);
        Ok(ids)
    }

    /// Finds the first remote id known to the main chain and returns
    /// `(start height, total blocks, ids)` from there, at most `max_count`.
    pub fn find_blockchain_supplement(
        &self,
        remote_ids: &[Hash],
        max_count: u32,
    ) -> Result<Option<(u32, u32, Vec<Hash>)>, ChainError> {
        let start = {
            let inner = self.lock_inner();
            let mut found = None;
            for id in remote_ids {
                if let Some(height) = self.main_chain_height_of(&inner, id)? {
                    found = Some(height);
                    break;
                }
            }
            found
        };
        let Some(start) = start else {
            return Ok(None);
        };
        let ids = self.block_ids(start, max_count)?;
        Ok(Some((start, self.block_count(), ids)))
    }

    pub fn alternative_block_ids(&self) -> Vec<Hash> {
        self.lock_inner().alternative_chains.keys().copied().collect()
    }

    pub fn alternative_blocks_count(&self) -> usize {
        self.lock_inner().alternative_chains.len()
    }

    /// Key-output references `(tx hash, output position)` for each ring
    /// member of a key input; explorers resolve rings with this.
    pub fn scan_outputs_for_references(
        &self,
        input: &KeyInput,
    ) -> Result<Vec<(Hash, u16)>, ChainError> {
        let inner = self.lock_inner();
        let Some(absolute) = relative_output_offsets_to_absolute(&input.output_indexes) else {
            return Ok(Vec::new());
        };
        let outputs: OutputsEntry = match inner.db.get(&outputs_key(input.amount))? {
            Some(bytes) => decode(&bytes)
                .map_err(|_| StoreError::Backend("corrupt outputs index entry".into()))?,
            None => return Ok(Vec::new()),
        };
        let mut references = Vec::with_capacity(absolute.len());
        for offset in absolute {
            let Some((tx_index, position)) = outputs.outputs.get(offset as usize) else {
                return Ok(references);
            };
            let entry = self.transaction_by_index(&inner, *tx_index)?;
            references.push((entry.tx.hash(), *position));
        }
        Ok(references)
    }

    /// Anonymity-set sampling: unlocked outputs of each amount, drawn from a
    /// triangular distribution concentrated on recent outputs.
    pub fn random_outputs_by_amount(
        &self,
        request: &RandomOutsRequest,
    ) -> Result<RandomOutsResponse, ChainError> {
        let inner = self.lock_inner();
        let current_height = self.block_count();
        let last_timestamp = self
            .tip(&inner)?
            .map(|(_, entry)| entry.block.header.timestamp)
            .unwrap_or(0);
        let mut rng = rand::thread_rng();
        let mut response = RandomOutsResponse::default();

        for amount in &request.amounts {
            let mut for_amount = RandomOutsForAmount {
                amount: *amount,
                outs: Vec::new(),
            };
            let outputs: OutputsEntry = match inner.db.get(&outputs_key(*amount))? {
                Some(bytes) => decode(&bytes)
                    .map_err(|_| StoreError::Backend("corrupt outputs index entry".into()))?,
                None => {
                    log_error!("no outputs recorded for requested amount {amount}");
                    response.outs.push(for_amount);
                    continue;
                }
            };

            let version = expected_major_version_for_height(
                &self.currency,
                &inner.detectors,
                current_height,
            );
            let up_index_limit =
                self.unlocked_prefix_len(&outputs, current_height, version);

            if outputs.outputs.len() as u64 > request.outs_count {
                let mut used = std::collections::HashSet::new();
                let mut picked = 0u64;
                let mut tries = 0usize;
                // Bounded by the candidate count so a pathological list
                // cannot spin forever.
                while picked != request.outs_count && tries < up_index_limit {
                    let raw: u64 = rng.gen_range(0..(1u64 << 53));
                    let fraction = ((raw as f64) / ((1u64 << 53) as f64)).sqrt();
                    let pick = (fraction * up_index_limit as f64) as usize;
                    tries += 1;
                    if !used.insert(pick) {
                        continue;
                    }
                    if let Some(entry) = self.sample_output(
                        &inner,
                        &outputs,
                        pick,
                        current_height,
                        last_timestamp,
                    )? {
                        for_amount.outs.push(entry);
                        picked += 1;
                    }
                }
            } else {
                for pick in 0..up_index_limit {
                    if let Some(entry) = self.sample_output(
                        &inner,
                        &outputs,
                        pick,
                        current_height,
                        last_timestamp,
                    )? {
                        for_amount.outs.push(entry);
                    }
                }
            }
            response.outs.push(for_amount);
        }
        Ok(response)
    }

    /// Length of the leading run of outputs old enough to be spendable.
    fn unlocked_prefix_len(
        &self,
        outputs: &OutputsEntry,
        current_height: u32,
        major_version: u8,
    ) -> usize {
        let window = u64::from(self.currency.mined_money_unlock_window(major_version));
        for (position, (tx_index, _)) in outputs.outputs.iter().enumerate().rev() {
            if u64::from(tx_index.block) + window <= u64::from(current_height) {
                return position + 1;
            }
        }
        0
    }

    fn sample_output(
        &self,
        inner: &ChainInner,
        outputs: &OutputsEntry,
        position: usize,
        current_height: u32,
        last_timestamp: u64,
    ) -> Result<Option<RandomOutEntry>, StoreError> {
        let Some((tx_index, output_position)) = outputs.outputs.get(position) else {
            return Ok(None);
        };
        let entry = self.transaction_by_index(inner, *tx_index)?;
        if !is_spend_time_unlocked(
            &self.currency,
            entry.tx.prefix.unlock_time,
            current_height,
            last_timestamp,
        ) {
            return Ok(None);
        }
        let Some(output) = entry.tx.prefix.outputs.get(*output_position as usize) else {
            log_error!("outputs index entry points past the transaction outputs");
            return Ok(None);
        };
        match &output.target {
            OutputTarget::Key(target) => Ok(Some(RandomOutEntry {
                global_amount_index: position as u32,
                out_key: target.key,
            })),
            OutputTarget::Multisignature(_) => {
                log_error!("key outputs index references a multisignature output");
                Ok(None)
            }
        }
    }

    // ---- observers and queues -------------------------------------------

    pub fn register_observer(&self, observer: Arc<dyn BlockchainObserver>) {
        self.observers.lock().expect("observer lock").push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn BlockchainObserver>) -> bool {
        let mut observers = self.observers.lock().expect("observer lock");
        let before = observers.len();
        observers.retain(|existing| !Arc::ptr_eq(existing, observer));
        observers.len() != before
    }

    pub fn add_message_queue(&self, sender: Sender<BlockchainMessage>) -> usize {
        self.queues.lock().expect("queue lock").add(sender)
    }

    pub fn remove_message_queue(&self, id: usize) -> bool {
        self.queues.lock().expect("queue lock").remove(id)
    }
}

fn multisignature_inputs_distinct(transaction: &Transaction) -> bool {
    let mut seen = std::collections::HashSet::new();
    for input in &transaction.prefix.inputs {
        if let TransactionInput::Multisignature(input) = input {
            if !seen.insert((input.amount, input.output_index)) {
                return false;
            }
        }
    }
    true
}

fn read_record<T: umbrad_primitives::encoding::Decodable>(
    db: &Database,
    key: &[u8],
) -> Option<T> {
    match db.get(key) {
        Ok(Some(bytes)) => decode(&bytes).ok(),
        _ => None,
    }
}

fn adjusted_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn pow_reason(err: umbrad_pow::PowError) -> &'static str {
    match err {
        umbrad_pow::PowError::InsufficientWork => "insufficient work",
        umbrad_pow::PowError::MissingParentBlock => "missing parent block",
        umbrad_pow::PowError::MissingMergeMiningTag => "missing merge-mining tag",
        umbrad_pow::PowError::MergeMiningTagMismatch => "merge-mining tag mismatch",
    }
}

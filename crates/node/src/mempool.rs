//! Memory pool of unconfirmed transactions.
//!
//! Admission validates against the current chain view; the chain manager
//! drains entries destructively while assembling blocks and re-presents
//! them on pops, which [`PoolSession::add`] absorbs idempotently.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use umbrad_chainstate::{Blockchain, PoolSession, TransactionPool};
use umbrad_crypto::{hash_to_hex, Hash, KeyImage};
use umbrad_log::{log_debug, log_info};
use umbrad_primitives::transaction::{Transaction, TransactionInput};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolError {
    AlreadyExists,
    Coinbase,
    FeeTooLow { fee: u64, minimum: u64 },
    AmountOverflow,
    KeyImageConflict,
    InvalidInputs(String),
    Chain(String),
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MempoolError::AlreadyExists => write!(f, "transaction already known"),
            MempoolError::Coinbase => write!(f, "coinbase transactions cannot enter the pool"),
            MempoolError::FeeTooLow { fee, minimum } => {
                write!(f, "fee {fee} below the minimum {minimum}")
            }
            MempoolError::AmountOverflow => write!(f, "outputs exceed inputs"),
            MempoolError::KeyImageConflict => {
                write!(f, "key image conflicts with another pool transaction")
            }
            MempoolError::InvalidInputs(reason) => write!(f, "invalid inputs: {reason}"),
            MempoolError::Chain(reason) => write!(f, "chain error: {reason}"),
        }
    }
}

impl std::error::Error for MempoolError {}

pub struct PoolEntry {
    pub tx: Transaction,
    pub blob_size: usize,
    pub fee: u64,
    pub received: u64,
}

#[derive(Default)]
struct MempoolInner {
    entries: HashMap<Hash, PoolEntry>,
    spent_key_images: HashMap<KeyImage, Hash>,
}

impl MempoolInner {
    fn insert(&mut self, hash: Hash, tx: Transaction) -> bool {
        for input in &tx.prefix.inputs {
            if let TransactionInput::Key(input) = input {
                match self.spent_key_images.get(&input.key_image) {
                    Some(existing) if *existing != hash => return false,
                    _ => {}
                }
            }
        }
        let blob_size = tx.binary_size();
        let fee = tx.fee();
        for input in &tx.prefix.inputs {
            if let TransactionInput::Key(input) = input {
                self.spent_key_images.insert(input.key_image, hash);
            }
        }
        self.entries.insert(
            hash,
            PoolEntry {
                tx,
                blob_size,
                fee,
                received: unix_time(),
            },
        );
        true
    }

    fn remove(&mut self, hash: &Hash) -> Option<PoolEntry> {
        let entry = self.entries.remove(hash)?;
        for input in &entry.tx.prefix.inputs {
            if let TransactionInput::Key(input) = input {
                if self.spent_key_images.get(&input.key_image) == Some(hash) {
                    self.spent_key_images.remove(&input.key_image);
                }
            }
        }
        Some(entry)
    }
}

#[derive(Default)]
pub struct Mempool {
    inner: Mutex<MempoolInner>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validated admission path for transactions arriving from peers or RPC.
    pub fn add_transaction(
        &self,
        tx: Transaction,
        chain: &Blockchain,
    ) -> Result<Hash, MempoolError> {
        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase);
        }
        if tx.output_amount() > tx.input_amount() || !tx.check_outs_overflow() {
            return Err(MempoolError::AmountOverflow);
        }
        let hash = tx.hash();

        if chain
            .have_transaction(&hash)
            .map_err(|err| MempoolError::Chain(err.to_string()))?
        {
            return Err(MempoolError::AlreadyExists);
        }

        let fee = tx.fee();
        let minimum = chain.currency().minimal_fee();
        if fee < minimum {
            return Err(MempoolError::FeeTooLow { fee, minimum });
        }

        match chain
            .validate_transaction_inputs(&tx)
            .map_err(|err| MempoolError::Chain(err.to_string()))?
        {
            Ok(_) => {}
            Err(reason) => return Err(MempoolError::InvalidInputs(reason.to_string())),
        }

        let mut inner = self.inner.lock().expect("mempool lock");
        if inner.entries.contains_key(&hash) {
            return Err(MempoolError::AlreadyExists);
        }
        if !inner.insert(hash, tx) {
            return Err(MempoolError::KeyImageConflict);
        }
        log_debug!("transaction {} entered the pool", hash_to_hex(&hash));
        Ok(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner
            .lock()
            .expect("mempool lock")
            .entries
            .contains_key(hash)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("mempool lock").entries.len()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.inner
            .lock()
            .expect("mempool lock")
            .entries
            .values()
            .map(|entry| entry.tx.clone())
            .collect()
    }

    /// Fee-greedy selection bounded by `max_total_size`; returns
    /// `(hash, size, fee)` triples.
    pub fn pick_for_block(&self, max_total_size: u64) -> (Vec<Hash>, u64, u64) {
        let inner = self.inner.lock().expect("mempool lock");
        let mut candidates: Vec<(&Hash, &PoolEntry)> = inner.entries.iter().collect();
        candidates.sort_by(|(_, a), (_, b)| {
            b.fee
                .cmp(&a.fee)
                .then(a.received.cmp(&b.received))
                .then(a.blob_size.cmp(&b.blob_size))
        });

        let mut hashes = Vec::new();
        let mut total_size = 0u64;
        let mut total_fee = 0u64;
        for (hash, entry) in candidates {
            if total_size + entry.blob_size as u64 > max_total_size {
                continue;
            }
            total_size += entry.blob_size as u64;
            total_fee += entry.fee;
            hashes.push(*hash);
        }
        (hashes, total_size, total_fee)
    }
}

struct MempoolSession<'a> {
    inner: MutexGuard<'a, MempoolInner>,
}

impl PoolSession for MempoolSession<'_> {
    fn take(&mut self, hash: &Hash) -> Option<(Transaction, usize, u64)> {
        self.inner
            .remove(hash)
            .map(|entry| (entry.tx, entry.blob_size, entry.fee))
    }

    fn get(&self, hash: &Hash) -> Option<(Transaction, usize, u64)> {
        self.inner
            .entries
            .get(hash)
            .map(|entry| (entry.tx.clone(), entry.blob_size, entry.fee))
    }

    fn add(&mut self, tx: Transaction, restored: bool) -> bool {
        let hash = tx.hash();
        if self.inner.entries.contains_key(&hash) {
            return true;
        }
        let accepted = self.inner.insert(hash, tx);
        if accepted && restored {
            log_info!("transaction {} returned to the pool", hash_to_hex(&hash));
        }
        accepted
    }
}

impl TransactionPool for Mempool {
    fn session(&self) -> Box<dyn PoolSession + '_> {
        Box::new(MempoolSession {
            inner: self.inner.lock().expect("mempool lock"),
        })
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

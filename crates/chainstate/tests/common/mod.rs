//! Shared scaffolding for the chain-manager integration tests: an in-memory
//! pool implementing the chain's pool contract, a deterministic block
//! builder, and a tiny wallet that signs real ring spends of the coinbases
//! it mined.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use umbrad_chainstate::{Blockchain, PoolSession, TransactionPool};
use umbrad_consensus::{currency, Checkpoints, Currency, Network};
use umbrad_crypto::{
    derive_key_image, generate_keys, generate_ring_signature, Hash, KeyImage, PublicKey, SecretKey,
};
use umbrad_primitives::block::{Block, BlockHeader, BLOCK_MAJOR_VERSION_1, BLOCK_MINOR_VERSION_0};
use umbrad_primitives::extra::append_payment_id_to_extra;
use umbrad_primitives::transaction::{
    absolute_output_offsets_to_relative, BaseInput, KeyInput, KeyOutput, OutputTarget, Transaction,
    TransactionInput, TransactionOutput, TransactionPrefix,
};
use umbrad_storage::{MemoryStore, OpenMode};

pub const BASE_TIMESTAMP: u64 = 1_600_000_000;
pub const BLOCK_SPACING: u64 = 120;
pub const COINBASE_UNLOCK_WINDOW: u64 = 10;

#[derive(Default)]
pub struct TestPoolInner {
    pub transactions: HashMap<Hash, (Transaction, usize, u64)>,
    pub restored: Vec<Hash>,
}

#[derive(Default)]
pub struct TestPool {
    inner: Mutex<TestPoolInner>,
}

impl TestPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, tx: Transaction) -> Hash {
        let hash = tx.hash();
        let size = tx.binary_size();
        let fee = tx.fee();
        self.inner
            .lock()
            .expect("test pool lock")
            .transactions
            .insert(hash, (tx, size, fee));
        hash
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner
            .lock()
            .expect("test pool lock")
            .transactions
            .contains_key(hash)
    }

    pub fn restored(&self) -> Vec<Hash> {
        self.inner.lock().expect("test pool lock").restored.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("test pool lock").transactions.len()
    }
}

pub struct TestPoolSession<'a> {
    inner: MutexGuard<'a, TestPoolInner>,
}

impl PoolSession for TestPoolSession<'_> {
    fn take(&mut self, hash: &Hash) -> Option<(Transaction, usize, u64)> {
        self.inner.transactions.remove(hash)
    }

    fn get(&self, hash: &Hash) -> Option<(Transaction, usize, u64)> {
        self.inner.transactions.get(hash).cloned()
    }

    fn add(&mut self, tx: Transaction, restored: bool) -> bool {
        let hash = tx.hash();
        if restored {
            self.inner.restored.push(hash);
        }
        let size = tx.binary_size();
        let fee = tx.fee();
        self.inner.transactions.insert(hash, (tx, size, fee));
        true
    }
}

impl TransactionPool for TestPool {
    fn session(&self) -> Box<dyn PoolSession + '_> {
        Box::new(TestPoolSession {
            inner: self.inner.lock().expect("test pool lock"),
        })
    }
}

pub fn regtest_chain() -> (Blockchain, Arc<MemoryStore>, Currency) {
    regtest_chain_with_checkpoints(Checkpoints::new())
}

pub fn regtest_chain_with_checkpoints(
    checkpoints: Checkpoints,
) -> (Blockchain, Arc<MemoryStore>, Currency) {
    let backend = Arc::new(MemoryStore::new());
    let currency = currency(Network::Regtest);
    let chain = Blockchain::new(
        currency.clone(),
        checkpoints,
        Arc::clone(&backend) as Arc<dyn umbrad_storage::KeyValueBackend>,
        OpenMode::OpenOrCreate,
    )
    .expect("open chain");
    (chain, backend, currency)
}

/// Coins in circulation after the block at `height` (fees never mint).
pub fn generated_after(currency: &Currency, height: u32) -> u64 {
    let mut generated = 0u64;
    for _ in 0..=height {
        generated += currency.base_reward(generated);
    }
    generated
}

/// Base subsidy of the block at `height`.
pub fn expected_subsidy(currency: &Currency, height: u32) -> u64 {
    currency.base_reward(if height == 0 {
        0
    } else {
        generated_after(currency, height - 1)
    })
}

/// A miner key per height so tests can later spend what they mined.
pub struct TestWallet {
    keys: HashMap<u32, (PublicKey, SecretKey, u64)>,
}

impl TestWallet {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    pub fn coinbase_amount(&self, height: u32) -> u64 {
        self.keys[&height].2
    }

    pub fn key_for(&self, height: u32) -> (PublicKey, SecretKey, u64) {
        self.keys[&height]
    }

    /// Valid block at `height` on top of `prev_hash`, paying the coinbase to
    /// a fresh wallet key.
    pub fn build_block(
        &mut self,
        currency: &Currency,
        height: u32,
        prev_hash: Hash,
        transactions: &[Transaction],
    ) -> Block {
        let fee_total: u64 = transactions.iter().map(Transaction::fee).sum();
        let reward = expected_subsidy(currency, height) + fee_total;
        let (key, secret) = generate_keys();
        self.keys.insert(height, (key, secret, reward));

        let base_transaction = Transaction {
            prefix: TransactionPrefix {
                version: 1,
                unlock_time: u64::from(height) + COINBASE_UNLOCK_WINDOW,
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
        };

        Block {
            header: BlockHeader {
                major_version: BLOCK_MAJOR_VERSION_1,
                minor_version: BLOCK_MINOR_VERSION_0,
                nonce: height,
                timestamp: BASE_TIMESTAMP + u64::from(height) * BLOCK_SPACING,
                previous_block_hash: prev_hash,
            },
            parent_block: None,
            base_transaction,
            transaction_hashes: transactions.iter().map(Transaction::hash).collect(),
        }
    }

    /// Ring spend of the coinbase mined at `source_height`. The ring is the
    /// full output list of that amount (a singleton for coinbase amounts),
    /// signed with the wallet key. Outputs `amount - fee` to a fresh key.
    pub fn spend_coinbase(
        &self,
        chain: &Blockchain,
        source_height: u32,
        fee: u64,
        payment_id: Option<Hash>,
    ) -> (Transaction, KeyImage) {
        let (key, secret, amount) = self.keys[&source_height];
        let image = derive_key_image(&key, &secret).expect("key image");

        let references = chain
            .scan_outputs_for_references(&KeyInput {
                amount,
                output_indexes: vec![0],
                key_image: image,
            })
            .expect("scan outputs");
        assert_eq!(references.len(), 1, "coinbase amount should be unique");

        let (recipient, _) = generate_keys();
        let mut extra = Vec::new();
        if let Some(id) = payment_id {
            append_payment_id_to_extra(&mut extra, &id);
        }
        let prefix = TransactionPrefix {
            version: 1,
            unlock_time: 0,
            inputs: vec![TransactionInput::Key(KeyInput {
                amount,
                output_indexes: absolute_output_offsets_to_relative(&[0]),
                key_image: image,
            })],
            outputs: vec![TransactionOutput {
                amount: amount - fee,
                target: OutputTarget::Key(KeyOutput { key: recipient }),
            }],
            extra,
        };

        let unsigned = Transaction {
            prefix,
            signatures: Vec::new(),
        };
        let prefix_hash = unsigned.prefix_hash();
        let signatures = generate_ring_signature(&prefix_hash, &image, &[key], &secret, 0)
            .expect("ring signature");

        (
            Transaction {
                prefix: unsigned.prefix,
                signatures: vec![signatures],
            },
            image,
        )
    }
}

/// Grows the chain by `count` empty blocks and returns the new tip hash.
pub fn grow_chain(
    chain: &Blockchain,
    wallet: &mut TestWallet,
    currency: &Currency,
    pool: &TestPool,
    count: u32,
) -> Hash {
    let mut prev = chain.tail_hash().expect("tail hash");
    for _ in 0..count {
        let height = chain.block_count();
        let block = wallet.build_block(currency, height, prev, &[]);
        let result = chain.add_block(&block, pool).expect("add block");
        assert_eq!(
            result,
            umbrad_chainstate::BlockAddResult::AddedToMain,
            "block at height {height} should enter the main chain"
        );
        prev = block.hash();
    }
    prev
}

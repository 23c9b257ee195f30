//! Key-image double-spend rejection, across blocks and within one
//! transaction, plus genesis configuration checks.

mod common;

use std::sync::Arc;

use common::{grow_chain, regtest_chain, TestPool, TestWallet};
use umbrad_chainstate::{BlockAddResult, Blockchain, ChainError, VerificationError};
use umbrad_consensus::{currency, Checkpoints, Network};
use umbrad_crypto::generate_ring_signature;
use umbrad_primitives::transaction::{Transaction, TransactionInput};
use umbrad_storage::{KeyValueBackend, MemoryStore, OpenMode};

#[test]
fn second_spend_of_a_key_image_is_rejected() {
    let (chain, _backend, currency) = regtest_chain();
    let mut wallet = TestWallet::new();
    let pool = TestPool::new();
    grow_chain(&chain, &mut wallet, &currency, &pool, 13);

    let (tx1, image) = wallet.spend_coinbase(&chain, 2, 0, None);
    pool.stage(tx1.clone());
    let prev = chain.tail_hash().expect("tail");
    let block14 = wallet.build_block(&currency, 14, prev, &[tx1]);
    assert_eq!(
        chain.add_block(&block14, &pool).expect("add"),
        BlockAddResult::AddedToMain
    );
    assert!(chain.have_spent_key_image(&image).expect("spent"));

    // A different transaction spending the same output produces the same key
    // image; the chain must refuse it.
    let (tx2, image2) = wallet.spend_coinbase(&chain, 2, 0, Some([0x01u8; 32]));
    assert_eq!(image, image2);
    assert_ne!(tx2.hash(), block14.transaction_hashes[0]);
    let tx2_hash = pool.stage(tx2.clone());

    let prev = chain.tail_hash().expect("tail");
    let block15 = wallet.build_block(&currency, 15, prev, &[tx2]);
    match chain.add_block(&block15, &pool).expect("add") {
        BlockAddResult::VerificationFailed(VerificationError::InputKeyImageSpent) => {}
        other => panic!("expected a key image rejection, got {other:?}"),
    }

    // The chain did not advance and the failed block left no side effects.
    assert_eq!(chain.tip_height(), 14);
    assert!(!chain
        .have_transaction(&block15.base_transaction.hash())
        .expect("tx"));
    assert!(!chain.have_transaction(&tx2_hash).expect("tx"));
    // The drained transaction was given back to the pool.
    assert!(pool.contains(&tx2_hash));
}

#[test]
fn double_spend_within_one_transaction_is_rejected() {
    let (chain, _backend, currency) = regtest_chain();
    let mut wallet = TestWallet::new();
    let pool = TestPool::new();
    grow_chain(&chain, &mut wallet, &currency, &pool, 13);

    // Clone the single key input so the transaction spends the image twice.
    let (template, image) = wallet.spend_coinbase(&chain, 3, 0, None);
    let mut prefix = template.prefix.clone();
    let duplicate_input = prefix.inputs[0].clone();
    prefix.inputs.push(duplicate_input);
    prefix.outputs[0].amount *= 2;

    let unsigned = Transaction {
        prefix,
        signatures: Vec::new(),
    };
    let prefix_hash = unsigned.prefix_hash();
    let TransactionInput::Key(key_input) = &unsigned.prefix.inputs[0] else {
        panic!("expected a key input");
    };
    let ring = {
        let references = chain
            .scan_outputs_for_references(key_input)
            .expect("references");
        assert_eq!(references.len(), 1);
        // The wallet key that mined height 3 signs both inputs.
        wallet_ring_key(&wallet, 3)
    };
    let signatures =
        generate_ring_signature(&prefix_hash, &image, &[ring.0], &ring.1, 0).expect("sign");
    let tx = Transaction {
        prefix: unsigned.prefix,
        signatures: vec![signatures.clone(), signatures],
    };

    pool.stage(tx.clone());
    let prev = chain.tail_hash().expect("tail");
    let block = wallet.build_block(&currency, 14, prev, &[tx]);
    match chain.add_block(&block, &pool).expect("add") {
        BlockAddResult::VerificationFailed(VerificationError::InputKeyImageSpent) => {}
        other => panic!("expected a key image rejection, got {other:?}"),
    }
    assert_eq!(chain.tip_height(), 13);
    assert!(!chain.have_spent_key_image(&image).expect("spent"));
}

fn wallet_ring_key(
    wallet: &TestWallet,
    height: u32,
) -> (umbrad_crypto::PublicKey, umbrad_crypto::SecretKey) {
    let (key, secret, _) = wallet.key_for(height);
    (key, secret)
}

#[test]
fn genesis_mismatch_refuses_to_open() {
    let backend = Arc::new(MemoryStore::new());

    // A testnet chain takes the store first.
    {
        let chain = Blockchain::new(
            currency(Network::Testnet),
            Checkpoints::new(),
            Arc::clone(&backend) as Arc<dyn KeyValueBackend>,
            OpenMode::OpenOrCreate,
        )
        .expect("open chain");
        chain.flush().expect("flush");
    }

    let snapshot = backend.snapshot();

    // Opening it as mainnet must fail without touching the store.
    let result = Blockchain::new(
        currency(Network::Mainnet),
        Checkpoints::new(),
        Arc::clone(&backend) as Arc<dyn KeyValueBackend>,
        OpenMode::OpenOrCreate,
    );
    match result {
        Err(ChainError::ConfigMismatch(reason)) => {
            assert!(reason.contains("genesis"), "unexpected reason: {reason}");
        }
        Ok(_) => panic!("mainnet must not open a testnet store"),
        Err(other) => panic!("expected a config mismatch, got {other}"),
    }
    assert_eq!(backend.snapshot(), snapshot, "failed open must not mutate");

    // The right network still opens it.
    let reopened = Blockchain::new(
        currency(Network::Testnet),
        Checkpoints::new(),
        backend as Arc<dyn KeyValueBackend>,
        OpenMode::OpenExisting,
    )
    .expect("reopen chain");
    assert_eq!(reopened.tip_height(), 0);
}

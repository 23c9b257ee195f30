//! Anonymity-set sampling over the outputs-by-amount index.

mod common;

use common::{grow_chain, regtest_chain, TestPool, TestWallet};
use umbrad_chainstate::{BlockAddResult, RandomOutsRequest};
use umbrad_crypto::{derive_key_image, generate_keys, generate_ring_signature};
use umbrad_primitives::transaction::{
    absolute_output_offsets_to_relative, KeyInput, KeyOutput, OutputTarget, Transaction,
    TransactionInput, TransactionOutput, TransactionPrefix,
};

const SPLIT_COUNT: u64 = 24;

/// Splits the coinbase mined at `source_height` into `SPLIT_COUNT` equal
/// outputs, creating a usable anonymity set for one amount.
fn split_coinbase(
    chain: &umbrad_chainstate::Blockchain,
    wallet: &TestWallet,
    source_height: u32,
) -> (Transaction, u64) {
    let (key, secret, amount) = wallet.key_for(source_height);
    let image = derive_key_image(&key, &secret).expect("key image");
    let per_output = amount / SPLIT_COUNT / 2;
    let fee = amount - per_output * SPLIT_COUNT;

    let references = chain
        .scan_outputs_for_references(&KeyInput {
            amount,
            output_indexes: vec![0],
            key_image: image,
        })
        .expect("references");
    assert_eq!(references.len(), 1);

    let outputs = (0..SPLIT_COUNT)
        .map(|_| TransactionOutput {
            amount: per_output,
            target: OutputTarget::Key(KeyOutput {
                key: generate_keys().0,
            }),
        })
        .collect();

    let unsigned = Transaction {
        prefix: TransactionPrefix {
            version: 1,
            unlock_time: 0,
            inputs: vec![TransactionInput::Key(KeyInput {
                amount,
                output_indexes: absolute_output_offsets_to_relative(&[0]),
                key_image: image,
            })],
            outputs,
            extra: Vec::new(),
        },
        signatures: Vec::new(),
    };
    let prefix_hash = unsigned.prefix_hash();
    let signatures =
        generate_ring_signature(&prefix_hash, &image, &[key], &secret, 0).expect("sign");
    (
        Transaction {
            prefix: unsigned.prefix,
            signatures: vec![signatures],
        },
        per_output,
    )
}

#[test]
fn sampling_draws_unique_unlocked_outputs() {
    let (chain, _backend, currency) = regtest_chain();
    let mut wallet = TestWallet::new();
    let pool = TestPool::new();

    grow_chain(&chain, &mut wallet, &currency, &pool, 12);

    let (split_tx, per_output) = split_coinbase(&chain, &wallet, 2);
    pool.stage(split_tx.clone());
    let prev = chain.tail_hash().expect("tail");
    let block = wallet.build_block(&currency, 13, prev, &[split_tx]);
    assert_eq!(
        chain.add_block(&block, &pool).expect("add"),
        BlockAddResult::AddedToMain
    );

    // Freshly created outputs are below the unlock window: nothing to draw.
    let request = RandomOutsRequest {
        amounts: vec![per_output],
        outs_count: 5,
    };
    let response = chain.random_outputs_by_amount(&request).expect("sample");
    assert_eq!(response.outs.len(), 1);
    assert!(response.outs[0].outs.is_empty());

    // Once the containing block matures, sampling returns distinct indexes.
    grow_chain(&chain, &mut wallet, &currency, &pool, 10);
    let response = chain.random_outputs_by_amount(&request).expect("sample");
    let picks = &response.outs[0].outs;
    assert_eq!(picks.len(), 5);
    let mut indexes: Vec<u32> = picks.iter().map(|out| out.global_amount_index).collect();
    indexes.sort_unstable();
    indexes.dedup();
    assert_eq!(indexes.len(), 5, "sampling must not repeat outputs");
    assert!(indexes
        .iter()
        .all(|index| (*index as u64) < SPLIT_COUNT));

    // Asking for more than exists returns the whole unlocked set.
    let request = RandomOutsRequest {
        amounts: vec![per_output],
        outs_count: SPLIT_COUNT * 2,
    };
    let response = chain.random_outputs_by_amount(&request).expect("sample");
    assert_eq!(response.outs[0].outs.len(), SPLIT_COUNT as usize);

    // Unknown amounts yield an empty set rather than an error.
    let request = RandomOutsRequest {
        amounts: vec![7],
        outs_count: 3,
    };
    let response = chain.random_outputs_by_amount(&request).expect("sample");
    assert!(response.outs[0].outs.is_empty());
}

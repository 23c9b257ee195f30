//! Reorganization arbitration: cumulative-difficulty switches, the
//! equal-difficulty boundary, checkpoint-forced switches, and key-image
//! rotation across a switch.

mod common;

use common::{grow_chain, regtest_chain, TestPool, TestWallet};
use umbrad_chainstate::{BlockAddResult, TransactionPool};
use umbrad_primitives::block::Block;

/// Builds an alternative branch of empty blocks on top of `fork_parent`.
/// Timestamps are nudged by one second so the branch hashes differ from the
/// main chain at the same heights.
fn build_branch(
    wallet: &mut TestWallet,
    currency: &umbrad_consensus::Currency,
    fork_parent: umbrad_crypto::Hash,
    first_height: u32,
    length: u32,
) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(length as usize);
    let mut prev = fork_parent;
    for i in 0..length {
        let height = first_height + i;
        let mut block = wallet.build_block(currency, height, prev, &[]);
        block.header.timestamp += 1;
        prev = block.hash();
        blocks.push(block);
    }
    blocks
}

#[test]
fn longer_branch_wins_and_repools_transactions() {
    let (chain, _backend, currency) = regtest_chain();
    let mut wallet = TestWallet::new();
    let pool = TestPool::new();

    // Main chain 0..=12, then a block 13 carrying a real spend, then 14.
    grow_chain(&chain, &mut wallet, &currency, &pool, 12);
    let (tx, image) = wallet.spend_coinbase(&chain, 3, 0, None);
    let tx_hash = pool.stage(tx.clone());
    let prev = chain.tail_hash().expect("tail");
    let block13 = wallet.build_block(&currency, 13, prev, &[tx]);
    assert_eq!(
        chain.add_block(&block13, &pool).expect("add"),
        BlockAddResult::AddedToMain
    );
    grow_chain(&chain, &mut wallet, &currency, &pool, 1);
    assert_eq!(chain.tip_height(), 14);
    assert!(chain.have_spent_key_image(&image).expect("spent"));
    assert!(!pool.contains(&tx_hash));

    let old_coinbase_13 = block13.base_transaction.hash();
    let old_cumulative = chain
        .block_cumulative_difficulty(14)
        .expect("difficulty")
        .expect("tip");

    // Alternative branch from height 12, four blocks long.
    let fork_parent = chain.block_id_by_height(12).expect("id").expect("set");
    let branch = build_branch(&mut wallet, &currency, fork_parent, 13, 4);

    // One block: shorter than main, stays alternative.
    assert_eq!(
        chain.add_block(&branch[0], &pool).expect("add"),
        BlockAddResult::AddedAsAlternative
    );
    // Two blocks: cumulative difficulty exactly equals the main tip; an
    // equal branch must NOT be promoted.
    assert_eq!(
        chain.add_block(&branch[1], &pool).expect("add"),
        BlockAddResult::AddedAsAlternative
    );
    assert_eq!(chain.tip_height(), 14);
    assert_eq!(chain.alternative_blocks_count(), 2);

    // Three blocks: strictly heavier, the switch happens.
    assert_eq!(
        chain.add_block(&branch[2], &pool).expect("add"),
        BlockAddResult::SwitchedToAlt
    );
    assert_eq!(chain.tip_height(), 15);
    assert_eq!(
        chain.block_id_by_height(15).expect("id").expect("set"),
        branch[2].hash()
    );
    let new_cumulative = chain
        .block_cumulative_difficulty(15)
        .expect("difficulty")
        .expect("tip");
    assert!(new_cumulative > old_cumulative);

    // The orphaned spend is re-presented to the pool; coinbases are not.
    assert!(pool.contains(&tx_hash));
    assert!(pool.restored().contains(&tx_hash));
    assert!(!pool.restored().contains(&old_coinbase_13));

    // Key image rotated out with the orphaned block.
    assert!(!chain.have_spent_key_image(&image).expect("spent"));
    assert!(!chain.have_transaction(&tx_hash).expect("have tx"));

    // The promoted branch left the alternative map; the two ex-main blocks
    // above the split were parked there instead.
    assert!(chain.is_block_in_main_chain(&branch[2].hash()).expect("main"));
    assert_eq!(chain.alternative_blocks_count(), 2);

    // The branch keeps extending through the normal path.
    assert_eq!(
        chain.add_block(&branch[3], &pool).expect("add"),
        BlockAddResult::AddedToMain
    );
    assert_eq!(chain.tip_height(), 16);

    // And the re-pooled transaction is still spendable on the new chain.
    let prev = chain.tail_hash().expect("tail");
    let block17 = wallet.build_block(&currency, 17, prev, &[tx_from_pool(&pool, &tx_hash)]);
    assert_eq!(
        chain.add_block(&block17, &pool).expect("add"),
        BlockAddResult::AddedToMain
    );
    assert!(chain.have_spent_key_image(&image).expect("spent"));
}

fn tx_from_pool(
    pool: &TestPool,
    hash: &umbrad_crypto::Hash,
) -> umbrad_primitives::transaction::Transaction {
    let session = pool.session();
    session.get(hash).expect("transaction in pool").0
}

#[test]
fn checkpoint_forces_the_switch() {
    let (chain, _backend, currency) = regtest_chain();
    let mut wallet = TestWallet::new();
    let pool = TestPool::new();

    grow_chain(&chain, &mut wallet, &currency, &pool, 10);
    assert_eq!(chain.tip_height(), 10);

    // Competing branch 6..=8, never heavier than the main chain.
    let fork_parent = chain.block_id_by_height(5).expect("id").expect("set");
    let branch = build_branch(&mut wallet, &currency, fork_parent, 6, 3);

    // A checkpoint vouching for the branch arrives: the contradicted span of
    // the stored chain is dropped.
    assert!(chain
        .add_checkpoint(8, branch[2].hash())
        .expect("add checkpoint"));
    assert_eq!(chain.tip_height(), 7);

    assert_eq!(
        chain.add_block(&branch[0], &pool).expect("add"),
        BlockAddResult::AddedAsAlternative
    );
    assert_eq!(
        chain.add_block(&branch[1], &pool).expect("add"),
        BlockAddResult::AddedAsAlternative
    );
    // The checkpointed block forces the reorganization regardless of
    // cumulative difficulty.
    assert_eq!(
        chain.add_block(&branch[2], &pool).expect("add"),
        BlockAddResult::SwitchedToAlt
    );
    assert_eq!(chain.tip_height(), 8);
    assert_eq!(
        chain.block_id_by_height(8).expect("id").expect("set"),
        branch[2].hash()
    );
    assert!(chain.is_block_in_main_chain(&branch[0].hash()).expect("main"));
}

#[test]
fn failed_branch_replay_restores_the_original_chain() {
    let (chain, _backend, currency) = regtest_chain();
    let mut wallet = TestWallet::new();
    let pool = TestPool::new();

    grow_chain(&chain, &mut wallet, &currency, &pool, 14);
    let tip_before = chain.tail_hash().expect("tail");

    // A heavier branch whose tip block references a transaction nobody has:
    // the replay fails at the last block and the original chain comes back.
    let fork_parent = chain.block_id_by_height(12).expect("id").expect("set");
    let mut branch = build_branch(&mut wallet, &currency, fork_parent, 13, 2);

    let (missing_tx, _) = wallet.spend_coinbase(&chain, 2, 0, None);
    let mut tip_block = wallet.build_block(&currency, 15, branch[1].hash(), &[missing_tx]);
    tip_block.header.timestamp += 1;
    branch.push(tip_block);

    assert_eq!(
        chain.add_block(&branch[0], &pool).expect("add"),
        BlockAddResult::AddedAsAlternative
    );
    assert_eq!(
        chain.add_block(&branch[1], &pool).expect("add"),
        BlockAddResult::AddedAsAlternative
    );
    match chain.add_block(&branch[2], &pool).expect("add") {
        BlockAddResult::VerificationFailed(_) => {}
        other => panic!("expected the switch to fail verification, got {other:?}"),
    }

    // Original chain restored intact.
    assert_eq!(chain.tip_height(), 14);
    assert_eq!(chain.tail_hash().expect("tail"), tip_before);
    for height in 13..=14u32 {
        assert!(chain
            .block_by_height(height)
            .expect("read")
            .is_some());
    }
}

#[test]
fn deep_branch_respects_timestamp_plausibility() {
    let (chain, _backend, currency) = regtest_chain();
    let mut wallet = TestWallet::new();
    let pool = TestPool::new();

    grow_chain(&chain, &mut wallet, &currency, &pool, 30);

    // A twelve-block branch with sane timestamps passes the Poisson gate and
    // wins once it outweighs the main chain.
    let fork_parent = chain.block_id_by_height(20).expect("id").expect("set");
    let branch = build_branch(&mut wallet, &currency, fork_parent, 21, 12);
    let mut switched = false;
    for block in &branch {
        match chain.add_block(block, &pool).expect("add") {
            BlockAddResult::SwitchedToAlt => switched = true,
            BlockAddResult::AddedAsAlternative | BlockAddResult::AddedToMain => {}
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert!(switched, "the heavier branch must win");
    assert_eq!(chain.tip_height(), 32);
}

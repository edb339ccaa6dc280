mod common;

use common::*;
use simchain_state::managers::BlockTag;

#[tokio::test]
async fn revert_restores_state_and_discards_blocks() {
    let chain = chain(Default::default()).await;
    let before = chain.balance(BOB, BlockTag::Latest).await.unwrap();

    assert_eq!(chain.snapshot().unwrap(), 1);
    let hash = chain
        .queue_transaction(transfer_to(ALICE, BOB, 5_000), None)
        .await
        .unwrap();
    assert_eq!(chain.block_number().unwrap(), 1);

    assert!(chain.revert(1).await.unwrap());
    assert_eq!(chain.block_number().unwrap(), 0);
    assert_eq!(chain.balance(BOB, BlockTag::Latest).await.unwrap(), before);
    assert_eq!(chain.block_by_number(BlockTag::Number(1)).await.unwrap(), None);
    assert_eq!(chain.transaction_by_hash(hash).await.unwrap(), None);
    assert_eq!(chain.receipt(hash).await.unwrap(), None);

    assert!(!chain.revert(1).await.unwrap());
}

#[tokio::test]
async fn reverting_discards_later_snapshots_and_reuses_ids() {
    let chain = chain(Default::default()).await;
    assert_eq!(chain.snapshot().unwrap(), 1);
    chain
        .queue_transaction(transfer_to(ALICE, BOB, 1), None)
        .await
        .unwrap();
    assert_eq!(chain.snapshot().unwrap(), 2);

    assert!(chain.revert(1).await.unwrap());
    assert!(!chain.revert(2).await.unwrap());
    assert_eq!(chain.snapshot().unwrap(), 1);
    assert!(!chain.revert(0).await.unwrap());
}

#[tokio::test]
async fn chain_keeps_mining_after_a_revert() {
    let chain = chain(Default::default()).await;
    let id = chain.snapshot().unwrap();
    chain
        .queue_transaction(transfer_to(ALICE, BOB, 1), None)
        .await
        .unwrap();
    let discarded = chain.block_by_number(BlockTag::Latest).await.unwrap().unwrap();
    assert!(chain.revert(id).await.unwrap());

    chain
        .queue_transaction(transfer_to(CAROL, BOB, 2), None)
        .await
        .unwrap();
    let latest = chain.block_by_number(BlockTag::Latest).await.unwrap().unwrap();
    assert_eq!(latest.number(), 1);
    assert_ne!(latest.hash(), discarded.hash());
    assert_eq!(chain.nonce(ALICE, BlockTag::Latest).await.unwrap(), 0);
    assert_eq!(chain.nonce(CAROL, BlockTag::Latest).await.unwrap(), 1);
}

#[tokio::test]
async fn revert_drops_queued_transactions() {
    let chain = chain(manual()).await;
    let id = chain.snapshot().unwrap();
    let hash = chain
        .queue_transaction(transfer_to(ALICE, BOB, 1), None)
        .await
        .unwrap();
    assert!(chain.pool().find(hash).is_some());

    assert!(chain.revert(id).await.unwrap());
    assert!(chain.pool().find(hash).is_none());
    assert_eq!(chain.pool().executable_count(), 0);
}

#[tokio::test]
async fn revert_rewinds_the_fixed_clock_and_state_root() {
    use simchain::config::TimeIncrement;

    let config = manual()
        .with_time_increment(TimeIncrement::Fixed(10))
        .with_start_time(1_000);
    let chain = chain(config).await;
    let mined = chain.mine(None, true, None).await.unwrap().remove(0);
    assert_eq!(mined.header.timestamp, 1_010);

    let id = chain.snapshot().unwrap();
    for _ in 0..3 {
        chain
            .queue_transaction(transfer_to(ALICE, BOB, 1), None)
            .await
            .unwrap();
        chain.mine(None, true, None).await.unwrap();
    }
    assert!(chain.revert(id).await.unwrap());

    let next = chain.mine(None, true, None).await.unwrap().remove(0);
    assert_eq!(next.number(), 2);
    assert_eq!(next.header.timestamp, 1_020);
    assert_eq!(next.header.state_root, mined.header.state_root);
    assert_eq!(chain.nonce(ALICE, BlockTag::Latest).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_pauses_are_undone_by_one_resume() {
    let chain = chain(manual()).await;
    let (first, second) = tokio::join!(chain.pause(), chain.pause());
    first.unwrap();
    second.unwrap();

    let id = chain.snapshot().unwrap();
    assert!(chain.revert(id).await.unwrap());
    chain
        .queue_transaction(transfer_to(ALICE, BOB, 1), None)
        .await
        .unwrap();

    chain.resume().unwrap();
    let blocks = chain.mine(None, true, None).await.unwrap();
    assert_eq!(blocks[0].transactions.len(), 1);
}

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use ethereum_types::{Address, U256};
use simchain::blockchain::TransactionLookup;
use simchain::executor::{BlockContext, ExecutionResult, Executor, ExecutorError, StepTracer};
use simchain::txpool::Finality;
use simchain::ChainError;
use simchain_state::managers::BlockTag;
use simchain_state::state_db::StateDb;
use simchain_state::transaction::{Fee, Transaction, TransactionRequest};

fn priced(from: Address, nonce: u64, fee: Fee) -> TransactionRequest {
    TransactionRequest {
        nonce: Some(nonce),
        fee: Some(fee),
        ..transfer_to(from, DAVE, 1)
    }
}

/// Runs [`ToyVm`] for everybody except `sender`, whose transactions either
/// error out or, with `unbalanced`, leave the caller without its checkpoint.
struct Misbehaving {
    sender: Address,
    unbalanced: bool,
}

#[async_trait]
impl Executor for Misbehaving {
    async fn execute(
        &self,
        tx: &Transaction,
        block: &BlockContext,
        state: &mut StateDb,
        tracer: Option<&mut dyn StepTracer>,
    ) -> Result<ExecutionResult, ExecutorError> {
        if tx.from != self.sender {
            return ToyVm.execute(tx, block, state, tracer).await;
        }
        if !self.unbalanced {
            return Err(ExecutorError::Other("machine fault".into()));
        }
        let result = ToyVm.execute(tx, block, state, tracer).await?;
        state.commit()?;
        Ok(result)
    }
}

fn misbehaving(sender: Address, unbalanced: bool) -> Arc<dyn Executor> {
    Arc::new(Misbehaving { sender, unbalanced })
}

#[tokio::test]
async fn block_gas_limit_splits_transactions_across_blocks() {
    let chain = chain(manual().with_block_gas_limit(30_000)).await;
    let price = Fee::Legacy {
        gas_price: 2_000_000_000u64.into(),
    };
    let first = chain
        .queue_transaction(priced(BOB, 0, price), None)
        .await
        .unwrap();
    let second = chain
        .queue_transaction(priced(BOB, 1, price), None)
        .await
        .unwrap();

    let blocks = chain.mine(None, false, None).await.unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].number(), 1);
    assert_eq!(blocks[1].number(), 2);
    assert_eq!(blocks[0].transactions.len(), 1);
    assert_eq!(blocks[1].transactions.len(), 1);
    assert_eq!(blocks[0].transactions[0].hash, first);
    assert_eq!(blocks[1].transactions[0].hash, second);
    assert_eq!(chain.nonce(BOB, BlockTag::Latest).await.unwrap(), 2);
}

#[tokio::test]
async fn higher_effective_price_is_mined_first() {
    let chain = chain(manual()).await;
    let alice = chain
        .queue_transaction(
            priced(ALICE, 0, Fee::Legacy {
                gas_price: 990_000_000u64.into(),
            }),
            None,
        )
        .await
        .unwrap();
    let bob = chain
        .queue_transaction(
            priced(BOB, 0, Fee::Eip1559 {
                max_fee_per_gas: 1_000_000_000u64.into(),
                max_priority_fee_per_gas: 5_630_000u64.into(),
            }),
            None,
        )
        .await
        .unwrap();
    let carol = chain
        .queue_transaction(
            priced(CAROL, 0, Fee::Legacy {
                gas_price: 987_000_000u64.into(),
            }),
            None,
        )
        .await
        .unwrap();

    let blocks = chain.mine(None, true, None).await.unwrap();
    assert_eq!(blocks.len(), 1);
    let block = &blocks[0];
    assert_eq!(block.header.base_fee_per_gas, Some(875_000_000u64.into()));
    let order: Vec<_> = block.transactions.iter().map(|tx| tx.hash).collect();
    assert_eq!(order, vec![alice, carol, bob]);

    let receipt = chain.receipt(bob).await.unwrap().unwrap();
    assert_eq!(receipt.effective_gas_price, U256::from(880_630_000u64));
    assert_eq!(receipt.transaction_index, 2);
}

#[tokio::test]
async fn future_transactions_wait_for_the_nonce_gap() {
    let chain = chain(manual()).await;
    let third = chain
        .queue_transaction(
            TransactionRequest {
                nonce: Some(2),
                ..transfer_to(ALICE, BOB, 1)
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(chain.pool().future_count(), 1);
    assert_eq!(chain.pool().executable_count(), 0);
    assert!(matches!(
        chain.transaction_by_hash(third).await.unwrap(),
        Some(TransactionLookup::Pending(_))
    ));

    let mut hashes = Vec::new();
    for nonce in 0..2 {
        let request = TransactionRequest {
            nonce: Some(nonce),
            ..transfer_to(ALICE, BOB, 1)
        };
        hashes.push(chain.queue_transaction(request, None).await.unwrap());
    }
    hashes.push(third);
    assert_eq!(chain.pool().future_count(), 0);
    assert_eq!(chain.pool().executable_count(), 3);

    let blocks = chain.mine(None, true, None).await.unwrap();
    let mined: Vec<_> = blocks[0].transactions.iter().map(|tx| tx.hash).collect();
    assert_eq!(mined, hashes);
    assert_eq!(
        blocks[0]
            .transactions
            .iter()
            .map(|tx| tx.nonce)
            .collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(matches!(
        chain.transaction_by_hash(third).await.unwrap(),
        Some(TransactionLookup::Mined(record)) if record.index == 2
    ));
}

#[tokio::test]
async fn eager_instamine_returns_after_the_block_is_persisted() {
    let chain = chain(Default::default()).await;
    let before = chain.balance(BOB, BlockTag::Latest).await.unwrap();
    let hash = chain
        .queue_transaction(transfer_to(ALICE, BOB, 1_000), None)
        .await
        .unwrap();

    assert_eq!(chain.block_number().unwrap(), 1);
    let receipt = chain.receipt(hash).await.unwrap().unwrap();
    assert_eq!(receipt.block_number, 1);
    assert_eq!(receipt.gas_used, 21_000);
    assert_eq!(
        chain.balance(BOB, BlockTag::Latest).await.unwrap(),
        before + 1_000
    );
}

#[tokio::test]
async fn mined_blocks_carry_the_touched_storage_keys() {
    let chain = chain(Default::default()).await;
    let contract = deployed(&chain, ALICE, store(5, 1)).await;
    let mut blocks = chain.subscribe_blocks();

    chain
        .queue_transaction(
            TransactionRequest {
                gas_limit: Some(100_000),
                ..transfer_to(BOB, contract, 0)
            },
            None,
        )
        .await
        .unwrap();

    let event = blocks.recv().await.unwrap();
    let slot = ethereum_types::H256::from_low_u64_be(5);
    assert_eq!(event.block.number(), 2);
    assert_eq!(event.storage_keys.len(), 1);
    assert_eq!(event.storage_keys.get(&keccak_hash::keccak(slot)), Some(&slot));
}

#[tokio::test]
async fn pause_keeps_admitting_without_mining() {
    let chain = chain(manual()).await;
    chain.pause().await.unwrap();
    chain
        .queue_transaction(transfer_to(ALICE, BOB, 1), None)
        .await
        .unwrap();
    assert_eq!(chain.pool().executable_count(), 1);
    assert_eq!(chain.block_number().unwrap(), 0);

    chain.resume().unwrap();
    let blocks = chain.mine(None, true, None).await.unwrap();
    assert_eq!(blocks[0].transactions.len(), 1);
    chain.stop().await.unwrap();
    assert!(chain.mine(None, true, None).await.is_err());
}

#[tokio::test]
async fn block_timestamps_follow_the_adjusted_clock() {
    use simchain::config::TimeIncrement;

    let config = manual()
        .with_time_increment(TimeIncrement::Fixed(10))
        .with_start_time(1_000);
    let chain = chain(config).await;
    let timestamp = |blocks: Vec<simchain_state::block::Block>| blocks[0].header.timestamp;

    assert_eq!(timestamp(chain.mine(None, true, None).await.unwrap()), 1_010);
    assert_eq!(chain.increase_time(100), 100);
    assert_eq!(timestamp(chain.mine(None, true, None).await.unwrap()), 1_120);
    assert_eq!(
        timestamp(chain.mine(None, true, Some(5_000)).await.unwrap()),
        5_000
    );
    assert_eq!(timestamp(chain.mine(None, true, None).await.unwrap()), 5_010);
}

#[tokio::test]
async fn execution_errors_reject_the_transaction() {
    let chain = chain_executing(Default::default(), misbehaving(CAROL, false)).await;
    let refused = chain
        .queue_transaction(transfer_to(CAROL, BOB, 1), None)
        .await;
    assert!(matches!(
        refused,
        Err(ChainError::Rejected { reason }) if reason.to_string() == "machine fault"
    ));
    assert_eq!(chain.pool().executable_count(), 0);
    assert_eq!(chain.nonce(CAROL, BlockTag::Latest).await.unwrap(), 0);

    let hash = chain
        .queue_transaction(transfer_to(ALICE, BOB, 1), None)
        .await
        .unwrap();
    assert!(chain.receipt(hash).await.unwrap().is_some());
}

#[tokio::test]
async fn failed_assembly_releases_the_pool() {
    let chain = chain_executing(manual(), misbehaving(CAROL, true)).await;
    let before = chain.balance(ALICE, BlockTag::Latest).await.unwrap();
    let legacy = |gwei: u64| Fee::Legacy {
        gas_price: (gwei * 1_000_000_000).into(),
    };
    let taken = chain
        .queue_transaction(priced(ALICE, 0, legacy(3)), None)
        .await
        .unwrap();
    let stuck = chain
        .queue_transaction(priced(CAROL, 0, legacy(2)), None)
        .await
        .unwrap();
    let taken = chain.pool().find(taken).unwrap();
    let stuck = chain.pool().find(stuck).unwrap();

    assert!(chain.mine(None, true, None).await.is_err());
    assert_eq!(chain.block_number().unwrap(), 0);
    assert!(matches!(taken.finality(), Finality::Rejected(_)));
    assert!(chain.pool().find(taken.hash()).is_none());
    assert!(!stuck.is_locked());
    assert_eq!(chain.pool().executable_count(), 1);
    assert_eq!(chain.balance(ALICE, BlockTag::Latest).await.unwrap(), before);
    assert_eq!(chain.nonce(ALICE, BlockTag::Latest).await.unwrap(), 0);

    // The miner is usable again once the offending transaction is gone.
    chain.pool().reject(&stuck, simchain::txpool::RejectReason::Dropped);
    let blocks = chain.mine(None, true, None).await.unwrap();
    assert_eq!(blocks[0].number(), 1);
    assert!(blocks[0].transactions.is_empty());
}

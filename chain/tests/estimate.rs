mod common;

use common::*;
use ethereum_types::Address;
use simchain::blockchain::StateOverrides;
use simchain::executor::opcode;
use simchain::ChainError;
use simchain_state::managers::BlockTag;
use simchain_state::transaction::TransactionRequest;

fn call_request(to: Address, gas_limit: Option<u64>) -> TransactionRequest {
    TransactionRequest {
        from: ALICE,
        to: Some(to),
        gas_limit,
        ..Default::default()
    }
}

#[tokio::test]
async fn estimate_is_the_smallest_sufficient_gas_limit() {
    let chain = chain(Default::default()).await;
    let leaf = deployed(&chain, ALICE, store(0, 1)).await;
    let middle = deployed(&chain, ALICE, call(leaf)).await;
    let outer = deployed(&chain, ALICE, call(middle)).await;

    let gas = chain
        .estimate_gas(call_request(outer, None), BlockTag::Latest)
        .await
        .unwrap();
    let none = StateOverrides::new();

    let result = chain
        .simulate_transaction(call_request(outer, Some(gas)), BlockTag::Latest, &none)
        .await
        .unwrap();
    assert!(result.gas_used <= gas);

    let starved = chain
        .simulate_transaction(call_request(outer, Some(gas - 1)), BlockTag::Latest, &none)
        .await;
    assert!(matches!(starved, Err(ChainError::CallError { .. })));
}

#[tokio::test]
async fn plain_transfer_needs_intrinsic_gas_only() {
    let chain = chain(Default::default()).await;
    let gas = chain
        .estimate_gas(call_request(DAVE, None), BlockTag::Latest)
        .await
        .unwrap();
    assert_eq!(gas, 21_000);
}

#[tokio::test]
async fn reverting_call_fails_estimation() {
    let chain = chain(Default::default()).await;
    let contract = deployed(&chain, ALICE, vec![opcode::REVERT]).await;
    let estimate = chain
        .estimate_gas(call_request(contract, None), BlockTag::Latest)
        .await;
    assert!(matches!(estimate, Err(ChainError::CallError { .. })));
}

#[tokio::test]
async fn simulation_leaves_no_trace() {
    let chain = chain(Default::default()).await;
    let contract = deployed(&chain, ALICE, store(3, 9)).await;
    let number = chain.block_number().unwrap();

    chain
        .simulate_transaction(
            call_request(contract, Some(100_000)),
            BlockTag::Latest,
            &StateOverrides::new(),
        )
        .await
        .unwrap();
    assert_eq!(chain.block_number().unwrap(), number);
    assert!(chain
        .storage_at(contract, ethereum_types::H256::from_low_u64_be(3), BlockTag::Latest)
        .await
        .unwrap()
        .is_zero());
}

#[tokio::test]
async fn overrides_apply_to_the_simulated_state_only() {
    let chain = chain(Default::default()).await;
    let contract = Address::repeat_byte(0xcc);
    let mut overrides = StateOverrides::new();
    overrides.insert(
        contract,
        simchain::blockchain::AccountOverride {
            code: Some(vec![opcode::REVERT]),
            ..Default::default()
        },
    );

    let result = chain
        .simulate_transaction(call_request(contract, None), BlockTag::Latest, &overrides)
        .await;
    assert!(matches!(result, Err(ChainError::CallError { .. })));
    assert!(chain
        .simulate_transaction(
            call_request(contract, None),
            BlockTag::Latest,
            &StateOverrides::new()
        )
        .await
        .is_ok());
}

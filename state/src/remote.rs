//! Read-only access to the chain being forked.

use std::future::Future;
use std::num::NonZero;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::client::ClientBuilder;
use alloy::rpc::json_rpc::{RequestPacket, ResponsePacket};
use alloy::transports::{RpcError, TransportError};
use anyhow::Context as _;
use async_trait::async_trait;
use ethereum_types::{Address, Bloom, H256, H64, U256, U64};
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use tower::retry::{Policy, Retry};
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use crate::block::{Block, Header};
use crate::receipt::{Log, LogEntry, LogFilter, Receipt, ReceiptRecord};
use crate::transaction::{Fee, Signature, Transaction};

const CACHE_SIZE: usize = 1024;
const MAX_NUMBER_OF_PARALLEL_REQUESTS: usize = 128;

/// A JSON-RPC endpoint of the chain being forked.
#[automock]
#[async_trait]
pub trait RemoteChain: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value>;
}

/// Longest wait between two attempts at a remote request.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Retries requests that failed in transport, doubling the wait after every
/// attempt. Error responses from the remote node are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Duration,
    attempt: u32,
    max_retries: u32,
}

impl RetryPolicy {
    pub const fn new(backoff: Duration, max_retries: u32) -> Self {
        Self {
            backoff,
            attempt: 0,
            max_retries,
        }
    }

    /// Wait before the next attempt.
    pub fn delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

impl Policy<RequestPacket, ResponsePacket, TransportError> for RetryPolicy {
    type Future = Pin<Box<dyn Future<Output = Self> + Send + 'static>>;

    fn retry(
        &self,
        _req: &RequestPacket,
        result: Result<&ResponsePacket, &TransportError>,
    ) -> Option<Self::Future> {
        let err = result.err()?;
        if !matches!(err, RpcError::Transport(_)) || self.attempt >= self.max_retries {
            return None;
        }
        let delay = self.delay();
        warn!(attempt = self.attempt + 1, ?delay, %err, "remote request failed, retrying");
        let next = Self {
            attempt: self.attempt + 1,
            ..self.clone()
        };
        Some(Box::pin(async move {
            tokio::time::sleep(delay).await;
            next
        }))
    }

    fn clone_request(&self, req: &RequestPacket) -> Option<RequestPacket> {
        Some(req.clone())
    }
}

/// Wraps transports in a [`Retry`] under a [`RetryPolicy`].
pub struct RetryLayer(RetryPolicy);

impl RetryLayer {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self(policy)
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService(Retry::new(self.0.clone(), inner))
    }
}

/// A retrying transport. Boxes the response future, as alloy's clients
/// expect of a transport.
#[derive(Clone)]
pub struct RetryService<S>(Retry<RetryPolicy, S>);

impl<S> Service<RequestPacket> for RetryService<S>
where
    S: Service<RequestPacket, Response = ResponsePacket, Error = TransportError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        Box::pin(self.0.call(req))
    }
}

/// [`RemoteChain`] over HTTP, retrying transport failures with a growing
/// backoff.
pub struct HttpRemote {
    provider: RootProvider<RetryService<alloy::transports::http::ReqwestTransport>>,
}

impl HttpRemote {
    pub fn new(rpc_url: url::Url, backoff: u64, max_retries: u32) -> Self {
        let retry = RetryLayer::new(RetryPolicy::new(
            Duration::from_millis(backoff),
            max_retries,
        ));
        let client = ClientBuilder::default().layer(retry).http(rpc_url);
        Self {
            provider: ProviderBuilder::new().on_client(client),
        }
    }
}

#[async_trait]
impl RemoteChain for HttpRemote {
    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        Ok(self
            .provider
            .raw_request::<_, Value>(method.to_owned().into(), params)
            .await?)
    }
}

/// The remote block a fork is frozen at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkPin {
    pub number: u64,
    pub hash: H256,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub base_fee_per_gas: Option<U256>,
    pub chain_id: u64,
}

/// Caching, concurrency-limited client of a [`RemoteChain`] pinned at a
/// [`ForkPin`].
///
/// Every request is made at or before the pin, so responses never change and
/// are cached for the lifetime of the client.
pub struct ForkClient {
    remote: Arc<dyn RemoteChain>,
    semaphore: Semaphore,
    cache: Mutex<lru::LruCache<String, Value>>,
    pin: ForkPin,
}

impl ForkClient {
    /// Pins the fork at `block_number`, or at the remote head when `None`.
    pub async fn connect(
        remote: Arc<dyn RemoteChain>,
        block_number: Option<u64>,
    ) -> anyhow::Result<Self> {
        let number = match block_number {
            Some(number) => number,
            None => {
                let head: U64 = decode(remote.request("eth_blockNumber", json!([])).await?)?;
                head.as_u64()
            }
        };
        let (block, chain_id) = futures::try_join!(
            remote.request("eth_getBlockByNumber", json!([quantity(number), false])),
            remote.request("eth_chainId", json!([])),
        )?;
        let block: RemoteHeader = decode(block)
            .with_context(|| format!("fork block {number} does not exist on the remote chain"))?;
        let chain_id: U64 = decode(chain_id)?;
        let pin = ForkPin {
            number,
            hash: block.hash,
            timestamp: block.timestamp.as_u64(),
            gas_limit: block.gas_limit.as_u64(),
            base_fee_per_gas: block.base_fee_per_gas,
            chain_id: chain_id.as_u64(),
        };
        info!(number, hash = ?pin.hash, chain_id = pin.chain_id, "forked remote chain");
        Ok(Self::with_pin(remote, pin))
    }

    pub fn with_pin(remote: Arc<dyn RemoteChain>, pin: ForkPin) -> Self {
        Self {
            remote,
            semaphore: Semaphore::new(MAX_NUMBER_OF_PARALLEL_REQUESTS),
            cache: Mutex::new(lru::LruCache::new(NonZero::new(CACHE_SIZE).unwrap())),
            pin,
        }
    }

    pub const fn pin(&self) -> &ForkPin {
        &self.pin
    }

    /// The remote block to read for local block `block_number`: the block
    /// itself when it predates the pin, the pin otherwise.
    pub fn remote_block_number(&self, block_number: Option<u64>) -> u64 {
        block_number.map_or(self.pin.number, |n| n.min(self.pin.number))
    }

    pub fn is_before_pin(&self, block_number: u64) -> bool {
        block_number <= self.pin.number
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> anyhow::Result<T> {
        let key = format!("{method}{params}");
        if let Some(hit) = self.cache.lock().await.get(&key).cloned() {
            return decode(hit);
        }
        let response = {
            let _permit = self.semaphore.acquire().await?;
            debug!(method, %params, "remote request");
            self.remote.request(method, params).await?
        };
        self.cache.lock().await.put(key, response.clone());
        decode(response).with_context(|| format!("unexpected {method} response"))
    }

    pub async fn balance(&self, address: Address, block_number: u64) -> anyhow::Result<U256> {
        self.request(
            "eth_getBalance",
            json!([address, quantity(block_number)]),
        )
        .await
    }

    pub async fn nonce(&self, address: Address, block_number: u64) -> anyhow::Result<u64> {
        let nonce: U64 = self
            .request(
                "eth_getTransactionCount",
                json!([address, quantity(block_number)]),
            )
            .await?;
        Ok(nonce.as_u64())
    }

    pub async fn code(&self, address: Address, block_number: u64) -> anyhow::Result<Vec<u8>> {
        let code: HexBytes = self
            .request("eth_getCode", json!([address, quantity(block_number)]))
            .await?;
        Ok(code.0)
    }

    pub async fn storage_at(
        &self,
        address: Address,
        slot: H256,
        block_number: u64,
    ) -> anyhow::Result<H256> {
        self.request(
            "eth_getStorageAt",
            json!([address, slot, quantity(block_number)]),
        )
        .await
    }

    pub async fn block_by_number(&self, number: u64) -> anyhow::Result<Option<Block>> {
        let block: Option<RemoteBlock> = self
            .request("eth_getBlockByNumber", json!([quantity(number), true]))
            .await?;
        Ok(block.map(RemoteBlock::into_block))
    }

    pub async fn block_by_hash(&self, hash: H256) -> anyhow::Result<Option<Block>> {
        let block: Option<RemoteBlock> = self
            .request("eth_getBlockByHash", json!([hash, true]))
            .await?;
        Ok(block
            .filter(|b| self.is_before_pin(b.header.number.as_u64()))
            .map(RemoteBlock::into_block))
    }

    pub async fn transaction(
        &self,
        hash: H256,
    ) -> anyhow::Result<Option<(Transaction, H256, u64, u64)>> {
        let tx: Option<RemoteTransaction> = self
            .request("eth_getTransactionByHash", json!([hash]))
            .await?;
        Ok(tx.and_then(|tx| {
            let block_number = tx.block_number?.as_u64();
            if !self.is_before_pin(block_number) {
                return None;
            }
            let block_hash = tx.block_hash?;
            let index = tx.transaction_index?.as_u64();
            Some((tx.into_transaction(), block_hash, block_number, index))
        }))
    }

    pub async fn receipt(&self, hash: H256) -> anyhow::Result<Option<ReceiptRecord>> {
        let receipt: Option<RemoteReceipt> = self
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        Ok(receipt
            .filter(|r| self.is_before_pin(r.block_number.as_u64()))
            .map(RemoteReceipt::into_record))
    }

    /// Logs of `from..=to`, clamped to the pin.
    pub async fn logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> anyhow::Result<Vec<LogEntry>> {
        let to = to.min(self.pin.number);
        if from > to {
            return Ok(Vec::new());
        }
        let topics: Vec<Value> = filter
            .topics
            .iter()
            .map(|t| match t {
                None => Value::Null,
                Some(options) => json!(options),
            })
            .collect();
        let logs: Vec<RemoteLog> = self
            .request(
                "eth_getLogs",
                json!([{
                    "fromBlock": quantity(from),
                    "toBlock": quantity(to),
                    "address": filter.addresses,
                    "topics": topics,
                }]),
            )
            .await?;
        Ok(logs.into_iter().map(RemoteLog::into_entry).collect())
    }
}

fn quantity(n: u64) -> String {
    format!("{n:#x}")
}

fn decode<T: DeserializeOwned>(value: Value) -> anyhow::Result<T> {
    Ok(serde_json::from_value(value)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
struct HexBytes(#[serde(with = "crate::serde_hex")] Vec<u8>);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteHeader {
    number: U64,
    hash: H256,
    parent_hash: H256,
    #[serde(default)]
    sha3_uncles: Option<H256>,
    miner: Address,
    state_root: H256,
    transactions_root: H256,
    receipts_root: H256,
    logs_bloom: Bloom,
    #[serde(default)]
    difficulty: U256,
    gas_limit: U64,
    gas_used: U64,
    timestamp: U64,
    #[serde(default)]
    extra_data: Option<HexBytes>,
    #[serde(default)]
    mix_hash: Option<H256>,
    #[serde(default)]
    nonce: Option<H64>,
    #[serde(default)]
    base_fee_per_gas: Option<U256>,
}

impl RemoteHeader {
    fn into_header(self) -> Header {
        Header {
            parent_hash: self.parent_hash,
            ommers_hash: self.sha3_uncles.unwrap_or(simchain_common::EMPTY_OMMERS_HASH),
            coinbase: self.miner,
            state_root: self.state_root,
            transactions_root: self.transactions_root,
            receipts_root: self.receipts_root,
            logs_bloom: self.logs_bloom,
            difficulty: self.difficulty,
            number: self.number.as_u64(),
            gas_limit: self.gas_limit.as_u64(),
            gas_used: self.gas_used.as_u64(),
            timestamp: self.timestamp.as_u64(),
            extra_data: self.extra_data.map(|b| b.0).unwrap_or_default(),
            mix_hash: self.mix_hash.unwrap_or_default(),
            nonce: self.nonce.unwrap_or_default(),
            base_fee_per_gas: self.base_fee_per_gas,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteBlock {
    #[serde(flatten)]
    header: RemoteHeader,
    #[serde(default)]
    transactions: Vec<RemoteTransaction>,
}

impl RemoteBlock {
    fn into_block(self) -> Block {
        let hash = self.header.hash;
        let transactions = self
            .transactions
            .into_iter()
            .map(RemoteTransaction::into_transaction)
            .collect();
        Block::with_hash(self.header.into_header(), transactions, hash)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteTransaction {
    hash: H256,
    nonce: U64,
    from: Address,
    to: Option<Address>,
    value: U256,
    gas: U64,
    #[serde(default)]
    gas_price: Option<U256>,
    #[serde(default)]
    max_fee_per_gas: Option<U256>,
    #[serde(default)]
    max_priority_fee_per_gas: Option<U256>,
    input: HexBytes,
    #[serde(default)]
    v: U64,
    #[serde(default)]
    r: U256,
    #[serde(default)]
    s: U256,
    #[serde(default)]
    chain_id: Option<U64>,
    #[serde(default)]
    block_hash: Option<H256>,
    #[serde(default)]
    block_number: Option<U64>,
    #[serde(default)]
    transaction_index: Option<U64>,
}

impl RemoteTransaction {
    fn into_transaction(self) -> Transaction {
        let fee = match (self.max_fee_per_gas, self.max_priority_fee_per_gas) {
            (Some(max_fee_per_gas), Some(max_priority_fee_per_gas)) => Fee::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            },
            _ => Fee::Legacy {
                gas_price: self.gas_price.unwrap_or_default(),
            },
        };
        Transaction {
            from: self.from,
            nonce: self.nonce.as_u64(),
            fee,
            gas_limit: self.gas.as_u64(),
            to: self.to,
            value: self.value,
            data: self.input.0,
            chain_id: self.chain_id.map_or(0, |c| c.as_u64()),
            signature: Signature {
                v: self.v.as_u64(),
                r: self.r,
                s: self.s,
            },
            hash: self.hash,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteReceipt {
    transaction_hash: H256,
    transaction_index: U64,
    block_hash: H256,
    block_number: U64,
    from: Address,
    to: Option<Address>,
    cumulative_gas_used: U64,
    gas_used: U64,
    contract_address: Option<Address>,
    logs: Vec<RemoteLog>,
    #[serde(default)]
    status: Option<U64>,
    #[serde(default)]
    effective_gas_price: Option<U256>,
    #[serde(default, rename = "type")]
    tx_type: Option<U64>,
}

impl RemoteReceipt {
    fn into_record(self) -> ReceiptRecord {
        let logs = self.logs.into_iter().map(|l| l.into_entry().log).collect();
        ReceiptRecord {
            receipt: Receipt::new(
                self.tx_type.map_or(0, |t| t.as_u64() as u8),
                self.status.map_or(true, |s| !s.is_zero()),
                self.cumulative_gas_used.as_u64(),
                logs,
            ),
            transaction_hash: self.transaction_hash,
            transaction_index: self.transaction_index.as_u64(),
            block_hash: self.block_hash,
            block_number: self.block_number.as_u64(),
            from: self.from,
            to: self.to,
            gas_used: self.gas_used.as_u64(),
            effective_gas_price: self.effective_gas_price.unwrap_or_default(),
            contract_address: self.contract_address,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteLog {
    address: Address,
    topics: Vec<H256>,
    data: HexBytes,
    #[serde(default)]
    block_hash: Option<H256>,
    #[serde(default)]
    block_number: Option<U64>,
    #[serde(default)]
    transaction_hash: Option<H256>,
    #[serde(default)]
    transaction_index: Option<U64>,
    #[serde(default)]
    log_index: Option<U64>,
    #[serde(default)]
    removed: bool,
}

impl RemoteLog {
    fn into_entry(self) -> LogEntry {
        LogEntry {
            log: Log {
                address: self.address,
                topics: self.topics,
                data: self.data.0,
            },
            block_hash: self.block_hash.unwrap_or_default(),
            block_number: self.block_number.map_or(0, |n| n.as_u64()),
            transaction_hash: self.transaction_hash.unwrap_or_default(),
            transaction_index: self.transaction_index.map_or(0, |n| n.as_u64()),
            log_index: self.log_index.map_or(0, |n| n.as_u64()),
            removed: self.removed,
        }
    }
}

//! JSON-RPC chain clients with multi-URL support and automatic failover

use super::{ChainClient, InfoClient};
use crate::config::ChainConfig;
use crate::error::{TransferError, TransferResult};
use crate::tx::SignedTx;
use crate::types::{
    amount_serde, Address, Amount, AssetDescription, AssetId, ChainId, TxId, TxStatus, Utxo,
    UtxoId,
};

use async_trait::async_trait;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Page size requested from `getUTXOs`
const UTXO_PAGE_LIMIT: u32 = 1024;

/// Set of HTTP endpoints for one API, failing over on transport errors
pub struct RpcEndpoint {
    /// Label used in errors and metrics
    chain: String,
    providers: Vec<Provider<Http>>,
    current: AtomicUsize,
}

impl RpcEndpoint {
    pub fn new(chain: &str, urls: &[String]) -> TransferResult<Self> {
        let mut providers = Vec::new();

        for url in urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    providers.push(provider);
                    debug!("Added RPC endpoint for chain {}: {}", chain, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if providers.is_empty() {
            return Err(TransferError::Config(format!(
                "No valid RPC endpoints for chain {}",
                chain
            )));
        }

        Ok(Self {
            chain: chain.to_string(),
            providers,
            current: AtomicUsize::new(0),
        })
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    fn active(&self) -> &Provider<Http> {
        let idx = self.current.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    /// Switch to the next endpoint
    fn failover(&self) {
        if self.providers.len() < 2 {
            return;
        }
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current.store(next, Ordering::Relaxed);
        crate::metrics::record_rpc_failover(&self.chain);
        warn!("Chain {} failover to endpoint {}", self.chain, next);
    }

    /// Issue a call, trying each endpoint once.
    ///
    /// An error response from a node ends the call immediately as `Node`,
    /// and a reply that does not decode as `MalformedReply`. Only
    /// connection-level failures move on to the next endpoint.
    pub async fn call<P, R>(&self, method: &str, params: P) -> TransferResult<R>
    where
        P: Serialize + Debug + Clone + Send + Sync,
        R: Serialize + DeserializeOwned + Debug + Send,
    {
        let mut last_error = String::from("no endpoint attempted");

        for _ in 0..self.providers.len() {
            match self.active().request::<P, R>(method, params.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e) => match classify(&e) {
                    CallFailure::Node(message) => {
                        return Err(TransferError::Node {
                            chain: self.chain.clone(),
                            message: format!("{}: {}", method, message),
                        });
                    }
                    CallFailure::Malformed(message) => {
                        return Err(TransferError::MalformedReply {
                            chain: self.chain.clone(),
                            message: format!("{}: {}", method, message),
                        });
                    }
                    CallFailure::Transport(message) => {
                        warn!("{} on chain {} failed: {}", method, self.chain, message);
                        last_error = message;
                        self.failover();
                    }
                },
            }
        }

        Err(TransferError::Transport {
            chain: self.chain.clone(),
            message: format!("{}: all endpoints failed, last error: {}", method, last_error),
        })
    }
}

#[derive(Debug, PartialEq)]
enum CallFailure {
    /// JSON-RPC error object returned by the node
    Node(String),
    Malformed(String),
    Transport(String),
}

fn classify(error: &ProviderError) -> CallFailure {
    if let Some(response) = error.as_error_response() {
        return CallFailure::Node(response.message.clone());
    }
    if let Some(serde_error) = error.as_serde_error() {
        return CallFailure::Malformed(serde_error.to_string());
    }
    CallFailure::Transport(error.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UtxoIndex {
    address: String,
    utxo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetUtxosReply {
    #[serde(with = "u32_string")]
    num_fetched: u32,
    utxos: Vec<Utxo>,
    end_index: Option<UtxoIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BalanceReply {
    #[serde(with = "amount_serde")]
    balance: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxFeeReply {
    #[serde(with = "amount_serde")]
    tx_fee: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TxIdReply {
    #[serde(rename = "txID")]
    tx_id: TxId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TxStatusReply {
    status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockchainIdReply {
    #[serde(rename = "blockchainID")]
    blockchain_id: ChainId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetworkIdReply {
    #[serde(rename = "networkID", with = "u32_string")]
    network_id: u32,
}

/// Only an error object from the node means the asset is unknown
fn asset_lookup_error(chain: &str, symbol: &str, error: TransferError) -> TransferError {
    match error {
        TransferError::Node { .. } => TransferError::AssetNotFound {
            chain: chain.to_string(),
            symbol: symbol.to_string(),
        },
        other => other,
    }
}

/// Chain API client speaking `<namespace>.*` JSON-RPC methods
pub struct RpcChainClient {
    endpoint: RpcEndpoint,
    namespace: String,
}

impl RpcChainClient {
    pub fn new(config: &ChainConfig) -> TransferResult<Self> {
        Ok(Self {
            endpoint: RpcEndpoint::new(&config.alias, &config.rpc_urls)?,
            namespace: config.api_namespace.clone(),
        })
    }

    fn method(&self, name: &str) -> String {
        format!("{}.{}", self.namespace, name)
    }

    fn chain(&self) -> &str {
        self.endpoint.chain()
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn asset_description(&self, symbol: &str) -> TransferResult<AssetDescription> {
        let params = json!({ "assetID": symbol });
        match self
            .endpoint
            .call::<_, AssetDescription>(&self.method("getAssetDescription"), params)
            .await
        {
            Ok(description) => Ok(description),
            Err(e) => Err(asset_lookup_error(self.chain(), symbol, e)),
        }
    }

    async fn utxos(
        &self,
        addresses: &[Address],
        source_chain: Option<ChainId>,
    ) -> TransferResult<Vec<Utxo>> {
        let method = self.method("getUTXOs");
        let mut collected: BTreeMap<UtxoId, Utxo> = BTreeMap::new();
        let mut start_index: Option<UtxoIndex> = None;

        loop {
            let mut params = json!({
                "addresses": addresses,
                "limit": UTXO_PAGE_LIMIT,
                "encoding": "json",
            });
            if let Some(source) = &source_chain {
                params["sourceChain"] = Value::String(source.to_string());
            }
            if let Some(index) = &start_index {
                params["startIndex"] = json!(index);
            }

            let page: GetUtxosReply = self.endpoint.call(&method, params).await?;
            debug!(
                "Fetched {} UTXOs page from chain {}",
                page.num_fetched,
                self.chain()
            );

            for utxo in page.utxos {
                collected.insert(utxo.id.clone(), utxo);
            }

            if page.num_fetched < UTXO_PAGE_LIMIT {
                break;
            }
            match page.end_index {
                Some(index) => start_index = Some(index),
                None => break,
            }
        }

        Ok(collected.into_values().collect())
    }

    async fn balance(&self, address: &Address, asset_id: &AssetId) -> TransferResult<Amount> {
        let params = json!({ "address": address, "assetID": asset_id });
        let reply: BalanceReply = self
            .endpoint
            .call(&self.method("getBalance"), params)
            .await?;
        Ok(reply.balance)
    }

    async fn tx_fee(&self) -> TransferResult<Amount> {
        let reply: TxFeeReply = self
            .endpoint
            .call(&self.method("getTxFee"), json!({}))
            .await?;
        Ok(reply.tx_fee)
    }

    async fn issue_tx(&self, tx: &SignedTx) -> TransferResult<TxId> {
        let params = json!({ "tx": tx.to_hex()?, "encoding": "hex" });
        match self
            .endpoint
            .call::<_, TxIdReply>(&self.method("issueTx"), params)
            .await
        {
            Ok(reply) => Ok(reply.tx_id),
            Err(TransferError::Node { chain, message }) => {
                Err(TransferError::Submission { chain, message })
            }
            Err(e) => Err(e),
        }
    }

    async fn tx_status(&self, tx_id: &TxId) -> TransferResult<TxStatus> {
        let params = json!({ "txID": tx_id });
        let reply: TxStatusReply = self
            .endpoint
            .call(&self.method("getTxStatus"), params)
            .await?;
        Ok(TxStatus::parse(&reply.status))
    }
}

/// Client for the node's `info.*` API
pub struct RpcInfoClient {
    endpoint: RpcEndpoint,
}

impl RpcInfoClient {
    pub fn new(urls: &[String]) -> TransferResult<Self> {
        Ok(Self {
            endpoint: RpcEndpoint::new("info", urls)?,
        })
    }
}

#[async_trait]
impl InfoClient for RpcInfoClient {
    async fn blockchain_id(&self, alias: &str) -> TransferResult<ChainId> {
        let params = json!({ "alias": alias });
        match self
            .endpoint
            .call::<_, BlockchainIdReply>("info.getBlockchainID", params)
            .await
        {
            Ok(reply) => Ok(reply.blockchain_id),
            Err(TransferError::Node { .. }) => Err(TransferError::UnknownChain {
                alias: alias.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn network_id(&self) -> TransferResult<u32> {
        let reply: NetworkIdReply = self.endpoint.call("info.getNetworkID", json!({})).await?;
        Ok(reply.network_id)
    }
}

/// Integers the node reports as decimal strings
pub(crate) mod u32_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Str(String),
            Num(u32),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Num(n) => Ok(n),
        }
    }
}

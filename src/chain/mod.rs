//! Chain module - clients for every ledger the transfer touches
//!
//! This module provides:
//! - The `ChainClient` / `InfoClient` / `PlatformClient` seams
//! - JSON-RPC implementations with multi-URL failover
//! - A registry resolving chain aliases to clients and blockchain IDs
//! - An in-process ledger for local runs and tests

pub mod memory;
pub mod platform;
pub mod rpc;

pub use memory::MemoryLedger;
pub use platform::{PlatformClient, RpcPlatformClient, Subnet, Validator};
pub use rpc::{RpcChainClient, RpcEndpoint, RpcInfoClient};

use crate::config::Settings;
use crate::error::{TransferError, TransferResult};
use crate::tx::SignedTx;
use crate::types::{Address, Amount, AssetDescription, AssetId, ChainId, TxId, TxStatus, Utxo};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Operations the transfer core needs from one chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Look up an asset by symbol
    async fn asset_description(&self, symbol: &str) -> TransferResult<AssetDescription>;

    /// Unspent outputs owned by `addresses`; with `source_chain`, only atomic
    /// outputs exported from that chain
    async fn utxos(
        &self,
        addresses: &[Address],
        source_chain: Option<ChainId>,
    ) -> TransferResult<Vec<Utxo>>;

    async fn balance(&self, address: &Address, asset_id: &AssetId) -> TransferResult<Amount>;

    /// Flat fee charged per transaction
    async fn tx_fee(&self) -> TransferResult<Amount>;

    async fn issue_tx(&self, tx: &SignedTx) -> TransferResult<TxId>;

    async fn tx_status(&self, tx_id: &TxId) -> TransferResult<TxStatus>;
}

/// Network-level lookups
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InfoClient: Send + Sync {
    /// Real blockchain ID for a chain alias
    async fn blockchain_id(&self, alias: &str) -> TransferResult<ChainId>;

    async fn network_id(&self) -> TransferResult<u32>;
}

struct ChainEntry {
    client: Arc<dyn ChainClient>,
    fee_asset: String,
}

/// Registry of chain clients indexed by alias
pub struct ChainManager {
    info: Arc<dyn InfoClient>,
    chains: DashMap<String, ChainEntry>,
    /// Alias -> blockchain ID, append-only
    chain_ids: DashMap<String, ChainId>,
    network_id: OnceCell<u32>,
}

impl ChainManager {
    pub fn new(info: Arc<dyn InfoClient>) -> Self {
        Self {
            info,
            chains: DashMap::new(),
            chain_ids: DashMap::new(),
            network_id: OnceCell::new(),
        }
    }

    /// Build JSON-RPC clients for every enabled chain
    pub fn from_settings(settings: &Settings) -> TransferResult<Self> {
        let info = RpcInfoClient::new(&settings.network.info_urls)?;
        let manager = Self::new(Arc::new(info));

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (alias {}, namespace {})",
                name, chain_config.alias, chain_config.api_namespace
            );
            let client = RpcChainClient::new(chain_config)?;
            manager.register(&chain_config.alias, Arc::new(client), &chain_config.fee_asset);
        }

        Ok(manager)
    }

    pub fn register(&self, alias: &str, client: Arc<dyn ChainClient>, fee_asset: &str) {
        self.chains.insert(
            alias.to_string(),
            ChainEntry {
                client,
                fee_asset: fee_asset.to_string(),
            },
        );
    }

    /// Client for a chain alias
    pub fn client(&self, alias: &str) -> TransferResult<Arc<dyn ChainClient>> {
        self.chains
            .get(alias)
            .map(|e| e.client.clone())
            .ok_or_else(|| TransferError::UnknownChain {
                alias: alias.to_string(),
            })
    }

    /// Symbol of the asset fees are paid in on a chain
    pub fn fee_asset(&self, alias: &str) -> TransferResult<String> {
        self.chains
            .get(alias)
            .map(|e| e.fee_asset.clone())
            .ok_or_else(|| TransferError::UnknownChain {
                alias: alias.to_string(),
            })
    }

    /// Resolve an alias to its registered blockchain ID
    pub async fn blockchain_id(&self, alias: &str) -> TransferResult<ChainId> {
        if let Some(id) = self.chain_ids.get(alias) {
            return Ok(id.clone());
        }

        let id = self.info.blockchain_id(alias).await?;
        debug!("Chain alias {} resolved to {}", alias, id);
        self.chain_ids.insert(alias.to_string(), id.clone());
        Ok(id)
    }

    pub async fn network_id(&self) -> TransferResult<u32> {
        self.network_id
            .get_or_try_init(|| self.info.network_id())
            .await
            .copied()
    }

    pub fn info(&self) -> Arc<dyn InfoClient> {
        self.info.clone()
    }

    /// Registered aliases, sorted
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.chains.iter().map(|e| e.key().clone()).collect();
        aliases.sort();
        aliases
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let mut results = Vec::new();

        for alias in self.aliases() {
            let healthy = match self.client(&alias) {
                Ok(client) => client.tx_fee().await.is_ok(),
                Err(_) => false,
            };
            crate::metrics::record_chain_health(&alias, healthy);
            results.push((alias, healthy));
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blockchain_id_is_cached() {
        let mut info = MockInfoClient::new();
        info.expect_blockchain_id()
            .times(1)
            .returning(|alias| Ok(ChainId::new(format!("{}-chain-id", alias))));

        let manager = ChainManager::new(Arc::new(info));
        assert_eq!(manager.blockchain_id("C").await.unwrap(), ChainId::from("C-chain-id"));
        assert_eq!(manager.blockchain_id("C").await.unwrap(), ChainId::from("C-chain-id"));
    }

    #[tokio::test]
    async fn test_unknown_alias() {
        let mut info = MockInfoClient::new();
        info.expect_blockchain_id().returning(|alias| {
            Err(TransferError::UnknownChain {
                alias: alias.to_string(),
            })
        });

        let manager = ChainManager::new(Arc::new(info));
        assert!(matches!(
            manager.blockchain_id("Q").await,
            Err(TransferError::UnknownChain { .. })
        ));
        assert!(matches!(
            manager.client("Q"),
            Err(TransferError::UnknownChain { .. })
        ));
    }

    #[tokio::test]
    async fn test_health_check_reports_each_chain() {
        let mut healthy = MockChainClient::new();
        healthy.expect_tx_fee().returning(|| Ok(Amount::from(1u64)));
        let mut broken = MockChainClient::new();
        broken.expect_tx_fee().returning(|| {
            Err(TransferError::Transport {
                chain: "C".into(),
                message: "down".into(),
            })
        });

        let manager = ChainManager::new(Arc::new(MockInfoClient::new()));
        manager.register("X", Arc::new(healthy), "AVAX");
        manager.register("C", Arc::new(broken), "AVAX");

        let report = manager.health_check().await;
        assert_eq!(
            report,
            vec![("C".to_string(), false), ("X".to_string(), true)]
        );
    }
}

//! In-process multi-chain UTXO ledger
//!
//! Used for local runs and tests. Every issued transaction is checked for
//! valid signatures, unspent inputs, value conservation, a registered export
//! destination and a matching import source. Acceptance latency and the
//! delay before exported outputs become visible on the destination chain are
//! configurable.

use super::{ChainClient, ChainManager, InfoClient};
use crate::error::{TransferError, TransferResult};
use crate::keychain::recover_signer;
use crate::tx::{SignedTx, TxKind};
use crate::types::{
    Address, Amount, AssetDescription, AssetId, ChainId, OutputOwners, TxId, TxStatus, Utxo,
    UtxoId,
};

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub const LOCAL_NETWORK_ID: u32 = 12345;
pub const X_CHAIN_ID: &str = "2oYMBNV4eNHyqk2fjjV5nVQLDbtmNJzq5s3qs3Lo6ftnC6FByM";
pub const C_CHAIN_ID: &str = "2q9e4r6Mu3U68nU1fYjgbR6JvwrRx36CohpAX5UQxse55x1Q5";
pub const AVAX_ASSET_ID: &str = "FvwEAhmxKfeiG8SnEvq42hc6whRyY3EFYAvebMqDNDGCgxN5Z";

/// Shared handle to the ledger; clones see the same state
#[derive(Clone)]
pub struct MemoryLedger {
    network_id: u32,
    state: Arc<Mutex<LedgerState>>,
}

#[derive(Default)]
struct LedgerState {
    chains: HashMap<String, ChainState>,
    /// Destination polls an accepted export stays invisible for
    propagation_polls: u32,
    never_propagate: bool,
    genesis_counter: u32,
}

struct ChainState {
    blockchain_id: ChainId,
    fee: Amount,
    fee_asset: String,
    assets: HashMap<String, AssetDescription>,
    utxos: BTreeMap<UtxoId, Utxo>,
    /// Outputs exported to this chain, waiting to be imported
    atomic: BTreeMap<UtxoId, AtomicEntry>,
    txs: HashMap<TxId, TxRecord>,
    processing_polls: u32,
    reject_next: bool,
    issued: usize,
}

struct AtomicEntry {
    utxo: Utxo,
    source_chain: ChainId,
    source_alias: String,
    export_tx: TxId,
    hidden_polls: u32,
}

struct TxRecord {
    pending_polls: u32,
    outcome: TxStatus,
}

impl MemoryLedger {
    pub fn new(network_id: u32) -> Self {
        Self {
            network_id,
            state: Arc::new(Mutex::new(LedgerState::default())),
        }
    }

    /// X and C chains sharing AVAX, each charging `fee` per transaction
    pub async fn local(fee: Amount) -> Self {
        let ledger = Self::new(LOCAL_NETWORK_ID);
        let avax = AssetDescription {
            asset_id: AssetId::from(AVAX_ASSET_ID),
            name: "Avalanche".to_string(),
            symbol: "AVAX".to_string(),
            denomination: 9,
        };

        for (alias, id) in [("X", X_CHAIN_ID), ("C", C_CHAIN_ID)] {
            ledger.add_chain(alias, ChainId::from(id), fee, "AVAX").await;
            ledger.register_asset(alias, avax.clone()).await;
        }

        ledger
    }

    pub async fn add_chain(&self, alias: &str, blockchain_id: ChainId, fee: Amount, fee_asset: &str) {
        let mut state = self.state.lock().await;
        state.chains.insert(
            alias.to_string(),
            ChainState {
                blockchain_id,
                fee,
                fee_asset: fee_asset.to_string(),
                assets: HashMap::new(),
                utxos: BTreeMap::new(),
                atomic: BTreeMap::new(),
                txs: HashMap::new(),
                processing_polls: 0,
                reject_next: false,
                issued: 0,
            },
        );
    }

    pub async fn register_asset(&self, alias: &str, description: AssetDescription) {
        let mut state = self.state.lock().await;
        if let Some(chain) = state.chains.get_mut(alias) {
            chain.assets.insert(description.symbol.clone(), description);
        }
    }

    /// Create a genesis UTXO owned by `owner`
    pub async fn fund(
        &self,
        alias: &str,
        owner: &Address,
        asset_id: &AssetId,
        amount: Amount,
    ) -> TransferResult<UtxoId> {
        let mut state = self.state.lock().await;
        state.genesis_counter += 1;
        let id = UtxoId::new(TxId::new(format!("genesis-{}", state.genesis_counter)), 0);

        let chain = state.chain_mut(alias)?;
        chain.utxos.insert(
            id.clone(),
            Utxo {
                id: id.clone(),
                asset_id: asset_id.clone(),
                amount,
                owners: OutputOwners::new(&[owner.clone()]),
            },
        );
        Ok(id)
    }

    /// Status polls a transaction reports `Processing` before its outcome
    pub async fn set_processing_polls(&self, alias: &str, polls: u32) {
        let mut state = self.state.lock().await;
        if let Some(chain) = state.chains.get_mut(alias) {
            chain.processing_polls = polls;
        }
    }

    pub async fn set_propagation_polls(&self, polls: u32) {
        self.state.lock().await.propagation_polls = polls;
    }

    /// Withhold exported outputs from destination chains until turned off
    pub async fn set_never_propagate(&self, never: bool) {
        self.state.lock().await.never_propagate = never;
    }

    /// The next valid transaction issued on `alias` ends up `Rejected`
    pub async fn reject_next(&self, alias: &str) {
        let mut state = self.state.lock().await;
        if let Some(chain) = state.chains.get_mut(alias) {
            chain.reject_next = true;
        }
    }

    /// Number of `issue_tx` calls received by a chain, replays included
    pub async fn issued_count(&self, alias: &str) -> usize {
        let state = self.state.lock().await;
        state.chains.get(alias).map(|c| c.issued).unwrap_or(0)
    }

    pub fn client(&self, alias: &str) -> MemoryChainClient {
        MemoryChainClient {
            alias: alias.to_string(),
            network_id: self.network_id,
            state: self.state.clone(),
        }
    }

    /// Registry over every chain of this ledger
    pub async fn manager(&self) -> ChainManager {
        let manager = ChainManager::new(Arc::new(self.clone()));
        let state = self.state.lock().await;
        for (alias, chain) in &state.chains {
            manager.register(alias, Arc::new(self.client(alias)), &chain.fee_asset);
        }
        manager
    }
}

#[async_trait]
impl InfoClient for MemoryLedger {
    async fn blockchain_id(&self, alias: &str) -> TransferResult<ChainId> {
        let state = self.state.lock().await;
        state
            .chains
            .get(alias)
            .map(|c| c.blockchain_id.clone())
            .ok_or_else(|| TransferError::UnknownChain {
                alias: alias.to_string(),
            })
    }

    async fn network_id(&self) -> TransferResult<u32> {
        Ok(self.network_id)
    }
}

impl LedgerState {
    fn chain(&self, alias: &str) -> TransferResult<&ChainState> {
        self.chains.get(alias).ok_or_else(|| TransferError::UnknownChain {
            alias: alias.to_string(),
        })
    }

    fn chain_mut(&mut self, alias: &str) -> TransferResult<&mut ChainState> {
        self.chains
            .get_mut(alias)
            .ok_or_else(|| TransferError::UnknownChain {
                alias: alias.to_string(),
            })
    }

    fn alias_of(&self, blockchain_id: &ChainId) -> Option<String> {
        self.chains
            .iter()
            .find(|(_, c)| &c.blockchain_id == blockchain_id)
            .map(|(alias, _)| alias.clone())
    }

    fn export_accepted(&self, source_alias: &str, export_tx: &TxId) -> bool {
        self.chains
            .get(source_alias)
            .and_then(|c| c.txs.get(export_tx))
            .map(|r| r.pending_polls == 0 && r.outcome == TxStatus::Accepted)
            .unwrap_or(false)
    }

    fn atomic_visible(&self, entry: &AtomicEntry) -> bool {
        !self.never_propagate
            && entry.hidden_polls == 0
            && self.export_accepted(&entry.source_alias, &entry.export_tx)
    }

    fn issue(&mut self, alias: &str, network_id: u32, tx: &SignedTx) -> TransferResult<TxId> {
        let tx_id = tx.id()?;

        let chain = self.chain_mut(alias)?;
        chain.issued += 1;
        if let Some(record) = chain.txs.get(&tx_id) {
            if record.outcome != TxStatus::Rejected {
                debug!("Replay of tx {} on chain {}", tx_id, alias);
                return Ok(tx_id);
            }
        }

        self.validate(alias, network_id, tx)
            .map_err(|message| TransferError::Submission {
                chain: alias.to_string(),
                message,
            })?;

        let chain = self.chain_mut(alias)?;
        if std::mem::take(&mut chain.reject_next) {
            let pending_polls = chain.processing_polls;
            chain.txs.insert(
                tx_id.clone(),
                TxRecord {
                    pending_polls,
                    outcome: TxStatus::Rejected,
                },
            );
            return Ok(tx_id);
        }

        self.apply(alias, &tx_id, tx)?;
        Ok(tx_id)
    }

    fn validate(&self, alias: &str, network_id: u32, tx: &SignedTx) -> Result<(), String> {
        let chain = self.chain(alias).map_err(|e| e.to_string())?;
        let unsigned = &tx.unsigned;

        if unsigned.network_id != network_id {
            return Err(format!("wrong network id {}", unsigned.network_id));
        }
        if unsigned.blockchain_id != chain.blockchain_id {
            return Err(format!("wrong blockchain id {}", unsigned.blockchain_id));
        }

        let source_chain = match &unsigned.kind {
            TxKind::Base => None,
            TxKind::Export {
                destination_chain,
                exported_outputs,
            } => {
                let destination = self
                    .alias_of(destination_chain)
                    .ok_or_else(|| format!("unknown destination chain {}", destination_chain))?;
                if destination == alias {
                    return Err("export destination is the issuing chain".to_string());
                }
                if exported_outputs.is_empty() {
                    return Err("export has no exported outputs".to_string());
                }
                None
            }
            TxKind::Import { source_chain, .. } => {
                let source = self
                    .alias_of(source_chain)
                    .ok_or_else(|| format!("unknown source chain {}", source_chain))?;
                if source == alias {
                    return Err("import source is the issuing chain".to_string());
                }
                Some(source_chain)
            }
        };

        let inputs: Vec<_> = unsigned.all_inputs().collect();
        if inputs.is_empty() {
            return Err("transaction has no inputs".to_string());
        }
        if inputs.len() != tx.credentials.len() {
            return Err(format!(
                "{} inputs but {} credentials",
                inputs.len(),
                tx.credentials.len()
            ));
        }

        let digest = unsigned.digest().map_err(|e| e.to_string())?;
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let local_count = unsigned.inputs.len();
        let mut seen = BTreeSet::new();

        for (index, (input, credential)) in inputs.iter().zip(&tx.credentials).enumerate() {
            if !seen.insert(&input.utxo_id) {
                return Err(format!("input {} spent twice", input.utxo_id));
            }

            let utxo = if index < local_count {
                chain
                    .utxos
                    .get(&input.utxo_id)
                    .ok_or_else(|| format!("input {} is spent or unknown", input.utxo_id))?
            } else {
                let entry = chain
                    .atomic
                    .get(&input.utxo_id)
                    .ok_or_else(|| format!("atomic input {} is spent or unknown", input.utxo_id))?;
                if Some(&entry.source_chain) != source_chain {
                    return Err(format!(
                        "atomic input {} was exported by {}, not the import source",
                        input.utxo_id, entry.source_chain
                    ));
                }
                if !self.atomic_visible(entry) {
                    return Err(format!("atomic input {} is not available yet", input.utxo_id));
                }
                &entry.utxo
            };

            if utxo.asset_id != input.asset_id || utxo.amount != input.amount {
                return Err(format!("input {} does not match its UTXO", input.utxo_id));
            }

            let signatures = credential.raw_signatures().map_err(|e| e.to_string())?;
            if signatures.len() != input.signers.len() {
                return Err(format!("input {} has wrong signature count", input.utxo_id));
            }
            for (signer, signature) in input.signers.iter().zip(&signatures) {
                let recovered =
                    recover_signer(alias, digest, signature).map_err(|e| e.to_string())?;
                if &recovered != signer {
                    return Err(format!("invalid signature for {}", signer));
                }
            }
            if utxo.owners.signers_among(&input.signers, now).is_none() {
                return Err(format!("spend condition of {} not met", input.utxo_id));
            }
        }

        if unsigned.all_outputs().any(|o| o.amount.is_zero()) {
            return Err("zero-value output".to_string());
        }

        let fee_asset_id = chain
            .assets
            .get(&chain.fee_asset)
            .map(|a| a.asset_id.clone())
            .ok_or_else(|| format!("fee asset {} not registered", chain.fee_asset))?;

        for asset_id in unsigned.assets() {
            if unsigned.produced(&asset_id) > unsigned.consumed(&asset_id) {
                return Err(format!("asset {} produced exceeds consumed", asset_id));
            }
            if asset_id != fee_asset_id && !unsigned.burned(&asset_id).is_zero() {
                return Err(format!("asset {} burned without being the fee asset", asset_id));
            }
        }
        if unsigned.burned(&fee_asset_id) < chain.fee {
            return Err(format!(
                "fee {} below required {}",
                unsigned.burned(&fee_asset_id),
                chain.fee
            ));
        }

        Ok(())
    }

    fn apply(&mut self, alias: &str, tx_id: &TxId, tx: &SignedTx) -> TransferResult<()> {
        let unsigned = &tx.unsigned;
        let propagation_polls = self.propagation_polls;
        let destination = match &unsigned.kind {
            TxKind::Export {
                destination_chain, ..
            } => self.alias_of(destination_chain),
            _ => None,
        };

        let chain = self.chain_mut(alias)?;
        let source_chain = chain.blockchain_id.clone();

        for input in &unsigned.inputs {
            chain.utxos.remove(&input.utxo_id);
        }
        if let TxKind::Import {
            imported_inputs, ..
        } = &unsigned.kind
        {
            for input in imported_inputs {
                chain.atomic.remove(&input.utxo_id);
            }
        }
        for (index, output) in unsigned.outputs.iter().enumerate() {
            let id = UtxoId::new(tx_id.clone(), index as u32);
            chain.utxos.insert(
                id.clone(),
                Utxo {
                    id,
                    asset_id: output.asset_id.clone(),
                    amount: output.amount,
                    owners: output.owners.clone(),
                },
            );
        }
        let pending_polls = chain.processing_polls;
        chain.txs.insert(
            tx_id.clone(),
            TxRecord {
                pending_polls,
                outcome: TxStatus::Accepted,
            },
        );

        if let (
            TxKind::Export {
                exported_outputs, ..
            },
            Some(destination),
        ) = (&unsigned.kind, destination)
        {
            let offset = unsigned.outputs.len();
            let target = self.chain_mut(&destination)?;
            for (index, output) in exported_outputs.iter().enumerate() {
                let id = UtxoId::new(tx_id.clone(), (offset + index) as u32);
                target.atomic.insert(
                    id.clone(),
                    AtomicEntry {
                        utxo: Utxo {
                            id,
                            asset_id: output.asset_id.clone(),
                            amount: output.amount,
                            owners: output.owners.clone(),
                        },
                        source_chain: source_chain.clone(),
                        source_alias: alias.to_string(),
                        export_tx: tx_id.clone(),
                        hidden_polls: propagation_polls,
                    },
                );
            }
        }

        Ok(())
    }

    fn atomic_utxos(
        &mut self,
        alias: &str,
        addresses: &[Address],
        source_chain: &ChainId,
    ) -> TransferResult<Vec<Utxo>> {
        if self.alias_of(source_chain).is_none() {
            return Err(TransferError::Node {
                chain: alias.to_string(),
                message: format!("unknown source chain {}", source_chain),
            });
        }

        let accepted: Vec<UtxoId> = self
            .chain(alias)?
            .atomic
            .iter()
            .filter(|(_, e)| &e.source_chain == source_chain && e.utxo.owners.includes_any(addresses))
            .filter(|(_, e)| self.export_accepted(&e.source_alias, &e.export_tx))
            .map(|(id, _)| id.clone())
            .collect();

        if self.never_propagate {
            return Ok(Vec::new());
        }

        let chain = self.chain_mut(alias)?;
        let mut visible = Vec::new();
        for id in accepted {
            if let Some(entry) = chain.atomic.get_mut(&id) {
                if entry.hidden_polls > 0 {
                    entry.hidden_polls -= 1;
                } else {
                    visible.push(entry.utxo.clone());
                }
            }
        }
        Ok(visible)
    }
}

/// `ChainClient` view of one chain of a [`MemoryLedger`]
pub struct MemoryChainClient {
    alias: String,
    network_id: u32,
    state: Arc<Mutex<LedgerState>>,
}

#[async_trait]
impl ChainClient for MemoryChainClient {
    async fn asset_description(&self, symbol: &str) -> TransferResult<AssetDescription> {
        let state = self.state.lock().await;
        let chain = state.chain(&self.alias)?;
        chain
            .assets
            .get(symbol)
            .or_else(|| chain.assets.values().find(|a| a.asset_id.as_str() == symbol))
            .cloned()
            .ok_or_else(|| TransferError::AssetNotFound {
                chain: self.alias.clone(),
                symbol: symbol.to_string(),
            })
    }

    async fn utxos(
        &self,
        addresses: &[Address],
        source_chain: Option<ChainId>,
    ) -> TransferResult<Vec<Utxo>> {
        let mut state = self.state.lock().await;
        match source_chain {
            Some(source) => state.atomic_utxos(&self.alias, addresses, &source),
            None => Ok(state
                .chain(&self.alias)?
                .utxos
                .values()
                .filter(|u| u.owners.includes_any(addresses))
                .cloned()
                .collect()),
        }
    }

    async fn balance(&self, address: &Address, asset_id: &AssetId) -> TransferResult<Amount> {
        let state = self.state.lock().await;
        let owner = std::slice::from_ref(address);
        Ok(state
            .chain(&self.alias)?
            .utxos
            .values()
            .filter(|u| &u.asset_id == asset_id && u.owners.includes_any(owner))
            .fold(Amount::zero(), |acc, u| acc + u.amount))
    }

    async fn tx_fee(&self) -> TransferResult<Amount> {
        let state = self.state.lock().await;
        Ok(state.chain(&self.alias)?.fee)
    }

    async fn issue_tx(&self, tx: &SignedTx) -> TransferResult<TxId> {
        let mut state = self.state.lock().await;
        state.issue(&self.alias, self.network_id, tx)
    }

    async fn tx_status(&self, tx_id: &TxId) -> TransferResult<TxStatus> {
        let mut state = self.state.lock().await;
        let chain = state.chain_mut(&self.alias)?;
        Ok(match chain.txs.get_mut(tx_id) {
            None => TxStatus::Unknown,
            Some(record) if record.pending_polls > 0 => {
                record.pending_polls -= 1;
                TxStatus::Processing
            }
            Some(record) => record.outcome,
        })
    }
}

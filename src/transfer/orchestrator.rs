//! Cross-chain transfer orchestrator
//!
//! Drives a transfer through export on the source chain, propagation to the
//! destination chain, and import there. The record is checkpointed after
//! every phase so a failed or interrupted transfer can resume without
//! exporting twice.

use super::locks::BuildLocks;
use super::state::{Leg, Phase, TransferRecord};
use crate::asset::AssetResolver;
use crate::cancel::CancelSignal;
use crate::chain::{ChainClient, ChainManager};
use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResult};
use crate::keychain::KeyChain;
use crate::state::CheckpointStore;
use crate::tx::{sign, BuildContext, SpendParams, TransactionSubmitter, TxBuilder, UnsignedTx};
use crate::types::{Address, Amount, AssetId, ChainId, TxId, Utxo};
use crate::utxo::UtxoFetcher;

use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What to move, from where, to where
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub source_chain: String,
    pub destination_chain: String,
    pub asset_symbol: String,
    pub amount: Amount,
    /// Receiver on the destination chain; the first destination key if unset
    pub recipient: Option<Address>,
    pub memo: Option<String>,
}

/// Keychains for both legs. Signing never mutates them, so they are shared
/// freely across concurrent transfers.
#[derive(Debug, Clone)]
pub struct TransferParties {
    pub source_keys: Arc<KeyChain>,
    pub destination_keys: Arc<KeyChain>,
}

/// Completed transfer
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub id: Uuid,
    pub export_tx_id: Option<TxId>,
    pub import_tx_id: Option<TxId>,
    pub exported: Amount,
    /// Value credited to the recipient after the import fee
    pub received: Amount,
    pub record: TransferRecord,
}

impl TransferReceipt {
    fn from_record(record: TransferRecord) -> Self {
        Self {
            id: record.id,
            export_tx_id: record.export_tx_id.clone(),
            import_tx_id: record.import_tx_id.clone(),
            exported: record.amount,
            received: record.received.unwrap_or_default(),
            record,
        }
    }
}

/// Failed transfer with the progress made before the failure
#[derive(Debug, Error)]
#[error("transfer {} failed in {leg} leg at {phase_reached}: {cause}", .record.id)]
pub struct TransferFailure {
    pub leg: Leg,
    pub phase_reached: Phase,
    pub export_tx_id: Option<TxId>,
    pub import_tx_id: Option<TxId>,
    #[source]
    pub cause: TransferError,
    pub record: Box<TransferRecord>,
}

impl TransferFailure {
    pub fn is_resumable(&self) -> bool {
        self.record.is_resumable()
    }
}

pub type TransferOutcome = Result<TransferReceipt, TransferFailure>;

/// State carried between phases of one run, never persisted
#[derive(Default)]
struct Scratch {
    unsigned: Option<UnsignedTx>,
    source_guard: Option<OwnedMutexGuard<()>>,
}

pub struct TransferOrchestrator {
    pub(super) chains: Arc<ChainManager>,
    pub(super) resolver: AssetResolver,
    pub(super) fetcher: UtxoFetcher,
    pub(super) submitter: TransactionSubmitter,
    pub(super) locks: BuildLocks,
    checkpoints: Arc<dyn CheckpointStore>,
    config: TransferConfig,
}

impl TransferOrchestrator {
    pub fn new(
        chains: Arc<ChainManager>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: TransferConfig,
    ) -> Self {
        Self {
            chains,
            resolver: AssetResolver::new(),
            fetcher: UtxoFetcher::from_config(&config),
            submitter: TransactionSubmitter::from_config(&config),
            locks: BuildLocks::new(),
            checkpoints,
            config,
        }
    }

    pub fn chains(&self) -> &Arc<ChainManager> {
        &self.chains
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Run a new transfer to completion
    pub async fn start(
        &self,
        request: TransferRequest,
        parties: &TransferParties,
        cancel: CancelSignal,
    ) -> TransferOutcome {
        let memo = request.memo.clone().or_else(|| self.config.memo.clone());
        let record = TransferRecord::new(
            &request.source_chain,
            &request.destination_chain,
            &request.asset_symbol,
            request.amount,
            request.recipient.clone(),
            memo,
        );

        info!(
            "Starting transfer {}: {} {} from chain {} to chain {}",
            record.id, record.amount, record.asset_symbol, record.source_chain, record.destination_chain
        );
        crate::metrics::record_transfer_started(&record.source_chain, &record.destination_chain);

        if let Err(e) = self.checkpoints.save(&record).await {
            return Err(self.fail(record, e).await);
        }
        self.drive(record, parties, cancel).await
    }

    /// Load a checkpointed transfer
    pub async fn load(&self, id: Uuid) -> TransferResult<TransferRecord> {
        self.checkpoints
            .load(id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound { id: id.to_string() })
    }

    /// Continue a stored transfer from the last safe phase
    pub async fn resume(
        &self,
        mut record: TransferRecord,
        parties: &TransferParties,
        cancel: CancelSignal,
    ) -> TransferOutcome {
        let was = record.phase;
        match record.reopen() {
            Ok(phase) => info!("Resuming transfer {} at {} (was {})", record.id, phase, was),
            Err(cause) => {
                warn!("Transfer {} cannot be resumed from {}", record.id, was);
                return Err(TransferFailure {
                    leg: was.leg(),
                    phase_reached: record
                        .failure
                        .as_ref()
                        .map(|f| f.phase_reached)
                        .unwrap_or(was),
                    export_tx_id: record.export_tx_id.clone(),
                    import_tx_id: record.import_tx_id.clone(),
                    cause,
                    record: Box::new(record),
                });
            }
        }

        self.checkpoint(&record).await;
        self.drive(record, parties, cancel).await
    }

    /// Import the outputs of an export issued earlier, without exporting again
    pub async fn resume_from_export(
        &self,
        request: TransferRequest,
        export_tx_id: TxId,
        parties: &TransferParties,
        cancel: CancelSignal,
    ) -> TransferOutcome {
        let mut record = TransferRecord::new(
            &request.source_chain,
            &request.destination_chain,
            &request.asset_symbol,
            request.amount,
            request.recipient.clone(),
            request.memo.clone().or_else(|| self.config.memo.clone()),
        );
        record.export_tx_id = Some(export_tx_id);
        record.phase = Phase::ExportSubmitted;

        info!(
            "Resuming from export {} as transfer {}",
            record.export_tx_id.as_ref().map(|t| t.as_str()).unwrap_or_default(),
            record.id
        );

        if let Err(e) = self.checkpoints.save(&record).await {
            return Err(self.fail(record, e).await);
        }
        self.drive(record, parties, cancel).await
    }

    /// Run independent transfers concurrently.
    ///
    /// Transfers spending from the same address set take turns building
    /// and submitting their exports.
    pub async fn run_many(
        &self,
        jobs: Vec<(TransferRequest, TransferParties)>,
        cancel: &CancelSignal,
    ) -> Vec<TransferOutcome> {
        join_all(
            jobs.iter()
                .map(|(request, parties)| self.start(request.clone(), parties, cancel.clone())),
        )
        .await
    }

    async fn drive(
        &self,
        mut record: TransferRecord,
        parties: &TransferParties,
        mut cancel: CancelSignal,
    ) -> TransferOutcome {
        let started = Instant::now();
        let mut scratch = Scratch::default();

        while record.phase != Phase::Done {
            let from = record.phase;
            if let Err(cause) = self.step(&mut record, &mut scratch, parties, &mut cancel).await {
                drop(scratch);
                return Err(self.fail(record, cause).await);
            }
            debug!("Transfer {}: {} -> {}", record.id, from, record.phase);
            self.checkpoint(&record).await;
        }

        info!(
            "Transfer {} done: export {}, import {}, received {}",
            record.id,
            record.export_tx_id.as_ref().map(|t| t.as_str()).unwrap_or("-"),
            record.import_tx_id.as_ref().map(|t| t.as_str()).unwrap_or("-"),
            record.received.unwrap_or_default()
        );
        crate::metrics::record_transfer_completed(
            &record.source_chain,
            &record.destination_chain,
            started.elapsed().as_secs_f64(),
        );

        Ok(TransferReceipt::from_record(record))
    }

    async fn step(
        &self,
        record: &mut TransferRecord,
        scratch: &mut Scratch,
        parties: &TransferParties,
        cancel: &mut CancelSignal,
    ) -> TransferResult<()> {
        match record.phase {
            Phase::Init => {
                self.check_parties(record, parties)?;
                let (source, ctx) = self.build_context(&record.source_chain).await?;
                let asset_id = self
                    .resolver
                    .resolve(&record.source_chain, source.as_ref(), &record.asset_symbol)
                    .await?;
                self.check_destination(record, &asset_id).await?;
                let destination_id = self.chains.blockchain_id(&record.destination_chain).await?;

                let importer = first_address(&parties.destination_keys)?;
                if record.recipient.is_none() {
                    record.recipient = Some(importer.clone());
                }

                let from = parties.source_keys.addresses();
                scratch.source_guard = Some(self.locks.acquire(&record.source_chain, &from).await);
                let utxos = self
                    .fetcher
                    .fetch(&record.source_chain, source.as_ref(), &from, None)
                    .await?;

                let params = SpendParams {
                    amount: record.amount,
                    asset_id: asset_id.clone(),
                    to: vec![importer],
                    from: from.clone(),
                    change: vec![first_address(&parties.source_keys)?],
                    memo: memo_bytes(record),
                };
                scratch.unsigned = Some(TxBuilder::new(ctx).build_export(
                    &utxos,
                    &params,
                    &destination_id,
                )?);
                record.asset_id = Some(asset_id);
                record.advance(Phase::ExportBuilding)
            }

            Phase::ExportBuilding => {
                let unsigned = scratch
                    .unsigned
                    .take()
                    .ok_or_else(|| TransferError::Internal("export was not built".to_string()))?;
                record.export_payload = Some(sign(&unsigned, &parties.source_keys)?);
                record.advance(Phase::ExportSigned)
            }

            Phase::ExportSigned => {
                if scratch.source_guard.is_none() {
                    let from = parties.source_keys.addresses();
                    scratch.source_guard =
                        Some(self.locks.acquire(&record.source_chain, &from).await);
                }
                let payload = record
                    .export_payload
                    .as_ref()
                    .ok_or_else(|| TransferError::Internal("export was not signed".to_string()))?;
                let client = self.chains.client(&record.source_chain)?;
                let tx_id = self
                    .submitter
                    .submit(client.as_ref(), &record.source_chain, payload)
                    .await?;

                info!(
                    "Transfer {}: export {} submitted on chain {}",
                    record.id, tx_id, record.source_chain
                );
                record.export_tx_id = Some(tx_id);
                record.advance(Phase::ExportSubmitted)
            }

            Phase::ExportSubmitted => {
                let tx_id = record.export_tx_id.clone().ok_or_else(|| {
                    TransferError::Internal("export id missing after submission".to_string())
                })?;
                let client = self.chains.client(&record.source_chain)?;
                self.submitter
                    .await_final(client.as_ref(), &record.source_chain, &tx_id, cancel)
                    .await?;
                scratch.source_guard = None;
                record.advance(Phase::AwaitingPropagation)
            }

            Phase::AwaitingPropagation => {
                let export_tx_id = record.export_tx_id.clone().ok_or_else(|| {
                    TransferError::Internal("export id missing before import".to_string())
                })?;
                let (destination, ctx) = self.build_context(&record.destination_chain).await?;
                let source_id = self.chains.blockchain_id(&record.source_chain).await?;
                let owners = parties.destination_keys.addresses();

                let utxos = self
                    .await_propagation(
                        &record.destination_chain,
                        destination.as_ref(),
                        &owners,
                        &source_id,
                        &export_tx_id,
                        cancel,
                    )
                    .await?;

                let asset_id = match record.asset_id.clone() {
                    Some(asset_id) => asset_id,
                    None => {
                        // Asset IDs are chain-global
                        self.resolver
                            .resolve(
                                &record.destination_chain,
                                destination.as_ref(),
                                &record.asset_symbol,
                            )
                            .await?
                    }
                };
                let imported = utxos
                    .iter()
                    .filter(|u| u.asset_id == asset_id)
                    .fold(Amount::zero(), |acc, u| acc.saturating_add(u.amount));
                let deliver = if asset_id == ctx.fee_asset_id {
                    imported.saturating_sub(ctx.fee)
                } else {
                    imported
                };

                let recipient = match record.recipient.clone() {
                    Some(recipient) => recipient,
                    None => first_address(&parties.destination_keys)?,
                };
                let params = SpendParams {
                    amount: deliver,
                    asset_id: asset_id.clone(),
                    to: vec![recipient.clone()],
                    from: owners.clone(),
                    change: vec![first_address(&parties.destination_keys)?],
                    memo: memo_bytes(record),
                };
                scratch.unsigned =
                    Some(TxBuilder::new(ctx).build_import(&utxos, &params, &source_id)?);
                record.asset_id = Some(asset_id);
                record.recipient = Some(recipient);
                record.advance(Phase::ImportBuilding)
            }

            Phase::ImportBuilding => {
                let unsigned = scratch
                    .unsigned
                    .take()
                    .ok_or_else(|| TransferError::Internal("import was not built".to_string()))?;
                record.import_payload = Some(sign(&unsigned, &parties.destination_keys)?);
                record.advance(Phase::ImportSigned)
            }

            Phase::ImportSigned => {
                let payload = record
                    .import_payload
                    .as_ref()
                    .ok_or_else(|| TransferError::Internal("import was not signed".to_string()))?;
                let client = self.chains.client(&record.destination_chain)?;
                let tx_id = self
                    .submitter
                    .submit(client.as_ref(), &record.destination_chain, payload)
                    .await?;

                info!(
                    "Transfer {}: import {} submitted on chain {}",
                    record.id, tx_id, record.destination_chain
                );
                record.import_tx_id = Some(tx_id);
                record.advance(Phase::ImportSubmitted)
            }

            Phase::ImportSubmitted => {
                let tx_id = record.import_tx_id.clone().ok_or_else(|| {
                    TransferError::Internal("import id missing after submission".to_string())
                })?;
                let client = self.chains.client(&record.destination_chain)?;
                self.submitter
                    .await_final(client.as_ref(), &record.destination_chain, &tx_id, cancel)
                    .await?;

                record.received = record.import_payload.as_ref().and_then(|payload| {
                    let asset_id = record.asset_id.as_ref()?;
                    let recipient = record.recipient.as_ref()?;
                    Some(
                        payload
                            .unsigned
                            .outputs
                            .iter()
                            .filter(|o| &o.asset_id == asset_id)
                            .filter(|o| o.owners.addresses.contains(recipient))
                            .fold(Amount::zero(), |acc, o| acc.saturating_add(o.amount)),
                    )
                });
                record.advance(Phase::Done)
            }

            terminal => Err(TransferError::InvalidStateTransition {
                from: terminal.to_string(),
                to: "next".to_string(),
            }),
        }
    }

    /// Poll the destination chain until this export's outputs are visible.
    ///
    /// Only outputs created by `export_tx_id` are returned, so concurrent
    /// transfers into the same addresses never import each other's funds.
    async fn await_propagation(
        &self,
        chain: &str,
        client: &dyn ChainClient,
        owners: &[Address],
        source_chain: &ChainId,
        export_tx_id: &TxId,
        cancel: &mut CancelSignal,
    ) -> TransferResult<Vec<Utxo>> {
        let policy = &self.config.propagation_poll;

        for attempt in 0..policy.max_attempts {
            let utxos: Vec<Utxo> = self
                .fetcher
                .fetch(chain, client, owners, Some(source_chain))
                .await?
                .into_iter()
                .filter(|u| &u.id.tx_id == export_tx_id)
                .collect();

            if !utxos.is_empty() {
                info!(
                    "Export {} visible on chain {} after {} polls",
                    export_tx_id,
                    chain,
                    attempt + 1
                );
                crate::metrics::record_propagation_attempts(chain, attempt + 1);
                return Ok(utxos);
            }

            debug!(
                "Export {} not yet visible on chain {} (poll {}/{})",
                export_tx_id,
                chain,
                attempt + 1,
                policy.max_attempts
            );
            if attempt + 1 < policy.max_attempts {
                cancel.sleep(policy.delay(attempt)).await?;
            }
        }

        Err(TransferError::PropagationTimeout {
            export_tx_id: export_tx_id.clone(),
            attempts: policy.max_attempts,
        })
    }

    /// Client and build parameters for a chain
    pub(super) async fn build_context(
        &self,
        alias: &str,
    ) -> TransferResult<(Arc<dyn ChainClient>, BuildContext)> {
        let client = self.chains.client(alias)?;
        let fee_symbol = self.chains.fee_asset(alias)?;
        let fee_asset_id = self
            .resolver
            .resolve(alias, client.as_ref(), &fee_symbol)
            .await?;

        let ctx = BuildContext {
            network_id: self.chains.network_id().await?,
            blockchain_id: self.chains.blockchain_id(alias).await?,
            fee: client.tx_fee().await?,
            fee_asset_id,
            as_of: chrono::Utc::now().timestamp().max(0) as u64,
        };
        Ok((client, ctx))
    }

    fn check_parties(&self, record: &TransferRecord, parties: &TransferParties) -> TransferResult<()> {
        if record.source_chain == record.destination_chain {
            return Err(TransferError::InvalidRequest(
                "source and destination chains must differ".to_string(),
            ));
        }
        if record.amount.is_zero() {
            return Err(TransferError::InvalidRequest("amount must be positive".to_string()));
        }
        for (keys, chain) in [
            (&parties.source_keys, &record.source_chain),
            (&parties.destination_keys, &record.destination_chain),
        ] {
            if keys.alias() != chain {
                return Err(TransferError::InvalidRequest(format!(
                    "keychain for chain {} used on chain {}",
                    keys.alias(),
                    chain
                )));
            }
        }
        Ok(())
    }

    /// The import fee is paid from the transferred value, so only the
    /// destination fee asset can cross, and it must cover that fee.
    async fn check_destination(&self, record: &TransferRecord, asset_id: &AssetId) -> TransferResult<()> {
        let destination = self.chains.client(&record.destination_chain)?;
        let fee_symbol = self.chains.fee_asset(&record.destination_chain)?;
        let fee_asset_id = self
            .resolver
            .resolve(&record.destination_chain, destination.as_ref(), &fee_symbol)
            .await?;
        if &fee_asset_id != asset_id {
            return Err(TransferError::InvalidRequest(format!(
                "chain {} pays import fees in {}, cannot import {}",
                record.destination_chain, fee_symbol, record.asset_symbol
            )));
        }

        let fee = destination.tx_fee().await?;
        if record.amount <= fee {
            return Err(TransferError::InvalidRequest(format!(
                "amount {} does not cover the import fee {}",
                record.amount, fee
            )));
        }
        Ok(())
    }

    async fn checkpoint(&self, record: &TransferRecord) {
        if let Err(e) = self.checkpoints.save(record).await {
            warn!(
                "Failed to checkpoint transfer {} at {}: {}",
                record.id, record.phase, e
            );
        }
    }

    async fn fail(&self, mut record: TransferRecord, cause: TransferError) -> TransferFailure {
        let phase_reached = record.phase;
        let leg = record.fail(&cause);

        match &record.export_tx_id {
            Some(export) => error!(
                "Transfer {} failed in {} leg at {} (export tx {}, resumable: {}): {}",
                record.id,
                leg,
                phase_reached,
                export,
                record.is_resumable(),
                cause
            ),
            None => error!(
                "Transfer {} failed in {} leg at {}: {}",
                record.id, leg, phase_reached, cause
            ),
        }
        crate::metrics::record_transfer_failed(leg.as_str(), cause.kind());
        self.checkpoint(&record).await;

        TransferFailure {
            leg,
            phase_reached,
            export_tx_id: record.export_tx_id.clone(),
            import_tx_id: record.import_tx_id.clone(),
            cause,
            record: Box::new(record),
        }
    }
}

fn first_address(keys: &KeyChain) -> TransferResult<Address> {
    keys.addresses().into_iter().next().ok_or_else(|| {
        TransferError::InvalidRequest(format!("keychain for chain {} has no keys", keys.alias()))
    })
}

fn memo_bytes(record: &TransferRecord) -> Vec<u8> {
    record
        .memo
        .as_deref()
        .map(|m| m.as_bytes().to_vec())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use crate::chain::memory::{MemoryLedger, AVAX_ASSET_ID};
    use crate::config::PollConfig;
    use crate::keychain::keychains_for;
    use crate::state::{MemoryCheckpointStore, MockCheckpointStore};
    use std::time::Duration;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const FEE: u64 = 1_000_000;
    const FUNDED: u64 = 100_000_000;

    struct Harness {
        ledger: MemoryLedger,
        orchestrator: TransferOrchestrator,
        parties: TransferParties,
        store: Arc<MemoryCheckpointStore>,
    }

    impl Harness {
        async fn balance(&self, alias: &str) -> Amount {
            let keys = if alias == "X" {
                &self.parties.source_keys
            } else {
                &self.parties.destination_keys
            };
            self.ledger
                .client(alias)
                .balance(&keys.addresses()[0], &AssetId::from(AVAX_ASSET_ID))
                .await
                .unwrap()
        }
    }

    fn poll(interval_ms: u64, max_attempts: u32) -> PollConfig {
        PollConfig {
            interval_ms,
            max_interval_ms: interval_ms,
            backoff_factor: 1,
            max_attempts,
        }
    }

    fn config() -> TransferConfig {
        TransferConfig {
            status_poll: poll(10, 5),
            propagation_poll: poll(10, 5),
            max_retries: 1,
            retry_delay_ms: 10,
            memo: None,
        }
    }

    async fn harness(config: TransferConfig) -> Harness {
        let ledger = MemoryLedger::local(Amount::from(FEE)).await;
        let mut keys = keychains_for(&["X", "C"], KEY).unwrap().into_iter();
        let source_keys = Arc::new(keys.next().unwrap());
        let destination_keys = Arc::new(keys.next().unwrap());

        ledger
            .fund(
                "X",
                &source_keys.addresses()[0],
                &AssetId::from(AVAX_ASSET_ID),
                Amount::from(FUNDED),
            )
            .await
            .unwrap();

        let store = Arc::new(MemoryCheckpointStore::new());
        let orchestrator =
            TransferOrchestrator::new(Arc::new(ledger.manager().await), store.clone(), config);

        Harness {
            ledger,
            orchestrator,
            parties: TransferParties {
                source_keys,
                destination_keys,
            },
            store,
        }
    }

    fn request(amount: u64) -> TransferRequest {
        TransferRequest {
            source_chain: "X".to_string(),
            destination_chain: "C".to_string(),
            asset_symbol: "AVAX".to_string(),
            amount: Amount::from(amount),
            recipient: None,
            memo: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_then_import() {
        let h = harness(config()).await;

        let receipt = h
            .orchestrator
            .start(request(50_000_000), &h.parties, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(receipt.received, Amount::from(50_000_000 - FEE));
        assert_eq!(h.balance("C").await, Amount::from(50_000_000 - FEE));
        assert_eq!(h.balance("X").await, Amount::from(FUNDED - 50_000_000 - FEE));
        assert_eq!(h.ledger.issued_count("X").await, 1);
        assert_eq!(h.ledger.issued_count("C").await, 1);

        let stored = h.store.load(receipt.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, Phase::Done);
        assert_eq!(stored.export_tx_id, receipt.export_tx_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_acceptance_and_propagation() {
        let h = harness(config()).await;
        h.ledger.set_processing_polls("X", 2).await;
        h.ledger.set_processing_polls("C", 2).await;
        h.ledger.set_propagation_polls(3).await;

        let receipt = h
            .orchestrator
            .start(request(50_000_000), &h.parties, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(receipt.received, Amount::from(50_000_000 - FEE));
        assert_eq!(h.ledger.issued_count("X").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_propagation_timeout_resumes_without_reexport() {
        let h = harness(config()).await;
        h.ledger.set_never_propagate(true).await;

        let failure = h
            .orchestrator
            .start(request(50_000_000), &h.parties, CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(failure.leg, Leg::Import);
        assert_eq!(failure.phase_reached, Phase::AwaitingPropagation);
        assert!(matches!(failure.cause, TransferError::PropagationTimeout { .. }));
        assert!(failure.export_tx_id.is_some());
        assert!(failure.is_resumable());

        let stored = h.store.load(failure.record.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, Phase::ImportFailed);

        h.ledger.set_never_propagate(false).await;
        let receipt = h
            .orchestrator
            .resume(stored, &h.parties, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(receipt.export_tx_id, failure.export_tx_id);
        assert_eq!(h.ledger.issued_count("X").await, 1);
        assert_eq!(h.balance("C").await, Amount::from(50_000_000 - FEE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_from_bare_export_id() {
        let h = harness(config()).await;
        h.ledger.set_never_propagate(true).await;

        let failure = h
            .orchestrator
            .start(request(50_000_000), &h.parties, CancelSignal::never())
            .await
            .unwrap_err();
        let export_tx_id = failure.export_tx_id.clone().unwrap();

        h.ledger.set_never_propagate(false).await;
        let receipt = h
            .orchestrator
            .resume_from_export(
                request(50_000_000),
                export_tx_id.clone(),
                &h.parties,
                CancelSignal::never(),
            )
            .await
            .unwrap();

        assert_eq!(receipt.export_tx_id, Some(export_tx_id));
        assert_ne!(receipt.id, failure.record.id);
        assert_eq!(h.ledger.issued_count("X").await, 1);
        assert_eq!(h.balance("C").await, Amount::from(50_000_000 - FEE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_awaiting_propagation_reports_export() {
        let mut config = config();
        config.propagation_poll = poll(60_000, 10);
        let h = harness(config).await;
        h.ledger.set_never_propagate(true).await;

        let (handle, signal) = cancellation();
        let (outcome, _) = tokio::join!(
            h.orchestrator.start(request(50_000_000), &h.parties, signal),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                handle.cancel();
            }
        );

        let failure = outcome.unwrap_err();
        assert!(matches!(failure.cause, TransferError::Cancelled));
        assert_eq!(failure.leg, Leg::Import);
        assert!(failure.export_tx_id.is_some());
        assert!(failure.is_resumable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_import_is_rebuilt_on_resume() {
        let h = harness(config()).await;
        h.ledger.reject_next("C").await;

        let failure = h
            .orchestrator
            .start(request(50_000_000), &h.parties, CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(failure.leg, Leg::Import);
        assert!(matches!(failure.cause, TransferError::Rejected { .. }));
        assert!(failure.import_tx_id.is_some());
        assert_eq!(h.balance("C").await, Amount::zero());

        let receipt = h
            .orchestrator
            .resume(*failure.record, &h.parties, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(receipt.received, Amount::from(50_000_000 - FEE));
        assert_eq!(h.ledger.issued_count("X").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_export_is_final() {
        let h = harness(config()).await;
        h.ledger.reject_next("X").await;

        let failure = h
            .orchestrator
            .start(request(50_000_000), &h.parties, CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(failure.leg, Leg::Export);
        assert!(matches!(failure.cause, TransferError::Rejected { .. }));
        assert!(!failure.is_resumable());

        let refused = h
            .orchestrator
            .resume(*failure.record, &h.parties, CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(
            refused.cause,
            TransferError::InvalidStateTransition { .. }
        ));
        assert_eq!(h.ledger.issued_count("X").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_funds_fails_export_without_submitting() {
        let h = harness(config()).await;

        let failure = h
            .orchestrator
            .start(request(FUNDED), &h.parties, CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(failure.leg, Leg::Export);
        assert_eq!(failure.phase_reached, Phase::Init);
        assert!(matches!(failure.cause, TransferError::InsufficientFunds { .. }));
        assert!(failure.export_tx_id.is_none());
        assert!(!failure.is_resumable());
        assert_eq!(h.ledger.issued_count("X").await, 0);
        assert_eq!(h.balance("X").await, Amount::from(FUNDED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_destination_chain() {
        let h = harness(config()).await;
        let mut request = request(50_000_000);
        request.destination_chain = "Q".to_string();
        let parties = TransferParties {
            source_keys: h.parties.source_keys.clone(),
            destination_keys: Arc::new(keychains_for(&["Q"], KEY).unwrap().remove(0)),
        };

        let failure = h
            .orchestrator
            .start(request, &parties, CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(failure.cause, TransferError::UnknownChain { .. }));
        assert_eq!(h.ledger.issued_count("X").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_transfers_share_a_keychain() {
        let h = harness(config()).await;
        h.ledger.set_processing_polls("X", 1).await;

        let jobs = vec![
            (request(30_000_000), h.parties.clone()),
            (request(20_000_000), h.parties.clone()),
        ];
        let outcomes = h.orchestrator.run_many(jobs, &CancelSignal::never()).await;

        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert_eq!(h.ledger.issued_count("X").await, 2);
        assert_eq!(h.balance("C").await, Amount::from(50_000_000 - 2 * FEE));
        assert_eq!(h.balance("X").await, Amount::from(FUNDED - 50_000_000 - 2 * FEE));
    }

    fn store_down() -> TransferError {
        TransferError::Internal("checkpoint store unavailable".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_checkpoint_failure_stops_before_export() {
        let h = harness(config()).await;
        let mut store = MockCheckpointStore::new();
        store.expect_save().returning(|_| Err(store_down()));
        let orchestrator =
            TransferOrchestrator::new(Arc::new(h.ledger.manager().await), Arc::new(store), config());

        let failure = orchestrator
            .start(request(50_000_000), &h.parties, CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(failure.leg, Leg::Export);
        assert_eq!(failure.phase_reached, Phase::Init);
        assert!(matches!(failure.cause, TransferError::Internal(_)));
        assert!(failure.export_tx_id.is_none());
        assert_eq!(h.ledger.issued_count("X").await, 0);
        assert_eq!(h.balance("X").await, Amount::from(FUNDED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_checkpoint_failures_do_not_stop_transfer() {
        let h = harness(config()).await;
        let mut store = MockCheckpointStore::new();
        store.expect_save().times(1).returning(|_| Ok(()));
        store.expect_save().returning(|_| Err(store_down()));
        let orchestrator =
            TransferOrchestrator::new(Arc::new(h.ledger.manager().await), Arc::new(store), config());

        let receipt = orchestrator
            .start(request(50_000_000), &h.parties, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(receipt.record.phase, Phase::Done);
        assert_eq!(receipt.received, Amount::from(50_000_000 - FEE));
        assert_eq!(h.ledger.issued_count("X").await, 1);
        assert_eq!(h.balance("C").await, Amount::from(50_000_000 - FEE));
    }
}

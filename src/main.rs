//! Interchain Transfer CLI
//!
//! Moves value between chains of one network through export/import, sends
//! value within a chain, and reports on the network.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;

use interchain_transfer::cancel::{cancellation, CancelHandle};
use interchain_transfer::chain::{ChainManager, RpcPlatformClient};
use interchain_transfer::config::Settings;
use interchain_transfer::keychain::{keychains_for, load_private_key};
use interchain_transfer::metrics::MetricsServer;
use interchain_transfer::query::network_overview;
use interchain_transfer::state::{CheckpointStore, MemoryCheckpointStore, PgCheckpointStore};
use interchain_transfer::transfer::{
    SendRequest, TransferOrchestrator, TransferOutcome, TransferParties, TransferRequest,
};
use interchain_transfer::types::{parse_amount, Address, Amount, TxId};

#[derive(Parser)]
#[command(name = "interchain-transfer", version, about)]
struct Cli {
    /// Configuration file (defaults to $TRANSFER_CONFIG, then config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print chain IDs, platform statistics and fees
    Query,

    /// Send value to an address on the same chain
    Send {
        #[arg(long)]
        chain: String,
        #[arg(long, default_value = "AVAX")]
        asset: String,
        #[arg(long, value_parser = parse_amount)]
        amount: Amount,
        #[arg(long)]
        to: String,
        #[arg(long)]
        memo: Option<String>,
    },

    /// Move value from one chain to another
    Transfer {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long, default_value = "AVAX")]
        asset: String,
        #[arg(long, value_parser = parse_amount)]
        amount: Amount,
        /// Receiver on the destination chain, defaults to our own address
        #[arg(long)]
        recipient: Option<String>,
        #[arg(long)]
        memo: Option<String>,
    },

    /// Continue a failed or interrupted transfer
    Resume {
        /// Checkpointed transfer ID
        #[arg(long, conflicts_with = "export_tx")]
        id: Option<Uuid>,
        /// Import the outputs of this export transaction
        #[arg(long, requires_all = ["from", "to", "amount"])]
        export_tx: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value = "AVAX")]
        asset: String,
        #[arg(long, value_parser = parse_amount)]
        amount: Option<Amount>,
        /// Receiver the export paid into, defaults to our own address
        #[arg(long, requires = "export_tx")]
        recipient: Option<String>,
    },

    /// Show a checkpointed transfer, or every resumable one
    Status {
        #[arg(long)]
        id: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    info!(
        "Loaded configuration for network {} with {} chains",
        settings.network.name,
        settings.enabled_chains().len()
    );

    let chains = Arc::new(ChainManager::from_settings(&settings)?);
    let checkpoints = open_checkpoints(&settings).await?;

    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let (handle, signal) = cancellation();
    let shutdown_handle = tokio::spawn(cancel_on_shutdown(handle));

    let orchestrator =
        TransferOrchestrator::new(chains.clone(), checkpoints, settings.transfer.clone());

    let result = match cli.command {
        Command::Query => {
            let platform = RpcPlatformClient::new(&settings.network.platform_urls)?;
            let overview = network_overview(&chains, &platform).await?;
            println!("{}", serde_json::to_string_pretty(&overview)?);
            Ok(())
        }

        Command::Send {
            chain,
            asset,
            amount,
            to,
            memo,
        } => {
            let key = load_private_key(&settings.credentials)?;
            let keys = keychains_for(&[chain.as_str()], &key)?.remove(0);
            let request = SendRequest {
                chain,
                asset_symbol: asset,
                amount,
                to: Address::new(to),
                memo,
            };

            let mut cancel = signal.clone();
            let receipt = orchestrator.send(&request, &keys, &mut cancel).await?;
            println!("Transaction: {}", receipt.tx_id);
            println!("Status: {}", receipt.status);
            println!("Fee: {}", receipt.fee);
            println!("Balance before: {}", receipt.balance_before);
            println!("Balance after: {}", receipt.balance_after);
            Ok(())
        }

        Command::Transfer {
            from,
            to,
            asset,
            amount,
            recipient,
            memo,
        } => {
            for (name, healthy) in chains.health_check().await {
                if !healthy {
                    warn!("Chain {} health check failed", name);
                }
            }

            let parties = parties(&settings, &from, &to)?;
            let request = TransferRequest {
                source_chain: from,
                destination_chain: to,
                asset_symbol: asset,
                amount,
                recipient: recipient.map(Address::new),
                memo,
            };
            report(orchestrator.start(request, &parties, signal.clone()).await)
        }

        Command::Resume {
            id,
            export_tx,
            from,
            to,
            asset,
            amount,
            recipient,
        } => match (id, export_tx) {
            (Some(id), _) => {
                let record = orchestrator.load(id).await?;
                let parties = parties(&settings, &record.source_chain, &record.destination_chain)?;
                report(orchestrator.resume(record, &parties, signal.clone()).await)
            }
            (None, Some(export_tx)) => {
                let (Some(from), Some(to), Some(amount)) = (from, to, amount) else {
                    bail!("--export-tx needs --from, --to and --amount");
                };
                let parties = parties(&settings, &from, &to)?;
                let request = TransferRequest {
                    source_chain: from,
                    destination_chain: to,
                    asset_symbol: asset,
                    amount,
                    recipient: recipient.map(Address::new),
                    memo: None,
                };
                report(
                    orchestrator
                        .resume_from_export(request, TxId::new(export_tx), &parties, signal.clone())
                        .await,
                )
            }
            (None, None) => bail!("resume needs --id or --export-tx"),
        },

        Command::Status { id } => {
            match id {
                Some(id) => {
                    let record = orchestrator.load(id).await?;
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                None => {
                    let records = orchestrator.checkpoints().list_resumable().await?;
                    if records.is_empty() {
                        println!("No resumable transfers");
                    }
                    for record in records {
                        println!(
                            "{} {} -> {} {} {} at {} (export {})",
                            record.id,
                            record.source_chain,
                            record.destination_chain,
                            record.amount,
                            record.asset_symbol,
                            record.phase,
                            record
                                .export_tx_id
                                .as_ref()
                                .map(|t| t.as_str())
                                .unwrap_or("-")
                        );
                    }
                }
            }
            Ok(())
        }
    };

    shutdown_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    result
}

async fn open_checkpoints(settings: &Settings) -> Result<Arc<dyn CheckpointStore>> {
    match &settings.database {
        Some(database) => {
            let store = PgCheckpointStore::new(database)
                .await
                .context("Failed to connect to checkpoint database")?;
            store.run_migrations().await?;
            info!("Database connection established");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database configured - transfers cannot be resumed after exit");
            Ok(Arc::new(MemoryCheckpointStore::new()))
        }
    }
}

fn parties(settings: &Settings, source: &str, destination: &str) -> Result<TransferParties> {
    let key = load_private_key(&settings.credentials)?;
    let mut keys = keychains_for(&[source, destination], &key)?.into_iter();
    match (keys.next(), keys.next()) {
        (Some(source_keys), Some(destination_keys)) => Ok(TransferParties {
            source_keys: Arc::new(source_keys),
            destination_keys: Arc::new(destination_keys),
        }),
        _ => bail!("Failed to derive keychains for {} and {}", source, destination),
    }
}

fn report(outcome: TransferOutcome) -> Result<()> {
    match outcome {
        Ok(receipt) => {
            println!("Transfer: {}", receipt.id);
            if let Some(export) = &receipt.export_tx_id {
                println!("Export: {}", export);
            }
            if let Some(import) = &receipt.import_tx_id {
                println!("Import: {}", import);
            }
            println!("Exported: {}", receipt.exported);
            println!("Received: {}", receipt.received);
            Ok(())
        }
        Err(failure) => {
            println!("Transfer: {}", failure.record.id);
            if let Some(export) = &failure.export_tx_id {
                println!("Export: {}", export);
            }
            if failure.is_resumable() {
                println!("Resume with: resume --id {}", failure.record.id);
            }
            Err(failure.into())
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,interchain_transfer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Cancel in-flight work on Ctrl+C or SIGTERM
async fn cancel_on_shutdown(handle: CancelHandle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, cancelling");
    handle.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_from_export_accepts_recipient() {
        let cli = Cli::try_parse_from([
            "interchain-transfer",
            "resume",
            "--export-tx",
            "2Kxw7ZTz",
            "--from",
            "X",
            "--to",
            "C",
            "--amount",
            "5000000",
            "--recipient",
            "C-0x8db97c7cece249c2b98bdc0226cc4c2a57bf52fc",
        ])
        .unwrap();

        match cli.command {
            Command::Resume {
                export_tx,
                recipient,
                ..
            } => {
                assert_eq!(export_tx.as_deref(), Some("2Kxw7ZTz"));
                assert_eq!(
                    recipient.as_deref(),
                    Some("C-0x8db97c7cece249c2b98bdc0226cc4c2a57bf52fc")
                );
            }
            _ => panic!("expected resume"),
        }
    }

    #[test]
    fn test_recipient_needs_export_tx() {
        let id = Uuid::new_v4().to_string();
        let result = Cli::try_parse_from([
            "interchain-transfer",
            "resume",
            "--id",
            id.as_str(),
            "--recipient",
            "C-0x01",
        ]);
        assert!(result.is_err());
    }
}

//! Transaction submission and status tracking

use super::transaction::SignedTx;
use crate::cancel::CancelSignal;
use crate::chain::ChainClient;
use crate::config::{PollConfig, TransferConfig};
use crate::error::{TransferError, TransferResult};
use crate::types::{TxId, TxStatus};

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Submits signed transactions and waits for a terminal status
#[derive(Debug, Clone)]
pub struct TransactionSubmitter {
    max_retries: u32,
    retry_delay: Duration,
    status_poll: PollConfig,
}

impl TransactionSubmitter {
    pub fn new(max_retries: u32, retry_delay: Duration, status_poll: PollConfig) -> Self {
        Self {
            max_retries,
            retry_delay,
            status_poll,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.retry_delay_ms),
            config.status_poll.clone(),
        )
    }

    /// Issue a signed transaction, retrying transport failures.
    ///
    /// Re-issuing the same payload is idempotent on the ledger, so a retry
    /// after a lost response cannot spend twice.
    pub async fn submit(
        &self,
        client: &dyn ChainClient,
        chain: &str,
        tx: &SignedTx,
    ) -> TransferResult<TxId> {
        let kind = tx.unsigned.kind.name();
        let mut attempts = 0;

        loop {
            attempts += 1;

            match client.issue_tx(tx).await {
                Ok(tx_id) => {
                    info!(
                        "Issued {} tx {} on chain {} (attempt {})",
                        kind, tx_id, chain, attempts
                    );
                    crate::metrics::record_tx_submitted(chain, kind);
                    return Ok(tx_id);
                }
                Err(e) if e.is_retryable() && attempts <= self.max_retries => {
                    warn!(
                        "Submitting {} tx on chain {} failed (attempt {}/{}): {}",
                        kind,
                        chain,
                        attempts,
                        self.max_retries + 1,
                        e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single read of a transaction's status
    pub async fn poll_status(
        &self,
        client: &dyn ChainClient,
        tx_id: &TxId,
    ) -> TransferResult<TxStatus> {
        client.tx_status(tx_id).await
    }

    /// Poll until the transaction is accepted or rejected.
    ///
    /// `Rejected` is returned as an error no matter how many `Processing`
    /// observations came before it. Transport errors count as an attempt.
    pub async fn await_final(
        &self,
        client: &dyn ChainClient,
        chain: &str,
        tx_id: &TxId,
        cancel: &mut CancelSignal,
    ) -> TransferResult<TxStatus> {
        let started = Instant::now();
        let max_attempts = self.status_poll.max_attempts;

        for attempt in 0..max_attempts {
            match self.poll_status(client, tx_id).await {
                Ok(TxStatus::Accepted) => {
                    info!("Tx {} accepted on chain {}", tx_id, chain);
                    crate::metrics::record_tx_accepted(chain, started.elapsed().as_secs_f64());
                    return Ok(TxStatus::Accepted);
                }
                Ok(TxStatus::Rejected) => {
                    crate::metrics::record_tx_rejected(chain);
                    return Err(TransferError::Rejected {
                        chain: chain.to_string(),
                        tx_id: tx_id.clone(),
                    });
                }
                Ok(status) => {
                    debug!(
                        "Tx {} on chain {} is {} (poll {}/{})",
                        tx_id,
                        chain,
                        status,
                        attempt + 1,
                        max_attempts
                    );
                }
                Err(e) if e.is_retryable() => {
                    warn!("Status poll for tx {} failed: {}", tx_id, e);
                }
                Err(e) => return Err(e),
            }

            if attempt + 1 < max_attempts {
                cancel.sleep(self.status_poll.delay(attempt)).await?;
            }
        }

        Err(TransferError::Timeout {
            operation: format!("status of tx {} on chain {}", tx_id, chain),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use crate::chain::MockChainClient;
    use crate::tx::transaction::{TxKind, UnsignedTx};
    use crate::types::ChainId;

    use mockall::Sequence;
    use tokio_test::{assert_err, assert_ok};

    fn signed() -> SignedTx {
        SignedTx {
            unsigned: UnsignedTx {
                network_id: 5,
                blockchain_id: ChainId::from("x-chain"),
                inputs: Vec::new(),
                outputs: Vec::new(),
                kind: TxKind::Base,
                memo: Vec::new(),
            },
            credentials: Vec::new(),
        }
    }

    fn submitter(max_attempts: u32) -> TransactionSubmitter {
        TransactionSubmitter::new(
            2,
            Duration::from_millis(100),
            PollConfig {
                interval_ms: 100,
                max_interval_ms: 400,
                backoff_factor: 2,
                max_attempts,
            },
        )
    }

    fn transport() -> TransferError {
        TransferError::Transport {
            chain: "X".into(),
            message: "connection reset".into(),
        }
    }

    fn statuses(client: &mut MockChainClient, statuses: &[TxStatus]) {
        let mut seq = Sequence::new();
        for status in statuses.iter().copied() {
            client
                .expect_tx_status()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(status));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_then_rejected_is_failure() {
        let mut client = MockChainClient::new();
        statuses(
            &mut client,
            &[TxStatus::Processing, TxStatus::Processing, TxStatus::Rejected],
        );

        let result = submitter(10)
            .await_final(&client, "X", &TxId::from("tx1"), &mut CancelSignal::never())
            .await;

        assert!(matches!(result, Err(TransferError::Rejected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_after_processing() {
        let mut client = MockChainClient::new();
        statuses(
            &mut client,
            &[TxStatus::Unknown, TxStatus::Processing, TxStatus::Accepted],
        );

        let status = assert_ok!(
            submitter(10)
                .await_final(&client, "X", &TxId::from("tx1"), &mut CancelSignal::never())
                .await
        );
        assert_eq!(status, TxStatus::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cap_yields_timeout() {
        let mut client = MockChainClient::new();
        client
            .expect_tx_status()
            .times(3)
            .returning(|_| Ok(TxStatus::Processing));

        let result = submitter(3)
            .await_final(&client, "X", &TxId::from("tx1"), &mut CancelSignal::never())
            .await;

        assert!(matches!(result, Err(TransferError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_while_polling_are_tolerated() {
        let mut client = MockChainClient::new();
        let mut seq = Sequence::new();
        client
            .expect_tx_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(transport()));
        client
            .expect_tx_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(TxStatus::Accepted));

        let result = submitter(5)
            .await_final(&client, "X", &TxId::from("tx1"), &mut CancelSignal::never())
            .await;
        assert_ok!(result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let mut client = MockChainClient::new();
        client
            .expect_tx_status()
            .times(1)
            .returning(|_| Ok(TxStatus::Processing));

        let (handle, mut signal) = cancellation();
        handle.cancel();

        let result = submitter(10)
            .await_final(&client, "X", &TxId::from("tx1"), &mut signal)
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_retries_transport_errors() {
        let mut client = MockChainClient::new();
        let mut seq = Sequence::new();
        client
            .expect_issue_tx()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(transport()));
        client
            .expect_issue_tx()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(TxId::from("tx1")));

        let tx_id = assert_ok!(submitter(10).submit(&client, "X", &signed()).await);
        assert_eq!(tx_id, TxId::from("tx1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_gives_up_after_retries() {
        let mut client = MockChainClient::new();
        client
            .expect_issue_tx()
            .times(3)
            .returning(|_| Err(transport()));

        let err = assert_err!(submitter(10).submit(&client, "X", &signed()).await);
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_error_is_not_retried() {
        let mut client = MockChainClient::new();
        client.expect_issue_tx().times(1).returning(|_| {
            Err(TransferError::Submission {
                chain: "X".into(),
                message: "input already spent".into(),
            })
        });

        let result = submitter(10).submit(&client, "X", &signed()).await;
        assert!(matches!(result, Err(TransferError::Submission { .. })));
    }
}

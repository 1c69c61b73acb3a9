//! UTXO set fetching with bounded transport retry

use crate::chain::ChainClient;
use crate::config::TransferConfig;
use crate::error::TransferResult;
use crate::types::{Address, ChainId, Utxo};

use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct UtxoFetcher {
    max_retries: u32,
    retry_delay: Duration,
}

impl UtxoFetcher {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.retry_delay_ms))
    }

    /// Current unspent outputs of `addresses` on `chain`.
    ///
    /// With `source_chain`, only outputs exported from that chain. An empty
    /// set means nothing is owned (or nothing has arrived yet), never a
    /// failed fetch.
    pub async fn fetch(
        &self,
        chain: &str,
        client: &dyn ChainClient,
        addresses: &[Address],
        source_chain: Option<&ChainId>,
    ) -> TransferResult<Vec<Utxo>> {
        let mut attempt = 0;

        loop {
            match client.utxos(addresses, source_chain.cloned()).await {
                Ok(utxos) => {
                    debug!(
                        "Fetched {} UTXOs on chain {} for {} addresses{}",
                        utxos.len(),
                        chain,
                        addresses.len(),
                        source_chain
                            .map(|s| format!(" from source {}", s))
                            .unwrap_or_default()
                    );
                    return Ok(utxos);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.retry_delay * 2u32.saturating_pow(attempt);
                    warn!(
                        "UTXO fetch on chain {} failed (retry {}/{} in {:?}): {}",
                        chain,
                        attempt + 1,
                        self.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

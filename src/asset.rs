//! Asset symbol resolution

use crate::chain::ChainClient;
use crate::error::TransferResult;
use crate::types::{AssetDescription, AssetId};

use dashmap::DashMap;
use tracing::debug;

/// Resolves asset symbols to canonical IDs, caching per chain and symbol.
///
/// Asset registration is append-only, so cached entries never go stale.
#[derive(Debug, Default)]
pub struct AssetResolver {
    cache: DashMap<(String, String), AssetDescription>,
}

impl AssetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(
        &self,
        chain: &str,
        client: &dyn ChainClient,
        symbol: &str,
    ) -> TransferResult<AssetId> {
        Ok(self.describe(chain, client, symbol).await?.asset_id)
    }

    /// Full description, including denomination
    pub async fn describe(
        &self,
        chain: &str,
        client: &dyn ChainClient,
        symbol: &str,
    ) -> TransferResult<AssetDescription> {
        let key = (chain.to_string(), symbol.to_string());
        if let Some(description) = self.cache.get(&key) {
            return Ok(description.clone());
        }

        let description = client.asset_description(symbol).await?;
        debug!(
            "Resolved {} on chain {} to {}",
            symbol, chain, description.asset_id
        );
        self.cache.insert(key, description.clone());
        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::error::TransferError;

    fn avax() -> AssetDescription {
        AssetDescription {
            asset_id: AssetId::from("FvwEAhmxKfeiG8SnEvq42hc6whRyY3EFYAvebMqDNDGCgxN5Z"),
            name: "Avalanche".to_string(),
            symbol: "AVAX".to_string(),
            denomination: 9,
        }
    }

    #[tokio::test]
    async fn test_lookup_is_cached_per_chain() {
        let mut client = MockChainClient::new();
        client
            .expect_asset_description()
            .withf(|symbol| symbol.eq_ignore_ascii_case("AVAX"))
            .times(2)
            .returning(|_| Ok(avax()));

        let resolver = AssetResolver::new();
        let first = resolver.resolve("X", &client, "AVAX").await.unwrap();
        let second = resolver.resolve("X", &client, "AVAX").await.unwrap();
        resolver.resolve("C", &client, "AVAX").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, avax().asset_id);
    }

    #[tokio::test]
    async fn test_unknown_symbol() {
        let mut client = MockChainClient::new();
        client.expect_asset_description().returning(|symbol| {
            Err(TransferError::AssetNotFound {
                chain: "X".into(),
                symbol: symbol.to_string(),
            })
        });

        let resolver = AssetResolver::new();
        let result = resolver.resolve("X", &client, "NOPE").await;
        assert!(matches!(result, Err(TransferError::AssetNotFound { .. })));
        assert!(resolver.cache.is_empty());
    }
}

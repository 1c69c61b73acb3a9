//! Per address-set build serialization

use crate::types::Address;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One lock per (chain, spending address set).
///
/// Held from UTXO fetch until the spending transaction is accepted, so two
/// transfers never build from the same UTXO snapshot.
#[derive(Debug, Default)]
pub struct BuildLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BuildLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(chain: &str, addresses: &[Address]) -> String {
        let mut addresses: Vec<&str> = addresses.iter().map(Address::as_str).collect();
        addresses.sort_unstable();
        addresses.dedup();
        format!("{}:{}", chain, addresses.join(","))
    }

    pub async fn acquire(&self, chain: &str, addresses: &[Address]) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(Self::key(chain, addresses))
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_key_ignores_address_order() {
        let a = Address::from("X-0xa");
        let b = Address::from("X-0xb");
        assert_eq!(
            BuildLocks::key("X", &[a.clone(), b.clone()]),
            BuildLocks::key("X", &[b, a.clone(), a])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_address_set_is_serialized() {
        let locks = BuildLocks::new();
        let owner = [Address::from("X-0xa")];

        let guard = locks.acquire("X", &owner).await;
        let blocked = tokio::time::timeout(Duration::from_secs(1), locks.acquire("X", &owner)).await;
        assert!(blocked.is_err());

        // Other chains and address sets are independent
        let _c = locks.acquire("C", &owner).await;
        let _other = locks.acquire("X", &[Address::from("X-0xb")]).await;

        drop(guard);
        let _again = locks.acquire("X", &owner).await;
    }
}

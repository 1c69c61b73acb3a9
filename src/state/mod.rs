//! Durable transfer checkpoints
//!
//! Handles:
//! - Saving the transfer record at every phase transition
//! - Loading records for status queries and resumption
//! - Listing transfers that can still be resumed

mod postgres;

pub use postgres::PgCheckpointStore;

use crate::error::TransferResult;
use crate::transfer::TransferRecord;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace a record
    async fn save(&self, record: &TransferRecord) -> TransferResult<()>;

    async fn load(&self, id: Uuid) -> TransferResult<Option<TransferRecord>>;

    /// Unfinished records that are safe to resume, oldest first
    async fn list_resumable(&self) -> TransferResult<Vec<TransferRecord>>;
}

/// Process-local store, used when no database is configured
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: DashMap<Uuid, TransferRecord>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, record: &TransferRecord) -> TransferResult<()> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> TransferResult<Option<TransferRecord>> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn list_resumable(&self) -> TransferResult<Vec<TransferRecord>> {
        let mut records: Vec<TransferRecord> = self
            .records
            .iter()
            .filter(|r| r.is_resumable())
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use crate::transfer::Phase;
    use crate::types::{Amount, TxId};

    #[tokio::test]
    async fn test_memory_store_lists_only_resumable() {
        let store = MemoryCheckpointStore::new();

        let mut done = TransferRecord::new("X", "C", "AVAX", Amount::from(10u64), None, None);
        done.phase = Phase::Done;
        let mut stuck = TransferRecord::new("X", "C", "AVAX", Amount::from(20u64), None, None);
        stuck.phase = Phase::AwaitingPropagation;
        stuck.export_tx_id = Some(TxId::from("export"));
        stuck.fail(&TransferError::PropagationTimeout {
            export_tx_id: TxId::from("export"),
            attempts: 3,
        });

        store.save(&done).await.unwrap();
        store.save(&stuck).await.unwrap();

        let resumable = store.list_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].id, stuck.id);
        assert_eq!(store.load(done.id).await.unwrap(), Some(done));
        assert_eq!(store.load(Uuid::new_v4()).await.unwrap(), None);
    }
}

//! PostgreSQL checkpoint store

use super::CheckpointStore;
use crate::config::DatabaseConfig;
use crate::error::{TransferError, TransferResult};
use crate::transfer::TransferRecord;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// Checkpoint store backed by PostgreSQL
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    /// Connect to the configured database
    pub async fn new(config: &DatabaseConfig) -> TransferResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> TransferResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id UUID PRIMARY KEY,
                source_chain VARCHAR(32) NOT NULL,
                destination_chain VARCHAR(32) NOT NULL,
                asset_symbol VARCHAR(32) NOT NULL,
                phase VARCHAR(32) NOT NULL,
                export_tx_id VARCHAR(128),
                import_tx_id VARCHAR(128),
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transfers_phase
            ON transfers (phase)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transfers_export_tx
            ON transfers (export_tx_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> TransferResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn decode(row: &PgRow) -> TransferResult<TransferRecord> {
        let value: serde_json::Value = row.try_get("record")?;
        serde_json::from_value(value)
            .map_err(|e| TransferError::Internal(format!("Corrupt transfer record: {}", e)))
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn save(&self, record: &TransferRecord) -> TransferResult<()> {
        let body = serde_json::to_value(record)
            .map_err(|e| TransferError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO transfers
                (id, source_chain, destination_chain, asset_symbol, phase,
                 export_tx_id, import_tx_id, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id)
            DO UPDATE SET phase = $5, export_tx_id = $6, import_tx_id = $7,
                          record = $8, updated_at = $10
            "#,
        )
        .bind(record.id)
        .bind(&record.source_chain)
        .bind(&record.destination_chain)
        .bind(&record.asset_symbol)
        .bind(record.phase.as_str())
        .bind(record.export_tx_id.as_ref().map(|t| t.to_string()))
        .bind(record.import_tx_id.as_ref().map(|t| t.to_string()))
        .bind(body)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Checkpointed transfer {} at {}", record.id, record.phase);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> TransferResult<Option<TransferRecord>> {
        let row = sqlx::query("SELECT record FROM transfers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_resumable(&self) -> TransferResult<Vec<TransferRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM transfers
            WHERE phase <> 'done'
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = Self::decode(row)?;
            if record.is_resumable() {
                records.push(record);
            }
        }
        Ok(records)
    }
}

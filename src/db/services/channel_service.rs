//! PostgreSQL-backed [`ChannelStore`]. Channel configs are stored encrypted.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;

use crate::db::models::NotificationChannel;
use crate::db::repository::{ChannelStore, StoreResult};
use crate::notifications::encryption::EncryptionService;
use crate::notifications::models::ChannelConfig;

/// Corresponds to the `notification_channels` table.
#[derive(Debug, FromRow)]
struct ChannelRow {
    id: i32,
    name: String,
    config: Vec<u8>,
    enabled: bool,
}

#[derive(Clone)]
pub struct PgChannelStore {
    pool: PgPool,
    encryption_service: Arc<EncryptionService>,
}

impl PgChannelStore {
    pub fn new(pool: PgPool, encryption_service: Arc<EncryptionService>) -> Self {
        Self {
            pool,
            encryption_service,
        }
    }

    fn decode(&self, row: ChannelRow) -> StoreResult<NotificationChannel> {
        Ok(NotificationChannel {
            id: row.id,
            name: row.name,
            config: self.encryption_service.open_config(&row.config)?,
            enabled: row.enabled,
        })
    }
}

#[async_trait]
impl ChannelStore for PgChannelStore {
    async fn create(&self, name: &str, config: ChannelConfig, enabled: bool) -> StoreResult<NotificationChannel> {
        let encrypted_config = self.encryption_service.seal_config(&config)?;
        let row = sqlx::query_as::<_, ChannelRow>(
            "INSERT INTO notification_channels (name, channel_type, config, enabled) VALUES ($1, $2, $3, $4) \
             RETURNING id, name, config, enabled",
        )
        .bind(name)
        .bind(config.channel_type())
        .bind(encrypted_config)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await?;
        self.decode(row)
    }

    async fn get(&self, id: i32) -> StoreResult<Option<NotificationChannel>> {
        sqlx::query_as::<_, ChannelRow>(
            "SELECT id, name, config, enabled FROM notification_channels WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| self.decode(row))
        .transpose()
    }

    async fn list_by_ids(&self, ids: &[i32]) -> StoreResult<Vec<NotificationChannel>> {
        let rows = sqlx::query_as::<_, ChannelRow>(
            "SELECT c.id, c.name, c.config, c.enabled \
             FROM UNNEST($1::int[]) WITH ORDINALITY AS wanted(id, ord) \
             JOIN notification_channels c ON c.id = wanted.id \
             ORDER BY wanted.ord",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| self.decode(row)).collect()
    }
}

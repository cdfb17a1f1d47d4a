//! PostgreSQL implementations of the store and queue interfaces.
//!
//! Each sub-module owns the SQL for one table. Queries are built at runtime
//! with `sqlx::query_as` so the crate compiles without a live database.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

pub mod channel_service;
pub mod check_history_service;
pub mod incident_service;
pub mod job_queue_service;
pub mod monitor_service;

pub use channel_service::PgChannelStore;
pub use check_history_service::PgCheckHistoryStore;
pub use incident_service::PgIncidentStore;
pub use job_queue_service::PgJobQueue;
pub use monitor_service::PgMonitorStore;

const SCHEMA: &str = include_str!("../schema.sql");

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Creates any missing tables and indexes. Safe to run repeatedly.
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("Database schema is up to date.");
    Ok(())
}

//! Database module
//!
//! This module provides the entity store:
//! - Schema and migrations
//! - Entity value models
//! - Transactions with batched change notifications
//! - Repository queries for roots, children and junctions

mod children;
pub mod models;
pub mod repository;
pub mod schema;
pub mod transaction;

pub use models::*;
pub use repository::Repository;
pub use schema::initialize_database;
pub use transaction::{
    ChangeNotification, ChangeSet, ChangedEntity, StoreTransaction, TransactionKind,
};

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Lock waits are absorbed by SQLite itself for this long before a
/// busy error would surface.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Build connection options shared by migration and application connections.
fn connect_options(db_path: &Path) -> std::result::Result<SqliteConnectOptions, sqlx::Error> {
    SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display())).map(
        |opts| {
            opts.create_if_missing(true)
                .busy_timeout(BUSY_TIMEOUT)
                .journal_mode(SqliteJournalMode::Wal)
                .foreign_keys(true)
        },
    )
}

/// Create and initialize the store's connection pool.
///
/// Migrations run on a dedicated connection that is closed before the
/// application pool opens. The application pool has exactly one
/// connection: the store is single-writer and every transaction, local
/// or sync, queues for it.
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    tracing::info!("Opening annotation store at: {:?}", db_path);

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let migration_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options(db_path)?)
        .await?;

    initialize_database(&migration_pool).await?;
    migration_pool.close().await;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options(db_path)?)
        .await?;

    tracing::info!("Annotation store opened");

    Ok(pool)
}

/// Create a migrated in-memory pool. Used by tests and throwaway stores.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        // An in-memory database vanishes with its last connection.
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    initialize_database(&pool).await?;
    Ok(pool)
}

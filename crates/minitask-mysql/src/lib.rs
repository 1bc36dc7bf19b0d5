//! minitask-mysql
//!
//! MySQL implementation of the `TaskStore` and `LeaseStore` ports.
//!
//! # モジュール構成
//! - **schema**: DDL と `migrate()`
//! - **row**: `sqlx::FromRow` の行型と JSON 列の encode/decode
//! - **error**: `sqlx::Error` から `StoreError` への分類
//! - **lease_store** / **task_store**: ポート実装

pub mod error;
pub mod lease_store;
pub mod row;
pub mod schema;
pub mod task_store;

pub use self::lease_store::MysqlLeaseStore;
pub use self::schema::migrate;
pub use self::task_store::MysqlTaskStore;

use minitask_core::config::MysqlConfig;
use minitask_core::domain::StoreError;
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;

/// Open a connection pool for `config`.
pub async fn connect(config: &MysqlConfig) -> Result<MySqlPool, StoreError> {
    let pool = MySqlPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
        .map_err(StoreError::transient)?;
    tracing::info!(max_connections = config.max_connections, "mysql pool connected");
    Ok(pool)
}

//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: copy-on-write トランザクション付きの正本
//! - **InMemoryLeaseStore**: 単一行 lease
//! - **InMemoryDiscover**: プロセス内レジストリ
//!
//! # 本番用実装
//! 本番用の実装は別クレートに配置します：
//! - `minitask-mysql`: MysqlTaskStore, MysqlLeaseStore

pub mod inmem_discover;
pub mod inmem_lease_store;
pub mod inmem_task_store;

// 主要な型を再エクスポート
pub use self::inmem_discover::InMemoryDiscover;
pub use self::inmem_lease_store::InMemoryLeaseStore;
pub use self::inmem_task_store::InMemoryTaskStore;

//! App - アプリケーション層
//!
//! ports を組み合わせてコーディネーションのロジックを実装します。
//!
//! # 主要コンポーネント
//! - **CoordinatorBuilder**: ストアと設定のワイヤリング
//! - **LeaderElector**: リーダーリースの競合ループ
//! - **RunnablePoller**: 実行可能タスクの発見ループ（polling + watch）
//! - **ClusterStatus**: リーダーと実行待ちの状態ビュー

pub mod builder;
pub mod elector;
pub mod identity;
pub mod poller;
pub mod service;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Coordinator, CoordinatorBuilder};
pub use self::elector::LeaderElector;
pub use self::identity::Identity;
pub use self::poller::RunnablePoller;
pub use self::service::{ServiceHandle, shutdown_requested};
pub use self::status::ClusterStatus;

//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（MySQL, サービスレジストリ など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - リレーショナル DB が source of truth（正本）
//! - lease と task はプロセス内にキャッシュしない
//! - 利用側は trait のみに依存する

pub mod clock;
pub mod discover;
pub mod lease_store;
pub mod task_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::discover::{Discover, DiscoverError, SubscribeCallback};
pub use self::lease_store::LeaseStore;
pub use self::task_store::{TaskStore, silent_watch, with_deadline};

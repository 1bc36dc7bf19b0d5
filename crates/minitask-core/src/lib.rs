//! minitask-core
//!
//! Coordination core for a distributed task scheduler.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（Task, TaskRun, TaskStatus, LeaseRecord, Instance, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, LeaseStore, Discover, Clock）
//! - **impls**: 開発・テスト用の in-memory 実装
//! - **app**: アプリケーションロジック（elector, poller, builder, status）
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

//! Errors - ストア層のエラー型と分類
//!
//! Backends map their native failures into [`StoreError`] exactly once, at
//! the store boundary. Callers branch on [`StoreError::kind`] and never on
//! backend-specific error types.

use thiserror::Error;

/// ErrorKind はストアエラーの運用分類
///
/// - NotFound: 対象の行が存在しない（リトライしない）
/// - Conflict: task_key の重複（リトライしない）
/// - InvalidArgument: 呼び出し側の入力不正（I/O 前に検出）
/// - Transient: DB 障害・デッドロック・タイムアウト（呼び出し側がリトライを判断）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidArgument,
    Transient,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} already exists: {key}")]
    Conflict { entity: &'static str, key: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// JSON columns (labels/taints/extra/result) that failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Transient(#[source] BoxError),
}

impl StoreError {
    pub fn task_not_found(task_key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "task",
            key: task_key.into(),
        }
    }

    pub fn lease_not_found() -> Self {
        Self::NotFound {
            entity: "leader_election",
            key: super::lease::LEASE_ANCHOR.to_string(),
        }
    }

    pub fn task_conflict(task_key: impl Into<String>) -> Self {
        Self::Conflict {
            entity: "task",
            key: task_key.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn transient(source: impl Into<BoxError>) -> Self {
        Self::Transient(source.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            StoreError::InvalidArgument(_) | StoreError::Codec(_) => ErrorKind::InvalidArgument,
            StoreError::Transient(_) => ErrorKind::Transient,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

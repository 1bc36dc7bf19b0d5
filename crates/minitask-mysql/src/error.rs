//! `sqlx::Error` の分類
//!
//! - RowNotFound → NotFound
//! - duplicate key (MySQL 1062) → Conflict
//! - それ以外（deadlock, timeout, 接続断）→ Transient

use minitask_core::domain::StoreError;
use sqlx::error::DatabaseError;
use sqlx::mysql::MySqlDatabaseError;

const ER_DUP_ENTRY: u16 = 1062;

pub fn classify(err: sqlx::Error, entity: &'static str, key: &str) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound {
            entity,
            key: key.to_string(),
        },
        sqlx::Error::Database(db) if is_duplicate_key(db.as_ref()) => StoreError::Conflict {
            entity,
            key: key.to_string(),
        },
        other => StoreError::transient(other),
    }
}

/// Shorthand for errors on the `task` / `task_run` tables.
pub fn task_error(task_key: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |err| classify(err, "task", task_key)
}

pub fn is_duplicate_key(db: &dyn DatabaseError) -> bool {
    db.is_unique_violation()
        || db
            .try_downcast_ref::<MySqlDatabaseError>()
            .is_some_and(|e| e.number() == ER_DUP_ENTRY)
}

//! Target store: one append-only table, at most one row per change key.
//!
//! - sql：sea-orm 实现（MySQL / PostgreSQL / SQLite）
//! - memory：进程内实现，支持故障注入

mod memory;
mod sql;

use async_trait::async_trait;
use sea_orm::{DbErr, RuntimeErr};
use serde::Serialize;
use xxhash_rust::xxh3::xxh3_128;

use crate::envelope::{ChangeEvent, OpKind};
use crate::retry::Retryable;

pub use memory::MemoryStore;
pub use sql::SqlStore;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Connection loss, deadlock, serialization conflict, lock or pool timeout.
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("store error: {0}")]
    Permanent(String),
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        match &err {
            DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => StoreError::Transient(err.to_string()),
            DbErr::Exec(RuntimeErr::SqlxError(e)) | DbErr::Query(RuntimeErr::SqlxError(e)) => {
                classify_sqlx(e)
            }
            other => {
                let msg = other.to_string();
                if transient_message(&msg) {
                    StoreError::Transient(msg)
                } else {
                    StoreError::Permanent(msg)
                }
            }
        }
    }
}

fn classify_sqlx(err: &sqlx::Error) -> StoreError {
    let msg = err.to_string();
    let transient = match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => transient_code(db.code().as_deref()) || transient_message(db.message()),
        _ => false,
    };
    if transient {
        StoreError::Transient(msg)
    } else {
        StoreError::Permanent(msg)
    }
}

/// SQLSTATE classes 08 (connection) and 40 (rollback: deadlock, serialization),
/// PostgreSQL admin shutdown / lock not available / too many connections, and the
/// SQLite BUSY / LOCKED family.
fn transient_code(code: Option<&str>) -> bool {
    let Some(code) = code else {
        return false;
    };
    code.starts_with("08")
        || code.starts_with("40")
        || matches!(
            code,
            "57P01" | "57P02" | "57P03" | "55P03" | "53300" | "HYT00" | "5" | "6" | "261" | "262" | "517" | "773"
        )
}

fn transient_message(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    ["deadlock", "lock wait timeout", "database is locked", "try restarting transaction", "connection reset", "broken pipe"]
        .iter()
        .any(|needle| m.contains(needle))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedRecord {
    pub change_key: String,
    pub source_server: String,
    pub source_database: String,
    pub source_table: String,
    pub topic_name: String,
    pub kafka_partition: i32,
    pub kafka_offset: i64,
    pub operation: OpKind,
    pub record_id: String,
    pub before_data: Option<String>,
    pub after_data: Option<String>,
    pub full_payload: Option<String>,
    pub source_ts_ms: i64,
    pub processed_at_ms: i64,
}

impl ConsolidatedRecord {
    pub fn from_event(event: &ChangeEvent, processed_at_ms: i64) -> Self {
        Self {
            change_key: change_key(event),
            source_server: event.server.clone(),
            source_database: event.database.clone(),
            source_table: event.table.clone(),
            topic_name: event.topic.clone(),
            kafka_partition: event.partition,
            kafka_offset: event.offset,
            operation: event.op,
            record_id: event.identity.clone(),
            before_data: event.before.clone(),
            after_data: event.after.clone(),
            full_payload: event.payload.clone(),
            source_ts_ms: event.source_ts_ms,
            processed_at_ms,
        }
    }
}

/// Idempotency key: (server, table, identity, source timestamp, operation) plus the
/// source log position, or the broker coordinates when the source reports none.
/// Keyless rows always carry the broker coordinates: identical rows read under one
/// snapshot position are still distinct records.
/// Redelivery of the same record always yields the same key.
pub fn change_key(event: &ChangeEvent) -> String {
    let coordinates = || format!("{}:{}:{}", event.topic, event.partition, event.offset);
    let position = match &event.source_position {
        Some(pos) if event.is_keyless() => format!("{}@{}", pos, coordinates()),
        Some(pos) => pos.clone(),
        None => coordinates(),
    };
    let material = [
        event.server.as_str(),
        event.table.as_str(),
        event.identity.as_str(),
        &event.source_ts_ms.to_string(),
        event.op.as_str(),
        &position,
    ]
    .join("\u{1f}");
    format!("{:032x}", xxh3_128(material.as_bytes()))
}

#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Create the table and its indexes when missing.
    async fn ensure_schema(&self) -> Result<(), StoreError>;
    /// Insert-or-ignore every record in one transaction; returns rows actually inserted.
    async fn write_batch(&self, records: &[ConsolidatedRecord]) -> Result<u64, StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

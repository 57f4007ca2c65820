//! Broker seam: per-topic record streams with manual offset commit, and topic listing.
//!
//! 模块划分：
//! - config：KafkaConf 与 librdkafka 参数拼装
//! - source：基于 rdkafka 的 StreamConsumer / 元数据查询（feature = "kafka"）
//! - memory：进程内 broker，供测试与本地演示使用

mod config;
mod memory;
#[cfg(feature = "kafka")]
mod source;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::retry::Retryable;

pub use config::KafkaConf;
pub use memory::{MemoryBroker, MemoryStream};
#[cfg(feature = "kafka")]
pub use source::{KafkaCatalog, KafkaErrorWrapper, KafkaStream, KafkaStreamFactory};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum BrokerError {
    #[error("broker error: {0}")]
    Transport(String),
    /// Authorization or authentication failures; retrying in place cannot help.
    #[error("fatal broker error: {0}")]
    Fatal(String),
    #[error("consumer closed")]
    Closed,
}

impl BrokerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_) | BrokerError::Closed)
    }
}

impl Retryable for BrokerError {
    fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    /// `None` for tombstones.
    pub payload: Option<Bytes>,
    pub timestamp_ms: Option<i64>,
}

impl BrokerRecord {
    pub fn key_str(&self) -> String {
        self.key
            .as_ref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default()
    }
}

/// Highest processed offset per (topic, partition).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OffsetMap(BTreeMap<(String, i32), i64>);

impl OffsetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, topic: &str, partition: i32, offset: i64) {
        let slot = self.0.entry((topic.to_string(), partition)).or_insert(offset);
        if offset > *slot {
            *slot = offset;
        }
    }

    pub fn record(&mut self, record: &BrokerRecord) {
        self.observe(&record.topic, record.partition, record.offset);
    }

    pub fn merge(&mut self, other: &OffsetMap) {
        for ((topic, partition), offset) in &other.0 {
            self.observe(topic, *partition, *offset);
        }
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<i64> {
        self.0.get(&(topic.to_string(), partition)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// `(topic, partition, next offset to read)`, the position a commit stores.
    pub fn commit_positions(&self) -> impl Iterator<Item = (&str, i32, i64)> {
        self.0
            .iter()
            .map(|((topic, partition), offset)| (topic.as_str(), *partition, offset + 1))
    }
}

/// One consumer bound to one topic inside a consumer group.
#[async_trait]
pub trait RecordStream: Send {
    /// `Ok(None)` when nothing arrived within `timeout`.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerRecord>, BrokerError>;
    async fn commit(&mut self, offsets: &OffsetMap) -> Result<(), BrokerError>;
    /// Records between the consumer position and the high watermark, when known.
    async fn lag(&mut self) -> Option<i64> {
        None
    }
    async fn close(&mut self) {}
}

#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn subscribe(&self, topic: &str, group: &str)
    -> Result<Box<dyn RecordStream>, BrokerError>;
}

#[async_trait]
pub trait TopicCatalog: Send + Sync {
    async fn list_topics(&self) -> Result<BTreeSet<String>, BrokerError>;
}

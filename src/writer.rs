//! Batch flush: store first, then broker offsets.
//!
//! 提交顺序保证至少一次：offset 只在存储事务成功后提交，崩溃后重放由幂等键吸收。
//! 永久性失败的批次会逐条重试，单条仍失败的记录被隔离（日志、指标、失败环形缓冲），
//! 其余记录照常写入，消费不会卡死在一条坏数据上。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::envelope::{DecodeError, Decoded};
use crate::health::metrics;
use crate::kafka::{BrokerError, BrokerRecord, OffsetMap, RecordStream};
use crate::retry::{RetryPolicy, Retryable};
use crate::store::{ChangeStore, ConsolidatedRecord, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEntry {
    pub at_ms: i64,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub record_id: Option<String>,
    pub change_key: Option<String>,
    pub reason: String,
}

/// Bounded ring of the most recent decode and quarantine failures.
#[derive(Debug, Clone)]
pub struct FailureLog {
    capacity: usize,
    inner: Arc<Mutex<(VecDeque<FailureEntry>, u64)>>,
}

impl FailureLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Arc::new(Mutex::new((VecDeque::new(), 0))),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut (VecDeque<FailureEntry>, u64)) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn push(&self, entry: FailureEntry) {
        let capacity = self.capacity;
        self.with(|(ring, total)| {
            if ring.len() == capacity {
                ring.pop_front();
            }
            ring.push_back(entry);
            *total += 1;
        });
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<FailureEntry> {
        self.with(|(ring, _)| ring.iter().cloned().collect())
    }

    /// Failures seen since start, including those rotated out of the ring.
    pub fn total(&self) -> u64 {
        self.with(|(_, total)| *total)
    }
}

/// Records and offsets accumulated since the last flush.
#[derive(Debug, Default)]
pub struct Batch {
    pub records: Vec<ConsolidatedRecord>,
    pub offsets: OffsetMap,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.offsets.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub inserted: u64,
    pub duplicates: u64,
    pub quarantined: usize,
    pub committed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("store unavailable after retries: {0}")]
    Store(StoreError),
    #[error("offset commit failed: {0}")]
    Commit(BrokerError),
}

pub struct ConsolidationWriter {
    store: Arc<dyn ChangeStore>,
    retry: RetryPolicy,
    failures: FailureLog,
}

impl ConsolidationWriter {
    pub fn new(store: Arc<dyn ChangeStore>, retry: RetryPolicy, failures: FailureLog) -> Self {
        Self {
            store,
            retry,
            failures,
        }
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    /// Fold one decoded broker record into the batch. Every record advances the
    /// offsets, including tombstones, skipped snapshot reads and undecodable ones.
    pub fn stage(
        &self,
        batch: &mut Batch,
        record: &BrokerRecord,
        decoded: Result<Decoded, DecodeError>,
    ) {
        match decoded {
            Ok(Decoded::Event(event)) => {
                let now = chrono::Utc::now().timestamp_millis();
                batch.records.push(ConsolidatedRecord::from_event(&event, now));
            }
            Ok(Decoded::Tombstone) | Ok(Decoded::SkippedSnapshot) => {}
            Err(err) => {
                metrics::decode_failed(&record.topic);
                log::error!(
                    target: "cdc::writer",
                    "decode fail {}[{}]@{} key={}: {}",
                    record.topic,
                    record.partition,
                    record.offset,
                    record.key_str(),
                    err
                );
                self.failures.push(FailureEntry {
                    at_ms: chrono::Utc::now().timestamp_millis(),
                    topic: record.topic.clone(),
                    partition: record.partition,
                    offset: record.offset,
                    record_id: None,
                    change_key: None,
                    reason: err.to_string(),
                });
            }
        }
        batch.offsets.record(record);
    }

    /// Write the batch, then commit its offsets. On error nothing is committed and
    /// the batch is kept so the caller can drop it and resume from the last commit.
    pub async fn flush(
        &self,
        batch: &mut Batch,
        stream: &mut dyn RecordStream,
    ) -> Result<FlushReport, FlushError> {
        let mut report = FlushReport::default();
        if !batch.records.is_empty() {
            match self.write(&batch.records).await {
                Ok(inserted) => report.inserted = inserted,
                Err(StoreError::Permanent(reason)) => {
                    log::warn!(
                        target: "cdc::writer",
                        "batch of {} rejected, isolating records: {}",
                        batch.records.len(),
                        reason
                    );
                    self.isolate(&batch.records, &mut report).await?;
                }
                Err(err) => return Err(FlushError::Store(err)),
            }
            let written = batch.records.len() as u64 - report.quarantined as u64;
            report.duplicates = written.saturating_sub(report.inserted);
            let table = &batch.records[0].source_table;
            metrics::records_written(table, report.inserted);
            metrics::duplicates_skipped(table, report.duplicates);
        }

        if !batch.offsets.is_empty() {
            stream
                .commit(&batch.offsets)
                .await
                .map_err(FlushError::Commit)?;
            report.committed = true;
        }
        log::debug!(
            target: "cdc::writer",
            "flushed {} records: inserted {}, duplicates {}, quarantined {}",
            batch.records.len(),
            report.inserted,
            report.duplicates,
            report.quarantined
        );
        batch.records.clear();
        batch.offsets.clear();
        Ok(report)
    }

    async fn write(&self, records: &[ConsolidatedRecord]) -> Result<u64, StoreError> {
        let mut attempts = 0u32;
        let res = self
            .retry
            .run("store write", || {
                attempts += 1;
                self.store.write_batch(records)
            })
            .await;
        for _ in 1..attempts {
            metrics::store_retried();
        }
        res
    }

    async fn isolate(
        &self,
        records: &[ConsolidatedRecord],
        report: &mut FlushReport,
    ) -> Result<(), FlushError> {
        for record in records {
            match self.write(std::slice::from_ref(record)).await {
                Ok(inserted) => report.inserted += inserted,
                Err(err) if !err.is_transient() => {
                    report.quarantined += 1;
                    self.quarantine(record, &err);
                }
                Err(err) => return Err(FlushError::Store(err)),
            }
        }
        Ok(())
    }

    fn quarantine(&self, record: &ConsolidatedRecord, err: &StoreError) {
        metrics::quarantined(&record.source_table);
        log::error!(
            target: "cdc::writer",
            "quarantine {}[{}]@{} {} id={} key={}: {}",
            record.topic_name,
            record.kafka_partition,
            record.kafka_offset,
            record.source_table,
            record.record_id,
            record.change_key,
            err
        );
        self.failures.push(FailureEntry {
            at_ms: chrono::Utc::now().timestamp_millis(),
            topic: record.topic_name.clone(),
            partition: record.kafka_partition,
            offset: record.kafka_offset,
            record_id: Some(record.record_id.clone()),
            change_key: Some(record.change_key.clone()),
            reason: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::conf::PipelineConf;
    use crate::envelope::EnvelopeDecoder;
    use crate::envelope::tests::envelope;
    use crate::kafka::{MemoryBroker, StreamFactory};
    use crate::store::MemoryStore;
    use serde_json::json;

    const T: &str = "AXLAP240-dbo_Customers.dbo.Customers";

    fn writer(store: &MemoryStore, capacity: usize) -> ConsolidationWriter {
        ConsolidationWriter::new(
            Arc::new(store.clone()),
            RetryPolicy::fixed(2, Duration::from_millis(1)),
            FailureLog::new(capacity),
        )
    }

    async fn stage_all(broker: &MemoryBroker, w: &ConsolidationWriter, n: usize) -> (Box<dyn RecordStream>, Batch) {
        let decoder = EnvelopeDecoder::new(&PipelineConf::default(), false);
        let mut stream = broker.subscribe(T, "g").await.unwrap();
        let mut batch = Batch::default();
        for _ in 0..n {
            let record = stream.poll(Duration::from_millis(10)).await.unwrap().unwrap();
            let decoded = decoder.decode(&record, None);
            w.stage(&mut batch, &record, decoded);
        }
        (stream, batch)
    }

    fn publish_customer(broker: &MemoryBroker, id: i64, ts: i64) {
        let body = envelope("c", json!(null), json!({"CustomerID": id, "Name": "n"}), ts);
        broker.publish(T, Some(&format!(r#"{{"CustomerID":{id}}}"#)), Some(&body));
    }

    #[test]
    fn failure_log_is_bounded() {
        let log = FailureLog::new(2);
        for offset in 0..5 {
            log.push(FailureEntry {
                at_ms: 0,
                topic: T.into(),
                partition: 0,
                offset,
                record_id: None,
                change_key: None,
                reason: "x".into(),
            });
        }
        let offsets: Vec<i64> = log.recent().iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![3, 4]);
        assert_eq!(log.total(), 5);
    }

    #[tokio::test]
    async fn commits_after_store_and_skips_bad_payloads() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        publish_customer(&broker, 1, 100);
        broker.publish(T, None, Some("{not json"));
        broker.publish(T, Some("k"), None);
        publish_customer(&broker, 2, 101);
        let w = writer(&store, 10);
        let (mut stream, mut batch) = stage_all(&broker, &w, 4).await;
        assert_eq!(batch.len(), 2);

        let report = w.flush(&mut batch, stream.as_mut()).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert!(report.committed);
        assert!(batch.is_empty());
        assert_eq!(broker.committed("g", T, 0), Some(4));
        assert_eq!(w.failures().recent().len(), 1);
        assert_eq!(w.failures().recent()[0].offset, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_offsets_uncommitted() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        publish_customer(&broker, 1, 100);
        let w = writer(&store, 10);
        let (mut stream, mut batch) = stage_all(&broker, &w, 1).await;

        store.fail_next((0..3).map(|_| StoreError::Transient("deadlock".into())));
        let err = w.flush(&mut batch, stream.as_mut()).await.unwrap_err();
        assert!(matches!(err, FlushError::Store(StoreError::Transient(_))));
        assert_eq!(broker.committed("g", T, 0), None);
        assert!(store.is_empty());
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn transient_errors_within_budget_still_commit() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        publish_customer(&broker, 1, 100);
        let w = writer(&store, 10);
        let (mut stream, mut batch) = stage_all(&broker, &w, 1).await;

        store.fail_next([StoreError::Transient("lock wait timeout".into())]);
        let report = w.flush(&mut batch, stream.as_mut()).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(broker.committed("g", T, 0), Some(1));
    }

    #[tokio::test]
    async fn poison_record_is_quarantined_alone() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        for id in 1..=5 {
            publish_customer(&broker, id, 100 + id);
        }
        store.poison("3");
        let w = writer(&store, 10);
        let (mut stream, mut batch) = stage_all(&broker, &w, 5).await;

        let report = w.flush(&mut batch, stream.as_mut()).await.unwrap();
        assert_eq!(report.inserted, 4);
        assert_eq!(report.quarantined, 1);
        assert_eq!(report.duplicates, 0);
        assert_eq!(store.len(), 4);
        assert_eq!(broker.committed("g", T, 0), Some(5));
        let failures = w.failures().recent();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].record_id.as_deref(), Some("3"));
        assert_eq!(failures[0].offset, 2);
    }

    #[tokio::test]
    async fn redelivery_counts_as_duplicates() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        publish_customer(&broker, 1, 100);
        publish_customer(&broker, 2, 100);
        let w = writer(&store, 10);

        let (mut stream, mut batch) = stage_all(&broker, &w, 2).await;
        // 模拟写入成功但 offset 未提交后的重放
        store.write_batch(&batch.records).await.unwrap();
        let report = w.flush(&mut batch, stream.as_mut()).await.unwrap();
        assert_eq!((report.inserted, report.duplicates), (0, 2));
        assert_eq!(store.len(), 2);
    }
}

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use super::{BrokerError, BrokerRecord, OffsetMap, RecordStream, StreamFactory, TopicCatalog};

#[derive(Debug, Default)]
struct State {
    /// 按追加顺序保存，offset 按分区递增
    topics: BTreeMap<String, Vec<BrokerRecord>>,
    /// (group, topic, partition) -> next offset
    committed: BTreeMap<(String, String, i32), i64>,
    commits: usize,
    active: BTreeMap<String, usize>,
    max_active: BTreeMap<String, usize>,
    poll_errors: BTreeMap<String, VecDeque<BrokerError>>,
    listing_error: Option<BrokerError>,
    subscribe_error: Option<BrokerError>,
}

/// In-process broker with Kafka semantics that matter here: per-partition offsets,
/// group-scoped committed positions, and resume-from-commit on resubscribe.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn create_topic(&self, topic: &str) {
        self.with(|s| {
            s.topics.entry(topic.to_string()).or_default();
        });
    }

    pub fn delete_topic(&self, topic: &str) {
        self.with(|s| s.topics.remove(topic));
    }

    /// Append to partition 0 and return the assigned offset.
    pub fn publish(&self, topic: &str, key: Option<&str>, payload: Option<&str>) -> i64 {
        self.publish_to(topic, 0, key, payload)
    }

    pub fn publish_to(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        payload: Option<&str>,
    ) -> i64 {
        let offset = self.with(|s| {
            let log = s.topics.entry(topic.to_string()).or_default();
            let offset = log.iter().filter(|r| r.partition == partition).count() as i64;
            log.push(BrokerRecord {
                topic: topic.to_string(),
                partition,
                offset,
                key: key.map(|k| Bytes::copy_from_slice(k.as_bytes())),
                payload: payload.map(|p| Bytes::copy_from_slice(p.as_bytes())),
                timestamp_ms: Some(chrono::Utc::now().timestamp_millis()),
            });
            offset
        });
        self.notify.notify_waiters();
        offset
    }

    /// Committed next-offset for the group, if any.
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.with(|s| {
            s.committed
                .get(&(group.to_string(), topic.to_string(), partition))
                .copied()
        })
    }

    pub fn commit_count(&self) -> usize {
        self.with(|s| s.commits)
    }

    pub fn active_streams(&self, topic: &str) -> usize {
        self.with(|s| s.active.get(topic).copied().unwrap_or(0))
    }

    /// Highest number of simultaneously open streams ever seen for `topic`.
    pub fn max_active_streams(&self, topic: &str) -> usize {
        self.with(|s| s.max_active.get(topic).copied().unwrap_or(0))
    }

    /// Queue errors returned by the next polls on `topic`.
    pub fn fail_polls(&self, topic: &str, errors: impl IntoIterator<Item = BrokerError>) {
        self.with(|s| {
            s.poll_errors
                .entry(topic.to_string())
                .or_default()
                .extend(errors)
        });
    }

    pub fn fail_listing(&self, err: Option<BrokerError>) {
        self.with(|s| s.listing_error = err);
    }

    pub fn fail_subscribe(&self, err: Option<BrokerError>) {
        self.with(|s| s.subscribe_error = err);
    }
}

#[async_trait]
impl TopicCatalog for MemoryBroker {
    async fn list_topics(&self) -> Result<BTreeSet<String>, BrokerError> {
        self.with(|s| match &s.listing_error {
            Some(err) => Err(err.clone()),
            None => Ok(s.topics.keys().cloned().collect()),
        })
    }
}

#[async_trait]
impl StreamFactory for MemoryBroker {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn RecordStream>, BrokerError> {
        let positions = self.with(|s| {
            if let Some(err) = &s.subscribe_error {
                return Err(err.clone());
            }
            let active = s.active.entry(topic.to_string()).or_default();
            *active += 1;
            let now = *active;
            let max = s.max_active.entry(topic.to_string()).or_default();
            *max = (*max).max(now);
            Ok(s
                .committed
                .iter()
                .filter(|((g, t, _), _)| g == group && t == topic)
                .map(|((_, _, p), next)| (*p, *next))
                .collect::<BTreeMap<i32, i64>>())
        })?;
        Ok(Box::new(MemoryStream {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            positions,
            closed: false,
        }))
    }
}

pub struct MemoryStream {
    broker: MemoryBroker,
    topic: String,
    group: String,
    /// partition -> next offset to hand out
    positions: BTreeMap<i32, i64>,
    closed: bool,
}

impl MemoryStream {
    fn next_record(&mut self) -> Result<Option<BrokerRecord>, BrokerError> {
        let topic = self.topic.clone();
        let found = self.broker.with(|s| {
            if let Some(err) = s.poll_errors.get_mut(&topic).and_then(VecDeque::pop_front) {
                return Err(err);
            }
            Ok(s.topics.get(&topic).and_then(|log| {
                log.iter()
                    .find(|r| r.offset >= self.positions.get(&r.partition).copied().unwrap_or(0))
                    .cloned()
            }))
        })?;
        if let Some(record) = &found {
            self.positions.insert(record.partition, record.offset + 1);
        }
        Ok(found)
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            let topic = self.topic.clone();
            self.broker.with(|s| {
                if let Some(active) = s.active.get_mut(&topic) {
                    *active = active.saturating_sub(1);
                }
            });
        }
    }
}

#[async_trait]
impl RecordStream for MemoryStream {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerRecord>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let notify = self.broker.notify.clone();
        let notified = notify.notified();
        if let Some(record) = self.next_record()? {
            return Ok(Some(record));
        }
        if tokio::time::timeout(timeout, notified).await.is_err() {
            log::trace!(target: "cdc::kafka", "memory poll on {} idle for {:?}", self.topic, timeout);
        }
        self.next_record()
    }

    async fn commit(&mut self, offsets: &OffsetMap) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let group = self.group.clone();
        self.broker.with(|s| {
            for (topic, partition, next) in offsets.commit_positions() {
                s.committed
                    .insert((group.clone(), topic.to_string(), partition), next);
            }
            s.commits += 1;
        });
        Ok(())
    }

    async fn lag(&mut self) -> Option<i64> {
        let group = self.group.clone();
        let topic = self.topic.clone();
        Some(self.broker.with(|s| {
            let Some(log) = s.topics.get(&topic) else {
                return 0;
            };
            log.iter()
                .filter(|r| {
                    let committed = s
                        .committed
                        .get(&(group.clone(), topic.clone(), r.partition))
                        .copied()
                        .unwrap_or(0);
                    r.offset >= committed
                })
                .count() as i64
        }))
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: &str = "srv-dbo_T.dbo.T";

    #[tokio::test]
    async fn resumes_from_committed_position() {
        let broker = MemoryBroker::new();
        for i in 0..3 {
            broker.publish(T, Some("k"), Some(&format!("v{i}")));
        }
        let mut stream = broker.subscribe(T, "g").await.unwrap();
        let first = stream.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = stream.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!((first.offset, second.offset), (0, 1));
        let mut offsets = OffsetMap::new();
        offsets.record(&first);
        stream.commit(&offsets).await.unwrap();
        assert_eq!(stream.lag().await, Some(2));
        stream.close().await;
        assert_eq!(broker.committed("g", T, 0), Some(1));

        // 未提交的 offset 1 会被重新投递
        let mut again = broker.subscribe(T, "g").await.unwrap();
        let replay = again.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(replay.offset, 1);
    }

    #[tokio::test]
    async fn poll_wakes_on_publish_and_times_out_when_idle() {
        let broker = MemoryBroker::new();
        broker.create_topic(T);
        let mut stream = broker.subscribe(T, "g").await.unwrap();
        assert_eq!(stream.poll(Duration::from_millis(5)).await, Ok(None));

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(T, None, None);
        });
        let record = stream.poll(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(record.payload, None);
    }

    #[tokio::test]
    async fn tracks_open_streams() {
        let broker = MemoryBroker::new();
        let a = broker.subscribe(T, "g").await.unwrap();
        let mut b = broker.subscribe(T, "g").await.unwrap();
        assert_eq!(broker.active_streams(T), 2);
        b.close().await;
        drop(b);
        drop(a);
        assert_eq!(broker.active_streams(T), 0);
        assert_eq!(broker.max_active_streams(T), 2);
    }
}

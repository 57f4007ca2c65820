use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka_wrap::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka_wrap::error::KafkaError;
use rdkafka_wrap::types::RDKafkaErrorCode;
use rdkafka_wrap::{Message, Offset, TopicPartitionList};

use super::{BrokerError, BrokerRecord, KafkaConf, OffsetMap, RecordStream, StreamFactory, TopicCatalog};

type AnyResult<T> = anyhow::Result<T>;

#[derive(Clone)]
pub struct KafkaErrorWrapper(pub KafkaError);

impl Display for KafkaErrorWrapper {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<KafkaErrorWrapper> for BrokerError {
    fn from(value: KafkaErrorWrapper) -> Self {
        let fatal = matches!(
            value.0.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::TopicAuthorizationFailed
                    | RDKafkaErrorCode::GroupAuthorizationFailed
                    | RDKafkaErrorCode::ClusterAuthorizationFailed
                    | RDKafkaErrorCode::SaslAuthenticationFailed
                    | RDKafkaErrorCode::Authentication
            )
        );
        if fatal {
            BrokerError::Fatal(value.to_string())
        } else {
            BrokerError::Transport(value.to_string())
        }
    }
}

fn broker_err(e: KafkaError) -> BrokerError {
    KafkaErrorWrapper(e).into()
}

pub struct KafkaStreamFactory {
    conf: KafkaConf,
}

impl KafkaStreamFactory {
    pub fn new(conf: KafkaConf) -> Self {
        Self { conf }
    }
}

#[async_trait]
impl StreamFactory for KafkaStreamFactory {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn RecordStream>, BrokerError> {
        let stream = KafkaStream::new(&self.conf, topic, group).map_err(|e| {
            match e.downcast::<KafkaError>() {
                Ok(kafka) => broker_err(kafka),
                Err(other) => BrokerError::Transport(other.to_string()),
            }
        })?;
        Ok(Box::new(stream))
    }
}

pub struct KafkaStream {
    topic: String,
    consumer: Arc<StreamConsumer>,
    metadata_timeout: Duration,
    closed: bool,
}

impl KafkaStream {
    pub fn new(conf: &KafkaConf, topic: &str, group_id: &str) -> AnyResult<Self> {
        log::info!(target: "cdc::kafka", "[kafka] subscribe topic: {}, group_id: {}", topic, group_id);
        let consumer: StreamConsumer = conf.consumer_config(group_id).create()?;
        consumer.subscribe(&[topic])?;
        Ok(Self {
            topic: topic.to_string(),
            consumer: Arc::new(consumer),
            metadata_timeout: conf.metadata_timeout(),
            closed: false,
        })
    }
}

#[async_trait]
impl RecordStream for KafkaStream {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerRecord>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let received = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(received) => received,
        };
        match received {
            Ok(msg) => Ok(Some(BrokerRecord {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(Bytes::copy_from_slice),
                payload: msg.payload().map(Bytes::copy_from_slice),
                timestamp_ms: msg.timestamp().to_millis(),
            })),
            Err(KafkaError::NoMessageReceived) => Ok(None),
            Err(e) => Err(broker_err(e)),
        }
    }

    async fn commit(&mut self, offsets: &OffsetMap) -> Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for (topic, partition, next) in offsets.commit_positions() {
            tpl.add_partition_offset(topic, partition, Offset::Offset(next))
                .map_err(broker_err)?;
        }
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Transport(format!("commit join error: {}", e)))?
            .map_err(broker_err)
    }

    async fn lag(&mut self) -> Option<i64> {
        let consumer = self.consumer.clone();
        let timeout = self.metadata_timeout;
        let topic = self.topic.clone();
        let res = tokio::task::spawn_blocking(move || -> Result<i64, KafkaError> {
            let position = consumer.position()?;
            let mut lag = 0i64;
            for elem in position.elements_for_topic(&topic) {
                let (_, high) = consumer.fetch_watermarks(&topic, elem.partition(), timeout)?;
                if let Offset::Offset(pos) = elem.offset() {
                    lag += (high - pos).max(0);
                }
            }
            Ok(lag)
        })
        .await;
        match res {
            Ok(Ok(lag)) => Some(lag),
            Ok(Err(e)) => {
                log::debug!(target: "cdc::kafka", "lag query for {} fail: {}", self.topic, e);
                None
            }
            Err(_) => None,
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.consumer.unsubscribe();
            self.closed = true;
        }
    }
}

/// Topic listing through cluster metadata.
pub struct KafkaCatalog {
    consumer: Arc<BaseConsumer>,
    timeout: Duration,
}

impl KafkaCatalog {
    pub fn new(conf: &KafkaConf) -> AnyResult<Self> {
        let consumer: BaseConsumer = conf.metadata_config().create()?;
        Ok(Self {
            consumer: Arc::new(consumer),
            timeout: conf.metadata_timeout(),
        })
    }
}

#[async_trait]
impl TopicCatalog for KafkaCatalog {
    async fn list_topics(&self) -> Result<BTreeSet<String>, BrokerError> {
        let consumer = self.consumer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let metadata = consumer.fetch_metadata(None, timeout).map_err(broker_err)?;
            Ok(metadata
                .topics()
                .iter()
                .filter(|t| t.error().is_none() && !t.name().starts_with("__"))
                .map(|t| t.name().to_string())
                .collect())
        })
        .await
        .map_err(|e| BrokerError::Transport(format!("metadata join error: {}", e)))?
    }
}

use std::time::Duration;

use educe::Educe;
use serde::{Deserialize, Serialize};

use crate::conf::{ConfResult, Validate, invalid};

#[derive(Educe, Deserialize, Serialize, PartialEq, Clone)]
#[educe(Debug, Default)]
#[serde(default)]
pub struct KafkaConf {
    #[educe(Default = "localhost:9092")]
    pub brokers: String,
    #[educe(Default = "cdc-consolidator")]
    pub group_id: String,
    /// Extra librdkafka properties, `"key = value"` per entry.
    #[educe(Default(expression = Some(vec![
        "enable.partition.eof = false".to_string(),
        "receive.message.max.bytes = 100001000".to_string(),
    ])))]
    pub config: Option<Vec<String>>,
    #[educe(Default = 1000)]
    pub poll_timeout_ms: u64,
    #[educe(Default = 10_000)]
    pub metadata_timeout_ms: u64,
}

impl KafkaConf {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    /// `config` entries split on the first `=`; malformed entries are skipped.
    pub fn extra_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for c in self.config.iter().flatten() {
            if let Some((k, v)) = c.split_once('=') {
                let (k, v) = (k.trim(), v.trim());
                if !k.is_empty() {
                    pairs.push((k.to_string(), v.to_string()));
                }
            }
        }
        pairs
    }

    /// Consumer settings for one per-topic consumer. Offsets are committed by hand
    /// after the store commit, so auto commit and auto offset store are forced off.
    #[cfg(feature = "kafka")]
    pub fn consumer_config(&self, group_id: &str) -> rdkafka_wrap::ClientConfig {
        let mut conf = rdkafka_wrap::ClientConfig::new();
        conf.set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", "earliest")
            .set_log_level(rdkafka_wrap::config::RDKafkaLogLevel::Info);
        for (k, v) in self.extra_pairs() {
            conf.set(k, v);
        }
        conf.set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");
        conf
    }

    #[cfg(feature = "kafka")]
    pub fn metadata_config(&self) -> rdkafka_wrap::ClientConfig {
        let mut conf = rdkafka_wrap::ClientConfig::new();
        conf.set("bootstrap.servers", &self.brokers)
            .set("group.id", format!("{}-discovery", self.group_id))
            .set_log_level(rdkafka_wrap::config::RDKafkaLogLevel::Info);
        conf
    }
}

impl Validate for KafkaConf {
    fn validate(&self) -> ConfResult<()> {
        if self.brokers.trim().is_empty() {
            return invalid("kafka.brokers must not be empty");
        }
        if self.group_id.trim().is_empty() {
            return invalid("kafka.group_id must not be empty");
        }
        if self.poll_timeout_ms == 0 {
            return invalid("kafka.poll_timeout_ms must be > 0");
        }
        Ok(())
    }
}

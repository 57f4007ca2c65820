use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounterVec, IntGaugeVec, TextEncoder, register_int_counter_vec,
    register_int_gauge_vec,
};
use uuid::Uuid;

// 每个指标的标签集合；pid 区分同一 scrape 目标下的多个进程实例
macro_rules! generate_metrics {
    ($name:ident; $($field:ident), *) => {
        #[derive(Default, Debug)] pub struct $name { $(pub $field: String,)* }
        impl $name { pub fn new() -> $name { $name{ pid: PID.to_string(), .. Default::default() } }
            pub fn labels() -> Vec<&'static str> { vec![ $( stringify!($field), )* ] }
            pub fn values(&self) -> Vec<&str> { vec![ $( self.$field.as_str(), )* ] }
        }
    };
}

generate_metrics!(ProcessMetrics; pid);
generate_metrics!(TableMetrics; pid, table);
generate_metrics!(TopicMetrics; pid, topic);
generate_metrics!(ConnectorMetrics; pid, connector);

fn table(name: &str) -> TableMetrics {
    TableMetrics {
        table: name.to_string(),
        ..TableMetrics::new()
    }
}

fn topic(name: &str) -> TopicMetrics {
    TopicMetrics {
        topic: name.to_string(),
        ..TopicMetrics::new()
    }
}

pub fn records_written(table_name: &str, count: u64) {
    if count > 0 {
        RECORDS_WRITTEN.with_label_values(&table(table_name).values()).inc_by(count);
    }
}

pub fn duplicates_skipped(table_name: &str, count: u64) {
    if count > 0 {
        DUPLICATES_SKIPPED.with_label_values(&table(table_name).values()).inc_by(count);
    }
}

pub fn quarantined(table_name: &str) {
    QUARANTINED.with_label_values(&table(table_name).values()).inc();
}

pub fn decode_failed(topic_name: &str) {
    DECODE_FAILURES.with_label_values(&topic(topic_name).values()).inc();
}

pub fn store_retried() {
    STORE_RETRIES.with_label_values(&ProcessMetrics::new().values()).inc();
}

pub fn consumer_restarted(topic_name: &str) {
    CONSUMER_RESTARTS.with_label_values(&topic(topic_name).values()).inc();
}

pub fn connector_failed(name: &str) {
    let labels = ConnectorMetrics {
        connector: name.to_string(),
        ..ConnectorMetrics::new()
    };
    CONNECTOR_FAILURES.with_label_values(&labels.values()).inc();
}

pub fn discovery_failed() {
    DISCOVERY_FAILURES.with_label_values(&ProcessMetrics::new().values()).inc();
}

pub fn set_live_consumers(count: usize) {
    LIVE_CONSUMERS
        .with_label_values(&ProcessMetrics::new().values())
        .set(count as i64);
}

pub fn set_lag(topic_name: &str, lag: i64) {
    CONSUMER_LAG.with_label_values(&topic(topic_name).values()).set(lag);
}

pub fn clear_lag(topic_name: &str) {
    if let Err(e) = CONSUMER_LAG.remove_label_values(&topic(topic_name).values()) {
        log::debug!(target: "cdc::health", "clear lag for {}: {}", topic_name, e);
    }
}

pub fn instance_id() -> String {
    PID.to_string()
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        log::error!(target: "cdc::health", "prometheus encode error: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

lazy_static! {
    static ref PID: String = Uuid::new_v4().to_string();
    pub static ref RECORDS_WRITTEN: IntCounterVec = register_int_counter_vec!(
        "cdc_records_written",
        "Change records inserted into the consolidated table.",
        &TableMetrics::labels()
    )
    .expect("register cdc_records_written fail");
    pub static ref DUPLICATES_SKIPPED: IntCounterVec = register_int_counter_vec!(
        "cdc_duplicates_skipped",
        "Redelivered change records ignored by the store.",
        &TableMetrics::labels()
    )
    .expect("register cdc_duplicates_skipped fail");
    pub static ref QUARANTINED: IntCounterVec = register_int_counter_vec!(
        "cdc_quarantined",
        "Records the store rejected permanently.",
        &TableMetrics::labels()
    )
    .expect("register cdc_quarantined fail");
    pub static ref DECODE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "cdc_decode_failures",
        "Broker records that could not be decoded as change envelopes.",
        &TopicMetrics::labels()
    )
    .expect("register cdc_decode_failures fail");
    pub static ref STORE_RETRIES: IntCounterVec = register_int_counter_vec!(
        "cdc_store_retries",
        "Batch writes retried after a transient store error.",
        &ProcessMetrics::labels()
    )
    .expect("register cdc_store_retries fail");
    pub static ref CONSUMER_RESTARTS: IntCounterVec = register_int_counter_vec!(
        "cdc_consumer_restarts",
        "Consumer tasks restarted by the health monitor.",
        &TopicMetrics::labels()
    )
    .expect("register cdc_consumer_restarts fail");
    pub static ref CONNECTOR_FAILURES: IntCounterVec = register_int_counter_vec!(
        "cdc_connector_failures",
        "Connector transitions into the failed state.",
        &ConnectorMetrics::labels()
    )
    .expect("register cdc_connector_failures fail");
    pub static ref DISCOVERY_FAILURES: IntCounterVec = register_int_counter_vec!(
        "cdc_discovery_failures",
        "Topic listings that failed.",
        &ProcessMetrics::labels()
    )
    .expect("register cdc_discovery_failures fail");
    pub static ref LIVE_CONSUMERS: IntGaugeVec = register_int_gauge_vec!(
        "cdc_live_consumers",
        "Consumer tasks currently running.",
        &ProcessMetrics::labels()
    )
    .expect("register cdc_live_consumers fail");
    pub static ref CONSUMER_LAG: IntGaugeVec = register_int_gauge_vec!(
        "cdc_consumer_lag",
        "Uncommitted records per topic.",
        &TopicMetrics::labels()
    )
    .expect("register cdc_consumer_lag fail");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_carry_pid() {
        let labels = table("dbo.Orders");
        assert_eq!(TableMetrics::labels(), vec!["pid", "table"]);
        assert_eq!(labels.values()[1], "dbo.Orders");
        assert!(!labels.pid.is_empty());
    }

    #[test]
    fn render_exposes_counters() {
        records_written("dbo.MetricsProbe", 3);
        set_lag("metrics-probe-topic", 7);
        let text = render();
        assert!(text.contains("cdc_records_written"));
        assert!(text.contains("dbo.MetricsProbe"));
        assert!(text.contains("metrics-probe-topic"));
        clear_lag("metrics-probe-topic");
        assert!(!render().contains("metrics-probe-topic"));
    }
}

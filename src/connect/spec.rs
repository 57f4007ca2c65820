use std::fmt::{Debug, Formatter};

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::conf::ConnectConf;
use crate::topology::TableBinding;

/// `{name, config}` as posted to `/connectors`.
#[derive(Clone, PartialEq, Serialize)]
pub struct ConnectorSpec {
    pub name: String,
    pub config: Map<String, Value>,
}

impl Debug for ConnectorSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorSpec")
            .field("name", &self.name)
            .field("keys", &self.config.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConnectorSpec {
    /// Pure function of the binding and the connect section: the same inputs always
    /// produce the same document, which is what makes reconciliation a no-op on rerun.
    pub fn derive(binding: &TableBinding, conf: &ConnectConf, history_servers: &str) -> Self {
        let source = &binding.source;
        let mut config = Map::new();
        config.insert("connector.class".into(), json!(conf.connector_class));
        config.insert("database.hostname".into(), json!(source.hostname));
        config.insert("database.port".into(), json!(source.port.to_string()));
        config.insert("database.user".into(), json!(source.user));
        config.insert("database.password".into(), json!(source.password));
        config.insert("database.dbname".into(), json!(source.database));
        config.insert("database.server.name".into(), json!(binding.logical_server()));
        config.insert("topic.prefix".into(), json!(binding.logical_server()));
        config.insert("table.include.list".into(), json!(binding.table.to_string()));
        config.insert(
            "database.history.kafka.bootstrap.servers".into(),
            json!(history_servers),
        );
        config.insert(
            "database.history.kafka.topic".into(),
            json!(binding.history_topic()),
        );
        config.insert(
            "database.history.kafka.recovery.poll.interval.ms".into(),
            json!(conf.recovery_poll_interval_ms.to_string()),
        );
        config.insert(
            "database.history.kafka.recovery.attempts".into(),
            json!(conf.recovery_attempts.to_string()),
        );
        config.insert("tasks.max".into(), json!(conf.tasks_max.to_string()));
        config.insert("snapshot.mode".into(), json!(conf.snapshot_mode));
        config.insert(
            "topic.creation.default.replication.factor".into(),
            json!(conf.topic_replication_factor),
        );
        config.insert(
            "topic.creation.default.partitions".into(),
            json!(conf.topic_partitions),
        );
        config.insert(
            "topic.creation.enable".into(),
            json!(conf.topic_creation_enable),
        );
        for (k, v) in &conf.extra {
            // extra 不允许覆盖推导出来的关键字段
            config.entry(k.clone()).or_insert_with(|| json!(v));
        }
        Self {
            name: binding.connector_name(&conf.connector_prefix),
            config,
        }
    }

    /// Compare against the config the control plane reports. The control plane echoes
    /// every value back as a string and adds `name`, so both are normalised away.
    pub fn matches(&self, remote: &Map<String, Value>) -> bool {
        let ours: Vec<(&String, String)> = self
            .config
            .iter()
            .filter(|(k, _)| k.as_str() != "name")
            .map(|(k, v)| (k, stringify(v)))
            .collect();
        let theirs = remote.keys().filter(|k| k.as_str() != "name").count();
        ours.len() == theirs
            && ours
                .iter()
                .all(|(k, v)| remote.get(k.as_str()).map(stringify).as_deref() == Some(v.as_str()))
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::tests::axlap_topology;

    fn spec() -> ConnectorSpec {
        let binding = axlap_topology().bindings().remove(0);
        ConnectorSpec::derive(&binding, &ConnectConf::default(), "kafka:29092")
    }

    #[test]
    fn derives_connector_document() {
        let spec = spec();
        assert_eq!(spec.name, "mssql-source-connector-AXLAP240-dbo_Customers");
        let get = |k: &str| spec.config.get(k).cloned().unwrap_or(Value::Null);
        assert_eq!(get("database.server.name"), json!("AXLAP240-dbo_Customers"));
        assert_eq!(get("topic.prefix"), json!("AXLAP240-dbo_Customers"));
        assert_eq!(get("table.include.list"), json!("dbo.Customers"));
        assert_eq!(get("database.port"), json!("1433"));
        assert_eq!(
            get("database.history.kafka.topic"),
            json!("dbhistory.AXLAP240-dbo_Customers")
        );
        assert_eq!(get("topic.creation.default.partitions"), json!(1));
        assert_eq!(get("topic.creation.enable"), json!(true));
        assert_eq!(get("database.encrypt"), json!("false"));
    }

    #[test]
    fn extras_never_override_derived_keys() {
        let binding = axlap_topology().bindings().remove(0);
        let mut conf = ConnectConf::default();
        conf.extra
            .insert("table.include.list".into(), "dbo.Everything".into());
        let spec = ConnectorSpec::derive(&binding, &conf, "k:9092");
        assert_eq!(spec.config["table.include.list"], json!("dbo.Customers"));
    }

    #[test]
    fn matches_stringified_remote_config() {
        let spec = spec();
        let mut remote: Map<String, Value> = spec
            .config
            .iter()
            .map(|(k, v)| (k.clone(), json!(stringify(v))))
            .collect();
        remote.insert("name".into(), json!(spec.name));
        assert!(spec.matches(&remote));

        remote.insert("snapshot.mode".into(), json!("schema_only"));
        assert!(!spec.matches(&remote));
        remote.insert("snapshot.mode".into(), json!("initial"));

        remote.insert("unexpected.key".into(), json!("x"));
        assert!(!spec.matches(&remote));
    }

    #[test]
    fn debug_hides_values() {
        assert!(!format!("{:?}", spec()).contains("secret"));
    }
}

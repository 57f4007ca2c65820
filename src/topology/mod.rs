//! Declarative source topology: which servers feed the consolidation and which of their
//! tables are captured.
//!
//! 所有派生名称（topic、connector、history topic、逻辑 server 名）都是
//! [`TableBinding`] 上的纯函数，重启或重载后无需任何持久化状态即可重新计算，
//! 这也是对账可以反复执行的前提。

mod env;
mod table;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use educe::Educe;
use serde::{Deserialize, Serialize};

pub use table::QualifiedTable;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TopologyError {
    #[error("invalid table name '{input}': {reason}")]
    InvalidTable { input: String, reason: String },
    #[error("source '{server}': {field} must not be empty")]
    MissingField { server: String, field: &'static str },
    #[error("invalid server name '{0}': only [A-Za-z0-9._-] allowed")]
    InvalidServerName(String),
    #[error("duplicate source server name '{0}'")]
    DuplicateServer(String),
    #[error("topic '{topic}' derived by both {first} and {second}")]
    TopicCollision {
        topic: String,
        first: String,
        second: String,
    },
}

/// One `[[sources]]` entry as written in configuration.
#[derive(Educe, Deserialize, Serialize, PartialEq, Clone)]
#[educe(Debug, Default)]
#[serde(default)]
pub struct SourceConf {
    pub server_name: String,
    pub hostname: String,
    #[educe(Default = 1433)]
    pub port: u16,
    pub user: String,
    #[educe(Debug(ignore))]
    pub password: String,
    pub database: String,
    pub tables: Vec<String>,
    /// Defaults to `dbhistory.{server_name}`.
    pub history_topic: Option<String>,
    /// Primary-key columns per qualified table, used to derive record identity.
    pub primary_keys: BTreeMap<String, Vec<String>>,
}

/// Validated, immutable view of a [`SourceConf`].
#[derive(Clone, PartialEq)]
pub struct SourceDescriptor {
    pub server_name: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub tables: Vec<QualifiedTable>,
    pub history_topic: String,
    pub primary_keys: BTreeMap<QualifiedTable, Vec<String>>,
}

impl Debug for SourceDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("server_name", &self.server_name)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

impl SourceDescriptor {
    pub fn from_conf(conf: &SourceConf) -> Result<Self, TopologyError> {
        let server = conf.server_name.trim();
        if server.is_empty() {
            return Err(TopologyError::MissingField {
                server: conf.hostname.clone(),
                field: "server_name",
            });
        }
        if !server
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(TopologyError::InvalidServerName(server.to_string()));
        }
        for (field, value) in [
            ("hostname", &conf.hostname),
            ("user", &conf.user),
            ("database", &conf.database),
        ] {
            if value.trim().is_empty() {
                return Err(TopologyError::MissingField {
                    server: server.to_string(),
                    field,
                });
            }
        }

        let mut tables = Vec::with_capacity(conf.tables.len());
        for raw in &conf.tables {
            let table = QualifiedTable::parse(raw)?;
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        let mut primary_keys = BTreeMap::new();
        for (raw, cols) in &conf.primary_keys {
            let cols: Vec<String> = cols
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            if !cols.is_empty() {
                primary_keys.insert(QualifiedTable::parse(raw)?, cols);
            }
        }

        Ok(Self {
            server_name: server.to_string(),
            hostname: conf.hostname.trim().to_string(),
            port: conf.port,
            user: conf.user.clone(),
            password: conf.password.clone(),
            database: conf.database.trim().to_string(),
            tables,
            history_topic: conf
                .history_topic
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("dbhistory.{server}")),
            primary_keys,
        })
    }
}

/// A (source, table) pair; the unit that gets one connector, one topic and one consumer.
#[derive(Debug, Clone)]
pub struct TableBinding {
    pub source: Arc<SourceDescriptor>,
    pub table: QualifiedTable,
}

impl PartialEq for TableBinding {
    fn eq(&self, other: &Self) -> bool {
        self.source.server_name == other.source.server_name && self.table == other.table
    }
}

impl Eq for TableBinding {}

impl TableBinding {
    pub fn new(source: Arc<SourceDescriptor>, table: QualifiedTable) -> Self {
        Self { source, table }
    }

    pub fn server(&self) -> &str {
        &self.source.server_name
    }

    pub fn table_safe(&self) -> String {
        self.table.safe_name()
    }

    /// Logical server name handed to the capture connector: `{SERVER}-{TABLE_SAFE}`.
    pub fn logical_server(&self) -> String {
        format!("{}-{}", self.source.server_name, self.table_safe())
    }

    /// `{SERVER}-{TABLE_SAFE}.{SCHEMA}.{TABLE}`, with characters the broker rejects
    /// replaced by `_` the same way the capture framework does.
    pub fn topic_name(&self) -> String {
        sanitize_topic(&format!(
            "{}.{}.{}",
            self.logical_server(),
            self.table.schema,
            self.table.table
        ))
    }

    /// `{prefix}-{server}-{table_safe}`
    pub fn connector_name(&self, prefix: &str) -> String {
        format!("{}-{}-{}", prefix, self.source.server_name, self.table_safe())
    }

    /// History topics are scoped per source and per table, one per connector.
    pub fn history_topic(&self) -> String {
        format!("{}-{}", self.source.history_topic, self.table_safe())
    }

    pub fn primary_key(&self) -> Option<&[String]> {
        self.source.primary_keys.get(&self.table).map(Vec::as_slice)
    }
}

fn sanitize_topic(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    sources: Vec<Arc<SourceDescriptor>>,
}

impl Topology {
    pub fn new(confs: &[SourceConf]) -> Result<Self, TopologyError> {
        let mut sources: Vec<Arc<SourceDescriptor>> = Vec::with_capacity(confs.len());
        let mut seen = BTreeSet::new();
        for conf in confs {
            let desc = SourceDescriptor::from_conf(conf)?;
            if !seen.insert(desc.server_name.clone()) {
                return Err(TopologyError::DuplicateServer(desc.server_name));
            }
            if desc.tables.is_empty() {
                log::warn!(target: "cdc::topology", "source {} has no tables configured", desc.server_name);
            }
            sources.push(Arc::new(desc));
        }
        let topology = Self { sources };
        topology.validate()?;
        Ok(topology)
    }

    /// Derived topic names must be unique across the whole topology.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut owners: BTreeMap<String, String> = BTreeMap::new();
        for binding in self.bindings() {
            let owner = format!("{}:{}", binding.server(), binding.table);
            if let Some(first) = owners.insert(binding.topic_name(), owner.clone()) {
                return Err(TopologyError::TopicCollision {
                    topic: binding.topic_name(),
                    first,
                    second: owner,
                });
            }
        }
        Ok(())
    }

    pub fn sources(&self) -> &[Arc<SourceDescriptor>] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.sources.iter().all(|s| s.tables.is_empty())
    }

    pub fn bindings(&self) -> Vec<TableBinding> {
        self.sources
            .iter()
            .flat_map(|source| {
                source
                    .tables
                    .iter()
                    .map(|table| TableBinding::new(source.clone(), table.clone()))
            })
            .collect()
    }

    /// Desired topic set keyed by topic name.
    pub fn desired_topics(&self) -> BTreeMap<String, TableBinding> {
        self.bindings()
            .into_iter()
            .map(|b| (b.topic_name(), b))
            .collect()
    }

    pub fn binding_for_topic(&self, topic: &str) -> Option<TableBinding> {
        self.bindings().into_iter().find(|b| b.topic_name() == topic)
    }
}

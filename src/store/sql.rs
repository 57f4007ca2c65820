use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr,
    Statement, TransactionTrait, Value,
};

use super::{ChangeStore, ConsolidatedRecord, StoreError};
use crate::conf::StoreConf;

const COLUMNS: [&str; 14] = [
    "change_key",
    "source_server",
    "source_database",
    "source_table",
    "topic_name",
    "kafka_partition",
    "kafka_offset",
    "operation",
    "record_id",
    "before_data",
    "after_data",
    "full_payload",
    "source_ts_ms",
    "processed_at_ms",
];

/// 单条语句的行数上限，兼顾 SQLite 旧版本 999 个绑定参数的限制
const ROWS_PER_STATEMENT: usize = 64;

pub struct SqlStore {
    db: DatabaseConnection,
    backend: DatabaseBackend,
    table: String,
}

impl SqlStore {
    pub async fn connect(conf: &StoreConf) -> Result<Self, StoreError> {
        let mut opts = ConnectOptions::new(conf.url.clone());
        opts.max_connections(conf.max_connections)
            .connect_timeout(Duration::from_millis(conf.connect_timeout_ms))
            .acquire_timeout(Duration::from_millis(conf.acquire_timeout_ms))
            .sqlx_logging(false);
        let db = Database::connect(opts).await?;
        log::info!(
            target: "cdc::writer",
            "store connected, backend: {:?}, table: {}",
            db.get_database_backend(),
            conf.table
        );
        Ok(Self::from_connection(db, &conf.table))
    }

    pub fn from_connection(db: DatabaseConnection, table: &str) -> Self {
        let backend = db.get_database_backend();
        Self {
            db,
            backend,
            table: table.to_string(),
        }
    }

    fn quote(&self, ident: &str) -> String {
        match self.backend {
            DatabaseBackend::MySql => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    fn ddl(&self) -> Vec<String> {
        let t = self.quote(&self.table);
        let ix = |suffix: &str| self.quote(&format!("ix_{}_{}", self.table, suffix));
        match self.backend {
            DatabaseBackend::MySql => vec![format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                    change_key CHAR(32) NOT NULL,
                    source_server VARCHAR(255) NOT NULL,
                    source_database VARCHAR(255) NOT NULL,
                    source_table VARCHAR(255) NOT NULL,
                    topic_name VARCHAR(512) NOT NULL,
                    kafka_partition INT NOT NULL,
                    kafka_offset BIGINT NOT NULL,
                    operation VARCHAR(16) NOT NULL,
                    record_id VARCHAR(512) NOT NULL,
                    before_data LONGTEXT NULL,
                    after_data LONGTEXT NULL,
                    full_payload LONGTEXT NULL,
                    source_ts_ms BIGINT NOT NULL,
                    processed_at_ms BIGINT NOT NULL,
                    UNIQUE KEY {uk} (change_key),
                    KEY {table_ts} (source_table, source_ts_ms),
                    KEY {op_ts} (operation, source_ts_ms),
                    KEY {topic_ts} (topic_name(191), source_ts_ms)
                ) DEFAULT CHARSET = utf8mb4",
                uk = ix("change_key"),
                table_ts = ix("table_ts"),
                op_ts = ix("op_ts"),
                topic_ts = ix("topic_ts"),
            )],
            backend => {
                let id = if backend == DatabaseBackend::Postgres {
                    "id BIGSERIAL PRIMARY KEY"
                } else {
                    "id INTEGER PRIMARY KEY AUTOINCREMENT"
                };
                vec![
                    format!(
                        "CREATE TABLE IF NOT EXISTS {t} (
                            {id},
                            change_key VARCHAR(32) NOT NULL UNIQUE,
                            source_server VARCHAR(255) NOT NULL,
                            source_database VARCHAR(255) NOT NULL,
                            source_table VARCHAR(255) NOT NULL,
                            topic_name VARCHAR(512) NOT NULL,
                            kafka_partition INTEGER NOT NULL,
                            kafka_offset BIGINT NOT NULL,
                            operation VARCHAR(16) NOT NULL,
                            record_id VARCHAR(512) NOT NULL,
                            before_data TEXT NULL,
                            after_data TEXT NULL,
                            full_payload TEXT NULL,
                            source_ts_ms BIGINT NOT NULL,
                            processed_at_ms BIGINT NOT NULL
                        )"
                    ),
                    format!("CREATE INDEX IF NOT EXISTS {} ON {t} (source_table, source_ts_ms)", ix("table_ts")),
                    format!("CREATE INDEX IF NOT EXISTS {} ON {t} (operation, source_ts_ms)", ix("op_ts")),
                    format!("CREATE INDEX IF NOT EXISTS {} ON {t} (topic_name, source_ts_ms)", ix("topic_ts")),
                ]
            }
        }
    }

    fn insert_prefix(&self) -> String {
        let verb = match self.backend {
            DatabaseBackend::MySql => "INSERT IGNORE INTO",
            _ => "INSERT INTO",
        };
        format!(
            "{} {} ({}) VALUES ",
            verb,
            self.quote(&self.table),
            COLUMNS.join(", ")
        )
    }

    /// Multi-row insert-or-ignore keyed on `change_key`.
    fn insert_sql(&self, rows: usize) -> String {
        let width = COLUMNS.len();
        let tuples: Vec<String> = (0..rows)
            .map(|row| {
                let marks: Vec<String> = (0..width)
                    .map(|col| match self.backend {
                        DatabaseBackend::Postgres => format!("${}", row * width + col + 1),
                        _ => "?".to_string(),
                    })
                    .collect();
                format!("({})", marks.join(", "))
            })
            .collect();
        // sqlx-mysql 握手时总是带 FOUND_ROWS，ON DUPLICATE KEY UPDATE 会把命中的重复行也计入
        // affected rows；INSERT IGNORE 只统计真正插入的行
        let conflict = match self.backend {
            DatabaseBackend::MySql => "",
            _ => " ON CONFLICT (change_key) DO NOTHING",
        };
        format!("{}{}{}", self.insert_prefix(), tuples.join(", "), conflict)
    }

    fn values(record: &ConsolidatedRecord) -> [Value; 14] {
        [
            record.change_key.clone().into(),
            record.source_server.clone().into(),
            record.source_database.clone().into(),
            record.source_table.clone().into(),
            record.topic_name.clone().into(),
            record.kafka_partition.into(),
            record.kafka_offset.into(),
            record.operation.as_str().to_string().into(),
            record.record_id.clone().into(),
            record.before_data.clone().into(),
            record.after_data.clone().into(),
            record.full_payload.clone().into(),
            record.source_ts_ms.into(),
            record.processed_at_ms.into(),
        ]
    }

    /// `(operation, change_key)` rows for one record id in insertion order.
    pub async fn history(&self, table: &str, record_id: &str) -> Result<Vec<(String, String)>, StoreError> {
        let placeholders = match self.backend {
            DatabaseBackend::Postgres => ("$1", "$2"),
            _ => ("?", "?"),
        };
        let sql = format!(
            "SELECT operation, change_key FROM {} WHERE source_table = {} AND record_id = {} ORDER BY id",
            self.quote(&self.table),
            placeholders.0,
            placeholders.1
        );
        let rows = self
            .db
            .query_all(Statement::from_sql_and_values(
                self.backend,
                sql,
                [table.into(), record_id.into()],
            ))
            .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String>("", "operation")?,
                    row.try_get::<String>("", "change_key")?,
                ))
            })
            .collect::<Result<Vec<_>, DbErr>>()
            .map_err(StoreError::from)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) AS n FROM {}", self.quote(&self.table));
        let row = self
            .db
            .query_one(Statement::from_string(self.backend, sql))
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<i64>("", "n")?),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl ChangeStore for SqlStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for sql in self.ddl() {
            self.db
                .execute(Statement::from_string(self.backend, sql))
                .await?;
        }
        log::info!(target: "cdc::writer", "schema ready: {}", self.table);
        Ok(())
    }

    async fn write_batch(&self, records: &[ConsolidatedRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin().await?;
        let mut inserted = 0u64;
        for chunk in records.chunks(ROWS_PER_STATEMENT) {
            let values: Vec<Value> = chunk.iter().flat_map(Self::values).collect();
            let stmt = Statement::from_sql_and_values(self.backend, self.insert_sql(chunk.len()), values);
            match txn.execute(stmt).await {
                Ok(res) => inserted += res.rows_affected(),
                Err(e) => {
                    if let Err(rollback) = txn.rollback().await {
                        log::warn!(target: "cdc::writer", "rollback fail: {}", rollback);
                    }
                    return Err(e.into());
                }
            }
        }
        txn.commit().await?;
        Ok(inserted)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.db.ping().await.map_err(StoreError::from)
    }
}

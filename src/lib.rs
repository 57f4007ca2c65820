//! wp-cdc-consolidator: per-table CDC connectors folded into one idempotent change store.
//!
//! 数据流：topology → connect（注册 connector）→ broker → discovery → pool
//! → envelope（解码）→ writer（先落库，再提交 offset）。

pub type AnyResult<T> = anyhow::Result<T>;

pub mod conf;
pub mod connect;
pub mod discovery;
pub mod envelope;
pub mod health;
pub mod pool;
pub mod retry;
pub mod service;
pub mod store;
pub mod topology;
pub mod writer;

// Kafka：trait 与内存实现始终可用，rdkafka 实现受 feature = "kafka" 控制（默认启用）
pub mod kafka;

pub use conf::AppConf;
pub use service::Consolidator;
pub use topology::{QualifiedTable, SourceConf, SourceDescriptor, TableBinding, Topology};

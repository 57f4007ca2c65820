//! Debezium-style change envelope decoding.
//!
//! 支持两种外形：裸 envelope，或 JsonConverter 开启 schema 时的 `{schema, payload}` 包装。
//! 行镜像统一转成规范化 JSON 文本（键有序），保证同一行多次投递得到相同字节。

use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use xxhash_rust::xxh3::xxh3_64;

use crate::conf::PipelineConf;
use crate::kafka::BrokerRecord;
use crate::topology::TableBinding;

/// Identity prefix for rows with no usable key, followed by a digest of the row image.
pub const ROW_DIGEST_PREFIX: &str = "row:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
    /// Snapshot read; applied like a create.
    Snapshot,
}

impl OpKind {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "c" => Some(OpKind::Create),
            "u" => Some(OpKind::Update),
            "d" => Some(OpKind::Delete),
            "r" => Some(OpKind::Snapshot),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Snapshot => "snapshot",
        }
    }

    fn requires_after(&self) -> bool {
        !matches!(self, OpKind::Delete)
    }
}

impl Display for OpKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no 'op'")]
    MissingOp,
    #[error("unknown operation '{0}'")]
    UnknownOp(String),
    #[error("{op} event without '{image}' image")]
    MissingImage { op: OpKind, image: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub server: String,
    pub database: String,
    /// `schema.table`
    pub table: String,
    pub op: OpKind,
    pub identity: String,
    pub before: Option<String>,
    pub after: Option<String>,
    pub source_ts_ms: i64,
    /// Log position reported by the source (LSN, binlog coordinates), when present.
    pub source_position: Option<String>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Option<String>,
}

impl ChangeEvent {
    /// Identity derived from the row image rather than a key.
    pub fn is_keyless(&self) -> bool {
        self.identity.starts_with(ROW_DIGEST_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(Box<ChangeEvent>),
    /// Null payload: compaction marker following a delete.
    Tombstone,
    /// Snapshot read dropped by configuration.
    SkippedSnapshot,
}

#[derive(Debug, Clone)]
pub struct EnvelopeDecoder {
    key_candidates: Vec<String>,
    skip_snapshot_reads: bool,
    keep_payload: bool,
}

impl EnvelopeDecoder {
    pub fn new(conf: &PipelineConf, keep_payload: bool) -> Self {
        Self {
            key_candidates: conf.key_candidates.clone(),
            skip_snapshot_reads: conf.skip_snapshot_reads,
            keep_payload,
        }
    }

    pub fn decode(
        &self,
        record: &BrokerRecord,
        binding: Option<&TableBinding>,
    ) -> Result<Decoded, DecodeError> {
        let Some(raw) = record.payload.as_ref().filter(|p| !p.is_empty()) else {
            return Ok(Decoded::Tombstone);
        };
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        let envelope = match unwrap_converter(value) {
            Value::Null => return Ok(Decoded::Tombstone),
            Value::Object(map) => map,
            _ => return Err(DecodeError::NotAnObject),
        };

        let op_code = envelope
            .get("op")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingOp)?;
        let op = OpKind::from_code(op_code).ok_or_else(|| DecodeError::UnknownOp(op_code.to_string()))?;
        if op == OpKind::Snapshot && self.skip_snapshot_reads {
            return Ok(Decoded::SkippedSnapshot);
        }

        let before = image(&envelope, "before");
        let after = image(&envelope, "after");
        if op.requires_after() && after.is_none() {
            return Err(DecodeError::MissingImage { op, image: "after" });
        }
        if op == OpKind::Delete && before.is_none() {
            return Err(DecodeError::MissingImage { op, image: "before" });
        }

        let source = envelope.get("source").and_then(Value::as_object);
        let source_str = |field: &str| {
            source
                .and_then(|s| s.get(field))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        };

        let server = source_str("name")
            .map(str::to_string)
            .or_else(|| binding.map(|b| b.server().to_string()))
            .unwrap_or_default();
        let database = source_str("db")
            .map(str::to_string)
            .or_else(|| binding.map(|b| b.source.database.clone()))
            .unwrap_or_default();
        let table = match (source_str("schema"), source_str("table")) {
            (Some(schema), Some(table)) => format!("{schema}.{table}"),
            (None, Some(table)) => binding
                .map(|b| format!("{}.{}", b.table.schema, table))
                .unwrap_or_else(|| table.to_string()),
            _ => binding.map(|b| b.table.to_string()).unwrap_or_default(),
        };

        let source_ts_ms = source
            .and_then(|s| s.get("ts_ms"))
            .and_then(Value::as_i64)
            .or_else(|| envelope.get("ts_ms").and_then(Value::as_i64))
            .or(record.timestamp_ms)
            .unwrap_or(0);

        let identity = self.identity(
            record.key.as_deref(),
            binding.and_then(|b| b.primary_key()),
            after.as_ref(),
            before.as_ref(),
        );

        Ok(Decoded::Event(Box::new(ChangeEvent {
            server,
            database,
            table,
            op,
            identity,
            before: before.as_ref().map(canonical),
            after: after.as_ref().map(canonical),
            source_ts_ms,
            source_position: source.and_then(source_position),
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            payload: self
                .keep_payload
                .then(|| String::from_utf8_lossy(raw).into_owned()),
        })))
    }

    /// Message key fields, then configured primary key, then the candidate column
    /// list, then a digest of the row image.
    fn identity(
        &self,
        key: Option<&[u8]>,
        primary_key: Option<&[String]>,
        after: Option<&Map<String, Value>>,
        before: Option<&Map<String, Value>>,
    ) -> String {
        if let Some(id) = key.and_then(key_identity) {
            return id;
        }
        let images: Vec<&Map<String, Value>> = after.into_iter().chain(before).collect();
        if let Some(cols) = primary_key {
            for image in &images {
                let parts: Option<Vec<String>> = cols
                    .iter()
                    .map(|c| image.get(c).filter(|v| !v.is_null()).map(scalar))
                    .collect();
                if let Some(parts) = parts {
                    return parts.join(",");
                }
            }
        }
        for image in &images {
            for candidate in &self.key_candidates {
                if let Some(v) = image.get(candidate).filter(|v| !v.is_null()) {
                    return scalar(v);
                }
            }
        }
        let digest = images
            .first()
            .map(|m| xxh3_64(canonical(m).as_bytes()))
            .unwrap_or(0);
        format!("{ROW_DIGEST_PREFIX}{digest:016x}")
    }
}

/// Strip the `{schema, payload}` wrapper when present.
fn unwrap_converter(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("payload") && map.contains_key("schema") => {
            map.remove("payload").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn image(envelope: &Map<String, Value>, field: &str) -> Option<Map<String, Value>> {
    envelope.get(field).and_then(Value::as_object).cloned()
}

/// JSON text with object keys sorted at every level.
pub fn canonical(map: &Map<String, Value>) -> String {
    let mut out = String::new();
    write_object(map, &mut out);
    out
}

fn write_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        if let Some(v) = map.get(key) {
            write_value(v, out);
        }
    }
    out.push('}');
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn key_identity(raw: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    match unwrap_converter(value) {
        Value::Object(map) if !map.is_empty() => {
            if map.len() == 1 {
                return map.values().next().map(scalar);
            }
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            Some(
                fields
                    .into_iter()
                    .map(|(k, v)| format!("{}={}", k, scalar(v)))
                    .collect::<Vec<_>>()
                    .join(","),
            )
        }
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn source_position(source: &Map<String, Value>) -> Option<String> {
    let get = |k: &str| source.get(k).filter(|v| !v.is_null()).map(scalar);
    if let Some(lsn) = get("change_lsn") {
        return Some(match get("event_serial_no") {
            Some(serial) => format!("{lsn}:{serial}"),
            None => lsn,
        });
    }
    if let Some(lsn) = get("lsn") {
        return Some(lsn);
    }
    match (get("file"), get("pos")) {
        (Some(file), Some(pos)) => Some(format!("{}:{}:{}", file, pos, get("row").unwrap_or_default())),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::topology::tests::axlap_topology;
    use serde_json::json;

    pub(crate) fn envelope(op: &str, before: Value, after: Value, ts: i64) -> String {
        json!({
            "before": before,
            "after": after,
            "source": {
                "version": "2.5.0.Final",
                "connector": "sqlserver",
                "name": "AXLAP240-dbo_Customers",
                "ts_ms": ts,
                "db": "TestCDC",
                "schema": "dbo",
                "table": "Customers",
                "change_lsn": format!("00000027:00000{ts}:0002"),
                "event_serial_no": 1
            },
            "op": op,
            "ts_ms": ts + 5
        })
        .to_string()
    }

    fn record(payload: Option<&str>, key: Option<&str>) -> BrokerRecord {
        BrokerRecord {
            topic: "AXLAP240-dbo_Customers.dbo.Customers".into(),
            partition: 0,
            offset: 42,
            key: key.map(|k| Bytes::copy_from_slice(k.as_bytes())),
            payload: payload.map(|p| Bytes::copy_from_slice(p.as_bytes())),
            timestamp_ms: Some(1),
        }
    }

    fn decoder() -> EnvelopeDecoder {
        EnvelopeDecoder::new(&PipelineConf::default(), true)
    }

    fn event(decoded: Decoded) -> ChangeEvent {
        match decoded {
            Decoded::Event(ev) => *ev,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn decodes_the_four_shapes() {
        let d = decoder();
        let row = json!({"CustomerID": 5, "Email": "a@x"});
        let cases = [
            ("c", Value::Null, row.clone(), OpKind::Create),
            ("u", row.clone(), json!({"CustomerID": 5, "Email": "b@x"}), OpKind::Update),
            ("d", row.clone(), Value::Null, OpKind::Delete),
            ("r", Value::Null, row.clone(), OpKind::Snapshot),
        ];
        for (code, before, after, op) in cases {
            let raw = envelope(code, before, after, 1700000000000);
            let ev = event(d.decode(&record(Some(&raw), None), None).unwrap());
            assert_eq!(ev.op, op);
            assert_eq!(ev.identity, "5");
            assert_eq!(ev.table, "dbo.Customers");
            assert_eq!(ev.database, "TestCDC");
            assert_eq!(ev.server, "AXLAP240-dbo_Customers");
            assert_eq!(ev.source_ts_ms, 1700000000000);
            assert_eq!(
                ev.source_position.as_deref(),
                Some("00000027:000001700000000000:0002:1")
            );
            assert_eq!(ev.offset, 42);
        }
    }

    #[test]
    fn unwraps_converter_envelope_and_canonicalises_images() {
        let inner: Value = serde_json::from_str(&envelope(
            "c",
            Value::Null,
            json!({"b": 1, "a": 2, "CustomerID": 9}),
            10,
        ))
        .unwrap();
        let wrapped = json!({"schema": {"type": "struct"}, "payload": inner}).to_string();
        let ev = event(decoder().decode(&record(Some(&wrapped), None), None).unwrap());
        assert_eq!(ev.after.as_deref(), Some(r#"{"CustomerID":9,"a":2,"b":1}"#));
        assert_eq!(ev.before, None);
    }

    #[test]
    fn tombstones_and_null_payloads() {
        let d = decoder();
        assert_eq!(d.decode(&record(None, Some("{}")), None), Ok(Decoded::Tombstone));
        assert_eq!(d.decode(&record(Some(""), None), None), Ok(Decoded::Tombstone));
        let wrapped = json!({"schema": null, "payload": null}).to_string();
        assert_eq!(d.decode(&record(Some(&wrapped), None), None), Ok(Decoded::Tombstone));
    }

    #[test]
    fn malformed_envelopes_are_errors() {
        let d = decoder();
        let err = |raw: &str| d.decode(&record(Some(raw), None), None).unwrap_err();
        assert!(matches!(err("not json"), DecodeError::InvalidJson(_)));
        assert_eq!(err("[1,2]"), DecodeError::NotAnObject);
        assert_eq!(err(&json!({"after": {}}).to_string()), DecodeError::MissingOp);
        assert_eq!(
            err(&json!({"op": "t", "after": {}}).to_string()),
            DecodeError::UnknownOp("t".into())
        );
        assert!(matches!(
            err(&envelope("c", Value::Null, Value::Null, 1)),
            DecodeError::MissingImage { image: "after", .. }
        ));
        assert!(matches!(
            err(&envelope("d", Value::Null, Value::Null, 1)),
            DecodeError::MissingImage { image: "before", .. }
        ));
    }

    #[test]
    fn canonical_text_sorts_nested_keys() {
        let map = json!({"z": {"b": [1, {"d": 1, "c": 2}], "a": null}, "y": "q\"uote"});
        let Value::Object(map) = map else { unreachable!() };
        assert_eq!(
            canonical(&map),
            r#"{"y":"q\"uote","z":{"a":null,"b":[1,{"c":2,"d":1}]}}"#
        );
    }

    #[test]
    fn identity_precedence() {
        let topology = {
            let mut conf = crate::topology::tests::source_conf("AXLAP240", &["dbo.Customers"]);
            conf.primary_keys
                .insert("dbo.Customers".into(), vec!["Region".into(), "Code".into()]);
            crate::topology::Topology::new(&[conf]).unwrap()
        };
        let binding = topology.bindings().remove(0);
        let d = decoder();
        let raw = envelope(
            "c",
            Value::Null,
            json!({"Region": "EU", "Code": 7, "Id": 99}),
            1,
        );

        // key 优先
        let ev = event(d.decode(&record(Some(&raw), Some(r#"{"Id": 99}"#)), Some(&binding)).unwrap());
        assert_eq!(ev.identity, "99");
        let ev = event(
            d.decode(
                &record(Some(&raw), Some(r#"{"schema":{},"payload":{"b":2,"a":1}}"#)),
                Some(&binding),
            )
            .unwrap(),
        );
        assert_eq!(ev.identity, "a=1,b=2");

        // 配置的主键
        let ev = event(d.decode(&record(Some(&raw), None), Some(&binding)).unwrap());
        assert_eq!(ev.identity, "EU,7");

        // 候选列
        let ev = event(d.decode(&record(Some(&raw), None), None).unwrap());
        assert_eq!(ev.identity, "99");

        // 无键行：镜像摘要，稳定
        let keyless = envelope("c", Value::Null, json!({"x": 1}), 1);
        let a = event(d.decode(&record(Some(&keyless), None), None).unwrap());
        let b = event(d.decode(&record(Some(&keyless), None), None).unwrap());
        assert!(a.is_keyless());
        assert_eq!(a.identity, b.identity);
    }

    #[test]
    fn falls_back_to_binding_metadata() {
        let binding = axlap_topology().bindings().remove(0);
        let raw = json!({"op": "c", "after": {"id": 1}, "ts_ms": 77}).to_string();
        let ev = event(decoder().decode(&record(Some(&raw), None), Some(&binding)).unwrap());
        assert_eq!(ev.server, "AXLAP240");
        assert_eq!(ev.database, "TestCDC");
        assert_eq!(ev.table, "dbo.Customers");
        assert_eq!(ev.source_ts_ms, 77);
        assert_eq!(ev.source_position, None);
        assert_eq!(ev.identity, "1");
    }

    #[test]
    fn snapshot_reads_can_be_skipped() {
        let conf = PipelineConf {
            skip_snapshot_reads: true,
            ..PipelineConf::default()
        };
        let d = EnvelopeDecoder::new(&conf, false);
        let raw = envelope("r", Value::Null, json!({"id": 1}), 1);
        assert_eq!(d.decode(&record(Some(&raw), None), None), Ok(Decoded::SkippedSnapshot));
        let raw = envelope("c", Value::Null, json!({"id": 1}), 1);
        assert_eq!(event(d.decode(&record(Some(&raw), None), None).unwrap()).payload, None);
    }
}

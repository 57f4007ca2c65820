//! End-to-end pipeline tests on the in-process broker, control plane and store.
//! No external services are needed; the SQLite case uses an in-memory database.

use std::sync::Arc;
use std::time::Duration;

use quickcheck::{QuickCheck, TestResult};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wp_cdc_consolidator::conf::{PipelineConf, StoreConf};
use wp_cdc_consolidator::connect::MemoryControlPlane;
use wp_cdc_consolidator::envelope::{EnvelopeDecoder, OpKind};
use wp_cdc_consolidator::kafka::MemoryBroker;
use wp_cdc_consolidator::pool::{ConsumerPool, TaskContext};
use wp_cdc_consolidator::retry::RetryPolicy;
use wp_cdc_consolidator::store::{ChangeStore, MemoryStore, SqlStore, StoreError};
use wp_cdc_consolidator::writer::{ConsolidationWriter, FailureLog};
use wp_cdc_consolidator::{AppConf, Consolidator, SourceConf, TableBinding, Topology};

const CUSTOMERS: &str = "AXLAP240-dbo_Customers.dbo.Customers";
const ORDERS: &str = "AXLAP240-dbo_Orders.dbo.Orders";

fn source(tables: &[&str]) -> SourceConf {
    SourceConf {
        server_name: "AXLAP240".into(),
        hostname: "10.0.0.5".into(),
        user: "sa".into(),
        password: "secret".into(),
        database: "TestCDC".into(),
        tables: tables.iter().map(|t| t.to_string()).collect(),
        ..SourceConf::default()
    }
}

fn topology(tables: &[&str]) -> Topology {
    Topology::new(&[source(tables)]).unwrap()
}

fn customers_binding() -> TableBinding {
    topology(&["dbo.Customers"]).bindings().remove(0)
}

fn fast_conf() -> AppConf {
    let mut conf = AppConf::default();
    conf.health.endpoint = String::new();
    conf.health.interval_ms = 20;
    conf.discovery.interval_ms = 10;
    conf.pipeline.linger_ms = 10;
    conf.pipeline.batch_size = 2;
    conf.kafka.poll_timeout_ms = 10;
    conf.retry.store = RetryPolicy::fixed(1, Duration::from_millis(1));
    conf.retry.control = RetryPolicy::no_retry();
    conf
}

fn envelope(table: &str, op: &str, before: Value, after: Value, ts: i64, lsn: u32) -> String {
    json!({
        "before": before,
        "after": after,
        "source": {
            "connector": "sqlserver",
            "name": "AXLAP240",
            "ts_ms": ts,
            "db": "TestCDC",
            "schema": "dbo",
            "table": table,
            "change_lsn": format!("00000027:{lsn:08x}:0002"),
        },
        "op": op,
        "ts_ms": ts + 3
    })
    .to_string()
}

fn publish_customer(broker: &MemoryBroker, op: &str, before: Value, after: Value, ts: i64, lsn: u32) {
    let body = envelope("Customers", op, before, after, ts, lsn);
    broker.publish(CUSTOMERS, Some(r#"{"CustomerID":5}"#), Some(&body));
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn pool(broker: &MemoryBroker, store: Arc<dyn ChangeStore>, group: &str, batch_size: usize, failures: FailureLog) -> ConsumerPool {
    ConsumerPool::new(
        TaskContext {
            factory: Arc::new(broker.clone()),
            group_id: group.into(),
            decoder: EnvelopeDecoder::new(&PipelineConf::default(), true),
            writer: ConsolidationWriter::new(store, RetryPolicy::fixed(2, Duration::from_millis(1)), failures),
            batch_size,
            linger: Duration::from_millis(5),
            poll_timeout: Duration::from_millis(5),
        },
        Duration::from_secs(2),
    )
}

#[tokio::test]
async fn axlap240_insert_update_delete() {
    let broker = MemoryBroker::new();
    let control = MemoryControlPlane::new();
    let store = MemoryStore::new();

    let row = json!({"CustomerID": 5, "Name": "Ann", "Email": "ann@old.example"});
    let updated = json!({"CustomerID": 5, "Name": "Ann", "Email": "ann@new.example"});
    publish_customer(&broker, "c", Value::Null, row.clone(), 1_000, 1);
    publish_customer(&broker, "u", row, updated.clone(), 2_000, 2);
    publish_customer(&broker, "d", updated, Value::Null, 3_000, 3);

    let service = Consolidator::new(
        fast_conf(),
        Arc::new(control.clone()),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        Arc::new(store.clone()),
    );
    let (_topology_tx, topology_rx) = watch::channel(topology(&["dbo.Customers"]));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(service.run(topology_rx, cancel.clone()));

    wait_for(|| store.len() == 3 && broker.committed("cdc-consolidator", CUSTOMERS, 0) == Some(3)).await;
    cancel.cancel();
    let report = handle.await.unwrap().unwrap();
    assert!(report.is_complete());

    assert_eq!(
        control.names(),
        vec!["mssql-source-connector-AXLAP240-dbo_Customers".to_string()]
    );
    assert_eq!(
        store.history("dbo.Customers", "5"),
        vec![OpKind::Create, OpKind::Update, OpKind::Delete]
    );
    assert!(store.current_rows().is_empty());
    let rows = store.rows();
    assert_eq!(rows[1].after_data.as_deref(), Some(r#"{"CustomerID":5,"Email":"ann@new.example","Name":"Ann"}"#));
    assert!(rows.iter().all(|r| r.source_server == "AXLAP240" && r.source_database == "TestCDC"));
}

#[test]
fn replay_is_idempotent_for_any_batch_size() {
    fn prop(events: u8, batch_size: u8) -> TestResult {
        let events = (events % 24) as i64 + 1;
        let batch_size = (batch_size % 8) as usize + 1;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let broker = MemoryBroker::new();
            let store = MemoryStore::new();
            for i in 0..events {
                let after = json!({"CustomerID": i % 4, "Seq": i});
                let body = envelope("Customers", "u", after.clone(), after, 1_000 + i, i as u32);
                broker.publish(CUSTOMERS, None, Some(&body));
            }

            let mut first = pool(&broker, Arc::new(store.clone()), "g1", batch_size, FailureLog::new(4));
            first.start(customers_binding());
            wait_for(|| broker.committed("g1", CUSTOMERS, 0) == Some(events)).await;
            first.shutdown(Duration::from_secs(1)).await;
            let once = store.rows();

            // 另一个 consumer group 从头重放同一段 offset
            let mut again = pool(&broker, Arc::new(store.clone()), "g2", batch_size.max(3) - 2, FailureLog::new(4));
            again.start(customers_binding());
            wait_for(|| broker.committed("g2", CUSTOMERS, 0) == Some(events)).await;
            again.shutdown(Duration::from_secs(1)).await;

            let twice = store.rows();
            TestResult::from_bool(once.len() == events as usize && once == twice)
        })
    }
    QuickCheck::new()
        .tests(25)
        .quickcheck(prop as fn(u8, u8) -> TestResult);
}

#[tokio::test]
async fn one_malformed_record_in_a_batch() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let failures = FailureLog::new(8);
    for i in 0..5 {
        if i == 2 {
            // 缺少 after 镜像的 create
            let body = envelope("Customers", "c", Value::Null, Value::Null, 1_000 + i, i as u32);
            broker.publish(CUSTOMERS, Some("broken"), Some(&body));
        } else {
            let after = json!({"CustomerID": i});
            let body = envelope("Customers", "c", Value::Null, after, 1_000 + i, i as u32);
            broker.publish(CUSTOMERS, None, Some(&body));
        }
    }
    let mut pool = pool(&broker, Arc::new(store.clone()), "g", 5, failures.clone());
    pool.start(customers_binding());
    wait_for(|| broker.committed("g", CUSTOMERS, 0) == Some(5)).await;
    pool.shutdown(Duration::from_secs(1)).await;

    assert_eq!(store.len(), 4);
    let recent = failures.recent();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].offset, 2);
    assert_eq!(failures.total(), 1);
}

#[tokio::test]
async fn rejected_record_is_quarantined_and_rest_committed() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let failures = FailureLog::new(8);
    for i in 0..6 {
        let after = json!({"CustomerID": i});
        let body = envelope("Customers", "c", Value::Null, after, 1_000 + i, i as u32);
        broker.publish(CUSTOMERS, None, Some(&body));
    }
    store.poison("4");
    let mut pool = pool(&broker, Arc::new(store.clone()), "g", 6, failures.clone());
    pool.start(customers_binding());
    wait_for(|| broker.committed("g", CUSTOMERS, 0) == Some(6)).await;
    let roster = pool.roster();
    pool.shutdown(Duration::from_secs(1)).await;

    assert_eq!(store.len(), 5);
    assert_eq!(roster[CUSTOMERS].quarantined, 1);
    assert_eq!(failures.recent()[0].record_id.as_deref(), Some("4"));
}

fn seq_of(after: Option<&str>) -> i64 {
    let image: Value = serde_json::from_str(after.unwrap_or("null")).unwrap();
    image["Seq"].as_i64().unwrap()
}

#[tokio::test]
async fn identity_order_holds_across_partitions() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    // 每个 identity 固定在一个分区，两个分区交错追加
    for seq in 0..6i64 {
        for (partition, id) in [(0, 5), (1, 7)] {
            let after = json!({"CustomerID": id, "Seq": seq});
            let (op, before) = if seq == 0 {
                ("c", Value::Null)
            } else {
                ("u", json!({"CustomerID": id, "Seq": seq - 1}))
            };
            let lsn = (seq * 2 + partition as i64) as u32;
            let body = envelope("Customers", op, before, after, 1_000 + seq, lsn);
            let key = format!(r#"{{"CustomerID":{id}}}"#);
            broker.publish_to(CUSTOMERS, partition, Some(&key), Some(&body));
        }
    }
    store.fail_next([StoreError::Transient("deadlock detected".into())]);

    let mut pool = pool(&broker, Arc::new(store.clone()), "g", 4, FailureLog::new(4));
    pool.start(customers_binding());
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            // 先读提交位点再读存储：提交之前的记录必须已经落库
            let committed: Vec<(i32, i64)> = [0, 1]
                .into_iter()
                .map(|p| (p, broker.committed("g", CUSTOMERS, p).unwrap_or(0)))
                .collect();
            let rows = store.rows();
            for (partition, next) in &committed {
                let written = rows
                    .iter()
                    .filter(|r| r.kafka_partition == *partition && r.kafka_offset < *next)
                    .count() as i64;
                assert_eq!(written, *next, "partition {partition} committed past unwritten records");
            }
            if committed.iter().all(|(_, next)| *next == 6) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    pool.shutdown(Duration::from_secs(1)).await;

    let rows = store.rows();
    assert_eq!(rows.len(), 12);
    for (partition, id) in [(0, "5"), (1, "7")] {
        let mine: Vec<_> = rows.iter().filter(|r| r.record_id == id).collect();
        assert!(mine.iter().all(|r| r.kafka_partition == partition));
        let seqs: Vec<i64> = mine.iter().map(|r| seq_of(r.after_data.as_deref())).collect();
        assert_eq!(seqs, (0..6).collect::<Vec<_>>());
        let offsets: Vec<i64> = mine.iter().map(|r| r.kafka_offset).collect();
        assert_eq!(offsets, (0..6).collect::<Vec<_>>());
        let ops = store.history("dbo.Customers", id);
        assert_eq!(ops[0], OpKind::Create);
        assert!(ops[1..].iter().all(|op| *op == OpKind::Update));
    }
}

#[tokio::test]
async fn identical_keyless_snapshot_rows_all_land() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    // 同一快照位置下三条完全相同、没有可用键的行
    let body = envelope("Customers", "r", Value::Null, json!({"Note": "same"}), 500, 9);
    for _ in 0..3 {
        broker.publish(CUSTOMERS, None, Some(&body));
    }
    let mut pool = pool(&broker, Arc::new(store.clone()), "g", 3, FailureLog::new(4));
    pool.start(customers_binding());
    wait_for(|| broker.committed("g", CUSTOMERS, 0) == Some(3)).await;
    pool.shutdown(Duration::from_secs(1)).await;

    let rows = store.rows();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.record_id.starts_with("row:")));
    assert!(rows.iter().all(|r| r.record_id == rows[0].record_id));
}

#[tokio::test]
async fn table_removed_and_readded_keeps_one_consumer() {
    let broker = MemoryBroker::new();
    let control = MemoryControlPlane::new();
    let store = MemoryStore::new();
    broker.create_topic(CUSTOMERS);
    broker.create_topic(ORDERS);

    let service = Consolidator::new(
        fast_conf(),
        Arc::new(control.clone()),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        Arc::new(store.clone()),
    );
    let (topology_tx, topology_rx) = watch::channel(topology(&["dbo.Customers", "dbo.Orders"]));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(service.run(topology_rx, cancel.clone()));
    let orders_connector = "mssql-source-connector-AXLAP240-dbo_Orders".to_string();

    wait_for(|| broker.active_streams(ORDERS) == 1).await;
    for round in 0..3 {
        topology_tx.send_replace(topology(&["dbo.Customers"]));
        wait_for(|| broker.active_streams(ORDERS) == 0 && !control.names().contains(&orders_connector)).await;

        let body = envelope("Orders", "c", Value::Null, json!({"Id": round}), 5_000 + round, round as u32);
        broker.publish(ORDERS, None, Some(&body));

        topology_tx.send_replace(topology(&["dbo.Customers", "dbo.Orders"]));
        wait_for(|| broker.active_streams(ORDERS) == 1 && control.names().contains(&orders_connector)).await;
    }
    wait_for(|| broker.committed("cdc-consolidator", ORDERS, 0) == Some(3)).await;
    cancel.cancel();
    assert!(handle.await.unwrap().unwrap().is_complete());

    assert_eq!(broker.max_active_streams(ORDERS), 1);
    assert_eq!(broker.max_active_streams(CUSTOMERS), 1);
    assert_eq!(store.history("dbo.Orders", "2"), vec![OpKind::Create]);
}

#[tokio::test]
async fn sqlite_store_end_to_end() {
    let conf = StoreConf {
        url: "sqlite::memory:".into(),
        max_connections: 1,
        ..StoreConf::default()
    };
    let store = Arc::new(SqlStore::connect(&conf).await.unwrap());
    store.ensure_schema().await.unwrap();

    let broker = MemoryBroker::new();
    let row = json!({"CustomerID": 5, "Email": "a@example"});
    publish_customer(&broker, "r", Value::Null, row.clone(), 500, 1);
    publish_customer(&broker, "u", row.clone(), json!({"CustomerID": 5, "Email": "b@example"}), 600, 2);
    // 重复投递同一条变更
    publish_customer(&broker, "u", row, json!({"CustomerID": 5, "Email": "b@example"}), 600, 2);

    let mut pool = pool(&broker, store.clone(), "g", 2, FailureLog::new(4));
    pool.start(customers_binding());
    wait_for(|| broker.committed("g", CUSTOMERS, 0) == Some(3)).await;
    let roster = pool.roster();
    pool.shutdown(Duration::from_secs(1)).await;

    assert_eq!(store.count().await.unwrap(), 2);
    let ops: Vec<String> = store
        .history("dbo.Customers", "5")
        .await
        .unwrap()
        .into_iter()
        .map(|(op, _)| op)
        .collect();
    assert_eq!(ops, vec!["snapshot", "update"]);
    assert_eq!(roster[CUSTOMERS].duplicates, 1);
}

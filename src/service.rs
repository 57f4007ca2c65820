//! Process wiring: bootstrap, reload, supervision and shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::AnyResult;
use crate::conf::AppConf;
use crate::connect::{ControlPlane, Provisioner};
use crate::discovery::TopicDiscoverer;
use crate::envelope::EnvelopeDecoder;
use crate::health::HealthMonitor;
use crate::kafka::{StreamFactory, TopicCatalog};
use crate::pool::{ConsumerPool, ShutdownReport, TaskContext};
use crate::store::ChangeStore;
use crate::topology::Topology;
use crate::writer::{ConsolidationWriter, FailureLog};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Consolidator {
    conf: AppConf,
    control: Arc<dyn ControlPlane>,
    catalog: Arc<dyn TopicCatalog>,
    factory: Arc<dyn StreamFactory>,
    store: Arc<dyn ChangeStore>,
}

impl Consolidator {
    pub fn new(
        conf: AppConf,
        control: Arc<dyn ControlPlane>,
        catalog: Arc<dyn TopicCatalog>,
        factory: Arc<dyn StreamFactory>,
        store: Arc<dyn ChangeStore>,
    ) -> Self {
        Self {
            conf,
            control,
            catalog,
            factory,
            store,
        }
    }

    /// Production wiring: Kafka Connect over HTTP, rdkafka, sea-orm store.
    #[cfg(feature = "kafka")]
    pub async fn from_conf(conf: AppConf) -> AnyResult<Self> {
        use crate::connect::ConnectClient;
        use crate::kafka::{KafkaCatalog, KafkaStreamFactory};
        use crate::store::SqlStore;

        let control = ConnectClient::new(&conf.connect.url, conf.connect.request_timeout())?;
        let catalog = KafkaCatalog::new(&conf.kafka)?;
        let factory = KafkaStreamFactory::new(conf.kafka.clone());
        let store = SqlStore::connect(&conf.store)
            .await
            .with_context(|| format!("connect store table {}", conf.store.table))?;
        Ok(Self::new(
            conf,
            Arc::new(control),
            Arc::new(catalog),
            Arc::new(factory),
            Arc::new(store),
        ))
    }

    /// Run until `cancel` fires. Topology reloads arrive on `topology_rx`; each one
    /// triggers a provisioning pass and a new desired-topic set.
    pub async fn run(
        self,
        topology_rx: watch::Receiver<Topology>,
        cancel: CancellationToken,
    ) -> AnyResult<ShutdownReport> {
        let conf = self.conf;
        let topology = topology_rx.borrow().clone();

        let provisioner = Arc::new(Provisioner::new(
            self.control,
            conf.connect.clone(),
            conf.history_bootstrap_servers(),
            conf.retry.control.clone(),
        ));
        provisioner
            .wait_ready()
            .await
            .context("control plane not reachable")?;

        let store = self.store;
        conf.retry
            .store
            .run("ensure schema", || store.ensure_schema())
            .await
            .context("prepare target table")?;

        let report = provisioner.reconcile(&topology).await;
        log::info!(
            target: "cdc::provision",
            "initial pass: created {}, updated {}, unchanged {}, deleted {}, failed {}",
            report.created.len(),
            report.updated.len(),
            report.unchanged.len(),
            report.deleted.len(),
            report.failed.len()
        );

        let failures = FailureLog::new(conf.pipeline.failure_log_capacity);
        let pool = ConsumerPool::new(
            TaskContext {
                factory: self.factory,
                group_id: conf.kafka.group_id.clone(),
                decoder: EnvelopeDecoder::new(&conf.pipeline, conf.store.store_full_payload),
                writer: ConsolidationWriter::new(store, conf.retry.store.clone(), failures.clone()),
                batch_size: conf.pipeline.batch_size,
                linger: conf.pipeline.linger(),
                poll_timeout: conf.kafka.poll_timeout(),
            },
            conf.pipeline.stop_grace(),
        );

        let discoverer = TopicDiscoverer::new(self.catalog, &topology, conf.discovery.empty_confirmations);
        let monitor = HealthMonitor::new(provisioner.clone(), discoverer.subscribe(), failures, &conf.health);

        #[cfg(feature = "status")]
        let status_server = if conf.health.endpoint.is_empty() {
            None
        } else {
            Some(
                crate::health::StatusServer::start(&conf.health.endpoint, monitor.status())
                    .with_context(|| format!("bind status endpoint {}", conf.health.endpoint))?,
            )
        };

        let background = cancel.child_token();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (discovery_topology_tx, discovery_topology_rx) = watch::channel(topology);
        let discovery = tokio::spawn(discoverer.run(
            events_tx,
            discovery_topology_rx,
            conf.discovery.interval(),
            background.clone(),
        ));
        let reload = tokio::spawn(reload_loop(
            provisioner,
            topology_rx,
            discovery_topology_tx,
            background.clone(),
        ));

        let shutdown = monitor
            .run(
                pool,
                events_rx,
                conf.health.interval(),
                conf.pipeline.shutdown_timeout(),
                cancel,
            )
            .await;

        background.cancel();
        for (name, handle) in [("discovery", discovery), ("reload", reload)] {
            if let Err(e) = handle.await {
                log::warn!(target: "cdc::health", "{} task join error: {}", name, e);
            }
        }
        #[cfg(feature = "status")]
        {
            if let Some(server) = status_server {
                server.stop().await;
            }
        }
        if shutdown.is_complete() {
            log::info!(target: "cdc::health", "shutdown complete, {} consumer(s) drained", shutdown.drained.len());
        }
        Ok(shutdown)
    }
}

/// Provision first, then publish the topology to discovery, so topics of new
/// tables are only consumed once their connectors were requested.
async fn reload_loop(
    provisioner: Arc<Provisioner>,
    mut topology_rx: watch::Receiver<Topology>,
    discovery_tx: watch::Sender<Topology>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = topology_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let topology = topology_rx.borrow_and_update().clone();
        log::info!(
            target: "cdc::provision",
            "topology reloaded: {} source(s), {} table(s)",
            topology.sources().len(),
            topology.bindings().len()
        );
        let report = provisioner.reconcile(&topology).await;
        log::info!(
            target: "cdc::provision",
            "reload pass: {} mutation(s), {} failed",
            report.mutations(),
            report.failed.len()
        );
        discovery_tx.send_replace(topology);
    }
}

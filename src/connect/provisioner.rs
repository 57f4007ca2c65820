use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};

use super::{ConnectorSpec, ConnectorState, ControlError, ControlPlane, Observed};
use crate::conf::ConnectConf;
use crate::health::metrics;
use crate::retry::RetryPolicy;
use crate::topology::{TableBinding, Topology};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorRecord {
    pub name: String,
    pub server: String,
    pub table: String,
    pub topic: String,
    pub state: ConnectorState,
    pub last_error: Option<String>,
    /// Consecutive failures since the connector was last seen running.
    pub failures: u32,
    pub updated_at_ms: i64,
}

/// Immutable snapshot; a new `Arc` is published on every change.
pub type ConnectorStates = Arc<BTreeMap<String, ConnectorRecord>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    /// Mutating control-plane calls issued by the pass.
    pub fn mutations(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

enum Upsert {
    Created,
    Updated,
    Unchanged,
}

/// Single writer of connector state. Passes (reconcile, re-provision, status refresh)
/// are serialised by the `desired` lock so they never interleave.
pub struct Provisioner {
    control: Arc<dyn ControlPlane>,
    conf: ConnectConf,
    history_servers: String,
    retry: RetryPolicy,
    desired: Mutex<BTreeMap<String, ConnectorSpec>>,
    states_tx: watch::Sender<ConnectorStates>,
}

impl Provisioner {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        conf: ConnectConf,
        history_servers: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        let (states_tx, _) = watch::channel(Arc::new(BTreeMap::new()));
        Self {
            control,
            conf,
            history_servers: history_servers.into(),
            retry,
            desired: Mutex::new(BTreeMap::new()),
            states_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectorStates> {
        self.states_tx.subscribe()
    }

    pub fn states(&self) -> ConnectorStates {
        self.states_tx.borrow().clone()
    }

    pub fn state_of(&self, name: &str) -> ConnectorState {
        self.states_tx
            .borrow()
            .get(name)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    /// Ping the control plane until it answers, `connect.ready_attempts` times at most.
    pub async fn wait_ready(&self) -> Result<(), ControlError> {
        let policy = RetryPolicy::fixed(
            self.conf.ready_attempts.saturating_sub(1),
            Duration::from_millis(self.conf.ready_interval_ms),
        );
        policy.run("control plane ping", || self.control.ping()).await?;
        log::info!(target: "cdc::provision", "control plane {} is ready", self.conf.url);
        Ok(())
    }

    /// Bring the control plane in line with `topology`. Failures are recorded per
    /// connector and never abort the pass.
    pub async fn reconcile(&self, topology: &Topology) -> ReconcileReport {
        let mut desired = self.desired.lock().await;
        let mut report = ReconcileReport::default();

        let specs: BTreeMap<String, (TableBinding, ConnectorSpec)> = topology
            .bindings()
            .into_iter()
            .map(|binding| {
                let spec = ConnectorSpec::derive(&binding, &self.conf, &self.history_servers);
                (spec.name.clone(), (binding, spec))
            })
            .collect();

        for (name, (binding, spec)) in &specs {
            self.track(name, binding);
            if matches!(
                self.state_of(name),
                ConnectorState::Absent | ConnectorState::Stopped
            ) {
                self.transition(name, ConnectorState::Pending, None);
            }
            let outcome = self.upsert(spec).await;
            if outcome.is_ok() && self.state_of(name) == ConnectorState::Failed {
                // 上一轮失败、本轮已写入：回到 pending，由 refresh_status 确认实际状态
                self.transition(name, ConnectorState::Pending, None);
            }
            match outcome {
                Ok(Upsert::Created) => {
                    log::info!(target: "cdc::provision", "created connector {}", name);
                    report.created.push(name.clone());
                }
                Ok(Upsert::Updated) => {
                    log::info!(target: "cdc::provision", "updated connector {}", name);
                    self.transition(name, ConnectorState::Pending, None);
                    report.updated.push(name.clone());
                }
                Ok(Upsert::Unchanged) => {
                    log::debug!(target: "cdc::provision", "connector {} up to date", name);
                    report.unchanged.push(name.clone());
                }
                Err(err) => {
                    log::error!(target: "cdc::provision", "provision connector {} fail: {}", name, err);
                    self.transition(name, ConnectorState::Failed, Some(err.to_string()));
                    report.failed.push(name.clone());
                }
            }
        }

        *desired = specs
            .into_iter()
            .map(|(name, (_, spec))| (name, spec))
            .collect();
        self.retire(&desired, &mut report).await;

        log::info!(
            target: "cdc::provision",
            "reconcile done: created={} updated={} unchanged={} deleted={} failed={}",
            report.created.len(),
            report.updated.len(),
            report.unchanged.len(),
            report.deleted.len(),
            report.failed.len()
        );
        report
    }

    /// Re-provision one connector: re-apply its config, and restart it when the config
    /// is already correct but the control plane reports it failed.
    pub async fn provision(&self, name: &str) -> Result<(), ControlError> {
        let desired = self.desired.lock().await;
        let Some(spec) = desired.get(name).cloned() else {
            return Ok(());
        };
        self.transition(name, ConnectorState::Pending, None);

        let result: Result<(), ControlError> = async {
            if let Upsert::Unchanged = self.upsert(&spec).await? {
                let status = self
                    .retry
                    .run("connector status", || self.control.status(name))
                    .await?;
                if let Some(Observed::Failed(_)) = status.map(|s| s.observed()) {
                    self.retry
                        .run("connector restart", || self.control.restart(name))
                        .await?;
                    log::info!(target: "cdc::provision", "restarted connector {}", name);
                }
            }
            Ok(())
        }
        .await;

        if let Err(err) = &result {
            log::error!(target: "cdc::provision", "re-provision {} fail: {}", name, err);
            self.transition(name, ConnectorState::Failed, Some(err.to_string()));
        }
        result
    }

    /// Pull `/status` for every desired connector that is not already failed.
    pub async fn refresh_status(&self) -> ConnectorStates {
        let desired = self.desired.lock().await;
        for name in desired.keys() {
            if self.state_of(name) == ConnectorState::Failed {
                continue;
            }
            match self.control.status(name).await {
                Ok(Some(status)) => match status.observed() {
                    Observed::Running => self.transition(name, ConnectorState::Running, None),
                    Observed::Pending => {}
                    Observed::Failed(reason) => {
                        log::warn!(target: "cdc::provision", "connector {} failed: {}", name, reason);
                        self.transition(name, ConnectorState::Failed, Some(reason));
                    }
                },
                Ok(None) => self.transition(
                    name,
                    ConnectorState::Failed,
                    Some("connector not found".to_string()),
                ),
                Err(err) => {
                    log::warn!(target: "cdc::provision", "status of {} unavailable: {}", name, err);
                }
            }
        }
        self.states()
    }

    async fn upsert(&self, spec: &ConnectorSpec) -> Result<Upsert, ControlError> {
        let name = spec.name.as_str();
        let current = self
            .retry
            .run("get connector config", || self.control.get_config(name))
            .await?;
        match current {
            None => {
                self.retry
                    .run("create connector", || self.control.create(spec))
                    .await?;
                Ok(Upsert::Created)
            }
            Some(remote) if spec.matches(&remote) => Ok(Upsert::Unchanged),
            Some(_) => {
                self.retry
                    .run("update connector", || self.control.update(spec))
                    .await?;
                Ok(Upsert::Updated)
            }
        }
    }

    /// Stop what is no longer desired. Only names under our prefix are ever deleted.
    async fn retire(&self, desired: &BTreeMap<String, ConnectorSpec>, report: &mut ReconcileReport) {
        let prefix = format!("{}-", self.conf.connector_prefix);
        if self.conf.prune_stale {
            let listed = self
                .retry
                .run("list connectors", || self.control.list())
                .await;
            match listed {
                Ok(existing) => {
                    for name in existing
                        .into_iter()
                        .filter(|n| n.starts_with(&prefix) && !desired.contains_key(n))
                    {
                        let deleted = self
                            .retry
                            .run("delete connector", || self.control.delete(&name))
                            .await;
                        match deleted {
                            Ok(()) => {
                                log::info!(target: "cdc::provision", "deleted stale connector {}", name);
                                report.deleted.push(name);
                            }
                            Err(err) => {
                                log::error!(target: "cdc::provision", "delete connector {} fail: {}", name, err);
                                report.failed.push(name);
                            }
                        }
                    }
                }
                Err(err) => {
                    log::warn!(target: "cdc::provision", "list connectors fail, skip pruning: {}", err);
                }
            }
        }

        let tracked: Vec<String> = self
            .states_tx
            .borrow()
            .values()
            .filter(|r| !desired.contains_key(&r.name) && r.state != ConnectorState::Stopped)
            .map(|r| r.name.clone())
            .collect();
        for name in tracked {
            if report.failed.contains(&name) {
                continue;
            }
            self.transition(&name, ConnectorState::Stopped, None);
        }
    }

    fn track(&self, name: &str, binding: &TableBinding) {
        self.states_tx.send_modify(|states| {
            let map = Arc::make_mut(states);
            map.entry(name.to_string())
                .or_insert_with(|| ConnectorRecord {
                    name: name.to_string(),
                    server: binding.server().to_string(),
                    table: binding.table.to_string(),
                    topic: binding.topic_name(),
                    state: ConnectorState::Absent,
                    last_error: None,
                    failures: 0,
                    updated_at_ms: now_ms(),
                });
        });
    }

    fn transition(&self, name: &str, to: ConnectorState, error: Option<String>) {
        self.states_tx.send_if_modified(|states| {
            let Some(from) = states.get(name).map(|r| r.state) else {
                return false;
            };
            if from == to {
                if error.is_none() {
                    return false;
                }
            } else if !from.can_transition(to) {
                log::debug!(target: "cdc::provision", "ignore {} transition {} -> {}", name, from, to);
                return false;
            }
            let map = Arc::make_mut(states);
            let Some(record) = map.get_mut(name) else {
                return false;
            };
            record.state = to;
            record.updated_at_ms = now_ms();
            match to {
                ConnectorState::Failed => {
                    record.failures += 1;
                    record.last_error = error;
                    metrics::connector_failed(name);
                }
                ConnectorState::Running => {
                    record.failures = 0;
                    record.last_error = None;
                }
                _ => {
                    if error.is_some() || from == ConnectorState::Failed {
                        record.last_error = error;
                    }
                }
            }
            if from != to {
                log::info!(target: "cdc::provision", "connector {} {} -> {}", name, from, to);
            }
            true
        });
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

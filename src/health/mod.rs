//! Health supervision: connector re-provisioning, consumer restarts, status snapshot.
//!
//! 监控只读取连接器状态；状态的写入仍然只经过 Provisioner。
//! 失败的连接器和意外退出的消费任务各自按 key 独立退避。

pub mod metrics;
#[cfg(feature = "status")]
mod server;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::conf::HealthConf;
use crate::connect::{ConnectorRecord, ConnectorState, Provisioner};
use crate::discovery::{DesiredTopics, TopicEvent};
use crate::pool::{ConsumerPool, ConsumerState, ConsumerStats, ShutdownReport};
use crate::topology::TableBinding;
use crate::writer::{FailureEntry, FailureLog};

#[cfg(feature = "status")]
pub use server::StatusServer;

/// Per-key exponential backoff: initial, 2x, 4x ... capped at `max`.
#[derive(Debug)]
pub struct BackoffSchedule {
    initial: Duration,
    max: Duration,
    entries: BTreeMap<String, (u32, Instant)>,
}

impl BackoffSchedule {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            entries: BTreeMap::new(),
        }
    }

    /// Whether `key` may be attempted at `now`. Keys without failures always may.
    pub fn ready(&self, key: &str, now: Instant) -> bool {
        self.entries.get(key).is_none_or(|(_, next)| now >= *next)
    }

    /// Register a failed attempt and return the wait before the next one.
    pub fn record_failure(&mut self, key: &str, now: Instant) -> Duration {
        let entry = self.entries.entry(key.to_string()).or_insert((0, now));
        entry.0 += 1;
        let factor = 2u32.saturating_pow(entry.0.saturating_sub(1).min(20));
        let delay = self.initial.saturating_mul(factor).min(self.max);
        entry.1 = now + delay;
        delay
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.entries.get(key).map(|(n, _)| *n).unwrap_or(0)
    }

    pub fn due_in(&self, key: &str, now: Instant) -> Option<Duration> {
        self.entries
            .get(key)
            .map(|(_, next)| next.saturating_duration_since(now))
    }

    pub fn reset(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|k, _| keep(k));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingRestart {
    pub topic: String,
    pub attempts: u32,
    pub due_in_ms: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthStatus {
    pub instance: String,
    pub updated_at_ms: i64,
    pub healthy: bool,
    pub connectors: Vec<ConnectorRecord>,
    pub consumers: Vec<ConsumerStats>,
    pub pending_restarts: Vec<PendingRestart>,
    pub failures_total: u64,
    pub recent_failures: Vec<FailureEntry>,
}

pub struct HealthMonitor {
    provisioner: Arc<Provisioner>,
    desired: watch::Receiver<DesiredTopics>,
    failures: FailureLog,
    connector_backoff: BackoffSchedule,
    /// 已成功重建、尚未观察到 running 的连接器
    reprovisioned: BTreeSet<String>,
    consumer_backoff: BackoffSchedule,
    pending: BTreeMap<String, (TableBinding, String)>,
    status_tx: watch::Sender<Arc<HealthStatus>>,
}

impl HealthMonitor {
    pub fn new(
        provisioner: Arc<Provisioner>,
        desired: watch::Receiver<DesiredTopics>,
        failures: FailureLog,
        conf: &HealthConf,
    ) -> Self {
        let initial = Duration::from_millis(conf.restart_initial_ms);
        let max = Duration::from_millis(conf.restart_max_ms);
        let (status_tx, _) = watch::channel(Arc::new(HealthStatus::default()));
        Self {
            provisioner,
            desired,
            failures,
            connector_backoff: BackoffSchedule::new(initial, max),
            reprovisioned: BTreeSet::new(),
            consumer_backoff: BackoffSchedule::new(initial, max),
            pending: BTreeMap::new(),
            status_tx,
        }
    }

    pub fn status(&self) -> watch::Receiver<Arc<HealthStatus>> {
        self.status_tx.subscribe()
    }

    /// One supervision round: refresh connector states, re-provision failed ones
    /// that are due, reap and restart consumers, publish a fresh snapshot.
    pub async fn tick(&mut self, pool: &mut ConsumerPool) -> Arc<HealthStatus> {
        let now = Instant::now();
        self.check_connectors(now).await;
        self.check_consumers(pool, now).await;
        let status = Arc::new(self.snapshot(pool, now));
        self.status_tx.send_replace(status.clone());
        status
    }

    async fn check_connectors(&mut self, now: Instant) {
        let states = self.provisioner.refresh_status().await;
        self.connector_backoff.retain(|name| states.contains_key(name));
        self.reprovisioned.retain(|name| states.contains_key(name));
        for (name, record) in states.iter() {
            match record.state {
                ConnectorState::Running => {
                    self.connector_backoff.reset(name);
                    self.reprovisioned.remove(name);
                }
                ConnectorState::Failed => {
                    // 上次重建成功但连接器再次失败，这一次才计入退避
                    if self.reprovisioned.remove(name) {
                        self.connector_backoff.record_failure(name, now);
                    }
                    if !self.connector_backoff.ready(name, now) {
                        continue;
                    }
                    log::info!(
                        target: "cdc::health",
                        "re-provision failed connector {} (attempt {})",
                        name,
                        self.connector_backoff.attempts(name) + 1
                    );
                    match self.provisioner.provision(name).await {
                        Ok(()) => {
                            self.reprovisioned.insert(name.clone());
                        }
                        Err(err) => {
                            let delay = self.connector_backoff.record_failure(name, now);
                            log::warn!(
                                target: "cdc::health",
                                "re-provision {} fail, next attempt in {:?}: {}",
                                name,
                                delay,
                                err
                            );
                        }
                    }
                }
                _ => {}
            }
        }
    }

    async fn check_consumers(&mut self, pool: &mut ConsumerPool, now: Instant) {
        for exited in pool.reap().await {
            let topic = exited.binding.topic_name();
            if exited.exit.is_clean() {
                continue;
            }
            let delay = self.consumer_backoff.record_failure(&topic, now);
            log::warn!(
                target: "cdc::health",
                "consumer {} exited ({:?}), restart in {:?}",
                topic,
                exited.exit,
                delay
            );
            let reason = exited
                .stats
                .last_error
                .clone()
                .unwrap_or_else(|| format!("{:?}", exited.exit));
            self.pending.insert(topic, (exited.binding, reason));
        }

        let desired = self.desired.borrow().clone();
        self.pending.retain(|topic, _| desired.contains_key(topic));
        let due: Vec<String> = self
            .pending
            .keys()
            .filter(|topic| self.consumer_backoff.ready(topic, now))
            .cloned()
            .collect();
        for topic in due {
            if let Some((binding, _)) = self.pending.remove(&topic) {
                log::info!(
                    target: "cdc::health",
                    "restart consumer {} (attempt {})",
                    topic,
                    self.consumer_backoff.attempts(&topic)
                );
                pool.restart(binding);
            }
        }

        // 重启后成功提交过一次即视为恢复
        for (topic, stats) in pool.roster() {
            if stats.state == ConsumerState::Running && stats.last_commit_ms.is_some() {
                self.consumer_backoff.reset(&topic);
            }
        }
        self.consumer_backoff
            .retain(|topic| desired.contains_key(topic));
    }

    fn snapshot(&self, pool: &ConsumerPool, now: Instant) -> HealthStatus {
        let connectors: Vec<ConnectorRecord> = self.provisioner.states().values().cloned().collect();
        let consumers: Vec<ConsumerStats> = pool.roster().into_values().collect();
        let pending_restarts: Vec<PendingRestart> = self
            .pending
            .iter()
            .map(|(topic, (_, reason))| PendingRestart {
                topic: topic.clone(),
                attempts: self.consumer_backoff.attempts(topic),
                due_in_ms: self
                    .consumer_backoff
                    .due_in(topic, now)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
                reason: reason.clone(),
            })
            .collect();
        let healthy = pending_restarts.is_empty()
            && connectors.iter().all(|c| c.state != ConnectorState::Failed)
            && consumers.iter().all(|c| c.state != ConsumerState::Failed);
        HealthStatus {
            instance: metrics::instance_id(),
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
            healthy,
            connectors,
            consumers,
            pending_restarts,
            failures_total: self.failures.total(),
            recent_failures: self.failures.recent(),
        }
    }

    /// Supervise the pool until cancelled: apply discovery events, tick on the
    /// interval, then shut the pool down within `shutdown_timeout`.
    pub async fn run(
        mut self,
        mut pool: ConsumerPool,
        mut events: mpsc::Receiver<TopicEvent>,
        interval: Duration,
        shutdown_timeout: Duration,
        cancel: CancellationToken,
    ) -> ShutdownReport {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        self.pending.remove(&event.topic());
                        pool.apply(event).await;
                    }
                    None => events_open = false,
                },
                _ = ticker.tick() => {
                    self.tick(&mut pool).await;
                }
            }
        }
        log::info!(target: "cdc::health", "shutting down {} consumer(s)", pool.len());
        let report = pool.shutdown(shutdown_timeout).await;
        self.status_tx.send_modify(|status| {
            let status = Arc::make_mut(status);
            status.consumers.clear();
            status.healthy = report.is_complete();
        });
        report
    }
}

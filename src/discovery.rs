//! Desired-vs-actual topic reconciliation.
//!
//! 期望集合由 topology 推导，实际集合来自 broker 元数据；只在两者交集变化时
//! 发出事件。列表失败不改变已跟踪集合，空列表需要连续确认才视为真实的大面积消失。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::health::metrics;
use crate::kafka::{BrokerError, TopicCatalog};
use crate::topology::{TableBinding, Topology};

pub type DesiredTopics = Arc<BTreeMap<String, TableBinding>>;

#[derive(Debug, Clone, PartialEq)]
pub enum TopicEvent {
    Appeared(TableBinding),
    Disappeared(String),
}

impl TopicEvent {
    pub fn topic(&self) -> String {
        match self {
            TopicEvent::Appeared(binding) => binding.topic_name(),
            TopicEvent::Disappeared(topic) => topic.clone(),
        }
    }
}

pub struct TopicDiscoverer {
    catalog: Arc<dyn TopicCatalog>,
    desired_tx: watch::Sender<DesiredTopics>,
    tracked: BTreeSet<String>,
    empty_streak: u32,
    empty_confirmations: u32,
}

impl TopicDiscoverer {
    pub fn new(catalog: Arc<dyn TopicCatalog>, topology: &Topology, empty_confirmations: u32) -> Self {
        let (desired_tx, _) = watch::channel(Arc::new(topology.desired_topics()));
        Self {
            catalog,
            desired_tx,
            tracked: BTreeSet::new(),
            empty_streak: 0,
            empty_confirmations: empty_confirmations.max(1),
        }
    }

    pub fn desired(&self) -> DesiredTopics {
        self.desired_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DesiredTopics> {
        self.desired_tx.subscribe()
    }

    /// Topics for which `Appeared` has been emitted and not yet withdrawn.
    pub fn tracked(&self) -> &BTreeSet<String> {
        &self.tracked
    }

    /// Replace the desired set. Tracked topics that are no longer desired disappear
    /// right away, whether or not they still exist on the broker.
    pub fn set_topology(&mut self, topology: &Topology) -> Vec<TopicEvent> {
        let desired = Arc::new(topology.desired_topics());
        let removed: Vec<String> = self
            .tracked
            .iter()
            .filter(|t| !desired.contains_key(*t))
            .cloned()
            .collect();
        self.desired_tx.send_replace(desired);
        removed
            .into_iter()
            .map(|topic| {
                self.tracked.remove(&topic);
                log::info!(target: "cdc::discovery", "topic {} removed from topology", topic);
                TopicEvent::Disappeared(topic)
            })
            .collect()
    }

    pub async fn tick(&mut self) -> Result<Vec<TopicEvent>, BrokerError> {
        let actual = match self.catalog.list_topics().await {
            Ok(actual) => actual,
            Err(err) => {
                metrics::discovery_failed();
                log::warn!(target: "cdc::discovery", "list topics fail, keep {} tracked: {}", self.tracked.len(), err);
                return Err(err);
            }
        };

        if actual.is_empty() && !self.tracked.is_empty() {
            self.empty_streak += 1;
            if self.empty_streak < self.empty_confirmations {
                log::warn!(
                    target: "cdc::discovery",
                    "broker reported no topics ({}/{}), waiting for confirmation",
                    self.empty_streak,
                    self.empty_confirmations
                );
                return Ok(Vec::new());
            }
        } else {
            self.empty_streak = 0;
        }

        let desired = self.desired();
        let present: BTreeSet<String> = desired
            .keys()
            .filter(|t| actual.contains(*t))
            .cloned()
            .collect();

        let mut events = Vec::new();
        for gone in self.tracked.difference(&present) {
            log::info!(target: "cdc::discovery", "topic disappeared: {}", gone);
            events.push(TopicEvent::Disappeared(gone.clone()));
        }
        for topic in present.difference(&self.tracked) {
            if let Some(binding) = desired.get(topic) {
                log::info!(target: "cdc::discovery", "topic appeared: {}", topic);
                events.push(TopicEvent::Appeared(binding.clone()));
            }
        }
        self.tracked = present;
        self.empty_streak = 0;
        Ok(events)
    }

    /// Poll until cancelled, forwarding events. Topology reloads arrive on `topology_rx`.
    pub async fn run(
        mut self,
        events: mpsc::Sender<TopicEvent>,
        topology_rx: watch::Receiver<Topology>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut topology_rx = Some(topology_rx);
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                reloaded = next_topology(&mut topology_rx) => {
                    let mut batch = self.set_topology(&reloaded);
                    batch.extend(self.tick().await.unwrap_or_default());
                    batch
                }
                _ = ticker.tick() => self.tick().await.unwrap_or_default(),
            };
            for event in batch {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
        log::info!(target: "cdc::discovery", "discovery stopped");
    }
}

async fn next_topology(rx: &mut Option<watch::Receiver<Topology>>) -> Topology {
    if let Some(inner) = rx {
        if inner.changed().await.is_ok() {
            return inner.borrow_and_update().clone();
        }
        *rx = None;
    }
    std::future::pending().await
}

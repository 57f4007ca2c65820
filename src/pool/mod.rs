//! Supervised registry of per-topic consumer tasks.
//!
//! 每个 topic 至多一个存活任务：stop 会等待旧任务真正结束（或在宽限期后强制中止）
//! 才返回，随后的 start 不会与它重叠。

mod task;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::discovery::TopicEvent;
use crate::health::metrics;
use crate::topology::TableBinding;

pub use task::{ConsumerState, ConsumerStats, ConsumerTask, TaskContext, TaskExit};

struct Worker {
    binding: TableBinding,
    cancel: CancellationToken,
    handle: JoinHandle<TaskExit>,
    stats: watch::Receiver<ConsumerStats>,
}

/// A task that ended on its own, handed to the health monitor.
#[derive(Debug, Clone)]
pub struct ExitedTask {
    pub binding: TableBinding,
    pub exit: TaskExit,
    pub stats: ConsumerStats,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    pub drained: Vec<String>,
    pub aborted: Vec<String>,
}

impl ShutdownReport {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_empty()
    }
}

pub struct ConsumerPool {
    ctx: Arc<TaskContext>,
    stop_grace: Duration,
    workers: BTreeMap<String, Worker>,
    restarts: BTreeMap<String, u32>,
}

impl ConsumerPool {
    pub fn new(ctx: TaskContext, stop_grace: Duration) -> Self {
        Self {
            ctx: Arc::new(ctx),
            stop_grace,
            workers: BTreeMap::new(),
            restarts: BTreeMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<TaskContext> {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn topics(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn is_running(&self, topic: &str) -> bool {
        self.workers
            .get(topic)
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Spawn a task for the binding's topic unless one is registered already.
    /// Returns whether a task was started.
    pub fn start(&mut self, binding: TableBinding) -> bool {
        let topic = binding.topic_name();
        if self.workers.contains_key(&topic) {
            log::debug!(target: "cdc::pool", "consumer for {} already registered", topic);
            return false;
        }
        let restarts = self.restarts.get(&topic).copied().unwrap_or(0);
        let (task, stats) = ConsumerTask::new(binding.clone(), self.ctx.clone(), restarts);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task.run(cancel.clone()));
        self.workers.insert(
            topic,
            Worker {
                binding,
                cancel,
                handle,
                stats,
            },
        );
        metrics::set_live_consumers(self.workers.len());
        true
    }

    /// Start again after an unexpected exit; counts towards the topic's restarts.
    pub fn restart(&mut self, binding: TableBinding) -> bool {
        let topic = binding.topic_name();
        if self.workers.contains_key(&topic) {
            return false;
        }
        *self.restarts.entry(topic.clone()).or_default() += 1;
        metrics::consumer_restarted(&topic);
        self.start(binding)
    }

    /// Cancel the topic's task and wait for it to drain, aborting after the grace period.
    pub async fn stop(&mut self, topic: &str) -> Option<TaskExit> {
        let worker = self.workers.remove(topic)?;
        self.restarts.remove(topic);
        metrics::set_live_consumers(self.workers.len());
        metrics::clear_lag(topic);
        worker.cancel.cancel();
        let exit = finish(worker.handle, self.stop_grace).await;
        if exit == TaskExit::Aborted {
            log::warn!(target: "cdc::pool", "consumer {} did not drain within {:?}, aborted", topic, self.stop_grace);
        }
        Some(exit)
    }

    pub async fn apply(&mut self, event: TopicEvent) {
        match event {
            TopicEvent::Appeared(binding) => {
                self.start(binding);
            }
            TopicEvent::Disappeared(topic) => {
                self.stop(&topic).await;
            }
        }
    }

    /// Remove tasks that have ended on their own.
    pub async fn reap(&mut self) -> Vec<ExitedTask> {
        let finished: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, w)| w.handle.is_finished())
            .map(|(topic, _)| topic.clone())
            .collect();
        let mut exited = Vec::with_capacity(finished.len());
        for topic in finished {
            if let Some(worker) = self.workers.remove(&topic) {
                let stats = worker.stats.borrow().clone();
                let exit = joined(worker.handle.await);
                exited.push(ExitedTask {
                    binding: worker.binding,
                    exit,
                    stats,
                });
            }
        }
        if !exited.is_empty() {
            metrics::set_live_consumers(self.workers.len());
        }
        exited
    }

    /// Cancel everything, then wait for all tasks against one overall deadline.
    pub async fn shutdown(&mut self, timeout: Duration) -> ShutdownReport {
        for worker in self.workers.values() {
            worker.cancel.cancel();
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();
        for (topic, worker) in std::mem::take(&mut self.workers) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match finish(worker.handle, remaining).await {
                TaskExit::Aborted => report.aborted.push(topic),
                _ => report.drained.push(topic),
            }
        }
        metrics::set_live_consumers(0);
        if !report.is_complete() {
            log::warn!(
                target: "cdc::pool",
                "partial shutdown: {} consumer(s) aborted before draining: {:?}",
                report.aborted.len(),
                report.aborted
            );
        }
        report
    }

    /// Point-in-time stats of every registered task.
    pub fn roster(&self) -> BTreeMap<String, ConsumerStats> {
        self.workers
            .iter()
            .map(|(topic, w)| (topic.clone(), w.stats.borrow().clone()))
            .collect()
    }
}

async fn finish(mut handle: JoinHandle<TaskExit>, grace: Duration) -> TaskExit {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(res) => joined(res),
        Err(_) => {
            handle.abort();
            // 等待任务真正被丢弃，释放其 broker 订阅
            if let Err(e) = handle.await {
                log::debug!(target: "cdc::pool", "aborted task joined: {}", e);
            }
            TaskExit::Aborted
        }
    }
}

fn joined(res: Result<TaskExit, tokio::task::JoinError>) -> TaskExit {
    match res {
        Ok(exit) => exit,
        Err(e) if e.is_cancelled() => TaskExit::Aborted,
        Err(e) => TaskExit::Panicked(e.to_string()),
    }
}

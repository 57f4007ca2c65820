use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::envelope::EnvelopeDecoder;
use crate::health::metrics;
use crate::kafka::{BrokerError, RecordStream, StreamFactory};
use crate::topology::TableBinding;
use crate::writer::{Batch, ConsolidationWriter, FlushError, FlushReport};

/// 连续多少次瞬时 poll 错误后放弃，交给健康监控按退避重启
const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 20;

/// Shared by every consumer task of one pool.
pub struct TaskContext {
    pub factory: Arc<dyn StreamFactory>,
    pub group_id: String,
    pub decoder: EnvelopeDecoder,
    pub writer: ConsolidationWriter,
    pub batch_size: usize,
    pub linger: Duration,
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    #[default]
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsumerStats {
    pub topic: String,
    pub state: ConsumerState,
    pub started_at_ms: i64,
    pub last_commit_ms: Option<i64>,
    pub records: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub quarantined: u64,
    pub lag: Option<i64>,
    pub restarts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    /// Stopped on request after draining.
    Cancelled,
    Subscribe(String),
    Broker(String),
    Store(String),
    Commit(String),
    /// Forced stop after the grace period.
    Aborted,
    Panicked(String),
}

impl TaskExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, TaskExit::Cancelled)
    }

    fn reason(&self) -> Option<String> {
        match self {
            TaskExit::Cancelled => None,
            TaskExit::Aborted => Some("aborted".to_string()),
            TaskExit::Subscribe(e)
            | TaskExit::Broker(e)
            | TaskExit::Store(e)
            | TaskExit::Commit(e)
            | TaskExit::Panicked(e) => Some(e.clone()),
        }
    }
}

impl From<FlushError> for TaskExit {
    fn from(err: FlushError) -> Self {
        match err {
            FlushError::Store(e) => TaskExit::Store(e.to_string()),
            FlushError::Commit(e) => TaskExit::Commit(e.to_string()),
        }
    }
}

/// One topic bound to a poll → decode → batch → flush loop.
pub struct ConsumerTask {
    binding: TableBinding,
    ctx: Arc<TaskContext>,
    stats: watch::Sender<ConsumerStats>,
}

impl ConsumerTask {
    pub fn new(binding: TableBinding, ctx: Arc<TaskContext>, restarts: u32) -> (Self, watch::Receiver<ConsumerStats>) {
        let (stats, rx) = watch::channel(ConsumerStats {
            topic: binding.topic_name(),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
            restarts,
            ..ConsumerStats::default()
        });
        (
            Self {
                binding,
                ctx,
                stats,
            },
            rx,
        )
    }

    pub fn topic(&self) -> String {
        self.binding.topic_name()
    }

    pub async fn run(self, cancel: CancellationToken) -> TaskExit {
        let topic = self.topic();
        let exit = match self.ctx.factory.subscribe(&topic, &self.ctx.group_id).await {
            Ok(mut stream) => {
                log::info!(target: "cdc::pool", "consumer started: {}", topic);
                self.stats.send_modify(|s| s.state = ConsumerState::Running);
                let exit = self.consume(stream.as_mut(), &cancel).await;
                stream.close().await;
                exit
            }
            Err(e) => TaskExit::Subscribe(e.to_string()),
        };
        let state = if exit.is_clean() {
            log::info!(target: "cdc::pool", "consumer stopped: {}", topic);
            ConsumerState::Stopped
        } else {
            log::error!(target: "cdc::pool", "consumer {} exited: {:?}", topic, exit);
            ConsumerState::Failed
        };
        self.stats.send_modify(|s| {
            s.state = state;
            if let Some(reason) = exit.reason() {
                s.last_error = Some(reason);
            }
        });
        exit
    }

    async fn consume(&self, stream: &mut dyn RecordStream, cancel: &CancellationToken) -> TaskExit {
        let ctx = &self.ctx;
        let mut batch = Batch::default();
        let mut deadline: Option<Instant> = None;
        let mut poll_errors = 0u32;
        loop {
            let linger = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // 排空：已暂存的记录写入并提交后再退出
                    self.stats.send_modify(|s| s.state = ConsumerState::Draining);
                    if !batch.is_empty() {
                        if let Err(e) = self.flush(&mut batch, stream).await {
                            return e;
                        }
                    }
                    return TaskExit::Cancelled;
                }
                _ = linger => {
                    deadline = None;
                    if let Err(e) = self.flush(&mut batch, stream).await {
                        return e;
                    }
                }
                polled = stream.poll(ctx.poll_timeout) => match polled {
                    Ok(Some(record)) => {
                        poll_errors = 0;
                        let decoded = ctx.decoder.decode(&record, Some(&self.binding));
                        ctx.writer.stage(&mut batch, &record, decoded);
                        self.stats.send_modify(|s| s.records += 1);
                        if batch.len() >= ctx.batch_size {
                            deadline = None;
                            if let Err(e) = self.flush(&mut batch, stream).await {
                                return e;
                            }
                        } else if deadline.is_none() {
                            deadline = Some(Instant::now() + ctx.linger);
                        }
                    }
                    Ok(None) => {
                        poll_errors = 0;
                        self.observe_lag(stream).await;
                    }
                    Err(e) => {
                        if let Some(exit) = self.poll_failed(e, &mut poll_errors) {
                            return exit;
                        }
                        tokio::time::sleep(ctx.poll_timeout.min(Duration::from_millis(500))).await;
                    }
                },
            }
        }
    }

    fn poll_failed(&self, err: BrokerError, consecutive: &mut u32) -> Option<TaskExit> {
        let topic = self.topic();
        if err.is_fatal() {
            log::error!(target: "cdc::pool", "fatal broker error on {}: {}", topic, err);
            return Some(TaskExit::Broker(err.to_string()));
        }
        *consecutive += 1;
        log::warn!(
            target: "cdc::pool",
            "poll {} fail ({}/{}): {}",
            topic,
            consecutive,
            MAX_CONSECUTIVE_POLL_ERRORS,
            err
        );
        self.stats.send_modify(|s| s.last_error = Some(err.to_string()));
        (*consecutive >= MAX_CONSECUTIVE_POLL_ERRORS).then(|| TaskExit::Broker(err.to_string()))
    }

    async fn flush(&self, batch: &mut Batch, stream: &mut dyn RecordStream) -> Result<(), TaskExit> {
        if batch.is_empty() {
            return Ok(());
        }
        let report = self.ctx.writer.flush(batch, stream).await?;
        self.record_flush(&report);
        self.observe_lag(stream).await;
        Ok(())
    }

    fn record_flush(&self, report: &FlushReport) {
        self.stats.send_modify(|s| {
            s.inserted += report.inserted;
            s.duplicates += report.duplicates;
            s.quarantined += report.quarantined as u64;
            if report.committed {
                s.last_commit_ms = Some(chrono::Utc::now().timestamp_millis());
            }
        });
    }

    async fn observe_lag(&self, stream: &mut dyn RecordStream) {
        if let Some(lag) = stream.lag().await {
            metrics::set_lag(&self.stats.borrow().topic, lag);
            self.stats.send_if_modified(|s| {
                let changed = s.lag != Some(lag);
                s.lag = Some(lag);
                changed
            });
        }
    }
}

//! Capture-connector lifecycle against the Kafka Connect style control plane.
//!
//! - client：HTTP 客户端（reqwest）与 [`ControlPlane`] 抽象
//! - spec：由 [`TableBinding`](crate::topology::TableBinding) 推导 connector 配置
//! - provisioner：对账、重新注册、状态刷新，connector 状态的唯一写者
//! - memory：进程内控制面，测试使用

mod client;
mod memory;
mod provisioner;
mod spec;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::retry::Retryable;

pub use client::{ConnectClient, ControlPlane};
pub use memory::MemoryControlPlane;
pub use provisioner::{ConnectorRecord, ConnectorStates, Provisioner, ReconcileReport};
pub use spec::ConnectorSpec;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ControlError {
    #[error("control plane unreachable: {0}")]
    Transport(String),
    #[error("control plane returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("unexpected control plane response: {0}")]
    Decode(String),
}

impl Retryable for ControlError {
    fn is_transient(&self) -> bool {
        match self {
            ControlError::Transport(_) => true,
            // 409 在 Connect 集群 rebalance 期间出现
            ControlError::Http { status, .. } => {
                *status >= 500 || matches!(status, 408 | 409 | 429)
            }
            ControlError::Decode(_) => false,
        }
    }
}

/// Registration state of one connector as tracked by the provisioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorState {
    #[default]
    Absent,
    Pending,
    Running,
    Failed,
    Stopped,
}

impl ConnectorState {
    pub fn can_transition(self, to: ConnectorState) -> bool {
        use ConnectorState::*;
        matches!(
            (self, to),
            (Absent, Pending)
                | (Pending, Running)
                | (Pending, Failed)
                | (Running, Failed)
                | (Failed, Pending)
                | (Running, Stopped)
                | (Failed, Stopped)
                // 表被移除后又加回
                | (Stopped, Pending)
                | (Pending, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::Absent => "absent",
            ConnectorState::Pending => "pending",
            ConnectorState::Running => "running",
            ConnectorState::Failed => "failed",
            ConnectorState::Stopped => "stopped",
        }
    }
}

impl Display for ConnectorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkerState {
    pub state: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskStatus {
    #[serde(default)]
    pub id: u32,
    pub state: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,
}

/// Body of `GET /connectors/{name}/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConnectorStatus {
    #[serde(default)]
    pub name: String,
    pub connector: WorkerState,
    #[serde(default)]
    pub tasks: Vec<TaskStatus>,
}

/// What the control plane reports, reduced to what the state machine cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Running,
    Pending,
    Failed(String),
}

impl ConnectorStatus {
    pub fn observed(&self) -> Observed {
        if self.connector.state.eq_ignore_ascii_case("FAILED") {
            return Observed::Failed(first_line(
                self.connector.trace.as_deref().unwrap_or("connector failed"),
            ));
        }
        if let Some(task) = self
            .tasks
            .iter()
            .find(|t| t.state.eq_ignore_ascii_case("FAILED"))
        {
            let trace = task.trace.as_deref().unwrap_or("task failed");
            return Observed::Failed(format!("task {}: {}", task.id, first_line(trace)));
        }
        let running = self.connector.state.eq_ignore_ascii_case("RUNNING")
            && !self.tasks.is_empty()
            && self
                .tasks
                .iter()
                .all(|t| t.state.eq_ignore_ascii_case("RUNNING"));
        if running {
            Observed::Running
        } else {
            Observed::Pending
        }
    }
}

fn first_line(trace: &str) -> String {
    trace.lines().next().unwrap_or_default().trim().to_string()
}

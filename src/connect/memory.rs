use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{ConnectorSpec, ConnectorStatus, ControlError, ControlPlane, TaskStatus, WorkerState};

#[derive(Debug, Default)]
struct Inner {
    configs: BTreeMap<String, Map<String, Value>>,
    /// 覆盖 status 返回；未设置时视为 RUNNING
    states: BTreeMap<String, (String, String)>,
    failing: BTreeMap<String, ControlError>,
    unreachable: bool,
    mutations: usize,
    restarts: BTreeSet<String>,
}

/// In-process control plane that behaves like the real REST API: values are echoed back
/// as strings with `name` added, unknown connectors are `None`.
#[derive(Debug, Clone, Default)]
pub struct MemoryControlPlane {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Register a connector the provisioner did not create.
    pub fn insert_foreign(&self, name: &str, config: Map<String, Value>) {
        self.with(|inner| inner.configs.insert(name.to_string(), config));
    }

    /// Force `state` for the connector (`RUNNING`, `FAILED`, ...) with a trace.
    pub fn set_state(&self, name: &str, state: &str, trace: &str) {
        self.with(|inner| {
            inner
                .states
                .insert(name.to_string(), (state.to_string(), trace.to_string()))
        });
    }

    /// Every mutating call for `name` fails with `err` until cleared.
    pub fn fail_mutations(&self, name: &str, err: Option<ControlError>) {
        self.with(|inner| match err {
            Some(err) => inner.failing.insert(name.to_string(), err),
            None => inner.failing.remove(name),
        });
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.with(|inner| inner.unreachable = unreachable);
    }

    /// create + update + delete + restart calls that reached the store.
    pub fn mutations(&self) -> usize {
        self.with(|inner| inner.mutations)
    }

    pub fn restarted(&self, name: &str) -> bool {
        self.with(|inner| inner.restarts.contains(name))
    }

    pub fn names(&self) -> Vec<String> {
        self.with(|inner| inner.configs.keys().cloned().collect())
    }

    pub fn config(&self, name: &str) -> Option<Map<String, Value>> {
        self.with(|inner| inner.configs.get(name).cloned())
    }

    fn reachable(inner: &Inner) -> Result<(), ControlError> {
        if inner.unreachable {
            return Err(ControlError::Transport("connection refused".into()));
        }
        Ok(())
    }

    fn mutate(inner: &mut Inner, name: &str) -> Result<(), ControlError> {
        Self::reachable(inner)?;
        if let Some(err) = inner.failing.get(name) {
            return Err(err.clone());
        }
        inner.mutations += 1;
        Ok(())
    }
}

fn echoed(name: &str, config: &Map<String, Value>) -> Map<String, Value> {
    let mut out: Map<String, Value> = config
        .iter()
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), json!(s))
        })
        .collect();
    out.insert("name".into(), json!(name));
    out
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn ping(&self) -> Result<(), ControlError> {
        self.with(|inner| Self::reachable(inner))
    }

    async fn list(&self) -> Result<Vec<String>, ControlError> {
        self.with(|inner| {
            Self::reachable(inner)?;
            Ok(inner.configs.keys().cloned().collect())
        })
    }

    async fn get_config(&self, name: &str) -> Result<Option<Map<String, Value>>, ControlError> {
        self.with(|inner| {
            Self::reachable(inner)?;
            Ok(inner.configs.get(name).map(|c| echoed(name, c)))
        })
    }

    async fn create(&self, spec: &ConnectorSpec) -> Result<(), ControlError> {
        self.with(|inner| {
            Self::mutate(inner, &spec.name)?;
            if inner.configs.contains_key(&spec.name) {
                return Err(ControlError::Http {
                    status: 409,
                    body: format!("Connector {} already exists", spec.name),
                });
            }
            inner.configs.insert(spec.name.clone(), spec.config.clone());
            Ok(())
        })
    }

    async fn update(&self, spec: &ConnectorSpec) -> Result<(), ControlError> {
        self.with(|inner| {
            Self::mutate(inner, &spec.name)?;
            inner.configs.insert(spec.name.clone(), spec.config.clone());
            Ok(())
        })
    }

    async fn status(&self, name: &str) -> Result<Option<ConnectorStatus>, ControlError> {
        self.with(|inner| {
            Self::reachable(inner)?;
            if !inner.configs.contains_key(name) {
                return Ok(None);
            }
            let (state, trace) = inner
                .states
                .get(name)
                .cloned()
                .unwrap_or_else(|| ("RUNNING".to_string(), String::new()));
            let trace = (!trace.is_empty()).then_some(trace);
            Ok(Some(ConnectorStatus {
                name: name.to_string(),
                connector: WorkerState {
                    state: "RUNNING".into(),
                    worker_id: Some("memory:8083".into()),
                    trace: None,
                },
                tasks: vec![TaskStatus {
                    id: 0,
                    state,
                    worker_id: Some("memory:8083".into()),
                    trace,
                }],
            }))
        })
    }

    async fn restart(&self, name: &str) -> Result<(), ControlError> {
        self.with(|inner| {
            Self::mutate(inner, name)?;
            if !inner.configs.contains_key(name) {
                return Err(ControlError::Http {
                    status: 404,
                    body: format!("Connector {name} not found"),
                });
            }
            inner.restarts.insert(name.to_string());
            inner.states.remove(name);
            Ok(())
        })
    }

    async fn delete(&self, name: &str) -> Result<(), ControlError> {
        self.with(|inner| {
            Self::mutate(inner, name)?;
            inner.configs.remove(name);
            inner.states.remove(name);
            Ok(())
        })
    }
}

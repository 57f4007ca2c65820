use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ChangeStore, ConsolidatedRecord, StoreError};
use crate::envelope::OpKind;

#[derive(Debug, Default)]
struct State {
    rows: Vec<ConsolidatedRecord>,
    keys: HashSet<String>,
    queued_errors: VecDeque<StoreError>,
    /// record ids rejected with a permanent error whenever they appear in a batch
    poisoned: HashSet<String>,
    batches: usize,
}

/// Store double with the same insert-or-ignore contract as the SQL store.
/// A batch either lands completely or not at all.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Fail the next `write_batch` calls with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.with(|s| s.queued_errors.extend(errors));
    }

    pub fn poison(&self, record_id: &str) {
        self.with(|s| {
            s.poisoned.insert(record_id.to_string());
        });
    }

    pub fn rows(&self) -> Vec<ConsolidatedRecord> {
        self.with(|s| s.rows.clone())
    }

    pub fn len(&self) -> usize {
        self.with(|s| s.rows.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful batch commits.
    pub fn batches(&self) -> usize {
        self.with(|s| s.batches)
    }

    /// Operations recorded for one row identity, in arrival order.
    pub fn history(&self, table: &str, record_id: &str) -> Vec<OpKind> {
        self.with(|s| {
            s.rows
                .iter()
                .filter(|r| r.source_table == table && r.record_id == record_id)
                .map(|r| r.operation)
                .collect()
        })
    }

    /// Latest after-image per `(table, record_id)`, replaying rows by source time.
    /// Deleted identities have no entry.
    pub fn current_rows(&self) -> BTreeMap<(String, String), String> {
        let mut rows = self.rows();
        rows.sort_by_key(|r| (r.source_ts_ms, r.kafka_partition, r.kafka_offset));
        let mut current = BTreeMap::new();
        for r in rows {
            let key = (r.source_table.clone(), r.record_id.clone());
            match (r.operation, r.after_data) {
                (OpKind::Delete, _) | (_, None) => {
                    current.remove(&key);
                }
                (_, Some(after)) => {
                    current.insert(key, after);
                }
            }
        }
        current
    }
}

#[async_trait]
impl ChangeStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn write_batch(&self, records: &[ConsolidatedRecord]) -> Result<u64, StoreError> {
        self.with(|s| {
            if let Some(err) = s.queued_errors.pop_front() {
                return Err(err);
            }
            if let Some(bad) = records.iter().find(|r| s.poisoned.contains(&r.record_id)) {
                return Err(StoreError::Permanent(format!(
                    "value rejected for record_id '{}'",
                    bad.record_id
                )));
            }
            let mut inserted = 0;
            for record in records {
                if s.keys.insert(record.change_key.clone()) {
                    s.rows.push(record.clone());
                    inserted += 1;
                }
            }
            s.batches += 1;
            Ok(inserted)
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with(|s| match s.queued_errors.front() {
            Some(err) if matches!(err, StoreError::Transient(_)) => Err(err.clone()),
            _ => Ok(()),
        })
    }
}

//! Process-local bookkeeping for asynchronous remote jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::types::TaskRecord;

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

/// Key-value storage of task records by task id.
pub trait TaskStore: Send + Sync {
    fn get(&self, task_id: &str) -> Option<TaskRecord>;
    fn set(&self, record: TaskRecord);
    fn delete(&self, task_id: &str) -> Option<TaskRecord>;
}

/// Eviction limits for [`MemoryTaskStore`]. A value of `0` disables that limit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStoreConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_max_entries() -> usize {
    10_000
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            max_entries: default_max_entries(),
        }
    }
}

/// In-memory store with TTL (measured from `created_at`) and an entry cap.
pub struct MemoryTaskStore {
    config: TaskStoreConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, TaskRecord>>,
}

impl std::fmt::Debug for MemoryTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTaskStore")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish()
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new(TaskStoreConfig::default())
    }
}

impl MemoryTaskStore {
    pub fn new(config: TaskStoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: TaskStoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskRecord>> {
        // A poisoned map is still structurally valid; keep serving it.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(&self, record: &TaskRecord, now: u64) -> bool {
        let ttl = self.config.ttl_seconds;
        ttl > 0 && now >= record.created_at.saturating_add(ttl)
    }
}

impl TaskStore for MemoryTaskStore {
    fn get(&self, task_id: &str) -> Option<TaskRecord> {
        let now = self.clock.now_epoch_seconds();
        let mut entries = self.lock();
        let record = entries.get(task_id)?;
        if self.is_expired(record, now) {
            entries.remove(task_id);
            return None;
        }
        Some(record.clone())
    }

    fn set(&self, record: TaskRecord) {
        let now = self.clock.now_epoch_seconds();
        let mut entries = self.lock();
        entries.retain(|_, existing| !self.is_expired(existing, now));

        let max_entries = self.config.max_entries;
        if max_entries > 0 {
            while !entries.contains_key(&record.task_id) && entries.len() >= max_entries {
                let Some(oldest) = entries
                    .values()
                    .min_by_key(|existing| existing.created_at)
                    .map(|existing| existing.task_id.clone())
                else {
                    break;
                };
                entries.remove(&oldest);
            }
        }

        entries.insert(record.task_id.clone(), record);
    }

    fn delete(&self, task_id: &str) -> Option<TaskRecord> {
        self.lock().remove(task_id)
    }
}

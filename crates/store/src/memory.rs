use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use visage_core::{now_millis, DetectionResult, DetectionTask, TaskStatus};

use crate::{StoreError, TaskStore};

/// Process-local task store.
///
/// Every operation holds the lock for its whole read-modify-write, so
/// concurrent `update_status` calls on one id never interleave.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, DetectionTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn remove_where(&self, expired: impl Fn(&DetectionTask) -> bool) -> Vec<DetectionTask> {
        let mut tasks = self.tasks.write().expect("task store lock poisoned");
        let ids: Vec<String> = tasks
            .values()
            .filter(|&t| expired(t))
            .map(|t| t.id.clone())
            .collect();
        ids.iter().filter_map(|id| tasks.remove(id)).collect()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save(&self, task: &DetectionTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().expect("task store lock poisoned");
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<DetectionTask>, StoreError> {
        let tasks = self.tasks.read().expect("task store lock poisoned");
        Ok(tasks.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<DetectionResult>,
        error: Option<String>,
    ) -> Result<Option<DetectionTask>, StoreError> {
        let mut tasks = self.tasks.write().expect("task store lock poisoned");
        let Some(task) = tasks.get_mut(id) else {
            return Ok(None);
        };
        task.transition(status, result, error, now_millis());
        Ok(Some(task.clone()))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().expect("task store lock poisoned");
        Ok(tasks.remove(id).is_some())
    }

    async fn delete_updated_before(&self, cutoff_ms: i64) -> Result<Vec<DetectionTask>, StoreError> {
        Ok(self.remove_where(|t| t.updated_at <= cutoff_ms))
    }

    async fn delete_expired(&self, max_age: Duration) -> Result<Vec<DetectionTask>, StoreError> {
        let now = now_millis();
        Ok(self.remove_where(|t| t.is_expired(now, max_age)))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

use crate::error::{EngineError, EngineResult};
use crate::models::TaskRecord;
use crate::scheduler::CancellationFlag;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

struct TaskEntry {
    record: watch::Sender<TaskRecord>,
    cancel: CancellationFlag,
}

/// Externally queryable task records.
///
/// Each record has a single writer (its coordinator); readers either take a
/// snapshot or subscribe and wait for changes. Dropping a subscription never
/// affects the task.
#[derive(Clone, Default)]
pub struct TaskStore {
    tasks: Arc<DashMap<Uuid, Arc<TaskEntry>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, record: TaskRecord) -> (Uuid, CancellationFlag) {
        let id = Uuid::new_v4();
        let (sender, _) = watch::channel(record);
        let cancel = CancellationFlag::new();
        self.tasks.insert(
            id,
            Arc::new(TaskEntry {
                record: sender,
                cancel: cancel.clone(),
            }),
        );
        (id, cancel)
    }

    fn entry(&self, id: &Uuid) -> EngineResult<Arc<TaskEntry>> {
        self.tasks
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    pub fn get(&self, id: &Uuid) -> EngineResult<TaskRecord> {
        Ok(self.entry(id)?.record.borrow().clone())
    }

    pub fn subscribe(&self, id: &Uuid) -> EngineResult<watch::Receiver<TaskRecord>> {
        Ok(self.entry(id)?.record.subscribe())
    }

    pub fn publish(&self, id: &Uuid, record: TaskRecord) -> EngineResult<()> {
        self.entry(id)?.record.send_replace(record);
        Ok(())
    }

    /// Ask the task to stop; windows already finished keep their results.
    pub fn cancel(&self, id: &Uuid) -> EngineResult<()> {
        self.entry(id)?.cancel.cancel();
        Ok(())
    }

    pub fn remove(&self, id: &Uuid) -> Option<TaskRecord> {
        self.tasks
            .remove(id)
            .map(|(_, entry)| entry.record.borrow().clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;

    #[test]
    fn records_are_published_and_read_back() {
        let store = TaskStore::new();
        let (id, _) = store.create(TaskRecord::pending(3, 2));
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::Pending);

        let mut receiver = store.subscribe(&id).unwrap();
        let mut record = store.get(&id).unwrap();
        record.status = TaskStatus::Running;
        record.overall_progress = 40.0;
        store.publish(&id, record).unwrap();

        assert!(receiver.has_changed().unwrap());
        assert_eq!(receiver.borrow_and_update().overall_progress, 40.0);
        drop(receiver);

        // Publishing with no subscribers still updates the stored record.
        let mut record = store.get(&id).unwrap();
        record.status = TaskStatus::Done;
        store.publish(&id, record).unwrap();
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::Done);
    }

    #[test]
    fn unknown_tasks_are_reported() {
        let store = TaskStore::new();
        let missing = Uuid::new_v4();
        assert!(matches!(store.get(&missing), Err(EngineError::TaskNotFound(_))));
        assert!(store.cancel(&missing).is_err());
    }

    #[test]
    fn cancel_sets_the_task_flag() {
        let store = TaskStore::new();
        let (id, flag) = store.create(TaskRecord::pending(1, 1));
        assert!(!flag.is_cancelled());
        store.cancel(&id).unwrap();
        assert!(flag.is_cancelled());
        assert!(store.remove(&id).is_some());
        assert!(store.is_empty());
    }
}

use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{DEFAULT_HISTORY_CAP, HistoryStore, check_append};
use crate::HistoryEvent;
use crate::errors::StoreError;

/// Process-local store for tests and ephemeral runtimes.
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, Vec<HistoryEvent>>>,
    cap: usize,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new_with_cap(DEFAULT_HISTORY_CAP)
    }
}

impl InMemoryHistoryStore {
    pub fn new_with_cap(cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cap,
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(instance) {
            return Err(StoreError::AlreadyExists(instance.to_string()));
        }
        g.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<HistoryEvent>, StoreError> {
        Ok(self.inner.lock().await.get(instance).cloned().unwrap_or_default())
    }

    async fn append(&self, instance: &str, events: Vec<HistoryEvent>) -> Result<u64, StoreError> {
        let mut g = self.inner.lock().await;
        let log = g
            .get_mut(instance)
            .ok_or_else(|| StoreError::NotFound(instance.to_string()))?;
        check_append(instance, log.len(), &events, self.cap)?;
        log.extend(events);
        Ok(log.len() as u64)
    }

    async fn list_instances(&self) -> Result<Vec<String>, StoreError> {
        let mut out: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        out.sort();
        Ok(out)
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError> {
        match self.inner.lock().await.remove(instance) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(instance.to_string())),
        }
    }

    async fn reset(&self) {
        self.inner.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    fn started(id: u64) -> HistoryEvent {
        HistoryEvent::new(id, EventKind::OrchestratorStarted)
    }

    #[tokio::test]
    async fn append_requires_next_event_id() {
        let store = InMemoryHistoryStore::default();
        store.create_instance("i").await.unwrap();
        assert_eq!(store.append("i", vec![started(1), started(2)]).await.unwrap(), 2);

        // a writer holding a stale view of the log
        let err = store.append("i", vec![started(2)]).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 3, found: 2, .. }));
        assert_eq!(store.read("i").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_consecutive_batch_is_rejected_whole() {
        let store = InMemoryHistoryStore::default();
        store.create_instance("i").await.unwrap();
        assert!(store.append("i", vec![started(1), started(3)]).await.is_err());
        assert!(store.read("i").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_twice_and_unknown_append() {
        let store = InMemoryHistoryStore::default();
        store.create_instance("i").await.unwrap();
        assert!(matches!(store.create_instance("i").await, Err(StoreError::AlreadyExists(_))));
        assert!(matches!(store.append("nope", vec![started(1)]).await, Err(StoreError::NotFound(_))));
        assert!(store.read("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cap_keeps_room_for_the_terminal_record() {
        let store = InMemoryHistoryStore::new_with_cap(3);
        store.create_instance("i").await.unwrap();
        store.append("i", vec![started(1), started(2)]).await.unwrap();
        assert!(matches!(
            store.append("i", vec![started(3)]).await,
            Err(StoreError::CapExceeded { cap: 3, .. })
        ));
        let done = HistoryEvent::new(
            3,
            EventKind::OrchestratorCompleted {
                outcome: crate::Outcome::Completed { output: String::new() },
            },
        );
        assert_eq!(store.append("i", vec![done]).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn remove_reset_and_dump() {
        let store = InMemoryHistoryStore::default();
        for id in ["b", "a"] {
            store.create_instance(id).await.unwrap();
            store.append(id, vec![started(1)]).await.unwrap();
        }
        assert_eq!(store.list_instances().await.unwrap(), vec!["a", "b"]);
        let dump = store.dump_all_pretty().await;
        assert!(dump.contains("instance=a"), "{dump}");
        assert!(dump.contains("OrchestratorStarted"), "{dump}");

        store.remove_instance("a").await.unwrap();
        assert!(matches!(store.remove_instance("a").await, Err(StoreError::NotFound(_))));
        assert_eq!(store.list_instances().await.unwrap(), vec!["b"]);
        store.reset().await;
        assert!(store.list_instances().await.unwrap().is_empty());
    }
}

//! History Store contract and its implementations.
//!
//! A store keeps one append-only log per instance. `append` is the only
//! mutation a running instance performs, and it is conflict-checked: the
//! first appended record must carry the `event_id` one past the current end
//! of the log. A writer that lost track of the log therefore fails instead
//! of interleaving, which keeps a single writer per instance.

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::{EventKind, HistoryEvent};

pub mod fs;
pub mod in_memory;

/// Default cap on events per instance.
pub const DEFAULT_HISTORY_CAP: usize = 1024;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Register an empty log; `AlreadyExists` if one is present.
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError>;

    /// Full log in `event_id` order. Unknown instances read as empty.
    async fn read(&self, instance: &str) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Append `events` atomically and durably; returns the last `event_id` written.
    ///
    /// Fails with `Conflict` unless `events[0].event_id == len + 1` and the
    /// batch is consecutive, `NotFound` for unknown instances and
    /// `CapExceeded` when a non-terminal batch would leave no room under the
    /// cap. A batch ending in `OrchestratorCompleted` is never refused for size.
    async fn append(&self, instance: &str, events: Vec<HistoryEvent>) -> Result<u64, StoreError>;

    async fn list_instances(&self) -> Result<Vec<String>, StoreError>;

    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError>;

    /// Drop every instance (test utility).
    async fn reset(&self);

    /// Human-readable dump of all instances (debugging).
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await.unwrap_or_default() {
            out.push_str(&format!("instance={inst}\n"));
            for ev in self.read(&inst).await.unwrap_or_default() {
                out.push_str(&format!("  {:>4} {:?}\n", ev.event_id, ev.kind));
            }
        }
        out
    }
}

/// Shared append validation: batch must start at `len + 1` and be consecutive.
///
/// Ordinary batches must leave one slot below `cap`; a batch ending in
/// `OrchestratorCompleted` is always accepted so an instance can still be
/// closed once its log is full.
pub(crate) fn check_append(instance: &str, current_len: usize, events: &[HistoryEvent], cap: usize) -> Result<(), StoreError> {
    let mut expected = current_len as u64 + 1;
    for ev in events {
        if ev.event_id != expected {
            return Err(StoreError::Conflict {
                instance: instance.to_string(),
                expected,
                found: ev.event_id,
            });
        }
        expected += 1;
    }
    let closes = matches!(events.last().map(|e| &e.kind), Some(EventKind::OrchestratorCompleted { .. }));
    if !closes && current_len + events.len() >= cap {
        return Err(StoreError::CapExceeded {
            instance: instance.to_string(),
            cap,
        });
    }
    Ok(())
}

/// Stamp `kinds` with event ids following `history` and append them through `store`.
///
/// The in-memory `history` is extended only after the store accepted the batch.
pub async fn append_kinds(
    store: &dyn HistoryStore,
    instance: &str,
    history: &mut Vec<HistoryEvent>,
    kinds: Vec<EventKind>,
) -> Result<u64, StoreError> {
    if kinds.is_empty() {
        return Ok(crate::next_event_id(history) - 1);
    }
    let first = crate::next_event_id(history);
    let events: Vec<HistoryEvent> = kinds
        .into_iter()
        .enumerate()
        .map(|(i, kind)| HistoryEvent::new(first + i as u64, kind))
        .collect();
    let last = store.append(instance, events.clone()).await?;
    history.extend(events);
    Ok(last)
}

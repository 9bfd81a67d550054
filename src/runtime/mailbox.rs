//! Buffered external events.
//!
//! Events raised under a name queue up FIFO until an event wait on that
//! name consumes them. Nothing beyond history is kept: the queue for a name
//! is every `EventRaised` under it, minus as many as there are event waits
//! already completed on it.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::correlation::{TaskState, TaskTable};
use crate::{EventKind, HistoryEvent, TaskSpec};

/// Unconsumed payloads per event name, oldest first.
#[derive(Debug, Default)]
pub struct PendingEvents {
    queues: HashMap<String, VecDeque<String>>,
}

impl PendingEvents {
    pub fn from_history(history: &[HistoryEvent], table: &TaskTable) -> Self {
        let mut queues: HashMap<String, VecDeque<String>> = HashMap::new();
        for ev in history {
            if let EventKind::EventRaised { name, payload } = &ev.kind {
                queues.entry(name.clone()).or_default().push_back(payload.clone());
            }
        }
        for task in table.tasks() {
            if let (TaskSpec::EventWait { name }, TaskState::Completed) = (task.spec, task.state)
                && let Some(q) = queues.get_mut(name)
            {
                q.pop_front();
            }
        }
        Self { queues }
    }

    pub fn take(&mut self, name: &str) -> Option<String> {
        self.queues.get_mut(name)?.pop_front()
    }

    pub fn len(&self, name: &str) -> usize {
        self.queues.get(name).map(VecDeque::len).unwrap_or(0)
    }
}

/// Completions for every open, non-superseded event wait that has a buffered
/// event, pairing waits in sequence order with events in arrival order.
pub fn match_pending_events(history: &[HistoryEvent], superseded: &BTreeSet<u64>) -> Vec<EventKind> {
    let Ok(table) = TaskTable::from_history(history) else {
        return Vec::new();
    };
    let mut pending = PendingEvents::from_history(history, &table);
    let mut out = Vec::new();
    for (sequence_id, spec) in table.unresolved() {
        if superseded.contains(&sequence_id) {
            continue;
        }
        if let TaskSpec::EventWait { name } = spec
            && let Some(payload) = pending.take(name)
        {
            out.push(EventKind::TaskCompleted {
                sequence_id,
                result: payload,
            });
        }
    }
    out
}

//! Task correlation: pairs every `TaskScheduled` with its completion by
//! sequence id, independent of the order completions were appended.

use std::collections::BTreeMap;

use crate::errors::OrchestrationError;
use crate::{EventKind, HistoryEvent, TaskSpec};

/// How a task reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Completed(String),
    Failed(String),
}

/// Lifecycle of a single task: Scheduled, then exactly one of Completed or Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Scheduled,
    Completed,
    Failed,
}

/// Read-only view of one correlated task.
#[derive(Debug, Clone)]
pub struct Task<'a> {
    pub sequence_id: u64,
    pub spec: &'a TaskSpec,
    pub state: TaskState,
    /// `event_id` of the `TaskScheduled` record.
    pub scheduled_at: u64,
    /// `event_id` of the completion record, when terminal.
    pub resolved_at: Option<u64>,
    pub resolution: Option<&'a Resolution>,
}

#[derive(Debug, Clone)]
struct Scheduled {
    event_id: u64,
    spec: TaskSpec,
}

#[derive(Debug, Clone)]
struct Resolved {
    event_id: u64,
    resolution: Resolution,
}

/// Index of all tasks recorded in one instance history.
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    scheduled: BTreeMap<u64, Scheduled>,
    resolved: BTreeMap<u64, Resolved>,
}

impl TaskTable {
    /// Build the table, validating the structural rules a well-formed log obeys.
    pub fn from_history(history: &[HistoryEvent]) -> Result<Self, OrchestrationError> {
        let mut table = TaskTable::default();
        for (idx, ev) in history.iter().enumerate() {
            let position = idx as u64 + 1;
            if ev.event_id != position {
                return Err(corrupt(format!(
                    "event_id {} found at log position {position}",
                    ev.event_id
                )));
            }
            match &ev.kind {
                EventKind::InstanceCreated { .. } if idx != 0 => {
                    return Err(corrupt(format!("InstanceCreated at event_id {}", ev.event_id)));
                }
                EventKind::TaskScheduled { sequence_id, task } => {
                    let expected = table.scheduled.len() as u64;
                    if *sequence_id != expected {
                        return Err(corrupt(format!(
                            "TaskScheduled with sequence_id {sequence_id} at event_id {}, expected {expected}",
                            ev.event_id
                        )));
                    }
                    table.scheduled.insert(
                        *sequence_id,
                        Scheduled {
                            event_id: ev.event_id,
                            spec: task.clone(),
                        },
                    );
                }
                EventKind::TaskCompleted { sequence_id, result } => {
                    table.resolve(ev.event_id, *sequence_id, Resolution::Completed(result.clone()))?;
                }
                EventKind::TaskFailed { sequence_id, error } => {
                    table.resolve(ev.event_id, *sequence_id, Resolution::Failed(error.clone()))?;
                }
                _ => {}
            }
        }
        Ok(table)
    }

    fn resolve(&mut self, event_id: u64, sequence_id: u64, resolution: Resolution) -> Result<(), OrchestrationError> {
        if !self.scheduled.contains_key(&sequence_id) {
            return Err(corrupt(format!(
                "completion for unscheduled sequence_id {sequence_id} at event_id {event_id}"
            )));
        }
        if self.resolved.contains_key(&sequence_id) {
            return Err(corrupt(format!(
                "second completion for sequence_id {sequence_id} at event_id {event_id}"
            )));
        }
        self.resolved.insert(sequence_id, Resolved { event_id, resolution });
        Ok(())
    }

    /// Number of scheduled tasks; also the next sequence id to allocate.
    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    pub fn spec(&self, sequence_id: u64) -> Option<&TaskSpec> {
        self.scheduled.get(&sequence_id).map(|s| &s.spec)
    }

    /// Completion of a task together with the `event_id` it was recorded at.
    pub fn resolution(&self, sequence_id: u64) -> Option<(u64, &Resolution)> {
        self.resolved.get(&sequence_id).map(|r| (r.event_id, &r.resolution))
    }

    pub fn state(&self, sequence_id: u64) -> Option<TaskState> {
        self.scheduled.get(&sequence_id)?;
        Some(match self.resolved.get(&sequence_id).map(|r| &r.resolution) {
            None => TaskState::Scheduled,
            Some(Resolution::Completed(_)) => TaskState::Completed,
            Some(Resolution::Failed(_)) => TaskState::Failed,
        })
    }

    /// All tasks in sequence id order.
    pub fn tasks(&self) -> impl Iterator<Item = Task<'_>> {
        self.scheduled.iter().map(|(seq, s)| {
            let resolved = self.resolved.get(seq);
            Task {
                sequence_id: *seq,
                spec: &s.spec,
                state: match resolved.map(|r| &r.resolution) {
                    None => TaskState::Scheduled,
                    Some(Resolution::Completed(_)) => TaskState::Completed,
                    Some(Resolution::Failed(_)) => TaskState::Failed,
                },
                scheduled_at: s.event_id,
                resolved_at: resolved.map(|r| r.event_id),
                resolution: resolved.map(|r| &r.resolution),
            }
        })
    }

    /// Tasks still waiting for a completion, in sequence id order.
    pub fn unresolved(&self) -> impl Iterator<Item = (u64, &TaskSpec)> {
        self.scheduled
            .iter()
            .filter(|(seq, _)| !self.resolved.contains_key(seq))
            .map(|(seq, s)| (*seq, &s.spec))
    }
}

fn corrupt(msg: String) -> OrchestrationError {
    OrchestrationError::HistoryCorruption(msg)
}

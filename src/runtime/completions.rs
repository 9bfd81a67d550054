use std::collections::HashSet;

use tracing::{debug, warn};

use super::OrchestratorMsg;
use crate::correlation::TaskTable;
use crate::{EventKind, TaskKind};

/// Collects the history records for a batch of task completions.
///
/// Duplicates (already resolved in history or earlier in the batch) and
/// completions that do not correlate with a scheduled task of the matching
/// kind are dropped with a log line instead of being appended.
pub(crate) struct CompletionBatch<'a> {
    instance: &'a str,
    table: &'a TaskTable,
    resolved: HashSet<u64>,
    pub(crate) kinds: Vec<EventKind>,
}

impl<'a> CompletionBatch<'a> {
    pub(crate) fn new(instance: &'a str, table: &'a TaskTable) -> Self {
        Self {
            instance,
            table,
            resolved: HashSet::new(),
            kinds: Vec::new(),
        }
    }

    /// Sequence ids this batch resolves.
    pub(crate) fn resolved(&self) -> impl Iterator<Item = u64> + '_ {
        self.resolved.iter().copied()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Returns true when `msg` produced a record.
    pub(crate) fn push(&mut self, msg: OrchestratorMsg) -> bool {
        let instance = self.instance;
        let Some(sequence_id) = msg.sequence_id() else {
            warn!(instance, ?msg, "completion batch: not a task completion");
            return false;
        };
        let (expected, kind) = match msg {
            OrchestratorMsg::ActivityCompleted { result, .. } => {
                (TaskKind::Activity, EventKind::TaskCompleted { sequence_id, result })
            }
            OrchestratorMsg::ActivityFailed { error, .. } => {
                (TaskKind::Activity, EventKind::TaskFailed { sequence_id, error })
            }
            OrchestratorMsg::TimerFired { .. } => (
                TaskKind::Timer,
                EventKind::TaskCompleted {
                    sequence_id,
                    result: String::new(),
                },
            ),
            OrchestratorMsg::SubOrchCompleted { result, .. } => {
                (TaskKind::SubOrchestration, EventKind::TaskCompleted { sequence_id, result })
            }
            OrchestratorMsg::SubOrchFailed { error, .. } => {
                (TaskKind::SubOrchestration, EventKind::TaskFailed { sequence_id, error })
            }
            OrchestratorMsg::ExternalRaised { .. } | OrchestratorMsg::Terminate { .. } => return false,
        };

        let Some(spec) = self.table.spec(sequence_id) else {
            warn!(instance, sequence_id, "completion for unknown sequence_id ignored");
            return false;
        };
        if spec.kind() != expected {
            warn!(
                instance,
                sequence_id,
                scheduled = ?spec.kind(),
                received = ?expected,
                "completion kind does not match scheduled task; ignored"
            );
            return false;
        }
        if self.table.resolution(sequence_id).is_some() || !self.resolved.insert(sequence_id) {
            debug!(instance, sequence_id, "duplicate completion ignored");
            return false;
        }
        self.kinds.push(kind);
        true
    }
}

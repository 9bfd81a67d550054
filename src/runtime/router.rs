use std::collections::HashMap;

use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// Messages delivered to an instance's actor by workers, timers, child
/// instances and clients.
#[derive(Debug, Clone)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        sequence_id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        sequence_id: u64,
        error: String,
    },
    TimerFired {
        instance: String,
        sequence_id: u64,
        fire_at_ms: u64,
    },
    SubOrchCompleted {
        instance: String,
        sequence_id: u64,
        result: String,
    },
    SubOrchFailed {
        instance: String,
        sequence_id: u64,
        error: String,
    },
    ExternalRaised {
        instance: String,
        name: String,
        payload: String,
    },
    Terminate {
        instance: String,
        reason: String,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::SubOrchCompleted { instance, .. }
            | OrchestratorMsg::SubOrchFailed { instance, .. }
            | OrchestratorMsg::ExternalRaised { instance, .. }
            | OrchestratorMsg::Terminate { instance, .. } => instance,
        }
    }

    /// Correlation id for task completions; `None` for events and termination.
    pub fn sequence_id(&self) -> Option<u64> {
        match self {
            OrchestratorMsg::ActivityCompleted { sequence_id, .. }
            | OrchestratorMsg::ActivityFailed { sequence_id, .. }
            | OrchestratorMsg::TimerFired { sequence_id, .. }
            | OrchestratorMsg::SubOrchCompleted { sequence_id, .. }
            | OrchestratorMsg::SubOrchFailed { sequence_id, .. } => Some(*sequence_id),
            OrchestratorMsg::ExternalRaised { .. } | OrchestratorMsg::Terminate { .. } => None,
        }
    }
}

/// Per-instance inboxes of the active actors.
#[derive(Default)]
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    pub async fn is_registered(&self, instance: &str) -> bool {
        self.inboxes.lock().await.contains_key(instance)
    }

    /// Hand `msg` to its instance's inbox, or give it back when no actor is listening.
    pub async fn forward(&self, msg: OrchestratorMsg) -> Result<(), OrchestratorMsg> {
        let inboxes = self.inboxes.lock().await;
        match inboxes.get(msg.instance()) {
            Some(tx) => tx.send(msg).map_err(|e| {
                warn!(instance = %e.0.instance(), "router: inbox closed");
                e.0
            }),
            None => Err(msg),
        }
    }
}

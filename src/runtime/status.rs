use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tracing::error;

use super::Runtime;
use crate::errors::{OrchestrationError, RuntimeError, StoreError, WaitError};
use crate::{EventKind, HistoryEvent, Outcome, codec};

/// Lifecycle status of an instance, derived from its history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    /// Created, no executor pass yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { error: OrchestrationError },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

pub(crate) fn terminal_outcome(history: &[HistoryEvent]) -> Option<&Outcome> {
    history.iter().rev().find_map(|e| match &e.kind {
        EventKind::OrchestratorCompleted { outcome } => Some(outcome),
        _ => None,
    })
}

pub fn status_from_history(history: &[HistoryEvent]) -> OrchestrationStatus {
    if history.is_empty() {
        return OrchestrationStatus::NotFound;
    }
    if let Some(outcome) = terminal_outcome(history) {
        return match outcome.clone() {
            Outcome::Completed { output } => OrchestrationStatus::Completed { output },
            Outcome::Failed { error } => OrchestrationStatus::Failed { error },
            Outcome::Terminated { reason } => OrchestrationStatus::Terminated { reason },
        };
    }
    if history
        .iter()
        .any(|e| matches!(e.kind, EventKind::OrchestratorStarted))
    {
        OrchestrationStatus::Running
    } else {
        OrchestrationStatus::Pending
    }
}

/// Opaque per-instance management endpoints handed to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementUris {
    pub id: String,
    pub status_query_uri: String,
    /// Contains the `{eventName}` placeholder.
    pub send_event_uri_template: String,
    /// Contains the `{text}` placeholder for the reason.
    pub terminate_uri: String,
}

impl ManagementUris {
    pub(crate) fn new(base_url: &str, instance: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let instance_uri = format!("{base}/instances/{instance}");
        Self {
            id: instance.to_string(),
            status_query_uri: instance_uri.clone(),
            send_event_uri_template: format!("{instance_uri}/raiseEvent/{{eventName}}"),
            terminate_uri: format!("{instance_uri}/terminate?reason={{text}}"),
        }
    }

    pub fn send_event_uri(&self, event_name: &str) -> String {
        self.send_event_uri_template.replace("{eventName}", event_name)
    }
}

impl Runtime {
    /// Current status of `instance`. Unreadable histories report as failed
    /// with `HistoryCorruption`.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, RuntimeError> {
        match self.store.read(instance).await {
            Ok(history) => Ok(status_from_history(&history)),
            Err(e @ StoreError::Corrupt { .. }) => Ok(OrchestrationStatus::Failed {
                error: OrchestrationError::HistoryCorruption(e.to_string()),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_history(&self, instance: &str) -> Result<Vec<HistoryEvent>, RuntimeError> {
        Ok(self.store.read(instance).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.store.list_instances().await?)
    }

    pub fn management_uris(&self, instance: &str) -> ManagementUris {
        ManagementUris::new(&self.options.management_base_url, instance)
    }

    /// Wait until the instance reaches a terminal status or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            match self.get_orchestration_status(instance).await {
                Ok(status) if status.is_terminal() => return Ok(status),
                Ok(_) => {}
                Err(e) => {
                    error!(instance, error = %e, "wait_for_orchestration: status query failed");
                    return Err(WaitError::Other(e.to_string()));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }
            let nap = Duration::from_millis(delay_ms).min(deadline - now);
            tokio::time::sleep(nap).await;
            delay_ms = delay_ms.saturating_mul(2).min(self.options.status_poll_max_ms.max(1));
        }
    }

    /// Typed variant: `Ok(Ok(out))` on completion, `Ok(Err(message))` on failure or termination.
    pub async fn wait_for_orchestration_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => codec::decode::<Out>(&output)
                .map(Ok)
                .map_err(|e| WaitError::Other(format!("decode failed: {e}"))),
            OrchestrationStatus::Failed { error } => Ok(Err(error.to_string())),
            OrchestrationStatus::Terminated { reason } => {
                Ok(Err(OrchestrationError::TerminationRequested(reason).to_string()))
            }
            other => Err(WaitError::Other(format!("unexpected non-terminal status {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history_from;

    #[test]
    fn status_follows_lifecycle() {
        let mut kinds = vec![EventKind::InstanceCreated {
            name: "Hello".into(),
            input: String::new(),
            parent: None,
            format_version: crate::HISTORY_FORMAT_VERSION,
        }];
        assert_eq!(status_from_history(&[]), OrchestrationStatus::NotFound);
        assert_eq!(status_from_history(&history_from(kinds.clone())), OrchestrationStatus::Pending);
        kinds.push(EventKind::OrchestratorStarted);
        assert_eq!(status_from_history(&history_from(kinds.clone())), OrchestrationStatus::Running);
        kinds.push(EventKind::OrchestratorCompleted {
            outcome: Outcome::Terminated { reason: "stop".into() },
        });
        let status = status_from_history(&history_from(kinds));
        assert!(status.is_terminal());
        assert_eq!(status, OrchestrationStatus::Terminated { reason: "stop".into() });
    }

    #[test]
    fn management_uris_are_rooted_at_the_instance() {
        let uris = ManagementUris::new("http://localhost:7071/runtime/", "abc");
        assert_eq!(uris.status_query_uri, "http://localhost:7071/runtime/instances/abc");
        assert_eq!(
            uris.send_event_uri("Approval"),
            "http://localhost:7071/runtime/instances/abc/raiseEvent/Approval"
        );
        assert_eq!(
            uris.terminate_uri,
            "http://localhost:7071/runtime/instances/abc/terminate?reason={text}"
        );
    }
}

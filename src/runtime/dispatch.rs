use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::registry::ActivityRegistry;
use super::timers::TimerCommand;
use super::{OrchestratorMsg, Runtime};
use crate::errors::RuntimeError;
use crate::{Outcome, ParentLink, TaskSpec};

/// One activity execution handed to the worker pool.
#[derive(Debug, Clone)]
pub struct ActivityWorkItem {
    pub instance: String,
    pub sequence_id: u64,
    pub name: String,
    pub input: String,
    pub attempt: u32,
}

/// Worker pool: runs at most `max_concurrent` activities at once and reports
/// each result as an `ActivityCompleted`/`ActivityFailed` message.
pub(crate) fn start_activity_workers(
    mut rx: mpsc::UnboundedReceiver<ActivityWorkItem>,
    activities: Arc<ActivityRegistry>,
    completions: mpsc::UnboundedSender<OrchestratorMsg>,
    max_concurrent: usize,
) -> JoinHandle<()> {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let handler = activities.get(&item.name);
            let out = completions.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let ActivityWorkItem {
                    instance,
                    sequence_id,
                    name,
                    input,
                    attempt,
                } = item;
                debug!(instance = %instance, sequence_id, name = %name, attempt, "activity start");
                let result = match handler {
                    None => Err(format!("unregistered:{name}")),
                    // Run on its own task so a panicking activity becomes a failure.
                    Some(h) => match tokio::spawn(async move { h.invoke(input).await }).await {
                        Ok(r) => r,
                        Err(e) => Err(format!("activity '{name}' panicked: {e}")),
                    },
                };
                let msg = match result {
                    Ok(result) => OrchestratorMsg::ActivityCompleted {
                        instance,
                        sequence_id,
                        result,
                    },
                    Err(error) => {
                        warn!(instance = %instance, sequence_id, name = %name, attempt, error = %error, "activity failed");
                        OrchestratorMsg::ActivityFailed {
                            instance,
                            sequence_id,
                            error,
                        }
                    }
                };
                let _ = out.send(msg);
            });
        }
    })
}

impl Runtime {
    /// Hand a scheduled task to whoever executes it. Re-dispatching a task
    /// that is still in flight in this process is a no-op.
    pub(crate) async fn dispatch_task(self: &Arc<Self>, instance: &str, sequence_id: u64, spec: &TaskSpec) {
        match spec {
            TaskSpec::EventWait { .. } => {}
            TaskSpec::Timer { fire_at_ms } => {
                let _ = self.timer_tx.send(TimerCommand::Schedule {
                    instance: instance.to_string(),
                    sequence_id,
                    fire_at_ms: *fire_at_ms,
                });
            }
            TaskSpec::Activity { name, input, attempt } => {
                if !self.mark_dispatched(instance, sequence_id).await {
                    return;
                }
                let _ = self.activity_tx.send(ActivityWorkItem {
                    instance: instance.to_string(),
                    sequence_id,
                    name: name.clone(),
                    input: input.clone(),
                    attempt: *attempt,
                });
            }
            TaskSpec::SubOrchestration {
                name,
                instance: child,
                input,
            } => {
                if !self.mark_dispatched(instance, sequence_id).await {
                    return;
                }
                let parent = ParentLink {
                    instance: instance.to_string(),
                    sequence_id,
                };
                self.start_child(parent, name, child, input).await;
            }
        }
    }

    async fn mark_dispatched(&self, instance: &str, sequence_id: u64) -> bool {
        self.dispatched
            .lock()
            .await
            .insert((instance.to_string(), sequence_id))
    }

    pub(crate) async fn clear_dispatched(&self, instance: &str, sequence_ids: impl IntoIterator<Item = u64>) {
        let mut dispatched = self.dispatched.lock().await;
        for seq in sequence_ids {
            dispatched.remove(&(instance.to_string(), seq));
        }
    }

    /// Create and activate a child instance. A child that already exists is
    /// reattached: a running one is activated, a finished one re-reports its
    /// outcome to the parent.
    async fn start_child(self: &Arc<Self>, parent: ParentLink, name: &str, child: &str, input: &str) {
        match self
            .create_instance_record(child, name, input, Some(parent.clone()))
            .await
        {
            Ok(()) => {
                debug!(instance = %parent.instance, sequence_id = parent.sequence_id, child, name, "sub-orchestration started");
                self.activate(child).await;
            }
            Err(RuntimeError::AlreadyExists(_)) => match self.store.read(child).await {
                Ok(history) => match crate::runtime::status::terminal_outcome(&history) {
                    Some(outcome) => {
                        let _ = self.completion_tx.send(parent_message(&parent, outcome));
                    }
                    None => self.activate(child).await,
                },
                Err(e) => {
                    error!(child, error = %e, "failed to read existing sub-orchestration");
                    let _ = self.completion_tx.send(OrchestratorMsg::SubOrchFailed {
                        instance: parent.instance,
                        sequence_id: parent.sequence_id,
                        error: e.to_string(),
                    });
                }
            },
            Err(e) => {
                error!(child, error = %e, "failed to create sub-orchestration");
                let _ = self.completion_tx.send(OrchestratorMsg::SubOrchFailed {
                    instance: parent.instance,
                    sequence_id: parent.sequence_id,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Message reporting a child's terminal outcome to its parent task.
pub(crate) fn parent_message(parent: &ParentLink, outcome: &Outcome) -> OrchestratorMsg {
    let instance = parent.instance.clone();
    let sequence_id = parent.sequence_id;
    match outcome {
        Outcome::Completed { output } => OrchestratorMsg::SubOrchCompleted {
            instance,
            sequence_id,
            result: output.clone(),
        },
        Outcome::Failed { error } => OrchestratorMsg::SubOrchFailed {
            instance,
            sequence_id,
            error: error.to_string(),
        },
        Outcome::Terminated { reason } => OrchestratorMsg::SubOrchFailed {
            instance,
            sequence_id,
            error: crate::OrchestrationError::TerminationRequested(reason.clone()).to_string(),
        },
    }
}

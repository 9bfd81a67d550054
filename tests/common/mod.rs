#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use durable_orchestrator::providers::HistoryStore;
use durable_orchestrator::runtime::RuntimeOptions;
use durable_orchestrator::{EventKind, HistoryEvent, TaskKind, TaskSpec};

pub const WAIT: Duration = Duration::from_secs(10);

/// Poll `store` until `pred` holds for the instance history or `timeout_ms` elapses.
pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, pred: F, timeout_ms: u64) -> bool
where
    F: Fn(&[HistoryEvent]) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if pred(&hist) {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Options that make idle actors dehydrate quickly.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions::default().with_instance_idle_timeout_ms(25)
}

pub fn scheduled(history: &[HistoryEvent], kind: TaskKind) -> Vec<(u64, TaskSpec)> {
    history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TaskScheduled { sequence_id, task } if task.kind() == kind => Some((*sequence_id, task.clone())),
            _ => None,
        })
        .collect()
}

pub fn activity_scheduled(history: &[HistoryEvent], name: &str) -> usize {
    scheduled(history, TaskKind::Activity)
        .iter()
        .filter(|(_, t)| t.name() == Some(name))
        .count()
}

pub fn failed_seqs(history: &[HistoryEvent]) -> Vec<u64> {
    history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TaskFailed { sequence_id, .. } => Some(*sequence_id),
            _ => None,
        })
        .collect()
}

pub fn has_wait(history: &[HistoryEvent], name: &str) -> bool {
    history.iter().any(|e| {
        matches!(&e.kind, EventKind::TaskScheduled { task: TaskSpec::EventWait { name: n }, .. } if n == name)
    })
}

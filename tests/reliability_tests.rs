use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use durable_orchestrator::errors::{RuntimeError, StoreError};
use durable_orchestrator::providers::fs::FsHistoryStore;
use durable_orchestrator::providers::in_memory::InMemoryHistoryStore;
use durable_orchestrator::providers::{HistoryStore, append_kinds};
use durable_orchestrator::runtime::{ActivityRegistry, Runtime, RuntimeOptions};
use durable_orchestrator::{
    EventKind, HISTORY_FORMAT_VERSION, HistoryEvent, OrchestrationContext, OrchestrationError, OrchestrationRegistry,
    OrchestrationStatus, TaskKind, TaskSpec, history_from,
};
mod common;

fn echo_activities() -> Arc<ActivityRegistry> {
    Arc::new(
        ActivityRegistry::builder()
            .register("Echo", |input: String| async move { Ok(input) })
            .build(),
    )
}

fn timer_chain() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Chain", |ctx: OrchestrationContext, input: String| async move {
            let a = ctx.schedule_activity("Echo", format!("{input}-a")).into_activity().await?;
            ctx.schedule_timer(300).into_timer().await;
            let b = ctx.schedule_activity("Echo", format!("{a}-b")).into_activity().await?;
            Ok(b)
        })
        .build()
}

#[tokio::test]
async fn fs_store_resumes_after_restart() {
    let td = tempfile::tempdir().unwrap();
    let store1: Arc<dyn HistoryStore> = Arc::new(FsHistoryStore::new(td.path(), true));
    let rt1 = Runtime::start_with_store(store1.clone(), echo_activities(), timer_chain()).await;
    let id = rt1.start_orchestration("Chain", "x", Some("resume-1")).await.unwrap();
    let timer_recorded = common::wait_for_history(
        store1.clone(),
        &id,
        |h| !common::scheduled(h, TaskKind::Timer).is_empty(),
        5_000,
    )
    .await;
    assert!(timer_recorded);
    rt1.shutdown().await;

    let store2: Arc<dyn HistoryStore> = Arc::new(FsHistoryStore::new(td.path(), false));
    let rt2 = Runtime::start_with_store(store2.clone(), echo_activities(), timer_chain()).await;
    let status = rt2.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "x-a-b".into() });

    let h = store2.read(&id).await.unwrap();
    assert_eq!(common::activity_scheduled(&h, "Echo"), 2);
    assert!(h.iter().enumerate().all(|(i, e)| e.event_id == i as u64 + 1));
    rt2.shutdown().await;
}

#[tokio::test]
async fn stale_append_is_a_conflict() {
    let store = InMemoryHistoryStore::default();
    store.create_instance("c1").await.unwrap();
    let mut mine = Vec::new();
    append_kinds(&store, "c1", &mut mine, vec![EventKind::OrchestratorStarted])
        .await
        .unwrap();

    // a second writer that never saw the first record
    let mut stale: Vec<HistoryEvent> = Vec::new();
    let err = append_kinds(&store, "c1", &mut stale, vec![EventKind::OrchestratorStarted])
        .await
        .unwrap_err();
    match err {
        StoreError::Conflict { expected, found, .. } => {
            assert_eq!((expected, found), (2, 1));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(stale.is_empty(), "local history must not grow on failure");
    assert_eq!(store.read("c1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn event_raised_before_the_wait_is_not_lost() {
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("Slow", |input: String| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(input)
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register("Buffered", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Slow", "").into_activity().await?;
            Ok(ctx.schedule_wait("Approval").into_event().await)
        })
        .build();
    let rt = Runtime::start(activities, orchestrations).await;
    let id = rt.start_orchestration("Buffered", "", None).await.unwrap();
    rt.raise_event(&id, "Approval", r#"{"ok":true}"#).await.unwrap();

    let status = rt.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: r#"{"ok":true}"#.into()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn events_are_consumed_fifo_per_name() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Twice", |ctx: OrchestrationContext, _input: String| async move {
            let first = ctx.schedule_wait("E").into_event().await;
            let second = ctx.schedule_wait("E").into_event().await;
            Ok(format!("{first},{second}"))
        })
        .build();
    let rt = Runtime::start(echo_activities(), orchestrations).await;
    let id = rt.start_orchestration("Twice", "", None).await.unwrap();
    rt.raise_event(&id, "Other", "x").await.unwrap();
    rt.raise_event(&id, "E", "a").await.unwrap();
    rt.raise_event(&id, "E", "b").await.unwrap();
    let status = rt.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "a,b".into() });
    rt.shutdown().await;
}

#[tokio::test]
async fn raise_event_to_unknown_instance_is_not_found() {
    let rt = Runtime::start(echo_activities(), timer_chain()).await;
    let err = rt.raise_event("missing", "E", "x").await.unwrap_err();
    assert!(matches!(err, RuntimeError::NotFound(_)));
    rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_instance_id_is_rejected() {
    let rt = Runtime::start(echo_activities(), timer_chain()).await;
    rt.start_orchestration("Chain", "x", Some("dup")).await.unwrap();
    let err = rt.start_orchestration("Chain", "x", Some("dup")).await.unwrap_err();
    assert!(matches!(err, RuntimeError::AlreadyExists(_)));
    rt.shutdown().await;
}

#[tokio::test]
async fn termination_fails_open_waits_and_is_final() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Waiter", |ctx: OrchestrationContext, _input: String| async move {
            Ok(ctx.schedule_wait("Never").into_event().await)
        })
        .build();
    let rt = Runtime::start(echo_activities(), orchestrations).await;
    let id = rt.start_orchestration("Waiter", "", None).await.unwrap();
    let store_ready = async {
        while !common::has_wait(&rt.get_history(&id).await.unwrap(), "Never") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), store_ready).await.unwrap();

    rt.terminate_instance(&id, "operator request").await.unwrap();
    let status = rt.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Terminated {
            reason: "operator request".into()
        }
    );

    let h = rt.get_history(&id).await.unwrap();
    let failed = h.iter().find_map(|e| match &e.kind {
        EventKind::TaskFailed { error, .. } => Some(error.clone()),
        _ => None,
    });
    assert_eq!(failed.as_deref(), Some("TerminationRequested: operator request"));

    // late messages are accepted and discarded
    let len = h.len();
    rt.raise_event(&id, "Never", "late").await.unwrap();
    rt.terminate_instance(&id, "again").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rt.get_history(&id).await.unwrap().len(), len);
    rt.shutdown().await;
}

#[tokio::test]
async fn termination_propagates_to_children() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Parent", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_sub_orchestration("Child", "").into_sub_orchestration().await
        })
        .register("Child", |ctx: OrchestrationContext, _input: String| async move {
            Ok(ctx.schedule_wait("Never").into_event().await)
        })
        .build();
    let rt = Runtime::start(echo_activities(), orchestrations).await;
    let id = rt.start_orchestration("Parent", "", Some("p1")).await.unwrap();
    let child = durable_orchestrator::sub_orchestration_instance(&id, 0);
    let child_waiting = async {
        while !common::has_wait(&rt.get_history(&child).await.unwrap(), "Never") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), child_waiting).await.unwrap();

    rt.terminate_instance(&id, "stop").await.unwrap();
    assert_eq!(
        rt.wait_for_orchestration(&id, common::WAIT).await.unwrap(),
        OrchestrationStatus::Terminated { reason: "stop".into() }
    );
    assert_eq!(
        rt.wait_for_orchestration(&child, common::WAIT).await.unwrap(),
        OrchestrationStatus::Terminated {
            reason: "parent terminated: stop".into()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn idle_instances_dehydrate_and_wake_on_timer() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    let rt = Runtime::start_with_options(store, echo_activities(), timer_chain(), common::fast_options()).await;
    let id = rt.start_orchestration("Chain", "d", None).await.unwrap();
    let status = rt.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "d-a-b".into() });
    rt.shutdown().await;
}

#[tokio::test]
async fn panicking_workflow_fails_the_instance() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Boom", |_ctx: OrchestrationContext, _input: String| async move {
            if true {
                panic!("workflow bug");
            }
            Ok(String::new())
        })
        .build();
    let rt = Runtime::start(echo_activities(), orchestrations).await;
    let id = rt.start_orchestration("Boom", "", None).await.unwrap();
    match rt.wait_for_orchestration(&id, common::WAIT).await.unwrap() {
        OrchestrationStatus::Failed {
            error: OrchestrationError::Panicked(msg),
        } => assert!(msg.contains("workflow bug")),
        other => panic!("unexpected status {other:?}"),
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn panicking_activity_is_a_task_failure() {
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("Explode", |_input: String| async move {
                if true {
                    panic!("activity bug");
                }
                Ok(String::new())
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register("Caller", |ctx: OrchestrationContext, _input: String| async move {
            match ctx.schedule_activity("Explode", "").into_activity().await {
                Ok(_) => Ok("unexpected".to_string()),
                Err(e) => Ok(format!("handled: {e}")),
            }
        })
        .build();
    let rt = Runtime::start(activities, orchestrations).await;
    let id = rt.start_orchestration("Caller", "", None).await.unwrap();
    match rt.wait_for_orchestration(&id, common::WAIT).await.unwrap() {
        OrchestrationStatus::Completed { output } => assert!(output.starts_with("handled: activity 'Explode' panicked")),
        other => panic!("unexpected status {other:?}"),
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_orchestration_fails() {
    let rt = Runtime::start(echo_activities(), timer_chain()).await;
    let id = rt.start_orchestration("Nope", "", None).await.unwrap();
    assert_eq!(
        rt.wait_for_orchestration(&id, common::WAIT).await.unwrap(),
        OrchestrationStatus::Failed {
            error: OrchestrationError::UnknownOrchestration("Nope".into())
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn corrupt_record_reports_history_corruption() {
    let td = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(td.path(), true);
    store.create_instance("bad-1").await.unwrap();
    let mut history = Vec::new();
    append_kinds(&store, "bad-1", &mut history, vec![EventKind::OrchestratorStarted])
        .await
        .unwrap();
    let path = td.path().join("bad-1.jsonl");
    let mut data = std::fs::read_to_string(&path).unwrap();
    data.push_str("{not json\n");
    std::fs::write(&path, data).unwrap();
    assert!(matches!(store.read("bad-1").await, Err(StoreError::Corrupt { line: 2, .. })));

    let store: Arc<dyn HistoryStore> = Arc::new(store);
    let rt = Runtime::start_with_store(store, echo_activities(), timer_chain()).await;
    assert!(matches!(
        rt.get_orchestration_status("bad-1").await.unwrap(),
        OrchestrationStatus::Failed {
            error: OrchestrationError::HistoryCorruption(_)
        }
    ));
    rt.shutdown().await;
}

#[test]
fn options_read_from_environment() {
    // SAFETY: no other test in this binary reads these variables.
    unsafe {
        std::env::set_var("DURABLE_MAX_CONCURRENT_ACTIVITIES", "7");
        std::env::set_var("DURABLE_INSTANCE_IDLE_TIMEOUT_MS", "not-a-number");
    }
    let o = RuntimeOptions::from_env();
    assert_eq!(o.max_concurrent_activities, 7);
    assert_eq!(o.instance_idle_timeout_ms, RuntimeOptions::default().instance_idle_timeout_ms);
    unsafe {
        std::env::remove_var("DURABLE_MAX_CONCURRENT_ACTIVITIES");
        std::env::remove_var("DURABLE_INSTANCE_IDLE_TIMEOUT_MS");
    }
}

#[test]
fn out_of_order_event_ids_are_rejected_by_replay() {
    let mut h = history_from(vec![EventKind::OrchestratorStarted, EventKind::OrchestratorStarted]);
    h[1].event_id = 5;
    let turn = durable_orchestrator::run_turn(&h, |ctx| async move { ctx.schedule_timer(1).into_timer().await });
    assert!(matches!(turn.failure, Some(OrchestrationError::HistoryCorruption(_))));
}

#[tokio::test]
async fn full_history_fails_the_instance() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new_with_cap(8));
    let orchestrations = OrchestrationRegistry::builder()
        .register("FanOut", |ctx: OrchestrationContext, _input: String| async move {
            let calls: Vec<_> = (0..5).map(|i| ctx.schedule_activity("Echo", i.to_string())).collect();
            Ok(ctx.all(calls).await?.join(","))
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), echo_activities(), orchestrations).await;
    let id = rt.start_orchestration("FanOut", "", Some("capped-1")).await.unwrap();
    match rt.wait_for_orchestration(&id, common::WAIT).await.unwrap() {
        OrchestrationStatus::Failed {
            error: OrchestrationError::StoreFailure(msg),
        } => assert!(msg.contains("history cap exceeded"), "{msg}"),
        other => panic!("unexpected status {other:?}"),
    }
    // the terminal record fits even though the log is full
    let history = store.read(&id).await.unwrap();
    assert!(matches!(
        history.last().map(|e| &e.kind),
        Some(EventKind::OrchestratorCompleted { .. })
    ));
    rt.shutdown().await;
}

/// Rejects the first append that records a completion, as if another writer got there first.
struct ConflictOnce {
    inner: InMemoryHistoryStore,
    tripped: AtomicBool,
}

#[async_trait]
impl HistoryStore for ConflictOnce {
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        self.inner.create_instance(instance).await
    }

    async fn read(&self, instance: &str) -> Result<Vec<HistoryEvent>, StoreError> {
        self.inner.read(instance).await
    }

    async fn append(&self, instance: &str, events: Vec<HistoryEvent>) -> Result<u64, StoreError> {
        let completes = events.iter().any(|e| matches!(e.kind, EventKind::TaskCompleted { .. }));
        if completes && !self.tripped.swap(true, Ordering::SeqCst) {
            let at = events.first().map(|e| e.event_id).unwrap_or_default();
            return Err(StoreError::Conflict {
                instance: instance.to_string(),
                expected: at + 1,
                found: at,
            });
        }
        self.inner.append(instance, events).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_instances().await
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError> {
        self.inner.remove_instance(instance).await
    }

    async fn reset(&self) {
        self.inner.reset().await
    }
}

#[tokio::test]
async fn append_conflict_reactivates_and_redispatches() {
    let store: Arc<dyn HistoryStore> = Arc::new(ConflictOnce {
        inner: InMemoryHistoryStore::default(),
        tripped: AtomicBool::new(false),
    });
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let activities = ActivityRegistry::builder()
        .register("Echo", move |input: String| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Once", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("Echo", input).into_activity().await
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let id = rt.start_orchestration("Once", "x", None).await.unwrap();
    let status = rt.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "x".into() });

    let history = store.read(&id).await.unwrap();
    assert_eq!(common::activity_scheduled(&history, "Echo"), 1);
    // the completion lost with the rejected append is produced again
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    rt.shutdown().await;
}

#[tokio::test]
async fn termination_of_a_dehydrated_instance_schedules_nothing_new() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let activities = ActivityRegistry::builder()
        .register("Count", move |_input: String| {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst).to_string()) }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Steps", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Count", "1").into_activity().await?;
            ctx.schedule_activity("Count", "2").into_activity().await
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;

    // first step already recorded, second not yet scheduled, no actor running
    let id = "asleep-1";
    store.create_instance(id).await.unwrap();
    let mut history = Vec::new();
    append_kinds(
        store.as_ref(),
        id,
        &mut history,
        vec![
            EventKind::InstanceCreated {
                name: "Steps".into(),
                input: String::new(),
                parent: None,
                format_version: HISTORY_FORMAT_VERSION,
            },
            EventKind::OrchestratorStarted,
            EventKind::TaskScheduled {
                sequence_id: 0,
                task: TaskSpec::Activity {
                    name: "Count".into(),
                    input: "1".into(),
                    attempt: 1,
                },
            },
            EventKind::TaskCompleted {
                sequence_id: 0,
                result: "0".into(),
            },
        ],
    )
    .await
    .unwrap();

    rt.terminate_instance(id, "halt").await.unwrap();
    assert_eq!(
        rt.wait_for_orchestration(id, common::WAIT).await.unwrap(),
        OrchestrationStatus::Terminated { reason: "halt".into() }
    );
    let history = store.read(id).await.unwrap();
    assert_eq!(common::activity_scheduled(&history, "Count"), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn log_without_creation_record_is_failed_on_resume() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    store.create_instance("headless-1").await.unwrap();
    let mut history = Vec::new();
    append_kinds(store.as_ref(), "headless-1", &mut history, vec![EventKind::OrchestratorStarted])
        .await
        .unwrap();

    let rt = Runtime::start_with_store(store.clone(), echo_activities(), timer_chain()).await;
    match rt.wait_for_orchestration("headless-1", common::WAIT).await.unwrap() {
        OrchestrationStatus::Failed {
            error: OrchestrationError::HistoryCorruption(msg),
        } => assert!(msg.contains("not InstanceCreated"), "{msg}"),
        other => panic!("unexpected status {other:?}"),
    }
    rt.shutdown().await;
}

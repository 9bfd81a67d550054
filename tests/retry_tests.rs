use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use durable_orchestrator::runtime::{ActivityRegistry, Runtime};
use durable_orchestrator::{
    Action, BackoffStrategy, EventKind, OrchestrationContext, OrchestrationError, OrchestrationRegistry, OrchestrationStatus, RetryPolicy,
    TaskKind, TaskSpec, history_from, run_turn,
};
mod common;

#[tokio::test]
async fn always_failing_activity_is_attempted_exactly_max_attempts_times() {
    let activities = ActivityRegistry::builder()
        .register("Flaky", |_input: String| async move { Err::<String, _>("down".to_string()) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Retry", |ctx: OrchestrationContext, input: String| async move {
            let policy = RetryPolicy::with_first_interval(Duration::from_millis(10), 3);
            ctx.schedule_activity_with_retry("Flaky", input, &policy).await
        })
        .build();
    let rt = Runtime::start(Arc::new(activities), orchestrations).await;
    let id = rt.start_orchestration("Retry", "x", None).await.unwrap();

    // the workflow propagates the last activity failure with `?`
    match rt.wait_for_orchestration(&id, common::WAIT).await.unwrap() {
        OrchestrationStatus::Failed {
            error: OrchestrationError::Application(msg),
        } => assert_eq!(msg, "down"),
        other => panic!("unexpected status {other:?}"),
    }

    let h = rt.get_history(&id).await.unwrap();
    let attempts = common::scheduled(&h, TaskKind::Activity);
    assert_eq!(attempts.len(), 3);
    let attempt_numbers: Vec<u32> = attempts
        .iter()
        .map(|(_, t)| match t {
            TaskSpec::Activity { attempt, .. } => *attempt,
            _ => 0,
        })
        .collect();
    assert_eq!(attempt_numbers, vec![1, 2, 3]);
    let failed = common::failed_seqs(&h);
    assert_eq!(failed, attempts.iter().map(|(s, _)| *s).collect::<Vec<_>>());
    // a durable timer between consecutive attempts
    assert_eq!(common::scheduled(&h, TaskKind::Timer).len(), 2);
    rt.shutdown().await;
}

#[tokio::test]
async fn retry_succeeds_once_the_activity_recovers() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let activities = ActivityRegistry::builder()
        .register("Flaky", move |input: String| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(format!("ok:{input}"))
                }
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Retry", |ctx: OrchestrationContext, input: String| async move {
            let policy = RetryPolicy::with_first_interval(Duration::from_millis(5), 5);
            ctx.schedule_activity_with_retry("Flaky", input, &policy).await
        })
        .build();
    let rt = Runtime::start(Arc::new(activities), orchestrations).await;
    let id = rt.start_orchestration("Retry", "v", None).await.unwrap();
    let status = rt.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "ok:v".into() });
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    rt.shutdown().await;
}

#[tokio::test]
async fn attempt_timeout_counts_as_failure() {
    let activities = ActivityRegistry::builder()
        .register("Hang", |_input: String| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(String::new())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Retry", |ctx: OrchestrationContext, _input: String| async move {
            let policy = RetryPolicy::with_first_interval(Duration::from_millis(5), 2).with_timeout(Duration::from_millis(50));
            ctx.schedule_activity_with_retry("Hang", "", &policy).await
        })
        .build();
    let rt = Runtime::start(Arc::new(activities), orchestrations).await;
    let id = rt.start_orchestration("Retry", "", None).await.unwrap();
    match rt.wait_for_orchestration(&id, common::WAIT).await.unwrap() {
        OrchestrationStatus::Failed {
            error: OrchestrationError::Application(msg),
        } => assert!(msg.contains("timed out"), "{msg}"),
        other => panic!("unexpected status {other:?}"),
    }
    rt.shutdown().await;
}

#[test]
fn attempt_counter_comes_from_history() {
    let h = history_from(vec![
        EventKind::TaskScheduled {
            sequence_id: 0,
            task: TaskSpec::Activity {
                name: "Flaky".into(),
                input: "i".into(),
                attempt: 1,
            },
        },
        EventKind::TaskFailed {
            sequence_id: 0,
            error: "down".into(),
        },
        EventKind::TaskScheduled {
            sequence_id: 1,
            task: TaskSpec::Timer { fire_at_ms: 1 },
        },
        EventKind::TaskCompleted {
            sequence_id: 1,
            result: String::new(),
        },
    ]);
    let turn = run_turn(&h, |ctx| async move {
        let policy = RetryPolicy::with_first_interval(Duration::from_secs(1), 3);
        ctx.schedule_activity_with_retry("Flaky", "i", &policy).await
    });
    assert_eq!(
        turn.actions,
        vec![Action::CallActivity {
            sequence_id: 2,
            name: "Flaky".into(),
            input: "i".into(),
            attempt: 2,
        }]
    );
}

#[tokio::test]
async fn typed_retry_decodes_the_successful_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let activities = ActivityRegistry::builder()
        .register_typed::<(u32, u32), u32, _, _>("Add", move |(a, b)| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("busy".to_string())
                } else {
                    Ok(a + b)
                }
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register_typed::<(u32, u32), u32, _, _>("AddWithRetry", |ctx, pair| async move {
            let policy = RetryPolicy::new(2).with_backoff(BackoffStrategy::None);
            ctx.schedule_activity_with_retry_typed("Add", &pair, &policy).await
        })
        .build();
    let rt = Runtime::start(Arc::new(activities), orchestrations).await;
    let id = rt.start_orchestration_typed("AddWithRetry", &(2u32, 3u32), None).await.unwrap();
    let out = rt.wait_for_orchestration_typed::<u32>(&id, common::WAIT).await.unwrap();
    assert_eq!(out, Ok(5));
    // no backoff: attempts follow each other without a timer
    let h = rt.get_history(&id).await.unwrap();
    assert!(common::scheduled(&h, TaskKind::Timer).is_empty());
    rt.shutdown().await;
}

#[tokio::test]
async fn sub_orchestration_retry_starts_a_fresh_child_per_attempt() {
    let runs = Arc::new(AtomicU32::new(0));
    let r = runs.clone();
    let activities = ActivityRegistry::builder()
        .register("Count", move |_input: String| {
            let r = r.clone();
            async move { Ok(r.fetch_add(1, Ordering::SeqCst).to_string()) }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Child", |ctx: OrchestrationContext, _input: String| async move {
            let n = ctx.schedule_activity("Count", "").into_activity().await?;
            if n == "0" { Err("first run fails".to_string()) } else { Ok(format!("run {n}")) }
        })
        .register("Parent", |ctx: OrchestrationContext, _input: String| async move {
            let policy = RetryPolicy::with_first_interval(Duration::from_millis(5), 3);
            ctx.schedule_sub_orchestration_with_retry("Child", "", &policy).await
        })
        .build();
    let rt = Runtime::start(Arc::new(activities), orchestrations).await;
    let id = rt.start_orchestration("Parent", "", Some("retry-parent")).await.unwrap();
    let status = rt.wait_for_orchestration(&id, common::WAIT).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "run 1".into() });

    let h = rt.get_history(&id).await.unwrap();
    let children: Vec<String> = common::scheduled(&h, TaskKind::SubOrchestration)
        .into_iter()
        .filter_map(|(_, t)| match t {
            TaskSpec::SubOrchestration { instance, .. } => Some(instance),
            _ => None,
        })
        .collect();
    assert_eq!(children, vec!["retry-parent::sub::0", "retry-parent::sub::2"]);
    match rt.get_orchestration_status(&children[0]).await.unwrap() {
        OrchestrationStatus::Failed {
            error: OrchestrationError::Application(msg),
        } => assert_eq!(msg, "first run fails"),
        other => panic!("unexpected child status {other:?}"),
    }
    rt.shutdown().await;
}

//! Deterministic-replay durable orchestration engine.
//!
//! Workflow code is an ordinary `async` function over an
//! [`OrchestrationContext`]. Every step it takes (activities, timers,
//! external events, sub-orchestrations) is recorded in an append-only
//! per-instance history. On each pass the function is restarted from the top
//! and polled once: tasks whose completions are already in history resolve
//! immediately, the first unresolved one suspends the pass, and any task the
//! history has never seen becomes an [`Action`] for the host to execute.
//!
//! - Data model: [`HistoryEvent`], [`EventKind`], [`TaskSpec`], [`Action`]
//! - Step function: [`run_turn`] / [`run_turn_with`] and [`Executor`]
//! - Composition: [`OrchestrationContext::select`] (Any) and
//!   [`OrchestrationContext::join`] / [`OrchestrationContext::all`] (All)
//! - Hosting: [`runtime::Runtime`] over a [`providers::HistoryStore`]
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod correlation;
pub mod errors;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use correlation::{Resolution, Task, TaskState, TaskTable};
pub use errors::{OrchestrationError, RuntimeError, StoreError, WaitError};
pub use futures::{AllFuture, DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runtime::{OrchestrationHandler, OrchestrationRegistry, OrchestrationStatus};

// Internal system activity names
pub(crate) const SYSTEM_NOW_ACTIVITY: &str = "__system_now";
pub(crate) const SYSTEM_NEW_GUID_ACTIVITY: &str = "__system_new_guid";

/// Version stamped into every `InstanceCreated` record.
pub const HISTORY_FORMAT_VERSION: u32 = 1;

pub(crate) mod codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    /// JSON-encode a payload; bare strings are stored unquoted.
    pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        match serde_json::to_value(v) {
            Ok(Value::String(s)) => Ok(s),
            Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(s) {
            Ok(v) => Ok(v),
            // unquoted string payloads
            Err(_) => serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string()),
        }
    }
}

/// One record of an instance's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEvent {
    /// 1-based position in the log; the key `append` conflict-checks.
    pub event_id: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl HistoryEvent {
    pub fn new(event_id: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            timestamp_ms: now_ms(),
            kind,
        }
    }
}

/// Back-reference from a sub-orchestration to the parent task awaiting it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParentLink {
    pub instance: String,
    pub sequence_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EventKind {
    /// Instance registered by a client or parent; status Pending.
    InstanceCreated {
        name: String,
        input: String,
        parent: Option<ParentLink>,
        format_version: u32,
    },
    /// First executor pass began; status Running.
    OrchestratorStarted,
    /// The workflow requested a task. `sequence_id` correlates it with its completion.
    TaskScheduled { sequence_id: u64, task: TaskSpec },
    TaskCompleted { sequence_id: u64, result: String },
    TaskFailed { sequence_id: u64, error: String },
    /// An external event arrived; consumed FIFO per name by event waits.
    EventRaised { name: String, payload: String },
    /// Terminal record. Nothing is appended after it.
    OrchestratorCompleted { outcome: Outcome },
}

/// What a scheduled task asks the host to do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum TaskSpec {
    Activity { name: String, input: String, attempt: u32 },
    Timer { fire_at_ms: u64 },
    SubOrchestration { name: String, instance: String, input: String },
    EventWait { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Activity,
    Timer,
    SubOrchestration,
    EventWait,
}

impl TaskSpec {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskSpec::Activity { .. } => TaskKind::Activity,
            TaskSpec::Timer { .. } => TaskKind::Timer,
            TaskSpec::SubOrchestration { .. } => TaskKind::SubOrchestration,
            TaskSpec::EventWait { .. } => TaskKind::EventWait,
        }
    }

    /// Activity, sub-orchestration or event name; `None` for timers.
    pub fn name(&self) -> Option<&str> {
        match self {
            TaskSpec::Activity { name, .. }
            | TaskSpec::SubOrchestration { name, .. }
            | TaskSpec::EventWait { name } => Some(name),
            TaskSpec::Timer { .. } => None,
        }
    }

    fn describe(&self) -> String {
        describe(self.kind(), self.name())
    }
}

fn describe(kind: TaskKind, name: Option<&str>) -> String {
    match (kind, name) {
        (TaskKind::Activity, Some(n)) => format!("activity '{n}'"),
        (TaskKind::SubOrchestration, Some(n)) => format!("sub-orchestration '{n}'"),
        (TaskKind::EventWait, Some(n)) => format!("event wait '{n}'"),
        (kind, _) => format!("{kind:?}").to_lowercase(),
    }
}

/// Terminal outcome of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status")]
pub enum Outcome {
    Completed { output: String },
    Failed { error: OrchestrationError },
    Terminated { reason: String },
}

/// New work requested by one pass. The host materializes each into a
/// `TaskScheduled` record before executing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        sequence_id: u64,
        name: String,
        input: String,
        attempt: u32,
    },
    CreateTimer { sequence_id: u64, delay_ms: u64 },
    StartSubOrchestration {
        sequence_id: u64,
        name: String,
        instance: String,
        input: String,
    },
    WaitExternal { sequence_id: u64, name: String },
}

impl Action {
    pub fn sequence_id(&self) -> u64 {
        match self {
            Action::CallActivity { sequence_id, .. }
            | Action::CreateTimer { sequence_id, .. }
            | Action::StartSubOrchestration { sequence_id, .. }
            | Action::WaitExternal { sequence_id, .. } => *sequence_id,
        }
    }

    /// Persisted form of this action; timers are pinned to an absolute fire time.
    pub fn to_task_spec(&self, now_ms: u64) -> TaskSpec {
        match self {
            Action::CallActivity { name, input, attempt, .. } => TaskSpec::Activity {
                name: name.clone(),
                input: input.clone(),
                attempt: *attempt,
            },
            Action::CreateTimer { delay_ms, .. } => TaskSpec::Timer {
                fire_at_ms: now_ms.saturating_add(*delay_ms),
            },
            Action::StartSubOrchestration { name, instance, input, .. } => TaskSpec::SubOrchestration {
                name: name.clone(),
                instance: instance.clone(),
                input: input.clone(),
            },
            Action::WaitExternal { name, .. } => TaskSpec::EventWait { name: name.clone() },
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `event_id` the next appended record must carry.
pub fn next_event_id(history: &[HistoryEvent]) -> u64 {
    history.last().map(|e| e.event_id + 1).unwrap_or(1)
}

/// Append `kind` at the end of an in-memory history and return its `event_id`.
pub fn push_event(history: &mut Vec<HistoryEvent>, kind: EventKind) -> u64 {
    let id = next_event_id(history);
    history.push(HistoryEvent::new(id, kind));
    id
}

/// Build a history with consecutive event ids. Handy for driving `run_turn` by hand.
pub fn history_from(kinds: impl IntoIterator<Item = EventKind>) -> Vec<HistoryEvent> {
    let mut history = Vec::new();
    for kind in kinds {
        push_event(&mut history, kind);
    }
    history
}

/// Append a `TaskScheduled` record for each action, in order.
pub fn append_scheduled(history: &mut Vec<HistoryEvent>, actions: &[Action], now_ms: u64) {
    for a in actions {
        push_event(
            history,
            EventKind::TaskScheduled {
                sequence_id: a.sequence_id(),
                task: a.to_task_spec(now_ms),
            },
        );
    }
}

/// A task the workflow asked for during the current pass.
enum TaskRequest {
    Activity { name: String, input: String, attempt: u32 },
    Timer { delay_ms: u64 },
    SubOrchestration { name: String, input: String },
    EventWait { name: String },
}

impl TaskRequest {
    fn kind(&self) -> TaskKind {
        match self {
            TaskRequest::Activity { .. } => TaskKind::Activity,
            TaskRequest::Timer { .. } => TaskKind::Timer,
            TaskRequest::SubOrchestration { .. } => TaskKind::SubOrchestration,
            TaskRequest::EventWait { .. } => TaskKind::EventWait,
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            TaskRequest::Activity { name, .. }
            | TaskRequest::SubOrchestration { name, .. }
            | TaskRequest::EventWait { name } => Some(name),
            TaskRequest::Timer { .. } => None,
        }
    }

    /// Kind and name must match the recorded task; inputs may differ.
    fn mismatch(&self, sequence_id: u64, recorded: &TaskSpec) -> Option<String> {
        if self.kind() == recorded.kind() && self.name() == recorded.name() {
            return None;
        }
        Some(format!(
            "schedule order mismatch at sequence_id {sequence_id}: code requested {}, history recorded {}",
            describe(self.kind(), self.name()),
            recorded.describe()
        ))
    }

    fn into_action(self, sequence_id: u64, instance: &str) -> Action {
        match self {
            TaskRequest::Activity { name, input, attempt } => Action::CallActivity {
                sequence_id,
                name,
                input,
                attempt,
            },
            TaskRequest::Timer { delay_ms } => Action::CreateTimer { sequence_id, delay_ms },
            TaskRequest::SubOrchestration { name, input } => Action::StartSubOrchestration {
                sequence_id,
                name,
                instance: sub_orchestration_instance(instance, sequence_id),
                input,
            },
            TaskRequest::EventWait { name } => Action::WaitExternal { sequence_id, name },
        }
    }
}

/// Deterministic child instance id of a sub-orchestration.
pub fn sub_orchestration_instance(parent: &str, sequence_id: u64) -> String {
    format!("{parent}::sub::{sequence_id}")
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    instance: String,
    pub(crate) table: TaskTable,
    next_sequence_id: u64,
    actions: Vec<Action>,
    pub(crate) failure: Option<OrchestrationError>,
    pub(crate) superseded: BTreeSet<u64>,
    pub(crate) cancelled_timers: BTreeSet<u64>,
    turn_index: u64,
}

impl CtxInner {
    fn new(instance: String, history: &[HistoryEvent]) -> Self {
        let (table, failure) = match TaskTable::from_history(history) {
            Ok(t) => (t, None),
            Err(e) => (TaskTable::default(), Some(e)),
        };
        Self {
            instance,
            table,
            next_sequence_id: 0,
            actions: Vec::new(),
            failure,
            superseded: BTreeSet::new(),
            cancelled_timers: BTreeSet::new(),
            turn_index: 0,
        }
    }

    fn claim(&mut self, request: TaskRequest) -> u64 {
        let sequence_id = self.next_sequence_id;
        self.next_sequence_id += 1;
        if self.failure.is_some() {
            return sequence_id;
        }
        match self.table.spec(sequence_id) {
            Some(recorded) => {
                if let Some(msg) = request.mismatch(sequence_id, recorded) {
                    self.failure = Some(OrchestrationError::NonDeterminism(msg));
                }
            }
            None => {
                let action = request.into_action(sequence_id, &self.instance);
                self.actions.push(action);
            }
        }
        sequence_id
    }
}

/// Handle the workflow uses to request tasks. Cheap to clone.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a context that replays `history` for `instance`.
    pub fn new(instance: impl Into<String>, history: &[HistoryEvent]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history))),
        }
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance_id(&self) -> String {
        self.inner().instance.clone()
    }

    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.inner().turn_index
    }

    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.inner().turn_index = idx;
    }

    /// True while the code is re-walking tasks that history already records.
    pub fn is_replaying(&self) -> bool {
        let inner = self.inner();
        inner.next_sequence_id < inner.table.len() as u64
    }

    fn request(&self, request: TaskRequest) -> DurableFuture {
        let kind = request.kind();
        let sequence_id = self.inner().claim(request);
        DurableFuture {
            sequence_id,
            kind,
            ctx: self.clone(),
        }
    }

    fn encode_or_fail<T: Serialize>(&self, what: &str, value: &T) -> String {
        match codec::encode(value) {
            Ok(s) => s,
            Err(e) => {
                let mut inner = self.inner();
                if inner.failure.is_none() {
                    inner.failure = Some(OrchestrationError::Application(format!(
                        "failed to encode input for {what}: {e}"
                    )));
                }
                String::new()
            }
        }
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_activity_attempt(name, input, 1)
    }

    pub(crate) fn schedule_activity_attempt(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        attempt: u32,
    ) -> DurableFuture {
        self.request(TaskRequest::Activity {
            name: name.into(),
            input: input.into(),
            attempt,
        })
    }

    /// Serialize `input` with serde; pair with `into_activity_typed`.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        let name: String = name.into();
        let payload = self.encode_or_fail(&name, input);
        self.schedule_activity(name, payload)
    }

    /// Schedule a durable timer that fires after `delay_ms`.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        self.request(TaskRequest::Timer { delay_ms })
    }

    /// Wait for the next external event raised under `name`.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        self.request(TaskRequest::EventWait { name: name.into() })
    }

    /// Start a child orchestration; its id is derived from this instance and the sequence id.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.request(TaskRequest::SubOrchestration {
            name: name.into(),
            input: input.into(),
        })
    }

    pub fn schedule_sub_orchestration_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> DurableFuture {
        let name: String = name.into();
        let payload = self.encode_or_fail(&name, input);
        self.schedule_sub_orchestration(name, payload)
    }

    /// Current wall-clock time, recorded once and replayed thereafter.
    pub async fn utc_now_ms(&self) -> Result<u64, String> {
        let v = self.schedule_activity(SYSTEM_NOW_ACTIVITY, "").into_activity().await?;
        v.parse::<u64>().map_err(|e| format!("invalid timestamp '{v}': {e}"))
    }

    /// A random GUID, recorded once and replayed thereafter.
    pub async fn new_guid(&self) -> Result<String, String> {
        self.schedule_activity(SYSTEM_NEW_GUID_ACTIVITY, "").into_activity().await
    }

    /// Any over two futures: returns `(winner_index, output)`.
    #[doc(alias = "any")]
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        self.select(vec![a, b])
    }

    /// Any over N futures. The winner is the child whose completion history
    /// recorded first; the rest are superseded and their results ignored.
    #[doc(alias = "any")]
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture(futures::AggregateDurableFuture::new_select(self.clone(), futures))
    }

    /// All over N futures. Waits for every child; outputs keep input order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture(futures::AggregateDurableFuture::new_join(self.clone(), futures))
    }

    /// Like `join`, but yields the first failure (in input order) once all children are terminal.
    pub fn all(&self, futures: Vec<DurableFuture>) -> AllFuture {
        AllFuture(self.join(futures))
    }
}

impl DurableFuture {
    /// Await an activity result as a raw string.
    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(r) => r,
            other => Err(format!("into_activity used on non-activity task: {other:?}")),
        }
    }

    /// Await an activity result decoded to a typed value.
    pub async fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        let s = self.into_activity().await?;
        codec::decode::<Out>(&s)
    }

    pub async fn into_timer(self) {
        let _ = self.await;
    }

    /// Await the payload of the external event matched to this wait.
    pub async fn into_event(self) -> String {
        match self.await {
            DurableOutput::External(payload) => payload,
            other => other.into_result().unwrap_or_else(|e| e),
        }
    }

    pub async fn into_event_typed<T: serde::de::DeserializeOwned>(self) -> Result<T, String> {
        codec::decode::<T>(&self.into_event().await)
    }

    /// Await a sub-orchestration's output or failure as a raw string.
    pub async fn into_sub_orchestration(self) -> Result<String, String> {
        match self.await {
            DurableOutput::SubOrchestration(r) => r,
            other => Err(format!("into_sub_orchestration used on non-sub-orchestration task: {other:?}")),
        }
    }

    pub async fn into_sub_orchestration_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        let s = self.into_sub_orchestration().await?;
        codec::decode::<Out>(&s)
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    // SAFETY: every vtable entry ignores the data pointer.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: F) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    let mut fut = std::pin::pin!(fut);
    fut.as_mut().poll(&mut cx)
}

/// Outcome of one executor pass.
#[derive(Debug)]
pub struct TurnResult<O> {
    /// Tasks requested for the first time, in sequence id order.
    pub actions: Vec<Action>,
    /// Final workflow value when the function returned during this pass.
    pub output: Option<O>,
    /// Tasks that lost an Any race; their completions are ignored.
    pub superseded: BTreeSet<u64>,
    /// Unresolved losing timers the host may cancel.
    pub cancelled_timers: Vec<u64>,
    /// Fatal replay error; when set, `actions` and `output` must not be used.
    pub failure: Option<OrchestrationError>,
}

impl<O> TurnResult<O> {
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Replay `history` once against `orchestrator`.
pub fn run_turn<O, F>(history: &[HistoryEvent], orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with("local", history, 0, orchestrator)
}

/// Same as `run_turn` for a named instance with a caller-supplied turn index.
pub fn run_turn_with<O, F>(
    instance: &str,
    history: &[HistoryEvent],
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(instance, history);
    ctx.set_turn_index(turn_index);
    let poll = if ctx.inner().failure.is_some() {
        Poll::Pending
    } else {
        poll_once(orchestrator(ctx.clone()))
    };

    let mut inner = ctx.inner();
    let requested = inner.next_sequence_id;
    if inner.failure.is_none() && (inner.table.len() as u64) > requested {
        let first = inner
            .table
            .spec(requested)
            .map(TaskSpec::describe)
            .unwrap_or_default();
        inner.failure = Some(OrchestrationError::NonDeterminism(format!(
            "history recorded {} task(s) the code no longer requests, starting with {first} at sequence_id {requested}",
            inner.table.len() as u64 - requested
        )));
    }
    TurnResult {
        actions: std::mem::take(&mut inner.actions),
        output: match poll {
            Poll::Ready(out) => Some(out),
            Poll::Pending => None,
        },
        superseded: std::mem::take(&mut inner.superseded),
        cancelled_timers: std::mem::take(&mut inner.cancelled_timers).into_iter().collect(),
        failure: inner.failure.take(),
    }
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Alternates replay passes with `execute_actions` until the workflow
    /// returns. Each pass's actions are recorded as `TaskScheduled` before
    /// `execute_actions` runs, so it only has to append completions.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<HistoryEvent>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> Result<(Vec<HistoryEvent>, O), OrchestrationError>
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<HistoryEvent>),
    {
        loop {
            let turn = run_turn(&history, &orchestrator);
            if let Some(err) = turn.failure {
                return Err(err);
            }
            append_scheduled(&mut history, &turn.actions, now_ms());
            if let Some(out) = turn.output {
                return Ok((history, out));
            }
            let before = history.len();
            let had_actions = !turn.actions.is_empty();
            execute_actions(turn.actions, &mut history);
            if !had_actions && history.len() == before {
                return Err(OrchestrationError::Application(
                    "orchestration is waiting but the host appended nothing".into(),
                ));
            }
        }
    }
}

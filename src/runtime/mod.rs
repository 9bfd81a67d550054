//! Instance Manager and Dispatcher.
//!
//! Each active instance is owned by one actor task, the only writer of its
//! history. The actor replays the workflow, records newly requested tasks,
//! hands them to the activity pool, the timer service or a child instance,
//! then waits for completions on its inbox. Idle actors dehydrate and are
//! re-activated by the next message addressed to them.
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::{OrchestrationError, RuntimeError, StoreError};
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, append_kinds};
use crate::{Action, EventKind, HistoryEvent, OrchestrationContext, Outcome, ParentLink, TaskKind, TaskSpec, codec};

pub mod completions;
pub mod dispatch;
pub mod mailbox;
pub mod registry;
pub mod replay;
pub mod router;
pub mod status;
mod timers;

pub use registry::{ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use router::{InstanceRouter, OrchestratorMsg};
pub use status::{ManagementUris, OrchestrationStatus};

use completions::CompletionBatch;
use replay::{DefaultReplayEngine, ReplayEngine};
use timers::{TimerCommand, TimerService};

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Tunables for a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Upper bound on activities executing at once.
    pub max_concurrent_activities: usize,
    /// An actor with an empty inbox for this long dehydrates.
    pub instance_idle_timeout_ms: u64,
    /// Completions folded into one append.
    pub completion_batch_limit: usize,
    /// Cap on the backoff between status polls in `wait_for_orchestration`.
    pub status_poll_max_ms: u64,
    /// Root of the URIs returned by `management_uris`.
    pub management_base_url: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_concurrent_activities: 64,
            instance_idle_timeout_ms: 1000,
            completion_batch_limit: 128,
            status_poll_max_ms: 100,
            management_base_url: "http://localhost:7071/runtime/webhooks/durabletask".to_string(),
        }
    }
}

impl RuntimeOptions {
    /// Defaults overridden by `DURABLE_*` environment variables. Unparseable
    /// values are logged and ignored.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(v) = env_parse("DURABLE_MAX_CONCURRENT_ACTIVITIES") {
            opts.max_concurrent_activities = v;
        }
        if let Some(v) = env_parse("DURABLE_INSTANCE_IDLE_TIMEOUT_MS") {
            opts.instance_idle_timeout_ms = v;
        }
        if let Some(v) = env_parse("DURABLE_COMPLETION_BATCH_LIMIT") {
            opts.completion_batch_limit = v;
        }
        if let Ok(v) = std::env::var("DURABLE_MANAGEMENT_BASE_URL") {
            opts.management_base_url = v;
        }
        opts
    }

    pub fn with_max_concurrent_activities(mut self, n: usize) -> Self {
        self.max_concurrent_activities = n;
        self
    }

    pub fn with_instance_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.instance_idle_timeout_ms = ms;
        self
    }

    pub fn with_completion_batch_limit(mut self, n: usize) -> Self {
        self.completion_batch_limit = n;
        self
    }

    pub fn with_management_base_url(mut self, url: impl Into<String>) -> Self {
        self.management_base_url = url.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// What a replay loop ended with.
enum Step {
    /// Suspended on unresolved tasks; wait for messages.
    Wait,
    Finish(Outcome),
}

/// Per-activation state of an actor.
struct InstanceState {
    name: String,
    input: String,
    parent: Option<ParentLink>,
    handler: Arc<dyn OrchestrationHandler>,
    history: Vec<HistoryEvent>,
    turn_index: u64,
    superseded: BTreeSet<u64>,
    /// A message pulled from the inbox that starts the next batch.
    deferred: Option<OrchestratorMsg>,
    redispatch: bool,
}

/// In-process runtime that executes activities and timers and persists
/// history via a `HistoryStore`.
pub struct Runtime {
    store: Arc<dyn HistoryStore>,
    orchestrations: OrchestrationRegistry,
    router: Arc<InstanceRouter>,
    completion_tx: mpsc::UnboundedSender<OrchestratorMsg>,
    activity_tx: mpsc::UnboundedSender<dispatch::ActivityWorkItem>,
    timer_tx: mpsc::UnboundedSender<TimerCommand>,
    options: RuntimeOptions,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    /// Instances with a live actor. Held while activating or dehydrating so
    /// no message falls between an actor leaving and the next one starting.
    active_instances: Mutex<HashSet<String>>,
    /// Tasks handed out in this process and not yet recorded as resolved.
    dispatched: Mutex<HashSet<(String, u64)>>,
    engine: Arc<dyn ReplayEngine>,
}

impl Runtime {
    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activity_registry, orchestration_registry, RuntimeOptions::default()).await
    }

    /// Start a runtime and resume every unfinished instance found in `store`.
    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        crate::logging::init_tracing();

        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<OrchestratorMsg>();
        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        let (timer_join, timer_tx) = TimerService::start(completion_tx.clone());
        let worker_join = dispatch::start_activity_workers(
            activity_rx,
            activity_registry,
            completion_tx.clone(),
            options.max_concurrent_activities,
        );

        let runtime = Arc::new(Self {
            store,
            orchestrations: orchestration_registry,
            router: Arc::new(InstanceRouter::default()),
            completion_tx,
            activity_tx,
            timer_tx,
            options,
            joins: Mutex::new(vec![timer_join, worker_join]),
            instance_joins: Mutex::new(Vec::new()),
            active_instances: Mutex::new(HashSet::new()),
            dispatched: Mutex::new(HashSet::new()),
            engine: Arc::new(DefaultReplayEngine::new()),
        });

        // completion pump: workers, timers and children report here
        let rt = runtime.clone();
        let pump = tokio::spawn(async move {
            while let Some(msg) = completion_rx.recv().await {
                rt.deliver(msg).await;
            }
        });
        runtime.joins.lock().await.push(pump);

        runtime.resume().await;
        runtime
    }

    /// Activate every non-terminal instance in the store.
    async fn resume(self: &Arc<Self>) {
        let instances = match self.store.list_instances().await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "resume: failed to list instances");
                return;
            }
        };
        for instance in instances {
            match self.store.read(&instance).await {
                Ok(history) if history.is_empty() => {}
                Ok(history) if status::terminal_outcome(&history).is_some() => {}
                Ok(_) => {
                    info!(instance = %instance, "resuming instance");
                    self.activate(&instance).await;
                }
                Err(e) => error!(instance = %instance, error = %e, "resume: unreadable history"),
            }
        }
    }

    /// Route `msg` to its instance, activating the instance if needed.
    pub(crate) async fn deliver(self: &Arc<Self>, msg: OrchestratorMsg) {
        let mut active = self.active_instances.lock().await;
        let msg = match self.router.forward(msg).await {
            Ok(()) => return,
            Err(msg) => msg,
        };
        let instance = msg.instance().to_string();
        let rx = self.router.register(&instance).await;
        if let Err(msg) = self.router.forward(msg).await {
            error!(instance = %instance, ?msg, "deliver: freshly registered inbox rejected message");
        }
        active.insert(instance.clone());
        drop(active);
        self.spawn_actor(instance, rx).await;
    }

    /// Ensure `instance` has a running actor.
    pub(crate) async fn activate(self: &Arc<Self>, instance: &str) {
        let mut active = self.active_instances.lock().await;
        if active.contains(instance) && self.router.is_registered(instance).await {
            return;
        }
        let rx = self.router.register(instance).await;
        active.insert(instance.to_string());
        drop(active);
        self.spawn_actor(instance.to_string(), rx).await;
    }

    async fn spawn_actor(self: &Arc<Self>, instance: String, rx: mpsc::UnboundedReceiver<OrchestratorMsg>) {
        let handle = tokio::spawn(self.clone().run_instance(instance, rx));
        let mut joins = self.instance_joins.lock().await;
        joins.retain(|j| !j.is_finished());
        joins.push(handle);
    }

    /// Actor body. Boxed so the actor future's type does not depend on itself
    /// through sub-orchestration activation.
    fn run_instance(
        self: Arc<Self>,
        instance: String,
        mut rx: mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let err = match self.drive_instance(&instance, &mut rx).await {
                Ok(()) => return,
                Err(e) => e,
            };
            match err {
                StoreError::Conflict { .. } => {
                    let leftover = self.deactivate(&instance, &mut rx).await;
                    warn!(instance = %instance, error = %err, pending = leftover.len(), "actor stopped on append conflict");
                    // Completions folded into the rejected batch are gone; the
                    // next actor re-reads the log and re-dispatches what is open.
                    self.dispatched.lock().await.retain(|(inst, _)| inst != &instance);
                    for msg in leftover {
                        let _ = self.completion_tx.send(msg);
                    }
                    self.activate(&instance).await;
                }
                _ => {
                    error!(instance = %instance, error = %err, "actor stopped on store error");
                    self.fail_on_store_error(&instance, &err).await;
                    self.retire(&instance, &mut rx).await;
                }
            }
        })
    }

    /// Record a terminal `StoreFailure` so the instance does not stay Running.
    async fn fail_on_store_error(&self, instance: &str, err: &StoreError) {
        let mut history = match self.store.read(instance).await {
            Ok(h) => h,
            Err(e) => {
                error!(instance, error = %e, "cannot re-read history to record store failure");
                return;
            }
        };
        if history.is_empty() || status::terminal_outcome(&history).is_some() {
            return;
        }
        let parent = parent_of(&history);
        let outcome = Outcome::Failed {
            error: OrchestrationError::StoreFailure(err.to_string()),
        };
        if let Err(e) = self.finish(instance, &mut history, parent, outcome, Vec::new()).await {
            error!(instance, error = %e, "failed to record store failure; instance left unfinished");
        }
    }

    /// Unregister the actor's inbox and hand back anything still queued in it.
    async fn deactivate(&self, instance: &str, rx: &mut mpsc::UnboundedReceiver<OrchestratorMsg>) -> Vec<OrchestratorMsg> {
        let mut active = self.active_instances.lock().await;
        self.router.unregister(instance).await;
        active.remove(instance);
        drop(active);
        let mut leftover = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            leftover.push(msg);
        }
        leftover
    }

    /// Deactivate a finished instance, discarding late messages.
    async fn retire(&self, instance: &str, rx: &mut mpsc::UnboundedReceiver<OrchestratorMsg>) {
        for msg in self.deactivate(instance, rx).await {
            warn!(instance, ?msg, "message for terminal instance discarded");
        }
        self.dispatched.lock().await.retain(|(inst, _)| inst != instance);
    }

    /// Idle path: leave unless a message slipped in.
    async fn try_dehydrate(
        &self,
        instance: &str,
        rx: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) -> Option<OrchestratorMsg> {
        let mut active = self.active_instances.lock().await;
        if let Ok(msg) = rx.try_recv() {
            return Some(msg);
        }
        self.router.unregister(instance).await;
        active.remove(instance);
        debug!(instance, "dehydrated idle instance");
        None
    }

    async fn drive_instance(
        self: &Arc<Self>,
        instance: &str,
        rx: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) -> Result<(), StoreError> {
        let mut history = self.store.read(instance).await?;
        if history.is_empty() {
            warn!(instance, "activation for unknown instance");
            self.retire(instance, rx).await;
            return Ok(());
        }
        if status::terminal_outcome(&history).is_some() {
            self.retire(instance, rx).await;
            return Ok(());
        }
        let (name, input, parent) = match &history[0].kind {
            EventKind::InstanceCreated { name, input, parent, .. } => (name.clone(), input.clone(), parent.clone()),
            other => {
                let err = OrchestrationError::HistoryCorruption(format!("first record is {other:?}, not InstanceCreated"));
                let parent = parent_of(&history);
                self.finish(instance, &mut history, parent, Outcome::Failed { error: err }, Vec::new())
                    .await?;
                self.retire(instance, rx).await;
                return Ok(());
            }
        };
        let Some(handler) = self.orchestrations.get(&name) else {
            error!(instance, name = %name, "orchestration is not registered");
            let err = OrchestrationError::UnknownOrchestration(name);
            self.finish(instance, &mut history, parent, Outcome::Failed { error: err }, Vec::new())
                .await?;
            self.retire(instance, rx).await;
            return Ok(());
        };
        if !history.iter().any(|e| matches!(e.kind, EventKind::OrchestratorStarted)) {
            append_kinds(self.store.as_ref(), instance, &mut history, vec![EventKind::OrchestratorStarted]).await?;
            info!(instance, name = %name, "orchestration started");
        }

        let mut st = InstanceState {
            name,
            input,
            parent,
            handler,
            history,
            turn_index: 0,
            superseded: BTreeSet::new(),
            deferred: None,
            redispatch: true,
        };

        // A termination that woke this instance wins over any pending replay work.
        if let Ok(msg) = rx.try_recv() {
            match msg {
                OrchestratorMsg::Terminate { reason, .. } => {
                    self.terminate_now(instance, &mut st, reason).await?;
                    self.retire(instance, rx).await;
                    return Ok(());
                }
                other => st.deferred = Some(other),
            }
        }

        loop {
            if let Step::Finish(outcome) = self.run_turns(instance, &mut st).await? {
                let parent = st.parent.clone();
                self.finish(instance, &mut st.history, parent, outcome, Vec::new()).await?;
                self.retire(instance, rx).await;
                return Ok(());
            }

            let first = match st.deferred.take() {
                Some(msg) => msg,
                None => {
                    let idle = Duration::from_millis(self.options.instance_idle_timeout_ms);
                    match tokio::time::timeout(idle, rx.recv()).await {
                        Ok(Some(msg)) => msg,
                        Ok(None) => return Ok(()),
                        Err(_) => match self.try_dehydrate(instance, rx).await {
                            Some(msg) => msg,
                            None => return Ok(()),
                        },
                    }
                }
            };

            match first {
                OrchestratorMsg::Terminate { reason, .. } => {
                    self.terminate_now(instance, &mut st, reason).await?;
                    self.retire(instance, rx).await;
                    return Ok(());
                }
                OrchestratorMsg::ExternalRaised { name, payload, .. } => {
                    debug!(instance, event = %name, "external event recorded");
                    append_kinds(
                        self.store.as_ref(),
                        instance,
                        &mut st.history,
                        vec![EventKind::EventRaised { name, payload }],
                    )
                    .await?;
                    let matched = mailbox::match_pending_events(&st.history, &st.superseded);
                    append_kinds(self.store.as_ref(), instance, &mut st.history, matched).await?;
                }
                completion => self.apply_batch(instance, &mut st, completion, rx).await?,
            }
        }
    }

    /// Fold `first` and whatever else is queued into one append. Events and
    /// termination requests end the batch so they are handled against a
    /// fresh replay.
    async fn apply_batch(
        &self,
        instance: &str,
        st: &mut InstanceState,
        first: OrchestratorMsg,
        rx: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) -> Result<(), StoreError> {
        let table = match crate::correlation::TaskTable::from_history(&st.history) {
            Ok(t) => t,
            // the next replay reports the corruption
            Err(_) => return Ok(()),
        };
        let mut batch = CompletionBatch::new(instance, &table);
        batch.push(first);
        for _ in 1..self.options.completion_batch_limit.max(1) {
            match rx.try_recv() {
                Ok(msg @ (OrchestratorMsg::ExternalRaised { .. } | OrchestratorMsg::Terminate { .. })) => {
                    st.deferred = Some(msg);
                    break;
                }
                Ok(msg) => {
                    batch.push(msg);
                }
                Err(_) => break,
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        let resolved: Vec<u64> = batch.resolved().collect();
        let kinds = std::mem::take(&mut batch.kinds);
        drop(batch);
        append_kinds(self.store.as_ref(), instance, &mut st.history, kinds).await?;
        self.clear_dispatched(instance, resolved).await;
        Ok(())
    }

    /// Replay until the workflow either finishes or waits on tasks nothing
    /// in history can resolve yet.
    async fn run_turns(self: &Arc<Self>, instance: &str, st: &mut InstanceState) -> Result<Step, StoreError> {
        loop {
            let turn = self.engine.replay(
                instance,
                &st.history,
                st.turn_index,
                st.handler.clone(),
                st.input.clone(),
            );
            st.turn_index += 1;
            if let Some(err) = turn.failure {
                debug!(instance, name = %st.name, turn_index = st.turn_index, "replay pass failed");
                return Ok(Step::Finish(Outcome::Failed { error: err }));
            }

            self.record_actions(instance, st, &turn.actions).await?;
            st.superseded = turn.superseded;

            if let Some(out) = turn.output {
                return Ok(Step::Finish(match out {
                    Ok(output) => Outcome::Completed { output },
                    Err(e) => Outcome::Failed {
                        error: OrchestrationError::Application(e),
                    },
                }));
            }

            if st.redispatch {
                st.redispatch = false;
                self.redispatch_unresolved(instance, st).await;
            } else {
                for action in &turn.actions {
                    let seq = action.sequence_id();
                    if st.superseded.contains(&seq) {
                        continue;
                    }
                    // dispatch what was recorded; timers carry the persisted fire time
                    if let Some(spec) = recorded_spec(&st.history, seq) {
                        self.dispatch_task(instance, seq, &spec).await;
                    }
                }
            }
            for sequence_id in turn.cancelled_timers {
                let _ = self.timer_tx.send(TimerCommand::Cancel {
                    instance: instance.to_string(),
                    sequence_id,
                });
            }

            let matched = mailbox::match_pending_events(&st.history, &st.superseded);
            if matched.is_empty() {
                return Ok(Step::Wait);
            }
            append_kinds(self.store.as_ref(), instance, &mut st.history, matched).await?;
        }
    }

    async fn record_actions(&self, instance: &str, st: &mut InstanceState, actions: &[Action]) -> Result<(), StoreError> {
        if actions.is_empty() {
            return Ok(());
        }
        let now = crate::now_ms();
        let kinds = actions
            .iter()
            .map(|a| EventKind::TaskScheduled {
                sequence_id: a.sequence_id(),
                task: a.to_task_spec(now),
            })
            .collect();
        append_kinds(self.store.as_ref(), instance, &mut st.history, kinds).await?;
        debug!(instance, count = actions.len(), turn_index = st.turn_index, "tasks scheduled");
        Ok(())
    }

    /// Dispatch everything unresolved and not superseded; used on the first
    /// pass of an activation so work lost with a previous process resumes.
    async fn redispatch_unresolved(self: &Arc<Self>, instance: &str, st: &InstanceState) {
        let Ok(table) = crate::correlation::TaskTable::from_history(&st.history) else {
            return;
        };
        let open: Vec<(u64, TaskSpec)> = table
            .unresolved()
            .filter(|(seq, _)| !st.superseded.contains(seq))
            .map(|(seq, spec)| (seq, spec.clone()))
            .collect();
        for (seq, spec) in open {
            self.dispatch_task(instance, seq, &spec).await;
        }
    }

    /// Fail every open task with `TerminationRequested`, stop timers and
    /// children, and record the terminal outcome.
    async fn terminate_now(&self, instance: &str, st: &mut InstanceState, reason: String) -> Result<(), StoreError> {
        let fault = OrchestrationError::TerminationRequested(reason.clone()).to_string();
        let mut kinds = Vec::new();
        if let Ok(table) = crate::correlation::TaskTable::from_history(&st.history) {
            for (sequence_id, spec) in table.unresolved() {
                kinds.push(EventKind::TaskFailed {
                    sequence_id,
                    error: fault.clone(),
                });
                if let TaskSpec::SubOrchestration { instance: child, .. } = spec {
                    let _ = self.completion_tx.send(OrchestratorMsg::Terminate {
                        instance: child.clone(),
                        reason: format!("parent terminated: {reason}"),
                    });
                }
            }
        }
        info!(instance, reason = %reason, "terminating instance");
        let parent = st.parent.clone();
        self.finish(instance, &mut st.history, parent, Outcome::Terminated { reason }, kinds)
            .await
    }

    /// Append `pre` plus the terminal record, then report to the parent, if any.
    async fn finish(
        &self,
        instance: &str,
        history: &mut Vec<HistoryEvent>,
        parent: Option<ParentLink>,
        outcome: Outcome,
        mut pre: Vec<EventKind>,
    ) -> Result<(), StoreError> {
        let open_timers: Vec<u64> = crate::correlation::TaskTable::from_history(history)
            .map(|t| {
                t.unresolved()
                    .filter(|(_, spec)| spec.kind() == TaskKind::Timer)
                    .map(|(seq, _)| seq)
                    .collect()
            })
            .unwrap_or_default();
        pre.push(EventKind::OrchestratorCompleted {
            outcome: outcome.clone(),
        });
        append_kinds(self.store.as_ref(), instance, history, pre).await?;
        for sequence_id in open_timers {
            let _ = self.timer_tx.send(TimerCommand::Cancel {
                instance: instance.to_string(),
                sequence_id,
            });
        }
        match &outcome {
            Outcome::Completed { .. } => info!(instance, "orchestration completed"),
            Outcome::Failed { error } if error.is_fatal() => error!(instance, error = %error, "orchestration aborted"),
            Outcome::Failed { error } => warn!(instance, error = %error, "orchestration failed"),
            Outcome::Terminated { reason } => info!(instance, reason = %reason, "orchestration terminated"),
        }
        if let Some(parent) = parent {
            let _ = self.completion_tx.send(dispatch::parent_message(&parent, &outcome));
        }
        Ok(())
    }

    /// Register a new instance log holding only `InstanceCreated`. An
    /// existing but empty log is reused.
    pub(crate) async fn create_instance_record(
        &self,
        instance: &str,
        name: &str,
        input: &str,
        parent: Option<ParentLink>,
    ) -> Result<(), RuntimeError> {
        match self.store.create_instance(instance).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                if !self.store.read(instance).await?.is_empty() {
                    return Err(RuntimeError::AlreadyExists(instance.to_string()));
                }
            }
            Err(e) => return Err(e.into()),
        }
        let created = HistoryEvent::new(
            1,
            EventKind::InstanceCreated {
                name: name.to_string(),
                input: input.to_string(),
                parent,
                format_version: crate::HISTORY_FORMAT_VERSION,
            },
        );
        match self.store.append(instance, vec![created]).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { .. }) => Err(RuntimeError::AlreadyExists(instance.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Create an instance of `name` and start running it. Returns the
    /// instance id, generated when `instance_id` is `None`.
    pub async fn start_orchestration(
        self: &Arc<Self>,
        name: &str,
        input: impl Into<String>,
        instance_id: Option<&str>,
    ) -> Result<String, RuntimeError> {
        let instance = instance_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let input = input.into();
        self.create_instance_record(&instance, name, &input, None).await?;
        info!(instance = %instance, name, "instance created");
        self.activate(&instance).await;
        Ok(instance)
    }

    /// Start an orchestration whose input is serialized with serde.
    pub async fn start_orchestration_typed<In: Serialize>(
        self: &Arc<Self>,
        name: &str,
        input: &In,
        instance_id: Option<&str>,
    ) -> Result<String, RuntimeError> {
        let payload = codec::encode(input).map_err(RuntimeError::Codec)?;
        self.start_orchestration(name, payload, instance_id).await
    }

    /// Deliver a named event. Buffered until a wait on `name` consumes it;
    /// discarded with a warning when the instance already finished.
    pub async fn raise_event(
        self: &Arc<Self>,
        instance: &str,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        if !self.accepts_messages(instance, "raise_event").await? {
            return Ok(());
        }
        info!(instance, event = %name, "raise_event");
        self.deliver(OrchestratorMsg::ExternalRaised {
            instance: instance.to_string(),
            name,
            payload: payload.into(),
        })
        .await;
        Ok(())
    }

    /// Request termination. In-flight tasks fail with `TerminationRequested`
    /// and the instance ends as Terminated.
    pub async fn terminate_instance(self: &Arc<Self>, instance: &str, reason: impl Into<String>) -> Result<(), RuntimeError> {
        if !self.accepts_messages(instance, "terminate_instance").await? {
            return Ok(());
        }
        self.deliver(OrchestratorMsg::Terminate {
            instance: instance.to_string(),
            reason: reason.into(),
        })
        .await;
        Ok(())
    }

    async fn accepts_messages(&self, instance: &str, op: &str) -> Result<bool, RuntimeError> {
        let history = self.store.read(instance).await?;
        if history.is_empty() {
            return Err(RuntimeError::NotFound(instance.to_string()));
        }
        if status::terminal_outcome(&history).is_some() {
            warn!(instance, op, "instance already terminal; request discarded");
            return Ok(false);
        }
        Ok(true)
    }

    /// Abort background tasks and actors. Histories stay in the store and
    /// resume on the next start.
    pub async fn shutdown(self: Arc<Self>) {
        for j in self.joins.lock().await.drain(..) {
            j.abort();
        }
        for j in self.instance_joins.lock().await.drain(..) {
            j.abort();
        }
    }
}

fn parent_of(history: &[HistoryEvent]) -> Option<ParentLink> {
    history.iter().find_map(|e| match &e.kind {
        EventKind::InstanceCreated { parent, .. } => parent.clone(),
        _ => None,
    })
}

fn recorded_spec(history: &[HistoryEvent], sequence_id: u64) -> Option<TaskSpec> {
    history.iter().rev().find_map(|e| match &e.kind {
        EventKind::TaskScheduled { sequence_id: s, task } if *s == sequence_id => Some(task.clone()),
        _ => None,
    })
}

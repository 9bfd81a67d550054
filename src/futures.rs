use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::correlation::Resolution;
use crate::{OrchestrationContext, TaskKind};

/// Terminal value of a [`DurableFuture`], tagged by task kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
}

impl DurableOutput {
    /// Collapse to a plain result: timers yield `""`, events yield their payload.
    pub fn into_result(self) -> Result<String, String> {
        match self {
            DurableOutput::Activity(r) | DurableOutput::SubOrchestration(r) => r,
            DurableOutput::Timer => Ok(String::new()),
            DurableOutput::External(payload) => Ok(payload),
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(
            self,
            DurableOutput::Activity(Err(_)) | DurableOutput::SubOrchestration(Err(_))
        )
    }
}

/// Map a recorded resolution onto the output of a task of `kind`.
///
/// Failed timers and event waits only occur on termination and never resolve.
pub(crate) fn output_for(kind: TaskKind, resolution: &Resolution) -> Option<DurableOutput> {
    match (kind, resolution) {
        (TaskKind::Activity, Resolution::Completed(r)) => Some(DurableOutput::Activity(Ok(r.clone()))),
        (TaskKind::Activity, Resolution::Failed(e)) => Some(DurableOutput::Activity(Err(e.clone()))),
        (TaskKind::SubOrchestration, Resolution::Completed(r)) => {
            Some(DurableOutput::SubOrchestration(Ok(r.clone())))
        }
        (TaskKind::SubOrchestration, Resolution::Failed(e)) => {
            Some(DurableOutput::SubOrchestration(Err(e.clone())))
        }
        (TaskKind::Timer, Resolution::Completed(_)) => Some(DurableOutput::Timer),
        (TaskKind::EventWait, Resolution::Completed(p)) => Some(DurableOutput::External(p.clone())),
        (TaskKind::Timer | TaskKind::EventWait, Resolution::Failed(_)) => None,
    }
}

/// Handle to one scheduled task. Resolves once history holds its completion.
///
/// The task was already requested when this handle was created; awaiting
/// it, dropping it, or passing it to `select`/`join` never schedules again.
pub struct DurableFuture {
    pub(crate) sequence_id: u64,
    pub(crate) kind: TaskKind,
    pub(crate) ctx: OrchestrationContext,
}

impl DurableFuture {
    /// Correlation id of the underlying task, stable across replays.
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// `(event_id, output)` of the completion, if recorded.
    pub(crate) fn peek(&self) -> Option<(u64, DurableOutput)> {
        let inner = self.ctx.inner();
        if inner.failure.is_some() {
            return None;
        }
        let (event_id, resolution) = inner.table.resolution(self.sequence_id)?;
        output_for(self.kind, resolution).map(|o| (event_id, o))
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.peek() {
            Some((_, output)) => Poll::Ready(output),
            None => Poll::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AggregateMode {
    Select,
    Join,
}

pub enum AggregateOutput {
    Select { winner_index: usize, output: DurableOutput },
    Join { outputs: Vec<DurableOutput> },
}

/// Shared machinery behind `select` (Any) and `join` (All).
pub struct AggregateDurableFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
    mode: AggregateMode,
}

impl AggregateDurableFuture {
    pub(crate) fn new_select(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::Select,
        }
    }

    pub(crate) fn new_join(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::Join,
        }
    }

    fn poll_select(&self) -> Poll<AggregateOutput> {
        // The winner is the child whose completion was recorded first, so a
        // replay picks the same child no matter how many losers finished since.
        let mut best: Option<(u64, u64, usize, DurableOutput)> = None;
        for (idx, child) in self.children.iter().enumerate() {
            if let Some((event_id, output)) = child.peek() {
                let key = (event_id, child.sequence_id);
                if best.as_ref().is_none_or(|(e, s, _, _)| key < (*e, *s)) {
                    best = Some((event_id, child.sequence_id, idx, output));
                }
            }
        }
        let Some((_, _, winner_index, output)) = best else {
            return Poll::Pending;
        };

        let mut inner = self.ctx.inner();
        for (idx, child) in self.children.iter().enumerate() {
            if idx == winner_index {
                continue;
            }
            inner.superseded.insert(child.sequence_id);
            let open = inner.table.resolution(child.sequence_id).is_none();
            if child.kind == TaskKind::Timer && open {
                inner.cancelled_timers.insert(child.sequence_id);
            }
        }
        Poll::Ready(AggregateOutput::Select { winner_index, output })
    }

    fn poll_join(&self) -> Poll<AggregateOutput> {
        let mut outputs = Vec::with_capacity(self.children.len());
        for child in &self.children {
            match child.peek() {
                Some((_, output)) => outputs.push(output),
                None => return Poll::Pending,
            }
        }
        Poll::Ready(AggregateOutput::Join { outputs })
    }
}

impl Future for AggregateDurableFuture {
    type Output = AggregateOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.mode {
            AggregateMode::Select => self.poll_select(),
            AggregateMode::Join => self.poll_join(),
        }
    }
}

/// Any: resolves with `(winner_index, output)` of the first child to finish.
pub struct SelectFuture(pub(crate) AggregateDurableFuture);

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(AggregateOutput::Select { winner_index, output }) => Poll::Ready((winner_index, output)),
            Poll::Ready(AggregateOutput::Join { .. }) => unreachable!("select aggregate produced join output"),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// All: resolves with every child's output, in the order children were given.
pub struct JoinFuture(pub(crate) AggregateDurableFuture);

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(AggregateOutput::Join { outputs }) => Poll::Ready(outputs),
            Poll::Ready(AggregateOutput::Select { .. }) => unreachable!("join aggregate produced select output"),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// All with failure propagation: waits for every child, then yields the
/// results in child order or the first failure in child order.
pub struct AllFuture(pub(crate) JoinFuture);

impl Future for AllFuture {
    type Output = Result<Vec<String>, String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(outputs) => Poll::Ready(outputs.into_iter().map(DurableOutput::into_result).collect()),
            Poll::Pending => Poll::Pending,
        }
    }
}

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::runtime::OrchestrationHandler;
use crate::{HistoryEvent, OrchestrationError, TurnResult};

pub trait ReplayEngine: Send + Sync {
    /// Replays one pass of `handler` against `history`.
    fn replay(
        &self,
        instance: &str,
        history: &[HistoryEvent],
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnResult<Result<String, String>>;
}

/// Runs passes through [`crate::run_turn_with`], turning panics in workflow
/// code into a failed turn.
#[derive(Default)]
pub struct DefaultReplayEngine;

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        instance: &str,
        history: &[HistoryEvent],
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnResult<Result<String, String>> {
        let orchestrator = |ctx: crate::OrchestrationContext| {
            let h = handler.clone();
            let inp = input.clone();
            async move { h.invoke(ctx, inp).await }
        };
        match catch_unwind(AssertUnwindSafe(|| {
            crate::run_turn_with(instance, history, turn_index, orchestrator)
        })) {
            Ok(turn) => turn,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                TurnResult {
                    actions: Vec::new(),
                    output: None,
                    superseded: Default::default(),
                    cancelled_timers: Vec::new(),
                    failure: Some(OrchestrationError::Panicked(msg)),
                }
            }
        }
    }
}

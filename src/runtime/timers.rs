use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use super::OrchestratorMsg;

#[derive(Debug, Clone)]
pub enum TimerCommand {
    Schedule {
        instance: String,
        sequence_id: u64,
        fire_at_ms: u64,
    },
    /// Best-effort: a timer already handed out still gets recorded.
    Cancel { instance: String, sequence_id: u64 },
}

type TimerKey = (String, u64);

/// In-process timer service.
/// Keeps a min-heap of pending timers and emits `TimerFired` when due.
pub struct TimerService {
    rx: mpsc::UnboundedReceiver<TimerCommand>,
    out: mpsc::UnboundedSender<OrchestratorMsg>,
    min_heap: BinaryHeap<Reverse<(u64, TimerKey)>>,
    pending: HashSet<TimerKey>,
}

impl TimerService {
    pub fn start(
        out: mpsc::UnboundedSender<OrchestratorMsg>,
    ) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedSender<TimerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel::<TimerCommand>();
        let svc = TimerService {
            rx,
            out,
            min_heap: BinaryHeap::new(),
            pending: HashSet::new(),
        };
        let handle = tokio::spawn(svc.run());
        (handle, tx)
    }

    async fn run(mut self) {
        loop {
            self.fire_due();
            let next = self.min_heap.peek().map(|Reverse((ts, _))| *ts);
            let cmd = match next {
                Some(ts) => {
                    let wait = ts.saturating_sub(crate::now_ms()).max(1);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(wait)) => continue,
                        cmd = self.rx.recv() => cmd,
                    }
                }
                None => self.rx.recv().await,
            };
            match cmd {
                Some(cmd) => self.apply(cmd),
                None => break,
            }
        }
    }

    fn apply(&mut self, cmd: TimerCommand) {
        match cmd {
            TimerCommand::Schedule {
                instance,
                sequence_id,
                fire_at_ms,
            } => {
                let key = (instance, sequence_id);
                if self.pending.insert(key.clone()) {
                    self.min_heap.push(Reverse((fire_at_ms, key)));
                }
            }
            TimerCommand::Cancel { instance, sequence_id } => {
                // the heap entry is skipped when it surfaces
                if self.pending.remove(&(instance.clone(), sequence_id)) {
                    debug!(instance = %instance, sequence_id, "timer cancelled");
                }
            }
        }
    }

    fn fire_due(&mut self) {
        let now = crate::now_ms();
        while let Some(Reverse((ts, _))) = self.min_heap.peek() {
            if *ts > now {
                break;
            }
            let Some(Reverse((fire_at_ms, key))) = self.min_heap.pop() else {
                break;
            };
            if !self.pending.remove(&key) {
                continue;
            }
            let (instance, sequence_id) = key;
            let _ = self.out.send(OrchestratorMsg::TimerFired {
                instance,
                sequence_id,
                fire_at_ms,
            });
        }
    }
}

//! Timeout scheduling for the consensus state machine.
//!
//! The scheduler runs as its own task and holds at most one pending timer.
//! Scheduling a new timeout supersedes the pending one; there is no remote
//! cancellation. Every tick carries the `(height, round, step)` it was
//! scheduled for, and the core drops ticks that no longer match its state,
//! so a superseded timer that already fired is harmless.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::types::{Height, Round, Step};

/// A scheduled (or fired) timeout, stamped with the state it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    /// How long to wait before the tick
    pub duration: Duration,
    /// Height the timer was scheduled at
    pub height: Height,
    /// Round the timer was scheduled at
    pub round: Round,
    /// Step the timer was scheduled at
    pub step: Step,
}

impl std::fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Timeout({:?} h={} r={} {})",
            self.duration, self.height, self.round, self.step
        )
    }
}

/// Handle for scheduling timeouts.
///
/// Dropping every handle stops the scheduler task.
#[derive(Clone)]
pub struct TimeoutScheduler {
    schedule_tx: mpsc::Sender<TimeoutInfo>,
}

impl TimeoutScheduler {
    /// Spawn the scheduler task. Fired ticks are delivered on `tick_tx`.
    pub fn spawn(tick_tx: mpsc::Sender<TimeoutInfo>) -> Self {
        let (schedule_tx, schedule_rx) = mpsc::channel(16);
        tokio::spawn(run_scheduler(schedule_rx, tick_tx));
        Self { schedule_tx }
    }

    /// Schedule a timeout, superseding any pending one.
    pub async fn schedule(&self, info: TimeoutInfo) {
        trace!(timeout = %info, "Scheduling timeout");
        // The scheduler task only stops when every handle is dropped.
        let _ = self.schedule_tx.send(info).await;
    }
}

async fn run_scheduler(
    mut schedule_rx: mpsc::Receiver<TimeoutInfo>,
    tick_tx: mpsc::Sender<TimeoutInfo>,
) {
    let mut pending: Option<(Instant, TimeoutInfo)> = None;

    loop {
        let deadline = pending
            .as_ref()
            .map(|(at, _)| *at)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            scheduled = schedule_rx.recv() => match scheduled {
                Some(info) => {
                    if let Some((_, old)) = pending.replace((Instant::now() + info.duration, info)) {
                        debug!(superseded = %old, "Timeout superseded");
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                let (_, info) = pending.take().expect("guarded by pending.is_some()");
                debug!(timeout = %info, "Timeout fired");
                if tick_tx.send(info).await.is_err() {
                    break;
                }
            }
        }
    }
}

//! Per-connection inactivity timeout.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// "Something arrived since the last check." Set by the session, consumed by
/// the monitor. Races between the two only shift a timeout by one period.
#[derive(Debug, Clone, Default)]
pub struct ActivityFlag(Arc<AtomicBool>);

impl ActivityFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns whether activity was recorded and clears the flag.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// No activity for a full period; the connection was closed.
    TimedOut,
    /// The connection closed on its own first.
    ConnectionClosed,
}

/// Checks `activity` once per `period` and cancels `closer` the first time a
/// whole period passes without any.
pub async fn monitor(
    period: Duration,
    activity: ActivityFlag,
    closer: CancellationToken,
) -> IdleOutcome {
    let mut checks = time::interval_at(Instant::now() + period, period);
    checks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = closer.cancelled() => return IdleOutcome::ConnectionClosed,
            _ = checks.tick() => {
                if !activity.take() {
                    closer.cancel();
                    return IdleOutcome::TimedOut;
                }
            }
        }
    }
}

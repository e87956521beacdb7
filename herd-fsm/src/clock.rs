//! Tick sources driving logical time.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Sender side of a manual ticker, used by tests to step time by hand.
#[derive(Clone)]
pub struct TickHandle {
    tx: mpsc::Sender<()>,
}

impl TickHandle {
    pub async fn tick(&self) {
        let _ = self.tx.send(()).await;
    }

    pub async fn ticks(&self, n: usize) {
        for _ in 0..n {
            self.tick().await;
        }
    }
}

/// Source of ticks for a reconciliation loop.
pub enum Ticker {
    Interval(time::Interval),
    Manual(mpsc::Receiver<()>),
}

impl Ticker {
    /// Ticks every `period`, starting one period from now. Late ticks are
    /// delayed instead of bursting.
    pub fn interval(period: Duration) -> Self {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ticker::Interval(interval)
    }

    /// Ticker driven explicitly through the returned handle.
    pub fn manual() -> (TickHandle, Self) {
        let (tx, rx) = mpsc::channel(64);
        (TickHandle { tx }, Ticker::Manual(rx))
    }

    /// Waits for the next tick. A manual ticker whose handle was dropped
    /// never resolves, so it is safe to keep polling inside a select loop.
    pub async fn tick(&mut self) {
        match self {
            Ticker::Interval(interval) => {
                interval.tick().await;
            }
            Ticker::Manual(rx) => {
                if rx.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

//! Periodic loop driver.
//!
//! Each component runs in its own spawned task that waits for the next
//! interval tick, an explicit wake-up (critical fast path) or shutdown. A
//! tick that has started always runs to completion; shutdown is observed
//! only between ticks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

/// Something driven by a periodic loop.
#[async_trait]
pub trait Tickable: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// One synchronization pass. Never fails; problems become events.
    async fn tick(&self);
}

/// Broadcast shutdown flag shared by every loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Ask every loop to stop after its current tick.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Spawn the loop for `target`.
///
/// The first interval tick is skipped: callers run an initial pass
/// themselves before starting loops.
pub fn spawn_loop<T: Tickable>(
    target: Arc<T>,
    period: Duration,
    wake: Option<Arc<Notify>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = target.name();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(loop_name = name, period_ms = period.as_millis() as u64, "Loop started");

        loop {
            let woken = async {
                match &wake {
                    Some(notify) => notify.notified().await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
                _ = woken => {
                    debug!(loop_name = name, "Woken for out-of-band tick");
                }
            }

            if *shutdown.borrow() {
                break;
            }
            target.tick().await;
        }

        info!(loop_name = name, "Loop stopped");
    })
}

//! Background checkpoint timer
//!
//! The task holds only a weak handle, so it never keeps a dropped table
//! alive. Shutdown is a signal checked between ticks; a checkpoint that has
//! started always runs to completion.

use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{Table, TableInner};

pub(super) struct Flusher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Flusher {
    /// Ask the task to stop after its current tick
    pub(super) fn signal(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Table {
    /// Start the periodic checkpoint (no-op if running or the interval is 0)
    pub fn start_flusher(&self) {
        let interval = self.inner.config.flush_interval();
        if interval.is_zero() {
            return;
        }

        let mut slot = self.inner.flusher.lock();
        if slot.is_some() {
            return;
        }

        let (shutdown, stop) = watch::channel(false);
        let handle = tokio::spawn(run(Arc::downgrade(&self.inner), interval, stop));
        *slot = Some(Flusher { shutdown, handle });
        debug!(table = %self.inner.name, interval_ms = interval.as_millis() as u64, "Flusher started");
    }

    /// Stop the periodic checkpoint and wait for the task to exit
    pub async fn stop_flusher(&self) {
        let flusher = self.inner.flusher.lock().take();
        let Some(flusher) = flusher else {
            return;
        };

        flusher.signal();
        if let Err(e) = flusher.handle.await {
            warn!(table = %self.inner.name, error = %e, "Flusher task ended abnormally");
        }
        debug!(table = %self.inner.name, "Flusher stopped");
    }

    pub fn flusher_running(&self) -> bool {
        self.inner.flusher.lock().is_some()
    }
}

async fn run(inner: Weak<TableInner>, interval: std::time::Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let table = Table { inner };
                if table.is_locked() {
                    continue;
                }
                if let Err(e) = table.flush().await {
                    warn!(table = %table.inner.name, error = %e, "Background flush failed");
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}

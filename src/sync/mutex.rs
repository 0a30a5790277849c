//! Cooperative FIFO mutex
//!
//! A data-less async lock. `lock()` resolves immediately when the mutex is
//! free, otherwise the caller is queued behind earlier waiters. Dropping the
//! guard hands the lock straight to the next waiter, so the lock is never
//! observed free while someone is queued.
//!
//! No reentrancy and no timeout: locking twice from the same task deadlocks.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Default)]
struct State {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Cooperative lock serializing one critical section at a time
#[derive(Default)]
pub struct CoopMutex {
    state: Mutex<State>,
}

/// Holds the lock until dropped
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct CoopGuard<'a> {
    mutex: &'a CoopMutex,
}

impl CoopMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the lock is ours
    pub async fn lock(&self) -> CoopGuard<'_> {
        let rx = {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                return CoopGuard { mutex: self };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let mut waiter = Waiter {
            mutex: self,
            rx: Some(rx),
        };
        waiter.wait().await;
        CoopGuard { mutex: self }
    }

    /// Take the lock only if nobody holds it
    pub fn try_lock(&self) -> Option<CoopGuard<'_>> {
        let mut state = self.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(CoopGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Number of queued waiters
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        // A waiter whose future was dropped has a closed channel; skip it.
        while let Some(tx) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        state.locked = false;
    }
}

impl Drop for CoopGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Queue slot of a pending `lock()`
///
/// If the lock future is dropped after ownership was already handed over,
/// the lock is passed on instead of leaking.
struct Waiter<'a> {
    mutex: &'a CoopMutex,
    rx: Option<oneshot::Receiver<()>>,
}

impl Waiter<'_> {
    async fn wait(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            // The sender lives in the queue until unlock() hands it the lock;
            // it is never dropped unsent while the mutex is alive.
            let _ = rx.await;
        }
        self.rx = None;
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.mutex.unlock();
            }
        }
    }
}

//! Per-resource mutual exclusion.
//!
//! [`ResourceLocks`] is a cloneable handle to one coordinator shared by every
//! caller that mutates a file or an account. Each key has at most one holder;
//! waiters queue in arrival order and ownership is handed directly to the
//! next waiter on release, so nobody can barge in between.
//!
//! A key is present in the map exactly while it is held. Its queue entry is
//! removed when the last holder releases with nobody waiting.
//!
//! Locks are not reentrant: acquiring a key already held by the same logical
//! operation deadlocks.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type WaitQueues = HashMap<String, VecDeque<oneshot::Sender<()>>>;

#[derive(Clone, Default)]
pub struct ResourceLocks {
    queues: Arc<Mutex<WaitQueues>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for operations that mutate one file's content.
    pub fn file_key(id: impl Display) -> String {
        format!("file:{}", id)
    }

    /// Key for operations that must not race within one account.
    pub fn user_key(id: impl Display) -> String {
        format!("user:{}", id)
    }

    /// Wait for exclusive ownership of `key`.
    ///
    /// Dropping the returned future before it resolves gives up the place in
    /// the queue without disturbing other waiters.
    pub async fn acquire(&self, key: impl Into<String>) -> ResourceGuard {
        let key = key.into();

        let waiting = {
            let mut queues = self.queues.lock();
            match queues.get_mut(&key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push_back(tx);
                    Some(rx)
                }
                None => {
                    queues.insert(key.clone(), VecDeque::new());
                    None
                }
            }
        };

        if let Some(rx) = waiting {
            debug!(key = %key, "waiting for resource lock");
            let mut pending = PendingGrant {
                rx: Some(rx),
                locks: self,
                key: &key,
            };
            pending.granted().await;
        }

        ResourceGuard {
            key: Some(key),
            locks: self.clone(),
        }
    }

    /// Run `op` while holding `key`, releasing afterwards even if `op` is
    /// cancelled or panics.
    pub async fn with_lock<F, Fut, T>(&self, key: impl Into<String>, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(key).await;
        let out = op().await;
        guard.release();
        out
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.queues.lock().contains_key(key)
    }

    /// Number of callers queued behind the current holder of `key`.
    pub fn waiting(&self, key: &str) -> usize {
        self.queues.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Number of keys currently held.
    pub fn held_keys(&self) -> usize {
        self.queues.lock().len()
    }

    /// Pass ownership of `key` to the next live waiter, or forget the key.
    fn release(&self, key: &str) {
        let mut queues = self.queues.lock();
        let Some(waiters) = queues.get_mut(key) else {
            warn!(key = %key, "released a resource lock that was not held");
            return;
        };

        while let Some(next) = waiters.pop_front() {
            // A closed receiver means that waiter gave up; try the next one.
            if next.send(()).is_ok() {
                return;
            }
        }
        queues.remove(key);
    }
}

/// A queued acquisition. If dropped after ownership was already handed over,
/// it passes ownership on.
struct PendingGrant<'a> {
    rx: Option<oneshot::Receiver<()>>,
    locks: &'a ResourceLocks,
    key: &'a str,
}

impl PendingGrant<'_> {
    async fn granted(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            // Senders live in the queue map until they are used, and this
            // grant keeps the map alive, so the channel only resolves on a
            // hand-over.
            let _ = rx.await;
        }
        self.rx = None;
    }
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.locks.release(self.key);
            }
        }
    }
}

/// Exclusive ownership of one resource key. Released by [`release`] or on
/// drop.
///
/// [`release`]: ResourceGuard::release
pub struct ResourceGuard {
    key: Option<String>,
    locks: ResourceLocks,
}

impl ResourceGuard {
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or_default()
    }

    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(key) = self.key.take() {
            self.locks.release(&key);
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.release_now();
    }
}

//! Correlation readiness map.
//!
//! A `store` marks its correlation key pending before executing and ready
//! only after it committed.  A dependent `journal-store` waits on the same
//! key until it turns ready or the timeout elapses.
//!
//! Each key owns a [`watch`] channel, so waiting costs no polling and a
//! waiter that subscribes after the flag flipped still sees `true`.  Either
//! side may create the entry first.  Entries a failed write leaves behind are
//! discarded at once; ready ones nobody reads are swept after a TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::{StorageError, StorageResult};

const KEY_PREFIX: &str = "stored:";

struct Flag {
    tx: watch::Sender<bool>,
    touched: Instant,
}

impl Flag {
    fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
            touched: Instant::now(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ReadinessMap {
    flags: Arc<DashMap<String, Flag>>,
}

impl ReadinessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The correlation key for a message id.
    pub fn key(id: &str) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    /// Mark `id` as pending, creating the entry if needed.
    pub fn pending(&self, id: &str) {
        self.update(id, false);
    }

    /// Mark `id` as ready and wake every waiter.
    pub fn mark_ready(&self, id: &str) {
        self.update(id, true);
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.flags
            .get(&Self::key(id))
            .map(|flag| *flag.tx.borrow())
            .unwrap_or(false)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.flags.contains_key(&Self::key(id))
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Wait until `id` is ready, then drop its entry.
    ///
    /// Gives up with [`StorageError::NotReady`] after `timeout`.  A timed out
    /// waiter drops the entry only when nobody else is waiting on it.
    pub async fn wait_ready(&self, id: &str, timeout: Duration) -> StorageResult<()> {
        let key = Self::key(id);
        let mut rx = self
            .flags
            .entry(key.clone())
            .or_insert_with(Flag::new)
            .tx
            .subscribe();

        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|ready| *ready).await.map(|_| ())
        })
        .await;

        // A closed channel only counts when the last value it carried was
        // `true`; the flag may also flip right as the timeout fires.
        let ready = matches!(waited, Ok(Ok(()))) || *rx.borrow();
        if ready {
            self.flags.remove_if(&key, |_, flag| *flag.tx.borrow());
            return Ok(());
        }

        if waited.is_err() {
            // Our own receiver is still alive, so one means "only us".
            self.flags
                .remove_if(&key, |_, flag| flag.tx.receiver_count() <= 1);
        }
        Err(StorageError::NotReady {
            key,
            waited: timeout,
        })
    }

    /// Drop the entry for `id` if it is already ready.
    ///
    /// Pending entries stay, so a concurrent waiter is not orphaned.
    pub fn clear_ready(&self, id: &str) -> bool {
        self.flags
            .remove_if(&Self::key(id), |_, flag| *flag.tx.borrow())
            .is_some()
    }

    /// Drop a pending entry nobody is waiting on.
    ///
    /// Used after a failed write: its flag can never turn ready.
    pub fn discard(&self, id: &str) -> bool {
        self.flags
            .remove_if(&Self::key(id), |_, flag| {
                !*flag.tx.borrow() && flag.tx.receiver_count() == 0
            })
            .is_some()
    }

    /// Drop every entry untouched for `ttl` that has no waiters.  Returns the
    /// number of entries removed.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let before = self.flags.len();
        self.flags
            .retain(|_, flag| flag.tx.receiver_count() > 0 || flag.touched.elapsed() < ttl);
        before.saturating_sub(self.flags.len())
    }

    fn update(&self, id: &str, ready: bool) {
        let mut flag = self.flags.entry(Self::key(id)).or_insert_with(Flag::new);
        flag.touched = Instant::now();
        flag.tx.send_replace(ready);
    }
}

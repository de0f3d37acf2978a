//! Leaf-arrival waiter.
//!
//! A leaf referenced by a metadata document may arrive slightly later via
//! replication. `wait_for_leaf` suspends until [`Waiter::leaf_arrived`] is
//! called for that id, or until the hard timeout fires. A live changes
//! subscription (filter `type=="leaf"`, non-deletions only) on the local
//! database is expected to drive `leaf_arrived`.

use std::collections::HashMap;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{select, Either};
use parking_lot::Mutex;

use crate::config::LEAF_WAIT_TIMEOUT_MS;
use crate::error::{Error, Result};
use crate::ids::LeafId;

/// Per-id broadcast of leaf arrival; cooperates with the engine's single
/// cooperative task scheduler rather than blocking a thread.
#[derive(Default)]
pub struct Waiter {
    pending: Mutex<HashMap<LeafId, Vec<oneshot::Sender<()>>>>,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `id` and suspends until it arrives or
    /// `LEAF_WAIT_TIMEOUT` elapses. Firing the timeout rejects this call but
    /// leaves the id registered — a later, slower arrival becomes a no-op
    /// (the sender is simply dropped unreceived).
    pub async fn wait_for_leaf(&self, id: &LeafId) -> Result<()> {
        self.wait_for_leaf_with_timeout(id, Duration::from_millis(LEAF_WAIT_TIMEOUT_MS))
            .await
    }

    pub async fn wait_for_leaf_with_timeout(&self, id: &LeafId, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().entry(id.clone()).or_default().push(tx);

        let sleep = sleep(timeout);
        futures::pin_mut!(sleep);
        match select(rx, sleep).await {
            Either::Left((Ok(()), _)) => Ok(()),
            Either::Left((Err(_), _)) => Err(Error::LeafWaitTimeout(id.clone())),
            Either::Right(((), _)) => Err(Error::LeafWaitTimeout(id.clone())),
        }
    }

    /// Called by the live changes subscription when a leaf with `id` is
    /// written locally. Wakes **all** waiters registered for that id, then
    /// removes the entry.
    pub fn leaf_arrived(&self, id: &LeafId) {
        if let Some(senders) = self.pending.lock().remove(id) {
            for tx in senders {
                let _ = tx.send(());
            }
        }
    }

    pub fn waiting_count(&self, id: &LeafId) -> usize {
        self.pending.lock().get(id).map_or(0, Vec::len)
    }
}

/// A timer future built from a background thread, since this crate does
/// not pull in a full async runtime — `std::thread` + channels instead of
/// an executor for a simple timeout.
fn sleep(duration: Duration) -> impl std::future::Future<Output = ()> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        std::thread::sleep(duration);
        let _ = tx.send(());
    });
    async move {
        let _ = rx.await;
    }
}

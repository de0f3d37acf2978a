//! Per-id write lock registry.
//!
//! `putEntry`, `deleteEntry` and prefix deletion each acquire a named lock
//! keyed by `"file:" + id` with non-reentrant, non-fair semantics. Reads
//! are never locked. Writes to different ids may interleave freely.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_like_mutex::AsyncMutex;

/// Registry of per-id async mutexes, created lazily and never removed
/// (ids are reused across a note's lifetime, so the registry is expected
/// to stabilize at roughly one entry per note ever written).
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> Arc<AsyncMutex> {
        let mut locks = self.locks.lock();
        locks
            .entry(format!("file:{id}"))
            .or_insert_with(|| Arc::new(AsyncMutex::new()))
            .clone()
    }

    /// Acquires the named lock for `id`, suspending the caller (not
    /// blocking a thread) until it is free.
    pub async fn acquire(&self, id: &str) -> tokio_like_mutex::Guard {
        self.entry(id).lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// A minimal async-friendly mutex built from a oneshot-channel waiter
/// queue: a small hand-rolled synchronization primitive instead of pulling
/// in a full async runtime just for mutual exclusion.
mod tokio_like_mutex {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use futures::channel::oneshot;
    use parking_lot::Mutex;

    struct State {
        locked: bool,
        waiters: VecDeque<oneshot::Sender<()>>,
    }

    pub struct AsyncMutex {
        state: Mutex<State>,
    }

    impl AsyncMutex {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(State {
                    locked: false,
                    waiters: VecDeque::new(),
                }),
            }
        }

        pub async fn lock_owned(self: Arc<Self>) -> Guard {
            let rx = {
                let mut state = self.state.lock();
                if !state.locked {
                    state.locked = true;
                    None
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Some(rx)
                }
            };
            // `unlock` hands off ownership directly to the next waiter
            // without ever clearing `locked`, so waking here means we are
            // already the holder — no re-check needed.
            if let Some(rx) = rx {
                let _ = rx.await;
            }
            Guard { mutex: self }
        }

        fn unlock(&self) {
            let mut state = self.state.lock();
            if let Some(next) = state.waiters.pop_front() {
                // Hand off directly: the waiter's `lock_owned` loop will see
                // `locked` still true and simply proceed as the holder.
                let _ = next.send(());
            } else {
                state.locked = false;
            }
        }
    }

    pub struct Guard {
        mutex: Arc<AsyncMutex>,
    }

    impl Drop for Guard {
        fn drop(&mut self) {
            self.mutex.unlock();
        }
    }
}

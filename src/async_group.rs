use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{instrument, trace};

struct Call<V, E> {
    done: Notify,
    outcome: Mutex<Option<Result<V, E>>>,
}

impl<V, E> Call<V, E>
where
    V: Clone,
    E: Clone,
{
    fn new() -> Call<V, E> {
        Call {
            done: Notify::new(),
            outcome: Mutex::new(None),
        }
    }

    fn complete(&self, outcome: Result<V, E>) {
        let mut slot = self.outcome.lock();
        *slot = Some(outcome);
        drop(slot);
        self.done.notify_waiters();
    }

    async fn wait(&self) -> Result<V, E> {
        loop {
            // Register with the Notify before checking the slot, so a
            // wake-up landing between the check and the await is not lost.
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let slot = self.outcome.lock();
                if let Some(outcome) = slot.as_ref() {
                    return outcome.clone();
                }
            }
            notified.await;
        }
    }
}

/// Task-based counterpart of [`Group`](crate::Group): at most one operation
/// runs per key at a time, and every caller that overlapped with it receives
/// that one execution's outcome. Joining callers yield to the runtime
/// instead of blocking a thread.
///
/// Cloning an `AsyncGroup` yields another handle to the same registry.
pub struct AsyncGroup<K, V, E> {
    calls: Arc<Mutex<HashMap<K, Arc<Call<V, E>>>>>,
}

impl<K, V, E> Clone for AsyncGroup<K, V, E> {
    fn clone(&self) -> Self {
        AsyncGroup {
            calls: self.calls.clone(),
        }
    }
}

impl<K, V, E> fmt::Debug for AsyncGroup<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncGroup").finish()
    }
}

impl<K, V, E> Default for AsyncGroup<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> AsyncGroup<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    pub fn new() -> AsyncGroup<K, V, E> {
        AsyncGroup {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// work awaits `operation` and returns its outcome, making sure that
    /// only one execution is in flight for `key` at a time. A caller that
    /// arrives while a call for the same key is already running does not
    /// poll `operation`; it waits until that call finishes and receives the
    /// same outcome, success or failure. A failed call does not poison the
    /// key: the next non-overlapping caller executes afresh.
    ///
    /// The winning caller awaits `operation` with the registry unlocked, so
    /// calls for other keys proceed independently. Calling `work` for the
    /// same key from inside `operation` never completes. This crate provides
    /// no deadline: if the winning caller's future is dropped before the
    /// operation completes, joined callers wait forever, so wrap `operation`
    /// with a timeout at the call site when that matters.
    #[instrument(level = "trace", skip_all)]
    pub async fn work<F>(&self, key: K, operation: F) -> Result<V, E>
    where
        F: Future<Output = Result<V, E>>,
    {
        let (call, leading) = {
            let mut calls = self.calls.lock();
            match calls.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let call = Arc::new(Call::new());
                    calls.insert(key.clone(), Arc::clone(&call));
                    (call, true)
                }
            }
        };

        if !leading {
            trace!("joining in-flight call");
            return call.wait().await;
        }

        trace!("executing");
        let outcome = operation.await;

        // Store, wake and remove under the registry lock: a caller arriving
        // now either joins this call and is woken immediately, or finds the
        // key absent and starts a fresh execution.
        {
            let mut calls = self.calls.lock();
            call.complete(outcome);
            calls.remove(&key);
        }
        trace!("call complete, entry removed");

        call.wait().await
    }
}

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{instrument, trace};

/// One in-flight execution. The caller that created it stores the outcome
/// exactly once; every other caller only reads.
struct Call<V, E> {
    done: Condvar,
    outcome: Mutex<Option<Result<V, E>>>,
}

impl<V, E> Call<V, E>
where
    V: Clone,
    E: Clone,
{
    fn new() -> Call<V, E> {
        Call {
            done: Condvar::new(),
            outcome: Mutex::new(None),
        }
    }

    fn complete(&self, outcome: Result<V, E>) {
        let mut slot = self.outcome.lock();
        *slot = Some(outcome);
        drop(slot);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<V, E> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut slot);
        }
    }
}

/// Group deduplicates concurrent invocations of an expensive operation by
/// key: at most one operation runs per key at a time, and every caller that
/// overlapped with it receives that one execution's outcome.
///
/// Cloning a `Group` yields another handle to the same registry, so one
/// group can be shared across the threads of an embedding system.
pub struct Group<K, V, E> {
    calls: Arc<Mutex<HashMap<K, Arc<Call<V, E>>>>>,
}

impl<K, V, E> Clone for Group<K, V, E> {
    fn clone(&self) -> Self {
        Group {
            calls: self.calls.clone(),
        }
    }
}

impl<K, V, E> fmt::Debug for Group<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group").finish()
    }
}

impl<K, V, E> Default for Group<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> Group<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    pub fn new() -> Group<K, V, E> {
        Group {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// work executes `operation` and returns its outcome, making sure that
    /// only one execution is in flight for `key` at a time. A caller that
    /// arrives while a call for the same key is already running does not
    /// invoke `operation`; it blocks until that call finishes and receives
    /// the same outcome, success or failure. A failed call does not poison
    /// the key: the next non-overlapping caller executes afresh.
    ///
    /// The winning caller runs `operation` on its own thread with the
    /// registry unlocked, so calls for other keys proceed independently.
    /// Calling `work` for the same key from inside `operation` deadlocks.
    #[instrument(level = "trace", skip_all)]
    pub fn work<F>(&self, key: K, operation: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let call = {
            let mut calls = self.calls.lock();
            match calls.get(&key) {
                Some(existing) => {
                    let existing = Arc::clone(existing);
                    drop(calls);
                    trace!("joining in-flight call");
                    return existing.wait();
                }
                None => {
                    let call = Arc::new(Call::new());
                    calls.insert(key.clone(), Arc::clone(&call));
                    call
                }
            }
        };

        trace!("executing");
        let outcome = operation();

        // Store, wake and remove under the registry lock: a caller arriving
        // now either joins this call and is woken immediately, or finds the
        // key absent and starts a fresh execution.
        let mut calls = self.calls.lock();
        call.complete(outcome);
        calls.remove(&key);
        drop(calls);
        trace!("call complete, entry removed");

        call.wait()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    use tracing_test::traced_test;

    use super::Group;

    #[test]
    #[traced_test]
    fn work_returns_value() {
        let group: Group<&str, i32, String> = Group::new();
        let res = group.work("test_key", || Ok(0));
        assert_eq!(res, Ok(0));
    }

    #[test]
    #[traced_test]
    fn work_error_does_not_poison_key() {
        let group: Group<&str, i32, String> = Group::new();
        let res = group.work("test_key", || Err("backend unavailable".to_owned()));
        assert_eq!(res, Err("backend unavailable".to_owned()));
        let res = group.work("test_key", || Ok(0));
        assert_eq!(res, Ok(0));
    }

    #[test]
    #[traced_test]
    fn herd_executes_once() {
        let group: Group<&str, i32, String> = Group::new();
        let executions = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(100));

        let start = Instant::now();
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let group = group.clone();
                let executions = Arc::clone(&executions);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    group.work("X", || {
                        executions.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(150));
                        Ok(42)
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(42));
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        // a hundred serialized executions would take fifteen seconds
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[traced_test]
    fn joiners_share_failure() {
        let group: Group<&str, i32, String> = Group::new();
        let (started_tx, started_rx) = mpsc::channel();

        let leader = {
            let group = group.clone();
            thread::spawn(move || {
                group.work("Y", || {
                    started_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(150));
                    Err("backend unavailable".to_owned())
                })
            })
        };
        started_rx.recv().unwrap();

        let joiners: Vec<_> = (0..10)
            .map(|_| {
                let group = group.clone();
                thread::spawn(move || group.work("Y", || Ok(1)))
            })
            .collect();

        assert_eq!(
            leader.join().unwrap(),
            Err("backend unavailable".to_owned())
        );
        for joiner in joiners {
            assert_eq!(
                joiner.join().unwrap(),
                Err("backend unavailable".to_owned())
            );
        }

        // the failed call is gone from the registry, the key starts clean
        assert_eq!(group.work("Y", || Ok(7)), Ok(7));
    }

    #[test]
    #[traced_test]
    fn keys_do_not_serialize() {
        let group: Group<&str, i32, String> = Group::new();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();

        let slow = {
            let group = group.clone();
            thread::spawn(move || {
                group.work("k1", || {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(1)
                })
            })
        };

        // k1 is mid-execution and must not delay k2
        started_rx.recv().unwrap();
        assert_eq!(group.work("k2", || Ok(2)), Ok(2));

        release_tx.send(()).unwrap();
        assert_eq!(slow.join().unwrap(), Ok(1));
    }

    #[test]
    #[traced_test]
    fn reexecutes_after_completion() {
        let group: Group<&str, usize, String> = Group::new();
        let executions = AtomicUsize::new(0);

        for round in 1..=3 {
            let res = group.work("X", || {
                Ok(executions.fetch_add(1, Ordering::SeqCst) + 1)
            });
            assert_eq!(res, Ok(round));
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }
}

//! Thread-based coordinator.
//!
//! The registry is a single [`Mutex`]-protected map from key to call record, held only for lookup,
//! insert and remove. Each record carries its own mutex and [`Condvar`]; the leader stores the
//! result once and broadcasts, so every joiner reads a fully written result.

use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::PoisonError;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::stats::{FlightStats, StatsSnapshot};
use super::{CallError, Outcome, PanicPolicy, WorkResult, panic_message};
use crate::config::GroupConfig;
use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::sync::{Arc, Condvar, Mutex, lock};

/// Lifecycle of one call record. Never leaves `Completed`.
enum CallState<V, E> {
    Pending,
    Running,
    Completed(WorkResult<V, E>),
}

/// One in-flight execution and everyone waiting on it.
struct Call<V, E> {
    generation: u64,
    state: Mutex<CallState<V, E>>,
    done: Condvar,
    /// Callers that joined after the leader. Only incremented under the registry lock.
    dups: AtomicUsize,
}

impl<V, E> Call<V, E> {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            state: Mutex::new(CallState::Pending),
            done: Condvar::new(),
            dups: AtomicUsize::new(0),
        }
    }

    fn start(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, CallState::Pending) {
            *state = CallState::Running;
        }
    }

    /// Store the result and release every waiter. Only the first completion wins.
    fn complete(&self, result: WorkResult<V, E>) {
        let mut state = lock(&self.state);
        if matches!(*state, CallState::Completed(_)) {
            return;
        }
        *state = CallState::Completed(result);
        drop(state);
        self.done.notify_all();
    }

    /// Final once the record has left the registry.
    fn is_shared(&self) -> bool {
        self.dups.load(Ordering::Acquire) > 0
    }
}

impl<V: Clone, E: Clone> Call<V, E> {
    fn peek(&self) -> Option<WorkResult<V, E>> {
        match &*lock(&self.state) {
            CallState::Completed(result) => Some(result.clone()),
            CallState::Pending | CallState::Running => None,
        }
    }

    fn wait(&self) -> WorkResult<V, E> {
        let mut state = lock(&self.state);
        loop {
            if let CallState::Completed(result) = &*state {
                return result.clone();
            }
            state = self
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<WorkResult<V, E>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };

        let mut state = lock(&self.state);
        loop {
            if let CallState::Completed(result) = &*state {
                return Some(result.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .done
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }
}

struct Inner<K, V, E> {
    calls: Mutex<FxHashMap<K, Arc<Call<V, E>>>>,
    next_generation: AtomicU64,
    config: GroupConfig,
    stats: FlightStats,
}

impl<K: Eq + Hash, V, E> Inner<K, V, E> {
    /// Remove `call` from the registry unless it was already replaced by a newer generation.
    fn unregister(&self, key: &K, call: &Call<V, E>) {
        let mut calls = lock(&self.calls);
        if calls
            .get(key)
            .is_some_and(|current| current.generation == call.generation)
        {
            calls.remove(key);
        }
    }
}

enum Role<V, E> {
    Leader(Arc<Call<V, E>>),
    Joiner(Arc<Call<V, E>>),
}

/// Owns the right to complete a call record.
///
/// If dropped before [`run`](Self::run) finishes (for example, a detached executor thread that
/// never started), the record is completed with [`CallError::Abandoned`] and unregistered.
struct Leader<K, V, E>
where
    K: Eq + Hash + Debug,
{
    inner: Arc<Inner<K, V, E>>,
    key: K,
    call: Option<Arc<Call<V, E>>>,
}

impl<K, V, E> Leader<K, V, E>
where
    K: Eq + Hash + Debug,
{
    fn finish(&mut self, result: WorkResult<V, E>) {
        if let Some(call) = self.call.take() {
            self.inner.unregister(&self.key, &call);
            call.complete(result);
        }
    }
}

impl<K, V, E> Leader<K, V, E>
where
    K: Eq + Hash + Debug,
    V: Clone,
    E: Clone,
{
    /// Run the work function and publish its result. Returns the panic payload, if any, so the
    /// caller can decide whether to resume it.
    fn run<F>(mut self, f: F) -> (WorkResult<V, E>, Option<Box<dyn Any + Send>>)
    where
        F: FnOnce() -> Result<V, E>,
    {
        let Some(call) = self.call.as_ref() else {
            return (Err(CallError::Abandoned), None);
        };
        call.start();
        debug!(
            group = %self.inner.config.name,
            key = ?self.key,
            generation = call.generation,
            "executing work function"
        );

        let (result, payload) = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => (Ok(value), None),
            Ok(Err(e)) => (Err(CallError::Work(e)), None),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                warn!(
                    group = %self.inner.config.name,
                    key = ?self.key,
                    panic = %msg,
                    "work function panicked"
                );
                self.inner.stats.record_panic();
                (Err(CallError::Panicked(msg)), Some(payload))
            }
        };

        self.finish(result.clone());
        debug!(group = %self.inner.config.name, key = ?self.key, "call completed");
        (result, payload)
    }
}

impl<K, V, E> Drop for Leader<K, V, E>
where
    K: Eq + Hash + Debug,
{
    fn drop(&mut self) {
        if self.call.is_some() {
            warn!(
                group = %self.inner.config.name,
                key = ?self.key,
                "in-flight call abandoned"
            );
            self.inner.stats.record_panic();
            self.finish(Err(CallError::Abandoned));
        }
    }
}

/// Duplicate call suppression for threads.
///
/// Cloning is cheap; clones share the same registry.
///
/// A work function may call back into the same group with a *different* key. Calling back with
/// its own key deadlocks, since it would wait for itself.
pub struct Group<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for Group<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash, V, E> Default for Group<K, V, E> {
    fn default() -> Self {
        Self::with_config(GroupConfig::default())
    }
}

impl<K: Eq + Hash, V, E> Group<K, V, E> {
    /// Create a group with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a group with the given configuration.
    #[must_use]
    pub fn with_config(config: GroupConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                calls: Mutex::new(FxHashMap::default()),
                next_generation: AtomicU64::new(0),
                config,
                stats: FlightStats::default(),
            }),
        }
    }

    /// The configuration this group was built with.
    #[must_use]
    pub fn config(&self) -> &GroupConfig {
        &self.inner.config
    }

    /// Number of keys with an execution currently registered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.calls).len()
    }

    /// Whether `key` has an execution currently registered.
    #[must_use]
    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.inner.calls).contains_key(key)
    }

    /// Counters accumulated since the group was created.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl<K, V, E> Group<K, V, E>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
    E: Clone,
{
    fn acquire(&self, key: &K) -> Role<V, E> {
        let mut calls = lock(&self.inner.calls);
        if let Some(call) = calls.get(key) {
            call.dups.fetch_add(1, Ordering::AcqRel);
            let call = Arc::clone(call);
            drop(calls);

            self.inner.stats.record_join();
            debug!(
                group = %self.inner.config.name,
                ?key,
                generation = call.generation,
                "joining in-flight call"
            );
            return Role::Joiner(call);
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let call = Arc::new(Call::new(generation));
        calls.insert(key.clone(), Arc::clone(&call));
        drop(calls);

        self.inner.stats.record_execution();
        Role::Leader(call)
    }

    fn leader(&self, key: K, call: &Arc<Call<V, E>>) -> Leader<K, V, E> {
        Leader {
            inner: Arc::clone(&self.inner),
            key,
            call: Some(Arc::clone(call)),
        }
    }

    /// Execute `f` for `key`, making sure only one execution is in flight for that key at a time.
    ///
    /// If an execution is already in flight, this blocks until it completes and returns its
    /// result with `shared = true`. Otherwise `f` runs on the calling thread, and `shared` reports
    /// whether anyone joined before it finished.
    ///
    /// # Panics
    ///
    /// Re-raises the work function's panic in this caller if it was the leader and the group's
    /// [`PanicPolicy`] is [`Resume`](PanicPolicy::Resume). Joiners are released first.
    pub fn call<F>(&self, key: K, f: F) -> Outcome<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        match self.acquire(&key) {
            Role::Joiner(call) => Outcome {
                result: call.wait(),
                shared: true,
            },
            Role::Leader(call) => {
                let (result, payload) = self.leader(key, &call).run(f);
                if let Some(payload) = payload {
                    if self.inner.config.panic_policy == PanicPolicy::Resume {
                        panic::resume_unwind(payload);
                    }
                }
                Outcome {
                    result,
                    shared: call.is_shared(),
                }
            }
        }
    }

    /// Like [`call`](Self::call), but returns immediately with a receiver for the outcome.
    ///
    /// If this caller is the leader, `f` runs on a new thread named after the group. The panic
    /// policy does not apply there: the receiver gets [`CallError::Panicked`]. If the thread cannot
    /// be spawned, every receiver gets [`CallError::Abandoned`].
    pub fn call_detached<F>(&self, key: K, f: F) -> FlightReceiver<V, E>
    where
        F: FnOnce() -> Result<V, E> + Send + 'static,
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        match self.acquire(&key) {
            Role::Joiner(call) => FlightReceiver {
                call,
                leader: false,
            },
            Role::Leader(call) => {
                let leader = self.leader(key, &call);
                let spawned = std::thread::Builder::new()
                    .name(self.inner.config.name.replace('\0', ""))
                    .spawn(move || {
                        leader.run(f);
                    });
                if let Err(e) = spawned {
                    warn!(
                        group = %self.inner.config.name,
                        error = %e,
                        "failed to spawn executor thread"
                    );
                }
                FlightReceiver { call, leader: true }
            }
        }
    }

    /// Forget `key`. Callers already attached still receive the in-flight result, but the next
    /// call for `key` starts a new execution.
    ///
    /// Returns whether an entry was removed.
    pub fn forget(&self, key: &K) -> bool {
        let removed = lock(&self.inner.calls).remove(key).is_some();
        if removed {
            self.inner.stats.record_forget();
            debug!(group = %self.inner.config.name, ?key, "forgot in-flight call");
        }
        removed
    }

    /// Forget `key` only if nobody has joined its in-flight execution.
    ///
    /// Returns `true` if the key is now absent and `false` if the entry is shared and was kept.
    pub fn forget_unshared(&self, key: &K) -> bool {
        let mut calls = lock(&self.inner.calls);
        match calls.get(key).map(|call| call.is_shared()) {
            None => true,
            Some(true) => false,
            Some(false) => {
                calls.remove(key);
                drop(calls);
                self.inner.stats.record_forget();
                debug!(group = %self.inner.config.name, ?key, "forgot unshared call");
                true
            }
        }
    }
}

/// Receiver for the outcome of [`Group::call_detached`].
///
/// Each caller gets its own receiver. Giving up on one (for example after
/// [`wait_timeout`](Self::wait_timeout)) does not affect the execution or other receivers.
pub struct FlightReceiver<V, E> {
    call: Arc<Call<V, E>>,
    leader: bool,
}

impl<V: Clone, E: Clone> FlightReceiver<V, E> {
    fn outcome(&self, result: WorkResult<V, E>) -> Outcome<V, E> {
        Outcome {
            result,
            shared: !self.leader || self.call.is_shared(),
        }
    }

    /// Whether this receiver belongs to the caller that started the execution.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Block until the outcome is available.
    pub fn wait(&self) -> Outcome<V, E> {
        self.outcome(self.call.wait())
    }

    /// Block for at most `timeout`. Returns `None` if the execution is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<V, E>> {
        self.call
            .wait_timeout(timeout)
            .map(|result| self.outcome(result))
    }

    /// The outcome, if the execution already finished.
    pub fn try_outcome(&self) -> Option<Outcome<V, E>> {
        self.call.peek().map(|result| self.outcome(result))
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn leader_dropped_before_running_abandons_the_call() {
        let group: Group<&str, u8, &str> = Group::new();
        let Role::Leader(call) = group.acquire(&"k") else {
            panic!("first caller must lead");
        };
        let Role::Joiner(joined) = group.acquire(&"k") else {
            panic!("second caller must join");
        };

        drop(group.leader("k", &call));

        assert_eq!(call.peek(), Some(Err(CallError::Abandoned)));
        assert_eq!(joined.wait(), Err(CallError::Abandoned));
        assert!(joined.is_shared());
        assert!(!group.is_in_flight(&"k"));
        assert_eq!(group.stats().panics, 1);

        let outcome = group.call("k", || Ok(3));
        assert_eq!(outcome.result, Ok(3));
        assert!(!outcome.shared);
    }
}

//! Future-based coordinator.
//!
//! Each in-flight execution is a [`Shared`] future stored in an [`scc::HashMap`]. Every caller for
//! the key gets its own clone, so any of them may drive it and each receives its own copy of the
//! result. Leaders hand the work to a tokio task, so dropping any caller's future never cancels
//! the execution.

use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, ready};

use futures::FutureExt as _;
use futures::future::Shared;
use scc::hash_map::Entry;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::stats::{FlightStats, StatsSnapshot};
use super::{CallError, Outcome, PanicPolicy, WorkResult, panic_message};
use crate::config::GroupConfig;

type SharedFut<V, E> = Shared<Pin<Box<dyn Future<Output = WorkResult<V, E>> + Send>>>;

/// Registry slot for one in-flight execution.
struct InFlight<V, E> {
    generation: u64,
    fut: SharedFut<V, E>,
    dups: Arc<AtomicUsize>,
}

struct Inner<K, V, E> {
    map: scc::HashMap<K, InFlight<V, E>>,
    next_generation: AtomicU64,
    config: GroupConfig,
    stats: FlightStats,
}

impl<K: Eq + Hash, V, E> Inner<K, V, E> {
    fn unregister(&self, key: &K, generation: u64) {
        drop(
            self.map
                .remove_if_sync(key, |flight| flight.generation == generation),
        );
    }
}

/// Duplicate call suppression for futures.
///
/// Cloning is cheap; clones share the same registry.
pub struct AsyncGroup<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for AsyncGroup<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash, V, E> Default for AsyncGroup<K, V, E> {
    fn default() -> Self {
        Self::with_config(GroupConfig::default())
    }
}

impl<K: Eq + Hash, V, E> AsyncGroup<K, V, E> {
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
                map: scc::HashMap::default(),
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
        self.inner.map.len()
    }

    /// Whether `key` has an execution currently registered.
    #[must_use]
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inner.map.read_sync(key, |_, _| ()).is_some()
    }

    /// Counters accumulated since the group was created.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl<K, V, E> AsyncGroup<K, V, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Execute the future produced by `factory` for `key`, making sure only one execution is in
    /// flight for that key at a time.
    ///
    /// `factory` is only invoked if this caller starts the execution. If another execution is
    /// already in flight, this awaits it and returns its result with `shared = true`.
    ///
    /// Inside a tokio runtime, a leader's work is driven by a spawned task, so dropping the
    /// returned future (a timeout, an aborted task) only stops *this* caller from waiting: the
    /// execution still runs to completion and leaves the registry. Outside a runtime the work is
    /// driven by whoever awaits it.
    ///
    /// # Panics
    ///
    /// Re-raises the work's panic (as a `String` payload) in this caller if it was the leader and
    /// the group's [`PanicPolicy`] is [`Resume`](PanicPolicy::Resume).
    pub async fn call<F, Fut>(&self, key: K, factory: F) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let runtime = Handle::try_current().ok();
        let entry = self.inner.map.entry_async(key).await;
        let resume_panics = self.inner.config.panic_policy == PanicPolicy::Resume;
        let (handle, is_leader) = self.register(entry, factory, resume_panics);
        if is_leader {
            if let Some(runtime) = runtime {
                drop(runtime.spawn(handle.fut.clone()));
            }
        }
        handle.await
    }

    /// Like [`call`](Self::call), but returns immediately with a handle for the outcome.
    ///
    /// If this caller starts the execution, it is driven by a task spawned on the current tokio
    /// runtime, so it runs to completion even if no handle is ever awaited. The panic policy does
    /// not apply to the leader's handle: it resolves to [`CallError::Panicked`].
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime. Nothing is registered in that case.
    pub fn spawn<F, Fut>(&self, key: K, factory: F) -> FlightHandle<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => panic!("AsyncGroup::spawn must be called within a tokio runtime: {e}"),
        };
        let entry = self.inner.map.entry_sync(key);
        let (handle, is_leader) = self.register(entry, factory, false);
        if is_leader {
            drop(runtime.spawn(handle.fut.clone()));
        }
        handle
    }

    /// Join the in-flight execution in `entry`, or start a new one.
    fn register<F, Fut>(
        &self,
        entry: Entry<'_, K, InFlight<V, E>>,
        factory: F,
        resume_panics: bool,
    ) -> (FlightHandle<V, E>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        match entry {
            Entry::Occupied(occ) => {
                let flight = occ.get();
                flight.dups.fetch_add(1, Ordering::AcqRel);
                let handle = FlightHandle {
                    fut: flight.fut.clone(),
                    leader: None,
                };
                debug!(
                    group = %self.inner.config.name,
                    key = ?occ.key(),
                    generation = flight.generation,
                    "joining in-flight call"
                );
                drop(occ);

                self.inner.stats.record_join();
                (handle, false)
            }
            Entry::Vacant(vac) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let dups = Arc::new(AtomicUsize::new(0));
                let fut = Self::make_shared(
                    Arc::downgrade(&self.inner),
                    vac.key().clone(),
                    generation,
                    factory,
                );
                vac.insert_entry(InFlight {
                    generation,
                    fut: fut.clone(),
                    dups: Arc::clone(&dups),
                });

                self.inner.stats.record_execution();
                let handle = FlightHandle {
                    fut,
                    leader: Some(Leadership {
                        dups,
                        resume_panics,
                    }),
                };
                (handle, true)
            }
        }
    }

    /// Wrap the work in `catch_unwind` and registry cleanup, producing a [`Shared`] future.
    ///
    /// The entry is removed before the result becomes visible to any subscriber. `factory` runs on
    /// first poll, never while the registry bucket is locked.
    fn make_shared<F, Fut>(
        inner: Weak<Inner<K, V, E>>,
        key: K,
        generation: u64,
        factory: F,
    ) -> SharedFut<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let fut = async move {
            if let Some(inner) = inner.upgrade() {
                debug!(
                    group = %inner.config.name,
                    ?key,
                    generation,
                    "executing work future"
                );
            }

            let caught = AssertUnwindSafe(async move { factory().await })
                .catch_unwind()
                .await;

            let inner = inner.upgrade();
            let result = match caught {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CallError::Work(e)),
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    if let Some(inner) = &inner {
                        warn!(
                            group = %inner.config.name,
                            ?key,
                            panic = %msg,
                            "work future panicked"
                        );
                        inner.stats.record_panic();
                    }
                    Err(CallError::Panicked(msg))
                }
            };

            if let Some(inner) = &inner {
                inner.unregister(&key, generation);
                debug!(group = %inner.config.name, ?key, "call completed");
            }
            result
        };

        let boxed: Pin<Box<dyn Future<Output = WorkResult<V, E>> + Send>> = Box::pin(fut);
        boxed.shared()
    }

    /// Forget `key`. Callers already attached still receive the in-flight result, but the next
    /// call for `key` starts a new execution.
    ///
    /// Returns whether an entry was removed.
    pub fn forget(&self, key: &K) -> bool {
        let removed = self.inner.map.remove_sync(key).is_some();
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
        match self.inner.map.entry_sync(key.clone()) {
            Entry::Vacant(_) => true,
            Entry::Occupied(occ) => {
                if occ.get().dups.load(Ordering::Acquire) > 0 {
                    return false;
                }
                drop(occ.remove_entry());
                self.inner.stats.record_forget();
                debug!(group = %self.inner.config.name, ?key, "forgot unshared call");
                true
            }
        }
    }
}

struct Leadership {
    dups: Arc<AtomicUsize>,
    resume_panics: bool,
}

/// A subscription to one in-flight execution. Resolves to that execution's [`Outcome`].
///
/// Every caller gets its own handle. Dropping a handle does not cancel the execution.
#[must_use = "a FlightHandle does nothing unless polled"]
pub struct FlightHandle<V, E> {
    fut: SharedFut<V, E>,
    leader: Option<Leadership>,
}

impl<V, E> FlightHandle<V, E> {
    /// Whether this handle belongs to the caller that started the execution.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader.is_some()
    }
}

impl<V: Clone, E: Clone> Future for FlightHandle<V, E> {
    type Output = Outcome<V, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.fut).poll(cx));

        let shared = match &this.leader {
            None => true,
            Some(leadership) => {
                if leadership.resume_panics {
                    if let Err(CallError::Panicked(msg)) = &result {
                        panic::resume_unwind(Box::new(msg.to_string()));
                    }
                }
                // The entry left the registry before the result was published, so no more
                // joiners can arrive.
                leadership.dups.load(Ordering::Acquire) > 0
            }
        };

        Poll::Ready(Outcome { result, shared })
    }
}

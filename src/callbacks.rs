//! Callback plumbing: serialized executors, request ids, and thread-safe
//! callback collections.
//!
//! Session actors never run upper-layer code inline. Every registered
//! callback carries an [`Executor`]; `invoke` schedules the call there and
//! returns immediately. One executor runs its jobs strictly in submission
//! order, which is what serializes deliveries per recipient.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

// ═══════════════════════════════════════════════════════════
// Executor
// ═══════════════════════════════════════════════════════════

/// Where callback invocations run.
#[derive(Clone)]
pub struct Executor {
    inner: ExecutorInner,
}

#[derive(Clone)]
enum ExecutorInner {
    /// Jobs run in order on a dedicated worker task.
    Worker(mpsc::UnboundedSender<Job>),
    /// Jobs run inline on the scheduling thread. Test use only.
    Immediate,
}

impl Executor {
    /// Spawn a worker task on the current tokio runtime. Jobs execute in
    /// submission order.
    pub fn spawned() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self {
            inner: ExecutorInner::Worker(tx),
        }
    }

    /// Run jobs inline. Deterministic, for tests.
    pub fn immediate() -> Self {
        Self {
            inner: ExecutorInner::Immediate,
        }
    }

    /// Schedule one job. A job submitted after the runtime shut the worker
    /// down is silently dropped.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        match &self.inner {
            ExecutorInner::Worker(tx) => {
                let _ = tx.send(Box::new(job));
            }
            ExecutorInner::Immediate => job(),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner {
            ExecutorInner::Worker(_) => write!(f, "Executor::Worker"),
            ExecutorInner::Immediate => write!(f, "Executor::Immediate"),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// IdGenerator
// ═══════════════════════════════════════════════════════════

/// Monotonic 64-bit id source with release-and-reuse-on-drain: ids grow
/// while any are outstanding, and the counter rewinds to zero once the
/// outstanding set empties.
#[derive(Debug, Default)]
pub struct IdGenerator {
    state: Mutex<IdState>,
}

#[derive(Debug, Default)]
struct IdState {
    next: u64,
    outstanding: HashSet<u64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next id.
    pub fn issue(&self) -> u64 {
        let mut state = self.state.lock().expect("id lock poisoned");
        let id = state.next;
        state.next += 1;
        state.outstanding.insert(id);
        id
    }

    /// Return an id. When the last outstanding id is released the counter
    /// resets.
    pub fn release(&self, id: u64) {
        let mut state = self.state.lock().expect("id lock poisoned");
        state.outstanding.remove(&id);
        if state.outstanding.is_empty() {
            state.next = 0;
        }
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().expect("id lock poisoned").outstanding.len()
    }
}

// ═══════════════════════════════════════════════════════════
// CallbackSet
// ═══════════════════════════════════════════════════════════

struct CallbackEntry<C: ?Sized> {
    id: u64,
    callback: Arc<C>,
    executor: Executor,
}

/// A set of `(callback, executor)` pairs addressed by registration id.
///
/// `invoke` schedules the closure on every entry's executor without
/// waiting for completion; `len` is weakly consistent by design. Several
/// sets can share one [`IdGenerator`] so their registration ids never
/// collide.
pub struct CallbackSet<C: ?Sized> {
    entries: Mutex<Vec<CallbackEntry<C>>>,
    ids: Arc<IdGenerator>,
}

impl<C: ?Sized> Default for CallbackSet<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized> CallbackSet<C> {
    pub fn new() -> Self {
        Self::with_generator(Arc::new(IdGenerator::new()))
    }

    /// A set drawing ids from a shared generator.
    pub fn with_generator(ids: Arc<IdGenerator>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            ids,
        }
    }

    pub fn register(&self, callback: Arc<C>, executor: Executor) -> u64 {
        let id = self.ids.issue();
        self.entries
            .lock()
            .expect("callback lock poisoned")
            .push(CallbackEntry {
                id,
                callback,
                executor,
            });
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        let mut entries = self.entries.lock().expect("callback lock poisoned");
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() < before;
        if removed {
            self.ids.release(id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("callback lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration, returning the callbacks for a final
    /// notification.
    pub fn drain(&self) -> Vec<(Arc<C>, Executor)> {
        let mut entries = self.entries.lock().expect("callback lock poisoned");
        let drained: Vec<_> = entries
            .drain(..)
            .map(|entry| {
                self.ids.release(entry.id);
                (entry.callback, entry.executor)
            })
            .collect();
        drained
    }
}

impl<C: ?Sized + Send + Sync + 'static> CallbackSet<C> {
    /// Schedule `f(callback)` on every entry's executor. The entry list is
    /// snapshotted first so no subscriber code ever runs under the set's
    /// lock.
    pub fn invoke<F>(&self, f: F)
    where
        F: Fn(&C) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let targets: Vec<(Arc<C>, Executor)> = {
            let entries = self.entries.lock().expect("callback lock poisoned");
            entries
                .iter()
                .map(|entry| (entry.callback.clone(), entry.executor.clone()))
                .collect()
        };
        for (callback, executor) in targets {
            let f = f.clone();
            executor.execute(move || f(&callback));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── IdGenerator ──────────────────────────────────────────

    #[test]
    fn ids_are_monotonic_while_outstanding() {
        let ids = IdGenerator::new();
        assert_eq!(ids.issue(), 0);
        assert_eq!(ids.issue(), 1);
        assert_eq!(ids.issue(), 2);
    }

    #[test]
    fn counter_resets_when_drained() {
        let ids = IdGenerator::new();
        let a = ids.issue();
        let b = ids.issue();
        ids.release(a);
        // Still outstanding — no reset yet.
        assert_eq!(ids.issue(), 2);
        ids.release(b);
        ids.release(2);
        assert_eq!(ids.outstanding(), 0);
        assert_eq!(ids.issue(), 0);
    }

    #[test]
    fn release_of_unknown_id_is_harmless() {
        let ids = IdGenerator::new();
        let a = ids.issue();
        ids.release(99);
        assert_eq!(ids.outstanding(), 1);
        ids.release(a);
        assert_eq!(ids.outstanding(), 0);
    }

    // ── Executor ─────────────────────────────────────────────

    #[test]
    fn immediate_executor_runs_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let executor = Executor::immediate();
        let c = counter.clone();
        executor.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawned_executor_preserves_submission_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let executor = Executor::spawned();
        for i in 0..20 {
            let log = log.clone();
            executor.execute(move || log.lock().unwrap().push(i));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    // ── CallbackSet ──────────────────────────────────────────

    trait Probe: Send + Sync {
        fn fire(&self);
    }

    struct CountingProbe(AtomicUsize);

    impl Probe for CountingProbe {
        fn fire(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn invoke_reaches_every_callback() {
        let set: CallbackSet<dyn Probe> = CallbackSet::new();
        let a = Arc::new(CountingProbe(AtomicUsize::new(0)));
        let b = Arc::new(CountingProbe(AtomicUsize::new(0)));
        set.register(a.clone(), Executor::immediate());
        set.register(b.clone(), Executor::immediate());

        set.invoke(|probe| probe.fire());

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_stops_delivery() {
        let set: CallbackSet<dyn Probe> = CallbackSet::new();
        let probe = Arc::new(CountingProbe(AtomicUsize::new(0)));
        let id = set.register(probe.clone(), Executor::immediate());

        assert!(set.unregister(id));
        assert!(!set.unregister(id));
        set.invoke(|p| p.fire());
        assert_eq!(probe.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drain_empties_the_set() {
        let set: CallbackSet<dyn Probe> = CallbackSet::new();
        set.register(
            Arc::new(CountingProbe(AtomicUsize::new(0))),
            Executor::immediate(),
        );
        set.register(
            Arc::new(CountingProbe(AtomicUsize::new(0))),
            Executor::immediate(),
        );
        assert_eq!(set.drain().len(), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn shared_generator_keeps_ids_unique_across_sets() {
        let ids = Arc::new(IdGenerator::new());
        let a: CallbackSet<dyn Probe> = CallbackSet::with_generator(ids.clone());
        let b: CallbackSet<dyn Probe> = CallbackSet::with_generator(ids);

        let from_a = a.register(
            Arc::new(CountingProbe(AtomicUsize::new(0))),
            Executor::immediate(),
        );
        let from_b = b.register(
            Arc::new(CountingProbe(AtomicUsize::new(0))),
            Executor::immediate(),
        );
        assert_ne!(from_a, from_b);
    }

    #[test]
    fn registration_ids_are_reused_after_drain() {
        let set: CallbackSet<dyn Probe> = CallbackSet::new();
        let first = set.register(
            Arc::new(CountingProbe(AtomicUsize::new(0))),
            Executor::immediate(),
        );
        set.unregister(first);
        let second = set.register(
            Arc::new(CountingProbe(AtomicUsize::new(0))),
            Executor::immediate(),
        );
        assert_eq!(first, second);
    }
}

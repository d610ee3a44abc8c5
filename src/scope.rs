//! Scope handles and per-lifetime instance storage.
//!
//! A [`Scope`] is the caller-owned identity and cancellation token for
//! `PerContext` services: every resolve against the same scope shares one
//! bucket of slots, and cancelling the scope triggers the bucket's teardown.
//!
//! Storage is split per lifetime: singletons live in a fixed slot array
//! indexed by their dense id; per-context buckets live in a sharded
//! concurrent map keyed by scope id and are pooled across scope lifecycles.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::cleanup::CleanupGraph;
use crate::constructor::AnyService;

/// Caller-owned identity and cancellation token for `PerContext` services.
///
/// Create one scope per unit of work (a request, a job, a session), pass it
/// to [`ServiceLocator::get`], and call [`cancel`](Scope::cancel) when the
/// work ends. Cancellation releases the scope's bucket: its cleanup actions
/// run in dependency order on the per-context worker.
///
/// Clones share identity; the scope ends when `cancel` is called or every
/// clone (including any held inside resolved services) has been dropped.
///
/// [`ServiceLocator::get`]: crate::ServiceLocator::get
///
/// # Examples
///
/// ```rust
/// use lifescope::Scope;
///
/// let scope = Scope::new();
/// assert!(!scope.is_cancelled());
///
/// scope.cancel();
/// assert!(scope.is_cancelled());
/// ```
#[derive(Clone)]
pub struct Scope {
    shared: Arc<ScopeShared>,
}

struct ScopeShared {
    id: u64,
    cancelled: AtomicBool,
    // Dropping the sender is the completion signal; receivers observe the
    // disconnect. No message is ever sent.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

impl Scope {
    /// Creates a scope with a process-unique identity.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let (done_tx, done_rx) = bounded(0);
        Self {
            shared: Arc::new(ScopeShared {
                id: COUNTER.fetch_add(1, Ordering::Relaxed),
                cancelled: AtomicBool::new(false),
                done_tx: Mutex::new(Some(done_tx)),
                done_rx,
            }),
        }
    }

    /// The raw identity value. Stable for the scope's lifetime.
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Ends the scope. Idempotent.
    ///
    /// Resolves against a cancelled scope fail with `ScopeCancelled`;
    /// the scope's cleanup actions run on the per-context worker.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        drop(self.shared.done_tx.lock().take());
    }

    /// Whether [`cancel`](Scope::cancel) has been called.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// A receiver that becomes ready when the scope ends.
    pub(crate) fn done_receiver(&self) -> Receiver<()> {
        self.shared.done_rx.clone()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Scope {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Scope {}

impl std::hash::Hash for Scope {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope-{}", self.id())
    }
}

/// A mutex-protected cell holding at most one constructed value per
/// (scope, id). The lock is held across first construction so concurrent
/// resolvers observe exactly one instance.
pub(crate) struct Slot {
    value: Mutex<Option<AnyService>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<AnyService>> {
        self.value.lock()
    }
}

fn slot_array(len: usize) -> Box<[Slot]> {
    (0..len).map(|_| Slot::new()).collect()
}

/// Singleton storage: one slot per singleton dense id.
pub(crate) struct SingletonStore {
    slots: Box<[Slot]>,
}

impl SingletonStore {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            slots: slot_array(len),
        }
    }

    #[inline]
    pub(crate) fn slot(&self, id: u32) -> &Slot {
        &self.slots[id as usize]
    }
}

/// One scope's worth of `PerContext` state: a slot per per-context dense id
/// plus this scope's own copy of the cleanup graph.
pub(crate) struct ContextBucket {
    slots: Box<[Slot]>,
    pub(crate) cleanup: Mutex<CleanupGraph>,
}

impl ContextBucket {
    fn new(slot_count: usize, cleanup: CleanupGraph) -> Self {
        Self {
            slots: slot_array(slot_count),
            cleanup: Mutex::new(cleanup),
        }
    }

    #[inline]
    pub(crate) fn slot(&self, id: u32) -> &Slot {
        &self.slots[id as usize]
    }
}

/// Sharded storage of live per-context buckets, keyed by scope id.
pub(crate) struct ContextInstances {
    // 16 shards: enough to keep concurrent scopes off each other's locks
    // without paying DashMap's default num_cpus * 4 allocation.
    buckets: DashMap<u64, Arc<ContextBucket>, RandomState>,
    pool: Mutex<Vec<ContextBucket>>,
    slot_count: usize,
    prototype: CleanupGraph,
}

impl ContextInstances {
    pub(crate) fn new(slot_count: usize, prototype: CleanupGraph) -> Self {
        Self {
            buckets: DashMap::with_capacity_and_hasher_and_shard_amount(
                0,
                RandomState::new(),
                16,
            ),
            pool: Mutex::new(Vec::new()),
            slot_count,
            prototype,
        }
    }

    /// Returns the bucket for `scope_id`, allocating (or reusing a pooled
    /// bucket) on the first visit. The boolean is `true` exactly once per
    /// scope lifecycle.
    pub(crate) fn get_or_create(&self, scope_id: u64) -> (Arc<ContextBucket>, bool) {
        if let Some(bucket) = self.buckets.get(&scope_id) {
            return (bucket.clone(), false);
        }

        match self.buckets.entry(scope_id) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let bucket = Arc::new(self.take_bucket());
                entry.insert(bucket.clone());
                (bucket, true)
            }
        }
    }

    /// Atomically detaches the bucket for a finished scope.
    pub(crate) fn remove(&self, scope_id: u64) -> Option<Arc<ContextBucket>> {
        self.buckets.remove(&scope_id).map(|(_, bucket)| bucket)
    }

    /// Returns a torn-down bucket to the pool once no resolver still holds
    /// it; otherwise the bucket is dropped.
    pub(crate) fn recycle(&self, bucket: Arc<ContextBucket>) {
        if let Ok(mut bucket) = Arc::try_unwrap(bucket) {
            for slot in bucket.slots.iter_mut() {
                *slot.value.get_mut() = None;
            }
            bucket.cleanup.get_mut().zero_out();
            self.pool.lock().push(bucket);
        }
    }

    fn take_bucket(&self) -> ContextBucket {
        match self.pool.lock().pop() {
            Some(bucket) => bucket,
            None => ContextBucket::new(self.slot_count, self.prototype.fresh_copy()),
        }
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    pub(crate) fn pooled_count(&self) -> usize {
        self.pool.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::Lifetime;

    #[test]
    fn test_scope_ids_unique() {
        let a = Scope::new();
        let b = Scope::new();
        let c = Scope::new();
        assert_ne!(a.id(), b.id());
        assert_ne!(b.id(), c.id());
    }

    #[test]
    fn test_scope_cancel_is_idempotent() {
        let scope = Scope::new();
        let done = scope.done_receiver();
        assert!(done.try_recv().is_err());

        scope.cancel();
        scope.cancel();
        assert!(scope.is_cancelled());
        // Disconnected receiver reports completion immediately.
        assert_eq!(
            done.recv_timeout(std::time::Duration::from_millis(100)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn test_scope_clone_shares_identity() {
        let scope = Scope::new();
        let twin = scope.clone();
        assert_eq!(scope, twin);
        twin.cancel();
        assert!(scope.is_cancelled());
    }

    #[test]
    fn test_scope_display() {
        let scope = Scope::new();
        assert!(scope.to_string().starts_with("scope-"));
    }

    #[test]
    fn test_bucket_first_visit_once() {
        let store = ContextInstances::new(2, CleanupGraph::empty(Lifetime::PerContext));
        let (first_bucket, first) = store.get_or_create(7);
        assert!(first);
        let (again, first) = store.get_or_create(7);
        assert!(!first);
        assert!(Arc::ptr_eq(&first_bucket, &again));
        assert_eq!(store.live_count(), 1);
    }

    #[test]
    fn test_bucket_recycle_resets_slots() {
        let store = ContextInstances::new(1, CleanupGraph::empty(Lifetime::PerContext));
        let (bucket, _) = store.get_or_create(1);
        *bucket.slot(0).lock() = Some(Arc::new(42u32) as AnyService);

        let detached = store.remove(1).expect("bucket was live");
        drop(bucket);
        store.recycle(detached);
        assert_eq!(store.pooled_count(), 1);

        // The pooled bucket comes back empty.
        let (bucket, first) = store.get_or_create(2);
        assert!(first);
        assert!(bucket.slot(0).lock().is_none());
        assert_eq!(store.pooled_count(), 0);
    }

    #[test]
    fn test_recycle_skips_shared_bucket() {
        let store = ContextInstances::new(1, CleanupGraph::empty(Lifetime::PerContext));
        let (bucket, _) = store.get_or_create(1);
        let detached = store.remove(1).expect("bucket was live");
        // A resolver still holds `bucket`, so the pool must not take it.
        store.recycle(detached);
        assert_eq!(store.pooled_count(), 0);
        drop(bucket);
    }
}

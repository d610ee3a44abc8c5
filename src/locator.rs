//! The frozen service locator and its resolution engine.
//!
//! A [`ServiceLocator`] is produced by [`Container::build`] and never
//! changes afterwards: the record arena, the dependency links, and the dense
//! slot ids are all read-only, so steady-state resolution takes no locks
//! beyond the slot being filled.
//!
//! Resolution dispatches on the record's lifetime:
//!
//! - **Transient** - build and hand the instance to the caller;
//! - **PerContext** - memoize in the scope's bucket slot; the first visit
//!   registers the scope with the per-context cleanup worker;
//! - **Singleton** - memoize in the singleton slot array and publish the
//!   cleanup action to the singleton worker.
//!
//! [`Container::build`]: crate::Container::build

use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use ahash::RandomState;
use crossbeam_channel::{bounded, never, unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::analysis::BuildPlan;
use crate::cleanup::{
    per_context_cleanup_worker, singleton_cleanup_worker, CleanupGraph, CleanupNodeUpdate,
    ScopeWatch,
};
use crate::constructor::{AnyService, CallError, Cleanup, ConstructorKind, DepValue, ErasedCall};
use crate::container::ContainerOptions;
use crate::error::{
    capture_backtrace, panic_message, ResolveError, ResolveFault, Result, SharedError,
};
use crate::key::{Service, ServiceKey};
use crate::lifetime::Lifetime;
use crate::scope::{ContextInstances, Scope, SingletonStore};

/// A dependency of a frozen record: the caller scope or another record by
/// arena index. Decorator self-dependencies point one chain link down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DepRef {
    Scope,
    Record(usize),
}

/// Immutable metadata for one registered constructor after analysis.
pub(crate) struct LocatorRecord {
    pub(crate) key: ServiceKey,
    pub(crate) lifetime: Lifetime,
    pub(crate) kind: ConstructorKind,
    /// Arena index; also the cleanup-graph node key.
    pub(crate) index: usize,
    /// Dense per-role id. Only meaningful for shared lifetimes: singleton
    /// records index the singleton slot array, per-context records index
    /// each bucket's slot array.
    pub(crate) slot: u32,
    pub(crate) dependencies: Vec<DepRef>,
    #[allow(dead_code)]
    pub(crate) depends_on_context: bool,
    pub(crate) call: ErasedCall,
}

/// Thread-safe, frozen resolution engine with lifetime-scoped memoization.
///
/// Obtained from [`Container::build`]; usually shared behind an [`Arc`].
/// Dropping the locator (or calling [`shutdown`](ServiceLocator::shutdown))
/// drains per-context cleanups and runs the singleton teardown graph once.
///
/// [`Container::build`]: crate::Container::build
pub struct ServiceLocator {
    records: Vec<Arc<LocatorRecord>>,
    entry: HashMap<ServiceKey, usize, RandomState>,
    singletons: SingletonStore,
    per_context: Arc<ContextInstances>,
    singleton_updates: Sender<CleanupNodeUpdate>,
    watches: Sender<ScopeWatch>,
    shutdown: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    deferred: RwLock<Option<ResolveError>>,
}

impl ServiceLocator {
    pub(crate) fn start(plan: BuildPlan, options: &ContainerOptions) -> Self {
        let singleton_graph = CleanupGraph::build(&plan.records, Lifetime::Singleton);
        let per_context_graph = CleanupGraph::build(&plan.records, Lifetime::PerContext);
        let per_context = Arc::new(ContextInstances::new(
            plan.per_context_count,
            per_context_graph,
        ));

        let external = options
            .shutdown_scope
            .as_ref()
            .map(|scope| scope.done_receiver())
            .unwrap_or_else(never);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (update_tx, update_rx) = unbounded();
        let (watch_tx, watch_rx) = unbounded();
        let (drained_tx, drained_rx) = bounded::<()>(0);

        let mut workers = Vec::with_capacity(options.cleanup_workers + 1);
        for worker in 0..options.cleanup_workers {
            let shutdown_rx = shutdown_rx.clone();
            let external = external.clone();
            let watch_rx = watch_rx.clone();
            let store = Arc::clone(&per_context);
            let drained_tx = drained_tx.clone();
            let tick = options.cleanup_tick;
            workers.push(
                std::thread::Builder::new()
                    .name(format!("lifescope-context-cleanup-{worker}"))
                    .spawn(move || {
                        per_context_cleanup_worker(
                            shutdown_rx,
                            external,
                            watch_rx,
                            store,
                            tick,
                            drained_tx,
                        )
                    })
                    .expect("failed to spawn per-context cleanup worker"),
            );
        }
        drop(drained_tx);

        workers.push(
            std::thread::Builder::new()
                .name("lifescope-singleton-cleanup".into())
                .spawn(move || {
                    singleton_cleanup_worker(
                        shutdown_rx,
                        external,
                        update_rx,
                        singleton_graph,
                        drained_rx,
                    )
                })
                .expect("failed to spawn singleton cleanup worker"),
        );

        debug!(
            services = plan.records.len(),
            singletons = plan.singleton_count,
            per_context = plan.per_context_count,
            "service locator started"
        );

        Self {
            records: plan.records,
            entry: plan.entry,
            singletons: SingletonStore::new(plan.singleton_count),
            per_context,
            singleton_updates: update_tx,
            watches: watch_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            workers: Mutex::new(workers),
            deferred: RwLock::new(None),
        }
    }

    /// Resolves `T`, building its transitive dependencies as needed.
    ///
    /// `scope` carries the identity for `PerContext` services; `Singleton`
    /// and `Transient` roots accept `None`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use lifescope::{Container, Lifetime, Scope};
    ///
    /// struct Greeter(&'static str);
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let locator = Container::new()
    ///     .add(Lifetime::PerContext, || Greeter("hello"))
    ///     .build()?;
    ///
    /// let scope = Scope::new();
    /// let greeter = locator.get::<Greeter>(Some(&scope))?;
    /// assert_eq!(greeter.0, "hello");
    /// # Ok(())
    /// # }
    /// ```
    pub fn get<T: Service>(&self, scope: Option<&Scope>) -> Result<Arc<T>> {
        let key = ServiceKey::of::<T>();
        trace!(service = key.type_name(), "resolving service");

        let Some(&index) = self.entry.get(&key) else {
            return Err(ResolveError::NotFound {
                type_name: key.type_name(),
            });
        };

        let record = Arc::clone(&self.records[index]);
        let value = self.resolve_index(index, scope)?;
        match value.downcast::<T>() {
            Ok(typed) => Ok(typed),
            Err(_) => Err(builder_error(&record, ResolveFault::UnexpectedShape)),
        }
    }

    /// Records a deferred `ConstructorNotFound` for `T`, observable through
    /// [`err`](ServiceLocator::err). Useful to validate availability up
    /// front without constructing anything.
    pub fn ensure_available<T: Service>(&self) {
        let key = ServiceKey::of::<T>();
        if !self.entry.contains_key(&key) {
            *self.deferred.write() = Some(ResolveError::NotFound {
                type_name: key.type_name(),
            });
        }
    }

    /// The last error recorded by [`ensure_available`].
    ///
    /// [`ensure_available`]: ServiceLocator::ensure_available
    pub fn err(&self) -> Option<ResolveError> {
        self.deferred.read().clone()
    }

    /// A typed resolve handle bound to this locator. Checks availability
    /// immediately (see [`ensure_available`](ServiceLocator::ensure_available)).
    pub fn prepare<T: Service>(self: &Arc<Self>) -> Lazy<T> {
        self.ensure_available::<T>();
        Lazy {
            locator: Arc::clone(self),
            _marker: PhantomData,
        }
    }

    /// Triggers teardown and waits for it to finish: per-context workers
    /// drain every live scope, then the singleton graph runs once.
    /// Idempotent; also invoked on drop.
    pub fn shutdown(&self) {
        drop(self.shutdown.lock().take());
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn resolve_index(&self, index: usize, scope: Option<&Scope>) -> Result<AnyService> {
        let record = Arc::clone(&self.records[index]);
        match record.lifetime {
            Lifetime::Transient => {
                // Cleanup-bearing constructors are rejected for Transient at
                // registration, so there is never an action to lose here.
                let (value, _) = self.construct(&record, scope)?;
                Ok(value)
            }
            Lifetime::PerContext => self.resolve_per_context(&record, scope),
            Lifetime::Singleton => self.resolve_singleton(&record, scope),
        }
    }

    fn resolve_singleton(
        &self,
        record: &LocatorRecord,
        scope: Option<&Scope>,
    ) -> Result<AnyService> {
        let slot = self.singletons.slot(record.slot);
        let mut guard = slot.lock();
        if let Some(value) = guard.as_ref() {
            return Ok(Arc::clone(value));
        }

        let (value, cleanup) = self.construct(record, scope)?;
        if let Some(action) = cleanup {
            // The worker owns the singleton graph; failure here means the
            // locator is already shutting down and the action runs in the
            // drain instead of leaking.
            let _ = self.singleton_updates.send(CleanupNodeUpdate {
                record: record.index,
                action,
            });
        }
        *guard = Some(Arc::clone(&value));
        Ok(value)
    }

    fn resolve_per_context(
        &self,
        record: &LocatorRecord,
        scope: Option<&Scope>,
    ) -> Result<AnyService> {
        let Some(scope) = scope else {
            return Err(builder_error(record, ResolveFault::NilScope));
        };
        if scope.is_cancelled() {
            return Err(builder_error(record, ResolveFault::ScopeCancelled));
        }

        let (bucket, first_visit) = self.per_context.get_or_create(scope.id());
        if first_visit {
            let _ = self.watches.send(ScopeWatch {
                scope_id: scope.id(),
                done: scope.done_receiver(),
                bucket: Arc::clone(&bucket),
            });
        }

        let slot = bucket.slot(record.slot);
        let mut guard = slot.lock();
        if let Some(value) = guard.as_ref() {
            return Ok(Arc::clone(value));
        }

        let (value, cleanup) = self.construct(record, Some(scope))?;
        if let Some(action) = cleanup {
            bucket.cleanup.lock().update(record.index, action);
        }
        *guard = Some(Arc::clone(&value));
        Ok(value)
    }

    /// Builds the dependency vector in declared order, invokes the erased
    /// constructor, and translates failures (including recovered panics)
    /// into typed errors.
    fn construct(
        &self,
        record: &LocatorRecord,
        scope: Option<&Scope>,
    ) -> Result<(AnyService, Option<Cleanup>)> {
        let mut deps = Vec::with_capacity(record.dependencies.len());
        for dep in &record.dependencies {
            match dep {
                DepRef::Scope => {
                    let Some(scope) = scope else {
                        return Err(builder_error(record, ResolveFault::NilScope));
                    };
                    deps.push(DepValue::Scope(scope.clone()));
                }
                DepRef::Record(index) => {
                    deps.push(DepValue::Service(self.resolve_index(*index, scope)?));
                }
            }
        }

        match catch_unwind(AssertUnwindSafe(|| (record.call)(&deps))) {
            Ok(Ok(built)) => Ok(built),
            Ok(Err(CallError::Failed(err))) => Err(builder_error(
                record,
                ResolveFault::Constructor(SharedError::new(err)),
            )),
            Ok(Err(CallError::Shape)) => {
                Err(builder_error(record, ResolveFault::UnexpectedShape))
            }
            Err(payload) => Err(builder_error(
                record,
                ResolveFault::ConstructorPanic {
                    message: panic_message(payload.as_ref()),
                    backtrace: capture_backtrace(),
                },
            )),
        }
    }
}

impl Drop for ServiceLocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ServiceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLocator")
            .field("services", &self.records.len())
            .finish()
    }
}

fn builder_error(record: &LocatorRecord, cause: ResolveFault) -> ResolveError {
    ResolveError::Builder {
        lifetime: record.lifetime,
        type_name: record.key.type_name(),
        cause,
    }
}

/// A typed resolve handle created by [`ServiceLocator::prepare`].
pub struct Lazy<T: Service> {
    locator: Arc<ServiceLocator>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Service> Lazy<T> {
    /// Resolves `T` through the bound locator.
    pub fn get(&self, scope: Option<&Scope>) -> Result<Arc<T>> {
        self.locator.get::<T>(scope)
    }
}

impl<T: Service> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            locator: Arc::clone(&self.locator),
            _marker: PhantomData,
        }
    }
}

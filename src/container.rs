//! Constructor registration.
//!
//! The [`Container`] is the mutable half of the system: constructors are
//! added under a chosen [`Lifetime`], decorators accumulate per type, and
//! [`build`](Container::build) freezes everything into a
//! [`ServiceLocator`](crate::ServiceLocator).
//!
//! Mutators are fluent and error-latching: the first fault turns every
//! later mutator into a no-op, and `build` reports it. Containers are cheap
//! handles; clones share the same registry and may be mutated from several
//! threads (the registry serializes them internally).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::analysis::{self, PendingRecord, Role};
use crate::constructor::{ConstructorKind, ConstructorSpec, IntoConstructor};
use crate::error::{BuildError, RegistrationFault};
use crate::key::{DepKey, Service, ServiceKey};
use crate::lifetime::Lifetime;
use crate::locator::ServiceLocator;
use crate::scope::Scope;

const SINGLETON_TEMPLATES: &str =
    "Fn(Arc<Dep>, ...) -> T | Result<T, E> | Result<(T, Cleanup), E>";
const PER_CONTEXT_TEMPLATES: &str =
    "Fn([Scope,] Arc<Dep>, ...) -> T | Result<T, E> | Result<(T, Cleanup), E>";
const TRANSIENT_TEMPLATES: &str = "Fn([Scope,] Arc<Dep>, ...) -> T | Result<T, E>";

fn templates_for(lifetime: Lifetime) -> &'static str {
    match lifetime {
        Lifetime::Singleton => SINGLETON_TEMPLATES,
        Lifetime::PerContext => PER_CONTEXT_TEMPLATES,
        Lifetime::Transient => TRANSIENT_TEMPLATES,
    }
}

/// Options recognized at materialization.
///
/// # Examples
///
/// ```rust
/// use lifescope::{Container, ContainerOptions, Scope};
/// use std::time::Duration;
///
/// let shutdown = Scope::new();
/// let container = Container::with_options(
///     ContainerOptions::new()
///         .shutdown_scope(shutdown.clone())
///         .cleanup_tick(Duration::from_millis(100)),
/// );
/// # let _ = container;
/// ```
#[derive(Clone)]
pub struct ContainerOptions {
    pub(crate) shutdown_scope: Option<Scope>,
    pub(crate) silence_scope_analysis: bool,
    pub(crate) cleanup_tick: Duration,
    pub(crate) cleanup_workers: usize,
}

impl ContainerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// External cancellation carrier; cancelling it triggers singleton
    /// teardown just like [`ServiceLocator::shutdown`].
    ///
    /// [`ServiceLocator::shutdown`]: crate::ServiceLocator::shutdown
    pub fn shutdown_scope(mut self, scope: Scope) -> Self {
        self.shutdown_scope = Some(scope);
        self
    }

    /// Suppresses the "should be a Singleton" advisory and the
    /// scope-hierarchy errors of the build-time analyzer.
    pub fn silence_scope_analysis(mut self) -> Self {
        self.silence_scope_analysis = true;
        self
    }

    /// Period of the per-context worker's fairness tick.
    pub fn cleanup_tick(mut self, tick: Duration) -> Self {
        self.cleanup_tick = tick;
        self
    }

    /// Size of the per-context cleanup worker pool. At least one.
    pub fn cleanup_workers(mut self, workers: usize) -> Self {
        self.cleanup_workers = workers.max(1);
        self
    }
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            shutdown_scope: None,
            silence_scope_analysis: false,
            cleanup_tick: Duration::from_secs(1),
            cleanup_workers: 2,
        }
    }
}

#[derive(Default)]
struct Registry {
    base: HashMap<ServiceKey, PendingRecord>,
    decorators: HashMap<ServiceKey, Vec<PendingRecord>>,
    next_seq: u64,
}

/// Mutable constructor registry with error latching.
///
/// # Examples
///
/// ```rust
/// use lifescope::{Container, Lifetime};
/// use std::sync::Arc;
///
/// struct Config { debug: bool }
/// struct Api { config: Arc<Config> }
///
/// # fn main() -> Result<(), lifescope::BuildError> {
/// let locator = Container::new()
///     .add(Lifetime::Singleton, || Config { debug: true })
///     .add(Lifetime::Singleton, |config: Arc<Config>| Api { config })
///     .build()?;
/// # drop(locator);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    registry: Mutex<Registry>,
    err: Mutex<Option<BuildError>>,
    options: ContainerOptions,
}

impl Container {
    /// Creates an empty container with default options.
    pub fn new() -> Self {
        Self::with_options(ContainerOptions::default())
    }

    /// Creates an empty container with the given options.
    pub fn with_options(options: ContainerOptions) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                registry: Mutex::new(Registry::default()),
                err: Mutex::new(None),
                options,
            }),
        }
    }

    /// Registers a base constructor for its output type under `lifetime`.
    ///
    /// At most one base constructor may exist per output type; a second
    /// registration latches [`RegistrationFault::Duplicate`].
    pub fn add<T, M, C>(&self, lifetime: Lifetime, ctor: C) -> Container
    where
        T: Service,
        C: IntoConstructor<T, M>,
    {
        self.register(lifetime, ctor.into_constructor(), Role::Service)
    }

    /// Registers a decorator for its output type.
    ///
    /// The constructor must take `Arc<T>` of the decorated type among its
    /// inputs; that input resolves to the previously registered decorator
    /// (or the base constructor for the first decorator). Resolving `T`
    /// yields the topmost decorator.
    pub fn decorate<T, M, C>(&self, lifetime: Lifetime, ctor: C) -> Container
    where
        T: Service,
        C: IntoConstructor<T, M>,
    {
        self.register(lifetime, ctor.into_constructor(), Role::Decorator)
    }

    /// Replaces the base constructor for the new constructor's output type,
    /// keeping the previously registered lifetime.
    ///
    /// Latches [`RegistrationFault::NotFound`] when no base constructor
    /// exists for that type.
    pub fn replace<T, M, C>(&self, ctor: C) -> Container
    where
        T: Service,
        C: IntoConstructor<T, M>,
    {
        if self.inner.err.lock().is_some() {
            return self.clone();
        }

        let spec = ctor.into_constructor();
        let previous = self.inner.registry.lock().base.remove(&spec.key);
        match previous {
            Some(old) => self.register(old.lifetime, spec, Role::Service),
            None => {
                self.latch(BuildError::BadConstructor {
                    constructor_type: spec.fn_type,
                    cause: RegistrationFault::NotFound(spec.key.type_name()),
                });
                self.clone()
            }
        }
    }

    /// The currently latched registration error, if any.
    pub fn error(&self) -> Option<BuildError> {
        self.inner.err.lock().clone()
    }

    /// Freezes the registry, runs the dependency analyzer, and starts the
    /// locator (including its cleanup workers).
    ///
    /// Returns the first latched registration error, or the first analyzer
    /// failure. The container itself stays usable for further `build`s.
    pub fn build(&self) -> Result<ServiceLocator, BuildError> {
        if let Some(err) = self.inner.err.lock().clone() {
            return Err(err);
        }

        let pending = {
            let registry = self.inner.registry.lock();
            let mut pending: Vec<PendingRecord> = registry.base.values().cloned().collect();
            for decorators in registry.decorators.values() {
                pending.extend(decorators.iter().cloned());
            }
            pending.sort_by_key(|record| record.seq);
            pending
        };

        let plan = analysis::analyze(pending, self.inner.options.silence_scope_analysis)?;
        Ok(ServiceLocator::start(plan, &self.inner.options))
    }

    fn register(&self, lifetime: Lifetime, spec: ConstructorSpec, role: Role) -> Container {
        if self.inner.err.lock().is_some() {
            return self.clone();
        }

        if let Err(fault) = validate(lifetime, &spec, role) {
            self.latch(BuildError::BadConstructor {
                constructor_type: spec.fn_type,
                cause: fault,
            });
            return self.clone();
        }

        let mut registry = self.inner.registry.lock();
        let seq = registry.next_seq;
        registry.next_seq += 1;

        let record = PendingRecord {
            lifetime,
            role,
            seq,
            spec,
        };

        trace!(
            service = record.spec.key.type_name(),
            %lifetime,
            decorator = matches!(role, Role::Decorator),
            "registering constructor"
        );

        match role {
            Role::Service => {
                if registry.base.contains_key(&record.spec.key) {
                    let fn_type = record.spec.fn_type;
                    drop(registry);
                    self.latch(BuildError::BadConstructor {
                        constructor_type: fn_type,
                        cause: RegistrationFault::Duplicate,
                    });
                    return self.clone();
                }
                registry.base.insert(record.spec.key, record);
            }
            Role::Decorator => {
                registry
                    .decorators
                    .entry(record.spec.key)
                    .or_default()
                    .push(record);
            }
        }

        self.clone()
    }

    fn latch(&self, err: BuildError) {
        let mut latched = self.inner.err.lock();
        if latched.is_none() {
            *latched = Some(err);
        }
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("Container")
            .field("services", &registry.base.len())
            .field("decorated_types", &registry.decorators.len())
            .field("has_error", &self.inner.err.lock().is_some())
            .finish()
    }
}

fn validate(
    lifetime: Lifetime,
    spec: &ConstructorSpec,
    role: Role,
) -> Result<(), RegistrationFault> {
    if spec.kind == ConstructorKind::WithErrorAndCleanup && lifetime == Lifetime::Transient {
        return Err(RegistrationFault::Template {
            lifetime,
            expected: templates_for(lifetime),
        });
    }

    for (position, dep) in spec.dependencies.iter().enumerate() {
        if *dep == DepKey::Scope && (position != 0 || lifetime == Lifetime::Singleton) {
            return Err(RegistrationFault::Template {
                lifetime,
                expected: templates_for(lifetime),
            });
        }
    }

    if matches!(role, Role::Decorator)
        && !spec.dependencies.contains(&DepKey::Service(spec.key))
    {
        return Err(RegistrationFault::DecoratorBadDependency);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constructor::Cleanup;

    struct NameService(&'static str);
    struct Hero {
        name: &'static str,
    }

    #[test]
    fn test_duplicate_constructor_latches() {
        let container = Container::new()
            .add(Lifetime::Singleton, || NameService("Bob"))
            .add(Lifetime::PerContext, || NameService("Alice"));

        let err = container.build().expect_err("duplicate must fail");
        assert!(matches!(
            err.registration_fault(),
            Some(RegistrationFault::Duplicate)
        ));
    }

    #[test]
    fn test_error_latching_short_circuits_later_mutators() {
        let container = Container::new()
            .add::<NameService, _, _>(Lifetime::Transient, || -> Result<
                (NameService, Cleanup),
                std::io::Error,
            > {
                Ok((NameService("Bob"), Cleanup::new(|| {})))
            })
            .add(Lifetime::Singleton, || Hero { name: "Bob" });

        // The first error wins; the later (valid) add was a no-op.
        let err = container.build().expect_err("latched error reported");
        assert!(matches!(
            err.registration_fault(),
            Some(RegistrationFault::Template { lifetime: Lifetime::Transient, .. })
        ));

        // The same Hero registration is valid on a clean container.
        let locator = Container::new()
            .add(Lifetime::Singleton, || Hero { name: "Bob" })
            .build()
            .expect("valid registration builds");
        drop(locator);
    }

    #[test]
    fn test_transient_with_cleanup_rejected() {
        let container = Container::new().add::<NameService, _, _>(
            Lifetime::Transient,
            || -> Result<(NameService, Cleanup), std::io::Error> {
                Ok((NameService("Bob"), Cleanup::new(|| {})))
            },
        );
        assert!(container.error().is_some());
    }

    #[test]
    fn test_scope_argument_under_singleton_rejected() {
        let container = Container::new().add(Lifetime::Singleton, |_scope: Scope| Hero {
            name: "Bob",
        });
        let err = container.error().expect("singleton cannot take a scope");
        assert!(matches!(
            err.registration_fault(),
            Some(RegistrationFault::Template { lifetime: Lifetime::Singleton, .. })
        ));
    }

    #[test]
    fn test_scope_argument_not_first_rejected() {
        let container = Container::new().add(
            Lifetime::PerContext,
            |_name: std::sync::Arc<NameService>, _scope: Scope| Hero { name: "Bob" },
        );
        assert!(container.error().is_some());
    }

    #[test]
    fn test_decorator_without_self_dependency_rejected() {
        let container = Container::new()
            .add(Lifetime::Singleton, || Hero { name: "Bob" })
            .decorate(Lifetime::Singleton, |name: std::sync::Arc<NameService>| Hero {
                name: name.0,
            });
        let err = container.error().expect("decorator must consume a Hero");
        assert!(matches!(
            err.registration_fault(),
            Some(RegistrationFault::DecoratorBadDependency)
        ));
    }

    #[test]
    fn test_replace_keeps_old_lifetime() {
        let container = Container::new()
            .add(Lifetime::Singleton, || NameService("Bob"))
            .replace(|| NameService("Alice"));
        assert!(container.error().is_none());
        let locator = container.build().expect("replace keeps registry valid");
        let name = locator.get::<NameService>(None).expect("resolves");
        assert_eq!(name.0, "Alice");
    }

    #[test]
    fn test_replace_missing_base_latches() {
        let container = Container::new().replace(|| NameService("Alice"));
        let err = container.error().expect("nothing to replace");
        assert!(matches!(
            err.registration_fault(),
            Some(RegistrationFault::NotFound(_))
        ));
    }

    #[test]
    fn test_concurrent_mutators_are_serialized() {
        let container = Container::new();
        let mut handles = Vec::new();
        for worker in 0..8 {
            let container = container.clone();
            handles.push(std::thread::spawn(move || {
                if worker % 2 == 0 {
                    container.add(Lifetime::Singleton, || NameService("Bob"));
                } else {
                    container.add(Lifetime::Singleton, || Hero { name: "Bob" });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Exactly one registration per type survived; the rest latched
        // Duplicate. Whichever error won the race is reported by build.
        let err = container.build().expect_err("duplicates raced");
        assert!(matches!(
            err.registration_fault(),
            Some(RegistrationFault::Duplicate)
        ));
    }
}

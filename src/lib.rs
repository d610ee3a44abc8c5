//! # lifescope - a service locator with explicit lifetime scopes
//!
//! A dependency-injection service locator for long-running servers that
//! share expensive objects across threads and tear them down cleanly on
//! cancellation.
//!
//! ## Features
//!
//! - 🧭 **Three lifetimes** - `Transient` (always new), `PerContext` (one
//!   per caller [`Scope`]), `Singleton` (one per locator)
//! - 🔒 **Type-safe registration** - constructors are plain functions; their
//!   inputs and output type are captured at compile time
//! - 🧪 **Static analysis** - missing dependencies, cycles, and scope
//!   hierarchy violations are rejected when the container materializes
//! - 🧵 **Thread-safe resolution** - fine-grained slot locks guarantee
//!   at-most-one construction per (scope, service)
//! - 🧹 **Dependency-ordered cleanup** - consumers are torn down strictly
//!   before the resources they were built from, driven by worker threads
//!   with fair progress across many scopes
//! - 🎁 **Decorators** - wrap a registered service; resolution yields the
//!   outermost layer
//! - 📊 **Observable** - structured `tracing` events, with optional
//!   subscriber helpers behind the `logging` feature
//!
//! ## Quick start
//!
//! ```rust
//! use lifescope::{Container, Lifetime, Scope};
//! use std::sync::Arc;
//!
//! struct Database {
//!     url: String,
//! }
//!
//! struct UserService {
//!     db: Arc<Database>,
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let locator = Container::new()
//!     .add(Lifetime::Singleton, || Database {
//!         url: "postgres://localhost".into(),
//!     })
//!     .add(Lifetime::PerContext, |db: Arc<Database>| UserService { db })
//!     .build()?;
//!
//! // One scope per request / job / session.
//! let scope = Scope::new();
//! let users = locator.get::<UserService>(Some(&scope))?;
//! assert_eq!(users.db.url, "postgres://localhost");
//!
//! // Same scope, same instance.
//! let again = locator.get::<UserService>(Some(&scope))?;
//! assert!(Arc::ptr_eq(&users, &again));
//!
//! scope.cancel();
//! # Ok(())
//! # }
//! ```
//!
//! ## Constructor shapes
//!
//! A constructor's inputs are `Arc<Dep>` for registered services, with an
//! optional leading [`Scope`] for `PerContext`/`Transient` services. Its
//! output is one of:
//!
//! | output | lifetimes |
//! |---|---|
//! | `T` | all |
//! | `Result<T, E>` | all |
//! | `Result<(T, Cleanup), E>` | `Singleton`, `PerContext` |
//!
//! ```rust
//! use lifescope::{Cleanup, Container, Lifetime, Scope};
//! use std::convert::Infallible;
//!
//! struct Conn {
//!     scope_id: u64,
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let locator = Container::new()
//!     .add::<Conn, _, _>(Lifetime::PerContext, |scope: Scope| -> Result<(Conn, Cleanup), Infallible> {
//!         let conn = Conn { scope_id: scope.id() };
//!         Ok((conn, Cleanup::new(|| { /* release the connection */ })))
//!     })
//!     .build()?;
//!
//! let scope = Scope::new();
//! let conn = locator.get::<Conn>(Some(&scope))?;
//! assert_eq!(conn.scope_id, scope.id());
//! scope.cancel(); // the cleanup runs on the per-context worker
//! # Ok(())
//! # }
//! ```
//!
//! ## Teardown
//!
//! Cancelling a [`Scope`] releases its per-context instances; cleanup
//! actions run dependents-first on a worker pool, so one slow or immortal
//! scope cannot starve the rest. Singleton cleanups run exactly once when
//! [`ServiceLocator::shutdown`] is called, when the locator is dropped, or
//! when the `shutdown_scope` given in [`ContainerOptions`] is cancelled.

mod analysis;
mod cleanup;
mod constructor;
mod container;
mod error;
mod key;
mod lifetime;
#[cfg(feature = "logging")]
pub mod logging;
mod locator;
mod scope;

pub use constructor::{
    markers, Cleanup, ConstructorKind, ConstructorSpec, Dependency, IntoConstructor,
};
pub use container::{Container, ContainerOptions};
pub use error::{
    AnalysisFault, BoxError, BuildError, RegistrationFault, ResolveError, ResolveFault, Result,
    SharedError,
};
pub use key::{DepKey, Service, ServiceKey};
pub use lifetime::Lifetime;
pub use locator::{Lazy, ServiceLocator};
pub use scope::Scope;

// Re-export for convenience: resolved services are handed out as `Arc<T>`.
pub use std::sync::Arc;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        BuildError, Cleanup, Container, ContainerOptions, Lazy, Lifetime, ResolveError, Result,
        Scope, Service, ServiceLocator,
    };
    pub use std::sync::Arc;
}

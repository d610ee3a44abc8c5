//! Error types for registration, build-time analysis, and resolution.
//!
//! Failures come in two envelopes so callers can pattern-match on the
//! wrapper or peel down the `source()` chain to the leaf cause:
//!
//! - [`BuildError`] - everything `Container::build` can report, covering
//!   faults latched during registration and faults found by the dependency
//!   analyzer.
//! - [`ResolveError`] - everything `ServiceLocator::get` can report.
//!
//! All types are `Clone` so the locator can latch an error and replay it.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::lifetime::Lifetime;

/// Boxed error produced by user constructors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for resolution operations.
pub type Result<T> = std::result::Result<T, ResolveError>;

/// A cloneable handle to a constructor-produced error.
#[derive(Debug, Clone)]
pub struct SharedError(Arc<BoxError>);

impl SharedError {
    pub(crate) fn new(err: BoxError) -> Self {
        Self(Arc::new(err))
    }

    /// The underlying error object.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.0.as_ref().as_ref()
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.inner(), f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner().source()
    }
}

/// Faults detected while a constructor is being registered.
#[derive(Debug, Clone, Error)]
pub enum RegistrationFault {
    /// A base constructor for this output type is already registered.
    #[error("a constructor for this type is already registered")]
    Duplicate,

    /// The constructor shape is not allowed under the chosen lifetime:
    /// a cleanup-bearing constructor under `Transient`, a scope parameter
    /// under `Singleton`, or a scope parameter not in the first position.
    #[error("only {expected} can be used for {lifetime}")]
    Template {
        lifetime: Lifetime,
        expected: &'static str,
    },

    /// A decorator constructor does not take the decorated type as input.
    #[error("decorator must take the type it decorates as a dependency")]
    DecoratorBadDependency,

    /// `replace` was called for a type with no base registration.
    #[error("{0} constructor not found")]
    NotFound(&'static str),
}

/// Faults found by the dependency analyzer at build time.
#[derive(Debug, Clone, Error)]
pub enum AnalysisFault {
    /// A declared dependency has no registered constructor.
    #[error("{0} constructor not found")]
    NotFound(&'static str),

    /// A decorator was registered for a type with no base constructor.
    #[error("decorator for {0} has nothing to decorate")]
    NothingToDecorate(&'static str),

    /// The dependency graph contains a cycle through `dependency`.
    #[error("{dependency} in the {type_name} constructor depends on the returned type")]
    Circular {
        type_name: &'static str,
        dependency: &'static str,
    },

    /// A longer-lived service depends on a shorter-lived one.
    #[error(
        "{required_lifetime} {required} cannot be a dependency of {dependent_lifetime} {dependent}"
    )]
    ScopeHierarchy {
        dependent: &'static str,
        dependent_lifetime: Lifetime,
        required: &'static str,
        required_lifetime: Lifetime,
    },
}

/// Errors surfaced by `Container::build`.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    /// A constructor was rejected at registration time.
    #[error("bad constructor {constructor_type}: {cause}")]
    BadConstructor {
        /// Type name of the offending constructor function.
        constructor_type: &'static str,
        #[source]
        cause: RegistrationFault,
    },

    /// The dependency analyzer rejected the frozen graph.
    #[error("cannot build {lifetime} {type_name}: {cause}")]
    Analysis {
        lifetime: Lifetime,
        type_name: &'static str,
        #[source]
        cause: AnalysisFault,
    },
}

impl BuildError {
    /// The leaf registration fault, if this is a registration error.
    pub fn registration_fault(&self) -> Option<&RegistrationFault> {
        match self {
            BuildError::BadConstructor { cause, .. } => Some(cause),
            BuildError::Analysis { .. } => None,
        }
    }

    /// The leaf analysis fault, if this is an analyzer error.
    pub fn analysis_fault(&self) -> Option<&AnalysisFault> {
        match self {
            BuildError::BadConstructor { .. } => None,
            BuildError::Analysis { cause, .. } => Some(cause),
        }
    }
}

/// Leaf causes for resolution failures.
#[derive(Debug, Clone, Error)]
pub enum ResolveFault {
    /// A `PerContext` service was resolved without a scope.
    #[error("got no scope")]
    NilScope,

    /// The supplied scope was cancelled before resolution started.
    #[error("scope is cancelled")]
    ScopeCancelled,

    /// The constructor returned an error.
    #[error("constructor returned an error: {0}")]
    Constructor(#[source] SharedError),

    /// The constructor panicked; the panic was recovered at the build
    /// boundary.
    #[error("recovered from panic: {message}")]
    ConstructorPanic {
        message: String,
        /// Captured when `RUST_BACKTRACE` enables it.
        backtrace: Option<Arc<Backtrace>>,
    },

    /// The dependency vector did not match the constructor signature.
    /// Registration keys make this unreachable in practice.
    #[error("constructor produced an unexpected result shape")]
    UnexpectedShape,
}

/// Resolve-time error envelope.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// No constructor is registered for the requested type.
    #[error("{type_name} constructor not found")]
    NotFound { type_name: &'static str },

    /// Building the service (or one of its dependencies) failed.
    #[error("cannot resolve {lifetime} {type_name}: {cause}")]
    Builder {
        lifetime: Lifetime,
        type_name: &'static str,
        #[source]
        cause: ResolveFault,
    },
}

impl ResolveError {
    /// The leaf fault, if this error wraps one.
    pub fn fault(&self) -> Option<&ResolveFault> {
        match self {
            ResolveError::NotFound { .. } => None,
            ResolveError::Builder { cause, .. } => Some(cause),
        }
    }
}

/// Renders a recovered panic payload as text.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Captures a backtrace when the runtime flag enables it.
pub(crate) fn capture_backtrace() -> Option<Arc<Backtrace>> {
    let bt = Backtrace::capture();
    match bt.status() {
        BacktraceStatus::Captured => Some(Arc::new(bt)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_build_error_display() {
        let err = BuildError::BadConstructor {
            constructor_type: "fn() -> Hero",
            cause: RegistrationFault::Duplicate,
        };
        let msg = err.to_string();
        assert!(msg.contains("bad constructor"));
        assert!(msg.contains("fn() -> Hero"));
        assert!(err.registration_fault().is_some());
        assert!(err.analysis_fault().is_none());
    }

    #[test]
    fn test_analysis_error_display() {
        let err = BuildError::Analysis {
            lifetime: Lifetime::Singleton,
            type_name: "Hero",
            cause: AnalysisFault::ScopeHierarchy {
                dependent: "Hero",
                dependent_lifetime: Lifetime::Singleton,
                required: "Timer",
                required_lifetime: Lifetime::PerContext,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("cannot build Singleton Hero"));
        assert!(msg.contains("PerContext Timer"));
    }

    #[test]
    fn test_resolve_error_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "db down");
        let err = ResolveError::Builder {
            lifetime: Lifetime::Singleton,
            type_name: "Db",
            cause: ResolveFault::Constructor(SharedError::new(Box::new(io))),
        };
        let leaf = err.source().expect("envelope has a source");
        assert!(leaf.to_string().contains("db down"));
        assert!(matches!(err.fault(), Some(ResolveFault::Constructor(_))));
    }

    #[test]
    fn test_panic_message_variants() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}

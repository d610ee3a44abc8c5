//! Constructor metadata and the typed-to-erased bridge.
//!
//! A constructor is any `Fn` whose inputs are dependencies ([`Arc<T>`] for a
//! registered service, or [`Scope`] as the first parameter) and whose output
//! matches one of three shapes:
//!
//! | output | kind |
//! |---|---|
//! | `T` | [`ConstructorKind::OnlyService`] |
//! | `Result<T, E>` | [`ConstructorKind::WithError`] |
//! | `Result<(T, Cleanup), E>` | [`ConstructorKind::WithErrorAndCleanup`] |
//!
//! [`IntoConstructor`] captures the input types and the output kind at the
//! registration call site, producing a [`ConstructorSpec`]: the declared
//! dependency list for static analysis plus a type-erased closure that
//! accepts a resolved dependency vector and returns the built value.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use crate::error::BoxError;
use crate::key::{DepKey, Service, ServiceKey};
use crate::scope::Scope;

/// Type-erased service value as stored in slots.
pub(crate) type AnyService = Arc<dyn Any + Send + Sync>;

/// The shape of a registered constructor (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructorKind {
    /// Produces one value.
    OnlyService,
    /// Produces a value or an error.
    WithError,
    /// Produces a value plus a cleanup action, or an error.
    /// Forbidden for `Transient`.
    WithErrorAndCleanup,
}

/// A teardown action produced by a cleanup-bearing constructor.
///
/// Runs at most once, in dependency order: consumers are cleaned before
/// the resources they were built from.
pub struct Cleanup(Box<dyn FnOnce() + Send + Sync>);

impl Cleanup {
    /// Wraps a teardown closure.
    pub fn new(action: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Box::new(action))
    }

    pub(crate) fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cleanup(..)")
    }
}

/// One resolved entry of a dependency vector.
#[derive(Clone)]
pub(crate) enum DepValue {
    Scope(Scope),
    Service(AnyService),
}

/// Failure modes of an erased constructor call.
pub(crate) enum CallError {
    /// The user constructor returned an error.
    Failed(BoxError),
    /// The dependency vector did not match the signature.
    Shape,
}

pub(crate) type ErasedCall = Arc<
    dyn Fn(&[DepValue]) -> std::result::Result<(AnyService, Option<Cleanup>), CallError>
        + Send
        + Sync,
>;

/// Everything the container records about one constructor before analysis.
#[derive(Clone)]
pub struct ConstructorSpec {
    pub(crate) key: ServiceKey,
    pub(crate) kind: ConstructorKind,
    pub(crate) dependencies: Vec<DepKey>,
    pub(crate) call: ErasedCall,
    pub(crate) fn_type: &'static str,
}

impl fmt::Debug for ConstructorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstructorSpec")
            .field("type", &self.key.type_name())
            .field("kind", &self.kind)
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

/// A value a constructor can take as a parameter.
///
/// Implemented for `Arc<T>` of any registered service and for [`Scope`]
/// (the context sentinel). You never implement this manually.
pub trait Dependency: Sized + Send + Sync + 'static {
    #[doc(hidden)]
    fn dep_key() -> DepKey;
    #[doc(hidden)]
    fn extract(value: &DepValue) -> Option<Self>;
}

impl<T: Service> Dependency for Arc<T> {
    #[inline]
    fn dep_key() -> DepKey {
        DepKey::Service(ServiceKey::of::<T>())
    }

    #[inline]
    fn extract(value: &DepValue) -> Option<Self> {
        match value {
            DepValue::Service(any) => any.clone().downcast::<T>().ok(),
            DepValue::Scope(_) => None,
        }
    }
}

impl Dependency for Scope {
    #[inline]
    fn dep_key() -> DepKey {
        DepKey::Scope
    }

    #[inline]
    fn extract(value: &DepValue) -> Option<Self> {
        match value {
            DepValue::Scope(scope) => Some(scope.clone()),
            DepValue::Service(_) => None,
        }
    }
}

/// Conversion from a typed constructor function into a [`ConstructorSpec`].
///
/// The `Marker` parameter distinguishes the three output shapes so the
/// blanket impls do not overlap; it is always inferred.
pub trait IntoConstructor<T: Service, Marker>: Send + Sync + 'static {
    /// Classifies the constructor and erases it.
    fn into_constructor(self) -> ConstructorSpec;
}

/// Inference markers for [`IntoConstructor`]. Not meant to be named.
pub mod markers {
    use std::marker::PhantomData;

    pub struct Plain<Args>(PhantomData<Args>);
    pub struct Fallible<Args, E>(PhantomData<(Args, E)>);
    pub struct FallibleWithCleanup<Args, E>(PhantomData<(Args, E)>);
}

macro_rules! impl_into_constructor {
    ($($arg:ident),*) => {
        impl<T, F, $($arg,)*> IntoConstructor<T, markers::Plain<($($arg,)*)>> for F
        where
            T: Service,
            F: Fn($($arg),*) -> T + Send + Sync + 'static,
            $($arg: Dependency,)*
        {
            fn into_constructor(self) -> ConstructorSpec {
                let call: ErasedCall = Arc::new(move |values: &[DepValue]| {
                    #[allow(unused_variables, unused_mut)]
                    let mut values = values.iter();
                    #[allow(non_snake_case)]
                    let ($($arg,)*) = ($(
                        $arg::extract(values.next().ok_or(CallError::Shape)?)
                            .ok_or(CallError::Shape)?,
                    )*);
                    let value = (self)($($arg),*);
                    Ok((Arc::new(value) as AnyService, None))
                });
                ConstructorSpec {
                    key: ServiceKey::of::<T>(),
                    kind: ConstructorKind::OnlyService,
                    dependencies: vec![$($arg::dep_key()),*],
                    call,
                    fn_type: type_name::<F>(),
                }
            }
        }

        impl<T, E, F, $($arg,)*> IntoConstructor<T, markers::Fallible<($($arg,)*), E>> for F
        where
            T: Service,
            E: std::error::Error + Send + Sync + 'static,
            F: Fn($($arg),*) -> std::result::Result<T, E> + Send + Sync + 'static,
            $($arg: Dependency,)*
        {
            fn into_constructor(self) -> ConstructorSpec {
                let call: ErasedCall = Arc::new(move |values: &[DepValue]| {
                    #[allow(unused_variables, unused_mut)]
                    let mut values = values.iter();
                    #[allow(non_snake_case)]
                    let ($($arg,)*) = ($(
                        $arg::extract(values.next().ok_or(CallError::Shape)?)
                            .ok_or(CallError::Shape)?,
                    )*);
                    match (self)($($arg),*) {
                        Ok(value) => Ok((Arc::new(value) as AnyService, None)),
                        Err(err) => Err(CallError::Failed(Box::new(err))),
                    }
                });
                ConstructorSpec {
                    key: ServiceKey::of::<T>(),
                    kind: ConstructorKind::WithError,
                    dependencies: vec![$($arg::dep_key()),*],
                    call,
                    fn_type: type_name::<F>(),
                }
            }
        }

        impl<T, E, F, $($arg,)*> IntoConstructor<T, markers::FallibleWithCleanup<($($arg,)*), E>> for F
        where
            T: Service,
            E: std::error::Error + Send + Sync + 'static,
            F: Fn($($arg),*) -> std::result::Result<(T, Cleanup), E> + Send + Sync + 'static,
            $($arg: Dependency,)*
        {
            fn into_constructor(self) -> ConstructorSpec {
                let call: ErasedCall = Arc::new(move |values: &[DepValue]| {
                    #[allow(unused_variables, unused_mut)]
                    let mut values = values.iter();
                    #[allow(non_snake_case)]
                    let ($($arg,)*) = ($(
                        $arg::extract(values.next().ok_or(CallError::Shape)?)
                            .ok_or(CallError::Shape)?,
                    )*);
                    match (self)($($arg),*) {
                        Ok((value, cleanup)) => {
                            Ok((Arc::new(value) as AnyService, Some(cleanup)))
                        }
                        Err(err) => Err(CallError::Failed(Box::new(err))),
                    }
                });
                ConstructorSpec {
                    key: ServiceKey::of::<T>(),
                    kind: ConstructorKind::WithErrorAndCleanup,
                    dependencies: vec![$($arg::dep_key()),*],
                    call,
                    fn_type: type_name::<F>(),
                }
            }
        }
    };
}

impl_into_constructor!();
impl_into_constructor!(A1);
impl_into_constructor!(A1, A2);
impl_into_constructor!(A1, A2, A3);
impl_into_constructor!(A1, A2, A3, A4);
impl_into_constructor!(A1, A2, A3, A4, A5);
impl_into_constructor!(A1, A2, A3, A4, A5, A6);
impl_into_constructor!(A1, A2, A3, A4, A5, A6, A7);
impl_into_constructor!(A1, A2, A3, A4, A5, A6, A7, A8);

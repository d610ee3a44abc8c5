//! Service identity keys.
//!
//! Registration and resolution are keyed by [`ServiceKey`], a `TypeId`
//! captured at the registration call site together with the type name for
//! diagnostics. This replaces runtime reflection with a compile-time token:
//! each `add::<T>` carries its produced type statically.

use std::any::{type_name, TypeId};
use std::hash::{Hash, Hasher};

/// Marker trait for types that can be registered and resolved.
///
/// Automatically implemented for every `Send + Sync + 'static` type.
/// You never implement this manually.
pub trait Service: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Service for T {}

/// Canonical identity of a produced service type.
///
/// Equality and hashing use the `TypeId` only; the type name rides along
/// for error messages and logs.
#[derive(Debug, Clone, Copy)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    /// The key for `T`, captured at compile time.
    #[inline]
    pub fn of<T: Service>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Human-readable name of the service type.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ServiceKey {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A declared constructor input: either the caller-supplied [`Scope`]
/// (the context sentinel, only valid as the first parameter) or another
/// registered service.
///
/// [`Scope`]: crate::Scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKey {
    /// The constructor takes the caller scope as its first argument.
    Scope,
    /// The constructor takes `Arc<T>` for the keyed service.
    Service(ServiceKey),
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    struct Beta;

    #[test]
    fn test_key_identity() {
        assert_eq!(ServiceKey::of::<Alpha>(), ServiceKey::of::<Alpha>());
        assert_ne!(ServiceKey::of::<Alpha>(), ServiceKey::of::<Beta>());
    }

    #[test]
    fn test_type_name() {
        assert!(ServiceKey::of::<Alpha>().type_name().ends_with("Alpha"));
    }

    #[test]
    fn test_dep_key_sentinel() {
        let dep = DepKey::Service(ServiceKey::of::<Alpha>());
        assert_ne!(dep, DepKey::Scope);
        assert_eq!(dep, DepKey::Service(ServiceKey::of::<Alpha>()));
    }
}

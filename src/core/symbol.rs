use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::core::version::{Version, is_compatible};

/// The global namespace is the empty string.
pub const GLOBAL_NAMESPACE: &str = "";

/// A shareable, type-erased symbol value.
///
/// The payload pointer stays stable for as long as any clone of the handle
/// is alive, so dependents may hold on to it until they drop the dependency
/// that granted access.
pub type SymbolPayload = Arc<dyn Any + Send + Sync>;

/// Identity of a symbol, without the version.
///
/// Two exports collide when their identities are equal, regardless of the
/// exported versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolIdentity {
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for SymbolIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}::{}", self.namespace, self.name)
        }
    }
}

/// Fully qualified symbol reference: name, namespace, and version.
///
/// Used both for exports (the version that is offered) and imports (the
/// minimum version that is required).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolKey {
    pub name: String,
    pub namespace: String,
    pub version: Version,
}

impl SymbolKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            version,
        }
    }

    /// A symbol in the global namespace.
    pub fn global(name: impl Into<String>, version: Version) -> Self {
        Self::new(name, GLOBAL_NAMESPACE, version)
    }

    pub fn identity(&self) -> SymbolIdentity {
        SymbolIdentity {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.namespace == GLOBAL_NAMESPACE
    }

    /// Whether an exported key satisfies this key when treated as a request.
    pub fn is_satisfied_by(&self, exported: &SymbolKey) -> bool {
        self.name == exported.name
            && self.namespace == exported.namespace
            && is_compatible(&exported.version, &self.version)
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity(), self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_requires_identity_and_compatibility() {
        let export = SymbolKey::global("s", Version::new(1, 2, 0));
        assert!(SymbolKey::global("s", Version::new(1, 1, 0)).is_satisfied_by(&export));
        assert!(!SymbolKey::global("s", Version::new(2, 0, 0)).is_satisfied_by(&export));
        assert!(!SymbolKey::new("s", "ns", Version::new(1, 1, 0)).is_satisfied_by(&export));
        assert!(!SymbolKey::global("t", Version::new(1, 1, 0)).is_satisfied_by(&export));
    }

    #[test]
    fn display_includes_namespace_only_when_present() {
        let global = SymbolKey::global("foo", Version::new(1, 0, 0));
        assert_eq!(global.to_string(), "foo@1.0.0");
        let scoped = SymbolKey::new("foo", "gfx", Version::new(1, 0, 0));
        assert_eq!(scoped.to_string(), "gfx::foo@1.0.0");
    }
}

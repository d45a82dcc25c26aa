// ============================================================================
// rustmodcore
// ============================================================================
//
// Modular plugin runtime: modules declare typed parameters, versioned
// symbols, namespaced imports, and dependencies on other modules; the
// runtime resolves, orders, loads, and later unloads them while enforcing
// visibility, version, and lifecycle rules.

pub mod core;
pub mod facade;
pub mod graph;
pub mod loader;
pub mod module;
pub mod params;
pub mod prelude;
pub mod registry;
pub mod task;

// Re-export main types for convenience
pub use core::{
    GLOBAL_NAMESPACE, Result, RuntimeError, SymbolIdentity, SymbolKey, SymbolPayload, Version,
};
pub use facade::{ModuleHost, Profile, RuntimeConfig};
pub use loader::{LoadingSet, ResolvedModule, register_export};
pub use module::{
    DependencyKind, ExportBuilder, ExportDescriptor, InfoHandle, InstanceData, InstanceInfo,
    InstanceState, ModuleInstance, StrongRef,
};
pub use params::{ParamAccessGroup, ParamDecl, ParamType, ParamValue};
pub use registry::{ParameterQuery, Registry};

//! Common imports for applications embedding the runtime.

pub use crate::core::{
    GLOBAL_NAMESPACE, Result, RuntimeError, SymbolIdentity, SymbolKey, SymbolPayload, Version,
};
pub use crate::facade::{ModuleHost, Profile, ROOT_INSTANCE_NAME, RuntimeConfig};
pub use crate::loader::{LoadingSet, ModuleManifest, ResolvedModule, register_export};
pub use crate::module::{
    DependencyKind, ExportBuilder, ExportDescriptor, InfoHandle, InstanceState, ModuleInstance,
    StrongRef,
};
pub use crate::params::{ParamAccessGroup, ParamDecl, ParamType, ParamValue};
pub use crate::registry::ParameterQuery;

pub mod export;
pub mod info;
pub mod instance;

pub use export::{
    DiscardGuard, DynamicSymbolExport, ExportBuilder, ExportDescriptor, ExportModifier,
    InstanceData, InstanceStateDecl, StartEventDecl, StopEventDecl, SymbolExport, SymbolLinkage,
};
pub use info::{InfoHandle, InstanceInfo, InstanceState, StrongRef};
pub use instance::ModuleInstance;

/// How a dependency or namespace edge came to exist.
///
/// Static edges are declared in the export descriptor and live exactly as
/// long as the instance. Dynamic edges are added and removed at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Static,
    Dynamic,
}

impl DependencyKind {
    pub fn is_static(self) -> bool {
        matches!(self, Self::Static)
    }
}

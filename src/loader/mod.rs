pub mod discovery;
pub mod set;

pub use discovery::{
    DEFAULT_EXPORTS_SYMBOL, ExportEntry, MODULE_MANIFEST_FILE, ModuleManifest, register_export,
    registered_exports,
};
pub use set::{LoadingSet, ResolvedModule};

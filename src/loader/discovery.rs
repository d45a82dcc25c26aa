//! Module discovery: the process-local export registrar and the scanner
//! for foreign binaries.
//!
//! Binaries carry their module exports behind a single well-known entry
//! point. For the running process the entries are registered with
//! [`register_export`]; foreign binaries are opened with the platform
//! loader and the entry point is resolved by name.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use libloading::Library;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{Result, RuntimeError};
use crate::module::export::ExportDescriptor;

/// Manifest file searched for when a module directory is given to the
/// loader instead of a binary.
pub const MODULE_MANIFEST_FILE: &str = "module.fimo_module";

/// Entry point resolved in foreign module binaries.
pub const DEFAULT_EXPORTS_SYMBOL: &str = "rustmodcore_module_exports";

/// A single registered export: a function producing a fresh descriptor.
pub type ExportEntry = fn() -> ExportDescriptor;

lazy_static! {
    static ref REGISTERED_EXPORTS: Mutex<Vec<ExportEntry>> = Mutex::new(Vec::new());
}

/// Registers a module export with the current binary, making it visible to
/// loading sets populated from the local process.
pub fn register_export(entry: ExportEntry) {
    let mut entries = REGISTERED_EXPORTS
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if !entries.contains(&entry) {
        entries.push(entry);
    }
}

/// Instantiates every export registered with the current binary.
pub fn registered_exports() -> Vec<ExportDescriptor> {
    let entries: Vec<ExportEntry> = REGISTERED_EXPORTS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    entries.into_iter().map(|entry| entry()).collect()
}

/// On-disk manifest describing where a module's binary lives, relative to
/// the module directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Path of the module binary, relative to the manifest.
    pub binary: PathBuf,
    /// Overrides [`DEFAULT_EXPORTS_SYMBOL`].
    #[serde(default)]
    pub entry_symbol: Option<String>,
}

impl ModuleManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| RuntimeError::ManifestError(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| RuntimeError::ManifestError(format!("{}: {e}", path.display())))
    }
}

/// A binary opened for module discovery. The library handle is inherited by
/// every instance created from one of its exports, keeping the binary
/// mapped for as long as any of them lives.
pub(crate) struct DiscoveredBinary {
    pub library: Arc<Library>,
    pub module_dir: Option<PathBuf>,
    pub exports: Vec<ExportDescriptor>,
}

/// Opens `path` for discovery. A directory is resolved through its
/// manifest; a file is treated as the module binary itself.
pub(crate) fn open_binary(path: &Path) -> Result<DiscoveredBinary> {
    let (binary, module_dir, entry_symbol) = if path.is_dir() {
        let manifest = ModuleManifest::load(&path.join(MODULE_MANIFEST_FILE))?;
        (
            path.join(&manifest.binary),
            Some(path.to_path_buf()),
            manifest
                .entry_symbol
                .unwrap_or_else(|| DEFAULT_EXPORTS_SYMBOL.to_string()),
        )
    } else {
        (
            path.to_path_buf(),
            path.parent().map(Path::to_path_buf),
            DEFAULT_EXPORTS_SYMBOL.to_string(),
        )
    };

    let library = unsafe { Library::new(&binary) }
        .map_err(|e| RuntimeError::IoError(format!("{}: {e}", binary.display())))?;
    let exports = exports_from_library(&library, &entry_symbol, &binary)?;
    debug!(
        binary = %binary.display(),
        exports = exports.len(),
        "module binary scanned"
    );
    Ok(DiscoveredBinary {
        library: Arc::new(library),
        module_dir,
        exports,
    })
}

fn exports_from_library(
    library: &Library,
    entry_symbol: &str,
    binary: &Path,
) -> Result<Vec<ExportDescriptor>> {
    type ExportsFn = fn() -> Vec<ExportDescriptor>;
    let entry = unsafe { library.get::<ExportsFn>(entry_symbol.as_bytes()) }.map_err(|e| {
        RuntimeError::Malformed(format!(
            "binary '{}' does not expose entry point '{entry_symbol}': {e}",
            binary.display()
        ))
    })?;
    Ok(entry())
}

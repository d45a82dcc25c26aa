use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use libloading::Library;

use crate::core::{Result, RuntimeError, SymbolIdentity, SymbolKey, SymbolPayload, Version};
use crate::module::DependencyKind;
use crate::module::export::{ExportDescriptor, InstanceData};
use crate::module::info::{InfoHandle, InstanceState};
use crate::params::{ParamType, ParamValue, ParameterStore};
use crate::registry::Registry;

/// Live state of a loaded module.
///
/// Owned by the registry; module callbacks receive a shared handle. The
/// tables are populated in declaration order during load and depopulated in
/// reverse during teardown. All graph-mutating operations go through the
/// registry that loaded the instance.
pub struct ModuleInstance {
    info: InfoHandle,
    registry: Weak<Registry>,
    descriptor: Option<Arc<ExportDescriptor>>,
    parameters: ParameterStore,
    resources: Vec<PathBuf>,
    imports: Vec<(SymbolKey, SymbolPayload)>,
    dynamic_payloads: Mutex<Vec<SymbolPayload>>,
    user_state: Mutex<Option<InstanceData>>,
    // Keeps the backing binary mapped for as long as the instance lives.
    library: Option<Arc<Library>>,
}

impl ModuleInstance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        info: InfoHandle,
        registry: Weak<Registry>,
        descriptor: Option<Arc<ExportDescriptor>>,
        parameters: ParameterStore,
        resources: Vec<PathBuf>,
        imports: Vec<(SymbolKey, SymbolPayload)>,
        library: Option<Arc<Library>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            registry,
            descriptor,
            parameters,
            resources,
            imports,
            dynamic_payloads: Mutex::new(Vec::new()),
            user_state: Mutex::new(None),
            library,
        })
    }

    /// A pseudo instance that is not backed by a descriptor. Used by
    /// bootstrapping code that must own dependencies before any real module
    /// exists.
    pub(crate) fn root(name: &str, registry: Weak<Registry>) -> Arc<Self> {
        let info = crate::module::info::InstanceInfo::new(name, None, None, None, None);
        info.set_state(InstanceState::Live);
        Self::new(
            info,
            registry,
            None,
            ParameterStore::new(),
            Vec::new(),
            Vec::new(),
            None,
        )
    }

    pub fn name(&self) -> &str {
        self.info.name()
    }

    pub fn info(&self) -> &InfoHandle {
        &self.info
    }

    pub(crate) fn descriptor(&self) -> Option<&Arc<ExportDescriptor>> {
        self.descriptor.as_ref()
    }

    /// Resource paths, resolved against the module directory, in
    /// declaration order.
    pub fn resources(&self) -> &[PathBuf] {
        &self.resources
    }

    /// Imported symbols in declaration order.
    pub fn imports(&self) -> &[(SymbolKey, SymbolPayload)] {
        &self.imports
    }

    /// Snapshot pointer for a single import.
    pub fn import(&self, name: &str, namespace: &str) -> Option<&SymbolPayload> {
        self.imports
            .iter()
            .find(|(key, _)| key.name == name && key.namespace == namespace)
            .map(|(_, payload)| payload)
    }

    pub(crate) fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    pub(crate) fn library(&self) -> Option<Arc<Library>> {
        self.library.clone()
    }

    /// Runs `f` against the instance state, when one was constructed and
    /// matches the requested type.
    pub fn with_state<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.user_state.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref()?.downcast_ref::<T>().map(f)
    }

    pub(crate) fn set_state_object(&self, state: InstanceData) {
        *self.user_state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    pub(crate) fn take_state_object(&self) -> Option<InstanceData> {
        self.user_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub(crate) fn push_dynamic_payload(&self, payload: SymbolPayload) {
        self.dynamic_payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload);
    }

    /// Drains the dynamic export table in reverse declaration order,
    /// pairing each payload with its declaration index.
    pub(crate) fn drain_dynamic_payloads_reverse(&self) -> Vec<(usize, SymbolPayload)> {
        let mut guard = self
            .dynamic_payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut drained: Vec<(usize, SymbolPayload)> =
            std::mem::take(&mut *guard).into_iter().enumerate().collect();
        drained.reverse();
        drained
    }

    /// Looks up an exported payload together with its declared version.
    pub(crate) fn export_payload(&self, identity: &SymbolIdentity) -> Option<(Version, SymbolPayload)> {
        let descriptor = self.descriptor.as_ref()?;
        for export in &descriptor.exports {
            if export.key.name == identity.name && export.key.namespace == identity.namespace {
                return Some((export.key.version.clone(), export.payload.clone()));
            }
        }
        let dynamics = self
            .dynamic_payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for (idx, export) in descriptor.dynamic_exports.iter().enumerate() {
            if export.key.name == identity.name && export.key.namespace == identity.namespace {
                return dynamics
                    .get(idx)
                    .map(|payload| (export.key.version.clone(), payload.clone()));
            }
        }
        None
    }

    /// All currently materialized exports, statics first.
    pub fn exports(&self) -> Vec<(SymbolKey, SymbolPayload)> {
        let Some(descriptor) = self.descriptor.as_ref() else {
            return Vec::new();
        };
        let mut out: Vec<_> = descriptor
            .exports
            .iter()
            .map(|e| (e.key.clone(), e.payload.clone()))
            .collect();
        let dynamics = self
            .dynamic_payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for (export, payload) in descriptor.dynamic_exports.iter().zip(dynamics.iter()) {
            out.push((export.key.clone(), payload.clone()));
        }
        out
    }

    fn registry(&self) -> Result<Arc<Registry>> {
        self.registry
            .upgrade()
            .ok_or_else(|| RuntimeError::InvalidState("runtime has shut down".into()))
    }

    /// Reports whether this instance includes `ns`, and how.
    pub fn query_namespace(&self, ns: &str) -> Result<Option<DependencyKind>> {
        self.registry()?.query_namespace(self.name(), ns)
    }

    /// Includes a namespace, gaining access to the symbols its exporters
    /// expose there. The namespace must exist; repeating an include is an
    /// error.
    pub fn add_namespace(&self, ns: &str) -> Result<()> {
        self.registry()?.add_namespace(self.name(), ns)
    }

    /// Removes a dynamically added namespace include. Subsequent symbol
    /// loads through that namespace fail.
    pub fn remove_namespace(&self, ns: &str) -> Result<()> {
        self.registry()?.remove_namespace(self.name(), ns)
    }

    /// Reports whether `other` is a dependency of this instance, and how.
    pub fn query_dependency(&self, other: &InfoHandle) -> Result<Option<DependencyKind>> {
        self.registry()?.query_dependency(self.name(), other.name())
    }

    /// Acquires `other` as a dynamic dependency, granting access to its
    /// symbols and dependency-scoped parameters.
    pub fn add_dependency(&self, other: &InfoHandle) -> Result<()> {
        self.registry()?.add_dependency(self.name(), other)
    }

    /// Relinquishes a dynamically acquired dependency. The caller
    /// guarantees it no longer holds resources originating from `other`.
    pub fn remove_dependency(&self, other: &InfoHandle) -> Result<()> {
        self.registry()?.remove_dependency(self.name(), other)
    }

    /// Loads a symbol from a dependency. Useful for optional symbols, or
    /// symbols that only exist after loading finished.
    pub fn load_symbol(&self, key: &SymbolKey) -> Result<SymbolPayload> {
        self.registry()?.load_symbol_for(self.name(), key)
    }

    /// Reads a parameter of `owner` with dependency (or owner) access.
    pub fn read_parameter(&self, owner: &str, name: &str, ty: ParamType) -> Result<ParamValue> {
        self.registry()?
            .read_parameter_for(self.name(), owner, name, ty)
    }

    /// Writes a parameter of `owner` with dependency (or owner) access.
    pub fn write_parameter(&self, owner: &str, name: &str, value: ParamValue) -> Result<()> {
        self.registry()?
            .write_parameter_for(self.name(), owner, name, value)
    }
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name())
            .field("state", &self.info.state())
            .field("imports", &self.imports.len())
            .field("resources", &self.resources.len())
            .finish()
    }
}

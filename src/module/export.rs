use std::any::Any;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::core::{GLOBAL_NAMESPACE, Result, RuntimeError, SymbolKey, SymbolPayload, Version};
use crate::core::version::is_compatible;
use crate::module::info::StrongRef;
use crate::module::instance::ModuleInstance;
use crate::params::ParamDecl;
use crate::task::DynFuture;

/// Visibility of an exported symbol. Global symbols are visible to every
/// other instance and must be unique across the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolLinkage {
    #[default]
    Global,
}

/// Opaque per-instance data returned by a state constructor.
pub type InstanceData = Box<dyn Any + Send + Sync>;

pub(crate) type StateCtorFn =
    dyn Fn(Arc<ModuleInstance>) -> DynFuture<Result<InstanceData>> + Send + Sync;
pub(crate) type StateDtorFn = dyn Fn(&ModuleInstance, InstanceData) + Send + Sync;
pub(crate) type SymbolCtorFn =
    dyn Fn(Arc<ModuleInstance>) -> DynFuture<Result<SymbolPayload>> + Send + Sync;
pub(crate) type SymbolDtorFn = dyn Fn(&ModuleInstance, SymbolPayload) + Send + Sync;
pub(crate) type StartFn = dyn Fn(Arc<ModuleInstance>) -> DynFuture<Result<()>> + Send + Sync;
pub(crate) type StopFn = dyn Fn(&ModuleInstance) + Send + Sync;

/// A symbol whose payload exists up front.
#[derive(Clone)]
pub struct SymbolExport {
    pub key: SymbolKey,
    pub linkage: SymbolLinkage,
    pub payload: SymbolPayload,
}

/// A symbol materialized during instance load, after the state constructor
/// ran. Destroyed before any static export is torn down.
#[derive(Clone)]
pub struct DynamicSymbolExport {
    pub key: SymbolKey,
    pub linkage: SymbolLinkage,
    pub(crate) constructor: Arc<SymbolCtorFn>,
    pub(crate) destructor: Option<Arc<SymbolDtorFn>>,
}

/// State constructor/destructor pair bound to an instance. At most one per
/// module.
#[derive(Clone)]
pub struct InstanceStateDecl {
    pub(crate) constructor: Arc<StateCtorFn>,
    pub(crate) destructor: Option<Arc<StateDtorFn>>,
}

/// Listener dispatched after the instance has been published. A failure
/// unloads the instance.
#[derive(Clone)]
pub struct StartEventDecl {
    pub(crate) on_start: Arc<StartFn>,
}

/// Listener dispatched before any export is torn down.
#[derive(Clone)]
pub struct StopEventDecl {
    pub(crate) on_stop: Arc<StopFn>,
}

/// Callback run when the descriptor itself is discarded. Used by
/// dynamically synthesized modules to reclaim whatever backs the
/// descriptor.
pub struct DiscardGuard {
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl DiscardGuard {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }
}

impl Drop for DiscardGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.callback.lock()
            && let Some(callback) = slot.take()
        {
            callback();
        }
    }
}

impl fmt::Debug for DiscardGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DiscardGuard")
    }
}

/// Open-ended key/value extensions of an export. The runtime recognizes
/// exactly these keys.
pub enum ExportModifier {
    /// Run when the descriptor is discarded.
    Destructor(DiscardGuard),
    /// Static dependency on a specific already-loaded instance, pinned so
    /// it stays loaded until the commit consumes the descriptor.
    Dependency(StrongRef),
    /// Constructor/destructor for the per-instance state.
    InstanceState(InstanceStateDecl),
    /// Post-publication start listener.
    StartEvent(StartEventDecl),
    /// Pre-teardown stop listener.
    StopEvent(StopEventDecl),
}

impl fmt::Debug for ExportModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Destructor(_) => "Destructor",
            Self::Dependency(_) => "Dependency",
            Self::InstanceState(_) => "InstanceState",
            Self::StartEvent(_) => "StartEvent",
            Self::StopEvent(_) => "StopEvent",
        };
        f.write_str(name)
    }
}

/// Declarative schema a module presents to the runtime.
///
/// Built through [`ExportBuilder`]; read-only afterwards. Descriptors are
/// gathered into a loading set, validated, and turned into instances on
/// commit.
pub struct ExportDescriptor {
    pub target_runtime_version: Version,
    pub name: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub parameters: Vec<ParamDecl>,
    pub resources: Vec<PathBuf>,
    pub namespaces: Vec<String>,
    pub imports: Vec<SymbolKey>,
    pub exports: Vec<SymbolExport>,
    pub dynamic_exports: Vec<DynamicSymbolExport>,
    pub modifiers: Vec<ExportModifier>,
}

impl ExportDescriptor {
    pub fn builder(name: impl Into<String>) -> ExportBuilder {
        ExportBuilder::new(name)
    }

    /// All export keys, statics first, then dynamics, in declaration order.
    pub fn export_keys(&self) -> impl Iterator<Item = &SymbolKey> {
        self.exports
            .iter()
            .map(|e| &e.key)
            .chain(self.dynamic_exports.iter().map(|e| &e.key))
    }

    pub fn instance_state(&self) -> Option<&InstanceStateDecl> {
        self.modifiers.iter().find_map(|m| match m {
            ExportModifier::InstanceState(decl) => Some(decl),
            _ => None,
        })
    }

    pub fn start_event(&self) -> Option<&StartEventDecl> {
        self.modifiers.iter().find_map(|m| match m {
            ExportModifier::StartEvent(decl) => Some(decl),
            _ => None,
        })
    }

    pub fn stop_event(&self) -> Option<&StopEventDecl> {
        self.modifiers.iter().find_map(|m| match m {
            ExportModifier::StopEvent(decl) => Some(decl),
            _ => None,
        })
    }

    pub fn static_dependencies(&self) -> impl Iterator<Item = &StrongRef> {
        self.modifiers.iter().filter_map(|m| match m {
            ExportModifier::Dependency(pin) => Some(pin),
            _ => None,
        })
    }

    /// Whether the module exports at least one symbol into `ns`.
    pub fn exports_into(&self, ns: &str) -> bool {
        self.export_keys().any(|key| key.namespace == ns)
    }

    /// Structural validation, applied when the descriptor enters a loading
    /// set. Uniqueness against other proposals and the live registry is
    /// checked separately.
    pub fn validate(&self, runtime: &Version) -> Result<()> {
        if !is_compatible(runtime, &self.target_runtime_version) {
            return Err(RuntimeError::VersionIncompatible {
                required: self.target_runtime_version.clone(),
                found: runtime.clone(),
            });
        }
        if self.name.is_empty() {
            return Err(RuntimeError::Malformed("module name is empty".into()));
        }

        let mut param_names = std::collections::HashSet::new();
        for param in &self.parameters {
            if !param_names.insert(param.name.as_str()) {
                return Err(RuntimeError::Malformed(format!(
                    "duplicate parameter '{}' in module '{}'",
                    param.name, self.name
                )));
            }
        }

        for resource in &self.resources {
            if resource.is_absolute() || resource.starts_with("/") {
                return Err(RuntimeError::Malformed(format!(
                    "resource '{}' of module '{}' must be relative",
                    resource.display(),
                    self.name
                )));
            }
        }

        for key in &self.imports {
            self.check_namespace_declared(&key.namespace, "import", &key.name)?;
        }
        let mut identities = std::collections::HashSet::new();
        for key in self.export_keys() {
            self.check_namespace_declared(&key.namespace, "export", &key.name)?;
            if !identities.insert(key.identity()) {
                return Err(RuntimeError::Malformed(format!(
                    "duplicate export '{}' in module '{}'",
                    key.identity(),
                    self.name
                )));
            }
        }

        let mut states = 0;
        let mut starts = 0;
        let mut stops = 0;
        for modifier in &self.modifiers {
            match modifier {
                ExportModifier::InstanceState(_) => states += 1,
                ExportModifier::StartEvent(_) => starts += 1,
                ExportModifier::StopEvent(_) => stops += 1,
                _ => {}
            }
        }
        if states > 1 || starts > 1 || stops > 1 {
            return Err(RuntimeError::Malformed(format!(
                "module '{}' declares a lifecycle modifier more than once",
                self.name
            )));
        }
        Ok(())
    }

    fn check_namespace_declared(&self, ns: &str, what: &str, symbol: &str) -> Result<()> {
        if ns == GLOBAL_NAMESPACE || self.namespaces.iter().any(|n| n == ns) {
            return Ok(());
        }
        Err(RuntimeError::Malformed(format!(
            "module '{}' {what}s '{symbol}' from undeclared namespace '{ns}'",
            self.name
        )))
    }
}

impl fmt::Debug for ExportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportDescriptor")
            .field("name", &self.name)
            .field("target_runtime_version", &self.target_runtime_version)
            .field("parameters", &self.parameters.len())
            .field("resources", &self.resources)
            .field("namespaces", &self.namespaces)
            .field("imports", &self.imports)
            .field("exports", &self.exports.iter().map(|e| &e.key).collect::<Vec<_>>())
            .field(
                "dynamic_exports",
                &self.dynamic_exports.iter().map(|e| &e.key).collect::<Vec<_>>(),
            )
            .field("modifiers", &self.modifiers)
            .finish()
    }
}

/// Builder for [`ExportDescriptor`].
pub struct ExportBuilder {
    descriptor: ExportDescriptor,
}

impl ExportBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: ExportDescriptor {
                target_runtime_version: crate::core::runtime_version(),
                name: name.into(),
                description: None,
                author: None,
                license: None,
                parameters: Vec::new(),
                resources: Vec::new(),
                namespaces: Vec::new(),
                imports: Vec::new(),
                exports: Vec::new(),
                dynamic_exports: Vec::new(),
                modifiers: Vec::new(),
            },
        }
    }

    pub fn target_runtime_version(mut self, version: Version) -> Self {
        self.descriptor.target_runtime_version = version;
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.descriptor.description = Some(text.into());
        self
    }

    pub fn author(mut self, text: impl Into<String>) -> Self {
        self.descriptor.author = Some(text.into());
        self
    }

    pub fn license(mut self, text: impl Into<String>) -> Self {
        self.descriptor.license = Some(text.into());
        self
    }

    pub fn parameter(mut self, decl: ParamDecl) -> Self {
        self.descriptor.parameters.push(decl);
        self
    }

    pub fn resource(mut self, path: impl AsRef<Path>) -> Self {
        self.descriptor.resources.push(path.as_ref().to_path_buf());
        self
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.descriptor.namespaces.push(ns.into());
        self
    }

    pub fn import(mut self, key: SymbolKey) -> Self {
        self.descriptor.imports.push(key);
        self
    }

    pub fn export(mut self, key: SymbolKey, payload: SymbolPayload) -> Self {
        self.descriptor.exports.push(SymbolExport {
            key,
            linkage: SymbolLinkage::Global,
            payload,
        });
        self
    }

    pub fn dynamic_export<C, F>(mut self, key: SymbolKey, constructor: C) -> Self
    where
        C: Fn(Arc<ModuleInstance>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<SymbolPayload>> + Send + 'static,
    {
        self.descriptor.dynamic_exports.push(DynamicSymbolExport {
            key,
            linkage: SymbolLinkage::Global,
            constructor: Arc::new(move |instance| Box::pin(constructor(instance))),
            destructor: None,
        });
        self
    }

    pub fn dynamic_export_with_destructor<C, F, D>(
        mut self,
        key: SymbolKey,
        constructor: C,
        destructor: D,
    ) -> Self
    where
        C: Fn(Arc<ModuleInstance>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<SymbolPayload>> + Send + 'static,
        D: Fn(&ModuleInstance, SymbolPayload) + Send + Sync + 'static,
    {
        self.descriptor.dynamic_exports.push(DynamicSymbolExport {
            key,
            linkage: SymbolLinkage::Global,
            constructor: Arc::new(move |instance| Box::pin(constructor(instance))),
            destructor: Some(Arc::new(destructor)),
        });
        self
    }

    pub fn instance_state<C, F>(mut self, constructor: C) -> Self
    where
        C: Fn(Arc<ModuleInstance>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<InstanceData>> + Send + 'static,
    {
        self.descriptor
            .modifiers
            .push(ExportModifier::InstanceState(InstanceStateDecl {
                constructor: Arc::new(move |instance| Box::pin(constructor(instance))),
                destructor: None,
            }));
        self
    }

    pub fn instance_state_with_destructor<C, F, D>(mut self, constructor: C, destructor: D) -> Self
    where
        C: Fn(Arc<ModuleInstance>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<InstanceData>> + Send + 'static,
        D: Fn(&ModuleInstance, InstanceData) + Send + Sync + 'static,
    {
        self.descriptor
            .modifiers
            .push(ExportModifier::InstanceState(InstanceStateDecl {
                constructor: Arc::new(move |instance| Box::pin(constructor(instance))),
                destructor: Some(Arc::new(destructor)),
            }));
        self
    }

    pub fn on_start<C, F>(mut self, listener: C) -> Self
    where
        C: Fn(Arc<ModuleInstance>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.descriptor
            .modifiers
            .push(ExportModifier::StartEvent(StartEventDecl {
                on_start: Arc::new(move |instance| Box::pin(listener(instance))),
            }));
        self
    }

    pub fn on_stop<C>(mut self, listener: C) -> Self
    where
        C: Fn(&ModuleInstance) + Send + Sync + 'static,
    {
        self.descriptor
            .modifiers
            .push(ExportModifier::StopEvent(StopEventDecl {
                on_stop: Arc::new(listener),
            }));
        self
    }

    /// Declares a static dependency on an already-loaded instance. The pin
    /// keeps the target loaded until the descriptor is consumed or
    /// discarded.
    pub fn static_dependency(mut self, pin: StrongRef) -> Self {
        self.descriptor
            .modifiers
            .push(ExportModifier::Dependency(pin));
        self
    }

    /// Registers a callback run when the descriptor is discarded.
    pub fn on_discard(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.descriptor
            .modifiers
            .push(ExportModifier::Destructor(DiscardGuard::new(callback)));
        self
    }

    pub fn build(self) -> ExportDescriptor {
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime_version;

    fn payload(v: u32) -> SymbolPayload {
        Arc::new(v)
    }

    #[test]
    fn minimal_descriptor_validates() {
        let desc = ExportDescriptor::builder("empty").build();
        assert!(desc.validate(&runtime_version()).is_ok());
    }

    #[test]
    fn incompatible_target_version_is_rejected() {
        let desc = ExportDescriptor::builder("m")
            .target_runtime_version(Version::new(9, 0, 0))
            .build();
        assert!(matches!(
            desc.validate(&runtime_version()),
            Err(RuntimeError::VersionIncompatible { .. })
        ));
    }

    #[test]
    fn undeclared_namespaces_are_rejected() {
        let bad_import = ExportDescriptor::builder("m")
            .import(SymbolKey::new("s", "gfx", Version::new(1, 0, 0)))
            .build();
        assert!(matches!(
            bad_import.validate(&runtime_version()),
            Err(RuntimeError::Malformed(_))
        ));

        let bad_export = ExportDescriptor::builder("m")
            .export(SymbolKey::new("s", "gfx", Version::new(1, 0, 0)), payload(0))
            .build();
        assert!(bad_export.validate(&runtime_version()).is_err());

        let declared = ExportDescriptor::builder("m")
            .namespace("gfx")
            .export(SymbolKey::new("s", "gfx", Version::new(1, 0, 0)), payload(0))
            .build();
        assert!(declared.validate(&runtime_version()).is_ok());
    }

    #[test]
    fn duplicate_lifecycle_modifiers_are_rejected() {
        let desc = ExportDescriptor::builder("m")
            .on_stop(|_| {})
            .on_stop(|_| {})
            .build();
        assert!(matches!(
            desc.validate(&runtime_version()),
            Err(RuntimeError::Malformed(_))
        ));
    }

    #[test]
    fn absolute_resources_are_rejected() {
        let desc = ExportDescriptor::builder("m").resource("/etc/conf").build();
        assert!(desc.validate(&runtime_version()).is_err());
        let ok = ExportDescriptor::builder("m").resource("data/conf").build();
        assert!(ok.validate(&runtime_version()).is_ok());
    }

    #[test]
    fn duplicate_export_identity_is_rejected() {
        let desc = ExportDescriptor::builder("m")
            .export(SymbolKey::global("s", Version::new(1, 0, 0)), payload(0))
            .export(SymbolKey::global("s", Version::new(2, 0, 0)), payload(1))
            .build();
        assert!(matches!(
            desc.validate(&runtime_version()),
            Err(RuntimeError::Malformed(_))
        ));
    }

    #[test]
    fn discard_guard_runs_on_drop() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let desc = ExportDescriptor::builder("m")
            .on_discard(move || flag.store(true, Ordering::SeqCst))
            .build();
        drop(desc);
        assert!(fired.load(Ordering::SeqCst));
    }
}

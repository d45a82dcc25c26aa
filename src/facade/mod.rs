//! High-level entry point of the runtime.

pub mod config;

use std::sync::Arc;

use lazy_static::lazy_static;
use tracing::info;

use crate::core::{Result, RuntimeError, SymbolKey, Version};
use crate::core::version::runtime_version;
use crate::loader::set::LoadingSet;
use crate::module::info::InfoHandle;
use crate::module::instance::ModuleInstance;
use crate::params::{ParamType, ParamValue};
use crate::registry::{ParameterQuery, Registry};

pub use config::{
    FeatureRequest, FeatureRequestFlag, FeatureStatus, FeatureStatusFlag, FeatureTag, Profile,
    RuntimeConfig,
};

/// Name of the pseudo instance owned by the host itself.
pub const ROOT_INSTANCE_NAME: &str = "<root>";

lazy_static! {
    static ref GLOBAL_HOST: Arc<ModuleHost> =
        ModuleHost::new().expect("default runtime configuration is valid");
}

/// Owner of a registry and its root instance.
///
/// Construction hands back a shared handle used by every other operation;
/// there is no hidden discovery of the host. A process-wide instance is
/// available through [`ModuleHost::global`] for applications that want one.
pub struct ModuleHost {
    registry: Arc<Registry>,
    root: Arc<ModuleInstance>,
    config: RuntimeConfig,
    features: Vec<FeatureStatus>,
}

impl ModuleHost {
    pub fn new() -> Result<Arc<Self>> {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let features = config.resolve_features()?;
        let registry = Registry::new();
        let root = ModuleInstance::root(ROOT_INSTANCE_NAME, Arc::downgrade(&registry));
        registry.register_root(&root)?;
        info!(profile = ?config.profile, "module host initialized");
        Ok(Arc::new(Self {
            registry,
            root,
            config,
            features,
        }))
    }

    /// The process-wide host.
    pub fn global() -> &'static Arc<ModuleHost> {
        &GLOBAL_HOST
    }

    /// Version that export descriptors are validated against.
    pub fn runtime_version() -> Version {
        runtime_version()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The pseudo instance used by bootstrapping code that must own
    /// dependencies before any real module exists.
    pub fn root_instance(&self) -> &Arc<ModuleInstance> {
        &self.root
    }

    pub fn profile(&self) -> Profile {
        self.config.profile
    }

    pub fn features(&self) -> &[FeatureStatus] {
        &self.features
    }

    /// Creates an empty loading set bound to this host's registry.
    pub fn new_loading_set(&self) -> Arc<LoadingSet> {
        LoadingSet::new(self.registry.clone())
    }

    pub fn find_by_name(&self, name: &str) -> Result<InfoHandle> {
        self.registry.find_by_name(name)
    }

    pub fn find_by_symbol(&self, key: &SymbolKey) -> Result<InfoHandle> {
        self.registry.find_by_symbol(key)
    }

    pub fn namespace_exists(&self, ns: &str) -> Result<bool> {
        self.registry.namespace_exists(ns)
    }

    pub fn prune_instances(&self) -> Result<()> {
        self.registry.prune_instances()
    }

    pub fn query_parameter(&self, module: &str, param: &str) -> Result<ParameterQuery> {
        self.registry.query_parameter(module, param)
    }

    pub fn read_parameter(&self, module: &str, param: &str, ty: ParamType) -> Result<ParamValue> {
        self.registry.read_parameter(module, param, ty)
    }

    pub fn write_parameter(&self, module: &str, param: &str, value: ParamValue) -> Result<()> {
        self.registry.write_parameter(module, param, value)
    }

    /// Marks every loaded module unloadable and prunes until only the root
    /// instance remains. Fails when outstanding pins keep instances alive.
    pub async fn shutdown(&self) -> Result<()> {
        loop {
            for name in self.registry.instance_names()? {
                if name == ROOT_INSTANCE_NAME {
                    continue;
                }
                if let Ok(info) = self.registry.find_by_name(&name) {
                    info.mark_unloadable();
                }
            }
            let before = self.registry.instance_names()?.len();
            self.registry.prune_instances()?;
            let after = self.registry.instance_names()?.len();
            if after <= 1 {
                info!("module host shut down");
                return Ok(());
            }
            if after == before {
                // Give release of outstanding pins a chance to land.
                tokio::task::yield_now().await;
                self.registry.prune_instances()?;
                if self.registry.instance_names()?.len() == after {
                    return Err(RuntimeError::InvalidState(format!(
                        "{} instance(s) remain pinned",
                        after - 1
                    )));
                }
            }
        }
    }
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("profile", &self.config.profile)
            .field("registry", &self.registry)
            .finish()
    }
}

//! Batched module loading.
//!
//! A loading set gathers proposed modules from descriptors, binaries, and
//! the current process, then commits them as one transaction: imports are
//! resolved, a load order is computed, and each module runs its
//! constructors before being published atomically into the registry.
//! Modules that cannot be loaded are skipped without failing the commit;
//! their outcome is observable through [`LoadingSet::module_status`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use libloading::Library;
use tracing::{debug, warn};

use crate::core::{Result, RuntimeError, SymbolIdentity, SymbolKey, SymbolPayload, Version};
use crate::core::version::{is_compatible, runtime_version};
use crate::graph::DepGraph;
use crate::loader::discovery;
use crate::module::export::ExportDescriptor;
use crate::module::info::{InfoHandle, InstanceInfo, InstanceState};
use crate::module::instance::ModuleInstance;
use crate::params::ParameterStore;
use crate::registry::Registry;
use crate::task::StatusCell;

/// Outcome of a single proposed module: either the info handle of the
/// loaded instance, or `None` with the error that caused the skip.
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub info: Option<InfoHandle>,
    pub descriptor: Arc<ExportDescriptor>,
    pub error: Option<Arc<RuntimeError>>,
}

impl ResolvedModule {
    pub fn is_loaded(&self) -> bool {
        self.info.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetState {
    Open,
    Committing,
    Settled,
}

struct ProposedModule {
    descriptor: Arc<ExportDescriptor>,
    library: Option<Arc<Library>>,
    module_dir: Option<PathBuf>,
    status: Arc<StatusCell<ResolvedModule>>,
}

struct SetInner {
    state: SetState,
    proposed: HashMap<String, ProposedModule>,
    proposed_symbols: HashMap<SymbolIdentity, (Version, String)>,
    statuses: HashMap<String, Arc<StatusCell<ResolvedModule>>>,
}

/// A batch of modules loaded together.
pub struct LoadingSet {
    registry: Arc<Registry>,
    inner: Mutex<SetInner>,
}

impl LoadingSet {
    pub(crate) fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            inner: Mutex::new(SetInner {
                state: SetState::Open,
                proposed: HashMap::new(),
                proposed_symbols: HashMap::new(),
                statuses: HashMap::new(),
            }),
        })
    }

    /// Proposes a single descriptor, typically one synthesized at runtime.
    /// The new module inherits the owner's binary lifetime.
    pub fn add_module(&self, owner: &ModuleInstance, descriptor: ExportDescriptor) -> Result<()> {
        let module_dir = owner.info().module_path().map(Path::to_path_buf);
        self.propose(descriptor, owner.library(), module_dir)
    }

    /// Opens a module binary (or the manifest inside a module directory)
    /// and proposes the exports accepted by `filter`. Returns how many
    /// modules were proposed.
    pub fn add_from_path(
        &self,
        path: impl AsRef<Path>,
        filter: impl Fn(&ExportDescriptor) -> bool,
    ) -> Result<usize> {
        let discovered = discovery::open_binary(path.as_ref())?;
        let mut added = 0;
        for descriptor in discovered.exports {
            if !filter(&descriptor) {
                debug!(module = %descriptor.name, "module filtered out");
                continue;
            }
            match self.propose(
                descriptor,
                Some(discovered.library.clone()),
                discovered.module_dir.clone(),
            ) {
                Ok(()) => added += 1,
                Err(err) => warn!(error = %err, "module proposal skipped"),
            }
        }
        Ok(added)
    }

    /// Iterates the exports registered with the current binary and proposes
    /// those accepted by `filter`.
    pub fn add_from_current_binary(
        &self,
        filter: impl Fn(&ExportDescriptor) -> bool,
    ) -> Result<usize> {
        let module_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        let mut added = 0;
        for descriptor in discovery::registered_exports() {
            if !filter(&descriptor) {
                debug!(module = %descriptor.name, "module filtered out");
                continue;
            }
            match self.propose(descriptor, None, module_dir.clone()) {
                Ok(()) => added += 1,
                Err(err) => warn!(error = %err, "module proposal skipped"),
            }
        }
        Ok(added)
    }

    fn propose(
        &self,
        descriptor: ExportDescriptor,
        library: Option<Arc<Library>>,
        module_dir: Option<PathBuf>,
    ) -> Result<()> {
        descriptor.validate(&runtime_version())?;
        let mut inner = self.inner.lock()?;
        if inner.state != SetState::Open {
            return Err(RuntimeError::InvalidState(
                "loading set is already committing".into(),
            ));
        }
        let name = descriptor.name.clone();
        if inner.proposed.contains_key(&name) {
            return Err(RuntimeError::AlreadyPresent(format!("module '{name}'")));
        }
        for key in descriptor.export_keys() {
            if inner.proposed_symbols.contains_key(&key.identity()) {
                return Err(RuntimeError::AlreadyPresent(format!(
                    "symbol '{}'",
                    key.identity()
                )));
            }
        }

        let descriptor = Arc::new(descriptor);
        for key in descriptor.export_keys() {
            inner
                .proposed_symbols
                .insert(key.identity(), (key.version.clone(), name.clone()));
        }
        let status = Arc::new(StatusCell::new());
        inner.statuses.insert(name.clone(), status.clone());
        inner.proposed.insert(
            name.clone(),
            ProposedModule {
                descriptor,
                library,
                module_dir,
                status,
            },
        );
        debug!(module = %name, "module proposed");
        Ok(())
    }

    pub fn contains_module(&self, name: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.statuses.contains_key(name))
            .unwrap_or(false)
    }

    pub fn contains_symbol(&self, key: &SymbolKey) -> bool {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .proposed_symbols
                    .get(&key.identity())
                    .is_some_and(|(version, _)| is_compatible(version, &key.version))
            })
            .unwrap_or(false)
    }

    /// Resolves once the named module has been processed by a commit, or
    /// never succeeds (with `Cancelled`) when the set is dropped first.
    pub async fn module_status(&self, name: &str) -> Result<ResolvedModule> {
        let waiter = {
            let inner = self.inner.lock()?;
            inner
                .statuses
                .get(name)
                .ok_or_else(|| RuntimeError::NotFound(format!("module '{name}'")))?
                .subscribe()
        };
        waiter.wait(&format!("resolution of module '{name}'")).await
    }

    /// Loads the modules contained in the set.
    ///
    /// Loadable modules are published into the registry; modules with
    /// missing or incompatible imports, conflicting exports, or failing
    /// constructors are skipped without failing the commit. Concurrent
    /// commits are handled atomically, one at a time. Dropping the returned
    /// future cancels the commit: the module being loaded is unwound while
    /// already-published modules remain published.
    pub async fn commit(&self) -> Result<()> {
        let batch: Vec<ProposedModule> = {
            let mut inner = self.inner.lock()?;
            match inner.state {
                SetState::Settled => return Ok(()),
                SetState::Open | SetState::Committing => {
                    inner.state = SetState::Committing;
                    let names: Vec<String> = inner.proposed.keys().cloned().collect();
                    names
                        .into_iter()
                        .filter_map(|name| inner.proposed.remove(&name))
                        .collect()
                }
            }
        };

        let _gate = self.registry.commit_gate().lock().await;
        if !batch.is_empty() {
            debug!(modules = batch.len(), "commit started");
            self.run_commit(batch).await?;
        }
        let mut inner = self.inner.lock()?;
        inner.state = SetState::Settled;
        debug!("commit settled");
        Ok(())
    }

    async fn run_commit(&self, batch: Vec<ProposedModule>) -> Result<()> {
        let mut viable: HashMap<String, ProposedModule> = HashMap::new();
        let mut skipped: Vec<(ProposedModule, RuntimeError)> = Vec::new();

        // Name and export uniqueness against the live registry, as of now.
        for module in batch {
            let name = module.descriptor.name.clone();
            if self.registry.contains_instance(&name)? {
                skipped.push((module, RuntimeError::AlreadyPresent(format!("module '{name}'"))));
                continue;
            }
            let conflict = module
                .descriptor
                .export_keys()
                .find(|key| {
                    self.registry
                        .has_symbol_identity(&key.identity())
                        .unwrap_or(true)
                })
                .map(|key| key.identity());
            if let Some(identity) = conflict {
                skipped.push((
                    module,
                    RuntimeError::AlreadyPresent(format!("symbol '{identity}'")),
                ));
                continue;
            }
            viable.insert(name, module);
        }

        // Import resolution to a fixpoint: a module whose import can only be
        // satisfied by a skipped sibling is skipped as well.
        loop {
            let mut failed: Option<(String, RuntimeError)> = None;
            'modules: for (name, module) in &viable {
                for import in &module.descriptor.imports {
                    match self.resolve_import(&viable, name, import) {
                        Ok(()) => {}
                        Err(err) => {
                            failed = Some((name.clone(), err));
                            break 'modules;
                        }
                    }
                }
            }
            match failed {
                Some((name, err)) => {
                    let module = viable.remove(&name).expect("failed module is viable");
                    skipped.push((module, err));
                }
                None => break,
            }
        }

        // Dependency ordering over the remaining modules; cycle members and
        // their dependents are skipped.
        let order = {
            let mut graph = DepGraph::new();
            let mut nodes = HashMap::new();
            for name in viable.keys() {
                nodes.insert(name.clone(), graph.add_node(name.clone()));
            }
            for (name, module) in &viable {
                for import in &module.descriptor.imports {
                    if let Some((_, exporter)) = self.set_exporter(&viable, import)
                        && &exporter != name
                    {
                        // Exporters load before their importers.
                        graph
                            .add_edge(nodes[&exporter], nodes[name], ())
                            .expect("both endpoints were added");
                    }
                }
            }
            let topo = graph.toposort_by(|n| n.as_str());
            for node in topo.cyclic {
                let name = graph.node(node).expect("cyclic node has payload").clone();
                if let Some(module) = viable.remove(&name) {
                    let err = RuntimeError::WouldCycle {
                        from: name.clone(),
                        to: name,
                    };
                    skipped.push((module, err));
                }
            }
            topo.order
                .into_iter()
                .filter_map(|node| graph.node(node).cloned())
                .filter(|name| viable.contains_key(name))
                .collect::<Vec<String>>()
        };

        for (module, err) in skipped {
            debug!(module = %module.descriptor.name, error = %err, "module skipped");
            module.status.set(ResolvedModule {
                info: None,
                descriptor: module.descriptor.clone(),
                error: Some(Arc::new(err)),
            });
        }

        // Load in order. A later module observes everything its
        // predecessors published.
        for name in order {
            let module = viable.remove(&name).expect("ordered module is viable");
            match self.load_one(&module).await {
                Ok(info) => {
                    module.status.set(ResolvedModule {
                        info: Some(info),
                        descriptor: module.descriptor.clone(),
                        error: None,
                    });
                }
                Err(err) => {
                    debug!(module = %name, error = %err, "module load failed");
                    module.status.set(ResolvedModule {
                        info: None,
                        descriptor: module.descriptor.clone(),
                        error: Some(Arc::new(err)),
                    });
                }
            }
        }
        Ok(())
    }

    /// Checks that an import is satisfiable from the registry or from a
    /// viable sibling in the set.
    fn resolve_import(
        &self,
        viable: &HashMap<String, ProposedModule>,
        _importer: &str,
        import: &SymbolKey,
    ) -> Result<()> {
        match self.registry.resolve_symbol(import) {
            Ok(_) => return Ok(()),
            Err(RuntimeError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        match self.set_exporter(viable, import) {
            Some((version, _)) if is_compatible(&version, &import.version) => Ok(()),
            Some((version, _)) => Err(RuntimeError::VersionIncompatible {
                required: import.version.clone(),
                found: version,
            }),
            None => Err(RuntimeError::NotFound(format!("symbol '{}'", import.identity()))),
        }
    }

    /// The viable set module exporting the import's identity, if any.
    fn set_exporter(
        &self,
        viable: &HashMap<String, ProposedModule>,
        import: &SymbolKey,
    ) -> Option<(Version, String)> {
        let identity = import.identity();
        for (name, module) in viable {
            for key in module.descriptor.export_keys() {
                if key.identity() == identity {
                    return Some((key.version.clone(), name.clone()));
                }
            }
        }
        None
    }

    /// Runs the load pipeline for one module: construct tables, link static
    /// edges, run the state constructor, build dynamic symbols, publish,
    /// then fire the start event. Failures and cancellation unwind whatever
    /// was reached.
    async fn load_one(&self, module: &ProposedModule) -> Result<InfoHandle> {
        let descriptor = module.descriptor.clone();
        let name = descriptor.name.clone();

        // Imports are snapshot now so this module sees the siblings
        // published earlier in the same commit.
        let mut imports: Vec<(SymbolKey, SymbolPayload)> = Vec::new();
        let mut static_deps: Vec<String> = Vec::new();
        let mut seen_deps = HashSet::new();
        for import in &descriptor.imports {
            let (owner, payload) = self
                .registry
                .resolve_symbol(import)
                .map_err(|e| RuntimeError::LoadFailed(format!("import of module '{name}': {e}")))?;
            if seen_deps.insert(owner.clone()) {
                static_deps.push(owner);
            }
            imports.push((import.clone(), payload));
        }
        for pin in descriptor.static_dependencies() {
            let dep = pin.info().name().to_string();
            if seen_deps.insert(dep.clone()) {
                static_deps.push(dep);
            }
        }

        let mut parameters = ParameterStore::new();
        for decl in &descriptor.parameters {
            parameters.declare(decl)?;
        }
        let resources: Vec<PathBuf> = descriptor
            .resources
            .iter()
            .map(|r| match &module.module_dir {
                Some(dir) => dir.join(r),
                None => r.clone(),
            })
            .collect();

        let info = InstanceInfo::new(
            name.clone(),
            descriptor.description.clone(),
            descriptor.author.clone(),
            descriptor.license.clone(),
            module.module_dir.clone(),
        );
        let instance = ModuleInstance::new(
            info.clone(),
            Arc::downgrade(&self.registry),
            Some(descriptor.clone()),
            parameters,
            resources,
            imports,
            module.library.clone(),
        );

        if let Err(err) = self
            .registry
            .link_loading(&instance, &static_deps, &descriptor.namespaces)
        {
            instance.info().set_state(InstanceState::Dead);
            return Err(err);
        }
        let mut frame = LoadFrame {
            registry: self.registry.clone(),
            instance: instance.clone(),
            step: LoadStep::Linked,
        };

        if let Some(state_decl) = descriptor.instance_state() {
            let state = (state_decl.constructor)(instance.clone())
                .await
                .map_err(|e| RuntimeError::LoadFailed(format!("constructor of '{name}': {e}")))?;
            instance.set_state_object(state);
        }

        for export in &descriptor.dynamic_exports {
            let payload = (export.constructor)(instance.clone()).await.map_err(|e| {
                RuntimeError::LoadFailed(format!(
                    "constructor of symbol '{}' in '{name}': {e}",
                    export.key.identity()
                ))
            })?;
            instance.push_dynamic_payload(payload);
        }

        self.registry.publish(&instance)?;
        frame.step = LoadStep::Published;

        if let Some(start) = descriptor.start_event() {
            frame.step = LoadStep::InStartEvent;
            (start.on_start)(instance.clone())
                .await
                .map_err(|e| RuntimeError::LoadFailed(format!("start event of '{name}': {e}")))?;
        }

        frame.step = LoadStep::Done;
        Ok(info)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadStep {
    /// Graph nodes and static edges exist; nothing published.
    Linked,
    /// Published; the start event has not begun, so the module stays.
    Published,
    /// The start event is in flight; abandoning it unloads the module.
    InStartEvent,
    Done,
}

/// Unwind guard for a single module load. Dropping it before `Done` (on a
/// constructor error or because the commit future was dropped) reverses
/// whatever the load reached.
struct LoadFrame {
    registry: Arc<Registry>,
    instance: Arc<ModuleInstance>,
    step: LoadStep,
}

impl Drop for LoadFrame {
    fn drop(&mut self) {
        match self.step {
            LoadStep::Done | LoadStep::Published => {}
            LoadStep::Linked => {
                let instance = &self.instance;
                let _ = instance
                    .info()
                    .transition(&[InstanceState::Loading], InstanceState::Unloading);
                if let Some(descriptor) = instance.descriptor().cloned() {
                    for (idx, payload) in instance.drain_dynamic_payloads_reverse() {
                        if let Some(destructor) = &descriptor.dynamic_exports[idx].destructor {
                            destructor(instance, payload);
                        }
                    }
                    if let Some(state_object) = instance.take_state_object() {
                        match descriptor.instance_state().and_then(|d| d.destructor.clone()) {
                            Some(destructor) => destructor(instance, state_object),
                            None => drop(state_object),
                        }
                    }
                }
                let _ = self.registry.unlink_loading(instance);
                instance.info().set_state(InstanceState::Dead);
                debug!(module = %instance.name(), "partial load unwound");
            }
            LoadStep::InStartEvent => {
                let claimed = self.instance.info().transition(
                    &[InstanceState::Live, InstanceState::MarkedUnloadable],
                    InstanceState::Unloading,
                );
                if claimed.is_ok() {
                    let _ = self.registry.teardown_instance(&self.instance);
                }
            }
        }
    }
}

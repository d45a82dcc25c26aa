//! Process registry of loaded instances.
//!
//! Holds the instance map, the symbol index, namespace occupancy, and the
//! dependency and namespace graphs behind a single read/write lock. Reads
//! never suspend; mutations take the lock exclusively. User-supplied hooks
//! and callbacks always run with the lock released.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::core::{
    GLOBAL_NAMESPACE, Result, RuntimeError, SymbolIdentity, SymbolKey, SymbolPayload, Version,
};
use crate::core::version::is_compatible;
use crate::graph::{DepGraph, NodeId};
use crate::module::info::{InfoHandle, InstanceState};
use crate::module::instance::ModuleInstance;
use crate::module::DependencyKind;
use crate::params::{AccessTier, ParamAccessGroup, ParamType, ParamValue};

/// Result of a parameter metadata query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterQuery {
    pub param_type: ParamType,
    pub read_group: ParamAccessGroup,
    pub write_group: ParamAccessGroup,
}

#[derive(Debug, Clone)]
struct SymbolEntry {
    version: Version,
    owner: String,
}

/// Node payload of the namespace graph. Instances link to the namespaces
/// they include.
#[derive(Debug, Clone)]
enum NsNode {
    Instance(String),
    Namespace(String),
}

#[derive(Default)]
struct RegistryState {
    instances: HashMap<String, Arc<ModuleInstance>>,
    dep_nodes: HashMap<String, NodeId>,
    dep_graph: DepGraph<String, DependencyKind>,
    ns_graph: DepGraph<NsNode, DependencyKind>,
    ns_inst_nodes: HashMap<String, NodeId>,
    ns_nodes: HashMap<String, NodeId>,
    symbol_index: HashMap<SymbolIdentity, Vec<SymbolEntry>>,
    namespace_occupants: HashMap<String, usize>,
}

impl RegistryState {
    fn dep_node(&self, name: &str) -> Result<NodeId> {
        self.dep_nodes
            .get(name)
            .copied()
            .ok_or_else(|| RuntimeError::NotFound(format!("module '{name}'")))
    }

    fn instance(&self, name: &str) -> Result<&Arc<ModuleInstance>> {
        self.instances
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(format!("module '{name}'")))
    }

    fn ns_node_or_create(&mut self, ns: &str) -> NodeId {
        if let Some(&node) = self.ns_nodes.get(ns) {
            return node;
        }
        let node = self.ns_graph.add_node(NsNode::Namespace(ns.to_string()));
        self.ns_nodes.insert(ns.to_string(), node);
        node
    }

    /// Drops a namespace node once nothing occupies it and nothing links to
    /// it any more.
    fn gc_ns_node(&mut self, ns: &str) {
        let occupied = self.namespace_occupants.get(ns).copied().unwrap_or(0) > 0;
        if occupied {
            return;
        }
        if let Some(&node) = self.ns_nodes.get(ns)
            && self.ns_graph.in_degree(node) == 0
        {
            let _ = self.ns_graph.remove_node(node);
            self.ns_nodes.remove(ns);
        }
    }

    fn namespace_edge(&self, caller: &str, ns: &str) -> Option<(NodeId, NodeId)> {
        let from = *self.ns_inst_nodes.get(caller)?;
        let to = *self.ns_nodes.get(ns)?;
        self.ns_graph.find_edge(from, to).map(|_| (from, to))
    }

    fn remove_symbol_entries(&mut self, owner: &str, keys: impl Iterator<Item = SymbolKey>) {
        for key in keys {
            let identity = key.identity();
            if let Some(entries) = self.symbol_index.get_mut(&identity) {
                entries.retain(|entry| entry.owner != owner);
                if entries.is_empty() {
                    self.symbol_index.remove(&identity);
                }
            }
            if let Some(count) = self.namespace_occupants.get_mut(&key.namespace) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.namespace_occupants.remove(&key.namespace);
                }
            }
            self.gc_ns_node(&key.namespace);
        }
    }
}

pub struct Registry {
    state: RwLock<RegistryState>,
    commit_gate: tokio::sync::Mutex<()>,
}

impl Registry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(RegistryState::default()),
            commit_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Serializes commits. Held for the whole load phase of a commit so
    /// concurrent commit requests are handled atomically, one at a time.
    pub(crate) fn commit_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.commit_gate
    }

    // ------------------------------------------------------------------
    // Public queries
    // ------------------------------------------------------------------

    /// Looks up a loaded module by its unique name.
    pub fn find_by_name(&self, name: &str) -> Result<InfoHandle> {
        let state = self.state.read()?;
        Ok(state.instance(name)?.info().clone())
    }

    /// Looks up the module exporting a symbol compatible with `key`.
    pub fn find_by_symbol(&self, key: &SymbolKey) -> Result<InfoHandle> {
        let state = self.state.read()?;
        let (owner, _) = Self::resolve_in(&state, key)?;
        Ok(state.instance(&owner)?.info().clone())
    }

    /// A namespace exists while at least one loaded module exports a symbol
    /// into it.
    pub fn namespace_exists(&self, ns: &str) -> Result<bool> {
        let state = self.state.read()?;
        Ok(state.namespace_occupants.get(ns).copied().unwrap_or(0) > 0)
    }

    /// Queries the data type and the access groups of a parameter.
    pub fn query_parameter(&self, module: &str, param: &str) -> Result<ParameterQuery> {
        let instance = {
            let state = self.state.read()?;
            state.instance(module)?.clone()
        };
        let cell = instance
            .parameters()
            .get(param)
            .ok_or_else(|| RuntimeError::NotFound(format!("parameter '{module}.{param}'")))?;
        Ok(ParameterQuery {
            param_type: cell.param_type(),
            read_group: cell.read_group(),
            write_group: cell.write_group(),
        })
    }

    /// Reads a parameter with public access.
    pub fn read_parameter(&self, module: &str, param: &str, ty: ParamType) -> Result<ParamValue> {
        let instance = {
            let state = self.state.read()?;
            state.instance(module)?.clone()
        };
        // Lock released before the hook can run.
        instance
            .parameters()
            .read_checked(module, param, AccessTier::Public, Some(ty))
    }

    /// Writes a parameter with public access.
    pub fn write_parameter(&self, module: &str, param: &str, value: ParamValue) -> Result<()> {
        let instance = {
            let state = self.state.read()?;
            state.instance(module)?.clone()
        };
        instance
            .parameters()
            .write_checked(module, param, AccessTier::Public, value)
    }

    /// Names of all loaded instances.
    pub fn instance_names(&self) -> Result<Vec<String>> {
        let state = self.state.read()?;
        Ok(state.instances.keys().cloned().collect())
    }

    // ------------------------------------------------------------------
    // Instance-scoped operations
    // ------------------------------------------------------------------

    pub(crate) fn query_namespace(&self, caller: &str, ns: &str) -> Result<Option<DependencyKind>> {
        let state = self.state.read()?;
        state.instance(caller)?;
        match state.namespace_edge(caller, ns) {
            Some((from, to)) => {
                let edge = state
                    .ns_graph
                    .find_edge(from, to)
                    .expect("edge probed just above");
                Ok(state.ns_graph.edge(edge).copied())
            }
            None => Ok(None),
        }
    }

    pub(crate) fn add_namespace(&self, caller: &str, ns: &str) -> Result<()> {
        if ns == GLOBAL_NAMESPACE {
            return Err(RuntimeError::InvalidState(
                "the global namespace is always included".into(),
            ));
        }
        let mut state = self.state.write()?;
        state.instance(caller)?;
        if state.namespace_occupants.get(ns).copied().unwrap_or(0) == 0 {
            return Err(RuntimeError::NotFound(format!("namespace '{ns}'")));
        }
        if state.namespace_edge(caller, ns).is_some() {
            return Err(RuntimeError::AlreadyPresent(format!(
                "namespace '{ns}' already included by '{caller}'"
            )));
        }
        let from = *state
            .ns_inst_nodes
            .get(caller)
            .ok_or_else(|| RuntimeError::NotFound(format!("module '{caller}'")))?;
        let to = state.ns_node_or_create(ns);
        state.ns_graph.add_edge(from, to, DependencyKind::Dynamic)?;
        debug!(module = caller, namespace = ns, "namespace included");
        Ok(())
    }

    pub(crate) fn remove_namespace(&self, caller: &str, ns: &str) -> Result<()> {
        let mut state = self.state.write()?;
        state.instance(caller)?;
        let (from, to) = state
            .namespace_edge(caller, ns)
            .ok_or_else(|| RuntimeError::NotFound(format!("namespace include '{ns}'")))?;
        let edge = state
            .ns_graph
            .find_edge(from, to)
            .expect("edge probed just above");
        if state.ns_graph.edge(edge).is_some_and(|k| k.is_static()) {
            return Err(RuntimeError::InvalidState(format!(
                "namespace '{ns}' is included statically by '{caller}'"
            )));
        }
        state.ns_graph.remove_edge(edge)?;
        state.gc_ns_node(ns);
        debug!(module = caller, namespace = ns, "namespace excluded");
        Ok(())
    }

    pub(crate) fn query_dependency(
        &self,
        caller: &str,
        other: &str,
    ) -> Result<Option<DependencyKind>> {
        let state = self.state.read()?;
        state.instance(caller)?;
        let (Ok(from), Ok(to)) = (state.dep_node(caller), state.dep_node(other)) else {
            return Ok(None);
        };
        match state.dep_graph.find_edge(from, to) {
            Some(edge) => Ok(state.dep_graph.edge(edge).copied()),
            None => Ok(None),
        }
    }

    pub(crate) fn add_dependency(&self, caller: &str, other: &InfoHandle) -> Result<()> {
        let mut state = self.state.write()?;
        state.instance(caller)?;
        let target = state.instance(other.name())?.clone();
        if target.info().state() != InstanceState::Live {
            return Err(RuntimeError::InvalidState(format!(
                "module '{}' is {:?}",
                other.name(),
                target.info().state()
            )));
        }
        let from = state.dep_node(caller)?;
        let to = state.dep_node(other.name())?;
        if state.dep_graph.find_edge(from, to).is_some() {
            return Err(RuntimeError::AlreadyPresent(format!(
                "dependency of '{caller}' on '{}'",
                other.name()
            )));
        }
        if state.dep_graph.would_cycle(from, to) {
            return Err(RuntimeError::WouldCycle {
                from: caller.to_string(),
                to: other.name().to_string(),
            });
        }
        state.dep_graph.add_edge(from, to, DependencyKind::Dynamic)?;
        target.info().acquire_strong_raw();
        debug!(module = caller, dependency = %other.name(), "dependency added");
        Ok(())
    }

    pub(crate) fn remove_dependency(&self, caller: &str, other: &InfoHandle) -> Result<()> {
        let mut state = self.state.write()?;
        state.instance(caller)?;
        let from = state.dep_node(caller)?;
        let to = state.dep_node(other.name())?;
        let edge = state.dep_graph.find_edge(from, to).ok_or_else(|| {
            RuntimeError::NotFound(format!(
                "dependency of '{caller}' on '{}'",
                other.name()
            ))
        })?;
        if state.dep_graph.edge(edge).is_some_and(|k| k.is_static()) {
            return Err(RuntimeError::InvalidState(format!(
                "dependency of '{caller}' on '{}' is static",
                other.name()
            )));
        }
        state.dep_graph.remove_edge(edge)?;
        let target = state.instance(other.name())?.clone();
        target.info().release_strong_raw();
        debug!(module = caller, dependency = %other.name(), "dependency removed");
        Ok(())
    }

    /// Loads a symbol on behalf of `caller`. The exporting module must be a
    /// dependency of the caller, and namespaced symbols additionally
    /// require the namespace to be included.
    pub(crate) fn load_symbol_for(&self, caller: &str, key: &SymbolKey) -> Result<SymbolPayload> {
        let state = self.state.read()?;
        state.instance(caller)?;
        let (owner, payload) = Self::resolve_in(&state, key)?;
        if owner != caller {
            let from = state.dep_node(caller)?;
            let to = state.dep_node(&owner)?;
            if state.dep_graph.find_edge(from, to).is_none() {
                return Err(RuntimeError::NotFound(format!(
                    "'{owner}' is not a dependency of '{caller}'"
                )));
            }
            if key.namespace != GLOBAL_NAMESPACE && state.namespace_edge(caller, &key.namespace).is_none()
            {
                return Err(RuntimeError::NotFound(format!(
                    "namespace '{}' is not included by '{caller}'",
                    key.namespace
                )));
            }
        }
        Ok(payload)
    }

    pub(crate) fn read_parameter_for(
        &self,
        caller: &str,
        owner: &str,
        param: &str,
        ty: ParamType,
    ) -> Result<ParamValue> {
        let (instance, tier) = self.parameter_access(caller, owner)?;
        instance
            .parameters()
            .read_checked(owner, param, tier, Some(ty))
    }

    pub(crate) fn write_parameter_for(
        &self,
        caller: &str,
        owner: &str,
        param: &str,
        value: ParamValue,
    ) -> Result<()> {
        let (instance, tier) = self.parameter_access(caller, owner)?;
        instance.parameters().write_checked(owner, param, tier, value)
    }

    /// Resolves the caller's relationship to `owner` and clones the owner
    /// out so hooks run with the lock released.
    fn parameter_access(&self, caller: &str, owner: &str) -> Result<(Arc<ModuleInstance>, AccessTier)> {
        let state = self.state.read()?;
        state.instance(caller)?;
        let instance = state.instance(owner)?.clone();
        let tier = if caller == owner {
            AccessTier::Owner
        } else {
            let linked = match (state.dep_node(caller), state.dep_node(owner)) {
                (Ok(from), Ok(to)) => state.dep_graph.find_edge(from, to).is_some(),
                _ => false,
            };
            if linked {
                AccessTier::Dependency
            } else {
                AccessTier::Public
            }
        };
        Ok((instance, tier))
    }

    // ------------------------------------------------------------------
    // Loading support
    // ------------------------------------------------------------------

    pub(crate) fn contains_instance(&self, name: &str) -> Result<bool> {
        let state = self.state.read()?;
        Ok(state.instances.contains_key(name))
    }

    pub(crate) fn has_symbol_identity(&self, identity: &SymbolIdentity) -> Result<bool> {
        let state = self.state.read()?;
        Ok(state.symbol_index.contains_key(identity))
    }

    /// Resolves an import against the live registry: owner name plus a
    /// stable payload handle.
    pub(crate) fn resolve_symbol(&self, key: &SymbolKey) -> Result<(String, SymbolPayload)> {
        let state = self.state.read()?;
        Self::resolve_in(&state, key)
    }

    fn resolve_in(state: &RegistryState, key: &SymbolKey) -> Result<(String, SymbolPayload)> {
        let identity = key.identity();
        let entries = state
            .symbol_index
            .get(&identity)
            .ok_or_else(|| RuntimeError::NotFound(format!("symbol '{identity}'")))?;
        let best = entries
            .iter()
            .find(|entry| is_compatible(&entry.version, &key.version));
        let Some(entry) = best else {
            let newest = entries
                .first()
                .expect("symbol index entries are never empty");
            return Err(RuntimeError::VersionIncompatible {
                required: key.version.clone(),
                found: newest.version.clone(),
            });
        };
        let payload = state
            .instance(&entry.owner)?
            .export_payload(&identity)
            .ok_or_else(|| RuntimeError::NotFound(format!("symbol '{identity}'")))?;
        Ok((entry.owner.clone(), payload.1))
    }

    /// Inserts the graph nodes and static edges of an instance that is
    /// about to run its constructors. Static dependency targets get pinned;
    /// namespace includes must name an existing namespace unless the
    /// instance itself exports into it.
    pub(crate) fn link_loading(
        &self,
        instance: &Arc<ModuleInstance>,
        static_deps: &[String],
        namespaces: &[String],
    ) -> Result<()> {
        let name = instance.name().to_string();
        let mut state = self.state.write()?;
        if state.instances.contains_key(&name) || state.dep_nodes.contains_key(&name) {
            return Err(RuntimeError::AlreadyPresent(format!("module '{name}'")));
        }

        // Validate before mutating so a failure leaves no partial links.
        for dep in static_deps {
            let target = state.instance(dep)?;
            if target.info().state() != InstanceState::Live {
                return Err(RuntimeError::InvalidState(format!(
                    "dependency '{dep}' is {:?}",
                    target.info().state()
                )));
            }
        }
        let exports_into: Vec<bool> = namespaces
            .iter()
            .map(|ns| {
                instance
                    .descriptor()
                    .map(|d| d.exports_into(ns))
                    .unwrap_or(false)
            })
            .collect();
        for (ns, exports) in namespaces.iter().zip(&exports_into) {
            let exists = state.namespace_occupants.get(ns).copied().unwrap_or(0) > 0;
            if !exists && !exports {
                return Err(RuntimeError::NotFound(format!("namespace '{ns}'")));
            }
        }

        let dep_node = state.dep_graph.add_node(name.clone());
        state.dep_nodes.insert(name.clone(), dep_node);
        let ns_inst = state.ns_graph.add_node(NsNode::Instance(name.clone()));
        state.ns_inst_nodes.insert(name.clone(), ns_inst);

        for dep in static_deps {
            let to = state.dep_node(dep)?;
            state
                .dep_graph
                .add_edge(dep_node, to, DependencyKind::Static)?;
            state.instance(dep)?.info().acquire_strong_raw();
            debug!(module = %name, dependency = %dep, "static dependency linked");
        }
        for ns in namespaces {
            let to = state.ns_node_or_create(ns);
            state.ns_graph.add_edge(ns_inst, to, DependencyKind::Static)?;
        }
        Ok(())
    }

    /// Reverses [`link_loading`](Self::link_loading) for an instance whose
    /// load did not reach publication.
    pub(crate) fn unlink_loading(&self, instance: &Arc<ModuleInstance>) -> Result<()> {
        let mut state = self.state.write()?;
        Self::unlink_in(&mut state, instance.name());
        Ok(())
    }

    fn unlink_in(state: &mut RegistryState, name: &str) {
        if let Some(node) = state.dep_nodes.remove(name) {
            for target in state.dep_graph.neighbors_out(node) {
                let target_name = state.dep_graph.node(target).cloned();
                if let Some(target_name) = target_name
                    && let Some(target) = state.instances.get(&target_name)
                {
                    target.info().release_strong_raw();
                }
            }
            let _ = state.dep_graph.remove_node(node);
        }
        if let Some(node) = state.ns_inst_nodes.remove(name) {
            let included: Vec<String> = state
                .ns_graph
                .neighbors_out(node)
                .into_iter()
                .filter_map(|n| match state.ns_graph.node(n) {
                    Some(NsNode::Namespace(ns)) => Some(ns.clone()),
                    _ => None,
                })
                .collect();
            let _ = state.ns_graph.remove_node(node);
            for ns in included {
                state.gc_ns_node(&ns);
            }
        }
    }

    /// Publishes a fully constructed instance: transitions it live and
    /// makes its name, exports, and namespaces visible.
    pub(crate) fn publish(&self, instance: &Arc<ModuleInstance>) -> Result<()> {
        let name = instance.name().to_string();
        let mut state = self.state.write()?;
        if state.instances.contains_key(&name) {
            return Err(RuntimeError::AlreadyPresent(format!("module '{name}'")));
        }
        instance
            .info()
            .transition(&[InstanceState::Loading], InstanceState::Live)?;
        state.instances.insert(name.clone(), instance.clone());

        let mut exported = 0usize;
        if let Some(descriptor) = instance.descriptor() {
            for key in descriptor.export_keys() {
                let entries = state.symbol_index.entry(key.identity()).or_default();
                entries.push(SymbolEntry {
                    version: key.version.clone(),
                    owner: name.clone(),
                });
                entries.sort_by(|a, b| b.version.cmp_precedence(&a.version));
                *state
                    .namespace_occupants
                    .entry(key.namespace.clone())
                    .or_insert(0) += 1;
                state.ns_node_or_create(&key.namespace);
                exported += 1;
            }
        }
        // A mark that raced the load takes effect now.
        if instance.info().is_marked_unloadable() {
            let _ = instance.info().transition(
                &[InstanceState::Live],
                InstanceState::MarkedUnloadable,
            );
        }
        info!(module = %name, exports = exported, "instance published");
        Ok(())
    }

    /// Registers a pseudo instance that owns edges but exports nothing.
    pub(crate) fn register_root(&self, instance: &Arc<ModuleInstance>) -> Result<()> {
        let name = instance.name().to_string();
        let mut state = self.state.write()?;
        if state.instances.contains_key(&name) {
            return Err(RuntimeError::AlreadyPresent(format!("module '{name}'")));
        }
        let node = state.dep_graph.add_node(name.clone());
        state.dep_nodes.insert(name.clone(), node);
        let ns_inst = state.ns_graph.add_node(NsNode::Instance(name.clone()));
        state.ns_inst_nodes.insert(name.clone(), ns_inst);
        state.instances.insert(name.clone(), instance.clone());
        debug!(module = %name, "root instance registered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Tears down an instance whose info has already been claimed into
    /// `Unloading`. Runs the reverse of publication: stop event, dynamic
    /// symbols in reverse order, unpublication, state destructor, edge
    /// removal, death.
    pub(crate) fn teardown_instance(&self, instance: &Arc<ModuleInstance>) -> Result<()> {
        let name = instance.name().to_string();
        debug_assert_eq!(instance.info().state(), InstanceState::Unloading);

        if let Some(descriptor) = instance.descriptor().cloned() {
            if let Some(stop) = descriptor.stop_event() {
                (stop.on_stop)(instance);
            }
            for (idx, payload) in instance.drain_dynamic_payloads_reverse() {
                let export = &descriptor.dynamic_exports[idx];
                if let Some(destructor) = &export.destructor {
                    destructor(instance, payload);
                }
            }
        }

        {
            let mut state = self.state.write()?;
            state.instances.remove(&name);
            if let Some(descriptor) = instance.descriptor() {
                let keys: Vec<SymbolKey> = descriptor.export_keys().cloned().collect();
                state.remove_symbol_entries(&name, keys.into_iter());
            }
            info!(module = %name, "instance unpublished");
        }

        if let Some(state_object) = instance.take_state_object() {
            let destructor = instance
                .descriptor()
                .and_then(|d| d.instance_state())
                .and_then(|decl| decl.destructor.clone());
            match destructor {
                Some(destructor) => destructor(instance, state_object),
                None => drop(state_object),
            }
        }

        {
            let mut state = self.state.write()?;
            Self::unlink_in(&mut state, &name);
        }

        instance.info().set_state(InstanceState::Dead);
        debug!(module = %name, "instance dead");
        Ok(())
    }

    /// Tears down every instance that is marked unloadable, has no pins,
    /// and no inbound dependency edges; repeats until no instance
    /// qualifies. Idempotent.
    pub fn prune_instances(&self) -> Result<()> {
        loop {
            let candidate = {
                let state = self.state.read()?;
                state
                    .instances
                    .values()
                    .find(|inst| {
                        let info = inst.info();
                        info.state() == InstanceState::MarkedUnloadable
                            && info.strong_refs() == 0
                            && state
                                .dep_nodes
                                .get(inst.name())
                                .map(|&n| state.dep_graph.in_degree(n) == 0)
                                .unwrap_or(true)
                    })
                    .cloned()
            };
            let Some(instance) = candidate else {
                return Ok(());
            };
            if instance
                .info()
                .transition(&[InstanceState::MarkedUnloadable], InstanceState::Unloading)
                .is_err()
            {
                // Another pruner claimed it first.
                continue;
            }
            debug!(module = %instance.name(), "prune selected");
            self.teardown_instance(&instance)?;
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state.read() {
            Ok(state) => f
                .debug_struct("Registry")
                .field("instances", &state.instances.len())
                .field("symbols", &state.symbol_index.len())
                .field("namespaces", &state.namespace_occupants.len())
                .finish(),
            Err(_) => f.write_str("Registry(<poisoned>)"),
        }
    }
}

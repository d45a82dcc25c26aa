/// Dependency and namespace edge tests
///
/// Dynamic edges, strong ref accounting, prune gating, and namespace
/// inclusion rules.
/// Run with: cargo test --test dependency_tests
use std::sync::{Arc, Mutex};

use rustmodcore::{
    DependencyKind, ExportDescriptor, InstanceData, ModuleHost, ModuleInstance, RuntimeError,
    SymbolKey, SymbolPayload, Version,
};

type InstanceSlot = Arc<Mutex<Option<Arc<ModuleInstance>>>>;

fn capture_instance(
    builder: rustmodcore::ExportBuilder,
    slot: &InstanceSlot,
) -> rustmodcore::ExportBuilder {
    let slot = slot.clone();
    builder.instance_state(move |instance| {
        let slot = slot.clone();
        async move {
            *slot.lock().unwrap() = Some(instance);
            Ok(Box::new(()) as InstanceData)
        }
    })
}

async fn load_two(host: &Arc<ModuleHost>) -> (Arc<ModuleInstance>, Arc<ModuleInstance>) {
    let a_slot: InstanceSlot = Arc::new(Mutex::new(None));
    let b_slot: InstanceSlot = Arc::new(Mutex::new(None));
    let a = capture_instance(
        ExportDescriptor::builder("a")
            .export(SymbolKey::global("s", Version::new(1, 0, 0)), Arc::new(7u32)),
        &a_slot,
    )
    .build();
    let b = capture_instance(ExportDescriptor::builder("b"), &b_slot).build();

    let set = host.new_loading_set();
    set.add_module(host.root_instance(), a).unwrap();
    set.add_module(host.root_instance(), b).unwrap();
    set.commit().await.unwrap();

    let a = a_slot.lock().unwrap().clone().unwrap();
    let b = b_slot.lock().unwrap().clone().unwrap();
    (a, b)
}

#[tokio::test]
async fn dynamic_dependency_gates_prune_until_removed() {
    let host = ModuleHost::new().unwrap();
    let (a, b) = load_two(&host).await;
    let a_info = a.info().clone();

    assert_eq!(b.query_dependency(&a_info).unwrap(), None);
    b.add_dependency(&a_info).unwrap();
    assert_eq!(
        b.query_dependency(&a_info).unwrap(),
        Some(DependencyKind::Dynamic)
    );
    assert_eq!(a_info.strong_refs(), 1);

    // The inbound edge keeps "a" loaded through a prune pass.
    a_info.mark_unloadable();
    host.prune_instances().unwrap();
    assert!(host.find_by_name("a").is_ok());

    b.remove_dependency(&a_info).unwrap();
    assert_eq!(a_info.strong_refs(), 0);
    host.prune_instances().unwrap();
    assert!(host.find_by_name("a").is_err());
    assert!(host.find_by_name("b").is_ok());
}

#[tokio::test]
async fn dependency_edges_are_not_idempotent() {
    let host = ModuleHost::new().unwrap();
    let (a, b) = load_two(&host).await;
    let a_info = a.info().clone();

    b.add_dependency(&a_info).unwrap();
    assert!(matches!(
        b.add_dependency(&a_info),
        Err(RuntimeError::AlreadyPresent(_))
    ));
    b.remove_dependency(&a_info).unwrap();
    assert!(matches!(
        b.remove_dependency(&a_info),
        Err(RuntimeError::NotFound(_))
    ));
    // Add/remove returned everything to the prior state.
    assert_eq!(a_info.strong_refs(), 0);
    assert_eq!(b.query_dependency(&a_info).unwrap(), None);
}

#[tokio::test]
async fn symbols_load_only_through_dependencies() {
    let host = ModuleHost::new().unwrap();
    let (a, b) = load_two(&host).await;
    let key = SymbolKey::global("s", Version::new(1, 0, 0));

    assert!(matches!(
        b.load_symbol(&key),
        Err(RuntimeError::NotFound(_))
    ));
    b.add_dependency(a.info()).unwrap();
    let payload = b.load_symbol(&key).unwrap();
    assert_eq!(payload.downcast_ref::<u32>(), Some(&7));

    // Requesting a newer major version fails even with the edge.
    assert!(matches!(
        b.load_symbol(&SymbolKey::global("s", Version::new(2, 0, 0))),
        Err(RuntimeError::VersionIncompatible { .. })
    ));
}

#[tokio::test]
async fn static_dependencies_cannot_be_removed() {
    let host = ModuleHost::new().unwrap();
    let exporter = ExportDescriptor::builder("exporter")
        .export(SymbolKey::global("s", Version::new(1, 0, 0)), Arc::new(0u8))
        .build();
    let importer_slot: InstanceSlot = Arc::new(Mutex::new(None));
    let importer = capture_instance(
        ExportDescriptor::builder("importer")
            .import(SymbolKey::global("s", Version::new(1, 0, 0))),
        &importer_slot,
    )
    .build();

    let set = host.new_loading_set();
    set.add_module(host.root_instance(), exporter).unwrap();
    set.add_module(host.root_instance(), importer).unwrap();
    set.commit().await.unwrap();

    let importer = importer_slot.lock().unwrap().clone().unwrap();
    let exporter_info = host.find_by_name("exporter").unwrap();
    assert_eq!(
        importer.query_dependency(&exporter_info).unwrap(),
        Some(DependencyKind::Static)
    );
    assert!(matches!(
        importer.remove_dependency(&exporter_info),
        Err(RuntimeError::InvalidState(_))
    ));
    // The static edge pins the exporter.
    exporter_info.mark_unloadable();
    host.prune_instances().unwrap();
    assert!(host.find_by_name("exporter").is_ok());
}

#[tokio::test]
async fn cyclic_dynamic_dependencies_are_rejected() {
    let host = ModuleHost::new().unwrap();
    let (a, b) = load_two(&host).await;

    b.add_dependency(a.info()).unwrap();
    assert!(matches!(
        a.add_dependency(b.info()),
        Err(RuntimeError::WouldCycle { .. })
    ));
    assert!(matches!(
        a.add_dependency(a.info()),
        Err(RuntimeError::WouldCycle { .. })
    ));
}

#[tokio::test]
async fn dependencies_on_unloadable_targets_are_rejected() {
    let host = ModuleHost::new().unwrap();
    let (a, b) = load_two(&host).await;

    a.info().mark_unloadable();
    assert!(matches!(
        b.add_dependency(a.info()),
        Err(RuntimeError::InvalidState(_))
    ));
}

#[tokio::test]
async fn namespaces_are_included_dynamically() {
    let host = ModuleHost::new().unwrap();
    let exporter = ExportDescriptor::builder("gfx_provider")
        .namespace("gfx")
        .export(SymbolKey::new("blit", "gfx", Version::new(1, 0, 0)), Arc::new(5u16))
        .build();
    let plain_slot: InstanceSlot = Arc::new(Mutex::new(None));
    let plain = capture_instance(ExportDescriptor::builder("plain"), &plain_slot).build();

    let set = host.new_loading_set();
    set.add_module(host.root_instance(), exporter).unwrap();
    set.add_module(host.root_instance(), plain).unwrap();
    set.commit().await.unwrap();

    assert!(host.namespace_exists("gfx").unwrap());
    let plain = plain_slot.lock().unwrap().clone().unwrap();

    assert_eq!(plain.query_namespace("gfx").unwrap(), None);
    plain.add_namespace("gfx").unwrap();
    assert_eq!(
        plain.query_namespace("gfx").unwrap(),
        Some(DependencyKind::Dynamic)
    );
    assert!(matches!(
        plain.add_namespace("gfx"),
        Err(RuntimeError::AlreadyPresent(_))
    ));
    assert!(matches!(
        plain.add_namespace("missing"),
        Err(RuntimeError::NotFound(_))
    ));

    plain.remove_namespace("gfx").unwrap();
    assert_eq!(plain.query_namespace("gfx").unwrap(), None);
    assert!(matches!(
        plain.remove_namespace("gfx"),
        Err(RuntimeError::NotFound(_))
    ));
}

#[tokio::test]
async fn namespaced_symbols_require_inclusion_and_dependency() {
    let host = ModuleHost::new().unwrap();
    let exporter = ExportDescriptor::builder("gfx_provider")
        .namespace("gfx")
        .export(SymbolKey::new("blit", "gfx", Version::new(1, 0, 0)), Arc::new(5u16))
        .build();
    let user_slot: InstanceSlot = Arc::new(Mutex::new(None));
    let user = capture_instance(ExportDescriptor::builder("user"), &user_slot).build();

    let set = host.new_loading_set();
    set.add_module(host.root_instance(), exporter).unwrap();
    set.add_module(host.root_instance(), user).unwrap();
    set.commit().await.unwrap();

    let user = user_slot.lock().unwrap().clone().unwrap();
    let key = SymbolKey::new("blit", "gfx", Version::new(1, 0, 0));
    let provider_info = host.find_by_name("gfx_provider").unwrap();

    user.add_dependency(&provider_info).unwrap();
    // A dependency alone is not enough for namespaced symbols.
    assert!(matches!(
        user.load_symbol(&key),
        Err(RuntimeError::NotFound(_))
    ));
    user.add_namespace("gfx").unwrap();
    assert_eq!(user.load_symbol(&key).unwrap().downcast_ref::<u16>(), Some(&5));

    // Excluding the namespace revokes access again.
    user.remove_namespace("gfx").unwrap();
    assert!(user.load_symbol(&key).is_err());
}

#[tokio::test]
async fn static_namespace_includes_cannot_be_removed() {
    let host = ModuleHost::new().unwrap();
    let exporter = ExportDescriptor::builder("gfx_provider")
        .namespace("gfx")
        .export(SymbolKey::new("blit", "gfx", Version::new(1, 0, 0)), Arc::new(5u16))
        .build();
    let consumer_slot: InstanceSlot = Arc::new(Mutex::new(None));
    let consumer = capture_instance(
        ExportDescriptor::builder("consumer")
            .namespace("gfx")
            .import(SymbolKey::new("blit", "gfx", Version::new(1, 0, 0))),
        &consumer_slot,
    )
    .build();

    let set = host.new_loading_set();
    set.add_module(host.root_instance(), exporter).unwrap();
    set.add_module(host.root_instance(), consumer).unwrap();
    set.commit().await.unwrap();

    let consumer = consumer_slot.lock().unwrap().clone().unwrap();
    assert_eq!(
        consumer.query_namespace("gfx").unwrap(),
        Some(DependencyKind::Static)
    );
    assert!(matches!(
        consumer.remove_namespace("gfx"),
        Err(RuntimeError::InvalidState(_))
    ));
}

#[tokio::test]
async fn static_dependency_modifier_links_to_a_loaded_instance() {
    let host = ModuleHost::new().unwrap();
    let base = ExportDescriptor::builder("base").build();
    let set = host.new_loading_set();
    set.add_module(host.root_instance(), base).unwrap();
    set.commit().await.unwrap();
    drop(set);

    let base_info = host.find_by_name("base").unwrap();
    let pin = base_info.try_acquire_strong().unwrap();

    let child_slot: InstanceSlot = Arc::new(Mutex::new(None));
    let child = capture_instance(
        ExportDescriptor::builder("child").static_dependency(pin),
        &child_slot,
    )
    .build();
    let set = host.new_loading_set();
    set.add_module(host.root_instance(), child).unwrap();
    set.commit().await.unwrap();
    drop(set);

    let child = child_slot.lock().unwrap().take().unwrap();
    assert_eq!(
        child.query_dependency(&base_info).unwrap(),
        Some(DependencyKind::Static)
    );

    // Unloading the child releases the edge, then base can go too.
    child.info().mark_unloadable();
    base_info.mark_unloadable();
    host.prune_instances().unwrap();
    assert!(host.find_by_name("child").is_err());
    // The descriptor (and with it the modifier pin) died with the child.
    drop(child);
    host.prune_instances().unwrap();
    assert!(host.find_by_name("base").is_err());
}

#[tokio::test]
async fn payloads_shared_through_dependencies() {
    // A symbol payload stays usable while its handle lives, even after the
    // dependency that granted access is gone.
    let host = ModuleHost::new().unwrap();
    let (a, b) = load_two(&host).await;
    b.add_dependency(a.info()).unwrap();
    let payload: SymbolPayload = b
        .load_symbol(&SymbolKey::global("s", Version::new(1, 0, 0)))
        .unwrap();
    b.remove_dependency(a.info()).unwrap();
    assert_eq!(payload.downcast_ref::<u32>(), Some(&7));
}

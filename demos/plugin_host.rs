//! Minimal host: declare two modules, load them as one batch, inspect the
//! registry, then shut down.
//!
//! Run with: cargo run --example plugin_host

use std::sync::Arc;

use rustmodcore::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let host = ModuleHost::new()?;

    let clock = ExportDescriptor::builder("clock")
        .description("monotonic tick counter")
        .parameter(
            ParamDecl::new("resolution_ms", ParamValue::U32(100))
                .with_read_group(ParamAccessGroup::Public)
                .with_write_group(ParamAccessGroup::Dependency),
        )
        .export(
            SymbolKey::global("tick_source", Version::new(1, 0, 0)),
            Arc::new("wall-clock"),
        )
        .build();

    let scheduler = ExportDescriptor::builder("scheduler")
        .description("runs callbacks on clock ticks")
        .import(SymbolKey::global("tick_source", Version::new(1, 0, 0)))
        .on_start(|instance| async move {
            let resolution =
                instance.read_parameter("clock", "resolution_ms", ParamType::U32)?;
            println!("scheduler started, clock resolution = {resolution}");
            Ok(())
        })
        .on_stop(|_| println!("scheduler stopping"))
        .build();

    let set = host.new_loading_set();
    set.add_module(host.root_instance(), clock)?;
    set.add_module(host.root_instance(), scheduler)?;
    set.commit().await?;

    for name in ["clock", "scheduler"] {
        let status = set.module_status(name).await?;
        println!("{name}: loaded = {}", status.is_loaded());
    }

    let owner = host.find_by_symbol(&SymbolKey::global("tick_source", Version::new(1, 0, 0)))?;
    println!("tick_source is exported by '{}'", owner.name());

    host.shutdown().await
}

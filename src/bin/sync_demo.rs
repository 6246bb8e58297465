//! Master/replica synchronization demo
//!
//! Run with: RUST_LOG=info cargo run --bin sync_demo [handler-config.json]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use statesync::sync::HealthStatus;
use statesync::{
    EventGenerator, EventHandler, HandlerCallbacks, HandlerConfig, ManagerConfig, StateEvent,
    StateStore, StoreConfig, SyncManager, Value,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let base_config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading handler config {}", path))?;
            HandlerConfig::from_json(&raw)?
        }
        None => HandlerConfig {
            batch_timeout: Duration::from_millis(20),
            ..HandlerConfig::default()
        },
    };

    println!("\n🔄 State Synchronization Demo");
    println!("=============================");

    let master = Arc::new(StateStore::new(StoreConfig::default())?);
    master.set("/session/title", "Planning")?;

    let manager = SyncManager::new(Arc::clone(&master), ManagerConfig::default())?;

    let mut replicas = Vec::new();
    for name in ["ui-left", "ui-right"] {
        let store = Arc::new(StateStore::default());
        let label = name.to_string();
        let callbacks = HandlerCallbacks::new()
            .on_delta(move |delta| {
                log::info!("[{}] applied delta {}", label, delta.sequence_number);
            })
            .on_error(|e| log::error!("sync error: {}", e));
        let handler = Arc::new(
            EventHandler::new(Arc::clone(&store), base_config.clone().with_client_id(name))?
                .with_callbacks(callbacks),
        );
        handler.start()?;
        manager.register(Arc::clone(&handler))?;
        replicas.push((store, handler));
    }

    master.set("/session/participants", Value::Array(vec!["ana".into(), "bo".into()]))?;
    master.set("/session/status", "active")?;
    let mut tx = master.begin();
    tx.apply(statesync::Patch::from(vec![
        statesync::PatchOperation::replace("/session/title", "Planning (final)"),
        statesync::PatchOperation::add("/session/notes", "ship on friday"),
    ]))?;
    tx.commit()?;

    // Everything the transport would carry for a late joiner, compressed
    let snapshot = EventGenerator::new(Arc::clone(&master)).generate_snapshot();
    let payload = replicas[0].1.encode_event(&StateEvent::from(snapshot))?;
    println!("Snapshot payload: {} bytes", payload.len());

    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("\nMaster  (v{}): {}", master.version(), master.get_state());
    for (store, handler) in &replicas {
        let status = manager.client_status(handler.client_id())?;
        let marker = if store.get_state() == master.get_state() {
            "✅"
        } else {
            "❌"
        };
        println!(
            "{} {} (v{}): {} [{} deltas, health {:?}]",
            marker,
            handler.client_id(),
            store.version(),
            store.get_state(),
            status.stats.deltas_applied,
            status.health.status
        );
        if status.health.status != HealthStatus::Healthy {
            log::warn!("{} is {:?}", handler.client_id(), status.health.status);
        }
    }

    manager.shutdown().await;
    Ok(())
}

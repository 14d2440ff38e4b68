//! Keymaster Session Reaper daemon.
//!
//! Composition root: the one place `SqliteStore` and `Ssh2Transport` are constructed and handed
//! out as `Arc<dyn Store>` / `Arc<dyn Transport>` (spec.md §9 — no process-wide singletons
//! elsewhere). Runs `RecoverFromCrash` once at start, then the periodic Reaper sweep on a
//! blocking background thread until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use keymaster_bootstrap::{recover_from_crash, BootstrapEngine, BootstrapRegistry, Reaper};
use keymaster_config::KeymasterConfig;
use keymaster_core::store::Store;
use keymaster_ssh::{Ssh2Transport, Transport};
use keymaster_store_sqlite::SqliteStore;

fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[keymaster-reaperd] .env not loaded: {e} (using system environment)");
    }
    keymaster_config::telemetry::init_tracing();

    let config = KeymasterConfig::load().expect("load KeymasterConfig");

    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&config.db_path).expect("open sqlite store"));
    let transport: Arc<dyn Transport> = Arc::new(Ssh2Transport::new());
    let registry = Arc::new(BootstrapRegistry::new());

    tracing::info!(db_path = %config.db_path, interval_secs = config.reaper_interval_secs, "keymaster-reaperd starting");

    recover_from_crash(&store, &transport, &registry);

    let mut reaper = Reaper::spawn(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&registry),
        Duration::from_secs(config.reaper_interval_secs),
    );

    let engine = BootstrapEngine::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        Arc::clone(&registry),
        chrono::Duration::hours(config.bootstrap_ttl_hours),
    );

    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .expect("install signal handler");

    // Block the main thread until a signal arrives; the Reaper sweeps on its own thread in the
    // meantime.
    let _ = shutdown_rx.recv();

    tracing::info!("shutdown signal received; cleaning up active bootstrap sessions");
    engine.cleanup_all_active_sessions();
    reaper.stop();
    tracing::info!("keymaster-reaperd stopped");
}

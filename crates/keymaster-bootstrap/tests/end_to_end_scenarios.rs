//! End-to-end bootstrap scenarios against `FakeStore`/`FakeTransport`.

use std::sync::Arc;

use chrono::{Duration, Utc};
use keymaster_bootstrap::{recover_from_crash, BootstrapEngine, BootstrapRegistry};
use keymaster_core::model::{BootstrapSession, BootstrapStatus, PublicKeyMaterial};
use keymaster_core::store::fake::FakeStore;
use keymaster_core::store::Store;
use keymaster_ssh::{FakeTransport, Transport};

fn setup() -> (Arc<FakeStore>, Arc<FakeTransport>, Arc<BootstrapRegistry>) {
    let store = Arc::new(FakeStore::new());
    let transport = Arc::new(FakeTransport::new());
    store
        .rotate_system_key(
            PublicKeyMaterial {
                algorithm: "ssh-ed25519".into(),
                key_data: "SYSKEY".into(),
            },
            "PEM-DATA",
        )
        .unwrap();
    (store, transport, Arc::new(BootstrapRegistry::new()))
}

#[test]
fn scenario_4_bootstrap_happy_path() {
    let (store, transport, registry) = setup();
    let engine = BootstrapEngine::new(store.clone(), transport.clone(), registry.clone(), Duration::hours(24));

    let paste = engine.start("deploy", "newhost", None, &[]).unwrap();
    engine.fetch_host_key(&paste.session_id).unwrap();
    engine.accept_host_key_and_test(&paste.session_id).unwrap();
    engine.select_keys(&paste.session_id, vec![]).unwrap();
    let account_id = engine.commit(&paste.session_id).unwrap();

    // Bootstrap session row is gone and the ephemeral secret with it.
    assert!(store.get_bootstrap_session(&paste.session_id).is_err());
    assert!(registry.is_empty());

    // Account row exists at the active system key's serial.
    let account = store.get_account(account_id).unwrap();
    let active = store.active_system_key().unwrap();
    assert_eq!(account.serial, active.serial);

    // known_hosts row is present for the newly bootstrapped host.
    assert!(store.get_known_host_key("newhost").unwrap().is_some());

    // Remote file holds only the managed block; the pasted temp key line is gone.
    let remote_text = String::from_utf8(transport.remote_file("newhost").unwrap()).unwrap();
    assert!(remote_text.contains("# Keymaster Managed Keys"));
    assert!(!remote_text.contains("keymaster-bootstrap-temp"));
}

#[test]
fn scenario_5_bootstrap_crash_recovery() {
    let (store, transport, registry) = setup();

    // A session row left behind by a process that died mid-flight: active status, expiry
    // already in the past, and no matching registry entry (the ephemeral key lived only in
    // that dead process's memory).
    let session = BootstrapSession {
        id: "crashed-session".into(),
        username: "deploy".into(),
        hostname: "newhost".into(),
        label: None,
        tags: vec![],
        temp_public_key: PublicKeyMaterial {
            algorithm: "ssh-ed25519".into(),
            key_data: "TEMPKEY".into(),
        },
        created_at: Utc::now() - Duration::hours(25),
        expires_at: Utc::now() - Duration::hours(1),
        status: BootstrapStatus::Active,
    };
    store.create_bootstrap_session(&session).unwrap();
    assert!(registry.with_entry("crashed-session", |_| ()).is_none());

    let accounts_before = store.list_accounts().unwrap().len();
    let store_dyn: Arc<dyn Store> = store.clone();
    let transport_dyn: Arc<dyn Transport> = transport.clone();
    recover_from_crash(&store_dyn, &transport_dyn, &registry);

    assert!(store.get_bootstrap_session("crashed-session").is_err());
    assert_eq!(store.list_accounts().unwrap().len(), accounts_before);

    let reaped = store
        .list_audit_log(10)
        .unwrap()
        .into_iter()
        .any(|entry| entry.action == "BOOTSTRAP_REAPED");
    assert!(reaped);
}

//! End-to-end scenarios against `FakeStore`/`FakeTransport`, one per numbered case.

use std::sync::Arc;

use keymaster_core::model::PublicKeyMaterial;
use keymaster_core::store::fake::FakeStore;
use keymaster_core::store::Store;
use keymaster_deploy::{AuditOutcome, Auditor, DeployOutcome, Deployer};
use keymaster_ssh::FakeTransport;

fn system_key(data: &str) -> PublicKeyMaterial {
    PublicKeyMaterial {
        algorithm: "ssh-ed25519".into(),
        key_data: data.into(),
    }
}

/// Wires `host`'s known-host row to the base64 of `FakeTransport`'s auto-generated
/// `fake-host-key:{host}` blob, the convention used across this crate's unit tests.
fn trust_host(store: &FakeStore, transport: &FakeTransport, host: &str) {
    let blob = format!("fake-host-key:{host}").into_bytes();
    transport.set_host_key(host, blob.clone());
    store
        .set_known_host_key(host, &format!("ssh-ed25519 {}", base64_encode(&blob)))
        .unwrap();
}

fn base64_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        let triple = (b0 as u32) << 16 | (b1 as u32) << 8 | b2 as u32;
        out.push(ALPHABET[(triple >> 18 & 0x3f) as usize] as char);
        out.push(ALPHABET[(triple >> 12 & 0x3f) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(triple >> 6 & 0x3f) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[(triple & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}

#[test]
fn scenario_1_initial_deploy() {
    let store = Arc::new(FakeStore::new());
    let transport = Arc::new(FakeTransport::new());

    store.rotate_system_key(system_key("SYS1"), "PEM-1").unwrap();
    let alice = store.add_account("alice", "h1", None, &[]).unwrap();
    let k1 = store.add_key("ssh-ed25519", "AAAA", "alice@laptop", false).unwrap();
    store.assign_key(k1, alice).unwrap();
    trust_host(&store, &transport, "h1");

    let deployer = Deployer::new(store.clone(), transport.clone());
    let outcome = deployer.deploy_account(alice, false).unwrap();
    assert!(matches!(outcome, DeployOutcome::Success { serial: 1, .. }));

    let account = store.get_account(alice).unwrap();
    assert_eq!(account.serial, 1);
    assert!(!account.is_dirty);

    let remote = String::from_utf8(transport.remote_file("h1").unwrap()).unwrap();
    assert!(remote.contains("# Keymaster Managed Keys"));
    assert!(remote.contains("alice@laptop"));
}

#[test]
fn scenario_2_global_add_dirties_every_deployed_account() {
    let store = Arc::new(FakeStore::new());
    let transport = Arc::new(FakeTransport::new());

    store.rotate_system_key(system_key("SYS1"), "PEM-1").unwrap();
    let a1 = store.add_account("alice", "h1", None, &[]).unwrap();
    let a2 = store.add_account("bob", "h2", None, &[]).unwrap();
    trust_host(&store, &transport, "h1");
    trust_host(&store, &transport, "h2");

    let deployer = Deployer::new(store.clone(), transport.clone());
    deployer.deploy_account(a1, false).unwrap();
    deployer.deploy_account(a2, false).unwrap();
    assert!(!store.get_account(a1).unwrap().is_dirty);
    assert!(!store.get_account(a2).unwrap().is_dirty);
    let hash_before_a1 = store.get_account(a1).unwrap().key_hash;
    let hash_before_a2 = store.get_account(a2).unwrap().key_hash;

    store.add_key("ssh-ed25519", "GGGG", "ops@global", true).unwrap();

    assert!(store.get_account(a1).unwrap().is_dirty);
    assert!(store.get_account(a2).unwrap().is_dirty);
    assert_ne!(store.get_account(a1).unwrap().key_hash, hash_before_a1);
    assert_ne!(store.get_account(a2).unwrap().key_hash, hash_before_a2);

    let auditor = Auditor::new(store.clone(), transport.clone());
    assert!(matches!(
        auditor.audit_strict(a1).unwrap(),
        AuditOutcome::Mismatch { .. }
    ));
    assert!(matches!(
        auditor.audit_strict(a2).unwrap(),
        AuditOutcome::Mismatch { .. }
    ));

    deployer.deploy_account(a1, false).unwrap();
    deployer.deploy_account(a2, false).unwrap();
    assert_eq!(auditor.audit_strict(a1).unwrap(), AuditOutcome::Match);
    assert_eq!(auditor.audit_strict(a2).unwrap(), AuditOutcome::Match);
}

#[test]
fn scenario_3_rotation_with_lag() {
    let store = Arc::new(FakeStore::new());
    let transport = Arc::new(FakeTransport::new());
    let deployer = Deployer::new(store.clone(), transport.clone());

    store.rotate_system_key(system_key("SYS1"), "PEM-1").unwrap();
    let a1 = store.add_account("alice", "h1", None, &[]).unwrap();
    let a2 = store.add_account("bob", "h2", None, &[]).unwrap();
    let a3 = store.add_account("carol", "h3", None, &[]).unwrap();
    trust_host(&store, &transport, "h1");
    trust_host(&store, &transport, "h2");
    trust_host(&store, &transport, "h3");
    for acc in [a1, a2, a3] {
        deployer.deploy_account(acc, false).unwrap();
    }

    // Given: 3 active accounts at serial 2.
    store.rotate_system_key(system_key("SYS2"), "PEM-2").unwrap();
    for acc in [a1, a2, a3] {
        deployer.deploy_account(acc, false).unwrap();
    }
    assert_eq!(store.get_account(a3).unwrap().serial, 2);

    // Ops: rotate-system-key (-> 3) then deploy a1, a2 only.
    store.rotate_system_key(system_key("SYS3"), "PEM-3").unwrap();
    deployer.deploy_account(a1, false).unwrap();
    deployer.deploy_account(a2, false).unwrap();

    assert_eq!(store.get_account(a1).unwrap().serial, 3);
    assert_eq!(store.get_account(a2).unwrap().serial, 3);
    assert_eq!(store.get_account(a3).unwrap().serial, 2);

    let auditor = Auditor::new(store.clone(), transport.clone());
    assert!(matches!(
        auditor.audit_strict(a3).unwrap(),
        AuditOutcome::Mismatch { .. }
    ));

    // a3 is still reachable: auditing it doesn't fail the connection, it's serial-mode row
    // still agrees with what was actually signed and written under serial 2.
    assert_eq!(auditor.audit_serial(a3).unwrap(), AuditOutcome::SerialMatch);
}

#[test]
fn scenario_6_strict_vs_serial_audit_divergence() {
    let store = Arc::new(FakeStore::new());
    let transport = Arc::new(FakeTransport::new());
    let deployer = Deployer::new(store.clone(), transport.clone());

    for data in ["SYS1", "SYS2", "SYS3"] {
        store.rotate_system_key(system_key(data), "PEM").unwrap();
    }
    let acc = store.add_account("alice", "h1", None, &[]).unwrap();
    trust_host(&store, &transport, "h1");
    deployer.deploy_account(acc, false).unwrap();
    assert_eq!(store.get_account(acc).unwrap().serial, 3);

    let mut remote = transport.remote_file("h1").unwrap();
    remote.extend_from_slice(b"ssh-ed25519 HANDEDITED hand-added\n");
    transport.set_remote_file("h1", remote);

    let auditor = Auditor::new(store.clone(), transport.clone());
    assert_eq!(auditor.audit_serial(acc).unwrap(), AuditOutcome::SerialMatch);
    assert!(matches!(
        auditor.audit_strict(acc).unwrap(),
        AuditOutcome::Mismatch { .. }
    ));
}

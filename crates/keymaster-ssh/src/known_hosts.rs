//! Hostname canonicalization and host-key fingerprinting, per spec.md §4.4/§6: host-key entries
//! are keyed by canonical hostname (port stripped, IPv6 unbracketed), and every remote host key
//! is fingerprinted both ways operators recognize it (SHA-256 and the legacy MD5 form).

use md5::Md5;
use sha2::{Digest, Sha256};

/// Canonicalization lives in `keymaster-core` so the `Store`'s known-hosts boundary can apply it
/// without this crate's transport dependencies; re-exported here since this is where callers
/// outside the store (bootstrap, deployer, auditor, reaper) have always reached for it.
pub use keymaster_core::hostname::canonicalize_hostname;

/// SHA-256 fingerprint of a raw host-key blob, base64-encoded the way `ssh-keygen -E sha256`
/// prints it (no `SHA256:` prefix; callers that want the familiar display form add it).
pub fn fingerprint_sha256(key_blob: &[u8]) -> String {
    let digest = Sha256::digest(key_blob);
    base64_no_pad(&digest)
}

/// Legacy colon-separated hex MD5 fingerprint, still worth showing operators during bootstrap
/// since many still recognize hosts by it.
pub fn fingerprint_md5(key_blob: &[u8]) -> String {
    let digest = Md5::digest(key_blob);
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Host-key algorithm names spec.md §4.4 flags as weak: DSA entirely, and any `ssh-rsa` offer
/// (no modulus inspection — libssh2 doesn't expose key size for host keys, so the type name
/// alone decides this, matching the blanket "ssh-rsa < 2048 bits" wording loosely).
pub fn is_weak_algorithm(algorithm: &str) -> bool {
    matches!(algorithm, "ssh-dss" | "ssh-rsa")
}

fn base64_no_pad(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() * 4).div_ceil(3));
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        let triple = (b0 as u32) << 16 | (b1 as u32) << 8 | b2 as u32;
        out.push(ALPHABET[(triple >> 18 & 0x3f) as usize] as char);
        out.push(ALPHABET[(triple >> 12 & 0x3f) as usize] as char);
        if chunk.len() > 1 {
            out.push(ALPHABET[(triple >> 6 & 0x3f) as usize] as char);
        }
        if chunk.len() > 2 {
            out.push(ALPHABET[(triple & 0x3f) as usize] as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // canonicalize_hostname's own tests live in keymaster-core, where it's defined.

    #[test]
    fn weak_algorithm_flags_dsa_and_rsa_but_not_ed25519() {
        assert!(is_weak_algorithm("ssh-dss"));
        assert!(is_weak_algorithm("ssh-rsa"));
        assert!(!is_weak_algorithm("ssh-ed25519"));
    }

    #[test]
    fn fingerprints_are_nonempty_and_deterministic() {
        let blob = b"fake host key blob";
        assert_eq!(fingerprint_sha256(blob), fingerprint_sha256(blob));
        assert_eq!(fingerprint_md5(blob), fingerprint_md5(blob));
        assert!(fingerprint_md5(blob).contains(':'));
    }
}

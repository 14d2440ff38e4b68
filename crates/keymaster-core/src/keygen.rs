//! Ed25519 OpenSSH keypair generation, shared by the Rotator (system keys) and the Bootstrap
//! Engine (ephemeral per-session keys) — one code path for "make an ed25519 OpenSSH keypair"
//! per spec.md §9's anti-duplication guidance, applied by analogy to key generation.

use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use keymaster_secret::Secret;

use crate::error::{KeymasterError, Result};
use crate::model::PublicKeyMaterial;

/// Generates a fresh ed25519 keypair. When `passphrase` is set, the returned private key's
/// OpenSSH PEM is encrypted with it; otherwise it is marshalled unencrypted.
pub fn generate_ed25519_keypair(
    passphrase: Option<&Secret<Vec<u8>>>,
) -> Result<(PublicKeyMaterial, Secret<String>)> {
    let private_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| KeymasterError::Internal(format!("key generation failed: {e}")))?;

    let public_openssh = private_key
        .public_key()
        .to_openssh()
        .map_err(|e| KeymasterError::Internal(format!("public key marshalling failed: {e}")))?;
    let mut parts = public_openssh.split_whitespace();
    let algorithm = parts
        .next()
        .ok_or_else(|| KeymasterError::Internal("empty public key line".into()))?
        .to_string();
    let key_data = parts
        .next()
        .ok_or_else(|| KeymasterError::Internal("malformed public key line".into()))?
        .to_string();

    let private_pem = match passphrase {
        Some(passphrase) => passphrase.expose_bytes(|bytes| {
            private_key
                .encrypt(&mut OsRng, bytes)
                .map_err(|e| KeymasterError::Internal(format!("key encryption failed: {e}")))?
                .to_openssh(LineEnding::LF)
                .map_err(|e| KeymasterError::Internal(format!("private key marshalling failed: {e}")))
        })?,
        None => private_key
            .to_openssh(LineEnding::LF)
            .map_err(|e| KeymasterError::Internal(format!("private key marshalling failed: {e}")))?,
    };

    Ok((
        PublicKeyMaterial { algorithm, key_data },
        Secret::new(private_pem.to_string()),
    ))
}

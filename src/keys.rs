use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use x25519_dalek::{PublicKey, StaticSecret};

pub const KEY_LEN: usize = 32;

/// x25519 keypair used by the reality transport. Both halves are kept in the
/// base64url (unpadded) text form the engine and the controller expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

#[derive(Debug, Clone)]
pub struct LoadedKeyPair {
    pub keys: KeyPair,
    pub is_new: bool,
}

pub fn generate_reality_keys() -> Result<KeyPair> {
    let mut secret = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut secret)
        .map_err(|err| anyhow!("os rng failed: {}", err))?;
    clamp(&mut secret);
    Ok(keys_from_secret(secret))
}

pub fn derive_public_key(private_key: &str) -> Result<KeyPair> {
    let bytes = decode_private_key(private_key)?;
    let mut secret = [0u8; KEY_LEN];
    secret.copy_from_slice(&bytes);
    Ok(keys_from_secret(secret))
}

/// Loads the private key at `path`, or generates and persists a fresh one when
/// the file is missing or does not hold a valid key.
pub fn load_or_create(path: &Path) -> Result<LoadedKeyPair> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_key_dir(parent)
                .with_context(|| format!("failed to create key directory {}", parent.display()))?;
        }
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match derive_public_key(&contents) {
            Ok(keys) => {
                return Ok(LoadedKeyPair {
                    keys,
                    is_new: false,
                })
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "stored reality key is unusable, regenerating"
                );
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read reality key, regenerating"
            );
        }
    }

    let keys = generate_reality_keys()?;
    write_private_key(path, &keys.private_key)?;
    Ok(LoadedKeyPair { keys, is_new: true })
}

/// Reads the stored keypair without creating one.
pub fn load_existing(path: &Path) -> Option<KeyPair> {
    let contents = std::fs::read_to_string(path).ok()?;
    derive_public_key(&contents).ok()
}

fn keys_from_secret(secret: [u8; KEY_LEN]) -> KeyPair {
    let private_key = URL_SAFE_NO_PAD.encode(secret);
    let secret = StaticSecret::from(secret);
    let public = PublicKey::from(&secret);
    KeyPair {
        private_key,
        public_key: URL_SAFE_NO_PAD.encode(public.to_bytes()),
    }
}

fn clamp(secret: &mut [u8; KEY_LEN]) {
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
}

fn decode_private_key(encoded: &str) -> Result<Vec<u8>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .context("invalid reality private key: not base64url")?;
    if bytes.len() != KEY_LEN {
        return Err(anyhow!(
            "invalid reality private key: expected {} bytes, got {} bytes",
            KEY_LEN,
            bytes.len()
        ));
    }
    Ok(bytes)
}

#[cfg(unix)]
fn create_key_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_key_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_private_key(path: &Path, private_key: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to open key file {}", path.display()))?;
    // an existing file keeps its old mode on open, so tighten it explicitly
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(private_key.as_bytes())
        .with_context(|| format!("failed to write key file {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, private_key: &str) -> Result<()> {
    std::fs::write(path, private_key)
        .with_context(|| format!("failed to write key file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_derives_public_key() {
        let private = URL_SAFE_NO_PAD.encode([9u8; 32]);
        let pair = derive_public_key(&private).expect("reality key parse");
        assert_eq!(pair.private_key, private);
        assert_eq!(URL_SAFE_NO_PAD.decode(&pair.public_key).unwrap().len(), 32);
    }

    #[test]
    fn private_key_rejects_invalid_len() {
        let private = URL_SAFE_NO_PAD.encode([1u8; 16]);
        let err = derive_public_key(&private).unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
    }

    #[test]
    fn generated_keys_are_clamped() {
        let pair = generate_reality_keys().expect("generate");
        let bytes = URL_SAFE_NO_PAD.decode(&pair.private_key).unwrap();
        assert_eq!(bytes[0] & 7, 0);
        assert_eq!(bytes[31] & 128, 0);
        assert_eq!(bytes[31] & 64, 64);
    }

    #[test]
    fn load_or_create_reuses_persisted_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("reality_private.key");

        let first = load_or_create(&path).expect("first load");
        assert!(first.is_new);
        assert!(path.is_file());

        let second = load_or_create(&path).expect("second load");
        assert!(!second.is_new);
        assert_eq!(first.keys, second.keys);
    }

    #[cfg(unix)]
    #[test]
    fn persisted_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reality_private.key");
        load_or_create(&path).expect("create");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_key_file_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reality_private.key");
        std::fs::write(&path, "not a key at all").unwrap();

        let loaded = load_or_create(&path).expect("self heal");
        assert!(loaded.is_new);
        let stored = std::fs::read_to_string(&path).unwrap();
        assert_eq!(stored, loaded.keys.private_key);

        std::fs::write(&path, URL_SAFE_NO_PAD.encode([4u8; 20])).unwrap();
        assert!(load_or_create(&path).unwrap().is_new);
    }
}

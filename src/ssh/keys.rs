//! Key material loading and caching
//!
//! Loads OpenSSH and PuTTY-PPK private keys and shares the parsed keypair
//! across every session of a batch. Entries are keyed by (canonical path,
//! passphrase hash); failures are cached too, so a bad key is parsed once
//! per batch instead of once per host. The cache is created per batch run
//! and dropped with it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use russh::keys::PrivateKey;
use tracing::debug;

use super::config::{AuthMethod, Secret};
use super::error::SshError;
use super::ppk;

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    passphrase_hash: u64,
}

/// Per-batch cache of loaded private keys.
pub struct KeyCache {
    entries: DashMap<CacheKey, Result<Arc<PrivateKey>, String>>,
    loads: AtomicUsize,
}

impl KeyCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            loads: AtomicUsize::new(0),
        }
    }

    /// Resolve the key material for `auth`.
    ///
    /// Returns `Ok(None)` for password authentication. Key failures come
    /// back as `SshError::KeyError`, rebuilt from the cached message on
    /// repeat lookups.
    pub fn load(&self, auth: &AuthMethod) -> Result<Option<Arc<PrivateKey>>, SshError> {
        let (path, passphrase) = match auth {
            AuthMethod::Password { .. } => return Ok(None),
            AuthMethod::OpensshKey {
                key_path,
                passphrase,
            } => (key_path, passphrase.as_ref()),
            AuthMethod::PpkKey {
                ppk_path,
                passphrase,
            } => (ppk_path, passphrase.as_ref()),
        };

        let key = CacheKey {
            path: canonical(path),
            passphrase_hash: hash_passphrase(passphrase),
        };

        // entry() keeps concurrent first lookups from parsing the same
        // file more than once: losers block on the shard and see the
        // winner's result
        let entry = self.entries.entry(key).or_insert_with(|| {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let loaded = match auth {
                AuthMethod::Password { .. } => unreachable!("handled above"),
                AuthMethod::OpensshKey { key_path, .. } => load_openssh(key_path, passphrase),
                AuthMethod::PpkKey { ppk_path, .. } => load_ppk(ppk_path),
            };
            loaded.map(Arc::new).map_err(|e| match e {
                SshError::KeyError(message) => message,
                other => other.to_string(),
            })
        });

        match entry.value() {
            Ok(loaded) => Ok(Some(loaded.clone())),
            Err(message) => Err(SshError::KeyError(message.clone())),
        }
    }

    /// How many actual parse attempts have happened (cache misses).
    pub fn parse_attempts(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

fn canonical(path: &str) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path))
}

fn hash_passphrase(passphrase: Option<&Secret>) -> u64 {
    let mut hasher = DefaultHasher::new();
    passphrase.map(|p| p.as_str()).hash(&mut hasher);
    hasher.finish()
}

fn load_openssh(path: &str, passphrase: Option<&Secret>) -> Result<PrivateKey, SshError> {
    if !Path::new(path).exists() {
        return Err(SshError::KeyError(format!(
            "Key file not found: {}. Check the key path in the batch settings",
            path
        )));
    }
    russh::keys::load_secret_key(path, passphrase.map(Secret::as_str)).map_err(|e| {
        SshError::KeyError(format!(
            "Failed to load private key from {}: {}",
            path, e
        ))
    })
}

fn load_ppk(path: &str) -> Result<PrivateKey, SshError> {
    if !Path::new(path).exists() {
        return Err(SshError::KeyError(format!(
            "PPK file not found: {}. Check the key path in the batch settings",
            path
        )));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| SshError::KeyError(format!("Failed to read PPK file {}: {}", path, e)))?;

    let parsed = ppk::parse(&content)?;
    debug!(
        "parsed PPK v{} {} key from {}",
        parsed.version, parsed.algorithm, path
    );
    let pem = ppk::to_openssh_pem(&parsed)?;
    russh::keys::decode_secret_key(&pem, None)
        .map_err(|e| SshError::KeyError(format!("Failed to parse key material from {}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_key_cached_once() {
        let cache = KeyCache::new();
        let auth = AuthMethod::openssh_key("/does/not/exist", None);

        for _ in 0..5 {
            let err = cache.load(&auth).unwrap_err();
            assert!(matches!(err, SshError::KeyError(_)));
            assert!(err.to_string().contains("Key file not found"));
        }
        assert_eq!(cache.parse_attempts(), 1);
    }

    #[test]
    fn test_password_auth_needs_no_key() {
        let cache = KeyCache::new();
        let auth = AuthMethod::password("pw");
        assert!(cache.load(&auth).unwrap().is_none());
        assert_eq!(cache.parse_attempts(), 0);
    }

    #[test]
    fn test_malformed_key_file_is_key_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not a private key").unwrap();

        let cache = KeyCache::new();
        let auth = AuthMethod::openssh_key(file.path().to_str().unwrap(), None);
        let err = cache.load(&auth).unwrap_err();
        assert!(matches!(err, SshError::KeyError(_)));

        // Second lookup hits the cached failure
        let _ = cache.load(&auth).unwrap_err();
        assert_eq!(cache.parse_attempts(), 1);
    }

    #[test]
    fn test_distinct_passphrases_are_distinct_entries() {
        let cache = KeyCache::new();
        let first = AuthMethod::openssh_key("/does/not/exist", Some("a".to_string()));
        let second = AuthMethod::openssh_key("/does/not/exist", Some("b".to_string()));

        let _ = cache.load(&first);
        let _ = cache.load(&second);
        assert_eq!(cache.parse_attempts(), 2);
    }

    #[test]
    fn test_ppk_loads_through_cache() {
        let mut public = Vec::new();
        wire_string(&mut public, b"ssh-rsa");
        wire_string(&mut public, &[0x01, 0x00, 0x01]);
        wire_string(&mut public, &[0x75, 0x93]);
        let mut private = Vec::new();
        for part in [&[0x35u8][..], &[0x0b], &[0x0d], &[0x03]] {
            wire_string(&mut private, part);
        }

        use base64::{engine::general_purpose, Engine as _};
        let content = format!(
            "PuTTY-User-Key-File-2: ssh-rsa\nEncryption: none\nComment: t\n\
             Public-Lines: 1\n{}\nPrivate-Lines: 1\n{}\n",
            general_purpose::STANDARD.encode(&public),
            general_purpose::STANDARD.encode(&private),
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();

        let cache = KeyCache::new();
        let auth = AuthMethod::ppk_key(file.path().to_str().unwrap(), None);
        let key = cache.load(&auth).unwrap().unwrap();
        assert_eq!(key.algorithm().as_str(), "ssh-rsa");

        let again = cache.load(&auth).unwrap().unwrap();
        assert!(Arc::ptr_eq(&key, &again));
        assert_eq!(cache.parse_attempts(), 1);
    }

    fn wire_string(out: &mut Vec<u8>, value: &[u8]) {
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
}

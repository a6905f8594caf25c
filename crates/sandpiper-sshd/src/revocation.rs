//! Revoked user-certificate store.
//!
//! NIST 800-53: IA-2 (Identification and Authentication), AC-2 (Account Management)
//! STIG: V-222611 - The application must validate certificates
//! Implementation: Revoked certificate fingerprints behind a reader-writer lock
//!
//! The source file is a JSON list of SHA-256 fingerprint strings, at most
//! 5 MiB. Readers run concurrently under a shared lock; a reload parses
//! the file first and replaces the whole set in one step under the
//! exclusive lock.

use std::collections::HashSet;
use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Maximum size of the revoked certificates file.
const MAX_FILE_SIZE: u64 = 1048576 * 5;

#[derive(Default)]
pub struct RevocationStore {
    path: Option<PathBuf>,
    fingerprints: RwLock<HashSet<String>>,
}

impl RevocationStore {
    /// A store without a backing file never revokes anything.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            fingerprints: RwLock::new(HashSet::new()),
        }
    }

    /// Load (or re-load) the backing file. Idempotent; a store without a
    /// configured path is a no-op.
    ///
    /// # NIST 800-53: SI-10 (Information Input Validation), AC-2
    /// # STIG: V-222396 - Input validation
    /// # Implementation: Rejects oversized files and anything but a flat string list
    pub async fn load(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        debug!(path = %path.display(), "loading revoked user certificate file");
        let info = tokio::fs::metadata(path).await.map_err(|e| {
            Error::Config(format!(
                "unable to load revoked user certificate file {path:?}: {e}"
            ))
        })?;
        if info.len() > MAX_FILE_SIZE {
            return Err(Error::Config(format!(
                "unable to load revoked user certificate file {path:?}, size too big: {}/{} bytes",
                info.len(),
                MAX_FILE_SIZE
            )));
        }
        let content = tokio::fs::read(path).await.map_err(|e| {
            Error::Config(format!(
                "unable to read revoked user certificate file {path:?}: {e}"
            ))
        })?;
        let entries: Vec<String> = serde_json::from_slice(&content).map_err(|e| {
            Error::Config(format!(
                "unable to parse revoked user certificate file {path:?}: {e}"
            ))
        })?;

        let mut fingerprints = self.fingerprints.write().await;
        *fingerprints = entries.into_iter().collect();
        info!(
            path = %path.display(),
            entries = fingerprints.len(),
            "revoked user certificate file loaded"
        );
        Ok(())
    }

    /// Re-read the previously configured file.
    ///
    /// # NIST 800-53: AC-2 (Account Management)
    /// # Implementation: Supports hot-reloading of the revocation list
    pub async fn reload(&self) -> Result<()> {
        self.load().await
    }

    /// # NIST 800-53: IA-2, AC-3 (Access Enforcement)
    /// # STIG: V-222611 - Certificate validation
    /// # Implementation: Membership query under the shared lock
    pub async fn is_revoked(&self, fingerprint: &str) -> bool {
        self.fingerprints.read().await.contains(fingerprint)
    }

    pub async fn len(&self) -> usize {
        self.fingerprints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.fingerprints.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_no_path_is_noop() {
        let store = RevocationStore::new(None);
        store.load().await.unwrap();
        assert!(!store.is_revoked("SHA256:AAA").await);
    }

    #[tokio::test]
    async fn test_load_and_reload_replace_the_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revoked.json");
        std::fs::write(&path, r#"["SHA256:AAA","SHA256:BBB"]"#).unwrap();

        let store = RevocationStore::new(Some(path.clone()));
        store.load().await.unwrap();
        assert!(store.is_revoked("SHA256:AAA").await);
        assert!(store.is_revoked("SHA256:BBB").await);
        assert!(!store.is_revoked("SHA256:CCC").await);
        assert_eq!(store.len().await, 2);

        // the reload swaps the whole mapping, old entries vanish
        std::fs::write(&path, r#"["SHA256:CCC"]"#).unwrap();
        store.reload().await.unwrap();
        assert!(!store.is_revoked("SHA256:AAA").await);
        assert!(store.is_revoked("SHA256:CCC").await);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = RevocationStore::new(Some(dir.path().join("missing.json")));
        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_non_string_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revoked.json");

        for bad in [r#"{"a":"b"}"#, r#"[1,2,3]"#, "not json"] {
            std::fs::write(&path, bad).unwrap();
            let store = RevocationStore::new(Some(path.clone()));
            assert!(store.load().await.is_err(), "accepted {bad:?}");
        }
    }

    #[tokio::test]
    async fn test_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revoked.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "[").unwrap();
        let entry = format!("\"SHA256:{}\",", "x".repeat(100));
        // a bit over 5 MiB of entries
        for _ in 0..52_429 {
            file.write_all(entry.as_bytes()).unwrap();
        }
        write!(file, "\"SHA256:last\"]").unwrap();
        drop(file);

        let store = RevocationStore::new(Some(path));
        let err = store.load().await.unwrap_err();
        assert!(err.to_string().contains("size too big"));
    }
}

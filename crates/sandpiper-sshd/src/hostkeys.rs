//! Host key and host certificate loading.
//!
//! NIST 800-53: IA-5 (Authenticator Management), SC-8 (Transmission Confidentiality)
//! STIG: V-222611 - The application must validate certificates
//! Implementation: Server credential lifecycle, from generation to fingerprint publication
//!
//! Private host keys are loaded once at startup and are immutable
//! afterwards. If nothing is configured, the three default keys
//! (`id_rsa`, `id_ecdsa`, `id_ed25519`) are searched for in the
//! configuration directory and generated when absent. A configured
//! absolute path that does not exist is only created when its base name
//! is one of the default names; anything else is skipped with a warning.
//!
//! Host certificates are paired with the private key whose public key
//! they certify; certificates without a matching key are silently
//! dropped, certificates that are not host certificates fail loading.

use std::path::{Path, PathBuf};

use rand_core::OsRng;
use russh::keys::ssh_key::certificate::CertType;
use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, Certificate, EcdsaCurve, HashAlg, PrivateKey};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

pub const DEFAULT_RSA_KEY_NAME: &str = "id_rsa";
pub const DEFAULT_ECDSA_KEY_NAME: &str = "id_ecdsa";
pub const DEFAULT_ED25519_KEY_NAME: &str = "id_ed25519";

const DEFAULT_KEY_NAMES: &[&str] = &[
    DEFAULT_RSA_KEY_NAME,
    DEFAULT_ECDSA_KEY_NAME,
    DEFAULT_ED25519_KEY_NAME,
];

/// Generated RSA host keys use this modulus size.
const RSA_KEY_BITS: usize = 2048;

/// A loaded private host key.
pub struct HostKey {
    pub path: PathBuf,
    pub fingerprint: String,
    pub algorithm: String,
    key: PrivateKey,
}

impl HostKey {
    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }
}

/// A host certificate paired with one of the loaded private keys.
pub struct HostCertificate {
    pub path: PathBuf,
    pub certificate: Certificate,
    /// Fingerprint of the host key the certificate belongs to
    pub key_fingerprint: String,
}

/// The host credentials of one server instance.
///
/// NIST 800-53: IA-5 (Authenticator Management), SC-8 (Transmission Confidentiality)
/// Implementation: Immutable after load, referenced by the transport for signing only
#[derive(Default)]
pub struct HostKeyStore {
    keys: Vec<HostKey>,
    certificates: Vec<HostCertificate>,
}

impl HostKeyStore {
    /// Load (or create) the configured host keys and pair the host
    /// certificates with them.
    ///
    /// # NIST 800-53: IA-5 (Authenticator Management), SC-8
    /// # STIG: V-222611 - Certificate validation
    /// # Implementation: Loads private keys, publishes SHA-256 fingerprints, pairs host certificates
    pub async fn load(config_dir: &Path, config: &Config) -> Result<Self> {
        let key_paths = effective_key_paths(config_dir, config).await?;
        if key_paths.is_empty() {
            return Err(Error::Config("no usable host key configured".to_string()));
        }

        let mut store = HostKeyStore::default();
        for path in key_paths {
            let key = russh::keys::load_secret_key(&path, None)
                .map_err(|e| Error::Config(format!("unable to load host key {path:?}: {e}")))?;
            let fingerprint = key.public_key().fingerprint(HashAlg::Sha256).to_string();
            let algorithm = key.algorithm().to_string();
            info!(path = %path.display(), %fingerprint, %algorithm, "host key loaded");
            store.keys.push(HostKey {
                path,
                fingerprint,
                algorithm,
                key,
            });
        }

        for (path, certificate) in load_host_certificates(config_dir, config).await? {
            let paired = store
                .keys
                .iter()
                .find(|k| k.key.public_key().key_data() == certificate.public_key());
            match paired {
                Some(key) => {
                    info!(
                        path = %path.display(),
                        key = %key.fingerprint,
                        "host certificate loaded"
                    );
                    store.certificates.push(HostCertificate {
                        path,
                        certificate,
                        key_fingerprint: key.fingerprint.clone(),
                    });
                }
                None => {
                    debug!(
                        path = %path.display(),
                        "host certificate matches no private key, ignored"
                    );
                }
            }
        }

        Ok(store)
    }

    pub fn keys(&self) -> &[HostKey] {
        &self.keys
    }

    pub fn certificates(&self) -> &[HostCertificate] {
        &self.certificates
    }

    /// Private keys handed to the transport for signing.
    pub fn server_keys(&self) -> Vec<PrivateKey> {
        self.keys.iter().map(|k| k.key.clone()).collect()
    }
}

/// Expand the configured key list into concrete paths, generating
/// default keys where allowed.
///
/// # NIST 800-53: SI-10 (Information Input Validation), IA-5
/// # Implementation: Only the three default base names may be auto-created
async fn effective_key_paths(config_dir: &Path, config: &Config) -> Result<Vec<PathBuf>> {
    let configured: Vec<&str> = config
        .host_keys
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect();

    if configured.is_empty() {
        let mut paths = Vec::new();
        for name in DEFAULT_KEY_NAMES {
            let path = config_dir.join(name);
            if !path.exists() {
                info!(path = %path.display(), "host key missing, creating a new one");
                generate_key_file(&path, name).await?;
            }
            paths.push(path);
        }
        return Ok(paths);
    }

    let mut paths = Vec::new();
    for raw in configured {
        let path = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            config_dir.join(raw)
        };
        if !path.exists() {
            let base = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if DEFAULT_KEY_NAMES.contains(&base.as_str()) {
                info!(path = %path.display(), "host key missing, creating a new one");
                generate_key_file(&path, &base).await?;
            } else {
                warn!(path = %path.display(), "non-existent host key will not be created");
                continue;
            }
        }
        paths.push(path);
    }
    Ok(paths)
}

/// Generate a private key of the kind implied by the default file name
/// and write it (plus its `.pub` sibling) to disk.
///
/// # NIST 800-53: IA-5 (Authenticator Management), AC-3 (Access Enforcement)
/// # Implementation: Private keys are written with mode 0600
async fn generate_key_file(path: &Path, name: &str) -> Result<()> {
    let kind = name.to_string();
    let key = tokio::task::spawn_blocking(move || generate_key(&kind))
        .await
        .map_err(|e| Error::Other(format!("key generation task failed: {e}")))??;

    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::Config(format!("unable to encode host key: {e}")))?;
    tokio::fs::write(path, pem.as_bytes()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    let public = key
        .public_key()
        .to_openssh()
        .map_err(|e| Error::Config(format!("unable to encode public host key: {e}")))?;
    let mut pub_path = path.as_os_str().to_owned();
    pub_path.push(".pub");
    tokio::fs::write(PathBuf::from(pub_path), format!("{public}\n")).await?;
    Ok(())
}

fn generate_key(name: &str) -> Result<PrivateKey> {
    let key = match name {
        DEFAULT_RSA_KEY_NAME => {
            let pair = RsaKeypair::random(&mut OsRng, RSA_KEY_BITS)
                .map_err(|e| Error::Config(format!("RSA key generation failed: {e}")))?;
            PrivateKey::new(KeypairData::Rsa(pair), "")
                .map_err(|e| Error::Config(format!("RSA key generation failed: {e}")))?
        }
        DEFAULT_ECDSA_KEY_NAME => PrivateKey::random(
            &mut OsRng,
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
        )
        .map_err(|e| Error::Config(format!("ECDSA key generation failed: {e}")))?,
        _ => PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| Error::Config(format!("Ed25519 key generation failed: {e}")))?,
    };
    Ok(key)
}

/// # NIST 800-53: IA-5, SI-10 (Information Input Validation)
/// # STIG: V-222611 - Certificate validation
/// # Implementation: Only host-type certificates are accepted
async fn load_host_certificates(
    config_dir: &Path,
    config: &Config,
) -> Result<Vec<(PathBuf, Certificate)>> {
    let mut certs = Vec::new();
    for raw in &config.host_certificates {
        let raw = raw.trim();
        if raw.is_empty() {
            warn!("ignoring empty host certificate path");
            continue;
        }
        let path = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            config_dir.join(raw)
        };
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Config(format!("unable to load host certificate {path:?}: {e}")))?;
        let certificate = Certificate::from_openssh(content.trim())
            .map_err(|e| Error::Config(format!("unable to parse host certificate {path:?}: {e}")))?;
        if certificate.cert_type() != CertType::Host {
            return Err(Error::Config(format!(
                "the file {path:?} is not a host certificate"
            )));
        }
        certs.push((path, certificate));
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use russh::keys::ssh_key::certificate::Builder;

    fn config_with_keys(keys: Vec<String>) -> Config {
        Config {
            host_keys: keys,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_default_keys_are_generated() {
        let dir = tempfile::tempdir().unwrap();
        let store = HostKeyStore::load(dir.path(), &config_with_keys(Vec::new()))
            .await
            .unwrap();

        assert_eq!(store.keys().len(), 3);
        for name in DEFAULT_KEY_NAMES {
            assert!(dir.path().join(name).exists(), "{name} missing");
            assert!(dir.path().join(format!("{name}.pub")).exists());
        }
        for key in store.keys() {
            assert!(key.fingerprint.starts_with("SHA256:"));
        }

        // a second load reuses the files and yields the same fingerprints
        let again = HostKeyStore::load(dir.path(), &config_with_keys(Vec::new()))
            .await
            .unwrap();
        let fp = |s: &HostKeyStore| -> Vec<String> {
            s.keys().iter().map(|k| k.fingerprint.clone()).collect()
        };
        assert_eq!(fp(&store), fp(&again));
    }

    #[tokio::test]
    async fn test_unknown_absolute_path_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("my_custom_key").display().to_string();
        let ed25519 = dir.path().join(DEFAULT_ED25519_KEY_NAME).display().to_string();

        let store = HostKeyStore::load(dir.path(), &config_with_keys(vec![missing, ed25519]))
            .await
            .unwrap();
        // the custom key was skipped, the default one was generated
        assert_eq!(store.keys().len(), 1);
        assert!(!dir.path().join("my_custom_key").exists());
        assert!(dir.path().join(DEFAULT_ED25519_KEY_NAME).exists());
    }

    #[tokio::test]
    async fn test_only_unusable_keys_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope").display().to_string();
        let err = HostKeyStore::load(dir.path(), &config_with_keys(vec![missing]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no usable host key"));
    }

    fn write_certificate(
        dir: &Path,
        name: &str,
        certified: &PrivateKey,
        cert_type: CertType,
    ) -> PathBuf {
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            certified.public_key().key_data().clone(),
            0,
            u64::MAX,
        )
        .unwrap();
        builder.cert_type(cert_type).unwrap();
        builder.key_id("test-cert").unwrap();
        builder.all_principals_valid().unwrap();
        let cert = builder.sign(&ca).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, cert.to_openssh().unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_certificate_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_keys(vec![DEFAULT_ED25519_KEY_NAME.to_string()]);
        // generate the key first so we can certify it
        let store = HostKeyStore::load(dir.path(), &config).await.unwrap();
        let key = russh::keys::load_secret_key(&store.keys()[0].path, None).unwrap();

        write_certificate(dir.path(), "paired-cert.pub", &key, CertType::Host);
        let stranger = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        write_certificate(dir.path(), "unpaired-cert.pub", &stranger, CertType::Host);

        let config = Config {
            host_certificates: vec![
                "paired-cert.pub".to_string(),
                "unpaired-cert.pub".to_string(),
            ],
            ..config
        };
        let store = HostKeyStore::load(dir.path(), &config).await.unwrap();
        // the unpaired certificate is silently dropped
        assert_eq!(store.certificates().len(), 1);
        assert_eq!(
            store.certificates()[0].key_fingerprint,
            store.keys()[0].fingerprint
        );
    }

    #[tokio::test]
    async fn test_non_host_certificate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_keys(vec![DEFAULT_ED25519_KEY_NAME.to_string()]);
        let store = HostKeyStore::load(dir.path(), &config).await.unwrap();
        let key = russh::keys::load_secret_key(&store.keys()[0].path, None).unwrap();

        write_certificate(dir.path(), "user-cert.pub", &key, CertType::User);
        let config = Config {
            host_certificates: vec!["user-cert.pub".to_string()],
            ..config
        };
        let err = HostKeyStore::load(dir.path(), &config).await.unwrap_err();
        assert!(err.to_string().contains("not a host certificate"));
    }
}

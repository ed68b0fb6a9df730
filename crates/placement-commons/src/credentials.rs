//! mTLS credential loading
//!
//! The credentials directory holds a PEM triplet: the trust anchor
//! (`ca.crt`), the issuer certificate chain (`issuer.crt`) and its private
//! key (`issuer.key`). The same triplet configures both the placement
//! server and the host-side client. Rotated files are picked up by
//! [`TlsCredentials::wait_for_change`].

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::error::CredentialsError;

pub const ROOT_CERT_FILENAME: &str = "ca.crt";
pub const ISSUER_CERT_FILENAME: &str = "issuer.crt";
pub const ISSUER_KEY_FILENAME: &str = "issuer.key";

/// Locations of the PEM triplet inside a credentials directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsCredentials {
    dir: PathBuf,
}

impl TlsCredentials {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root_cert_path(&self) -> PathBuf {
        self.dir.join(ROOT_CERT_FILENAME)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(ISSUER_CERT_FILENAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(ISSUER_KEY_FILENAME)
    }

    /// True once all three files exist
    pub fn is_complete(&self) -> bool {
        [self.root_cert_path(), self.cert_path(), self.key_path()]
            .iter()
            .all(|p| p.is_file())
    }

    /// Poll the directory until the triplet appears or `timeout` elapses
    pub async fn wait_for_files(
        &self,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<CertChain, CredentialsError> {
        let start = Instant::now();
        loop {
            if self.is_complete() {
                return CertChain::load_from_disk(self);
            }
            if start.elapsed() >= timeout {
                return Err(CredentialsError::Timeout(timeout));
            }
            log::debug!(
                "Waiting for credentials in {} ({} missing)",
                self.dir.display(),
                self.missing().join(", ")
            );
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Poll until the triplet on disk differs from `current` and return the
    /// new chain. Incomplete or unreadable states are skipped.
    pub async fn wait_for_change(&self, current: &CertChain, poll_interval: Duration) -> CertChain {
        loop {
            tokio::time::sleep(poll_interval).await;
            if !self.is_complete() {
                continue;
            }
            match CertChain::load_from_disk(self) {
                Ok(chain) if &chain != current => return chain,
                Ok(_) => {}
                Err(e) => log::warn!("Cannot reload credentials from {}: {}", self.dir.display(), e),
            }
        }
    }

    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.root_cert_path().is_file() {
            missing.push(ROOT_CERT_FILENAME);
        }
        if !self.cert_path().is_file() {
            missing.push(ISSUER_CERT_FILENAME);
        }
        if !self.key_path().is_file() {
            missing.push(ISSUER_KEY_FILENAME);
        }
        missing
    }
}

/// PEM-encoded root certificate, certificate chain and key
#[derive(Clone, PartialEq, Eq)]
pub struct CertChain {
    pub root_ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for CertChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertChain")
            .field("root_ca_len", &self.root_ca.len())
            .field("cert_len", &self.cert.len())
            .finish_non_exhaustive()
    }
}

impl CertChain {
    pub fn load_from_disk(creds: &TlsCredentials) -> Result<Self, CredentialsError> {
        Ok(Self {
            root_ca: read_pem(&creds.root_cert_path())?,
            cert: read_pem(&creds.cert_path())?,
            key: read_pem(&creds.key_path())?,
        })
    }

    /// Server config requiring client certificates signed by the root CA
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(Identity::from_pem(&self.cert, &self.key))
            .client_ca_root(Certificate::from_pem(&self.root_ca))
    }

    /// Client config presenting the issuer identity to `domain`
    pub fn client_tls_config(&self, domain: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&self.root_ca))
            .identity(Identity::from_pem(&self.cert, &self.key))
            .domain_name(domain.to_string())
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, CredentialsError> {
    if !path.exists() {
        return Err(CredentialsError::Missing(path.display().to_string()));
    }
    std::fs::read(path).map_err(|source| CredentialsError::Io {
        path: path.display().to_string(),
        source,
    })
}

use crate::identity::{Identity, IdentityError};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// DER-encoded trust anchors used to authenticate the broker.
#[derive(Debug, Clone)]
pub struct RootCertificates(Arc<Vec<Vec<u8>>>);

impl RootCertificates {
    /// Load every certificate from a PEM bundle. An empty bundle is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let ders = rustls_pemfile::certs(&mut BufReader::new(file)).map_err(|e| {
            IdentityError::InvalidCertificate {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        if ders.is_empty() {
            return Err(IdentityError::NoRootCertificates {
                path: path.to_path_buf(),
            });
        }
        debug!(count = ders.len(), path = %path.display(), "loaded root certificates");
        Ok(Self(Arc::new(ders)))
    }

    pub fn ders(&self) -> &[Vec<u8>] {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("none of the root certificates could be used as a trust anchor")]
    NoTrustAnchors,
    #[error("build TLS client config: {0}")]
    Config(#[from] rustls::Error),
}

/// Build a mutual-TLS client configuration presenting `identity` and trusting `roots`.
pub fn client_config(roots: &RootCertificates, identity: &Identity) -> Result<ClientConfig, TlsError> {
    let mut root_store = RootCertStore::empty();
    let (added, skipped) = root_store.add_parsable_certificates(roots.ders());
    if added == 0 {
        return Err(TlsError::NoTrustAnchors);
    }
    debug!(added, skipped, "trust store ready");

    let chain: Vec<Certificate> = identity.chain().iter().cloned().map(Certificate).collect();
    let key = PrivateKey(identity.private_key_der().to_vec());

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_client_auth_cert(chain, key)?;
    Ok(config)
}

//! Client identity loading.
//!
//! An [`Identity`] binds a PEM certificate chain to the private key that
//! belongs to its leaf certificate. Loading fails unless the key file carries
//! a PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`) block
//! and the key actually matches the leaf certificate's public key.

use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING,
    ECDSA_P384_SHA384_ASN1_SIGNING,
};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

const PKCS8_LABEL: &str = "PRIVATE KEY";
const PKCS1_LABEL: &str = "RSA PRIVATE KEY";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificate found in {}", path.display())]
    NoCertificate { path: PathBuf },
    #[error("no PEM private key block found in {}", path.display())]
    MissingKeyBlock { path: PathBuf },
    #[error("unsupported private key encoding {label:?} in {}", path.display())]
    UnsupportedKeyEncoding { path: PathBuf, label: String },
    #[error("private key in {} is not valid: {reason}", path.display())]
    InvalidKeyBody { path: PathBuf, reason: String },
    #[error("certificate in {} is not valid: {reason}", path.display())]
    InvalidCertificate { path: PathBuf, reason: String },
    #[error("private key {} does not match certificate {}", key.display(), certificate.display())]
    KeyMismatch { certificate: PathBuf, key: PathBuf },
    #[error("no root certificates loaded from {}", path.display())]
    NoRootCertificates { path: PathBuf },
}

/// On-disk encoding of the private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    Pkcs8,
    Pkcs1,
}

impl KeyEncoding {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            PKCS8_LABEL => Some(Self::Pkcs8),
            PKCS1_LABEL => Some(Self::Pkcs1),
            _ => None,
        }
    }
}

impl fmt::Display for KeyEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pkcs8 => f.write_str("PKCS#8"),
            Self::Pkcs1 => f.write_str("PKCS#1 (RSA)"),
        }
    }
}

/// A TLS client identity: certificate chain plus the matching private key.
#[derive(Clone)]
pub struct Identity {
    certificate_pem: Vec<u8>,
    chain: Vec<Vec<u8>>,
    private_key: Vec<u8>,
    encoding: KeyEncoding,
}

impl Identity {
    /// Load `certificate` and `private_key` from `directory`.
    pub fn load(
        directory: impl AsRef<Path>,
        certificate: &str,
        private_key: &str,
    ) -> Result<Self, IdentityError> {
        let directory = directory.as_ref();
        let cert_path = directory.join(certificate);
        let key_path = directory.join(private_key);
        debug!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "loading client identity"
        );

        let certificate_pem = read(&cert_path)?;
        let chain = rustls_pemfile::certs(&mut Cursor::new(&certificate_pem)).map_err(|e| {
            IdentityError::InvalidCertificate {
                path: cert_path.clone(),
                reason: e.to_string(),
            }
        })?;
        if chain.is_empty() {
            return Err(IdentityError::NoCertificate { path: cert_path });
        }

        let key_text = String::from_utf8(read(&key_path)?).map_err(|_| {
            IdentityError::InvalidKeyBody {
                path: key_path.clone(),
                reason: "key file is not UTF-8 PEM text".into(),
            }
        })?;
        let (encoding, private_key) = decode_private_key(&key_text, &key_path)?;
        trace!(%encoding, "decoded private key");

        let leaf_key = leaf_public_key(&chain[0], &cert_path)?;
        let key_public = public_key_of(&private_key, encoding).map_err(|reason| {
            IdentityError::InvalidKeyBody {
                path: key_path.clone(),
                reason,
            }
        })?;
        if leaf_key != key_public {
            return Err(IdentityError::KeyMismatch {
                certificate: cert_path,
                key: key_path,
            });
        }

        Ok(Self {
            certificate_pem,
            chain,
            private_key,
            encoding,
        })
    }

    /// Certificate file contents exactly as read from disk.
    pub fn certificate_pem(&self) -> &[u8] {
        &self.certificate_pem
    }

    /// DER certificates, leaf first.
    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    pub fn leaf_der(&self) -> &[u8] {
        &self.chain[0]
    }

    /// DER private key in the encoding reported by [`Identity::encoding`].
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key
    }

    pub fn encoding(&self) -> KeyEncoding {
        self.encoding
    }

    /// Lowercase hex SHA-256 of the leaf certificate.
    pub fn fingerprint(&self) -> String {
        Sha256::digest(self.leaf_der())
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Subject distinguished name of the leaf certificate.
    pub fn subject(&self) -> String {
        x509_parser::parse_x509_certificate(self.leaf_der())
            .map(|(_, cert)| cert.subject().to_string())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .field("chain_len", &self.chain.len())
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

fn read(path: &Path) -> Result<Vec<u8>, IdentityError> {
    fs::read(path).map_err(|source| IdentityError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Strip the first PEM block's armour, base64-decode its body and classify
/// it by label. Anything other than the two supported labels is an error.
///
/// Parsed locally rather than with `rustls_pemfile::read_one`, which skips
/// blocks it does not recognise and so cannot report the offending label.
fn decode_private_key(text: &str, path: &Path) -> Result<(KeyEncoding, Vec<u8>), IdentityError> {
    let mut lines = text.lines().map(str::trim);
    let label = lines
        .by_ref()
        .find_map(|line| {
            line.strip_prefix("-----BEGIN ")
                .and_then(|rest| rest.strip_suffix("-----"))
        })
        .ok_or_else(|| IdentityError::MissingKeyBlock {
            path: path.to_path_buf(),
        })?;

    let encoding =
        KeyEncoding::from_label(label).ok_or_else(|| IdentityError::UnsupportedKeyEncoding {
            path: path.to_path_buf(),
            label: label.to_string(),
        })?;

    let footer = format!("-----END {label}-----");
    let mut body = String::new();
    let mut terminated = false;
    for line in lines {
        if line == footer {
            terminated = true;
            break;
        }
        body.push_str(line);
    }
    if !terminated {
        return Err(IdentityError::InvalidKeyBody {
            path: path.to_path_buf(),
            reason: format!("missing {footer}"),
        });
    }

    let der = base64::engine::general_purpose::STANDARD
        .decode(body.as_bytes())
        .map_err(|e| IdentityError::InvalidKeyBody {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok((encoding, der))
}

fn leaf_public_key(der: &[u8], path: &Path) -> Result<Vec<u8>, IdentityError> {
    let (_, cert) =
        x509_parser::parse_x509_certificate(der).map_err(|e| IdentityError::InvalidCertificate {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

/// Raw public key bytes as they appear in a certificate's
/// `subjectPublicKey` bit string.
fn public_key_of(der: &[u8], encoding: KeyEncoding) -> Result<Vec<u8>, String> {
    match encoding {
        KeyEncoding::Pkcs1 => RsaKeyPair::from_der(der)
            .map(|pair| pair.public_key().as_ref().to_vec())
            .map_err(|e| format!("RSA key rejected: {e}")),
        KeyEncoding::Pkcs8 => {
            if let Ok(pair) = RsaKeyPair::from_pkcs8(der) {
                return Ok(pair.public_key().as_ref().to_vec());
            }
            let rng = SystemRandom::new();
            for alg in [
                &ECDSA_P256_SHA256_ASN1_SIGNING,
                &ECDSA_P384_SHA384_ASN1_SIGNING,
            ] {
                if let Ok(pair) = EcdsaKeyPair::from_pkcs8(alg, der, &rng) {
                    return Ok(pair.public_key().as_ref().to_vec());
                }
            }
            Ed25519KeyPair::from_pkcs8_maybe_unchecked(der)
                .map(|pair| pair.public_key().as_ref().to_vec())
                .map_err(|_| "PKCS#8 key is not an RSA, ECDSA or Ed25519 key".to_string())
        }
    }
}

//! Trust roots: the Fulcio certificates and Rekor keys signatures are
//! checked against, and the OIDC issuers each root recognizes.

use crate::policy::{GITHUB_OIDC_ISSUER, TrustRootMode};
use crate::{AttestationError, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use log::debug;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use ::sigstore::trust::TrustRoot;
use ::sigstore::trust::sigstore::SigstoreTrustRoot;
use std::path::Path;

const PUBLIC_GOOD_ISSUERS: &[&str] = &[
    GITHUB_OIDC_ISSUER,
    "https://accounts.google.com",
    "https://oauth2.sigstore.dev/auth",
    "https://gitlab.com",
];

const GITHUB_ISSUERS: &[&str] = &[GITHUB_OIDC_ISSUER];

/// Whether `issuer` is one the trust root can vouch for. Custom roots are
/// not restricted.
pub fn recognizes_issuer(mode: &TrustRootMode, issuer: &str) -> bool {
    let known = match mode {
        TrustRootMode::PublicGood => PUBLIC_GOOD_ISSUERS,
        TrustRootMode::GitHubOnly => GITHUB_ISSUERS,
        TrustRootMode::Custom(_) => return true,
    };
    // GitHub Enterprise tenants get a per-tenant issuer under the Actions one.
    known.contains(&issuer)
        || issuer
            .strip_prefix(GITHUB_OIDC_ISSUER)
            .is_some_and(|tenant| tenant.starts_with('/') && tenant.len() > 1)
}

/// A Rekor log public key.
#[derive(Debug, Clone)]
pub struct RekorKey {
    /// SHA-256 of the DER public key; matches a tlog entry's `logId.keyId`.
    pub key_id: Vec<u8>,
    /// DER SubjectPublicKeyInfo.
    pub spki_der: Vec<u8>,
}

impl RekorKey {
    pub fn new(spki_der: Vec<u8>) -> Self {
        Self {
            key_id: Sha256::digest(&spki_der).to_vec(),
            spki_der,
        }
    }
}

/// Certificate authorities and transparency logs of one trust root.
#[derive(Debug, Clone, Default)]
pub struct TrustMaterial {
    /// DER certificates of every CA chain (intermediates and roots).
    pub fulcio_certs: Vec<Vec<u8>>,
    pub rekor_keys: Vec<RekorKey>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustedRootJson {
    #[serde(default)]
    tlogs: Vec<TransparencyLog>,
    #[serde(default)]
    certificate_authorities: Vec<CertificateAuthority>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransparencyLog {
    public_key: RawKey,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawKey {
    raw_bytes: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateAuthority {
    cert_chain: CertChain,
}

#[derive(Deserialize)]
struct CertChain {
    certificates: Vec<RawKey>,
}

impl TrustMaterial {
    /// Fetch the Sigstore public-good trust root from its TUF repository.
    pub async fn public_good() -> Result<Self> {
        let root = SigstoreTrustRoot::new(None)
            .await
            .map_err(|e| AttestationError::Sigstore(format!("Failed to fetch trust root: {}", e)))?;

        let fulcio_certs = root
            .fulcio_certs()
            .map_err(|e| AttestationError::Sigstore(format!("Failed to get Fulcio certs: {}", e)))?
            .iter()
            .map(|cert| cert.to_vec())
            .collect();

        let rekor_keys = root
            .rekor_keys()
            .map_err(|e| AttestationError::Sigstore(format!("Failed to get Rekor keys: {}", e)))?
            .values()
            .map(|key| RekorKey::new(key.to_vec()))
            .collect();

        debug!("Loaded Sigstore public-good trust root");
        Ok(Self {
            fulcio_certs,
            rekor_keys,
        })
    }

    /// Parse a Sigstore `trusted_root.json` document.
    pub fn from_trusted_root_json(content: &[u8]) -> Result<Self> {
        let root: TrustedRootJson = serde_json::from_slice(content)?;
        let decode = |raw: &RawKey| {
            BASE64.decode(&raw.raw_bytes).map_err(|e| {
                AttestationError::Sigstore(format!("Invalid base64 in trusted root: {}", e))
            })
        };

        let mut fulcio_certs = Vec::new();
        for ca in &root.certificate_authorities {
            for cert in &ca.cert_chain.certificates {
                fulcio_certs.push(decode(cert)?);
            }
        }

        let rekor_keys = root
            .tlogs
            .iter()
            .map(|tlog| decode(&tlog.public_key).map(RekorKey::new))
            .collect::<Result<Vec<_>>>()?;

        if fulcio_certs.is_empty() {
            return Err(AttestationError::Sigstore(
                "trusted root has no certificate authorities".into(),
            ));
        }

        Ok(Self {
            fulcio_certs,
            rekor_keys,
        })
    }

    pub async fn from_trusted_root_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read(path).await?;
        Self::from_trusted_root_json(&content)
    }
}

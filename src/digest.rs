//! Artifact digest computation.

use crate::oci::OciClient;
use crate::policy::SubjectSelector;
use crate::{AttestationError, Result};
use log::debug;
use serde::Serialize;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Digest algorithms accepted for local artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = AttestationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(AttestationError::Verification(format!(
                "Unsupported digest algorithm: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest of the artifact under verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactDigest {
    pub algorithm: DigestAlgorithm,
    /// Lowercase hex.
    pub value: String,
}

impl ArtifactDigest {
    pub fn new(algorithm: DigestAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into().to_ascii_lowercase(),
        }
    }

    /// Parse an `<alg>:<hex>` string such as an OCI manifest digest.
    pub fn parse(digest: &str) -> Result<Self> {
        let (alg, hex_value) = digest.split_once(':').ok_or_else(|| {
            AttestationError::Verification(format!("Invalid digest format: {}", digest))
        })?;
        let algorithm = alg.parse::<DigestAlgorithm>()?;
        if hex_value.is_empty() || hex::decode(hex_value).is_err() {
            return Err(AttestationError::Verification(format!(
                "Invalid digest format: {}",
                digest
            )));
        }
        Ok(Self::new(algorithm, hex_value))
    }
}

impl fmt::Display for ArtifactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

/// Compute the digest of the subject selected by the policy.
///
/// Local files are hashed with `algorithm`; OCI references are resolved to
/// their manifest digest by the registry. Any failure is reported as
/// `DigestComputationFailed` so it is never confused with a verification
/// failure.
pub async fn resolve_digest(
    subject: &SubjectSelector,
    algorithm: DigestAlgorithm,
    oci: &dyn OciClient,
) -> Result<ArtifactDigest> {
    let result = match subject {
        SubjectSelector::Path(path) => {
            let path = path.clone();
            tokio::task::spawn_blocking(move || calculate_file_digest(&path, algorithm))
                .await
                .map_err(|e| AttestationError::Verification(format!("digest task failed: {}", e)))
                .and_then(|r| r)
        }
        SubjectSelector::Oci(reference) => {
            debug!("Resolving OCI reference {}", reference);
            oci.resolve_digest(reference).await
        }
    };

    result.map_err(|e| AttestationError::DigestComputationFailed {
        artifact: subject.to_string(),
        reason: e.to_string(),
    })
}

/// Hash a file with the given algorithm, streaming its contents.
pub fn calculate_file_digest(path: &Path, algorithm: DigestAlgorithm) -> Result<ArtifactDigest> {
    let file = File::open(path)?;
    let value = match algorithm {
        DigestAlgorithm::Sha256 => hash_reader::<Sha256>(file)?,
        DigestAlgorithm::Sha512 => hash_reader::<Sha512>(file)?,
    };
    Ok(ArtifactDigest::new(algorithm, value))
}

fn hash_reader<D: Digest>(mut reader: impl Read) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

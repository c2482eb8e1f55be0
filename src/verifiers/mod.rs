pub mod sigstore;
pub mod trust;

use crate::Result;
use crate::bundle::{AttestationBundle, Statement};
use crate::digest::ArtifactDigest;
use crate::policy::TrustRootMode;
use async_trait::async_trait;
use serde::Serialize;

pub use self::sigstore::SigstoreVerifier;
pub use self::trust::TrustMaterial;

/// Identity of the workload that signed an attestation, as recorded in its
/// signing certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SigningIdentity {
    /// Subject alternative name (workflow URI or email).
    pub san: String,
    /// OIDC issuer that authenticated the workload.
    pub issuer: String,
    /// `github-hosted` or `self-hosted` for GitHub Actions identities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_repository: Option<String>,
}

/// What a successful signature verification proves.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifiedStatement {
    pub statement: Statement,
    pub identity: SigningIdentity,
    /// Transparency log integration time (unix seconds). Recorded, never
    /// used for policy decisions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrated_time: Option<i64>,
}

/// Signature verification library seam.
///
/// An implementation proves the bundle's signature, its certificate chain to
/// the selected trust root, its transparency log presence, and that the
/// statement subject carries `expected`. Policy checks are not its concern.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(
        &self,
        bundle: &AttestationBundle,
        trust_root: &TrustRootMode,
        expected: &ArtifactDigest,
    ) -> Result<VerifiedStatement>;

    /// Get the verifier type name for logging
    fn verifier_type(&self) -> &'static str;
}

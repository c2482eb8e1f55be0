use log::{debug, info};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod api;
pub mod bundle;
pub mod digest;
pub mod oci;
pub mod policy;
pub mod report;
pub mod sources;
pub mod verifiers;
pub mod verify;

// Re-export commonly used types
pub use api::{ApiConfig, AttestationApi, AttestationClient, FetchParams};
pub use bundle::{AttestationBundle, Statement};
pub use digest::{ArtifactDigest, DigestAlgorithm};
pub use oci::{OciClient, RegistryClient};
pub use policy::{ValidationError, VerificationPolicy, VerifyOptions};
pub use report::{AttestationProcessingResult, CheckKind, CheckOutcome, VerificationReport};
pub use verifiers::{
    SignatureVerifier, SigningIdentity, SigstoreVerifier, TrustMaterial, VerifiedStatement,
};

#[derive(Debug, Error)]
pub enum AttestationError {
    #[error("invalid verification policy: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to digest artifact {artifact}: {reason}")]
    DigestComputationFailed { artifact: String, reason: String },

    #[error("failed to fetch attestations for subject {subject}: {reason}")]
    AttestationFetchFailed { subject: String, reason: String },

    #[error("failed to read bundle {path}: {reason}")]
    BundleReadFailed { path: String, reason: String },

    #[error("OIDC issuer '{issuer}' is not recognized by the {trust_root} trust root")]
    NoMatchingIssuer { issuer: String, trust_root: String },

    #[error("no verified attestation has predicate type {expected}")]
    NoMatchingPredicateType { expected: String },

    #[error("no attestation satisfied the verification policy:\n{0}")]
    NoVerifiedAttestation(String),

    #[error("verification cancelled")]
    Cancelled,

    #[error("API error: {0}")]
    Api(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Sigstore error: {0}")]
    Sigstore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AttestationError>;

/// The collaborators a verification run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub signature_verifier: Arc<dyn SignatureVerifier>,
    /// Required only when attestations come from the remote API.
    pub api: Option<Arc<dyn AttestationApi>>,
    pub oci: Arc<dyn OciClient>,
}

impl Collaborators {
    /// Production collaborators: the Sigstore verifier, the GitHub API and
    /// an OCI registry client, configured from the environment.
    pub fn from_env() -> Result<Self> {
        let api = AttestationClient::new(&ApiConfig::from_env())?;
        Ok(Self {
            signature_verifier: Arc::new(SigstoreVerifier::from_env()),
            api: Some(Arc::new(api)),
            oci: Arc::new(RegistryClient::from_env()),
        })
    }
}

/// Run a full verification: validate the options, digest the artifact,
/// retrieve candidate attestations, verify each one and aggregate.
///
/// Fatal stage failures (validation, digesting, retrieval, issuer
/// recognition, cancellation) are returned as errors. Otherwise the report
/// is returned even when no attestation passed; call
/// [`VerificationReport::ensure_verified`] for a pass/fail `Result`.
pub async fn verify_artifact(
    options: &VerifyOptions,
    collaborators: &Collaborators,
    cancel: &CancellationToken,
) -> Result<VerificationReport> {
    let policy = Arc::new(options.validate()?);
    debug!("Validated policy: {:?}", policy);

    let artifact_digest = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AttestationError::Cancelled),
        resolved = digest::resolve_digest(
            &policy.subject,
            policy.digest_algorithm,
            collaborators.oci.as_ref(),
        ) => resolved?,
    };
    info!("Loaded digest {} for {}", artifact_digest, policy.subject);

    let bundles = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AttestationError::Cancelled),
        retrieved = sources::retrieve(
            &policy.source,
            &artifact_digest,
            policy.limit,
            collaborators.api.as_deref(),
        ) => retrieved?,
    };
    info!("Loaded {} attestation(s)", bundles.len());

    let results = verify::verify_candidates(
        bundles,
        Arc::clone(&policy),
        Arc::new(artifact_digest),
        Arc::clone(&collaborators.signature_verifier),
        cancel,
    )
    .await?;

    Ok(report::aggregate(results, &policy.predicate_type))
}

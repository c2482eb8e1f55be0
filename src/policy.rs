//! Verification policy model and validation.
//!
//! [`VerifyOptions`] is the raw, possibly contradictory input a caller
//! assembles (from flags, a config file or code). [`VerifyOptions::validate`]
//! turns it into a [`VerificationPolicy`] whose mutually exclusive option
//! groups are enums, so an invalid policy cannot exist after validation.

use crate::digest::DigestAlgorithm;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// OIDC issuer used by GitHub Actions workflow identities.
pub const GITHUB_OIDC_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// The only predicate type accepted as build provenance.
pub const SLSA_PREDICATE_V1: &str = "https://slsa.dev/provenance/v1";

pub const DEFAULT_LIMIT: i64 = 30;

const OCI_SCHEME: &str = "oci://";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported digest algorithm '{0}', expected one of: sha256, sha512")]
    UnsupportedDigestAlgorithm(String),

    #[error("limit must be greater than 0, got {0}")]
    InvalidLimit(i64),

    #[error("only one of owner or repo can be provided")]
    ConflictingSubjectSource,

    #[error("one of owner, repo or bundle must be provided")]
    MissingSubjectSource,

    #[error("repo must be in the form owner/name, got '{0}'")]
    InvalidRepo(String),

    #[error("only one of cert-identity or cert-identity-regex can be provided")]
    ConflictingIdentityConstraint,

    #[error("invalid cert-identity-regex '{pattern}': {reason}")]
    InvalidIdentityPattern { pattern: String, reason: String },

    #[error("OIDC issuer must be a URL, got '{0}'")]
    InvalidIssuer(String),

    #[error("an artifact path or oci:// reference is required")]
    MissingArtifact,
}

/// Raw verification options as supplied by the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VerifyOptions {
    /// Local file path, or an `oci://` image reference.
    pub artifact: String,
    pub bundle: Option<PathBuf>,
    pub digest_alg: String,
    pub limit: i64,
    pub owner: Option<String>,
    pub repo: Option<String>,
    #[serde(rename = "cert-identity")]
    pub san: Option<String>,
    #[serde(rename = "cert-identity-regex")]
    pub san_regex: Option<String>,
    #[serde(rename = "cert-oidc-issuer")]
    pub oidc_issuer: String,
    pub no_public_good: bool,
    pub custom_trusted_root: Option<PathBuf>,
    pub deny_self_hosted_runner: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            artifact: String::new(),
            bundle: None,
            digest_alg: DigestAlgorithm::Sha256.as_str().to_string(),
            limit: DEFAULT_LIMIT,
            owner: None,
            repo: None,
            san: None,
            san_regex: None,
            oidc_issuer: GITHUB_OIDC_ISSUER.to_string(),
            no_public_good: false,
            custom_trusted_root: None,
            deny_self_hosted_runner: false,
        }
    }
}

/// What is being verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectSelector {
    Path(PathBuf),
    /// Image reference without the `oci://` scheme.
    Oci(String),
}

impl SubjectSelector {
    pub fn parse(artifact: &str) -> Self {
        match artifact.strip_prefix(OCI_SCHEME) {
            Some(reference) => Self::Oci(reference.to_string()),
            None => Self::Path(PathBuf::from(artifact)),
        }
    }
}

impl std::fmt::Display for SubjectSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Oci(reference) => write!(f, "{OCI_SCHEME}{reference}"),
        }
    }
}

/// Where candidate attestations come from. Exactly one per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationSourceSpec {
    BundleFile(PathBuf),
    Owner(String),
    /// `owner/name`
    Repo(String),
}

#[derive(Debug, Clone)]
pub enum IdentityConstraint {
    Any,
    /// Subject alternative name must equal this string.
    Exact(String),
    /// Subject alternative name must match this pattern, anchored at its start.
    Pattern(Regex),
}

impl IdentityConstraint {
    fn pattern(raw: &str) -> Result<Self, ValidationError> {
        // Leading anchor so "https://evil.example/https://good.example/" can't match.
        Regex::new(&format!("^(?:{raw})"))
            .map(Self::Pattern)
            .map_err(|e| ValidationError::InvalidIdentityPattern {
                pattern: raw.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Any => "any identity".to_string(),
            Self::Exact(san) => format!("SAN '{san}'"),
            Self::Pattern(re) => format!("SAN matching '{}'", re.as_str()),
        }
    }
}

impl PartialEq for IdentityConstraint {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Any, Self::Any) => true,
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Pattern(a), Self::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// Which trust material signatures are checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustRootMode {
    /// Sigstore public-good instance (Fulcio + Rekor).
    PublicGood,
    /// GitHub's own trust domain only; public-good bundles are rejected.
    GitHubOnly,
    /// A `trusted_root.json` supplied by the caller.
    Custom(PathBuf),
}

impl TrustRootMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PublicGood => "public-good",
            Self::GitHubOnly => "github",
            Self::Custom(_) => "custom",
        }
    }
}

/// A validated, immutable verification policy.
#[derive(Debug, Clone)]
pub struct VerificationPolicy {
    pub digest_algorithm: DigestAlgorithm,
    pub subject: SubjectSelector,
    pub source: AttestationSourceSpec,
    pub identity: IdentityConstraint,
    pub oidc_issuer: String,
    pub trust_root: TrustRootMode,
    pub deny_self_hosted_runner: bool,
    pub limit: usize,
    pub predicate_type: String,
}

impl VerifyOptions {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            ..Default::default()
        }
    }

    /// Validate the raw options. Pure: no file or network access happens here.
    pub fn validate(&self) -> Result<VerificationPolicy, ValidationError> {
        let digest_algorithm = self
            .digest_alg
            .parse::<DigestAlgorithm>()
            .map_err(|_| ValidationError::UnsupportedDigestAlgorithm(self.digest_alg.clone()))?;

        if self.limit < 1 {
            return Err(ValidationError::InvalidLimit(self.limit));
        }

        let owner = non_empty(self.owner.as_deref());
        let repo = non_empty(self.repo.as_deref());

        if owner.is_some() && repo.is_some() {
            return Err(ValidationError::ConflictingSubjectSource);
        }
        if let Some(repo) = repo {
            let valid = matches!(
                repo.split_once('/'),
                Some((o, n)) if !o.is_empty() && !n.is_empty() && !n.contains('/')
            );
            if !valid {
                return Err(ValidationError::InvalidRepo(repo.to_string()));
            }
        }

        let source = match (&self.bundle, owner, repo) {
            (Some(bundle), _, _) => AttestationSourceSpec::BundleFile(bundle.clone()),
            (None, Some(owner), None) => AttestationSourceSpec::Owner(owner.to_string()),
            (None, None, Some(repo)) => AttestationSourceSpec::Repo(repo.to_string()),
            (None, None, None) => return Err(ValidationError::MissingSubjectSource),
            (None, Some(_), Some(_)) => return Err(ValidationError::ConflictingSubjectSource),
        };

        let identity = match (
            non_empty(self.san.as_deref()),
            non_empty(self.san_regex.as_deref()),
        ) {
            (Some(_), Some(_)) => return Err(ValidationError::ConflictingIdentityConstraint),
            (Some(san), None) => IdentityConstraint::Exact(san.to_string()),
            (None, Some(pattern)) => IdentityConstraint::pattern(pattern)?,
            (None, None) => match repo.or(owner) {
                Some(scope) => IdentityConstraint::pattern(&format!(
                    r"^https://github\.com/{}/",
                    regex::escape(scope)
                ))?,
                None => IdentityConstraint::Any,
            },
        };

        if !is_url_shaped(&self.oidc_issuer) {
            return Err(ValidationError::InvalidIssuer(self.oidc_issuer.clone()));
        }

        if self.artifact.trim().is_empty() {
            return Err(ValidationError::MissingArtifact);
        }

        let trust_root = match (&self.custom_trusted_root, self.no_public_good) {
            (Some(path), _) => TrustRootMode::Custom(path.clone()),
            (None, true) => TrustRootMode::GitHubOnly,
            (None, false) => TrustRootMode::PublicGood,
        };

        Ok(VerificationPolicy {
            digest_algorithm,
            subject: SubjectSelector::parse(&self.artifact),
            source,
            identity,
            oidc_issuer: self.oidc_issuer.clone(),
            trust_root,
            deny_self_hosted_runner: self.deny_self_hosted_runner,
            limit: self.limit as usize,
            predicate_type: SLSA_PREDICATE_V1.to_string(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn is_url_shaped(issuer: &str) -> bool {
    let rest = issuer
        .strip_prefix("https://")
        .or_else(|| issuer.strip_prefix("http://"));
    match rest {
        Some(rest) => {
            let host = rest.split('/').next().unwrap_or_default();
            !host.is_empty() && !host.contains(char::is_whitespace)
        }
        None => false,
    }
}

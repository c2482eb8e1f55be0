pub mod file;
pub mod github;

use crate::Result;
use crate::api::AttestationApi;
use crate::bundle::AttestationBundle;
use crate::digest::ArtifactDigest;
use crate::policy::AttestationSourceSpec;
use async_trait::async_trait;
use log::debug;

/// Trait for different sources of attestations
#[async_trait]
pub trait AttestationSource: Send + Sync {
    /// Fetch candidate bundles for the artifact, at most `limit` of them.
    async fn fetch_attestations(
        &self,
        digest: &ArtifactDigest,
        limit: usize,
    ) -> Result<Vec<AttestationBundle>>;

    /// Get the source type name for logging
    fn source_type(&self) -> &'static str;
}

/// Retrieve candidate bundles from the single source named by the policy.
pub async fn retrieve(
    spec: &AttestationSourceSpec,
    digest: &ArtifactDigest,
    limit: usize,
    api: Option<&dyn AttestationApi>,
) -> Result<Vec<AttestationBundle>> {
    let source: Box<dyn AttestationSource + '_> = match spec {
        AttestationSourceSpec::BundleFile(path) => Box::new(file::FileSource::new(path)),
        AttestationSourceSpec::Owner(owner) => Box::new(github::GitHubSource::owner(owner, api)),
        AttestationSourceSpec::Repo(repo) => Box::new(github::GitHubSource::repo(repo, api)),
    };

    debug!("Retrieving attestations from {} source", source.source_type());
    let mut bundles = source.fetch_attestations(digest, limit).await?;
    bundles.truncate(limit);
    Ok(bundles)
}

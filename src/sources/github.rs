use crate::api::{AttestationApi, FetchParams, FetchScope};
use crate::bundle::AttestationBundle;
use crate::digest::ArtifactDigest;
use crate::policy::SLSA_PREDICATE_V1;
use crate::sources::AttestationSource;
use crate::{AttestationError, Result};
use async_trait::async_trait;

/// GitHub attestation source. Owner and repo lookups are the same query
/// with a different scope.
pub struct GitHubSource<'a> {
    client: Option<&'a dyn AttestationApi>,
    scope: FetchScope,
}

impl<'a> GitHubSource<'a> {
    pub fn owner(owner: impl Into<String>, client: Option<&'a dyn AttestationApi>) -> Self {
        Self {
            client,
            scope: FetchScope::Owner(owner.into()),
        }
    }

    pub fn repo(repo: impl Into<String>, client: Option<&'a dyn AttestationApi>) -> Self {
        Self {
            client,
            scope: FetchScope::Repo(repo.into()),
        }
    }
}

#[async_trait]
impl<'a> AttestationSource for GitHubSource<'a> {
    async fn fetch_attestations(
        &self,
        digest: &ArtifactDigest,
        limit: usize,
    ) -> Result<Vec<AttestationBundle>> {
        let fetch_failed = |reason: String| AttestationError::AttestationFetchFailed {
            subject: digest.to_string(),
            reason,
        };

        let client = self
            .client
            .ok_or_else(|| fetch_failed("no attestation API client configured".into()))?;

        let params = FetchParams {
            scope: self.scope.clone(),
            digest: digest.to_string(),
            limit,
            predicate_type: Some(SLSA_PREDICATE_V1.to_string()),
        };

        client
            .fetch_attestations(&params)
            .await
            .map_err(|e| fetch_failed(e.to_string()))
    }

    fn source_type(&self) -> &'static str {
        "GitHub"
    }
}

//! OCI registry collaborator: resolves an image reference to its manifest digest.

use crate::digest::ArtifactDigest;
use crate::{AttestationError, Result};
use async_trait::async_trait;
use log::debug;
use oci_distribution::client::{Client, ClientConfig};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;

#[async_trait]
pub trait OciClient: Send + Sync {
    /// Resolve `reference` (without the `oci://` scheme) to a manifest digest.
    async fn resolve_digest(&self, reference: &str) -> Result<ArtifactDigest>;
}

/// Registry client backed by `oci-distribution`.
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    pub fn new(auth: RegistryAuth) -> Self {
        Self {
            client: Client::new(ClientConfig::default()),
            auth,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(RegistryAuth::Anonymous)
    }

    /// Basic credentials from `REGISTRY_USERNAME`/`REGISTRY_PASSWORD`, falling
    /// back to a `GITHUB_TOKEN` (ghcr.io accepts it as a password), else anonymous.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();
        let auth = match (username, password) {
            (Some(username), Some(password)) => RegistryAuth::Basic(username, password),
            _ => match std::env::var("GITHUB_TOKEN") {
                Ok(token) if !token.is_empty() => {
                    RegistryAuth::Basic("x-access-token".to_string(), token)
                }
                _ => RegistryAuth::Anonymous,
            },
        };
        Self::new(auth)
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::anonymous()
    }
}

#[async_trait]
impl OciClient for RegistryClient {
    async fn resolve_digest(&self, reference: &str) -> Result<ArtifactDigest> {
        let reference: Reference = reference
            .parse()
            .map_err(|e| {
                AttestationError::Api(format!("invalid image reference '{}': {}", reference, e))
            })?;

        // A pinned reference already names its manifest.
        if let Some(digest) = reference.digest() {
            debug!("Reference {} is pinned to {}", reference, digest);
            return ArtifactDigest::parse(digest);
        }

        let digest = self
            .client
            .fetch_manifest_digest(&reference, &self.auth)
            .await
            .map_err(|e| {
                AttestationError::Api(format!("registry lookup for {} failed: {}", reference, e))
            })?;
        debug!("Resolved {} to {}", reference, digest);

        ArtifactDigest::parse(&digest)
    }
}

use crate::bundle::AttestationBundle;
use crate::digest::ArtifactDigest;
use crate::sources::AttestationSource;
use crate::{AttestationError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Reads exactly one bundle from a local file.
pub struct FileSource {
    bundle_path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            bundle_path: path.as_ref().to_path_buf(),
        }
    }

    fn read_failed(&self, reason: impl ToString) -> AttestationError {
        AttestationError::BundleReadFailed {
            path: self.bundle_path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl AttestationSource for FileSource {
    async fn fetch_attestations(
        &self,
        _digest: &ArtifactDigest,
        _limit: usize,
    ) -> Result<Vec<AttestationBundle>> {
        let content = fs::read(&self.bundle_path)
            .await
            .map_err(|e| self.read_failed(e))?;

        log::trace!("Parsing bundle file of length: {}", content.len());
        let bundle = AttestationBundle::from_json(&content).map_err(|e| self.read_failed(e))?;

        Ok(vec![bundle])
    }

    fn source_type(&self) -> &'static str {
        "File"
    }
}

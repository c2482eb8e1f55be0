use crate::bundle::AttestationBundle;
use crate::{AttestationError, Result};
use async_trait::async_trait;
use log::{debug, trace, warn};
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, LINK, USER_AGENT,
};
use serde::Deserialize;

pub const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT_VALUE: &str = concat!("provenance-verify/", env!("CARGO_PKG_VERSION"));
const MAX_PER_PAGE: usize = 100;

/// Where attestations are looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchScope {
    Owner(String),
    /// `owner/name`
    Repo(String),
}

#[derive(Debug, Clone)]
pub struct FetchParams {
    pub scope: FetchScope,
    /// `<alg>:<hex>`
    pub digest: String,
    pub limit: usize,
    pub predicate_type: Option<String>,
}

/// Attestation API collaborator.
#[async_trait]
pub trait AttestationApi: Send + Sync {
    /// Fetch up to `params.limit` bundles whose subject matches `params.digest`.
    /// Not-found is an error, never an empty success.
    async fn fetch_attestations(&self, params: &FetchParams) -> Result<Vec<AttestationBundle>>;
}

/// API endpoint and credentials.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: GITHUB_API_URL.to_string(),
            token: None,
        }
    }
}

impl ApiConfig {
    /// Read `GH_API_URL`, then `GH_TOKEN` or `GITHUB_TOKEN`.
    pub fn from_env() -> Self {
        let base_url = std::env::var("GH_API_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| GITHUB_API_URL.to_string());
        let token = ["GH_TOKEN", "GITHUB_TOKEN"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
        Self { base_url, token }
    }
}

#[derive(Debug, Deserialize)]
struct AttestationsResponse {
    attestations: Vec<AttestationRecord>,
}

#[derive(Debug, Deserialize)]
struct AttestationRecord {
    bundle: Option<serde_json::Value>,
    bundle_url: Option<String>,
}

/// GitHub REST attestations API client.
#[derive(Debug, Clone)]
pub struct AttestationClient {
    client: reqwest::Client,
    base_url: String,
}

impl AttestationClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));

        if let Some(token) = &config.token {
            let auth_value = format!("Bearer {}", token);
            let mut value = HeaderValue::from_str(&auth_value)
                .map_err(|e| AttestationError::Api(e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn first_page_url(&self, params: &FetchParams) -> String {
        match &params.scope {
            FetchScope::Repo(repo) => format!(
                "{}/repos/{}/attestations/{}",
                self.base_url, repo, params.digest
            ),
            FetchScope::Owner(owner) => format!(
                "{}/orgs/{}/attestations/{}",
                self.base_url, owner, params.digest
            ),
        }
    }

    async fn download_bundle(&self, bundle_url: &str) -> Result<AttestationBundle> {
        let response = self.client.get(bundle_url).send().await?;
        if !response.status().is_success() {
            return Err(AttestationError::Api(format!(
                "bundle download returned {}",
                response.status()
            )));
        }

        let snappy = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.contains("application/x-snappy"))
            .unwrap_or(false);

        let bytes = response.bytes().await?;
        if snappy {
            AttestationBundle::from_json(&decompress_snappy(&bytes)?)
        } else {
            AttestationBundle::from_json(&bytes)
        }
    }
}

#[async_trait]
impl AttestationApi for AttestationClient {
    async fn fetch_attestations(&self, params: &FetchParams) -> Result<Vec<AttestationBundle>> {
        let per_page = params.limit.clamp(1, MAX_PER_PAGE);
        let mut query = vec![("per_page", per_page.to_string())];
        if let Some(predicate_type) = &params.predicate_type {
            query.push(("predicate_type", predicate_type.clone()));
        }

        let mut bundles = Vec::new();
        let mut next_url = Some(self.first_page_url(params));
        let mut first_page = true;

        while let Some(url) = next_url.take() {
            debug!("Fetching attestations from {}", url);
            let request = self.client.get(&url);
            // Pagination links already carry the query string.
            let request = if first_page { request.query(&query) } else { request };
            first_page = false;

            let response = request.send().await?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(AttestationError::Api(format!(
                    "GitHub API returned {}: {}",
                    status, body
                )));
            }

            next_url = response
                .headers()
                .get(LINK)
                .and_then(|h| h.to_str().ok())
                .and_then(next_link);

            let page: AttestationsResponse = response.json().await?;
            trace!("Page returned {} attestation(s)", page.attestations.len());

            for record in page.attestations {
                if bundles.len() >= params.limit {
                    break;
                }
                match (record.bundle, record.bundle_url) {
                    (Some(bundle), _) => bundles.push(serde_json::from_value(bundle)?),
                    (None, Some(bundle_url)) => {
                        bundles.push(self.download_bundle(&bundle_url).await?)
                    }
                    (None, None) => warn!("Skipping attestation without bundle or bundle_url"),
                }
            }

            if bundles.len() >= params.limit {
                break;
            }
        }

        if bundles.is_empty() {
            return Err(AttestationError::Api("no attestations found".into()));
        }
        Ok(bundles)
    }
}

/// Extract the `rel="next"` target from a `Link` header.
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| p.trim().replace(' ', "") == "rel=\"next\"");
        is_next.then(|| {
            target
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string()
        })
    })
}

fn decompress_snappy(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = snap::raw::Decoder::new();
    decoder
        .decompress_vec(bytes)
        .map_err(|e| AttestationError::Api(format!("Snappy decompression failed: {}", e)))
}

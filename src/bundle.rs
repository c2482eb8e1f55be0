use crate::digest::ArtifactDigest;
use crate::{AttestationError, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const IN_TOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

/// A Sigstore bundle: a DSSE envelope plus the material needed to verify it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationBundle {
    pub media_type: String,
    pub verification_material: VerificationMaterial,
    pub dsse_envelope: DsseEnvelope,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMaterial {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<RawBytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x509_certificate_chain: Option<CertificateChain>,
    #[serde(default)]
    pub tlog_entries: Vec<TlogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_verification_data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBytes {
    /// Base64 encoded DER.
    pub raw_bytes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateChain {
    pub certificates: Vec<RawBytes>,
}

/// A Rekor transparency log entry. Integer fields are JSON strings in
/// protobuf-encoded bundles and numbers in older ones; both are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlogEntry {
    #[serde(deserialize_with = "lenient_i64")]
    pub log_index: i64,
    pub log_id: LogId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind_version: Option<KindVersion>,
    #[serde(deserialize_with = "lenient_i64")]
    pub integrated_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inclusion_promise: Option<InclusionPromise>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inclusion_proof: Option<InclusionProof>,
    pub canonicalized_body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogId {
    /// Base64 encoded SHA-256 of the log's public key.
    pub key_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindVersion {
    pub kind: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionPromise {
    pub signed_entry_timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    #[serde(deserialize_with = "lenient_i64")]
    pub log_index: i64,
    pub root_hash: String,
    #[serde(deserialize_with = "lenient_i64")]
    pub tree_size: i64,
    #[serde(default)]
    pub hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
}

/// Signed tree head of the log at the time the proof was produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Signed note: origin, tree size, base64 root hash, then signature lines.
    pub envelope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DsseEnvelope {
    pub payload: String,
    pub payload_type: String,
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub sig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyid: Option<String>,
}

/// An in-toto statement, the payload of a provenance attestation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    #[serde(rename = "_type")]
    pub statement_type: String,
    pub subject: Vec<Subject>,
    pub predicate_type: String,
    #[serde(default)]
    pub predicate: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub name: String,
    pub digest: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(v) => Ok(v),
        IntOrString::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl AttestationBundle {
    /// Parse a bundle document. Accepts a bare Sigstore bundle or an API
    /// attestation record wrapping one under `"bundle"`.
    pub fn from_json(content: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(content)?;
        let bundle = match value.get("bundle") {
            Some(inner) if inner.is_object() => inner.clone(),
            _ => value,
        };
        Ok(serde_json::from_value(bundle)?)
    }

    /// DER bytes of the signing (leaf) certificate.
    pub fn leaf_certificate(&self) -> Result<Vec<u8>> {
        let material = &self.verification_material;
        let raw = material
            .certificate
            .as_ref()
            .or_else(|| {
                material
                    .x509_certificate_chain
                    .as_ref()
                    .and_then(|chain| chain.certificates.first())
            })
            .ok_or_else(|| {
                AttestationError::Verification("No certificate found in attestation bundle".into())
            })?;

        BASE64.decode(&raw.raw_bytes).map_err(|e| {
            AttestationError::Verification(format!("Failed to decode certificate: {}", e))
        })
    }

    /// Decoded DSSE payload bytes.
    pub fn payload(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.dsse_envelope.payload)
            .map_err(|e| AttestationError::Verification(format!("Failed to decode payload: {}", e)))
    }

    /// Decode the DSSE payload as an in-toto statement.
    pub fn statement(&self) -> Result<Statement> {
        if self.dsse_envelope.payload_type != IN_TOTO_PAYLOAD_TYPE {
            return Err(AttestationError::Verification(format!(
                "Unexpected payload type: {}",
                self.dsse_envelope.payload_type
            )));
        }
        let statement: Statement = serde_json::from_slice(&self.payload()?).map_err(|e| {
            AttestationError::Verification(format!("Failed to parse payload: {}", e))
        })?;

        if !statement.statement_type.starts_with("https://in-toto.io/Statement/v") {
            return Err(AttestationError::Verification(format!(
                "Not an in-toto statement: {}",
                statement.statement_type
            )));
        }
        Ok(statement)
    }
}

impl Statement {
    /// Whether any subject carries `digest` under its algorithm.
    pub fn matches_digest(&self, digest: &ArtifactDigest) -> bool {
        self.subject.iter().any(|subject| {
            subject
                .digest
                .get(digest.algorithm.as_str())
                .is_some_and(|value| value.eq_ignore_ascii_case(&digest.value))
        })
    }

    /// Runner environment recorded by a GitHub Actions SLSA v1 predicate.
    pub fn runner_environment(&self) -> Option<&str> {
        self.predicate
            .pointer("/buildDefinition/internalParameters/github/runner_environment")
            .and_then(Value::as_str)
    }

    /// Workflow path recorded in the predicate (SLSA v1, then v0.2 layout).
    pub fn workflow_ref(&self) -> Option<&str> {
        self.predicate
            .pointer("/buildDefinition/externalParameters/workflow/path")
            .or_else(|| self.predicate.pointer("/invocation/configSource/entryPoint"))
            .and_then(Value::as_str)
    }
}

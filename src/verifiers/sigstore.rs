//! Keyless Sigstore bundle verification: Fulcio certificate chain, DSSE
//! signature, Rekor transparency log entries and subject digest binding.

use super::trust::{RekorKey, TrustMaterial};
use super::{SignatureVerifier, SigningIdentity, VerifiedStatement};
use crate::bundle::{AttestationBundle, DsseEnvelope, InclusionProof, TlogEntry};
use crate::digest::ArtifactDigest;
use crate::policy::TrustRootMode;
use crate::{AttestationError, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use log::debug;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

// Cryptographic imports for signature verification
use ed25519_dalek::{Signature as Ed25519Signature, VerifyingKey as Ed25519VerifyingKey};
use p256::ecdsa::{
    Signature as P256Signature, VerifyingKey as P256VerifyingKey,
    signature::Verifier as P256Verifier,
};
use p256::pkcs8::DecodePublicKey;
use p384::ecdsa::{Signature as P384Signature, VerifyingKey as P384VerifyingKey};
use x509_parser::der_parser::der::parse_der_utf8string;
use x509_parser::prelude::*;

// Fulcio certificate extensions
const OID_ISSUER_V1: &str = "1.3.6.1.4.1.57264.1.1";
const OID_ISSUER_V2: &str = "1.3.6.1.4.1.57264.1.8";
const OID_RUNNER_ENVIRONMENT: &str = "1.3.6.1.4.1.57264.1.11";
const OID_SOURCE_REPOSITORY_URI: &str = "1.3.6.1.4.1.57264.1.12";

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_ED25519: &str = "1.3.101.112";
const OID_P256: &str = "1.2.840.10045.3.1.7";
const OID_P384: &str = "1.3.132.0.34";

const MAX_CHAIN_DEPTH: usize = 5;

/// Environment variable naming GitHub's `trusted_root.json`.
pub const GITHUB_TRUSTED_ROOT_ENV: &str = "GITHUB_TRUSTED_ROOT";

/// Verifies Sigstore bundles against a Fulcio/Rekor trust root.
///
/// The public-good root is fetched over TUF on first use and cached. The
/// GitHub trust domain is read from a `trusted_root.json` (as printed by
/// `gh attestation trusted-root`), loaded on first use and cached.
pub struct SigstoreVerifier {
    public_good: OnceCell<Arc<TrustMaterial>>,
    github: OnceCell<Arc<TrustMaterial>>,
    github_root_path: Option<PathBuf>,
}

impl SigstoreVerifier {
    pub fn new() -> Self {
        Self {
            public_good: OnceCell::new(),
            github: OnceCell::new(),
            github_root_path: None,
        }
    }

    /// Like [`SigstoreVerifier::new`], with the GitHub trusted root taken from
    /// `GITHUB_TRUSTED_ROOT` when set.
    pub fn from_env() -> Self {
        let verifier = Self::new();
        match std::env::var_os(GITHUB_TRUSTED_ROOT_ENV).filter(|v| !v.is_empty()) {
            Some(path) => verifier.with_github_trusted_root_file(path),
            None => verifier,
        }
    }

    /// Use preloaded public-good material instead of fetching it.
    pub fn with_public_good(material: TrustMaterial) -> Self {
        Self {
            public_good: OnceCell::from(Arc::new(material)),
            ..Self::new()
        }
    }

    pub fn with_github_trust_root(mut self, material: TrustMaterial) -> Self {
        self.github = OnceCell::from(Arc::new(material));
        self
    }

    pub fn with_github_trusted_root_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.github_root_path = Some(path.into());
        self
    }

    async fn material(&self, mode: &TrustRootMode) -> Result<Arc<TrustMaterial>> {
        match mode {
            TrustRootMode::PublicGood => self
                .public_good
                .get_or_try_init(|| async { TrustMaterial::public_good().await.map(Arc::new) })
                .await
                .cloned(),
            TrustRootMode::GitHubOnly => self
                .github
                .get_or_try_init(|| async {
                    let path = self.github_root_path.as_deref().ok_or_else(|| {
                        AttestationError::Sigstore(format!(
                            "no trust material configured for the github trust root; set {}",
                            GITHUB_TRUSTED_ROOT_ENV
                        ))
                    })?;
                    load_trusted_root(path).await
                })
                .await
                .cloned(),
            TrustRootMode::Custom(path) => load_trusted_root(path).await,
        }
    }
}

async fn load_trusted_root(path: &Path) -> Result<Arc<TrustMaterial>> {
    TrustMaterial::from_trusted_root_file(path)
        .await
        .map(Arc::new)
        .map_err(|e| {
            AttestationError::Sigstore(format!(
                "Failed to load trusted root {}: {}",
                path.display(),
                e
            ))
        })
}

impl Default for SigstoreVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignatureVerifier for SigstoreVerifier {
    async fn verify(
        &self,
        bundle: &AttestationBundle,
        trust_root: &TrustRootMode,
        expected: &ArtifactDigest,
    ) -> Result<VerifiedStatement> {
        let material = self.material(trust_root).await?;

        let cert_der = bundle.leaf_certificate()?;
        let (_, cert) = X509Certificate::from_der(&cert_der).map_err(|e| {
            AttestationError::Verification(format!("Failed to parse certificate: {}", e))
        })?;

        verify_certificate_chain(&cert, &material)?;

        let payload = bundle.payload()?;
        verify_dsse_signature(cert.public_key(), &bundle.dsse_envelope, &payload)?;

        let integrated_time = verify_tlog_entries(
            &bundle.verification_material.tlog_entries,
            &payload,
            &material,
        )?;
        verify_certificate_validity(&cert, integrated_time)?;

        let statement = bundle.statement()?;
        if !statement.matches_digest(expected) {
            return Err(AttestationError::Verification(format!(
                "Artifact digest mismatch: {} is not a subject of the statement",
                expected
            )));
        }

        let identity = signing_identity(&cert)?;
        debug!("Verified bundle signed by {} ({})", identity.san, identity.issuer);

        Ok(VerifiedStatement {
            statement,
            identity,
            integrated_time: Some(integrated_time),
        })
    }

    fn verifier_type(&self) -> &'static str {
        "Sigstore"
    }
}

/// Walk from the leaf up to a self-signed root using the trust root's CA
/// certificates, checking each signature on the way.
fn verify_certificate_chain(leaf: &X509Certificate<'_>, material: &TrustMaterial) -> Result<()> {
    let pool: Vec<X509Certificate<'_>> = material
        .fulcio_certs
        .iter()
        .filter_map(|der| X509Certificate::from_der(der).ok().map(|(_, cert)| cert))
        .collect();

    let mut current = leaf;
    for _ in 0..MAX_CHAIN_DEPTH {
        let issuer = pool.iter().find(|ca| {
            ca.subject().as_raw() == current.issuer().as_raw()
                && current.verify_signature(Some(ca.public_key())).is_ok()
        });

        match issuer {
            Some(ca) if ca.subject().as_raw() == ca.issuer().as_raw() => {
                debug!("Certificate chain verified against trust root");
                return Ok(());
            }
            Some(ca) => current = ca,
            None => {
                return Err(AttestationError::Verification(format!(
                    "Certificate not issued by a trusted CA (issuer: {})",
                    current.issuer()
                )));
            }
        }
    }

    Err(AttestationError::Verification(
        "Certificate chain exceeds maximum depth".into(),
    ))
}

fn verify_certificate_validity(cert: &X509Certificate<'_>, at: i64) -> Result<()> {
    let validity = cert.validity();
    if at < validity.not_before.timestamp() || at > validity.not_after.timestamp() {
        return Err(AttestationError::Verification(format!(
            "Certificate was not valid at log integration time {} (valid {} to {})",
            at, validity.not_before, validity.not_after
        )));
    }
    Ok(())
}

/// Verify that at least one DSSE signature was made by the certificate key.
fn verify_dsse_signature(
    public_key: &SubjectPublicKeyInfo<'_>,
    envelope: &DsseEnvelope,
    payload: &[u8],
) -> Result<()> {
    if envelope.signatures.is_empty() {
        return Err(AttestationError::Verification(
            "DSSE envelope has no signatures".into(),
        ));
    }

    let pae = create_dsse_pae(&envelope.payload_type, payload);
    let mut last_error = None;

    for signature in &envelope.signatures {
        let sig_bytes = match BASE64.decode(&signature.sig) {
            Ok(bytes) => bytes,
            Err(e) => {
                last_error = Some(AttestationError::Verification(format!(
                    "Failed to decode signature: {}",
                    e
                )));
                continue;
            }
        };

        match verify_with_public_key(public_key, &sig_bytes, &pae) {
            Ok(()) => {
                debug!("DSSE signature verification successful");
                return Ok(());
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        AttestationError::Verification("DSSE signature verification failed".into())
    }))
}

/// Create DSSE PAE (Pre-Authentication Encoding)
fn create_dsse_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = Vec::new();

    // DSSEv1 = ASCII(DSSEv1) + SP + LEN(type) + SP + type + SP + LEN(payload) + SP + payload
    pae.extend_from_slice(b"DSSEv1");
    pae.push(b' ');
    pae.extend_from_slice(payload_type.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload_type.as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload);

    pae
}

fn verify_with_public_key(
    public_key: &SubjectPublicKeyInfo<'_>,
    signature: &[u8],
    message: &[u8],
) -> Result<()> {
    let key_bytes: &[u8] = public_key.subject_public_key.data.as_ref();

    match public_key.algorithm.algorithm.to_id_string().as_str() {
        OID_EC_PUBLIC_KEY => {
            let curve = public_key
                .algorithm
                .parameters
                .as_ref()
                .and_then(|params| params.as_oid().ok())
                .map(|oid| oid.to_id_string());
            // Fulcio issues P-256 keys when the curve is left implicit.
            match curve.as_deref().unwrap_or(OID_P256) {
                OID_P256 => verify_p256(key_bytes, signature, message),
                OID_P384 => verify_p384(key_bytes, signature, message),
                other => Err(AttestationError::Verification(format!(
                    "Unsupported EC curve: {}",
                    other
                ))),
            }
        }
        OID_ED25519 => verify_ed25519(key_bytes, signature, message),
        other => Err(AttestationError::Verification(format!(
            "Unsupported signature algorithm: {}",
            other
        ))),
    }
}

fn verify_p256(sec1_key: &[u8], signature: &[u8], message: &[u8]) -> Result<()> {
    let verifying_key = P256VerifyingKey::from_sec1_bytes(sec1_key).map_err(|e| {
        AttestationError::Verification(format!("Failed to parse P-256 public key: {}", e))
    })?;
    let signature = P256Signature::from_der(signature)
        .or_else(|_| P256Signature::from_slice(signature))
        .map_err(|e| {
            AttestationError::Verification(format!("Failed to parse P-256 signature: {}", e))
        })?;

    verifying_key.verify(message, &signature).map_err(|e| {
        AttestationError::Verification(format!("P-256 signature verification failed: {}", e))
    })
}

fn verify_p384(sec1_key: &[u8], signature: &[u8], message: &[u8]) -> Result<()> {
    use p384::ecdsa::signature::Verifier;

    let verifying_key = P384VerifyingKey::from_sec1_bytes(sec1_key).map_err(|e| {
        AttestationError::Verification(format!("Failed to parse P-384 public key: {}", e))
    })?;
    let signature = P384Signature::from_der(signature)
        .or_else(|_| P384Signature::from_slice(signature))
        .map_err(|e| {
            AttestationError::Verification(format!("Failed to parse P-384 signature: {}", e))
        })?;

    verifying_key.verify(message, &signature).map_err(|e| {
        AttestationError::Verification(format!("P-384 signature verification failed: {}", e))
    })
}

fn verify_ed25519(key: &[u8], signature: &[u8], message: &[u8]) -> Result<()> {
    use ed25519_dalek::Verifier;

    let key: &[u8; 32] = key.try_into().map_err(|_| {
        AttestationError::Verification(format!(
            "Invalid Ed25519 public key length: {} (expected 32)",
            key.len()
        ))
    })?;
    let verifying_key = Ed25519VerifyingKey::from_bytes(key).map_err(|e| {
        AttestationError::Verification(format!("Failed to parse Ed25519 public key: {}", e))
    })?;
    let signature = Ed25519Signature::from_slice(signature).map_err(|e| {
        AttestationError::Verification(format!("Invalid Ed25519 signature: {}", e))
    })?;

    verifying_key.verify(message, &signature).map_err(|e| {
        AttestationError::Verification(format!("Ed25519 signature verification failed: {}", e))
    })
}

/// Verify every transparency log entry; returns the first entry's
/// integration time, which the log has signed.
fn verify_tlog_entries(
    entries: &[TlogEntry],
    payload: &[u8],
    material: &TrustMaterial,
) -> Result<i64> {
    let first = entries.first().ok_or_else(|| {
        AttestationError::Verification("Bundle has no transparency log entries".into())
    })?;

    for entry in entries {
        verify_tlog_entry(entry, payload, material)?;
    }

    Ok(first.integrated_time)
}

/// An entry counts only if a trusted Rekor key vouches for it: the signed
/// entry timestamp is mandatory since it is the only signature over the
/// integration time, and an inclusion proof, when present, must lead to a
/// signed checkpoint.
fn verify_tlog_entry(entry: &TlogEntry, payload: &[u8], material: &TrustMaterial) -> Result<()> {
    let key = rekor_key_for(entry, material)?;

    let body = BASE64.decode(&entry.canonicalized_body).map_err(|e| {
        AttestationError::Verification(format!("Failed to decode tlog entry body: {}", e))
    })?;

    verify_body_binding(&body, payload)?;

    if let Some(proof) = &entry.inclusion_proof {
        let root = verify_inclusion_proof(&body, proof)?;
        let checkpoint = proof.checkpoint.as_ref().ok_or_else(|| {
            AttestationError::Verification(format!(
                "Inclusion proof for tlog entry {} has no signed checkpoint",
                entry.log_index
            ))
        })?;
        verify_checkpoint(&checkpoint.envelope, key, &root, proof.tree_size)?;
    }

    let promise = entry.inclusion_promise.as_ref().ok_or_else(|| {
        AttestationError::Verification(format!(
            "Tlog entry {} has no inclusion promise; its integration time is unsigned",
            entry.log_index
        ))
    })?;
    verify_signed_entry_timestamp(entry, &promise.signed_entry_timestamp, key)?;

    debug!(
        "Rekor transparency log entry verified at index {} with timestamp {}",
        entry.log_index, entry.integrated_time
    );
    Ok(())
}

/// The trusted Rekor key whose id is the entry's `logId.keyId`.
fn rekor_key_for<'m>(entry: &TlogEntry, material: &'m TrustMaterial) -> Result<&'m RekorKey> {
    let key_id = BASE64.decode(&entry.log_id.key_id).map_err(|e| {
        AttestationError::Verification(format!("Failed to decode log id: {}", e))
    })?;

    material
        .rekor_keys
        .iter()
        .find(|key| key.key_id == key_id)
        .ok_or_else(|| {
            AttestationError::Verification(format!(
                "No trusted Rekor key for log id {}",
                hex::encode(&key_id)
            ))
        })
}

/// The logged entry must record the hash of the payload we verified.
fn verify_body_binding(body: &[u8], payload: &[u8]) -> Result<()> {
    let body: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
        AttestationError::Verification(format!("Failed to parse tlog entry body: {}", e))
    })?;

    let recorded = body
        .pointer("/spec/payloadHash/value")
        .or_else(|| body.pointer("/spec/content/payloadHash/value"))
        .and_then(|v| v.as_str());

    match recorded {
        Some(recorded) if !recorded.eq_ignore_ascii_case(&hex::encode(Sha256::digest(payload))) => {
            Err(AttestationError::Verification(
                "Tlog entry does not record this bundle's payload".into(),
            ))
        }
        Some(_) => Ok(()),
        None => {
            debug!("Tlog entry body carries no payload hash");
            Ok(())
        }
    }
}

/// RFC 6962 / RFC 9162 Merkle inclusion proof verification. Returns the
/// root the proof leads to.
fn verify_inclusion_proof(body: &[u8], proof: &InclusionProof) -> Result<Vec<u8>> {
    let decode = |value: &str, what: &str| {
        BASE64.decode(value).map_err(|e| {
            AttestationError::Verification(format!("Failed to decode {}: {}", what, e))
        })
    };

    let expected_root = decode(&proof.root_hash, "root hash")?;
    let hashes = proof
        .hashes
        .iter()
        .map(|h| decode(h, "proof hash"))
        .collect::<Result<Vec<_>>>()?;

    if proof.log_index < 0 || proof.tree_size <= proof.log_index {
        return Err(AttestationError::Verification(format!(
            "Invalid inclusion proof: index {} outside tree of size {}",
            proof.log_index, proof.tree_size
        )));
    }

    let mut index = proof.log_index as u64;
    let mut last = (proof.tree_size - 1) as u64;
    let mut current = hash_leaf(body);

    for node in &hashes {
        if last == 0 {
            return Err(AttestationError::Verification(
                "Invalid inclusion proof: too many hashes".into(),
            ));
        }
        if index & 1 == 1 || index == last {
            current = hash_children(node, &current);
            if index & 1 == 0 {
                while index & 1 == 0 && index != 0 {
                    index >>= 1;
                    last >>= 1;
                }
            }
        } else {
            current = hash_children(&current, node);
        }
        index >>= 1;
        last >>= 1;
    }

    if last != 0 || current != expected_root {
        return Err(AttestationError::Verification(
            "Merkle inclusion proof verification failed: root hash mismatch".into(),
        ));
    }

    debug!("Merkle inclusion proof verified successfully");
    Ok(current)
}

fn hash_leaf(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn hash_children(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().to_vec()
}

/// Verify a signed note checkpoint and that it commits to `root`.
///
/// The note text is everything up to and including the blank line; each
/// signature line is `\u{2014} <name> <base64(key hint || signature)>`, the
/// hint being the first four bytes of the key id.
fn verify_checkpoint(envelope: &str, key: &RekorKey, root: &[u8], tree_size: i64) -> Result<()> {
    let invalid = |reason: &str| {
        AttestationError::Verification(format!("Invalid checkpoint: {}", reason))
    };

    let (text, signatures) = envelope
        .split_once("\n\n")
        .ok_or_else(|| invalid("missing signature block"))?;
    let note = format!("{}\n", text);

    let mut lines = text.lines();
    let _origin = lines.next().ok_or_else(|| invalid("missing origin"))?;
    let size: i64 = lines
        .next()
        .and_then(|line| line.parse().ok())
        .ok_or_else(|| invalid("missing tree size"))?;
    let root_hash = lines
        .next()
        .and_then(|line| BASE64.decode(line).ok())
        .ok_or_else(|| invalid("missing root hash"))?;

    if size != tree_size || root_hash != root {
        return Err(invalid("does not match the inclusion proof"));
    }

    let hint = &key.key_id[..4.min(key.key_id.len())];
    let signed = signatures
        .lines()
        .filter_map(|line| line.strip_prefix("\u{2014} "))
        .filter_map(|line| line.rsplit_once(' '))
        .filter_map(|(_, sig)| BASE64.decode(sig).ok())
        .filter(|sig| sig.len() > 4 && &sig[..4] == hint)
        .any(|sig| verify_with_spki_der(&key.spki_der, &sig[4..], note.as_bytes()).is_ok());

    if !signed {
        return Err(invalid("no valid signature from the trusted Rekor key"));
    }

    debug!("Checkpoint for tree size {} verified", size);
    Ok(())
}

/// Verify Rekor's signed promise over the canonical JSON of the entry.
fn verify_signed_entry_timestamp(
    entry: &TlogEntry,
    signed_entry_timestamp: &str,
    key: &RekorKey,
) -> Result<()> {
    let signature = BASE64.decode(signed_entry_timestamp).map_err(|e| {
        AttestationError::Verification(format!("Failed to decode SET: {}", e))
    })?;

    // Keys in lexicographic order, no whitespace.
    let message = format!(
        r#"{{"body":{},"integratedTime":{},"logID":{},"logIndex":{}}}"#,
        serde_json::to_string(&entry.canonicalized_body)?,
        entry.integrated_time,
        serde_json::to_string(&hex::encode(&key.key_id))?,
        entry.log_index
    );

    verify_with_spki_der(&key.spki_der, &signature, message.as_bytes()).map_err(|e| {
        AttestationError::Verification(format!(
            "Failed to verify Signed Entry Timestamp: {}",
            e
        ))
    })
}

fn verify_with_spki_der(spki_der: &[u8], signature: &[u8], message: &[u8]) -> Result<()> {
    if let Ok(verifying_key) = P256VerifyingKey::from_public_key_der(spki_der) {
        let sig = P256Signature::from_der(signature).map_err(|e| {
            AttestationError::Verification(format!("Failed to parse signature: {}", e))
        })?;
        return verifying_key.verify(message, &sig).map_err(|e| {
            AttestationError::Verification(format!("Signature verification failed: {}", e))
        });
    }

    if let Ok(verifying_key) = P384VerifyingKey::from_public_key_der(spki_der) {
        use p384::ecdsa::signature::Verifier;
        let sig = P384Signature::from_der(signature).map_err(|e| {
            AttestationError::Verification(format!("Failed to parse signature: {}", e))
        })?;
        return verifying_key.verify(message, &sig).map_err(|e| {
            AttestationError::Verification(format!("Signature verification failed: {}", e))
        });
    }

    Err(AttestationError::Verification("Unsupported key type".into()))
}

/// Extract the signer identity from Fulcio certificate extensions.
fn signing_identity(cert: &X509Certificate<'_>) -> Result<SigningIdentity> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| AttestationError::Verification(format!("Invalid SAN extension: {}", e)))?
        .and_then(|ext| {
            ext.value.general_names.iter().find_map(|name| match name {
                GeneralName::URI(uri) => Some(uri.to_string()),
                GeneralName::RFC822Name(email) => Some(email.to_string()),
                _ => None,
            })
        })
        .ok_or_else(|| {
            AttestationError::Verification("Certificate has no subject alternative name".into())
        })?;

    let mut identity = SigningIdentity {
        san,
        ..Default::default()
    };
    let mut legacy_issuer = None;

    for ext in cert.extensions() {
        match ext.oid.to_id_string().as_str() {
            OID_ISSUER_V2 => identity.issuer = der_utf8(ext.value)?,
            OID_ISSUER_V1 => legacy_issuer = Some(String::from_utf8_lossy(ext.value).into_owned()),
            OID_RUNNER_ENVIRONMENT => identity.runner_environment = Some(der_utf8(ext.value)?),
            OID_SOURCE_REPOSITORY_URI => identity.source_repository = Some(der_utf8(ext.value)?),
            _ => {}
        }
    }

    if identity.issuer.is_empty() {
        identity.issuer = legacy_issuer.ok_or_else(|| {
            AttestationError::Verification("Certificate has no OIDC issuer extension".into())
        })?;
    }

    Ok(identity)
}

fn der_utf8(value: &[u8]) -> Result<String> {
    let (_, object) = parse_der_utf8string(value).map_err(|e| {
        AttestationError::Verification(format!("Invalid certificate extension value: {}", e))
    })?;
    object.as_str().map(str::to_string).map_err(|e| {
        AttestationError::Verification(format!("Invalid certificate extension value: {}", e))
    })
}

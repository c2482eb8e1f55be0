use crate::bundle::AttestationBundle;
use crate::digest::ArtifactDigest;
use crate::policy::{IdentityConstraint, TrustRootMode, VerificationPolicy};
use crate::report::{AttestationProcessingResult, CheckKind, CheckOutcome, PolicyCheck};
use crate::verifiers::trust::recognizes_issuer;
use crate::verifiers::{SignatureVerifier, SigningIdentity, VerifiedStatement};
use crate::{AttestationError, Result};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const MAX_PARALLEL_VERIFICATIONS: usize = 8;
const GITHUB_HOSTED_RUNNER: &str = "github-hosted";

fn parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_PARALLEL_VERIFICATIONS)
}

/// Evaluate every candidate bundle against the policy, one result per
/// candidate in retrieval order.
pub async fn verify_candidates(
    bundles: Vec<AttestationBundle>,
    policy: Arc<VerificationPolicy>,
    digest: Arc<ArtifactDigest>,
    verifier: Arc<dyn SignatureVerifier>,
    cancel: &CancellationToken,
) -> Result<Vec<AttestationProcessingResult>> {
    ensure_issuer_recognized(&policy.trust_root, &policy.oidc_issuer)?;

    debug!(
        "Verifying {} candidate(s) with {} verifier",
        bundles.len(),
        verifier.verifier_type()
    );

    let sem = Arc::new(Semaphore::new(parallelism()));
    let mut join_set = JoinSet::new();
    let mut slots: Vec<Option<AttestationProcessingResult>> = vec![None; bundles.len()];

    for (index, bundle) in bundles.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                join_set.abort_all();
                return Err(AttestationError::Cancelled);
            }
            permit = Arc::clone(&sem).acquire_owned() => permit
                .map_err(|e| AttestationError::Verification(format!("worker pool closed: {}", e)))?,
        };
        let policy = Arc::clone(&policy);
        let digest = Arc::clone(&digest);
        let verifier = Arc::clone(&verifier);
        join_set.spawn(async move {
            let _permit = permit;
            (index, evaluate(index, &bundle, &policy, &digest, verifier.as_ref()).await)
        });
    }

    loop {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                join_set.abort_all();
                return Err(AttestationError::Cancelled);
            }
            joined = join_set.join_next() => joined,
        };

        match joined {
            Some(Ok((index, result))) => slots[index] = Some(result),
            Some(Err(e)) => warn!("Verification task failed: {}", e),
            None => break,
        }
    }

    Ok(slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| AttestationProcessingResult {
                index,
                signature: CheckOutcome::Fail("verification task did not complete".into()),
                verified: None,
                checks: skipped_checks(),
            })
        })
        .collect())
}

fn ensure_issuer_recognized(trust_root: &TrustRootMode, issuer: &str) -> Result<()> {
    if recognizes_issuer(trust_root, issuer) {
        return Ok(());
    }
    Err(AttestationError::NoMatchingIssuer {
        issuer: issuer.to_string(),
        trust_root: trust_root.name().to_string(),
    })
}

/// Verify one candidate and run the policy checks over what it proves.
pub async fn evaluate(
    index: usize,
    bundle: &AttestationBundle,
    policy: &VerificationPolicy,
    digest: &ArtifactDigest,
    verifier: &dyn SignatureVerifier,
) -> AttestationProcessingResult {
    match verifier.verify(bundle, &policy.trust_root, digest).await {
        Ok(verified) => {
            let checks = policy_checks(policy, &verified);
            debug!("Attestation {} signature verified", index);
            let san = &verified.identity.san;
            let signer = match verified.statement.workflow_ref() {
                Some(workflow) => format!("signed by {} (workflow {})", san, workflow),
                None => format!("signed by {}", san),
            };
            AttestationProcessingResult {
                index,
                signature: CheckOutcome::Pass(signer),
                verified: Some(verified),
                checks,
            }
        }
        Err(e) => {
            debug!("Attestation {} signature verification failed: {}", index, e);
            AttestationProcessingResult {
                index,
                signature: CheckOutcome::Fail(e.to_string()),
                verified: None,
                checks: skipped_checks(),
            }
        }
    }
}

fn skipped_checks() -> Vec<PolicyCheck> {
    [
        CheckKind::Issuer,
        CheckKind::Identity,
        CheckKind::SelfHostedRunner,
        CheckKind::PredicateType,
    ]
    .into_iter()
    .map(|kind| PolicyCheck {
        kind,
        outcome: CheckOutcome::Skip("signature verification failed".into()),
    })
    .collect()
}

fn policy_checks(policy: &VerificationPolicy, verified: &VerifiedStatement) -> Vec<PolicyCheck> {
    vec![
        PolicyCheck {
            kind: CheckKind::Issuer,
            outcome: check_issuer(&policy.oidc_issuer, &verified.identity),
        },
        PolicyCheck {
            kind: CheckKind::Identity,
            outcome: check_identity(&policy.identity, &verified.identity),
        },
        PolicyCheck {
            kind: CheckKind::SelfHostedRunner,
            outcome: check_runner(policy.deny_self_hosted_runner, verified),
        },
        PolicyCheck {
            kind: CheckKind::PredicateType,
            outcome: check_predicate_type(
                &policy.predicate_type,
                &verified.statement.predicate_type,
            ),
        },
    ]
}

fn check_issuer(expected: &str, identity: &SigningIdentity) -> CheckOutcome {
    if identity.issuer == expected {
        CheckOutcome::Pass(format!("issuer is {}", expected))
    } else {
        CheckOutcome::Fail(format!(
            "expected issuer {}, got {}",
            expected, identity.issuer
        ))
    }
}

fn check_identity(constraint: &IdentityConstraint, identity: &SigningIdentity) -> CheckOutcome {
    let matched = match constraint {
        IdentityConstraint::Any => return CheckOutcome::Skip("no identity constraint".into()),
        IdentityConstraint::Exact(san) => identity.san == *san,
        IdentityConstraint::Pattern(re) => re.is_match(&identity.san),
    };

    if matched {
        CheckOutcome::Pass(format!("SAN {} matches {}", identity.san, constraint.describe()))
    } else {
        CheckOutcome::Fail(format!(
            "SAN {} does not match {}",
            identity.san,
            constraint.describe()
        ))
    }
}

/// The certificate extension is authoritative; the predicate's copy is a
/// fallback for certificates issued before the extension existed.
fn check_runner(deny_self_hosted: bool, verified: &VerifiedStatement) -> CheckOutcome {
    if !deny_self_hosted {
        return CheckOutcome::Skip("self-hosted runners allowed".into());
    }

    let runner = verified
        .identity
        .runner_environment
        .as_deref()
        .or_else(|| verified.statement.runner_environment());

    match runner {
        Some(GITHUB_HOSTED_RUNNER) => CheckOutcome::Pass("built on a GitHub-hosted runner".into()),
        Some(other) => CheckOutcome::Fail(format!("built on a {} runner", other)),
        None => CheckOutcome::Fail("runner environment not recorded".into()),
    }
}

fn check_predicate_type(expected: &str, actual: &str) -> CheckOutcome {
    if actual == expected {
        CheckOutcome::Pass(format!("predicate type is {}", expected))
    } else {
        CheckOutcome::Fail(format!("expected predicate type {}, got {}", expected, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Statement;
    use crate::bundle::tests::{bundle_json, statement_json};
    use crate::digest::DigestAlgorithm;
    use crate::policy::{GITHUB_OIDC_ISSUER, SLSA_PREDICATE_V1, VerifyOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const SAN: &str =
        "https://github.com/sigstore/sigstore-js/.github/workflows/release.yml@refs/heads/main";

    /// Accepts bundles whose first signature is "good", reporting `identity`.
    struct FakeVerifier {
        identity: SigningIdentity,
        calls: AtomicUsize,
    }

    impl FakeVerifier {
        fn new(identity: SigningIdentity) -> Self {
            Self {
                identity,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SignatureVerifier for FakeVerifier {
        async fn verify(
            &self,
            bundle: &AttestationBundle,
            _trust_root: &TrustRootMode,
            _expected: &ArtifactDigest,
        ) -> Result<VerifiedStatement> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if bundle.dsse_envelope.signatures[0].sig != "good" {
                return Err(AttestationError::Verification("bad signature".into()));
            }
            Ok(VerifiedStatement {
                statement: bundle.statement()?,
                identity: self.identity.clone(),
                integrated_time: Some(1_700_000_000),
            })
        }

        fn verifier_type(&self) -> &'static str {
            "Fake"
        }
    }

    fn identity() -> SigningIdentity {
        SigningIdentity {
            san: SAN.into(),
            issuer: GITHUB_OIDC_ISSUER.into(),
            runner_environment: Some("github-hosted".into()),
            source_repository: Some("https://github.com/sigstore/sigstore-js".into()),
        }
    }

    fn bundle(sig: &str, predicate_type: &str) -> AttestationBundle {
        let mut raw = bundle_json(&statement_json("abcd", predicate_type));
        raw["dsseEnvelope"]["signatures"][0]["sig"] = sig.into();
        serde_json::from_value(raw).unwrap()
    }

    fn policy(options: VerifyOptions) -> Arc<VerificationPolicy> {
        Arc::new(options.validate().unwrap())
    }

    fn repo_options() -> VerifyOptions {
        VerifyOptions {
            repo: Some("sigstore/sigstore-js".into()),
            ..VerifyOptions::new("artifact.tgz")
        }
    }

    fn digest() -> Arc<ArtifactDigest> {
        Arc::new(ArtifactDigest::new(DigestAlgorithm::Sha256, "abcd"))
    }

    async fn run(
        bundles: Vec<AttestationBundle>,
        options: VerifyOptions,
        verifier: Arc<FakeVerifier>,
    ) -> Result<Vec<AttestationProcessingResult>> {
        let cancel = CancellationToken::new();
        verify_candidates(bundles, policy(options), digest(), verifier, &cancel).await
    }

    #[tokio::test]
    async fn test_signature_failure_skips_policy_checks() {
        let verifier = Arc::new(FakeVerifier::new(identity()));
        let results = run(vec![bundle("bad", SLSA_PREDICATE_V1)], repo_options(), verifier)
            .await
            .unwrap();

        assert!(results[0].signature.is_fail());
        assert!(results[0].verified.is_none());
        assert_eq!(results[0].checks.len(), 4);
        assert!(
            results[0]
                .checks
                .iter()
                .all(|check| matches!(check.outcome, CheckOutcome::Skip(_)))
        );
    }

    #[tokio::test]
    async fn test_results_keep_retrieval_order() {
        let verifier = Arc::new(FakeVerifier::new(identity()));
        let bundles: Vec<_> = (0..20)
            .map(|i| bundle(if i % 3 == 0 { "good" } else { "bad" }, SLSA_PREDICATE_V1))
            .collect();

        let results = run(bundles, repo_options(), Arc::clone(&verifier)).await.unwrap();

        assert_eq!(results.len(), 20);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 20);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.index, i);
            assert_eq!(result.is_verified(), i % 3 == 0);
        }
    }

    #[tokio::test]
    async fn test_default_identity_from_repo() {
        let verifier = Arc::new(FakeVerifier::new(identity()));
        let results = run(vec![bundle("good", SLSA_PREDICATE_V1)], repo_options(), verifier)
            .await
            .unwrap();
        assert!(results[0].check(CheckKind::Identity).unwrap().is_pass());
        assert!(results[0].matches_predicate());
        assert!(
            results[0]
                .signature
                .message()
                .ends_with("(workflow .github/workflows/release.yml)")
        );
    }

    #[tokio::test]
    async fn test_identity_pattern_is_anchored() {
        let verifier = Arc::new(FakeVerifier::new(SigningIdentity {
            san: "https://evil.example.com/https://example.org/workflow".into(),
            ..identity()
        }));
        let options = VerifyOptions {
            san_regex: Some(r"https://example\.org/".into()),
            ..repo_options()
        };

        let results = run(vec![bundle("good", SLSA_PREDICATE_V1)], options, verifier)
            .await
            .unwrap();
        assert!(results[0].signature.is_pass());
        assert!(results[0].check(CheckKind::Identity).unwrap().is_fail());
        assert!(!results[0].is_verified());
    }

    #[tokio::test]
    async fn test_exact_san() {
        let verifier = Arc::new(FakeVerifier::new(identity()));
        let options = VerifyOptions {
            san: Some(format!("{}x", SAN)),
            ..repo_options()
        };
        let results = run(vec![bundle("good", SLSA_PREDICATE_V1)], options, verifier)
            .await
            .unwrap();
        assert!(results[0].check(CheckKind::Identity).unwrap().is_fail());
    }

    #[tokio::test]
    async fn test_issuer_mismatch() {
        let verifier = Arc::new(FakeVerifier::new(SigningIdentity {
            issuer: "https://accounts.google.com".into(),
            ..identity()
        }));
        let results = run(vec![bundle("good", SLSA_PREDICATE_V1)], repo_options(), verifier)
            .await
            .unwrap();
        assert!(results[0].check(CheckKind::Issuer).unwrap().is_fail());
        assert!(!results[0].is_verified());
    }

    #[tokio::test]
    async fn test_unrecognized_issuer_fails_run() {
        let verifier = Arc::new(FakeVerifier::new(identity()));
        let options = VerifyOptions {
            oidc_issuer: "https://issuer.internal".into(),
            ..repo_options()
        };
        let err = run(vec![bundle("good", SLSA_PREDICATE_V1)], options, Arc::clone(&verifier))
            .await
            .unwrap_err();
        assert!(matches!(err, AttestationError::NoMatchingIssuer { .. }));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_self_hosted_runner() {
        let self_hosted = Arc::new(FakeVerifier::new(SigningIdentity {
            runner_environment: Some("self-hosted".into()),
            ..identity()
        }));
        let deny = VerifyOptions {
            deny_self_hosted_runner: true,
            ..repo_options()
        };

        let good = || vec![bundle("good", SLSA_PREDICATE_V1)];
        let results = run(good(), deny.clone(), self_hosted.clone()).await.unwrap();
        assert!(results[0].check(CheckKind::SelfHostedRunner).unwrap().is_fail());

        let results = run(vec![bundle("good", SLSA_PREDICATE_V1)], repo_options(), self_hosted)
            .await
            .unwrap();
        assert!(matches!(
            results[0].check(CheckKind::SelfHostedRunner),
            Some(CheckOutcome::Skip(_))
        ));

        // Falls back to the predicate, which records github-hosted.
        let unrecorded = Arc::new(FakeVerifier::new(SigningIdentity {
            runner_environment: None,
            ..identity()
        }));
        let results = run(vec![bundle("good", SLSA_PREDICATE_V1)], deny, unrecorded)
            .await
            .unwrap();
        assert!(results[0].check(CheckKind::SelfHostedRunner).unwrap().is_pass());
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let verifier = Arc::new(FakeVerifier::new(identity()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = verify_candidates(
            vec![bundle("good", SLSA_PREDICATE_V1)],
            policy(repo_options()),
            digest(),
            verifier,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AttestationError::Cancelled));
    }

    /// Never finishes a verification; counts how many were started.
    #[derive(Default)]
    struct PendingVerifier {
        started: AtomicUsize,
    }

    #[async_trait]
    impl SignatureVerifier for PendingVerifier {
        async fn verify(
            &self,
            _bundle: &AttestationBundle,
            _trust_root: &TrustRootMode,
            _expected: &ArtifactDigest,
        ) -> Result<VerifiedStatement> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        fn verifier_type(&self) -> &'static str {
            "Pending"
        }
    }

    #[tokio::test]
    async fn test_cancel_while_verifying() {
        let verifier = Arc::new(PendingVerifier::default());
        let bundles = (0..parallelism() + 4)
            .map(|_| bundle("good", SLSA_PREDICATE_V1))
            .collect();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let run = verify_candidates(
            bundles,
            policy(repo_options()),
            digest(),
            Arc::clone(&verifier) as Arc<dyn SignatureVerifier>,
            &cancel,
        );
        let err = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cancellation did not stop the run")
            .unwrap_err();

        assert!(matches!(err, AttestationError::Cancelled));
        let started = verifier.started.load(Ordering::SeqCst);
        assert!((1..=parallelism()).contains(&started));
    }

    #[test]
    fn test_runner_check_prefers_certificate() {
        let statement: Statement =
            serde_json::from_value(statement_json("abcd", SLSA_PREDICATE_V1)).unwrap();
        let verified = VerifiedStatement {
            statement,
            identity: SigningIdentity {
                runner_environment: Some("self-hosted".into()),
                ..identity()
            },
            integrated_time: None,
        };
        assert!(check_runner(true, &verified).is_fail());
    }

    #[test]
    fn test_parallelism_bounds() {
        let n = parallelism();
        assert!((1..=MAX_PARALLEL_VERIFICATIONS).contains(&n));
    }
}

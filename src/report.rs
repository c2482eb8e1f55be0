//! Per-candidate results and the aggregate decision over them.

use crate::verifiers::VerifiedStatement;
use crate::{AttestationError, Result};
use log::{info, warn};
use serde::Serialize;
use std::fmt::Write as _;

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum CheckOutcome {
    Pass(String),
    Fail(String),
    /// Not applicable under the policy, or subsumed by an earlier failure.
    Skip(String),
}

impl CheckOutcome {
    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail(_))
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Pass(m) | Self::Fail(m) | Self::Skip(m) => m,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    Issuer,
    Identity,
    SelfHostedRunner,
    PredicateType,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issuer => "issuer",
            Self::Identity => "identity",
            Self::SelfHostedRunner => "self-hosted-runner",
            Self::PredicateType => "predicate-type",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyCheck {
    pub kind: CheckKind,
    #[serde(flatten)]
    pub outcome: CheckOutcome,
}

/// Everything learned about one retrieved attestation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttestationProcessingResult {
    /// Position in retrieval order.
    pub index: usize,
    pub signature: CheckOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<VerifiedStatement>,
    pub checks: Vec<PolicyCheck>,
}

impl AttestationProcessingResult {
    pub fn check(&self, kind: CheckKind) -> Option<&CheckOutcome> {
        self.checks
            .iter()
            .find(|check| check.kind == kind)
            .map(|check| &check.outcome)
    }

    /// Signature proven and no identity-related check failed. The predicate
    /// type is judged separately by the aggregator.
    pub fn is_verified(&self) -> bool {
        self.signature.is_pass()
            && self
                .checks
                .iter()
                .filter(|check| check.kind != CheckKind::PredicateType)
                .all(|check| !check.outcome.is_fail())
    }

    pub fn matches_predicate(&self) -> bool {
        self.check(CheckKind::PredicateType)
            .is_some_and(CheckOutcome::is_pass)
    }

    fn failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.signature.is_fail() {
            failures.push(format!("signature: {}", self.signature.message()));
        }
        for check in &self.checks {
            if check.outcome.is_fail() {
                failures.push(format!("{}: {}", check.kind.as_str(), check.outcome.message()));
            }
        }
        failures
    }
}

/// All candidate results in retrieval order plus the overall decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub results: Vec<AttestationProcessingResult>,
    /// First result that is verified and carries the expected predicate.
    pub verified_index: Option<usize>,
    pub passed: bool,
    pub predicate_type: String,
}

impl VerificationReport {
    /// The passing result, or the aggregate failure.
    pub fn ensure_verified(&self) -> Result<&AttestationProcessingResult> {
        if let Some(index) = self.verified_index {
            return Ok(&self.results[index]);
        }

        if self.results.iter().any(AttestationProcessingResult::is_verified) {
            return Err(AttestationError::NoMatchingPredicateType {
                expected: self.predicate_type.clone(),
            });
        }

        let mut summary = String::new();
        for result in &self.results {
            let _ = writeln!(summary, "attestation {}:", result.index);
            for failure in result.failures() {
                let _ = writeln!(summary, "  - {}", failure);
            }
        }
        Err(AttestationError::NoVerifiedAttestation(
            summary.trim_end().to_string(),
        ))
    }

    pub fn verified(&self) -> Option<&AttestationProcessingResult> {
        self.verified_index.map(|index| &self.results[index])
    }
}

/// Apply the predicate type filter and decide the run.
pub fn aggregate(
    results: Vec<AttestationProcessingResult>,
    predicate_type: &str,
) -> VerificationReport {
    let verified_index = results
        .iter()
        .position(|result| result.is_verified() && result.matches_predicate());

    match verified_index {
        Some(index) => info!("Attestation {} satisfied the policy", index),
        None => warn!("No attestation satisfied the policy"),
    }

    VerificationReport {
        passed: verified_index.is_some(),
        verified_index,
        results,
        predicate_type: predicate_type.to_string(),
    }
}

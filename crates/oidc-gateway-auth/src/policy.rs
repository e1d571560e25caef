//! Claim-based authorization
//!
//! A verified token only proves *who issued it*. Whether its bearer may use
//! this gateway is decided by a [`ClaimPolicy`]: an ordered list of named
//! predicates over the claim set, each of which must pass.
//!
//! # Extensibility
//!
//! To add a new check, implement [`ClaimPredicate`] and append it with
//! [`ClaimPolicy::require`]. The checker itself does not change.

use thiserror::Error;
use tracing::debug;

use crate::verifier::ClaimSet;

/// Claim naming the calling repository in GitHub Actions tokens
pub const REPOSITORY_CLAIM: &str = "repository";
/// Standard audience claim
pub const AUDIENCE_CLAIM: &str = "aud";

pub const DEFAULT_REPOSITORY: &str = "octo-org/octo-repo";
pub const DEFAULT_AUDIENCE: &str = "api://ActionsOIDCGateway";

/// Why a single predicate failed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("claim '{claim}' is missing")]
    Missing { claim: String },

    #[error("claim '{claim}' is not a string")]
    NotAString { claim: String },

    #[error("claim '{claim}' is '{actual}', expected '{expected}'")]
    Mismatch {
        claim: String,
        expected: String,
        actual: String,
    },
}

/// Authorization failure: the first predicate that did not hold
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Policy '{predicate}' rejected token: {violation}")]
pub struct AuthorizationError {
    pub predicate: String,
    #[source]
    pub violation: PolicyViolation,
}

/// A named, independently evaluated authorization rule
pub trait ClaimPredicate: Send + Sync {
    /// Name used in logs when the predicate fails
    fn name(&self) -> &str;

    fn check(&self, claims: &ClaimSet) -> Result<(), PolicyViolation>;
}

/// Exact, case-sensitive equality of a string claim
#[derive(Debug, Clone)]
pub struct ClaimEquals {
    name: String,
    claim: String,
    expected: String,
}

impl ClaimEquals {
    pub fn new(claim: impl Into<String>, expected: impl Into<String>) -> Self {
        let claim = claim.into();
        Self {
            name: format!("{}-equals", claim),
            claim,
            expected: expected.into(),
        }
    }

    pub fn claim(&self) -> &str {
        &self.claim
    }

    pub fn expected(&self) -> &str {
        &self.expected
    }
}

impl ClaimPredicate for ClaimEquals {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, claims: &ClaimSet) -> Result<(), PolicyViolation> {
        if !claims.contains(&self.claim) {
            return Err(PolicyViolation::Missing {
                claim: self.claim.clone(),
            });
        }

        let actual = claims
            .get_str(&self.claim)
            .ok_or_else(|| PolicyViolation::NotAString {
                claim: self.claim.clone(),
            })?;

        if actual != self.expected {
            return Err(PolicyViolation::Mismatch {
                claim: self.claim.clone(),
                expected: self.expected.clone(),
                actual: actual.to_string(),
            });
        }

        Ok(())
    }
}

/// Ordered set of predicates that must all pass
pub struct ClaimPolicy {
    predicates: Vec<Box<dyn ClaimPredicate>>,
}

impl ClaimPolicy {
    /// A policy with no predicates; it authorizes every verified token
    pub fn new() -> Self {
        Self {
            predicates: Vec::new(),
        }
    }

    /// Repository check followed by audience check
    pub fn for_repository(repository: impl Into<String>, audience: impl Into<String>) -> Self {
        Self::new()
            .require(ClaimEquals::new(REPOSITORY_CLAIM, repository))
            .require(ClaimEquals::new(AUDIENCE_CLAIM, audience))
    }

    pub fn require(mut self, predicate: impl ClaimPredicate + 'static) -> Self {
        self.predicates.push(Box::new(predicate));
        self
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Predicate names in evaluation order
    pub fn names(&self) -> Vec<&str> {
        self.predicates.iter().map(|p| p.name()).collect()
    }

    /// Evaluate predicates in order, stopping at the first failure
    pub fn authorize(&self, claims: &ClaimSet) -> Result<(), AuthorizationError> {
        for predicate in &self.predicates {
            if let Err(violation) = predicate.check(claims) {
                return Err(AuthorizationError {
                    predicate: predicate.name().to_string(),
                    violation,
                });
            }
            debug!(predicate = predicate.name(), "Policy predicate passed");
        }
        Ok(())
    }
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self::for_repository(DEFAULT_REPOSITORY, DEFAULT_AUDIENCE)
    }
}

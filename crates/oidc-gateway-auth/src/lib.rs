//! Identity token verification and claim authorization for the OIDC gateway
//!
//! - [`keys`]: verification key snapshots and the [`KeySource`] boundary
//! - [`jwks`]: a JWKS endpoint cache refreshed in the background
//! - [`verifier`]: signature and validity-window checks producing a [`ClaimSet`]
//! - [`policy`]: ordered claim predicates deciding who may use the gateway

pub mod jwks;
pub mod keys;
pub mod policy;
pub mod verifier;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use jwks::{JwksCache, JwksOptions, RefreshHandle, DEFAULT_JWKS_URL};
pub use keys::{KeySet, KeySource, KeySourceError, VerificationKey};
pub use policy::{AuthorizationError, ClaimEquals, ClaimPolicy, ClaimPredicate, PolicyViolation};
pub use verifier::{ClaimSet, TokenVerifier, VerifierConfig, VerifyError};

// Re-export useful types
pub use jsonwebtoken::Algorithm;

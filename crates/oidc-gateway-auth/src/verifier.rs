//! Identity token verification
//!
//! Verifies a compact JWT against the key its header names and returns the
//! decoded claims. Every failure is reported as a [`VerifyError`] carrying the
//! specific cause for logging; callers are expected to collapse all of them
//! into one undifferentiated "unauthorized" answer.

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::keys::KeySource;

/// Why a token was rejected
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token header has no key id")]
    MissingKeyId,

    #[error("Unknown key id '{0}'")]
    UnknownKeyId(String),

    #[error("Algorithm {0:?} is not allowed")]
    DisallowedAlgorithm(Algorithm),

    #[error("Algorithm {header:?} does not match key algorithm {key:?}")]
    AlgorithmMismatch { header: Algorithm, key: Algorithm },

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Token expired")]
    Expired,

    #[error("Token not yet valid")]
    NotYetValid,

    #[error("Token issued in the future")]
    IssuedInFuture,

    #[error("Invalid issuer")]
    InvalidIssuer,

    #[error("Invalid claims: {0}")]
    InvalidClaims(String),
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::InvalidSignature => VerifyError::InvalidSignature,
            ErrorKind::ExpiredSignature => VerifyError::Expired,
            ErrorKind::ImmatureSignature => VerifyError::NotYetValid,
            ErrorKind::InvalidIssuer => VerifyError::InvalidIssuer,
            ErrorKind::MissingRequiredClaim(claim) => {
                VerifyError::InvalidClaims(format!("missing required claim '{}'", claim))
            }
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidKeyFormat => {
                VerifyError::InvalidSignature
            }
            _ => VerifyError::Malformed(e.to_string()),
        }
    }
}

/// Claims decoded from a verified token
///
/// Only ever produced by [`TokenVerifier::verify`] after the signature and
/// validity window have been checked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimSet {
    claims: Map<String, Value>,
}

impl ClaimSet {
    /// Value of a claim, only if it is a JSON string
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.claims.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Subject claim, handy for log lines
    pub fn subject(&self) -> Option<&str> {
        self.get_str("sub")
    }
}

#[cfg(any(test, feature = "test-util"))]
impl From<Map<String, Value>> for ClaimSet {
    fn from(claims: Map<String, Value>) -> Self {
        Self { claims }
    }
}

/// Verifier settings
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Header `alg` values accepted
    pub algorithms: Vec<Algorithm>,
    /// Clock skew tolerated on `exp`, `nbf` and `iat`, in seconds
    pub leeway: u64,
    /// If set, the `iss` claim must equal this value
    pub issuer: Option<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            algorithms: vec![Algorithm::RS256],
            leeway: 0,
            issuer: None,
        }
    }
}

/// Verifies identity tokens against a [`KeySource`]
#[derive(Clone)]
pub struct TokenVerifier {
    keys: Arc<dyn KeySource>,
    config: VerifierConfig,
}

impl TokenVerifier {
    pub fn new(keys: Arc<dyn KeySource>) -> Self {
        Self::with_config(keys, VerifierConfig::default())
    }

    pub fn with_config(keys: Arc<dyn KeySource>, config: VerifierConfig) -> Self {
        Self { keys, config }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Verify `token` and return its claims
    pub fn verify(&self, token: &str) -> Result<ClaimSet, VerifyError> {
        let header = decode_header(token).map_err(|e| VerifyError::Malformed(e.to_string()))?;

        if !self.config.algorithms.contains(&header.alg) {
            return Err(VerifyError::DisallowedAlgorithm(header.alg));
        }

        let kid = header
            .kid
            .as_deref()
            .filter(|kid| !kid.is_empty())
            .ok_or(VerifyError::MissingKeyId)?;

        let key = self
            .keys
            .resolve_key(kid)
            .map_err(|_| VerifyError::UnknownKeyId(kid.to_string()))?;

        if let Some(key_alg) = key.algorithm() {
            if key_alg != header.alg {
                return Err(VerifyError::AlgorithmMismatch {
                    header: header.alg,
                    key: key_alg,
                });
            }
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.config.leeway;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        // Audience is a policy decision, not a verification one
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);
        if let Some(ref issuer) = self.config.issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = decode::<Map<String, Value>>(token, key.decoding_key(), &validation)?;
        let claims = data.claims;

        if let Some(iat) = claims.get("iat") {
            let iat = iat
                .as_f64()
                .ok_or_else(|| VerifyError::InvalidClaims("'iat' is not a number".to_string()))?;
            let latest = (Utc::now().timestamp() as f64) + self.config.leeway as f64;
            if iat > latest {
                return Err(VerifyError::IssuedInFuture);
            }
        }

        Ok(ClaimSet { claims })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeySet, VerificationKey};
    use crate::testing::TestIssuer;
    use jsonwebtoken::{encode, DecodingKey, EncodingKey, Header};
    use serde_json::json;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(Arc::new(TestIssuer::key_set()))
    }

    #[test]
    fn test_valid_token() {
        let issuer = TestIssuer::primary();
        let token = issuer.sign(&issuer.claims("octo-org/octo-repo", "api://ActionsOIDCGateway"));

        let claims = verifier().verify(&token).unwrap();

        assert_eq!(claims.get_str("repository"), Some("octo-org/octo-repo"));
        assert_eq!(claims.get_str("aud"), Some("api://ActionsOIDCGateway"));
        assert_eq!(claims.subject(), Some("repo:octo-org/octo-repo:ref:refs/heads/main"));
    }

    #[test]
    fn test_rotated_key_verifies() {
        let issuer = TestIssuer::rotated();
        let token = issuer.sign(&issuer.claims("octo-org/octo-repo", "aud"));
        assert!(verifier().verify(&token).is_ok());
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        // Signed by the rotated key but claiming the primary key id
        let issuer = TestIssuer::rotated().with_kid("test-key-1");
        let token = issuer.sign(&issuer.claims("octo-org/octo-repo", "aud"));

        assert_eq!(verifier().verify(&token), Err(VerifyError::InvalidSignature));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let issuer = TestIssuer::primary();
        let token = issuer.sign(&issuer.claims("octo-org/octo-repo", "aud"));
        let forged = issuer.sign(&issuer.claims("evil-org/evil-repo", "aud"));

        // Keep the genuine signature, swap in the forged payload
        let parts: Vec<&str> = token.split('.').collect();
        let forged_parts: Vec<&str> = forged.split('.').collect();
        let spliced = format!("{}.{}.{}", parts[0], forged_parts[1], parts[2]);

        assert_eq!(verifier().verify(&spliced), Err(VerifyError::InvalidSignature));
    }

    #[test]
    fn test_unknown_kid_rejected() {
        let issuer = TestIssuer::primary().with_kid("retired-key");
        let token = issuer.sign(&issuer.claims("octo-org/octo-repo", "aud"));

        assert_eq!(
            verifier().verify(&token),
            Err(VerifyError::UnknownKeyId("retired-key".to_string()))
        );
    }

    #[test]
    fn test_missing_kid_rejected() {
        let issuer = TestIssuer::primary();
        let header = Header::new(Algorithm::RS256);
        let token = encode(
            &header,
            &issuer.claims("octo-org/octo-repo", "aud"),
            &TestIssuer::primary_encoding_key(),
        )
        .unwrap();

        assert_eq!(verifier().verify(&token), Err(VerifyError::MissingKeyId));
    }

    #[test]
    fn test_expired_token_rejected() {
        let issuer = TestIssuer::primary();
        let now = Utc::now().timestamp();
        let mut claims = issuer.claims("octo-org/octo-repo", "aud");
        claims["iat"] = json!(now - 600);
        claims["exp"] = json!(now - 300);

        assert_eq!(verifier().verify(&issuer.sign(&claims)), Err(VerifyError::Expired));
    }

    #[test]
    fn test_leeway_tolerates_small_skew() {
        let issuer = TestIssuer::primary();
        let now = Utc::now().timestamp();
        let mut claims = issuer.claims("octo-org/octo-repo", "aud");
        claims["exp"] = json!(now - 5);
        let token = issuer.sign(&claims);

        let lenient = TokenVerifier::with_config(
            Arc::new(TestIssuer::key_set()),
            VerifierConfig {
                leeway: 60,
                ..VerifierConfig::default()
            },
        );

        assert!(lenient.verify(&token).is_ok());
        assert_eq!(verifier().verify(&token), Err(VerifyError::Expired));
    }

    #[test]
    fn test_not_yet_valid_rejected() {
        let issuer = TestIssuer::primary();
        let mut claims = issuer.claims("octo-org/octo-repo", "aud");
        claims["nbf"] = json!(Utc::now().timestamp() + 600);

        assert_eq!(
            verifier().verify(&issuer.sign(&claims)),
            Err(VerifyError::NotYetValid)
        );
    }

    #[test]
    fn test_issued_in_future_rejected() {
        let issuer = TestIssuer::primary();
        let mut claims = issuer.claims("octo-org/octo-repo", "aud");
        claims["iat"] = json!(Utc::now().timestamp() + 600);

        assert_eq!(
            verifier().verify(&issuer.sign(&claims)),
            Err(VerifyError::IssuedInFuture)
        );
    }

    #[test]
    fn test_missing_exp_rejected() {
        let issuer = TestIssuer::primary();
        let mut claims = issuer.claims("octo-org/octo-repo", "aud");
        claims.as_object_mut().unwrap().remove("exp");

        assert!(matches!(
            verifier().verify(&issuer.sign(&claims)),
            Err(VerifyError::InvalidClaims(_))
        ));
    }

    #[test]
    fn test_issuer_check_when_configured() {
        let issuer = TestIssuer::primary();
        let token = issuer.sign(&issuer.claims("octo-org/octo-repo", "aud"));

        let strict = |iss: &str| {
            TokenVerifier::with_config(
                Arc::new(TestIssuer::key_set()),
                VerifierConfig {
                    issuer: Some(iss.to_string()),
                    ..VerifierConfig::default()
                },
            )
        };

        assert!(strict(TestIssuer::ISSUER).verify(&token).is_ok());
        assert_eq!(
            strict("https://someone-else.example").verify(&token),
            Err(VerifyError::InvalidIssuer)
        );
    }

    #[test]
    fn test_disallowed_algorithm_rejected() {
        // HMAC token against an RS256-only verifier
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("test-key-1".to_string());
        let claims = TestIssuer::primary().claims("octo-org/octo-repo", "aud");
        let token = encode(&header, &claims, &EncodingKey::from_secret(b"guess")).unwrap();

        assert_eq!(
            verifier().verify(&token),
            Err(VerifyError::DisallowedAlgorithm(Algorithm::HS256))
        );
    }

    #[test]
    fn test_key_algorithm_pin_enforced() {
        let keys = KeySet::new().with_key(
            "pinned",
            VerificationKey::new(DecodingKey::from_secret(b"secret"), Some(Algorithm::HS512)),
        );
        let verifier = TokenVerifier::with_config(
            Arc::new(keys),
            VerifierConfig {
                algorithms: vec![Algorithm::HS256, Algorithm::HS512],
                ..VerifierConfig::default()
            },
        );

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("pinned".to_string());
        let claims = TestIssuer::primary().claims("octo-org/octo-repo", "aud");
        let token = encode(&header, &claims, &EncodingKey::from_secret(b"secret")).unwrap();

        assert_eq!(
            verifier.verify(&token),
            Err(VerifyError::AlgorithmMismatch {
                header: Algorithm::HS256,
                key: Algorithm::HS512,
            })
        );
    }

    #[test]
    fn test_garbage_tokens_rejected() {
        let verifier = verifier();
        for token in ["", "not-a-jwt", "a.b.c", "...", "!!!.!!!.!!!", "eyJhbGciOiJSUzI1NiJ9"] {
            match verifier.verify(token) {
                Ok(_) => panic!("Garbage token accepted: {:?}", token),
                Err(e) => assert!(!e.to_string().is_empty()),
            }
        }
    }

    #[test]
    fn test_claim_set_string_accessor() {
        let claims = ClaimSet::from(
            json!({ "aud": ["a", "b"], "repository": "octo-org/octo-repo", "run": 7 })
                .as_object()
                .unwrap()
                .clone(),
        );

        assert_eq!(claims.get_str("repository"), Some("octo-org/octo-repo"));
        assert_eq!(claims.get_str("aud"), None);
        assert_eq!(claims.get_str("run"), None);
        assert!(claims.contains("run"));
        assert_eq!(claims.len(), 3);
    }
}

//! Token minting for tests
//!
//! Signs tokens with the fixed RSA keys under `testdata/`. The matching public
//! keys are published in `testdata/jwks.json` as `test-key-1` (primary) and
//! `test-key-2` (rotated).

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};

use crate::keys::KeySet;

const PRIMARY_PEM: &[u8] = include_bytes!("../testdata/primary_rsa.pem");
const ROTATED_PEM: &[u8] = include_bytes!("../testdata/rotated_rsa.pem");

/// JWKS document with the public halves of both test keys
pub const TEST_JWKS: &str = include_str!("../testdata/jwks.json");

/// Mints signed identity tokens the way the identity provider would
#[derive(Clone)]
pub struct TestIssuer {
    pem: &'static [u8],
    kid: String,
}

impl TestIssuer {
    pub const ISSUER: &'static str = "https://token.actions.githubusercontent.com";

    pub fn primary() -> Self {
        Self {
            pem: PRIMARY_PEM,
            kid: "test-key-1".to_string(),
        }
    }

    pub fn rotated() -> Self {
        Self {
            pem: ROTATED_PEM,
            kid: "test-key-2".to_string(),
        }
    }

    /// Advertise a different key id in the token header
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = kid.into();
        self
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn primary_encoding_key() -> EncodingKey {
        EncodingKey::from_rsa_pem(PRIMARY_PEM).expect("primary test key is valid PEM")
    }

    /// Key set holding both test keys
    pub fn key_set() -> KeySet {
        KeySet::from_jwks_json(TEST_JWKS.as_bytes()).expect("test JWKS is valid")
    }

    /// A workflow-style claim set valid for the next ten minutes
    pub fn claims(&self, repository: &str, audience: &str) -> Value {
        let now = Utc::now().timestamp();
        json!({
            "iss": Self::ISSUER,
            "sub": format!("repo:{}:ref:refs/heads/main", repository),
            "aud": audience,
            "repository": repository,
            "repository_owner": repository.split('/').next().unwrap_or_default(),
            "ref": "refs/heads/main",
            "iat": now,
            "nbf": now,
            "exp": now + 600,
        })
    }

    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        let key = EncodingKey::from_rsa_pem(self.pem).expect("test key is valid PEM");
        encode(&header, claims, &key).expect("signing with test key")
    }
}

//! Verification keys and the key source boundary
//!
//! A [`KeySet`] is an immutable snapshot of the identity provider's published
//! signing keys, indexed by key identifier. Snapshots are never mutated after
//! construction; a refresh builds a new set and swaps it in wholesale (see
//! [`crate::jwks::JwksCache`]).

use jsonwebtoken::jwk::{Jwk, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Key source errors
#[derive(Debug, Error)]
pub enum KeySourceError {
    #[error("No verification key for key id '{0}'")]
    UnknownKeyId(String),

    #[error("Failed to fetch key set from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Key set endpoint {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Invalid key set document: {0}")]
    Parse(String),

    #[error("Key set contains no usable signing keys")]
    EmptyKeySet,

    #[error("HTTP client error: {0}")]
    Client(#[source] reqwest::Error),
}

/// A public key able to verify token signatures
#[derive(Clone)]
pub struct VerificationKey {
    key: DecodingKey,
    algorithm: Option<Algorithm>,
}

impl VerificationKey {
    pub fn new(key: DecodingKey, algorithm: Option<Algorithm>) -> Self {
        Self { key, algorithm }
    }

    /// Build a key from a single JWK entry
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, KeySourceError> {
        let key = DecodingKey::from_jwk(jwk).map_err(|e| KeySourceError::Parse(e.to_string()))?;
        let algorithm = jwk.common.key_algorithm.as_ref().and_then(signing_algorithm);
        Ok(Self { key, algorithm })
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }

    /// Algorithm the publisher pinned this key to, if any
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// JWK `alg` values that name a signature algorithm
fn signing_algorithm(alg: &KeyAlgorithm) -> Option<Algorithm> {
    match alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}

/// Resolves a key identifier from a token header to a verification key
///
/// Implementations must be safe to call from many request tasks at once and
/// must never block on I/O: resolution reads whatever snapshot is current.
pub trait KeySource: Send + Sync {
    fn resolve_key(&self, kid: &str) -> Result<Arc<VerificationKey>, KeySourceError>;
}

/// Raw JWKS document; entries are decoded one by one so a single
/// unsupported key does not poison the whole set.
#[derive(Deserialize)]
struct RawJwkSet {
    keys: Vec<serde_json::Value>,
}

/// Immutable snapshot of verification keys indexed by key id
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, Arc<VerificationKey>>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, kid: impl Into<String>, key: VerificationKey) -> Self {
        self.keys.insert(kid.into(), Arc::new(key));
        self
    }

    /// Parse a JWKS document (`{"keys": [...]}`)
    ///
    /// Entries without a `kid`, or whose parameters cannot be turned into a
    /// decoding key, are skipped. A document that yields no keys at all is
    /// rejected.
    pub fn from_jwks_json(body: &[u8]) -> Result<Self, KeySourceError> {
        let raw: RawJwkSet =
            serde_json::from_slice(body).map_err(|e| KeySourceError::Parse(e.to_string()))?;

        let mut keys = HashMap::with_capacity(raw.keys.len());
        for entry in raw.keys {
            let jwk: Jwk = match serde_json::from_value(entry) {
                Ok(jwk) => jwk,
                Err(e) => {
                    warn!("Skipping unsupported JWK entry: {}", e);
                    continue;
                }
            };

            let Some(kid) = jwk.common.key_id.clone() else {
                warn!("Skipping JWK entry without a key id");
                continue;
            };

            match VerificationKey::from_jwk(&jwk) {
                Ok(key) => {
                    debug!(kid = %kid, algorithm = ?key.algorithm(), "Loaded verification key");
                    keys.insert(kid, Arc::new(key));
                }
                Err(e) => warn!(kid = %kid, "Skipping unusable JWK entry: {}", e),
            }
        }

        if keys.is_empty() {
            return Err(KeySourceError::EmptyKeySet);
        }

        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}

impl KeySource for KeySet {
    fn resolve_key(&self, kid: &str) -> Result<Arc<VerificationKey>, KeySourceError> {
        self.keys
            .get(kid)
            .cloned()
            .ok_or_else(|| KeySourceError::UnknownKeyId(kid.to_string()))
    }
}

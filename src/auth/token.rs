//! JWT token validation (§6.3), generalised from `auth::jwt`'s
//! fixed-EdDSA decode to a per-group, per-algorithm key source.

use dashmap::DashMap;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

use super::TokenValidator;
use crate::permissions::{Role, TokenClaims};

/// Where a group's verification key comes from, chosen by the token's
/// `alg` header (§6.3, Open Question "Token validator algorithm
/// scope").
#[derive(Debug, Clone)]
pub enum KeySource {
    /// HS256 shared secret.
    Hmac(String),
    /// ES256 public key, PEM-encoded.
    Es256Pem(String),
    /// RS256 public key, PEM-encoded.
    Rs256Pem(String),
}

#[derive(Debug, thiserror::Error)]
pub enum JwtValidatorError {
    #[error("no key configured for group")]
    NoKey,
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    permissions: Vec<String>,
}

/// Per-group JWT validator with a process-wide HS256 fallback
/// (§6.3: groups without a configured JWK set use the shared secret).
pub struct JwtValidator {
    keys: DashMap<String, KeySource>,
    default_hmac_secret: Option<String>,
}

impl JwtValidator {
    #[must_use]
    pub fn new(default_hmac_secret: Option<String>) -> Self {
        Self {
            keys: DashMap::new(),
            default_hmac_secret,
        }
    }

    pub fn set_key(&self, group: String, source: KeySource) {
        self.keys.insert(group, source);
    }

    fn key_for(&self, group: &str, alg: Algorithm) -> Result<DecodingKey, JwtValidatorError> {
        if let Some(source) = self.keys.get(group) {
            return decoding_key(&source, alg);
        }
        match (alg, &self.default_hmac_secret) {
            (Algorithm::HS256, Some(secret)) => Ok(DecodingKey::from_secret(secret.as_bytes())),
            _ => Err(JwtValidatorError::NoKey),
        }
    }

    fn validate_inner(&self, group: &str, token: &str) -> Result<TokenClaims, JwtValidatorError> {
        let header = decode_header(token)?;
        let key = self.key_for(group, header.alg)?;
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = true;
        let data = decode::<Claims>(token, &key, &validation)?;
        let permissions = data
            .claims
            .permissions
            .iter()
            .filter_map(|name| Role::parse(name))
            .collect();
        Ok(TokenClaims {
            sub: data.claims.sub,
            permissions,
        })
    }
}

fn decoding_key(source: &KeySource, alg: Algorithm) -> Result<DecodingKey, JwtValidatorError> {
    match (source, alg) {
        (KeySource::Hmac(secret), Algorithm::HS256) => Ok(DecodingKey::from_secret(secret.as_bytes())),
        (KeySource::Es256Pem(pem), Algorithm::ES256) => {
            DecodingKey::from_ec_pem(pem.as_bytes()).map_err(Into::into)
        }
        (KeySource::Rs256Pem(pem), Algorithm::RS256) => {
            DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(Into::into)
        }
        _ => Err(JwtValidatorError::UnsupportedAlgorithm),
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, group: &str, token: &str) -> Option<TokenClaims> {
        match self.validate_inner(group, token) {
            Ok(claims) => Some(claims),
            Err(err) => {
                debug!(group, %err, "token validation failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    #[test]
    fn hs256_default_secret_validates() {
        let validator = JwtValidator::new(Some("s3cret".into()));
        let claims = json!({ "sub": "alice", "permissions": ["present"], "exp": 9_999_999_999i64 });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"s3cret"),
        )
        .unwrap();
        let resolved = validator.validate("room1", &token).unwrap();
        assert_eq!(resolved.sub, "alice");
        assert_eq!(resolved.permissions.len(), 1);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let validator = JwtValidator::new(Some("s3cret".into()));
        let claims = json!({ "sub": "alice", "permissions": [], "exp": 9_999_999_999i64 });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"other"),
        )
        .unwrap();
        assert!(validator.validate("room1", &token).is_none());
    }

    #[test]
    fn no_key_configured_rejects() {
        let validator = JwtValidator::new(None);
        let claims = json!({ "sub": "alice", "permissions": [], "exp": 9_999_999_999i64 });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"x"),
        )
        .unwrap();
        assert!(validator.validate("room1", &token).is_none());
    }

    #[test]
    fn per_group_key_overrides_default() {
        let validator = JwtValidator::new(Some("default".into()));
        validator.set_key("room1".into(), KeySource::Hmac("room-secret".into()));
        let claims = json!({ "sub": "bob", "permissions": ["op"], "exp": 9_999_999_999i64 });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"room-secret"),
        )
        .unwrap();
        assert!(validator.validate("room1", &token).is_some());
        assert!(validator.validate("room2", &token).is_none());
    }
}

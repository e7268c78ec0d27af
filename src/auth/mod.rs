//! External token validator (§6.3, §4.7 step 1).
//!
//! Grounded on `auth::jwt`'s claims-struct-plus-`validate_*_token`
//! shape, generalised from a single fixed EdDSA key pair to a trait
//! seam so HS256 (shared secret), ES256, and RS256 (JWK-configured)
//! groups can all validate tokens the same way the permission
//! resolver expects (§4.7 step 1: "validate it (external validator)").

mod token;

pub use token::{JwtValidator, JwtValidatorError};

use crate::permissions::TokenClaims;

/// Validates a bearer token presented on `join` and returns its
/// resolved claims, or `None` if the token is invalid/expired/for the
/// wrong group (§4.7 step 1, failure case `Expired`).
pub trait TokenValidator: Send + Sync + 'static {
    fn validate(&self, group: &str, token: &str) -> Option<TokenClaims>;
}

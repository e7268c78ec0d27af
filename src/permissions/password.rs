//! The tagged `Password` variant (§3) and its verification logic
//! (§4.7 step 3).

use super::HashVerifyLimiter;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// A group user's configured password (§3). `Password::Empty` never
/// matches, matching the spec's "a password with empty type never
/// matches".
#[derive(Debug, Clone)]
pub enum Password {
    Empty,
    Wildcard,
    Plain(String),
    Pbkdf2 {
        hash: String,
        key_hex: String,
        salt_hex: String,
        iterations: u32,
    },
    Bcrypt(String),
}

/// Verifies `supplied` against `password`. Plain comparisons run
/// constant-time via `subtle`; pbkdf2/bcrypt run on the blocking pool
/// under `limiter`'s bound.
pub async fn verify(password: &Password, supplied: Option<&str>, limiter: &HashVerifyLimiter) -> bool {
    match password {
        Password::Empty => false,
        Password::Wildcard => true,
        Password::Plain(expected) => {
            let Some(supplied) = supplied else {
                return false;
            };
            constant_time_str_eq(expected, supplied)
        }
        Password::Pbkdf2 {
            hash,
            key_hex,
            salt_hex,
            iterations,
        } => {
            let Some(supplied) = supplied else {
                return false;
            };
            let supplied = supplied.to_owned();
            let hash = hash.clone();
            let key_hex = key_hex.clone();
            let salt_hex = salt_hex.clone();
            let iterations = *iterations;
            limiter
                .verify(move || verify_pbkdf2(&supplied, &hash, &key_hex, &salt_hex, iterations))
                .await
        }
        Password::Bcrypt(expected_hash) => {
            let Some(supplied) = supplied else {
                return false;
            };
            let supplied = supplied.to_owned();
            let expected_hash = expected_hash.clone();
            limiter
                .verify(move || bcrypt::verify(&supplied, &expected_hash).unwrap_or(false))
                .await
        }
    }
}

fn constant_time_str_eq(a: &str, b: &str) -> bool {
    // Different lengths are not secret (the attacker learns nothing
    // useful from it) but we still avoid a length-dependent early
    // return on the byte comparison itself.
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// `hash` names the digest ("sha256" is the only one this resolver
/// supports, matching the `pbkdf2` crate's `Sha256` type param);
/// `key_hex`/`salt_hex` are hex-encoded per §3.
fn verify_pbkdf2(supplied: &str, hash: &str, key_hex: &str, salt_hex: &str, iterations: u32) -> bool {
    if hash != "sha256" {
        return false;
    }
    let (Ok(expected_key), Ok(salt)) = (hex::decode(key_hex), hex::decode(salt_hex)) else {
        return false;
    };
    let mut derived = vec![0u8; expected_key.len()];
    pbkdf2_hmac::<Sha256>(supplied.as_bytes(), &salt, iterations, &mut derived);
    derived.ct_eq(&expected_key).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_never_matches() {
        let limiter = HashVerifyLimiter::new();
        assert!(!verify(&Password::Empty, Some("anything"), &limiter).await);
        assert!(!verify(&Password::Empty, None, &limiter).await);
    }

    #[tokio::test]
    async fn wildcard_matches_anything() {
        let limiter = HashVerifyLimiter::new();
        assert!(verify(&Password::Wildcard, None, &limiter).await);
        assert!(verify(&Password::Wildcard, Some("x"), &limiter).await);
    }

    #[tokio::test]
    async fn plain_matches_exact_value_only() {
        let limiter = HashVerifyLimiter::new();
        let pw = Password::Plain("s3cret".into());
        assert!(verify(&pw, Some("s3cret"), &limiter).await);
        assert!(!verify(&pw, Some("wrong"), &limiter).await);
        assert!(!verify(&pw, None, &limiter).await);
    }

    #[tokio::test]
    async fn bcrypt_matches_hashed_value() {
        let limiter = HashVerifyLimiter::new();
        let hash = bcrypt::hash("s3cret", bcrypt::DEFAULT_COST).unwrap();
        let pw = Password::Bcrypt(hash);
        assert!(verify(&pw, Some("s3cret"), &limiter).await);
        assert!(!verify(&pw, Some("wrong"), &limiter).await);
    }

    #[tokio::test]
    async fn pbkdf2_matches_derived_key() {
        let salt = b"somesalt";
        let iterations = 1000;
        let mut key = vec![0u8; 32];
        pbkdf2_hmac::<Sha256>(b"s3cret", salt, iterations, &mut key);
        let pw = Password::Pbkdf2 {
            hash: "sha256".into(),
            key_hex: hex::encode(&key),
            salt_hex: hex::encode(salt),
            iterations,
        };
        let limiter = HashVerifyLimiter::new();
        assert!(verify(&pw, Some("s3cret"), &limiter).await);
        assert!(!verify(&pw, Some("wrong"), &limiter).await);
    }
}

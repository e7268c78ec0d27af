//! Permission resolver (§4.7): maps a credential triple onto an
//! [`AtomicPermissions`] set for a group.
//!
//! The permission set itself is a `bitflags` type in the style of
//! `permissions::guild::GuildPermissions` in the lineage this crate
//! grew out of; checks are `const fn` bit tests rather than string
//! comparisons against a role name.

mod password;

pub use password::Password;

use bitflags::bitflags;
use std::sync::Arc;
use tokio::sync::Semaphore;

bitflags! {
    /// Atomic permissions a resolved client may hold (§3 "Permissions").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    #[serde(transparent)]
    pub struct AtomicPermissions: u8 {
        /// Full group administration: edit the group description (user
        /// table, policy) through the out-of-scope REST surface.
        const ADMIN   = 1 << 0;
        /// Publish audio/video.
        const PRESENT = 1 << 1;
        /// Record the group's media (subject to `allow-recording`).
        const RECORD  = 1 << 2;
        /// Send and receive chat messages.
        const MESSAGE = 1 << 3;
        /// Receive live caption/transcription events.
        const CAPTION = 1 << 4;
        /// Present a token usable by downstream recording/bridge tools.
        const TOKEN   = 1 << 5;
        /// Room moderator: lock/unlock, kick, op/unop other clients.
        /// Distinct from `ADMIN` (§4.7 `op → {op, present, message, …}`).
        const OP      = 1 << 6;
    }
}

impl AtomicPermissions {
    /// Permission names as used on the wire (§6.1 `permissions[]`).
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Self::ADMIN) {
            names.push("admin");
        }
        if self.contains(Self::PRESENT) {
            names.push("present");
        }
        if self.contains(Self::RECORD) {
            names.push("record");
        }
        if self.contains(Self::MESSAGE) {
            names.push("message");
        }
        if self.contains(Self::CAPTION) {
            names.push("caption");
        }
        if self.contains(Self::TOKEN) {
            names.push("token");
        }
        if self.contains(Self::OP) {
            names.push("op");
        }
        names
    }
}

/// Failures from [`resolve`] (§4.7).
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("not authorised")]
    NotAuthorised,
    #[error("anonymous access not authorised")]
    AnonymousNotAuthorised,
    #[error("group is locked")]
    GroupLocked,
    #[error("too many users in group")]
    TooManyUsers,
    #[error("duplicate username")]
    DuplicateUsername,
    #[error("credential expired")]
    Expired,
}

/// A single configured user entry in a group's description (§3
/// `users` map and `wildcard-user`).
#[derive(Debug, Clone)]
pub struct UserEntry {
    pub password: Password,
    pub roles: Vec<Role>,
}

/// Named roles as configured on a group; expanded to [`AtomicPermissions`]
/// by [`expand_roles`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Op,
    Present,
    Message,
    Observe,
    Caption,
}

impl Role {
    /// Parses a role name as used in the `permissions[]` wire field and
    /// a token's `permissions` claim (§6.1, §6.3).
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "admin" => Some(Self::Admin),
            "op" => Some(Self::Op),
            "present" => Some(Self::Present),
            "message" => Some(Self::Message),
            "observe" => Some(Self::Observe),
            "caption" => Some(Self::Caption),
            _ => None,
        }
    }
}

/// The credential triple presented by a joining client (§4.7).
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

/// A validated token's claims, as returned by the external token
/// validator (§6.3).
#[derive(Debug, Clone)]
pub struct TokenClaims {
    pub sub: String,
    pub permissions: Vec<Role>,
}

/// Group-level flags that affect permission expansion and anonymous
/// access (§3, §4.7).
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupPolicy {
    pub allow_anonymous: bool,
    pub allow_recording: bool,
    pub unrestricted_tokens: bool,
}

/// Expands a set of configured roles into [`AtomicPermissions`], per
/// §4.7 step 5.
#[must_use]
pub fn expand_roles(roles: &[Role], policy: GroupPolicy) -> AtomicPermissions {
    let mut perms = AtomicPermissions::empty();
    for &role in roles {
        perms |= match role {
            Role::Admin => AtomicPermissions::ADMIN,
            Role::Op => {
                let mut p = AtomicPermissions::OP | AtomicPermissions::PRESENT | AtomicPermissions::MESSAGE;
                if policy.unrestricted_tokens {
                    p |= AtomicPermissions::TOKEN;
                }
                p
            }
            Role::Present => AtomicPermissions::PRESENT | AtomicPermissions::MESSAGE,
            Role::Message => AtomicPermissions::MESSAGE,
            Role::Observe => AtomicPermissions::empty(),
            Role::Caption => AtomicPermissions::CAPTION,
        };
    }
    // `op` also unlocks `token` when the set already contains `op`'s
    // base grants and the group allows unrestricted tokens; a second
    // pass covers the case where `op` was combined with other roles
    // that individually don't carry TOKEN.
    if roles.contains(&Role::Op) && policy.unrestricted_tokens {
        perms |= AtomicPermissions::TOKEN;
    }
    if roles.contains(&Role::Op) && policy.allow_recording {
        perms |= AtomicPermissions::RECORD;
    }
    perms
}

/// Bounds concurrent pbkdf2/bcrypt verifications to the host's
/// parallelism, per §4.7 step 3 ("bounded concurrency semaphore...to
/// avoid DoS").
#[derive(Clone)]
pub struct HashVerifyLimiter {
    semaphore: Arc<Semaphore>,
}

impl HashVerifyLimiter {
    #[must_use]
    pub fn new() -> Self {
        let permits = std::thread::available_parallelism().map_or(4, std::num::NonZero::get);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Run a blocking password-hash verification on the blocking pool
    /// under the concurrency bound.
    pub async fn verify<F>(&self, f: F) -> bool
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        let _permit = self.semaphore.acquire().await.expect("semaphore not closed");
        tokio::task::spawn_blocking(f).await.unwrap_or(false)
    }
}

impl Default for HashVerifyLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves a credential triple against a group's user table, per the
/// full §4.7 procedure. `lookup` returns the matching user entry (by
/// username) or the wildcard-user entry if none matches; it is a
/// closure rather than a map reference so callers can plug in their
/// own group-state locking.
pub async fn resolve<L>(
    creds: &Credentials,
    lookup: L,
    policy: GroupPolicy,
    limiter: &HashVerifyLimiter,
    validate_token: Option<TokenClaims>,
) -> Result<(String, AtomicPermissions), PermissionError>
where
    L: Fn(Option<&str>) -> Option<(String, UserEntry)>,
{
    if let Some(claims) = validate_token {
        let perms = expand_roles(&claims.permissions, policy);
        return Ok((claims.sub, perms));
    }

    let username = creds.username.as_deref();
    let Some((resolved_username, entry)) = lookup(username) else {
        return Err(PermissionError::NotAuthorised);
    };

    let ok = password::verify(&entry.password, creds.password.as_deref(), limiter).await;
    if !ok {
        return Err(PermissionError::NotAuthorised);
    }

    if !policy.allow_anonymous && resolved_username.is_empty() {
        return Err(PermissionError::AnonymousNotAuthorised);
    }

    Ok((resolved_username, expand_roles(&entry.roles, policy)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow_anonymous: bool, allow_recording: bool, unrestricted_tokens: bool) -> GroupPolicy {
        GroupPolicy {
            allow_anonymous,
            allow_recording,
            unrestricted_tokens,
        }
    }

    #[test]
    fn expand_present_grants_message_too() {
        let perms = expand_roles(&[Role::Present], policy(true, false, false));
        assert!(perms.contains(AtomicPermissions::PRESENT));
        assert!(perms.contains(AtomicPermissions::MESSAGE));
    }

    #[test]
    fn expand_op_grants_op_present_and_message() {
        let perms = expand_roles(&[Role::Op], policy(true, false, false));
        assert!(perms.contains(AtomicPermissions::OP));
        assert!(perms.contains(AtomicPermissions::PRESENT));
        assert!(perms.contains(AtomicPermissions::MESSAGE));
        assert!(!perms.contains(AtomicPermissions::ADMIN));
    }

    #[test]
    fn expand_admin_grants_admin_only() {
        let perms = expand_roles(&[Role::Admin], policy(true, false, false));
        assert!(perms.contains(AtomicPermissions::ADMIN));
        assert!(!perms.contains(AtomicPermissions::OP));
        assert!(!perms.contains(AtomicPermissions::PRESENT));
    }

    #[test]
    fn expand_op_grants_record_only_when_allowed() {
        let without = expand_roles(&[Role::Op], policy(true, false, false));
        assert!(!without.contains(AtomicPermissions::RECORD));
        let with = expand_roles(&[Role::Op], policy(true, true, false));
        assert!(with.contains(AtomicPermissions::RECORD));
    }

    #[test]
    fn expand_op_grants_token_only_when_unrestricted() {
        let without = expand_roles(&[Role::Op], policy(true, false, false));
        assert!(!without.contains(AtomicPermissions::TOKEN));
        let with = expand_roles(&[Role::Op], policy(true, false, true));
        assert!(with.contains(AtomicPermissions::TOKEN));
    }

    #[test]
    fn expand_observe_grants_nothing() {
        let perms = expand_roles(&[Role::Observe], policy(true, false, false));
        assert!(perms.is_empty());
    }

    #[tokio::test]
    async fn resolve_via_token_bypasses_lookup() {
        let claims = TokenClaims {
            sub: "alice".into(),
            permissions: vec![Role::Present],
        };
        let limiter = HashVerifyLimiter::new();
        let creds = Credentials::default();
        let (username, perms) = resolve(
            &creds,
            |_| None,
            policy(true, false, false),
            &limiter,
            Some(claims),
        )
        .await
        .unwrap();
        assert_eq!(username, "alice");
        assert!(perms.contains(AtomicPermissions::PRESENT));
    }

    #[tokio::test]
    async fn resolve_rejects_anonymous_when_disallowed() {
        let limiter = HashVerifyLimiter::new();
        let creds = Credentials::default();
        let entry = UserEntry {
            password: Password::Wildcard,
            roles: vec![Role::Present],
        };
        let result = resolve(
            &creds,
            move |_| Some((String::new(), entry.clone())),
            policy(false, false, false),
            &limiter,
            None,
        )
        .await;
        assert!(matches!(result, Err(PermissionError::AnonymousNotAuthorised)));
    }

    #[tokio::test]
    async fn resolve_rejects_wrong_password() {
        let limiter = HashVerifyLimiter::new();
        let creds = Credentials {
            username: Some("bob".into()),
            password: Some("wrong".into()),
            token: None,
        };
        let entry = UserEntry {
            password: Password::Plain("correct".into()),
            roles: vec![Role::Present],
        };
        let result = resolve(
            &creds,
            move |_| Some(("bob".into(), entry.clone())),
            policy(true, false, false),
            &limiter,
            None,
        )
        .await;
        assert!(matches!(result, Err(PermissionError::NotAuthorised)));
    }
}

//! Group and client state (§3, §4.6).
//!
//! Grounded on `voice::sfu::Room`'s peer map and lock discipline,
//! generalised from a fixed-capacity voice channel to a named,
//! permission-gated forwarding group with chat history and a lock
//! state. Kept the teacher's "mutex guards a `HashMap` keyed by
//! client/peer id" shape; replaced `Uuid` keys with opaque random
//! string ids per §3 ("Client... identified by a random opaque id").

mod chat;

pub use chat::{now_ms, ChatHistory, ChatHistoryEntry};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::codec::Mime;
use crate::down::Down;
use crate::permissions::{AtomicPermissions, GroupPolicy, PermissionError, UserEntry};
use crate::up::Up;

/// Bound on the outbound JSON queue per client (§5 "Overrun").
pub const OUTBOX_CAPACITY: usize = 256;

/// A group name: slash-separated, no empty/`.`/`..` components (§3).
#[must_use]
pub fn is_valid_group_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('.') {
        return false;
    }
    name.split('/').all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Static configuration snapshot for one group (§3 "description
/// snapshot"): user table, flags, and the codec list that determines
/// the group's media API capability.
#[derive(Debug, Clone, Default)]
pub struct GroupDescription {
    pub users: HashMap<String, UserEntry>,
    pub wildcard_user: Option<UserEntry>,
    pub policy: GroupPolicy,
    pub codecs: Vec<Mime>,
    pub public: bool,
    pub max_clients: usize,
}

impl GroupDescription {
    /// Looks up a user entry by username, falling through to the
    /// wildcard user if configured (§4.7 step 2).
    #[must_use]
    pub fn lookup(&self, username: Option<&str>) -> Option<(String, UserEntry)> {
        if let Some(name) = username {
            if let Some(entry) = self.users.get(name) {
                return Some((name.to_string(), entry.clone()));
            }
        }
        self.wildcard_user
            .clone()
            .map(|entry| (username.unwrap_or("").to_string(), entry))
    }
}

/// One client connected to a group (§3 `Client`).
pub struct Client {
    pub id: String,
    pub group_name: String,
    username: RwLock<String>,
    permissions: AtomicU8,
    ups: Mutex<HashMap<String, Arc<Up>>>,
    downs: Mutex<HashMap<String, Arc<Down>>>,
    status: Mutex<Value>,
    outbox: mpsc::Sender<Value>,
}

impl Client {
    /// Builds a client whose outbound events are delivered on `outbox`
    /// (the caller-owned single writer queue for this connection, per
    /// §5 "single writer task"; created before `Client` exists so the
    /// same queue also carries pre-join `joined`/`user` failure events).
    #[must_use]
    pub fn new(username: String, permissions: AtomicPermissions, group_name: String, outbox: mpsc::Sender<Value>) -> Arc<Self> {
        Arc::new(Self {
            id: random_id(),
            group_name,
            username: RwLock::new(username),
            permissions: AtomicU8::new(permissions.bits()),
            ups: Mutex::new(HashMap::new()),
            downs: Mutex::new(HashMap::new()),
            status: Mutex::new(Value::Object(serde_json::Map::new())),
            outbox,
        })
    }

    #[must_use]
    pub fn username(&self) -> String {
        self.username.read().clone()
    }

    #[must_use]
    pub fn permissions(&self) -> AtomicPermissions {
        AtomicPermissions::from_bits_truncate(self.permissions.load(Ordering::Relaxed))
    }

    pub fn set_permissions(&self, perms: AtomicPermissions) {
        self.permissions.store(perms.bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn has(&self, flag: AtomicPermissions) -> bool {
        self.permissions().contains(flag)
    }

    #[must_use]
    pub fn status(&self) -> Value {
        self.status.lock().clone()
    }

    pub fn set_status(&self, value: Value) {
        *self.status.lock() = value;
    }

    pub fn add_up(&self, id: String, up: Arc<Up>) {
        self.ups.lock().insert(id, up);
    }

    #[must_use]
    pub fn up(&self, id: &str) -> Option<Arc<Up>> {
        self.ups.lock().get(id).cloned()
    }

    pub fn remove_up(&self, id: &str) -> Option<Arc<Up>> {
        self.ups.lock().remove(id)
    }

    #[must_use]
    pub fn ups(&self) -> Vec<Arc<Up>> {
        self.ups.lock().values().cloned().collect()
    }

    pub fn add_down(&self, id: String, down: Arc<Down>) {
        self.downs.lock().insert(id, down);
    }

    #[must_use]
    pub fn down(&self, id: &str) -> Option<Arc<Down>> {
        self.downs.lock().get(id).cloned()
    }

    pub fn remove_down(&self, id: &str) -> Option<Arc<Down>> {
        self.downs.lock().remove(id)
    }

    #[must_use]
    pub fn downs(&self) -> Vec<Arc<Down>> {
        self.downs.lock().values().cloned().collect()
    }

    /// Enqueues one JSON event for this client's single writer task;
    /// a full queue is a fatal client error (§5, §7 "Overrun"), left
    /// for the caller to turn into [`PermissionError`]-shaped handling
    /// at the signalling layer.
    pub fn try_send(&self, event: Value) -> Result<(), mpsc::error::TrySendError<Value>> {
        self.outbox.try_send(event)
    }
}

/// A named, permission-gated forwarding group (§3 `Group`).
pub struct Group {
    pub name: String,
    description: RwLock<GroupDescription>,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    lock_reason: RwLock<Option<String>>,
    history: Mutex<ChatHistory>,
    last_activity: Mutex<Instant>,
}

impl Group {
    #[must_use]
    pub fn new(name: String, description: GroupDescription, history_capacity: usize, history_max_age: Duration) -> Self {
        Self {
            name,
            description: RwLock::new(description),
            clients: RwLock::new(HashMap::new()),
            lock_reason: RwLock::new(None),
            history: Mutex::new(ChatHistory::new(history_capacity, history_max_age)),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    #[must_use]
    pub fn description(&self) -> GroupDescription {
        self.description.read().clone()
    }

    pub fn set_description(&self, description: GroupDescription) {
        *self.description.write() = description;
    }

    /// The group's media API capability, derived from its codec list
    /// (§3 "media API capability set derived from the description's
    /// codec list").
    #[must_use]
    pub fn codecs(&self) -> Vec<Mime> {
        self.description.read().codecs.clone()
    }

    #[must_use]
    pub fn is_public(&self) -> bool {
        self.description.read().public
    }

    #[must_use]
    pub fn lock_reason(&self) -> Option<String> {
        self.lock_reason.read().clone()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock_reason.read().is_some()
    }

    pub fn lock(&self, reason: String) {
        *self.lock_reason.write() = Some(reason);
    }

    pub fn unlock(&self) {
        *self.lock_reason.write() = None;
    }

    /// Admits a resolved (username, permissions) pair as a new client,
    /// enforcing the group lock, client cap, and duplicate-username
    /// checks (§4.7 failures, §3 invariants). Operators bypass the lock
    /// so they can still join a locked group to manage it; the caller
    /// is expected to check `AtomicPermissions::OP` before passing
    /// `bypass_lock`.
    pub fn join(
        &self,
        username: String,
        permissions: AtomicPermissions,
        bypass_lock: bool,
        outbox: mpsc::Sender<Value>,
    ) -> Result<Arc<Client>, PermissionError> {
        if self.is_locked() && !bypass_lock {
            return Err(PermissionError::GroupLocked);
        }
        let description = self.description.read();
        let max_clients = description.max_clients;
        drop(description);

        let mut clients = self.clients.write();
        if max_clients > 0 && clients.len() >= max_clients {
            return Err(PermissionError::TooManyUsers);
        }
        if !username.is_empty() && clients.values().any(|c| c.username() == username) {
            return Err(PermissionError::DuplicateUsername);
        }

        let client = Client::new(username, permissions, self.name.clone(), outbox);
        clients.insert(client.id.clone(), client.clone());
        drop(clients);
        self.touch();
        Ok(client)
    }

    /// Removes a client on leave/kick (§4.6 "joined -> leaving").
    pub fn remove_client(&self, id: &str) -> Option<Arc<Client>> {
        let removed = self.clients.write().remove(id);
        self.touch();
        removed
    }

    #[must_use]
    pub fn client(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.read().get(id).cloned()
    }

    #[must_use]
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().values().cloned().collect()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// A group is eligible for expiry once empty, not public, and its
    /// history has aged past its bound (§3 invariants, §5 "group
    /// expiry").
    #[must_use]
    pub fn is_expired(&self, now_idle_bound: Duration) -> bool {
        !self.is_public() && self.client_count() == 0 && self.idle_for() >= now_idle_bound
    }

    pub fn push_chat(&self, entry: ChatHistoryEntry) {
        self.history.lock().push(entry);
        self.touch();
    }

    #[must_use]
    pub fn chat_history(&self) -> Vec<ChatHistoryEntry> {
        self.history.lock().entries().to_vec()
    }

    pub fn clear_chat(&self) {
        self.history.lock().clear();
    }

    /// Ages out chat-history entries past their bound (§5 "chat-history
    /// aging").
    pub fn age_chat_history(&self) {
        self.history.lock().age_out();
    }

    /// Broadcasts one JSON event to every current client. Overrun
    /// clients are skipped here (the caller is expected to detect the
    /// same overrun via its own `try_send` on the keepalive path and
    /// close that client's connection separately).
    pub fn broadcast(&self, event: Value) {
        for client in self.clients.read().values() {
            let _ = client.try_send(event.clone());
        }
    }

    /// Broadcasts to every client except `except_id`.
    pub fn broadcast_except(&self, except_id: &str, event: Value) {
        for client in self.clients.read().values() {
            if client.id != except_id {
                let _ = client.try_send(event.clone());
            }
        }
    }
}

/// Generates a random opaque id for group clients and stream ids (§3).
#[must_use]
pub fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> GroupPolicy {
        GroupPolicy {
            allow_anonymous: true,
            allow_recording: false,
            unrestricted_tokens: false,
        }
    }

    fn group() -> Group {
        let description = GroupDescription {
            policy: policy(),
            max_clients: 2,
            ..Default::default()
        };
        Group::new("test".into(), description, 50, Duration::from_secs(4 * 3600))
    }

    #[test]
    fn valid_group_names() {
        assert!(is_valid_group_name("a/b/c"));
        assert!(!is_valid_group_name(""));
        assert!(!is_valid_group_name(".hidden"));
        assert!(!is_valid_group_name("a/../b"));
        assert!(!is_valid_group_name("a//b"));
    }

    fn outbox() -> mpsc::Sender<Value> {
        mpsc::channel(OUTBOX_CAPACITY).0
    }

    #[test]
    fn join_rejects_over_capacity() {
        let g = group();
        assert!(g.join("a".into(), AtomicPermissions::empty(), false, outbox()).is_ok());
        assert!(g.join("b".into(), AtomicPermissions::empty(), false, outbox()).is_ok());
        assert!(matches!(
            g.join("c".into(), AtomicPermissions::empty(), false, outbox()),
            Err(PermissionError::TooManyUsers)
        ));
    }

    #[test]
    fn join_rejects_duplicate_username() {
        let g = group();
        assert!(g.join("alice".into(), AtomicPermissions::empty(), false, outbox()).is_ok());
        assert!(matches!(
            g.join("alice".into(), AtomicPermissions::empty(), false, outbox()),
            Err(PermissionError::DuplicateUsername)
        ));
    }

    #[test]
    fn join_rejects_when_locked_without_bypass() {
        let g = group();
        g.lock("maintenance".into());
        assert!(matches!(
            g.join("alice".into(), AtomicPermissions::empty(), false, outbox()),
            Err(PermissionError::GroupLocked)
        ));
        assert!(g.join("alice".into(), AtomicPermissions::OP, true, outbox()).is_ok());
    }

    #[test]
    fn expired_only_when_empty_and_private_and_idle() {
        let g = group();
        assert!(!g.is_expired(Duration::from_secs(0)));
        let client = g.join("alice".into(), AtomicPermissions::empty(), false, outbox()).unwrap();
        assert!(!g.is_expired(Duration::from_secs(0)));
        g.remove_client(&client.id);
        assert!(g.is_expired(Duration::from_secs(0)));
    }
}

//! Group description persistence and the recorder seam (§6.3).
//!
//! The in-memory store is grounded on `permissions::guild.rs`'s
//! `DashMap`-backed lookup pattern, generalised from a guild/role table
//! to an etag-guarded group description store so concurrent admin
//! updates can detect conflicting writes without a database.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::group::GroupDescription;
use crate::writer_pool::{PacketSink, PoolPacket};

/// Opaque optimistic-concurrency token for [`GroupStore::put`]/`delete`.
pub type ETag = u64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("group description was modified concurrently")]
    TagMismatch,
    #[error("no such group description")]
    NotFound,
}

/// Persists group descriptions (§6.3 "Group description store").
/// A file-backed implementation is out of scope; only the in-memory
/// `DashMap`-backed store below is provided.
pub trait GroupStore: Send + Sync + 'static {
    fn get(&self, name: &str) -> Option<(GroupDescription, ETag)>;
    fn put(&self, name: &str, etag: Option<ETag>, description: GroupDescription) -> Result<ETag, StoreError>;
    fn delete(&self, name: &str, etag: ETag) -> Result<(), StoreError>;
}

struct Entry {
    description: GroupDescription,
    etag: ETag,
}

/// In-memory, per-process [`GroupStore`] backed by a `DashMap`.
pub struct InMemoryGroupStore {
    entries: DashMap<String, Entry>,
    next_etag: AtomicU64,
}

impl InMemoryGroupStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_etag: AtomicU64::new(1),
        }
    }

    fn fresh_etag(&self) -> ETag {
        self.next_etag.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InMemoryGroupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupStore for InMemoryGroupStore {
    fn get(&self, name: &str) -> Option<(GroupDescription, ETag)> {
        self.entries.get(name).map(|e| (e.description.clone(), e.etag))
    }

    fn put(&self, name: &str, etag: Option<ETag>, description: GroupDescription) -> Result<ETag, StoreError> {
        match self.entries.get(name) {
            Some(existing) if Some(existing.etag) != etag => Err(StoreError::TagMismatch),
            None if etag.is_some() => Err(StoreError::TagMismatch),
            _ => {
                let new_etag = self.fresh_etag();
                self.entries.insert(
                    name.to_string(),
                    Entry {
                        description,
                        etag: new_etag,
                    },
                );
                Ok(new_etag)
            }
        }
    }

    fn delete(&self, name: &str, etag: ETag) -> Result<(), StoreError> {
        match self.entries.get(name) {
            Some(existing) if existing.etag == etag => {
                drop(existing);
                self.entries.remove(name);
                Ok(())
            }
            Some(_) => Err(StoreError::TagMismatch),
            None => Err(StoreError::NotFound),
        }
    }
}

/// Consumes the same attach surface as a subscriber `DownTrack`
/// (§6.3 "Recorder... consumes the same UpTrack capability surface as
/// a subscriber"), plus the two extras a muxer needs to stamp a
/// container's timeline.
pub trait Recorder: PacketSink {
    fn set_time_offset(&self, ntp: u64, rtp: u32);
    fn set_cname(&self, cname: &str);
}

/// No-op recorder; a real muxer-backed implementation is out of scope
/// (§6.3).
pub struct NullRecorder {
    id: String,
}

impl NullRecorder {
    #[must_use]
    pub fn new(id: String) -> Arc<Self> {
        Arc::new(Self { id })
    }
}

impl PacketSink for NullRecorder {
    fn id(&self) -> &str {
        &self.id
    }

    fn write_rtp(self: Arc<Self>, _packet: &PoolPacket) {}

    fn request_keyframe(&self) {}
}

impl Recorder for NullRecorder {
    fn set_time_offset(&self, _ntp: u64, _rtp: u32) {}
    fn set_cname(&self, _cname: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_without_etag_creates_new_entry() {
        let store = InMemoryGroupStore::new();
        let etag = store.put("room1", None, GroupDescription::default()).unwrap();
        assert!(store.get("room1").is_some());
        assert_eq!(store.get("room1").unwrap().1, etag);
    }

    #[test]
    fn put_with_stale_etag_is_rejected() {
        let store = InMemoryGroupStore::new();
        let etag = store.put("room1", None, GroupDescription::default()).unwrap();
        store.put("room1", Some(etag), GroupDescription::default()).unwrap();
        assert!(matches!(
            store.put("room1", Some(etag), GroupDescription::default()),
            Err(StoreError::TagMismatch)
        ));
    }

    #[test]
    fn delete_requires_matching_etag() {
        let store = InMemoryGroupStore::new();
        let etag = store.put("room1", None, GroupDescription::default()).unwrap();
        assert!(matches!(store.delete("room1", etag + 1), Err(StoreError::TagMismatch)));
        assert!(store.delete("room1", etag).is_ok());
        assert!(store.get("room1").is_none());
    }
}

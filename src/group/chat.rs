//! Bounded chat-history ring for one group (§3 `ChatHistoryEntry`).

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One replayable chat/moderation event (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatHistoryEntry {
    pub id: u64,
    pub source_client_id: String,
    pub username: String,
    pub time_ms: i64,
    pub kind: String,
    pub value: Value,
}

/// Fixed-capacity, age-bounded ring of [`ChatHistoryEntry`] (§4.6
/// "chathistory" burst on join, §5 "chat-history aging").
pub struct ChatHistory {
    entries: VecDeque<ChatHistoryEntry>,
    capacity: usize,
    max_age: Duration,
    next_id: u64,
}

impl ChatHistory {
    #[must_use]
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            max_age,
            next_id: 0,
        }
    }

    /// Appends an entry, assigning it the next id and evicting the
    /// oldest entry if over capacity.
    pub fn push(&mut self, mut entry: ChatHistoryEntry) {
        entry.id = self.next_id;
        self.next_id += 1;
        if self.entries.len() >= self.capacity && self.capacity > 0 {
            self.entries.pop_front();
        }
        if self.capacity > 0 {
            self.entries.push_back(entry);
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[ChatHistoryEntry] {
        self.entries.as_slices().0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drops entries older than `max_age` (§8 invariant 4).
    pub fn age_out(&mut self) {
        let now_ms = now_ms();
        let max_age_ms = self.max_age.as_millis() as i64;
        while let Some(front) = self.entries.front() {
            if now_ms - front.time_ms > max_age_ms {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

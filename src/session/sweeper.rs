use std::time::Duration;

use super::store::DurableStore;

/// Rooms live this long after creation before the retention sweep removes them
pub const DEFAULT_ROOM_TTL: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_ROOM_TTL,
        }
    }
}

impl RetentionPolicy {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    /// True once `now - created_at` exceeds the ttl (both in unix millis)
    pub fn is_expired(&self, created_at: u64, now: u64) -> bool {
        now.saturating_sub(created_at) > self.ttl.as_millis() as u64
    }

    /// Codes of every stored room past the ttl, sorted
    pub fn expired_rooms(&self, store: &DurableStore, now: u64) -> Vec<String> {
        let mut expired: Vec<String> = store
            .all_rooms()
            .filter(|(_, room)| self.is_expired(room.created_at, now))
            .map(|(code, _)| code.clone())
            .collect();
        expired.sort();
        expired
    }
}

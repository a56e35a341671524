//! Presence and cursor tracking for a joined session.
//!
//! Presence is ephemeral and best-effort:
//! - One record per participant, superseded on every update
//! - A missing record reads as `offline`
//! - `idle`/`away` are derived from the time since the last input
//! - Peers that stop heartbeating are dropped after the liveness timeout

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::{SessionId, UserId};

/// Presence status for a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PresenceStatus {
    /// Actively editing
    #[default]
    Active,
    /// No recent input
    Idle,
    /// Extended inactivity
    Away,
    /// Left or unreachable
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Active => "active",
            PresenceStatus::Idle => "idle",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// Selected character range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Latest presence of one participant in one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub display_name: String,
    /// Assigned color (hex)
    pub color: String,
    pub status: PresenceStatus,
    /// Cursor character offset
    pub cursor: Option<usize>,
    pub selection: Option<Selection>,
    pub metadata: BTreeMap<String, String>,
    /// Last update or heartbeat (milliseconds since epoch)
    pub last_seen_at: i64,
    /// Last user input (milliseconds since epoch)
    pub last_active_at: i64,
}

impl PresenceRecord {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        display_name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        let now = crate::now_ms();
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            display_name: display_name.into(),
            color: color.into(),
            status: PresenceStatus::Active,
            cursor: None,
            selection: None,
            metadata: BTreeMap::new(),
            last_seen_at: now,
            last_active_at: now,
        }
    }

    /// Record user input at `now`
    pub fn touch(&mut self, now: i64) {
        self.last_seen_at = now;
        self.last_active_at = now;
        self.status = PresenceStatus::Active;
    }

    /// Whether anything a viewer would render differs
    fn differs_from(&self, other: &PresenceRecord) -> bool {
        self.status != other.status
            || self.cursor != other.cursor
            || self.selection != other.selection
            || self.display_name != other.display_name
            || self.metadata != other.metadata
    }
}

/// Status derived from inactivity; explicit `away`/`offline` are kept
fn derive_status(record: &PresenceRecord, now: i64, idle_ms: i64, away_ms: i64) -> PresenceStatus {
    match record.status {
        PresenceStatus::Offline | PresenceStatus::Away => record.status,
        status => {
            let elapsed = now - record.last_active_at;
            if elapsed > away_ms {
                PresenceStatus::Away
            } else if elapsed > idle_ms {
                PresenceStatus::Idle
            } else {
                status
            }
        }
    }
}

/// Presence state of one session, owned by its actor
#[derive(Debug)]
pub struct PresenceTracker {
    session_id: SessionId,
    local_user: UserId,
    records: HashMap<UserId, PresenceRecord>,
    idle_ms: i64,
    away_ms: i64,
}

impl PresenceTracker {
    pub fn new(local: PresenceRecord, idle_timeout: Duration, away_timeout: Duration) -> Self {
        let mut records = HashMap::new();
        let session_id = local.session_id.clone();
        let local_user = local.user_id.clone();
        records.insert(local_user.clone(), local);
        Self {
            session_id,
            local_user,
            records,
            idle_ms: idle_timeout.as_millis() as i64,
            away_ms: away_timeout.as_millis() as i64,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local(&self) -> Option<&PresenceRecord> {
        self.records.get(&self.local_user)
    }

    fn local_mut(&mut self) -> &mut PresenceRecord {
        let session_id = self.session_id.clone();
        let user_id = self.local_user.clone();
        self.records
            .entry(self.local_user.clone())
            .or_insert_with(|| {
                let color = generate_participant_color();
                PresenceRecord::new(user_id.clone(), session_id, user_id, color)
            })
    }

    /// Update the local status; stamps `last_seen_at`
    pub fn set_local_status(
        &mut self,
        status: PresenceStatus,
        metadata: Option<BTreeMap<String, String>>,
        now: i64,
    ) -> PresenceRecord {
        let record = self.local_mut();
        if status == PresenceStatus::Active {
            record.touch(now);
        } else {
            record.status = status;
            record.last_seen_at = now;
        }
        if let Some(metadata) = metadata {
            record.metadata = metadata;
        }
        record.clone()
    }

    /// Move the local cursor; always asserts `active`
    pub fn set_local_cursor(
        &mut self,
        position: usize,
        selection: Option<Selection>,
        now: i64,
    ) -> PresenceRecord {
        let record = self.local_mut();
        record.cursor = Some(position);
        record.selection = selection;
        record.touch(now);
        record.clone()
    }

    /// Local input without a cursor move (e.g. an edit)
    pub fn touch_local(&mut self, now: i64) {
        self.local_mut().touch(now);
    }

    /// Re-assert the local record for the heartbeat
    pub fn heartbeat_local(&mut self, now: i64) -> PresenceRecord {
        let record = self.local_mut();
        record.last_seen_at = now;
        record.clone()
    }

    /// Store a peer's record; returns it when a viewer would see a change
    pub fn observe(&mut self, mut record: PresenceRecord, now: i64) -> Option<PresenceRecord> {
        if record.user_id == self.local_user {
            return None;
        }
        record.last_seen_at = now;
        record.status = derive_status(&record, now, self.idle_ms, self.away_ms);

        let changed = self
            .records
            .get(&record.user_id)
            .map(|previous| record.differs_from(previous))
            .unwrap_or(true);
        self.records.insert(record.user_id.clone(), record.clone());

        changed.then_some(record)
    }

    /// Liveness heartbeat from a peer
    pub fn touch_seen(&mut self, user_id: &str, now: i64) {
        if let Some(record) = self.records.get_mut(user_id) {
            record.last_seen_at = now;
        }
    }

    pub fn remove(&mut self, user_id: &str) -> Option<PresenceRecord> {
        self.records.remove(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    /// Missing records read as offline
    pub fn status_of(&self, user_id: &str) -> PresenceStatus {
        self.records
            .get(user_id)
            .map(|r| r.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    /// All records, ordered by user id
    pub fn records(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Re-derive idle/away for every record; returns those that changed
    pub fn refresh_statuses(&mut self, now: i64) -> Vec<PresenceRecord> {
        let (idle_ms, away_ms) = (self.idle_ms, self.away_ms);
        let mut changed = Vec::new();
        for record in self.records.values_mut() {
            let status = derive_status(record, now, idle_ms, away_ms);
            if status != record.status {
                record.status = status;
                changed.push(record.clone());
            }
        }
        changed
    }

    /// Drop peers silent for longer than `timeout`; returns their user ids
    pub fn expire_stale(&mut self, now: i64, timeout: Duration) -> Vec<UserId> {
        let timeout_ms = timeout.as_millis() as i64;
        let stale: Vec<UserId> = self
            .records
            .values()
            .filter(|r| r.user_id != self.local_user && now - r.last_seen_at > timeout_ms)
            .map(|r| r.user_id.clone())
            .collect();

        for user_id in &stale {
            self.records.remove(user_id);
        }
        stale
    }
}

/// Helper to generate a random color for a participant
pub fn generate_participant_color() -> String {
    use rand::Rng;
    let colors = [
        "#3b82f6", // blue
        "#ef4444", // red
        "#22c55e", // green
        "#f59e0b", // amber
        "#8b5cf6", // violet
        "#ec4899", // pink
        "#06b6d4", // cyan
        "#f97316", // orange
        "#14b8a6", // teal
        "#a855f7", // purple
        "#84cc16", // lime
        "#6366f1", // indigo
    ];
    let idx = rand::thread_rng().gen_range(0..colors.len());
    colors[idx].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(60);
    const AWAY: Duration = Duration::from_secs(300);

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(PresenceRecord::new("alice", "sess-1", "Alice", "#ff0000"), IDLE, AWAY)
    }

    fn peer(now: i64) -> PresenceRecord {
        let mut record = PresenceRecord::new("bob", "sess-1", "Bob", "#00ff00");
        record.last_active_at = now;
        record.last_seen_at = now;
        record
    }

    #[test]
    fn test_record_creation() {
        let record = PresenceRecord::new("alice", "sess-1", "Alice", "#ff0000");
        assert_eq!(record.status, PresenceStatus::Active);
        assert!(record.cursor.is_none());
        assert!(record.last_seen_at > 0);
    }

    #[test]
    fn test_cursor_asserts_active() {
        let mut presence = tracker();
        presence.set_local_status(PresenceStatus::Away, None, 1_000);
        assert_eq!(presence.status_of("alice"), PresenceStatus::Away);

        let record = presence.set_local_cursor(4, Some(Selection::new(6, 4)), 2_000);
        assert_eq!(record.status, PresenceStatus::Active);
        assert_eq!(record.cursor, Some(4));
        assert_eq!(record.selection, Some(Selection { start: 4, end: 6 }));
        assert_eq!(record.last_seen_at, 2_000);
    }

    #[test]
    fn test_missing_record_is_offline() {
        let presence = tracker();
        assert_eq!(presence.status_of("nobody"), PresenceStatus::Offline);
    }

    #[test]
    fn test_observe_supersedes() {
        let mut presence = tracker();
        let now = 10_000;

        assert!(presence.observe(peer(now), now).is_some());
        assert!(presence.observe(peer(now), now + 10).is_none(), "unchanged record");

        let mut moved = peer(now);
        moved.cursor = Some(3);
        assert!(presence.observe(moved, now + 20).is_some());
        assert_eq!(presence.len(), 2);
        assert_eq!(presence.get("bob").unwrap().cursor, Some(3));
    }

    #[test]
    fn test_observe_ignores_own_echo() {
        let mut presence = tracker();
        let own = PresenceRecord::new("alice", "sess-1", "Alice", "#ff0000");
        assert!(presence.observe(own, 0).is_none());
    }

    #[test]
    fn test_refresh_derives_idle_and_away() {
        let mut presence = tracker();
        let start = 1_000_000;
        presence.touch_local(start);
        presence.observe(peer(start), start);

        let changed = presence.refresh_statuses(start + 61_000);
        assert_eq!(changed.len(), 2);
        assert_eq!(presence.status_of("bob"), PresenceStatus::Idle);

        presence.refresh_statuses(start + 301_000);
        assert_eq!(presence.status_of("bob"), PresenceStatus::Away);

        presence.set_local_cursor(0, None, start + 302_000);
        assert_eq!(presence.status_of("alice"), PresenceStatus::Active);
    }

    #[test]
    fn test_expire_stale_peers() {
        let mut presence = tracker();
        presence.observe(peer(0), 0);
        presence.touch_seen("bob", 5_000);

        assert!(presence.expire_stale(20_000, Duration::from_secs(30)).is_empty());

        let expired = presence.expire_stale(40_000, Duration::from_secs(30));
        assert_eq!(expired, vec!["bob".to_string()]);
        assert_eq!(presence.status_of("bob"), PresenceStatus::Offline);
        assert!(presence.local().is_some(), "local record never expires");
    }

    #[test]
    fn test_generate_color() {
        let color = generate_participant_color();
        assert!(color.starts_with('#'));
        assert_eq!(color.len(), 7);
    }
}

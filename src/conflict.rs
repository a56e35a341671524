//! Conflict records for overlapping edits.
//!
//! A conflict is raised when a pending local operation overlaps a remote one
//! that won the channel. The remote text is already in the document; the
//! record keeps what the local side would have written so a strategy (or the
//! user) can put it back.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::document::{EditConflict, Operation};
use crate::error::{CollabError, CollabResult};
use crate::{ConflictId, OperationId, SessionId, UserId};

/// How a session settles overlapping edits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConflictStrategy {
    /// The later-authored operation wins outright
    LatestWins,
    /// Resolve to the merge candidate immediately
    AutoMerge,
    /// Stay pending until a participant picks a side
    #[default]
    UserChoice,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LatestWins => "latest_wins",
            ConflictStrategy::AutoMerge => "auto_merge",
            ConflictStrategy::UserChoice => "user_choice",
        }
    }
}

/// Side chosen when resolving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Local,
    Remote,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictType {
    EditOverlap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConflictSeverity {
    /// Both sides wrote the same text
    Low,
    /// One side only removed text
    Medium,
    /// Both sides wrote different text
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub session_id: SessionId,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    /// Contested region in the current content
    pub position: usize,
    pub length: usize,
    pub local_content: String,
    pub remote_content: String,
    pub merged_content: String,
    pub local_operation_id: OperationId,
    pub remote_operation_id: OperationId,
    pub local_author: UserId,
    pub remote_author: UserId,
    pub local_timestamp: i64,
    pub remote_timestamp: i64,
    pub status: ConflictStatus,
    pub strategy: ConflictStrategy,
    pub resolution: Option<Resolution>,
    pub resolved_content: Option<String>,
    pub resolved_by: Option<UserId>,
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }

    /// Text a resolution would put in the contested region
    pub fn content_for(&self, resolution: Resolution) -> &str {
        match resolution {
            Resolution::Local => &self.local_content,
            Resolution::Remote => &self.remote_content,
            Resolution::Merged => &self.merged_content,
        }
    }
}

/// Builds the merge candidate for `auto_merge` and for manual merges
pub trait MergeStrategy: Send + Sync {
    fn merge(&self, local: &str, remote: &str) -> String;
}

/// Local text, then remote text, joined by a separator
#[derive(Debug, Clone)]
pub struct ConcatMerge {
    pub separator: String,
}

impl Default for ConcatMerge {
    fn default() -> Self {
        Self {
            separator: "\n".to_string(),
        }
    }
}

impl MergeStrategy for ConcatMerge {
    fn merge(&self, local: &str, remote: &str) -> String {
        match (local.is_empty(), remote.is_empty()) {
            (true, _) => remote.to_string(),
            (_, true) => local.to_string(),
            _ if local == remote => local.to_string(),
            _ => format!("{}{}{}", local, self.separator, remote),
        }
    }
}

/// A freshly recorded conflict and what the strategy decided
#[derive(Debug, Clone)]
pub struct Detection {
    pub conflict: Conflict,
    /// Resolution to apply right away, `None` for `user_choice`
    pub auto_resolution: Option<Resolution>,
}

/// Conflict records of one session, owned by its actor
pub struct ConflictResolver {
    session_id: SessionId,
    strategy: ConflictStrategy,
    merge: Arc<dyn MergeStrategy>,
    conflicts: HashMap<ConflictId, Conflict>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("session_id", &self.session_id)
            .field("strategy", &self.strategy)
            .field("conflicts", &self.conflicts.len())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new(session_id: impl Into<String>, strategy: ConflictStrategy) -> Self {
        Self {
            session_id: session_id.into(),
            strategy,
            merge: Arc::new(ConcatMerge::default()),
            conflicts: HashMap::new(),
        }
    }

    pub fn with_merge_strategy(mut self, merge: Arc<dyn MergeStrategy>) -> Self {
        self.merge = merge;
        self
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Record an overlap reported by the document and pick a resolution
    pub fn detect(&mut self, edit: &EditConflict) -> Detection {
        let severity = if edit.local_content == edit.remote_content {
            ConflictSeverity::Low
        } else if edit.local_content.is_empty() || edit.remote_content.is_empty() {
            ConflictSeverity::Medium
        } else {
            ConflictSeverity::High
        };

        let conflict = Conflict {
            id: crate::new_id(),
            session_id: self.session_id.clone(),
            conflict_type: ConflictType::EditOverlap,
            severity,
            position: edit.position,
            length: edit.length,
            merged_content: self.merge.merge(&edit.local_content, &edit.remote_content),
            local_content: edit.local_content.clone(),
            remote_content: edit.remote_content.clone(),
            local_operation_id: edit.local.id.clone(),
            remote_operation_id: edit.remote.id.clone(),
            local_author: edit.local.origin.clone(),
            remote_author: edit.remote.origin.clone(),
            local_timestamp: edit.local.timestamp,
            remote_timestamp: edit.remote.timestamp,
            status: ConflictStatus::Pending,
            strategy: self.strategy,
            resolution: None,
            resolved_content: None,
            resolved_by: None,
            detected_at: crate::now_ms(),
            resolved_at: None,
        };

        let local_is_later = conflict.local_timestamp > conflict.remote_timestamp;
        let auto_resolution = match self.strategy {
            ConflictStrategy::LatestWins if local_is_later => Some(Resolution::Local),
            ConflictStrategy::LatestWins => Some(Resolution::Remote),
            ConflictStrategy::AutoMerge => Some(Resolution::Merged),
            ConflictStrategy::UserChoice => None,
        };

        self.conflicts.insert(conflict.id.clone(), conflict.clone());
        Detection {
            conflict,
            auto_resolution,
        }
    }

    /// Settle a conflict once; later calls fail with `AlreadyResolved`
    pub fn resolve(
        &mut self,
        conflict_id: &str,
        resolution: Resolution,
        resolved_by: &str,
    ) -> CollabResult<Conflict> {
        let conflict = self
            .conflicts
            .get_mut(conflict_id)
            .ok_or_else(|| CollabError::conflict_not_found(conflict_id))?;
        if conflict.is_resolved() {
            return Err(CollabError::AlreadyResolved(conflict_id.to_string()));
        }

        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(resolution);
        conflict.resolved_content = Some(conflict.content_for(resolution).to_string());
        conflict.resolved_by = Some(resolved_by.to_string());
        conflict.resolved_at = Some(crate::now_ms());
        Ok(conflict.clone())
    }

    /// Move pending regions past an operation that was just applied
    pub fn rebase(&mut self, op: &Operation) {
        if op.is_noop() {
            return;
        }
        for conflict in self.conflicts.values_mut().filter(|c| !c.is_resolved()) {
            let start = map_point(conflict.position, op, false);
            let end = map_point(conflict.position + conflict.length, op, true).max(start);
            conflict.position = start;
            conflict.length = end - start;
        }
    }

    pub fn get(&self, conflict_id: &str) -> Option<&Conflict> {
        self.conflicts.get(conflict_id)
    }

    /// All conflicts, oldest first
    pub fn list(&self) -> Vec<Conflict> {
        let mut conflicts: Vec<Conflict> = self.conflicts.values().cloned().collect();
        conflicts.sort_by(|a, b| (a.detected_at, &a.id).cmp(&(b.detected_at, &b.id)));
        conflicts
    }

    pub fn pending(&self) -> Vec<Conflict> {
        self.list().into_iter().filter(|c| !c.is_resolved()).collect()
    }
}

/// Where character offset `p` lands after `op`.
///
/// Region ends do not grow over text inserted right at them.
fn map_point(p: usize, op: &Operation, is_end: bool) -> usize {
    let (start, end, inserted) = (op.position, op.end(), op.edit.inserted_len());
    if p < start || (is_end && p == start) {
        p
    } else if p >= end {
        p - (end - start) + inserted
    } else if is_end {
        start + inserted
    } else {
        start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlap(local_ts: i64, remote_ts: i64) -> EditConflict {
        EditConflict {
            local: Operation::replace("alice", 2, 0, 5, "HELLO").with_timestamp(local_ts),
            remote: Operation::replace("bob", 2, 0, 5, "Howdy").with_timestamp(remote_ts),
            position: 0,
            length: 5,
            local_content: "HELLO".to_string(),
            remote_content: "Howdy".to_string(),
            discarded: Vec::new(),
        }
    }

    #[test]
    fn test_user_choice_stays_pending() {
        let mut resolver = ConflictResolver::new("sess-1", ConflictStrategy::UserChoice);
        let detection = resolver.detect(&overlap(10, 20));

        assert!(detection.auto_resolution.is_none());
        assert_eq!(detection.conflict.status, ConflictStatus::Pending);
        assert_eq!(detection.conflict.severity, ConflictSeverity::High);
        assert_eq!(detection.conflict.merged_content, "HELLO\nHowdy");
        assert_eq!(resolver.pending().len(), 1);
    }

    #[test]
    fn test_latest_wins_picks_later_author() {
        let mut resolver = ConflictResolver::new("sess-1", ConflictStrategy::LatestWins);
        assert_eq!(
            resolver.detect(&overlap(30, 20)).auto_resolution,
            Some(Resolution::Local)
        );
        assert_eq!(
            resolver.detect(&overlap(10, 20)).auto_resolution,
            Some(Resolution::Remote)
        );
    }

    #[test]
    fn test_auto_merge_resolves_to_candidate() {
        let mut resolver = ConflictResolver::new("sess-1", ConflictStrategy::AutoMerge);
        let detection = resolver.detect(&overlap(10, 20));
        assert_eq!(detection.auto_resolution, Some(Resolution::Merged));

        let resolved = resolver
            .resolve(&detection.conflict.id, Resolution::Merged, "alice")
            .unwrap();
        assert_eq!(resolved.resolved_content.as_deref(), Some("HELLO\nHowdy"));
    }

    #[test]
    fn test_resolve_twice_fails() {
        let mut resolver = ConflictResolver::new("sess-1", ConflictStrategy::UserChoice);
        let id = resolver.detect(&overlap(10, 20)).conflict.id;

        let resolved = resolver.resolve(&id, Resolution::Local, "alice").unwrap();
        assert!(resolved.is_resolved());
        assert_eq!(resolved.resolved_content.as_deref(), Some("HELLO"));

        let again = resolver.resolve(&id, Resolution::Remote, "bob");
        assert_eq!(again, Err(CollabError::AlreadyResolved(id.clone())));
        assert_eq!(
            resolver.get(&id).unwrap().resolution,
            Some(Resolution::Local)
        );
    }

    #[test]
    fn test_resolve_unknown_conflict() {
        let mut resolver = ConflictResolver::new("sess-1", ConflictStrategy::UserChoice);
        let result = resolver.resolve("missing", Resolution::Local, "alice");
        assert!(matches!(result, Err(CollabError::NotFound { kind: "Conflict", .. })));
    }

    #[test]
    fn test_rebase_moves_pending_region() {
        let mut resolver = ConflictResolver::new("sess-1", ConflictStrategy::UserChoice);
        let mut edit = overlap(10, 20);
        edit.position = 4;
        let id = resolver.detect(&edit).conflict.id;

        resolver.rebase(&Operation::insert("carol", 3, 0, "__"));
        let conflict = resolver.get(&id).unwrap();
        assert_eq!((conflict.position, conflict.length), (6, 5));

        // insert right after the region does not widen it
        resolver.rebase(&Operation::insert("carol", 4, 11, "!"));
        let conflict = resolver.get(&id).unwrap();
        assert_eq!((conflict.position, conflict.length), (6, 5));

        // delete over the front of the region trims it
        resolver.rebase(&Operation::delete("carol", 5, 5, 3));
        let conflict = resolver.get(&id).unwrap();
        assert_eq!((conflict.position, conflict.length), (5, 3));
    }

    #[test]
    fn test_concat_merge_skips_empty_sides() {
        let merge = ConcatMerge::default();
        assert_eq!(merge.merge("", "remote"), "remote");
        assert_eq!(merge.merge("local", ""), "local");
        assert_eq!(merge.merge("same", "same"), "same");

        let custom = ConcatMerge {
            separator: " | ".to_string(),
        };
        assert_eq!(custom.merge("a", "b"), "a | b");
    }

    struct RemoteFirst;

    impl MergeStrategy for RemoteFirst {
        fn merge(&self, local: &str, remote: &str) -> String {
            format!("{}{}", remote, local)
        }
    }

    #[test]
    fn test_custom_merge_strategy() {
        let mut resolver = ConflictResolver::new("sess-1", ConflictStrategy::AutoMerge)
            .with_merge_strategy(Arc::new(RemoteFirst));
        let detection = resolver.detect(&overlap(10, 20));
        assert_eq!(detection.conflict.merged_content, "HowdyHELLO");
    }
}

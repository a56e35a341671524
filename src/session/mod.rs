//! Collaborative sessions: the persisted model and the per-session actor.
//!
//! A joined session is owned by one actor task ([`actor`]) that holds the
//! document, presence, comments and conflicts. [`SessionHandle`] talks to the
//! actor over a command channel; [`CollabService`] is the caller-facing
//! facade that creates, joins and leaves sessions.

mod actor;
mod coordinator;
mod handle;

pub use coordinator::CollabService;
pub use handle::SessionHandle;

use serde::{Deserialize, Serialize};

use crate::conflict::ConflictStrategy;
use crate::error::{CollabError, CollabResult};
use crate::presence::{PresenceStatus, Selection};
use crate::{SessionId, UserId};

/// Default participant cap
pub const DEFAULT_MAX_PARTICIPANTS: usize = 10;

/// What the session is editing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub content_type: String,
    pub content_id: String,
}

impl Default for ContentRef {
    fn default() -> Self {
        Self {
            content_type: "document".to_string(),
            content_id: crate::new_id(),
        }
    }
}

/// Rights granted to participants other than the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPermissions {
    pub can_edit: bool,
    pub can_comment: bool,
    pub can_suggest: bool,
    pub can_approve: bool,
}

impl Default for SessionPermissions {
    fn default() -> Self {
        Self {
            can_edit: true,
            can_comment: true,
            can_suggest: true,
            can_approve: false,
        }
    }
}

impl SessionPermissions {
    /// Comment only, no edits
    pub fn read_only() -> Self {
        Self {
            can_edit: false,
            can_comment: true,
            can_suggest: false,
            can_approve: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub content: ContentRef,
    pub owner_id: UserId,
    pub participants: Vec<UserId>,
    pub max_participants: usize,
    pub permissions: SessionPermissions,
    pub is_public: bool,
    pub allow_anonymous: bool,
    pub status: SessionStatus,
    /// Milliseconds since epoch
    pub expires_at: Option<i64>,
    pub conflict_strategy: ConflictStrategy,
    pub created_at: i64,
}

impl Session {
    /// New active session with `owner` as the sole participant
    pub fn new(config: SessionConfig, owner: &Identity) -> Self {
        Self {
            id: crate::new_id(),
            name: config.name,
            content: config.content,
            owner_id: owner.user_id.clone(),
            participants: vec![owner.user_id.clone()],
            max_participants: config.max_participants.max(1),
            permissions: config.permissions,
            is_public: config.is_public,
            allow_anonymous: config.allow_anonymous,
            status: SessionStatus::Active,
            expires_at: config.expires_at,
            conflict_strategy: config.conflict_strategy,
            created_at: crate::now_ms(),
        }
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    /// Active and not past its expiry
    pub fn is_joinable(&self, now: i64) -> bool {
        self.status == SessionStatus::Active && !self.is_expired(now)
    }

    pub fn can_join(&self, user_id: &str) -> bool {
        self.is_owner(user_id)
            || self.is_public
            || self.is_participant(user_id)
            || self.allow_anonymous
    }

    pub fn can_edit(&self, user_id: &str) -> bool {
        self.is_owner(user_id) || self.permissions.can_edit
    }

    pub fn can_comment(&self, user_id: &str) -> bool {
        self.is_owner(user_id) || self.permissions.can_comment
    }

    pub fn can_resolve_comments(&self, user_id: &str) -> bool {
        self.can_comment(user_id) || self.permissions.can_approve
    }

    /// Add a participant; returns false when already listed
    pub fn add_participant(&mut self, user_id: &str) -> CollabResult<bool> {
        if self.is_participant(user_id) {
            return Ok(false);
        }
        if self.participants.len() >= self.max_participants {
            return Err(CollabError::SessionFull(self.id.clone()));
        }
        self.participants.push(user_id.to_string());
        Ok(true)
    }

    pub fn remove_participant(&mut self, user_id: &str) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p != user_id);
        self.participants.len() != before
    }
}

/// Options for a new session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub content: ContentRef,
    pub max_participants: usize,
    pub permissions: SessionPermissions,
    pub is_public: bool,
    pub allow_anonymous: bool,
    pub expires_at: Option<i64>,
    pub conflict_strategy: ConflictStrategy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "Untitled session".to_string(),
            content: ContentRef::default(),
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            permissions: SessionPermissions::default(),
            is_public: false,
            allow_anonymous: false,
            expires_at: None,
            conflict_strategy: ConflictStrategy::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_content(
        mut self,
        content_type: impl Into<String>,
        content_id: impl Into<String>,
    ) -> Self {
        self.content = ContentRef {
            content_type: content_type.into(),
            content_id: content_id.into(),
        };
        self
    }

    pub fn with_max_participants(mut self, max: usize) -> Self {
        self.max_participants = max;
        self
    }

    pub fn with_permissions(mut self, permissions: SessionPermissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }
}

/// Who is calling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Generated identity for anonymous joiners
    pub fn guest() -> Self {
        let user_id = format!("anon-{}", crate::new_id());
        let display_name = format!("Guest {}", &user_id[5..9]);
        Self {
            user_id,
            display_name,
        }
    }
}

/// A participant as seen by the local site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub color: Option<String>,
    pub status: PresenceStatus,
    pub cursor: Option<usize>,
    pub selection: Option<Selection>,
    pub is_owner: bool,
    pub last_seen_at: Option<i64>,
}

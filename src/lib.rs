//! Collaborative session coordination.
//!
//! The crate keeps a shared text document consistent across every participant
//! of a session:
//! - Operational transform over a sequenced channel for concurrent edits
//! - Conflict records with latest-wins, merge and manual resolution
//! - Presence and cursor tracking with idle/away/offline derivation
//! - Threaded comments anchored to document positions
//!
//! Each joined session is owned by a single actor task; callers talk to it
//! through [`CollabService`] or a [`SessionHandle`].

pub mod comments;
pub mod config;
pub mod conflict;
pub mod document;
pub mod error;
pub mod events;
pub mod presence;
pub mod session;
pub mod storage;
pub mod transport;

pub use config::CollabConfig;
pub use error::{CollabError, CollabResult};
pub use events::SessionEvent;
pub use session::{
    CollabService, Identity, Participant, Session, SessionConfig, SessionHandle, SessionPermissions,
};

/// Unique identifier for a session
pub type SessionId = String;

/// Unique identifier for a user/participant
pub type UserId = String;

/// Unique identifier for an operation
pub type OperationId = String;

/// Unique identifier for a comment
pub type CommentId = String;

/// Unique identifier for a conflict record
pub type ConflictId = String;

/// Milliseconds since the Unix epoch
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh random identifier
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

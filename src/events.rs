//! Events delivered to subscribers of a [`crate::CollabService`].

use crate::comments::Comment;
use crate::conflict::Conflict;
use crate::document::Operation;
use crate::presence::PresenceRecord;
use crate::session::{Participant, Session};
use crate::{SessionId, UserId};

/// Everything a UI needs to follow a joined session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SessionCreated(Session),
    SessionJoined {
        session: Session,
        user_id: UserId,
    },
    SessionLeft {
        session_id: SessionId,
    },
    /// Ended by the owner or by expiry
    SessionEnded {
        session_id: SessionId,
        ended_by: Option<UserId>,
    },
    ParticipantJoined(Participant),
    ParticipantLeft {
        user_id: UserId,
    },
    /// Initial document state is in place
    DocumentSynced {
        content: String,
        version: u64,
    },
    /// A peer's operation, as applied locally
    RemoteEdit {
        operation: Operation,
        content: String,
        version: u64,
    },
    RemoteCursor(PresenceRecord),
    CommentAdded(Comment),
    CommentResolved(Comment),
    ConflictDetected(Conflict),
    ConflictResolved(Conflict),
    PresenceChanged(PresenceRecord),
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::SessionCreated(_) => "session_created",
            SessionEvent::SessionJoined { .. } => "session_joined",
            SessionEvent::SessionLeft { .. } => "session_left",
            SessionEvent::SessionEnded { .. } => "session_ended",
            SessionEvent::ParticipantJoined(_) => "participant_joined",
            SessionEvent::ParticipantLeft { .. } => "participant_left",
            SessionEvent::DocumentSynced { .. } => "document_synced",
            SessionEvent::RemoteEdit { .. } => "remote_edit",
            SessionEvent::RemoteCursor(_) => "remote_cursor",
            SessionEvent::CommentAdded(_) => "comment_added",
            SessionEvent::CommentResolved(_) => "comment_resolved",
            SessionEvent::ConflictDetected(_) => "conflict_detected",
            SessionEvent::ConflictResolved(_) => "conflict_resolved",
            SessionEvent::PresenceChanged(_) => "presence_changed",
        }
    }
}

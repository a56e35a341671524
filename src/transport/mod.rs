//! Channel transport: per-session pub/sub topics.
//!
//! The transport is the sequencer for edits. Every subscriber of a topic,
//! the publisher included, sees notifications in one total order. Delivery
//! is at-least-once; consumers drop duplicates by id.

mod hub;
pub mod protocol;
mod websocket;

pub use hub::{MemoryTransport, TopicHub};
pub use websocket::WsTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::comments::Comment;
use crate::document::Operation;
use crate::presence::PresenceRecord;
use crate::session::SessionPermissions;
use crate::{CommentId, UserId};

use protocol::ProtocolError;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Payloads carried on session topics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEvent {
    /// A local operation written against `base` entries of the sequenced log
    Edit { op: Operation, base: u64 },
    /// A joiner asks synced peers for the sequenced log
    SyncRequest {
        request_id: String,
        requester: UserId,
    },
    SyncState {
        request_id: String,
        operations: Vec<Operation>,
    },
    Presence(PresenceRecord),
    PresenceLeft { user_id: UserId },
    /// Liveness, distinct from presence
    Heartbeat { user_id: UserId, at: i64 },
    ParticipantJoined {
        user_id: UserId,
        display_name: String,
    },
    ParticipantLeft { user_id: UserId },
    CommentAdded(Comment),
    CommentResolved {
        comment_id: CommentId,
        resolved_by: UserId,
        at: i64,
    },
    PermissionsUpdated(SessionPermissions),
    SessionEnded { ended_by: Option<UserId> },
}

impl ChannelEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ChannelEvent::Edit { .. } => "edit",
            ChannelEvent::SyncRequest { .. } => "sync_request",
            ChannelEvent::SyncState { .. } => "sync_state",
            ChannelEvent::Presence(_) => "presence",
            ChannelEvent::PresenceLeft { .. } => "presence_left",
            ChannelEvent::Heartbeat { .. } => "heartbeat",
            ChannelEvent::ParticipantJoined { .. } => "participant_joined",
            ChannelEvent::ParticipantLeft { .. } => "participant_left",
            ChannelEvent::CommentAdded(_) => "comment_added",
            ChannelEvent::CommentResolved { .. } => "comment_resolved",
            ChannelEvent::PermissionsUpdated(_) => "permissions_updated",
            ChannelEvent::SessionEnded { .. } => "session_ended",
        }
    }
}

/// A delivered event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: String,
    /// Transport client that published it
    pub origin_id: String,
    pub event: ChannelEvent,
}

/// Topic names for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTopics {
    pub edits: String,
    pub presence: String,
    pub events: String,
}

impl SessionTopics {
    pub fn new(session_id: &str) -> Self {
        Self {
            edits: format!("session:{}:edits", session_id),
            presence: format!("session:{}:presence", session_id),
            events: format!("session:{}:events", session_id),
        }
    }
}

/// Receiving end of one topic subscription
#[derive(Debug)]
pub struct Subscription {
    pub topic: String,
    pub id: u64,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    pub(crate) fn new(
        topic: impl Into<String>,
        id: u64,
        rx: mpsc::UnboundedReceiver<Notification>,
    ) -> Self {
        Self {
            topic: topic.into(),
            id,
            rx,
        }
    }

    /// Next notification; `None` once the transport has gone away
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Identity of this connection, stamped on published notifications
    fn client_id(&self) -> &str;

    async fn subscribe(&self, topic: &str) -> TransportResult<Subscription>;

    async fn publish(&self, topic: &str, event: ChannelEvent) -> TransportResult<()>;

    async fn unsubscribe(&self, subscription: Subscription) -> TransportResult<()>;
}

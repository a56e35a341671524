//! Client side of a session actor.

use std::collections::BTreeMap;
use std::fmt;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::actor::Command;
use super::{Participant, Session, SessionPermissions};
use crate::comments::Comment;
use crate::conflict::{Conflict, Resolution};
use crate::document::DocumentView;
use crate::error::{CollabError, CollabResult};
use crate::presence::{PresenceStatus, Selection};
use crate::{SessionId, UserId};

/// Cheap, cloneable access to one joined session.
///
/// Every call is queued to the session actor and handled in order. Once the
/// actor has stopped, calls fail with [`CollabError::NotJoined`].
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    user_id: UserId,
    commands: mpsc::Sender<Command>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: SessionId,
        user_id: UserId,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            commands,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The identity this handle acts as
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The actor has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> CollabResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| CollabError::NotJoined)?;
        rx.await.map_err(|_| CollabError::NotJoined)
    }

    async fn notify(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            debug!("Session {} is gone, dropping presence update", self.session_id);
        }
    }

    pub async fn insert_text(
        &self,
        position: usize,
        content: impl Into<String>,
    ) -> CollabResult<DocumentView> {
        let content = content.into();
        self.request(|reply| Command::InsertText {
            position,
            content,
            reply,
        })
        .await?
    }

    pub async fn delete_text(&self, position: usize, length: usize) -> CollabResult<DocumentView> {
        self.request(|reply| Command::DeleteText {
            position,
            length,
            reply,
        })
        .await?
    }

    pub async fn replace_text(
        &self,
        position: usize,
        length: usize,
        content: impl Into<String>,
    ) -> CollabResult<DocumentView> {
        let content = content.into();
        self.request(|reply| Command::ReplaceText {
            position,
            length,
            content,
            reply,
        })
        .await?
    }

    /// Fire and forget
    pub async fn update_cursor(&self, position: usize, selection: Option<Selection>) {
        self.notify(Command::UpdateCursor {
            position,
            selection,
        })
        .await
    }

    /// Fire and forget
    pub async fn update_presence(
        &self,
        status: PresenceStatus,
        metadata: Option<BTreeMap<String, String>>,
    ) {
        self.notify(Command::UpdatePresence { status, metadata }).await
    }

    pub async fn add_comment(
        &self,
        position: usize,
        length: usize,
        body: impl Into<String>,
    ) -> CollabResult<Comment> {
        let body = body.into();
        self.request(|reply| Command::AddComment {
            position,
            length,
            body,
            reply,
        })
        .await?
    }

    pub async fn reply_to_comment(
        &self,
        parent_id: &str,
        body: impl Into<String>,
    ) -> CollabResult<Comment> {
        let body = body.into();
        let parent_id = parent_id.to_string();
        self.request(|reply| Command::ReplyToComment {
            parent_id,
            body,
            reply,
        })
        .await?
    }

    pub async fn resolve_comment(&self, comment_id: &str) -> CollabResult<Comment> {
        let comment_id = comment_id.to_string();
        self.request(|reply| Command::ResolveComment { comment_id, reply })
            .await?
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> CollabResult<Conflict> {
        let conflict_id = conflict_id.to_string();
        self.request(|reply| Command::ResolveConflict {
            conflict_id,
            resolution,
            reply,
        })
        .await?
    }

    pub async fn get_participants(&self) -> CollabResult<Vec<Participant>> {
        self.request(|reply| Command::GetParticipants { reply }).await
    }

    pub async fn get_comments(&self) -> CollabResult<Vec<Comment>> {
        self.request(|reply| Command::GetComments { reply }).await
    }

    pub async fn get_conflicts(&self) -> CollabResult<Vec<Conflict>> {
        self.request(|reply| Command::GetConflicts { reply }).await
    }

    pub async fn document(&self) -> CollabResult<DocumentView> {
        self.request(|reply| Command::GetDocument { reply }).await
    }

    /// The session as this site currently sees it
    pub async fn session(&self) -> CollabResult<Session> {
        self.request(|reply| Command::GetSession { reply }).await
    }

    pub async fn update_permissions(
        &self,
        permissions: SessionPermissions,
    ) -> CollabResult<Session> {
        self.request(|reply| Command::UpdatePermissions { permissions, reply })
            .await?
    }

    /// Owner only
    pub async fn end_session(&self) -> CollabResult<()> {
        self.request(|reply| Command::EndSession { reply }).await?
    }

    pub async fn leave(&self) -> CollabResult<()> {
        self.request(|reply| Command::Leave { reply }).await?
    }
}

//! The actor that owns one joined session.
//!
//! All session state lives in a single task. Caller commands, channel
//! notifications and timers are multiplexed with `tokio::select!`, so the
//! document, presence, comments and conflicts never need locks.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Identity, Participant, Session, SessionHandle, SessionPermissions, SessionStatus};
use crate::comments::{Comment, CommentStore};
use crate::config::CollabConfig;
use crate::conflict::{Conflict, ConflictResolver, Detection, MergeStrategy, Resolution};
use crate::document::{
    replay, slice_chars, DocumentState, DocumentView, Edit, EditConflict, Operation, OutgoingEdit,
};
use crate::error::{CollabError, CollabResult};
use crate::events::SessionEvent;
use crate::presence::{
    generate_participant_color, PresenceRecord, PresenceStatus, PresenceTracker, Selection,
};
use crate::storage::{DocumentSnapshot, SessionStore};
use crate::transport::{ChannelEvent, ChannelTransport, Notification, SessionTopics, Subscription};
use crate::{CommentId, ConflictId, UserId};

type Reply<T> = oneshot::Sender<CollabResult<T>>;

/// Requests a [`SessionHandle`] sends to the actor
pub(crate) enum Command {
    InsertText {
        position: usize,
        content: String,
        reply: Reply<DocumentView>,
    },
    DeleteText {
        position: usize,
        length: usize,
        reply: Reply<DocumentView>,
    },
    ReplaceText {
        position: usize,
        length: usize,
        content: String,
        reply: Reply<DocumentView>,
    },
    UpdateCursor {
        position: usize,
        selection: Option<Selection>,
    },
    UpdatePresence {
        status: PresenceStatus,
        metadata: Option<BTreeMap<String, String>>,
    },
    AddComment {
        position: usize,
        length: usize,
        body: String,
        reply: Reply<Comment>,
    },
    ReplyToComment {
        parent_id: CommentId,
        body: String,
        reply: Reply<Comment>,
    },
    ResolveComment {
        comment_id: CommentId,
        reply: Reply<Comment>,
    },
    ResolveConflict {
        conflict_id: ConflictId,
        resolution: Resolution,
        reply: Reply<Conflict>,
    },
    GetParticipants {
        reply: oneshot::Sender<Vec<Participant>>,
    },
    GetComments {
        reply: oneshot::Sender<Vec<Comment>>,
    },
    GetConflicts {
        reply: oneshot::Sender<Vec<Conflict>>,
    },
    GetDocument {
        reply: oneshot::Sender<DocumentView>,
    },
    GetSession {
        reply: oneshot::Sender<Session>,
    },
    UpdatePermissions {
        permissions: SessionPermissions,
        reply: Reply<Session>,
    },
    EndSession {
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::InsertText { .. } => "insert_text",
            Command::DeleteText { .. } => "delete_text",
            Command::ReplaceText { .. } => "replace_text",
            Command::UpdateCursor { .. } => "update_cursor",
            Command::UpdatePresence { .. } => "update_presence",
            Command::AddComment { .. } => "add_comment",
            Command::ReplyToComment { .. } => "reply_to_comment",
            Command::ResolveComment { .. } => "resolve_comment",
            Command::ResolveConflict { .. } => "resolve_conflict",
            Command::GetParticipants { .. } => "get_participants",
            Command::GetComments { .. } => "get_comments",
            Command::GetConflicts { .. } => "get_conflicts",
            Command::GetDocument { .. } => "document",
            Command::GetSession { .. } => "session",
            Command::UpdatePermissions { .. } => "update_permissions",
            Command::EndSession { .. } => "end_session",
            Command::Leave { .. } => "leave",
        }
    }
}

/// How the actor comes up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinMode {
    /// Fresh session; the document starts empty and synced
    Create,
    /// Existing session; sync from a peer or from storage first
    Join,
}

/// Everything the actor needs from the coordinator
pub(crate) struct ActorParts {
    pub session: Session,
    pub identity: Identity,
    pub config: CollabConfig,
    pub transport: Arc<dyn ChannelTransport>,
    pub store: SessionStore,
    pub events: broadcast::Sender<SessionEvent>,
    /// Replaces the default concatenating merge
    pub merge: Option<Arc<dyn MergeStrategy>>,
}

enum SyncPhase {
    Synced,
    /// Edits before our own request are already in any answer
    AwaitingEcho { request_id: String },
    AwaitingState {
        request_id: String,
        buffered: Vec<(Operation, u64)>,
    },
}

enum Flow {
    Continue,
    Stop(Shutdown),
}

enum Shutdown {
    Leave(Option<Reply<()>>),
    Ended {
        ended_by: Option<UserId>,
        reply: Option<Reply<()>>,
    },
    SyncFailed,
}

struct Subscriptions {
    edits: Subscription,
    presence: Subscription,
    events: Subscription,
}

struct SessionActor {
    session: Session,
    identity: Identity,
    config: CollabConfig,
    transport: Arc<dyn ChannelTransport>,
    store: SessionStore,
    events: broadcast::Sender<SessionEvent>,
    topics: SessionTopics,
    document: DocumentState,
    presence: PresenceTracker,
    comments: CommentStore,
    conflicts: ConflictResolver,
    sync: SyncPhase,
    sync_waiter: Option<Reply<()>>,
    /// Sequenced operations already in the row store
    saved_ops: usize,
    /// Sequence position of the last stored snapshot
    snapshot_seq: Option<usize>,
}

/// Subscribe, announce ourselves and spawn the actor.
///
/// For [`JoinMode::Join`] this returns once the document is synced.
pub(crate) async fn start(parts: ActorParts, mode: JoinMode) -> CollabResult<SessionHandle> {
    let ActorParts {
        session,
        identity,
        config,
        transport,
        store,
        events,
        merge,
    } = parts;

    let comments = match mode {
        JoinMode::Create => CommentStore::new(),
        JoinMode::Join => CommentStore::with_comments(store.load_comments(&session.id).await?),
    };

    let topics = SessionTopics::new(&session.id);
    let subscriptions = Subscriptions {
        edits: transport.subscribe(&topics.edits).await?,
        presence: transport.subscribe(&topics.presence).await?,
        events: transport.subscribe(&topics.events).await?,
    };

    let local = PresenceRecord::new(
        identity.user_id.clone(),
        session.id.clone(),
        identity.display_name.clone(),
        generate_participant_color(),
    );
    let presence = PresenceTracker::new(local.clone(), config.idle_timeout, config.away_timeout);
    let mut conflicts = ConflictResolver::new(session.id.clone(), session.conflict_strategy);
    if let Some(merge) = merge {
        conflicts = conflicts.with_merge_strategy(merge);
    }

    let (sync, waiter) = match mode {
        JoinMode::Create => (SyncPhase::Synced, None),
        JoinMode::Join => {
            let (tx, rx) = oneshot::channel();
            (
                SyncPhase::AwaitingEcho {
                    request_id: crate::new_id(),
                },
                Some((tx, rx)),
            )
        }
    };
    let (sync_waiter, synced) = match waiter {
        Some((tx, rx)) => (Some(tx), Some(rx)),
        None => (None, None),
    };

    let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
    let handle = SessionHandle::new(session.id.clone(), identity.user_id.clone(), command_tx);

    let actor = SessionActor {
        document: DocumentState::new(identity.user_id.clone()),
        session,
        identity,
        config,
        transport,
        store,
        events,
        topics,
        presence,
        comments,
        conflicts,
        sync,
        sync_waiter,
        saved_ops: 0,
        snapshot_seq: None,
    };

    actor.share_presence(local).await;
    let joined = ChannelEvent::ParticipantJoined {
        user_id: actor.identity.user_id.clone(),
        display_name: actor.identity.display_name.clone(),
    };
    if let Err(e) = actor.transport.publish(&actor.topics.events, joined).await {
        warn!("Failed to announce join of {}: {}", actor.identity.user_id, e);
    }
    if let SyncPhase::AwaitingEcho { request_id } = &actor.sync {
        let request = ChannelEvent::SyncRequest {
            request_id: request_id.clone(),
            requester: actor.identity.user_id.clone(),
        };
        // an unanswered request ends in the storage fallback
        if let Err(e) = actor.transport.publish(&actor.topics.edits, request).await {
            warn!("Failed to request sync for {}: {}", actor.session.id, e);
        }
    }

    tokio::spawn(actor.run(command_rx, subscriptions));

    if let Some(synced) = synced {
        match synced.await {
            Ok(result) => result?,
            Err(_) => return Err(CollabError::NotJoined),
        }
    }
    Ok(handle)
}

fn ticker(period: std::time::Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut subs: Subscriptions) {
        let mut autosave = ticker(self.config.autosave_interval);
        let mut presence = ticker(self.config.presence_interval);
        let mut liveness = ticker(self.config.liveness_interval);
        let sync_deadline = tokio::time::sleep(self.config.sync_timeout);
        tokio::pin!(sync_deadline);

        info!(
            "Session {} running for {}",
            self.session.id, self.identity.user_id
        );

        let shutdown = loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // every handle is gone
                    None => Flow::Stop(Shutdown::Leave(None)),
                },
                Some(notification) = subs.edits.recv() => {
                    self.handle_edit_topic(notification).await
                }
                Some(notification) = subs.presence.recv() => {
                    self.handle_presence_topic(notification);
                    Flow::Continue
                }
                Some(notification) = subs.events.recv() => {
                    self.handle_event_topic(notification).await
                }
                _ = autosave.tick() => {
                    self.autosave().await;
                    Flow::Continue
                }
                _ = presence.tick() => {
                    self.presence_tick().await;
                    Flow::Continue
                }
                _ = liveness.tick() => self.liveness_tick().await,
                _ = &mut sync_deadline, if !self.is_synced() => self.on_sync_timeout().await,
            };
            if let Flow::Stop(shutdown) = flow {
                break shutdown;
            }
        };

        self.shutdown(shutdown, commands, subs).await;
    }

    fn me(&self) -> &str {
        &self.identity.user_id
    }

    fn is_synced(&self) -> bool {
        matches!(self.sync, SyncPhase::Synced)
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn denied(&self, action: &str) -> CollabError {
        CollabError::PermissionDenied(format!(
            "{} may not {} in session {}",
            self.identity.user_id, action, self.session.id
        ))
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::InsertText {
                position,
                content,
                reply,
            } => {
                let result = self.local_edit(position, Edit::Insert { content }).await;
                let _ = reply.send(result);
            }
            Command::DeleteText {
                position,
                length,
                reply,
            } => {
                let result = self.local_edit(position, Edit::Delete { length }).await;
                let _ = reply.send(result);
            }
            Command::ReplaceText {
                position,
                length,
                content,
                reply,
            } => {
                let result = self
                    .local_edit(position, Edit::from_parts(length, content))
                    .await;
                let _ = reply.send(result);
            }
            Command::UpdateCursor {
                position,
                selection,
            } => {
                let record = self
                    .presence
                    .set_local_cursor(position, selection, crate::now_ms());
                self.share_presence(record).await;
            }
            Command::UpdatePresence { status, metadata } => {
                let record = self
                    .presence
                    .set_local_status(status, metadata, crate::now_ms());
                self.share_presence(record).await;
            }
            Command::AddComment {
                position,
                length,
                body,
                reply,
            } => {
                let result = self.add_comment(position, length, body).await;
                let _ = reply.send(result);
            }
            Command::ReplyToComment {
                parent_id,
                body,
                reply,
            } => {
                let result = self.reply_to_comment(&parent_id, body).await;
                let _ = reply.send(result);
            }
            Command::ResolveComment { comment_id, reply } => {
                let result = self.resolve_comment(&comment_id).await;
                let _ = reply.send(result);
            }
            Command::ResolveConflict {
                conflict_id,
                resolution,
                reply,
            } => {
                let result = if self.session.can_edit(self.me()) {
                    self.apply_resolution(&conflict_id, resolution).await
                } else {
                    Err(self.denied("resolve conflicts"))
                };
                let _ = reply.send(result);
            }
            Command::GetParticipants { reply } => {
                let _ = reply.send(self.participants());
            }
            Command::GetComments { reply } => {
                let _ = reply.send(self.comments.all());
            }
            Command::GetConflicts { reply } => {
                let _ = reply.send(self.conflicts.list());
            }
            Command::GetDocument { reply } => {
                let _ = reply.send(self.document.view());
            }
            Command::GetSession { reply } => {
                let _ = reply.send(self.session.clone());
            }
            Command::UpdatePermissions { permissions, reply } => {
                let result = self.update_permissions(permissions).await;
                let _ = reply.send(result);
            }
            Command::EndSession { reply } => {
                if !self.session.is_owner(self.me()) {
                    let _ = reply.send(Err(self.denied("end the session")));
                    return Flow::Continue;
                }
                let ended_by = Some(self.identity.user_id.clone());
                return self.end_session(ended_by, Some(reply)).await;
            }
            Command::Leave { reply } => return Flow::Stop(Shutdown::Leave(Some(reply))),
        }
        Flow::Continue
    }

    // ----- document -----

    async fn local_edit(&mut self, position: usize, edit: Edit) -> CollabResult<DocumentView> {
        if !self.session.can_edit(self.me()) {
            return Err(self.denied("edit"));
        }
        let op = self.document.local_operation(position, edit);
        let outgoing = self.document.apply_local(op.clone())?;
        self.conflicts.rebase(&op);
        self.presence.touch_local(crate::now_ms());
        if let Some(outgoing) = outgoing {
            self.publish_edit(outgoing).await;
        }
        Ok(self.document.view())
    }

    async fn publish_edit(&mut self, outgoing: OutgoingEdit) {
        let id = outgoing.operation.id.clone();
        let event = ChannelEvent::Edit {
            op: outgoing.operation,
            base: outgoing.base,
        };
        if let Err(e) = self.transport.publish(&self.topics.edits, event).await {
            // stays pending; the presence tick retries
            warn!("Failed to publish operation {}: {}", id, e);
            self.document.publish_failed();
        }
    }

    async fn flush_outgoing(&mut self) {
        if let Some(outgoing) = self.document.next_outgoing() {
            self.publish_edit(outgoing).await;
        }
    }

    async fn handle_edit_topic(&mut self, notification: Notification) -> Flow {
        match notification.event {
            ChannelEvent::Edit { op, base } => match self.sync {
                SyncPhase::Synced => self.apply_remote_edit(op, base).await,
                SyncPhase::AwaitingEcho { .. } => {
                    debug!("Skipping operation {} sequenced before our sync request", op.id)
                }
                SyncPhase::AwaitingState {
                    ref mut buffered, ..
                } => buffered.push((op, base)),
            },
            ChannelEvent::SyncRequest {
                request_id,
                requester,
            } => self.on_sync_request(request_id, requester).await,
            ChannelEvent::SyncState {
                request_id,
                operations,
            } => return self.on_sync_state(request_id, operations).await,
            other => debug!("Ignoring {} on {}", other.event_type(), notification.topic),
        }
        Flow::Continue
    }

    async fn apply_remote_edit(&mut self, op: Operation, base: u64) {
        let outcome = self.document.apply_remote(op, base);
        if outcome.duplicate {
            return;
        }

        if let Some(applied) = &outcome.applied {
            self.conflicts.rebase(applied);
            if applied.origin != self.identity.user_id {
                self.emit(SessionEvent::RemoteEdit {
                    operation: applied.clone(),
                    content: self.document.content().to_string(),
                    version: self.document.version(),
                });
            }
        }
        if let Some(conflict) = outcome.conflict {
            self.on_edit_conflict(conflict).await;
        }
        self.flush_outgoing().await;
    }

    // ----- sync on join -----

    async fn on_sync_request(&mut self, request_id: String, requester: UserId) {
        if requester == self.identity.user_id {
            let ours = matches!(
                &self.sync,
                SyncPhase::AwaitingEcho { request_id: pending } if *pending == request_id
            );
            if ours {
                self.sync = SyncPhase::AwaitingState {
                    request_id,
                    buffered: Vec::new(),
                };
            }
            return;
        }
        if !self.is_synced() {
            return;
        }

        debug!(
            "Answering sync request {} from {} with {} operations",
            request_id,
            requester,
            self.document.sequenced().len()
        );
        let state = ChannelEvent::SyncState {
            request_id,
            operations: self.document.sequenced().to_vec(),
        };
        if let Err(e) = self.transport.publish(&self.topics.edits, state).await {
            warn!("Failed to answer sync request from {}: {}", requester, e);
        }
    }

    async fn on_sync_state(&mut self, request_id: String, operations: Vec<Operation>) -> Flow {
        let buffered = match &mut self.sync {
            SyncPhase::AwaitingState {
                request_id: pending,
                buffered,
            } if *pending == request_id => std::mem::take(buffered),
            // not ours, or already answered by another peer
            _ => return Flow::Continue,
        };

        match DocumentState::from_sequenced(self.identity.user_id.clone(), operations) {
            Ok(document) => {
                self.document = document;
                self.saved_ops = match self.store.load_operations(&self.session.id).await {
                    Ok(stored) => stored_prefix(&stored, self.document.sequenced()),
                    Err(e) => {
                        debug!("Failed to read stored log of {}: {}", self.session.id, e);
                        0
                    }
                };
                self.complete_sync(buffered).await;
                Flow::Continue
            }
            Err(e) => {
                warn!(
                    "Peer state for session {} does not replay ({}), loading from storage",
                    self.session.id, e
                );
                self.sync_from_store(buffered).await
            }
        }
    }

    async fn on_sync_timeout(&mut self) -> Flow {
        let buffered = match &mut self.sync {
            SyncPhase::AwaitingState { buffered, .. } => std::mem::take(buffered),
            _ => Vec::new(),
        };
        info!(
            "No peer answered for session {}, loading from storage",
            self.session.id
        );
        self.sync_from_store(buffered).await
    }

    async fn sync_from_store(&mut self, buffered: Vec<(Operation, u64)>) -> Flow {
        let operations = match self.store.load_operations(&self.session.id).await {
            Ok(operations) => operations,
            Err(e) => {
                error!("Failed to load operations for {}: {}", self.session.id, e);
                self.fail_sync(e.into());
                return Flow::Stop(Shutdown::SyncFailed);
            }
        };

        match self.store.load_snapshot(&self.session.id).await {
            Ok(Some(snapshot)) => {
                check_snapshot(&snapshot, &operations);
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to load snapshot for {}: {}", self.session.id, e),
        }

        let count = operations.len();
        match DocumentState::from_sequenced(self.identity.user_id.clone(), operations) {
            Ok(document) => {
                self.document = document;
                self.saved_ops = count;
                self.complete_sync(buffered).await;
                Flow::Continue
            }
            Err(e) => {
                error!("Stored log for {} does not replay: {}", self.session.id, e);
                self.fail_sync(CollabError::Storage(format!(
                    "stored log for {} does not replay: {}",
                    self.session.id, e
                )));
                Flow::Stop(Shutdown::SyncFailed)
            }
        }
    }

    async fn complete_sync(&mut self, buffered: Vec<(Operation, u64)>) {
        self.sync = SyncPhase::Synced;
        info!(
            "Synced session {} at version {} ({} sequenced)",
            self.session.id,
            self.document.version(),
            self.document.sequenced().len()
        );
        self.emit(SessionEvent::DocumentSynced {
            content: self.document.content().to_string(),
            version: self.document.version(),
        });

        for (op, base) in buffered {
            self.apply_remote_edit(op, base).await;
        }
        if let Some(waiter) = self.sync_waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    fn fail_sync(&mut self, err: CollabError) {
        if let Some(waiter) = self.sync_waiter.take() {
            let _ = waiter.send(Err(err));
        }
    }

    // ----- conflicts -----

    async fn on_edit_conflict(&mut self, edit: EditConflict) {
        let Detection {
            conflict,
            auto_resolution,
        } = self.conflicts.detect(&edit);
        warn!(
            "Conflict {} in session {}: {} overlapped {}",
            conflict.id, self.session.id, conflict.remote_author, conflict.local_author
        );

        self.persist_conflict(&conflict).await;
        self.emit(SessionEvent::ConflictDetected(conflict.clone()));

        if let Some(resolution) = auto_resolution {
            if let Err(e) = self.apply_resolution(&conflict.id, resolution).await {
                warn!("Automatic resolution of {} failed: {}", conflict.id, e);
            }
        }
    }

    /// Settle a conflict and write the chosen text into its region
    async fn apply_resolution(
        &mut self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> CollabResult<Conflict> {
        let resolved = self
            .conflicts
            .resolve(conflict_id, resolution, &self.identity.user_id)?;
        let content = resolved.resolved_content.clone().unwrap_or_default();

        let len = self.document.len();
        let position = resolved.position.min(len);
        let length = resolved.length.min(len - position);
        let in_place = slice_chars(self.document.content(), position, length)
            .map(|current| current == content)
            .unwrap_or(false);

        if !in_place {
            let op = self
                .document
                .local_operation(position, Edit::from_parts(length, content));
            let outgoing = self.document.apply_local(op.clone())?;
            self.conflicts.rebase(&op);
            if let Some(outgoing) = outgoing {
                self.publish_edit(outgoing).await;
            }
        }

        info!(
            "Resolved conflict {} as {:?} in session {}",
            resolved.id, resolution, self.session.id
        );
        self.persist_conflict(&resolved).await;
        self.emit(SessionEvent::ConflictResolved(resolved.clone()));
        Ok(resolved)
    }

    async fn persist_conflict(&self, conflict: &Conflict) {
        if let Err(e) = self.store.save_conflict(conflict).await {
            error!("Failed to persist conflict {}: {}", conflict.id, e);
        }
    }

    // ----- comments -----

    async fn add_comment(
        &mut self,
        position: usize,
        length: usize,
        body: String,
    ) -> CollabResult<Comment> {
        if !self.session.can_comment(self.me()) {
            return Err(self.denied("comment"));
        }
        let comment = Comment::draft(
            &self.session.id,
            &self.identity.user_id,
            self.document.content(),
            self.document.version(),
            position,
            length,
            body,
        )?;
        self.share_comment(comment).await
    }

    async fn reply_to_comment(&mut self, parent_id: &str, body: String) -> CollabResult<Comment> {
        if !self.session.can_comment(self.me()) {
            return Err(self.denied("comment"));
        }
        let reply = self.comments.draft_reply(
            parent_id,
            &self.identity.user_id,
            self.document.version(),
            body,
        )?;
        self.share_comment(reply).await
    }

    async fn share_comment(&mut self, comment: Comment) -> CollabResult<Comment> {
        self.store.save_comment(&comment).await?;
        self.comments.insert(comment.clone());

        let event = ChannelEvent::CommentAdded(comment.clone());
        if let Err(e) = self.transport.publish(&self.topics.events, event).await {
            warn!("Failed to broadcast comment {}: {}", comment.id, e);
        }
        self.emit(SessionEvent::CommentAdded(comment.clone()));
        Ok(comment)
    }

    async fn resolve_comment(&mut self, comment_id: &str) -> CollabResult<Comment> {
        if !self.session.can_resolve_comments(self.me()) {
            return Err(self.denied("resolve comments"));
        }
        let (comment, changed) =
            self.comments
                .resolve(comment_id, &self.identity.user_id, crate::now_ms())?;
        if !changed {
            return Ok(comment);
        }

        self.store.save_comment(&comment).await?;
        let event = ChannelEvent::CommentResolved {
            comment_id: comment.id.clone(),
            resolved_by: self.identity.user_id.clone(),
            at: comment.resolved_at.unwrap_or_else(crate::now_ms),
        };
        if let Err(e) = self.transport.publish(&self.topics.events, event).await {
            warn!("Failed to broadcast resolution of {}: {}", comment.id, e);
        }
        self.emit(SessionEvent::CommentResolved(comment.clone()));
        Ok(comment)
    }

    // ----- presence -----

    /// Publish and store a local presence record; failures are only logged
    async fn share_presence(&self, record: PresenceRecord) {
        let event = ChannelEvent::Presence(record.clone());
        if let Err(e) = self.transport.publish(&self.topics.presence, event).await {
            debug!("Failed to publish presence of {}: {}", record.user_id, e);
        }
        if let Err(e) = self.store.save_presence(&record).await {
            debug!("Failed to store presence of {}: {}", record.user_id, e);
        }
    }

    fn handle_presence_topic(&mut self, notification: Notification) {
        let now = crate::now_ms();
        match notification.event {
            ChannelEvent::Presence(record) => {
                if record.session_id != self.session.id {
                    return;
                }
                let previous = self.presence.get(&record.user_id).cloned();
                let Some(current) = self.presence.observe(record, now) else {
                    return;
                };

                let moved = match &previous {
                    Some(p) => p.cursor != current.cursor || p.selection != current.selection,
                    None => current.cursor.is_some(),
                };
                let restated = match &previous {
                    Some(p) => {
                        p.status != current.status
                            || p.display_name != current.display_name
                            || p.metadata != current.metadata
                    }
                    None => true,
                };
                if moved {
                    self.emit(SessionEvent::RemoteCursor(current.clone()));
                }
                if restated {
                    self.emit(SessionEvent::PresenceChanged(current));
                }
            }
            ChannelEvent::PresenceLeft { user_id } => {
                if let Some(mut record) = self.presence.remove(&user_id) {
                    record.status = PresenceStatus::Offline;
                    self.emit(SessionEvent::PresenceChanged(record));
                }
            }
            ChannelEvent::Heartbeat { user_id, .. } => self.presence.touch_seen(&user_id, now),
            other => debug!("Ignoring {} on {}", other.event_type(), notification.topic),
        }
    }

    async fn presence_tick(&mut self) {
        let now = crate::now_ms();
        for record in self.presence.refresh_statuses(now) {
            if record.user_id != self.identity.user_id {
                self.emit(SessionEvent::PresenceChanged(record));
            }
        }

        let local = self.presence.heartbeat_local(now);
        self.share_presence(local).await;

        for user_id in self.presence.expire_stale(now, self.config.liveness_timeout) {
            info!(
                "Dropping presence of {} in session {} after liveness timeout",
                user_id, self.session.id
            );
        }

        self.flush_outgoing().await;
    }

    async fn liveness_tick(&mut self) -> Flow {
        let now = crate::now_ms();
        let heartbeat = ChannelEvent::Heartbeat {
            user_id: self.identity.user_id.clone(),
            at: now,
        };
        if let Err(e) = self.transport.publish(&self.topics.presence, heartbeat).await {
            debug!("Failed to publish heartbeat: {}", e);
        }

        if self.session.is_expired(now) && self.session.is_owner(self.me()) {
            info!("Session {} expired", self.session.id);
            return self.end_session(None, None).await;
        }
        Flow::Continue
    }

    fn participant(&self, user_id: &str, fallback_name: Option<&str>) -> Participant {
        let record = self.presence.get(user_id);
        let display_name = record
            .map(|r| r.display_name.clone())
            .or_else(|| fallback_name.map(str::to_string))
            .unwrap_or_else(|| user_id.to_string());
        Participant {
            user_id: user_id.to_string(),
            display_name,
            color: record.map(|r| r.color.clone()),
            status: self.presence.status_of(user_id),
            cursor: record.and_then(|r| r.cursor),
            selection: record.and_then(|r| r.selection),
            is_owner: self.session.is_owner(user_id),
            last_seen_at: record.map(|r| r.last_seen_at),
        }
    }

    fn participants(&self) -> Vec<Participant> {
        self.session
            .participants
            .iter()
            .map(|user_id| self.participant(user_id, None))
            .collect()
    }

    // ----- session events -----

    async fn handle_event_topic(&mut self, notification: Notification) -> Flow {
        match notification.event {
            ChannelEvent::ParticipantJoined {
                user_id,
                display_name,
            } => {
                if user_id == self.identity.user_id {
                    return Flow::Continue;
                }
                if !self.session.is_participant(&user_id) {
                    self.session.participants.push(user_id.clone());
                }
                info!("{} joined session {}", user_id, self.session.id);
                self.emit(SessionEvent::ParticipantJoined(
                    self.participant(&user_id, Some(&display_name)),
                ));

                // let the newcomer see us
                let local = self.presence.heartbeat_local(crate::now_ms());
                self.share_presence(local).await;
            }
            ChannelEvent::ParticipantLeft { user_id } => {
                if user_id == self.identity.user_id {
                    return Flow::Continue;
                }
                self.session.remove_participant(&user_id);
                self.presence.remove(&user_id);
                info!("{} left session {}", user_id, self.session.id);
                self.emit(SessionEvent::ParticipantLeft { user_id });
            }
            ChannelEvent::CommentAdded(comment) => {
                if comment.session_id == self.session.id && self.comments.insert(comment.clone()) {
                    self.emit(SessionEvent::CommentAdded(comment));
                }
            }
            ChannelEvent::CommentResolved {
                comment_id,
                resolved_by,
                at,
            } => match self.comments.resolve(&comment_id, &resolved_by, at) {
                Ok((comment, true)) => self.emit(SessionEvent::CommentResolved(comment)),
                Ok(_) => {}
                Err(e) => debug!("Resolution for unknown comment: {}", e),
            },
            ChannelEvent::PermissionsUpdated(permissions) => {
                info!(
                    "Permissions of session {} updated: {:?}",
                    self.session.id, permissions
                );
                self.session.permissions = permissions;
            }
            ChannelEvent::SessionEnded { ended_by } => {
                return Flow::Stop(Shutdown::Ended {
                    ended_by,
                    reply: None,
                })
            }
            other => debug!("Ignoring {} on {}", other.event_type(), notification.topic),
        }
        Flow::Continue
    }

    async fn update_permissions(
        &mut self,
        permissions: SessionPermissions,
    ) -> CollabResult<Session> {
        if !self.session.is_owner(self.me()) {
            return Err(self.denied("change permissions"));
        }
        let mut session = self.session.clone();
        session.permissions = permissions;
        self.store.save_session(&session).await?;
        self.session = session;

        let event = ChannelEvent::PermissionsUpdated(permissions);
        if let Err(e) = self.transport.publish(&self.topics.events, event).await {
            warn!("Failed to broadcast permissions of {}: {}", self.session.id, e);
        }
        Ok(self.session.clone())
    }

    async fn end_session(&mut self, ended_by: Option<UserId>, reply: Option<Reply<()>>) -> Flow {
        let mut session = self.session.clone();
        session.status = SessionStatus::Ended;
        let reply = match (self.store.save_session(&session).await, reply) {
            (Ok(()), reply) => reply,
            (Err(e), Some(reply)) => {
                let _ = reply.send(Err(e.into()));
                return Flow::Continue;
            }
            (Err(e), None) => {
                warn!("Failed to store end of session {}: {}", session.id, e);
                None
            }
        };
        self.session = session;

        let event = ChannelEvent::SessionEnded {
            ended_by: ended_by.clone(),
        };
        if let Err(e) = self.transport.publish(&self.topics.events, event).await {
            warn!("Failed to broadcast end of session {}: {}", self.session.id, e);
        }
        Flow::Stop(Shutdown::Ended { ended_by, reply })
    }

    // ----- persistence -----

    /// Store newly sequenced operations and a snapshot when content exists
    async fn autosave(&mut self) {
        let total = self.document.sequenced().len();
        if self.saved_ops < total {
            let start = self.saved_ops;
            let result = self
                .store
                .append_operations(
                    &self.session.id,
                    start as u64,
                    &self.document.sequenced()[start..],
                )
                .await;
            if let Err(e) = result {
                warn!("Autosave of session {} failed: {}", self.session.id, e);
                return;
            }
            self.saved_ops = total;
        }

        let confirmed = self.document.confirmed_content();
        if confirmed.is_empty() || self.snapshot_seq == Some(total) {
            return;
        }
        let snapshot = DocumentSnapshot::new(
            self.session.id.clone(),
            confirmed,
            total as u64,
            self.document.version(),
            self.identity.user_id.clone(),
        );
        match self.store.save_snapshot(&snapshot).await {
            Ok(()) => {
                debug!("Saved snapshot of {} at {}", self.session.id, total);
                self.snapshot_seq = Some(total);
            }
            Err(e) => warn!("Snapshot of session {} failed: {}", self.session.id, e),
        }
    }

    // ----- shutdown -----

    async fn remove_self(&mut self) -> CollabResult<()> {
        let mut session = self
            .store
            .load_session(&self.session.id)
            .await?
            .unwrap_or_else(|| self.session.clone());
        session.remove_participant(&self.identity.user_id);
        self.store.save_session(&session).await?;
        self.session = session;
        Ok(())
    }

    async fn announce_departure(&self) {
        let user_id = self.identity.user_id.clone();
        let left = ChannelEvent::PresenceLeft {
            user_id: user_id.clone(),
        };
        if let Err(e) = self.transport.publish(&self.topics.presence, left).await {
            debug!("Failed to publish presence departure: {}", e);
        }
        let left = ChannelEvent::ParticipantLeft { user_id };
        if let Err(e) = self.transport.publish(&self.topics.events, left).await {
            warn!("Failed to announce departure from {}: {}", self.session.id, e);
        }
    }

    async fn teardown(&mut self, mut subs: Subscriptions) {
        // fold in echoes that already arrived so the final save has them
        if self.is_synced() {
            while let Some(notification) = subs.edits.try_recv() {
                if let ChannelEvent::Edit { op, base } = notification.event {
                    self.apply_remote_edit(op, base).await;
                }
            }
        }
        self.autosave().await;
        if self.document.pending_len() > 0 {
            warn!(
                "Dropping {} unsent operation(s) of {} in session {}",
                self.document.pending_len(),
                self.identity.user_id,
                self.session.id
            );
        }
        let unresolved = self.conflicts.pending();
        if !unresolved.is_empty() {
            info!(
                "Leaving {} unresolved conflict(s) in session {}",
                unresolved.len(),
                self.session.id
            );
        }

        if let Err(e) = self
            .store
            .delete_presence(&self.session.id, &self.identity.user_id)
            .await
        {
            debug!("Failed to delete presence row: {}", e);
        }
        for subscription in [subs.edits, subs.presence, subs.events] {
            let topic = subscription.topic.clone();
            if let Err(e) = self.transport.unsubscribe(subscription).await {
                debug!("Failed to unsubscribe from {}: {}", topic, e);
            }
        }
    }

    async fn shutdown(
        mut self,
        reason: Shutdown,
        mut commands: mpsc::Receiver<Command>,
        subs: Subscriptions,
    ) {
        commands.close();

        match reason {
            Shutdown::Leave(reply) => {
                let result = self.remove_self().await;
                if let Err(e) = &result {
                    warn!("Failed to update participants of {}: {}", self.session.id, e);
                }
                self.announce_departure().await;
                self.teardown(subs).await;
                info!("{} left session {}", self.identity.user_id, self.session.id);
                self.emit(SessionEvent::SessionLeft {
                    session_id: self.session.id.clone(),
                });
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Shutdown::Ended { ended_by, reply } => {
                self.teardown(subs).await;
                info!("Session {} ended", self.session.id);
                self.emit(SessionEvent::SessionEnded {
                    session_id: self.session.id.clone(),
                    ended_by,
                });
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Shutdown::SyncFailed => {
                if let Err(e) = self.remove_self().await {
                    debug!("Failed to update participants after sync failure: {}", e);
                }
                self.announce_departure().await;
                self.teardown(subs).await;
            }
        }

        // dropped replies surface as NotJoined
        let mut rejected = 0;
        while let Ok(command) = commands.try_recv() {
            debug!("Rejecting {} queued behind shutdown", command.name());
            rejected += 1;
        }
        if rejected > 0 {
            warn!(
                "Rejected {} command(s) queued behind shutdown of session {}",
                rejected, self.session.id
            );
        }
    }
}

/// Compare a stored snapshot with the log it claims to cover
fn check_snapshot(snapshot: &DocumentSnapshot, operations: &[Operation]) -> bool {
    if !snapshot.verify() {
        warn!("Snapshot of {} fails its checksum", snapshot.session_id);
        return false;
    }
    let seq = snapshot.seq as usize;
    if seq > operations.len() {
        warn!(
            "Snapshot of {} covers {} operations but only {} are stored",
            snapshot.session_id,
            seq,
            operations.len()
        );
        return false;
    }
    match replay(&operations[..seq]) {
        Ok(content) if content == snapshot.content => true,
        Ok(_) => {
            warn!(
                "Snapshot of {} disagrees with its operation log",
                snapshot.session_id
            );
            false
        }
        Err(e) => {
            warn!("Operation log of {} does not replay: {}", snapshot.session_id, e);
            false
        }
    }
}

/// Length of the stored log that matches the synced one
fn stored_prefix(stored: &[Operation], synced: &[Operation]) -> usize {
    stored
        .iter()
        .zip(synced)
        .take_while(|(stored, synced)| stored.id == synced.id)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::storage::MemoryRowStore;
    use crate::transport::{MemoryTransport, TopicHub};

    #[test]
    fn test_check_snapshot() {
        let ops = vec![
            Operation::insert("alice", 1, 0, "hello"),
            Operation::insert("alice", 2, 5, "!"),
        ];
        assert!(check_snapshot(&DocumentSnapshot::new("s", "hello", 1, 2, "alice"), &ops));
        assert!(check_snapshot(&DocumentSnapshot::new("s", "hello!", 2, 3, "alice"), &ops));
        assert!(!check_snapshot(&DocumentSnapshot::new("s", "hello", 2, 3, "alice"), &ops));
        assert!(!check_snapshot(&DocumentSnapshot::new("s", "hello!", 5, 3, "alice"), &ops));

        let mut tampered = DocumentSnapshot::new("s", "hello", 1, 2, "alice");
        tampered.content = "jello".to_string();
        assert!(!check_snapshot(&tampered, &ops));
    }

    #[test]
    fn test_stored_prefix() {
        let ops = vec![
            Operation::insert("alice", 1, 0, "hello"),
            Operation::insert("alice", 2, 5, "!"),
            Operation::delete("bob", 3, 0, 1),
        ];
        assert_eq!(stored_prefix(&ops[..2], &ops), 2);
        assert_eq!(stored_prefix(&ops, &ops), 3);
        assert_eq!(stored_prefix(&[], &ops), 0);
        // a peer that is behind storage covers only its own length
        assert_eq!(stored_prefix(&ops, &ops[..1]), 1);

        let diverged = vec![ops[0].clone(), Operation::insert("carol", 2, 0, ">")];
        assert_eq!(stored_prefix(&diverged, &ops), 1);
    }

    #[test]
    fn test_command_names() {
        let (reply, _rx) = oneshot::channel();
        assert_eq!(Command::Leave { reply }.name(), "leave");
        let command = Command::UpdateCursor {
            position: 0,
            selection: None,
        };
        assert_eq!(command.name(), "update_cursor");
    }

    #[tokio::test]
    async fn test_create_mode_starts_synced() {
        let hub = Arc::new(TopicHub::new());
        let transport = Arc::new(MemoryTransport::connect(hub.clone()));
        let store = SessionStore::new(Arc::new(MemoryRowStore::new()));
        let identity = Identity::new("alice", "Alice");
        let session = Session::new(SessionConfig::new("Doc"), &identity);
        let (events, _) = broadcast::channel(16);

        let handle = start(
            ActorParts {
                session: session.clone(),
                identity,
                config: CollabConfig::default(),
                transport,
                store,
                events,
                merge: None,
            },
            JoinMode::Create,
        )
        .await
        .unwrap();

        assert_eq!(handle.session_id(), session.id);
        let view = handle.document().await.unwrap();
        assert_eq!(view.content, "");
        assert_eq!(view.version, 1);
        assert_eq!(hub.subscriber_count(&SessionTopics::new(&session.id).edits), 1);

        handle.leave().await.unwrap();
        assert_eq!(hub.subscriber_count(&SessionTopics::new(&session.id).edits), 0);
    }
}

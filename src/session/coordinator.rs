//! Caller-facing session coordinator.
//!
//! One `CollabService` per local user. It holds at most one joined session at a
//! time and routes calls to that session's actor.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use super::actor::{self, ActorParts, JoinMode};
use super::{Identity, Participant, Session, SessionConfig, SessionHandle, SessionPermissions};
use crate::comments::Comment;
use crate::config::CollabConfig;
use crate::conflict::{Conflict, MergeStrategy, Resolution};
use crate::document::DocumentView;
use crate::error::{CollabError, CollabResult};
use crate::events::SessionEvent;
use crate::presence::{PresenceStatus, Selection};
use crate::storage::{RowStore, SessionStore};
use crate::transport::ChannelTransport;

pub struct CollabService {
    transport: Arc<dyn ChannelTransport>,
    store: SessionStore,
    identity: Option<Identity>,
    config: CollabConfig,
    events: broadcast::Sender<SessionEvent>,
    merge: Option<Arc<dyn MergeStrategy>>,
    active: Mutex<Option<SessionHandle>>,
}

impl CollabService {
    /// `identity` is `None` for anonymous callers
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        rows: Arc<dyn RowStore>,
        identity: Option<Identity>,
        config: CollabConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            transport,
            store: SessionStore::new(rows),
            identity,
            config,
            events,
            merge: None,
            active: Mutex::new(None),
        }
    }

    /// Merge used for `auto_merge` and `Resolution::Merged` in every session
    /// joined through this service
    pub fn with_merge_strategy(mut self, merge: Arc<dyn MergeStrategy>) -> Self {
        self.merge = Some(merge);
        self
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Receive every event of the sessions this service joins
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Handle of the joined session, if its actor is still running
    pub fn active_session(&self) -> Option<SessionHandle> {
        self.handle().ok()
    }

    fn handle(&self) -> CollabResult<SessionHandle> {
        let mut active = self.active.lock();
        if active.as_ref().map(|h| h.is_closed()).unwrap_or(false) {
            *active = None;
        }
        active.clone().ok_or(CollabError::NotJoined)
    }

    fn parts(&self, session: Session, identity: Identity) -> ActorParts {
        ActorParts {
            session,
            identity,
            config: self.config.clone(),
            transport: self.transport.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            merge: self.merge.clone(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Create a session owned by the caller and join it
    pub async fn create_session(&self, config: SessionConfig) -> CollabResult<Session> {
        let identity = self.identity.clone().ok_or(CollabError::Unauthenticated)?;
        self.leave_session().await?;

        let session = Session::new(config, &identity);
        self.store.save_session(&session).await?;
        info!("Created session {} ({})", session.name, session.id);
        self.emit(SessionEvent::SessionCreated(session.clone()));

        let parts = self.parts(session.clone(), identity.clone());
        let handle = actor::start(parts, JoinMode::Create).await?;
        *self.active.lock() = Some(handle);
        self.emit(SessionEvent::SessionJoined {
            session: session.clone(),
            user_id: identity.user_id,
        });
        Ok(session)
    }

    /// Join an existing session; returns once the document is synced
    pub async fn join_session(&self, session_id: &str) -> CollabResult<Session> {
        let mut session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CollabError::session_not_found(session_id))?;
        if !session.is_joinable(crate::now_ms()) {
            return Err(CollabError::SessionEnded(session.id));
        }

        let identity = match &self.identity {
            Some(identity) => identity.clone(),
            None if session.allow_anonymous => Identity::guest(),
            None => return Err(CollabError::Unauthenticated),
        };
        if !session.can_join(&identity.user_id) {
            return Err(CollabError::PermissionDenied(format!(
                "{} may not join session {}",
                identity.user_id, session.id
            )));
        }

        if let Some(active) = self.active_session() {
            if active.session_id() == session.id {
                return active.session().await;
            }
        }
        self.leave_session().await?;

        if session.add_participant(&identity.user_id)? {
            self.store.save_session(&session).await?;
        }

        let parts = self.parts(session.clone(), identity.clone());
        let handle = actor::start(parts, JoinMode::Join).await?;
        let session = handle.session().await?;
        *self.active.lock() = Some(handle);
        info!("{} joined session {}", identity.user_id, session.id);
        self.emit(SessionEvent::SessionJoined {
            session: session.clone(),
            user_id: identity.user_id,
        });
        Ok(session)
    }

    /// Leave the joined session; a no-op when there is none
    pub async fn leave_session(&self) -> CollabResult<()> {
        let handle = self.active.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        match handle.leave().await {
            // already stopped
            Err(CollabError::NotJoined) => Ok(()),
            other => other,
        }
    }

    pub async fn insert_text(
        &self,
        position: usize,
        content: impl Into<String>,
    ) -> CollabResult<DocumentView> {
        self.handle()?.insert_text(position, content).await
    }

    pub async fn delete_text(&self, position: usize, length: usize) -> CollabResult<DocumentView> {
        self.handle()?.delete_text(position, length).await
    }

    pub async fn replace_text(
        &self,
        position: usize,
        length: usize,
        content: impl Into<String>,
    ) -> CollabResult<DocumentView> {
        self.handle()?.replace_text(position, length, content).await
    }

    /// Only `NotJoined` is reported; delivery failures are logged by the actor
    pub async fn update_cursor(
        &self,
        position: usize,
        selection: Option<Selection>,
    ) -> CollabResult<()> {
        self.handle()?.update_cursor(position, selection).await;
        Ok(())
    }

    pub async fn update_presence(
        &self,
        status: PresenceStatus,
        metadata: Option<BTreeMap<String, String>>,
    ) -> CollabResult<()> {
        self.handle()?.update_presence(status, metadata).await;
        Ok(())
    }

    pub async fn add_comment(
        &self,
        position: usize,
        length: usize,
        body: impl Into<String>,
    ) -> CollabResult<Comment> {
        self.handle()?.add_comment(position, length, body).await
    }

    pub async fn reply_to_comment(
        &self,
        parent_id: &str,
        body: impl Into<String>,
    ) -> CollabResult<Comment> {
        self.handle()?.reply_to_comment(parent_id, body).await
    }

    pub async fn resolve_comment(&self, comment_id: &str) -> CollabResult<Comment> {
        self.handle()?.resolve_comment(comment_id).await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> CollabResult<Conflict> {
        self.handle()?.resolve_conflict(conflict_id, resolution).await
    }

    pub async fn get_participants(&self) -> CollabResult<Vec<Participant>> {
        self.handle()?.get_participants().await
    }

    pub async fn get_comments(&self) -> CollabResult<Vec<Comment>> {
        self.handle()?.get_comments().await
    }

    pub async fn get_conflicts(&self) -> CollabResult<Vec<Conflict>> {
        self.handle()?.get_conflicts().await
    }

    pub async fn document(&self) -> CollabResult<DocumentView> {
        self.handle()?.document().await
    }

    pub async fn current_session(&self) -> CollabResult<Session> {
        self.handle()?.session().await
    }

    pub async fn update_permissions(
        &self,
        permissions: SessionPermissions,
    ) -> CollabResult<Session> {
        self.handle()?.update_permissions(permissions).await
    }

    pub async fn end_session(&self) -> CollabResult<()> {
        let handle = self.handle()?;
        handle.end_session().await?;
        let mut active = self.active.lock();
        let same = active.as_ref().map(|h| h.session_id() == handle.session_id());
        if same.unwrap_or(false) {
            *active = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictStrategy;
    use crate::storage::MemoryRowStore;
    use crate::transport::{MemoryTransport, TopicHub};
    use std::future::Future;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn test_config() -> CollabConfig {
        CollabConfig::new()
            .with_autosave_interval(Duration::from_millis(30))
            .with_presence_interval(Duration::from_millis(40))
            .with_liveness(Duration::from_millis(100), Duration::from_secs(5))
            .with_sync_timeout(Duration::from_millis(100))
    }

    struct Harness {
        hub: Arc<TopicHub>,
        rows: Arc<MemoryRowStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                hub: Arc::new(TopicHub::new()),
                rows: Arc::new(MemoryRowStore::new()),
            }
        }

        fn connect(&self, user: &str) -> (CollabService, Arc<MemoryTransport>) {
            let transport = Arc::new(MemoryTransport::with_client_id(self.hub.clone(), user));
            let service = CollabService::new(
                transport.clone(),
                self.rows.clone(),
                Some(Identity::new(user, user.to_uppercase())),
                test_config(),
            );
            (service, transport)
        }

        fn service(&self, user: &str) -> CollabService {
            self.connect(user).0
        }

        fn anonymous(&self) -> CollabService {
            let transport = Arc::new(MemoryTransport::connect(self.hub.clone()));
            CollabService::new(transport, self.rows.clone(), None, test_config())
        }
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_for_content(service: &CollabService, expected: &str) {
        wait_until(|| async move {
            service
                .document()
                .await
                .map(|view| view.content == expected && view.pending == 0)
                .unwrap_or(false)
        })
        .await;
    }

    async fn next_event(
        events: &mut broadcast::Receiver<SessionEvent>,
        event_type: &str,
    ) -> SessionEvent {
        let found = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(event) if event.event_type() == event_type => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await;
        found.unwrap_or_else(|_| panic!("no {} event", event_type))
    }

    #[tokio::test]
    async fn test_create_session_and_edit() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let mut events = alice.subscribe();

        let session = assert_ok!(alice.create_session(SessionConfig::new("Notes")).await);
        assert_eq!(session.owner_id, "alice");
        assert_eq!(events.recv().await.unwrap().event_type(), "session_created");
        assert_eq!(events.recv().await.unwrap().event_type(), "session_joined");

        let start = alice.document().await.unwrap().version;
        let view = alice.insert_text(0, "Hello").await.unwrap();
        assert_eq!(view.content, "Hello");
        assert_eq!(view.version, start + 1);

        let view = alice.insert_text(5, " World").await.unwrap();
        assert_eq!(view.content, "Hello World");
        assert_eq!(view.version, start + 2);

        let view = alice.replace_text(0, 5, "Howdy").await.unwrap();
        assert_eq!(view.content, "Howdy World");
        let view = alice.delete_text(5, 6).await.unwrap();
        assert_eq!(view.content, "Howdy");
    }

    #[tokio::test]
    async fn test_invalid_edits() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        alice.create_session(SessionConfig::new("Notes")).await.unwrap();
        alice.insert_text(0, "abc").await.unwrap();

        assert!(matches!(
            alice.insert_text(0, "").await,
            Err(CollabError::InvalidRange(_))
        ));
        assert!(matches!(
            alice.delete_text(2, 5).await,
            Err(CollabError::InvalidRange(_))
        ));
        assert!(matches!(
            alice.insert_text(10, "x").await,
            Err(CollabError::InvalidRange(_))
        ));
        assert_eq!(alice.document().await.unwrap().content, "abc");
    }

    #[tokio::test]
    async fn test_two_participants_converge() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let bob = harness.service("bob");
        let mut bob_events = bob.subscribe();

        let session = alice
            .create_session(SessionConfig::new("Pair").public(true))
            .await
            .unwrap();
        let joined = bob.join_session(&session.id).await.unwrap();
        assert!(joined.is_participant("bob"));

        alice.insert_text(0, "Hello").await.unwrap();
        wait_for_content(&bob, "Hello").await;
        match next_event(&mut bob_events, "remote_edit").await {
            SessionEvent::RemoteEdit { operation, .. } => assert_eq!(operation.origin, "alice"),
            other => panic!("unexpected {:?}", other),
        }

        // concurrent, non-overlapping
        let (a, b) = tokio::join!(alice.insert_text(5, "!"), bob.insert_text(0, ">"));
        a.unwrap();
        b.unwrap();

        wait_for_content(&alice, ">Hello!").await;
        wait_for_content(&bob, ">Hello!").await;
    }

    #[tokio::test]
    async fn test_join_syncs_from_peer() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let bob = harness.service("bob");

        let session = alice
            .create_session(SessionConfig::new("Shared").public(true))
            .await
            .unwrap();
        alice.insert_text(0, "shared text").await.unwrap();

        let mut events = bob.subscribe();
        bob.join_session(&session.id).await.unwrap();
        assert_eq!(bob.document().await.unwrap().content, "shared text");
        match next_event(&mut events, "document_synced").await {
            SessionEvent::DocumentSynced { content, .. } => assert_eq!(content, "shared text"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_falls_back_to_storage() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let bob = harness.service("bob");

        let session = alice
            .create_session(SessionConfig::new("Persisted").public(true))
            .await
            .unwrap();
        alice.insert_text(0, "persisted").await.unwrap();
        alice.leave_session().await.unwrap();

        // nobody is online to answer
        bob.join_session(&session.id).await.unwrap();
        assert_eq!(bob.document().await.unwrap().content, "persisted");

        bob.insert_text(9, "!").await.unwrap();
        assert_eq!(bob.document().await.unwrap().content, "persisted!");
    }

    #[tokio::test]
    async fn test_leaving_participant_disappears() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let bob = harness.service("bob");

        let session = alice
            .create_session(SessionConfig::new("Team").public(true))
            .await
            .unwrap();
        bob.join_session(&session.id).await.unwrap();

        let alice_ref = &alice;
        wait_until(|| async move {
            alice_ref
                .get_participants()
                .await
                .map(|p| p.iter().any(|p| p.user_id == "bob"))
                .unwrap_or(false)
        })
        .await;

        bob.leave_session().await.unwrap();
        assert!(bob.active_session().is_none());

        wait_until(|| async move {
            alice_ref
                .get_participants()
                .await
                .map(|p| p.iter().all(|p| p.user_id != "bob"))
                .unwrap_or(false)
        })
        .await;

        let stored = alice.store().load_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.participants, vec!["alice".to_string()]);
        let presence = alice.store().load_presence(&session.id).await.unwrap();
        assert!(presence.iter().all(|r| r.user_id != "bob"));
    }

    #[tokio::test]
    async fn test_remote_cursor_is_visible() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let bob = harness.service("bob");

        let session = alice
            .create_session(SessionConfig::new("Cursors").public(true))
            .await
            .unwrap();
        alice.insert_text(0, "some text").await.unwrap();
        bob.join_session(&session.id).await.unwrap();

        bob.update_cursor(3, Some(crate::presence::Selection::new(3, 7)))
            .await
            .unwrap();

        let alice_ref = &alice;
        wait_until(|| async move {
            alice_ref
                .get_participants()
                .await
                .map(|p| {
                    p.iter().any(|p| {
                        p.user_id == "bob"
                            && p.cursor == Some(3)
                            && p.status == PresenceStatus::Active
                    })
                })
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn test_comment_anchor_does_not_move() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        alice.create_session(SessionConfig::new("Review")).await.unwrap();
        alice.insert_text(0, "hello world").await.unwrap();

        let comment = alice.add_comment(5, 0, "comma here?").await.unwrap();
        assert_eq!(comment.anchor.position, 5);

        alice.insert_text(0, "Hey ").await.unwrap();
        let comments = alice.get_comments().await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].anchor.position, 5);

        assert!(matches!(
            alice.add_comment(100, 0, "past the end").await,
            Err(CollabError::InvalidAnchor(_))
        ));
    }

    #[tokio::test]
    async fn test_comment_threads_and_resolution() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let bob = harness.service("bob");

        let session = alice
            .create_session(SessionConfig::new("Review").public(true))
            .await
            .unwrap();
        alice.insert_text(0, "draft text").await.unwrap();
        let comment = alice.add_comment(0, 5, "reword").await.unwrap();

        // loaded from storage on join
        bob.join_session(&session.id).await.unwrap();
        let comments = bob.get_comments().await.unwrap();
        assert_eq!(comments.len(), 1);

        let reply = bob.reply_to_comment(&comment.id, "agreed").await.unwrap();
        assert_eq!(reply.parent_id.as_deref(), Some(comment.id.as_str()));
        assert_eq!(reply.anchor, comment.anchor);
        assert!(matches!(
            bob.reply_to_comment(&reply.id, "nested").await,
            Err(CollabError::InvalidHierarchy(_))
        ));
        assert!(matches!(
            bob.reply_to_comment("missing", "hello").await,
            Err(CollabError::NotFound { .. })
        ));

        let alice_ref = &alice;
        wait_until(|| async move {
            alice_ref.get_comments().await.map(|c| c.len() == 2).unwrap_or(false)
        })
        .await;

        let resolved = alice.resolve_comment(&comment.id).await.unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("alice"));

        // idempotent
        let again = alice.resolve_comment(&comment.id).await.unwrap();
        assert_eq!(again.resolved_at, resolved.resolved_at);

        let bob_ref = &bob;
        let comment_id = comment.id.clone();
        let comment_id = &comment_id;
        wait_until(|| async move {
            bob_ref
                .get_comments()
                .await
                .map(|c| c.iter().any(|c| &c.id == comment_id && c.resolved))
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn test_conflict_resolution_is_final() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let (bob, bob_transport) = harness.connect("bob");

        let session = alice
            .create_session(SessionConfig::new("Contested").public(true))
            .await
            .unwrap();
        alice.insert_text(0, "hello world").await.unwrap();
        bob.join_session(&session.id).await.unwrap();
        assert_eq!(bob.document().await.unwrap().content, "hello world");

        // bob's edit stays local while alice's goes out
        bob_transport.set_offline(true);
        bob.replace_text(0, 5, "HOWDY").await.unwrap();
        alice.replace_text(0, 5, "Hi").await.unwrap();

        let bob_ref = &bob;
        wait_until(|| async move {
            bob_ref.get_conflicts().await.map(|c| !c.is_empty()).unwrap_or(false)
        })
        .await;

        let conflicts = bob.get_conflicts().await.unwrap();
        let conflict = &conflicts[0];
        assert_eq!(conflict.local_content, "HOWDY");
        assert_eq!(conflict.remote_content, "Hi");
        assert_eq!(conflict.local_author, "bob");
        assert_eq!(bob.document().await.unwrap().content, "Hi world");

        let resolved = bob
            .resolve_conflict(&conflict.id, Resolution::Local)
            .await
            .unwrap();
        assert!(resolved.is_resolved());
        assert_eq!(bob.document().await.unwrap().content, "HOWDY world");

        assert_eq!(
            bob.resolve_conflict(&conflict.id, Resolution::Remote).await,
            Err(CollabError::AlreadyResolved(conflict.id.clone()))
        );
        assert!(matches!(
            bob.resolve_conflict("missing", Resolution::Local).await,
            Err(CollabError::NotFound { .. })
        ));

        let stored = bob.store().load_conflicts(&session.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_resolved());
    }

    async fn next_resolution(events: &mut broadcast::Receiver<SessionEvent>) -> Conflict {
        match next_event(events, "conflict_resolved").await {
            SessionEvent::ConflictResolved(conflict) => conflict,
            other => panic!("unexpected {:?}", other),
        }
    }

    async fn contested_session(
        alice: &CollabService,
        bob: &CollabService,
        strategy: ConflictStrategy,
    ) -> Session {
        let config = SessionConfig::new("Contested")
            .public(true)
            .with_conflict_strategy(strategy);
        let session = alice.create_session(config).await.unwrap();
        alice.insert_text(0, "hello world").await.unwrap();
        bob.join_session(&session.id).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_latest_wins_keeps_later_remote_edit() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let (bob, bob_transport) = harness.connect("bob");
        contested_session(&alice, &bob, ConflictStrategy::LatestWins).await;
        let mut bob_events = bob.subscribe();

        bob_transport.set_offline(true);
        bob.replace_text(0, 5, "HOWDY").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        alice.replace_text(0, 5, "Hi").await.unwrap();

        let resolved = next_resolution(&mut bob_events).await;
        assert_eq!(resolved.strategy, ConflictStrategy::LatestWins);
        assert_eq!(resolved.resolution, Some(Resolution::Remote));
        assert_eq!(resolved.resolved_content.as_deref(), Some("Hi"));
        assert_eq!(resolved.resolved_by.as_deref(), Some("bob"));

        bob_transport.set_offline(false);
        wait_for_content(&bob, "Hi world").await;
        wait_for_content(&alice, "Hi world").await;
    }

    #[tokio::test]
    async fn test_latest_wins_restores_later_local_edit() {
        let harness = Harness::new();
        let (alice, alice_transport) = harness.connect("alice");
        let (bob, bob_transport) = harness.connect("bob");
        contested_session(&alice, &bob, ConflictStrategy::LatestWins).await;
        let mut bob_events = bob.subscribe();

        // alice writes first but reaches the channel only after bob wrote too
        alice_transport.set_offline(true);
        alice.replace_text(0, 5, "Hi").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        bob_transport.set_offline(true);
        bob.replace_text(0, 5, "HOWDY").await.unwrap();
        alice_transport.set_offline(false);

        let resolved = next_resolution(&mut bob_events).await;
        assert_eq!(resolved.resolution, Some(Resolution::Local));
        assert_eq!(resolved.local_content, "HOWDY");
        assert_eq!(resolved.remote_content, "Hi");
        assert_eq!(bob.document().await.unwrap().content, "HOWDY world");

        bob_transport.set_offline(false);
        wait_for_content(&bob, "HOWDY world").await;
        wait_for_content(&alice, "HOWDY world").await;
    }

    #[tokio::test]
    async fn test_auto_merge_converges_on_merged_text() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let (bob, bob_transport) = harness.connect("bob");
        let session = contested_session(&alice, &bob, ConflictStrategy::AutoMerge).await;
        let mut bob_events = bob.subscribe();

        bob_transport.set_offline(true);
        bob.replace_text(0, 5, "HOWDY").await.unwrap();
        alice.replace_text(0, 5, "Hi").await.unwrap();

        let resolved = next_resolution(&mut bob_events).await;
        assert_eq!(resolved.resolution, Some(Resolution::Merged));
        assert_eq!(resolved.resolved_content.as_deref(), Some("HOWDY\nHi"));
        assert_eq!(bob.document().await.unwrap().content, "HOWDY\nHi world");

        bob_transport.set_offline(false);
        wait_for_content(&bob, "HOWDY\nHi world").await;
        wait_for_content(&alice, "HOWDY\nHi world").await;

        let stored = bob.store().load_conflicts(&session.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].resolution, Some(Resolution::Merged));
    }

    struct Bracketed;

    impl MergeStrategy for Bracketed {
        fn merge(&self, local: &str, remote: &str) -> String {
            format!("[{}|{}]", local, remote)
        }
    }

    #[tokio::test]
    async fn test_service_merge_strategy_reaches_session() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let (bob, bob_transport) = harness.connect("bob");
        let bob = bob.with_merge_strategy(Arc::new(Bracketed));
        contested_session(&alice, &bob, ConflictStrategy::AutoMerge).await;
        let mut bob_events = bob.subscribe();

        bob_transport.set_offline(true);
        bob.replace_text(0, 5, "HOWDY").await.unwrap();
        alice.replace_text(0, 5, "Hi").await.unwrap();

        let resolved = next_resolution(&mut bob_events).await;
        assert_eq!(resolved.merged_content, "[HOWDY|Hi]");

        bob_transport.set_offline(false);
        wait_for_content(&bob, "[HOWDY|Hi] world").await;
        wait_for_content(&alice, "[HOWDY|Hi] world").await;
    }

    #[tokio::test]
    async fn test_identical_deletes_with_remote_sequenced_first() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let (bob, bob_transport) = harness.connect("bob");

        let session = alice
            .create_session(SessionConfig::new("Deletes").public(true))
            .await
            .unwrap();
        alice.insert_text(0, "hello").await.unwrap();
        bob.join_session(&session.id).await.unwrap();

        // bob's delete is still pending when alice's reaches him
        bob_transport.set_offline(true);
        let view = bob.delete_text(0, 1).await.unwrap();
        assert_eq!((view.content.as_str(), view.pending), ("ello", 1));
        alice.delete_text(0, 1).await.unwrap();

        wait_for_content(&bob, "ello").await;
        assert!(bob.get_conflicts().await.unwrap().is_empty());

        bob_transport.set_offline(false);
        bob.insert_text(4, "!").await.unwrap();
        wait_for_content(&alice, "ello!").await;
        wait_for_content(&bob, "ello!").await;

        let at_alice = alice.document().await.unwrap();
        let at_bob = bob.document().await.unwrap();
        assert_eq!(at_alice.sequenced, 3);
        assert_eq!(at_alice.sequenced, at_bob.sequenced);
    }

    #[tokio::test]
    async fn test_permissions() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let bob = harness.service("bob");

        let session = alice
            .create_session(
                SessionConfig::new("Read only")
                    .public(true)
                    .with_permissions(SessionPermissions::read_only()),
            )
            .await
            .unwrap();
        alice.insert_text(0, "owner text").await.unwrap();
        bob.join_session(&session.id).await.unwrap();

        assert!(matches!(
            bob.insert_text(0, "x").await,
            Err(CollabError::PermissionDenied(_))
        ));
        assert!(bob.add_comment(0, 5, "can still comment").await.is_ok());
        assert!(matches!(
            bob.update_permissions(SessionPermissions::default()).await,
            Err(CollabError::PermissionDenied(_))
        ));
        assert!(matches!(
            bob.end_session().await,
            Err(CollabError::PermissionDenied(_))
        ));

        alice
            .update_permissions(SessionPermissions::default())
            .await
            .unwrap();
        let bob_ref = &bob;
        wait_until(|| async move { bob_ref.insert_text(0, ">").await.is_ok() }).await;
    }

    #[tokio::test]
    async fn test_join_errors() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let bob = harness.service("bob");
        let guest = harness.anonymous();

        assert!(matches!(
            bob.join_session("missing").await,
            Err(CollabError::NotFound { kind: "Session", .. })
        ));
        assert_eq!(
            guest.create_session(SessionConfig::new("Nope")).await,
            Err(CollabError::Unauthenticated)
        );

        let private = alice.create_session(SessionConfig::new("Private")).await.unwrap();
        assert!(matches!(
            bob.join_session(&private.id).await,
            Err(CollabError::PermissionDenied(_))
        ));
        assert_eq!(
            guest.join_session(&private.id).await,
            Err(CollabError::Unauthenticated)
        );

        let open = alice
            .create_session(SessionConfig::new("Open").allow_anonymous(true))
            .await
            .unwrap();
        let joined = guest.join_session(&open.id).await.unwrap();
        let handle = guest.active_session().unwrap();
        assert!(handle.user_id().starts_with("anon-"));
        assert!(joined.is_participant(handle.user_id()));
    }

    #[tokio::test]
    async fn test_session_full() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let bob = harness.service("bob");
        let carol = harness.service("carol");

        let session = alice
            .create_session(SessionConfig::new("Pair").public(true).with_max_participants(2))
            .await
            .unwrap();
        bob.join_session(&session.id).await.unwrap();
        assert_eq!(
            carol.join_session(&session.id).await,
            Err(CollabError::SessionFull(session.id.clone()))
        );
    }

    #[tokio::test]
    async fn test_end_session() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let bob = harness.service("bob");
        let carol = harness.service("carol");

        let session = alice
            .create_session(SessionConfig::new("Short lived").public(true))
            .await
            .unwrap();
        bob.join_session(&session.id).await.unwrap();
        let mut bob_events = bob.subscribe();

        alice.end_session().await.unwrap();
        assert!(alice.active_session().is_none());

        match next_event(&mut bob_events, "session_ended").await {
            SessionEvent::SessionEnded { ended_by, .. } => {
                assert_eq!(ended_by.as_deref(), Some("alice"))
            }
            other => panic!("unexpected {:?}", other),
        }
        let bob_ref = &bob;
        wait_until(|| async move { bob_ref.active_session().is_none() }).await;
        assert_eq!(bob.insert_text(0, "late").await, Err(CollabError::NotJoined));

        assert_eq!(
            carol.join_session(&session.id).await,
            Err(CollabError::SessionEnded(session.id.clone()))
        );
    }

    #[tokio::test]
    async fn test_expired_session_cannot_be_joined() {
        let harness = Harness::new();
        let alice = harness.service("alice");
        let bob = harness.service("bob");

        let session = alice
            .create_session(
                SessionConfig::new("Expired")
                    .public(true)
                    .with_expiry(crate::now_ms() - 1),
            )
            .await
            .unwrap();
        assert_eq!(
            bob.join_session(&session.id).await,
            Err(CollabError::SessionEnded(session.id.clone()))
        );
    }

    #[tokio::test]
    async fn test_not_joined() {
        let harness = Harness::new();
        let alice = harness.service("alice");

        assert_eq!(alice.insert_text(0, "x").await, Err(CollabError::NotJoined));
        assert_eq!(alice.update_cursor(0, None).await, Err(CollabError::NotJoined));
        assert!(alice.leave_session().await.is_ok());
    }

    #[tokio::test]
    async fn test_autosave_writes_snapshot() {
        let harness = Harness::new();
        let alice = harness.service("alice");

        let empty = alice.create_session(SessionConfig::new("Empty")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(alice.store().load_snapshot(&empty.id).await.unwrap().is_none());

        let session = alice.create_session(SessionConfig::new("Draft")).await.unwrap();
        alice.insert_text(0, "autosaved").await.unwrap();

        let store = alice.store();
        let session_id = &session.id;
        wait_until(|| async move {
            matches!(
                store.load_snapshot(session_id).await,
                Ok(Some(snapshot)) if snapshot.content == "autosaved" && snapshot.verify()
            )
        })
        .await;
        let ops = store.load_operations(&session.id).await.unwrap();
        assert_eq!(ops.len(), 1);
    }
}

//! # Chat Session
//!
//! The façade a UI talks to. One session belongs to one signed-in viewer and
//! owns the conversation list, the message logs and the realtime bridge.
//!
//! ## Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CHAT SESSION LIFECYCLE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  1. ChatSession::new(viewer, config, services)                          │
//! │            │                                                            │
//! │            ▼                                                            │
//! │  2. start()  ──▶ watch_membership(viewer) ──▶ refresh_conversations()   │
//! │            │                                                            │
//! │            ▼                                                            │
//! │  3. open_conversation(id) ──▶ newest page, watch_conversation(id),      │
//! │            │                   mark_read(id)                            │
//! │            ▼                                                            │
//! │  4. send / edit / delete / react / moderate                             │
//! │       (optimistic, rolled back on PermissionDenied)                     │
//! │            │                                                            │
//! │            ▼                                                            │
//! │  5. shutdown() ──▶ every subscription and timer aborted                 │
//! │                                                                         │
//! │  UI observes SyncEvent through subscribe_events().                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! State lives behind `parking_lot` locks that are never held across an
//! `.await`. Realtime work reaches the session through a weak link, so
//! dropping the session stops everything.

mod actions;
mod moderation;
mod refresh;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::SyncConfig;
use crate::crypto::ContentCipher;
use crate::error::{Error, Result};
use crate::identity::IdentityCache;
use crate::messaging::MessageStore;
use crate::model::{Conversation, Message};
use crate::realtime::{ChangeEvent, ChangeFeed, RealtimeBridge, RealtimeHandler};
use crate::storage::ChatBackend;
use crate::sync::{MembershipResolver, RosterHydrator};
use crate::time::{Clock, SystemClock};

/// Capacity of the session event broadcast
const EVENT_CAPACITY: usize = 128;

/// What changed, for the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// The conversation list or a conversation's summary changed
    ConversationsChanged,
    /// A conversation's message log changed
    MessagesChanged {
        /// Conversation id
        conversation_id: String,
    },
    /// A conversation's unread count changed
    UnreadChanged {
        /// Conversation id
        conversation_id: String,
        /// New count
        unread_count: u32,
    },
    /// Something failed that the user should hear about
    Notice {
        /// The failure
        #[serde(with = "notice_error")]
        error: Error,
    },
}

mod notice_error {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::error::Error;

    pub fn serialize<S: Serializer>(error: &Error, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&error.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Error, D::Error> {
        String::deserialize(deserializer).map(Error::Internal)
    }
}

/// Collaborators a session runs against
#[derive(Clone)]
pub struct Services {
    /// Storage and query backend
    pub backend: Arc<dyn ChatBackend>,
    /// Row change notifications
    pub feed: Arc<dyn ChangeFeed>,
    /// Message body encoding
    pub cipher: Arc<dyn ContentCipher>,
    /// Session-scoped profile cache
    pub identities: Arc<IdentityCache>,
    /// Time source for optimistic timestamps and mute checks
    pub clock: Arc<dyn Clock>,
}

impl Services {
    /// Bundle collaborators, using the system clock
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        feed: Arc<dyn ChangeFeed>,
        cipher: Arc<dyn ContentCipher>,
        identities: Arc<IdentityCache>,
    ) -> Self {
        Self {
            backend,
            feed,
            cipher,
            identities,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Default)]
struct SessionState {
    conversations: Vec<Conversation>,
    open: Option<String>,
    /// A refresh has completed without fetch errors
    loaded: bool,
}

impl SessionState {
    fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    fn conversation_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }
}

pub(crate) struct Shared {
    viewer: String,
    config: SyncConfig,
    backend: Arc<dyn ChatBackend>,
    cipher: Arc<dyn ContentCipher>,
    identities: Arc<IdentityCache>,
    clock: Arc<dyn Clock>,
    resolver: MembershipResolver,
    hydrator: RosterHydrator,
    state: RwLock<SessionState>,
    messages: Mutex<MessageStore>,
    bridge: RealtimeBridge,
    events: broadcast::Sender<SyncEvent>,
}

impl Shared {
    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    fn emit(&self, event: SyncEvent) {
        // No listeners is fine
        let _ = self.events.send(event);
    }

    fn notice(&self, error: Error) {
        tracing::warn!("Notice for {}: {}", self.viewer, error);
        self.emit(SyncEvent::Notice { error });
    }

    /// Snapshot of a conversation from the list
    fn conversation(&self, id: &str) -> Result<Conversation> {
        self.state
            .read()
            .conversation(id)
            .cloned()
            .ok_or(Error::ConversationNotFound)
    }

    /// Locate a loaded message: `(conversation id, message)`
    fn find_message(&self, message_id: &str) -> Result<(String, Message)> {
        self.messages
            .lock()
            .find(message_id)
            .map(|(conversation_id, message)| (conversation_id.to_string(), message.clone()))
            .ok_or(Error::MessageNotFound)
    }
}

/// Routes debounced realtime work back into the session, if it still exists
struct SessionLink(Weak<Shared>);

#[async_trait]
impl RealtimeHandler for SessionLink {
    async fn refresh_list(&self) {
        if let Some(shared) = self.0.upgrade() {
            if let Err(e) = shared.refresh_conversations().await {
                tracing::debug!("Realtime list refresh failed: {}", e);
            }
        }
    }

    async fn apply_message_changes(&self, conversation_id: String, events: Vec<ChangeEvent>) {
        if let Some(shared) = self.0.upgrade() {
            shared.apply_message_changes(&conversation_id, events).await;
        }
    }

    async fn apply_summary_change(&self, event: ChangeEvent) {
        if let Some(shared) = self.0.upgrade() {
            shared.apply_summary_change(event).await;
        }
    }
}

/// A viewer's synchronized chat state
pub struct ChatSession {
    shared: Arc<Shared>,
}

impl ChatSession {
    /// Create a session for `viewer`. Nothing is fetched until
    /// [`start`](Self::start).
    pub fn new(viewer: impl Into<String>, config: SyncConfig, services: Services) -> Self {
        let viewer = viewer.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            resolver: MembershipResolver::new(services.backend.clone()),
            hydrator: RosterHydrator::new(
                services.backend.clone(),
                services.identities.clone(),
                services.cipher.clone(),
                config.preview_len,
            ),
            bridge: RealtimeBridge::new(services.feed.clone(), &config, Arc::new(SessionLink(weak.clone()))),
            messages: Mutex::new(MessageStore::new(config.reconcile_tolerance_ms)),
            state: RwLock::new(SessionState::default()),
            viewer,
            config,
            backend: services.backend,
            cipher: services.cipher,
            identities: services.identities,
            clock: services.clock,
            events,
        });

        Self { shared }
    }

    /// Load the conversation list and start listening for changes
    pub async fn start(&self) -> Result<()> {
        tracing::info!("Starting chat session for {}", self.shared.viewer);
        self.shared.bridge.watch_membership(&self.shared.viewer);
        self.shared.refresh_conversations().await
    }

    /// Stop every subscription and pending refresh
    pub fn shutdown(&self) {
        tracing::info!("Shutting down chat session for {}", self.shared.viewer);
        self.shared.bridge.shutdown();
        self.shared.state.write().open = None;
    }

    /// The signed-in user
    pub fn viewer(&self) -> &str {
        &self.shared.viewer
    }

    /// Active configuration
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Session events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crypto::PlainContentCipher;
    use crate::model::{ConversationKind, Member, Role};
    use crate::realtime::LocalChangeFeed;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::storage::{
        ConversationRow, Database, MembershipRow, MessageRow, NewMessage, OverviewEntry,
    };
    use crate::time::ManualClock;

    pub const T0: i64 = 1_700_000_000_000;

    /// Delegates to a [`Database`] but can be told to fail message pages or
    /// direct-conversation repairs
    pub struct FlakyBackend {
        pub db: Arc<Database>,
        pub fail_messages: AtomicBool,
        pub fail_repairs: AtomicBool,
    }

    impl FlakyBackend {
        pub fn new(db: Arc<Database>) -> Self {
            Self {
                db,
                fail_messages: AtomicBool::new(false),
                fail_repairs: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for FlakyBackend {
        async fn memberships(&self, viewer: &str) -> Result<Vec<MembershipRow>> {
            ChatBackend::memberships(&*self.db, viewer).await
        }

        async fn overview(&self, viewer: &str) -> Result<Vec<OverviewEntry>> {
            ChatBackend::overview(&*self.db, viewer).await
        }

        async fn conversations(&self, ids: &[String]) -> Result<Vec<ConversationRow>> {
            ChatBackend::conversations(&*self.db, ids).await
        }

        async fn rosters(&self, ids: &[String]) -> Result<Vec<Member>> {
            ChatBackend::rosters(&*self.db, ids).await
        }

        async fn messages(&self, conversation_id: &str, limit: usize, offset: usize) -> Result<Vec<MessageRow>> {
            if self.fail_messages.load(Ordering::SeqCst) {
                return Err(Error::TransientFetch("messages unavailable".into()));
            }
            ChatBackend::messages(&*self.db, conversation_id, limit, offset).await
        }

        async fn message(&self, id: &str) -> Result<Option<MessageRow>> {
            ChatBackend::message(&*self.db, id).await
        }

        async fn insert_message(&self, message: NewMessage) -> Result<MessageRow> {
            ChatBackend::insert_message(&*self.db, message).await
        }

        async fn edit_message(&self, id: &str, ciphertext: &str, edited_at: i64) -> Result<MessageRow> {
            ChatBackend::edit_message(&*self.db, id, ciphertext, edited_at).await
        }

        async fn delete_message(&self, id: &str) -> Result<()> {
            ChatBackend::delete_message(&*self.db, id).await
        }

        async fn add_reaction(&self, message_id: &str, user_id: &str, symbol: &str) -> Result<()> {
            ChatBackend::add_reaction(&*self.db, message_id, user_id, symbol).await
        }

        async fn remove_reaction(&self, message_id: &str, user_id: &str, symbol: &str) -> Result<()> {
            ChatBackend::remove_reaction(&*self.db, message_id, user_id, symbol).await
        }

        async fn ensure_direct_conversation(&self, viewer: &str, partner: &str) -> Result<String> {
            if self.fail_repairs.load(Ordering::SeqCst) {
                return Err(Error::Internal("repair unavailable".into()));
            }
            ChatBackend::ensure_direct_conversation(&*self.db, viewer, partner).await
        }

        async fn delete_conversation(&self, id: &str) -> Result<()> {
            ChatBackend::delete_conversation(&*self.db, id).await
        }

        async fn leave_conversation(&self, id: &str, user_id: &str) -> Result<()> {
            ChatBackend::leave_conversation(&*self.db, id, user_id).await
        }

        async fn update_last_read(&self, id: &str, user_id: &str, at: i64) -> Result<()> {
            ChatBackend::update_last_read(&*self.db, id, user_id, at).await
        }

        async fn update_member(&self, actor: &str, member: &Member) -> Result<()> {
            ChatBackend::update_member(&*self.db, actor, member).await
        }

        async fn remove_member(&self, actor: &str, conversation_id: &str, user_id: &str) -> Result<()> {
            ChatBackend::remove_member(&*self.db, actor, conversation_id, user_id).await
        }

        async fn sweep_expired_mutes(&self, now: i64) -> Result<usize> {
            ChatBackend::sweep_expired_mutes(&*self.db, now).await
        }
    }

    pub struct Fixture {
        pub db: Arc<Database>,
        pub feed: Arc<LocalChangeFeed>,
        pub clock: Arc<ManualClock>,
    }

    impl Fixture {
        /// alice owns group `g1` with bob; alice and bob share direct `d1`
        pub async fn new() -> Self {
            let feed = Arc::new(LocalChangeFeed::new());
            let clock = Arc::new(ManualClock::new(T0));
            let db = Database::open(None)
                .await
                .unwrap()
                .with_change_feed(feed.clone())
                .with_clock(clock.clone());

            db.upsert_user("alice", "Alice", "alice", None).unwrap();
            db.upsert_user("bob", "Bob", "bob", None).unwrap();
            db.upsert_user("carol", "Carol", "carol", None).unwrap();

            for (id, kind, name) in [
                ("g1", ConversationKind::Group, Some("Robotics".to_string())),
                ("d1", ConversationKind::Direct, None),
            ] {
                db.create_conversation(&ConversationRow {
                    id: id.into(),
                    kind,
                    name,
                    team_id: None,
                    recruitment_id: None,
                    created_at: T0 - 1_000,
                    archived: false,
                })
                .unwrap();
            }
            db.add_member(&Member::new("g1", "alice", Role::Owner)).unwrap();
            db.add_member(&Member::new("g1", "bob", Role::Member)).unwrap();
            db.add_member(&Member::new("d1", "alice", Role::Member)).unwrap();
            db.add_member(&Member::new("d1", "bob", Role::Member)).unwrap();

            Self {
                db: Arc::new(db),
                feed,
                clock,
            }
        }

        pub fn session(&self, viewer: &str) -> ChatSession {
            self.session_with_clock(viewer, self.clock.clone())
        }

        /// A session whose clock differs from the server's
        pub fn session_with_clock(&self, viewer: &str, clock: Arc<dyn Clock>) -> ChatSession {
            self.build_session(viewer, self.db.clone(), clock)
        }

        /// A session talking to `backend` instead of the database directly
        pub fn session_with_backend(&self, viewer: &str, backend: Arc<dyn ChatBackend>) -> ChatSession {
            self.build_session(viewer, backend, self.clock.clone())
        }

        fn build_session(&self, viewer: &str, backend: Arc<dyn ChatBackend>, clock: Arc<dyn Clock>) -> ChatSession {
            let identities = Arc::new(IdentityCache::new(self.db.clone()));
            let services = Services::new(
                backend,
                self.feed.clone(),
                Arc::new(PlainContentCipher),
                identities,
            )
            .with_clock(clock);
            ChatSession::new(viewer, SyncConfig::default(), services)
        }
    }

    /// Let spawned tasks run
    pub async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    /// Let the conversation and list timers fire
    pub async fn flush_timers() {
        settle().await;
        tokio::time::advance(std::time::Duration::from_millis(150)).await;
        settle().await;
    }
}

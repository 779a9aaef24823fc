//! List refresh, conversation loading and realtime application.

use std::collections::HashSet;

use super::{ChatSession, Shared, SyncEvent};
use crate::crypto::decode_or_sentinel;
use crate::error::Result;
use crate::messaging::{hydrate_message, preview};
use crate::model::{Conversation, LastMessage, Message};
use crate::realtime::{ChangeEvent, ChangeOp};
use crate::storage::MessageRow;
use crate::sync::{deduplicate, sort_by_activity};

/// What [`Shared::bump_summary`] did to a conversation's summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SummaryBump {
    /// Older than the current summary, or the conversation is unknown
    Stale,
    /// Already the summary; refreshed in place
    Same,
    /// A newer message took over the summary
    Advanced,
}

impl Shared {
    /// Resolver → hydrator → deduplicator, then swap the list in.
    pub(crate) async fn refresh_conversations(&self) -> Result<()> {
        let resolution = self.resolver.resolve(&self.viewer).await;

        if let Some(error) = resolution.fetch_errors.first().cloned() {
            let loaded = self.state.read().loaded;
            if loaded {
                tracing::warn!("Keeping previous conversation list: {}", error);
                self.notice(error.clone());
                return Err(error);
            }
            // First load: show whatever arrived
            self.notice(error);
        }

        let hydrated = match self.hydrator.hydrate(&self.viewer, &resolution).await {
            Ok(conversations) => conversations,
            Err(e) => {
                self.notice(e.clone());
                return Err(e);
            }
        };
        let mut conversations = deduplicate(hydrated);

        for error in &resolution.unrepaired {
            self.notice(error.clone());
        }

        let closed = {
            let mut state = self.state.write();
            if let Some(open) = &state.open {
                if let Some(c) = conversations.iter_mut().find(|c| &c.id == open) {
                    c.unread_count = 0;
                }
            }
            let closed = state
                .open
                .as_ref()
                .filter(|open| !conversations.iter().any(|c| &c.id == *open))
                .cloned();
            if closed.is_some() {
                state.open = None;
            }
            state.conversations = conversations;
            state.loaded |= resolution.fetch_errors.is_empty();
            closed
        };

        if let Some(id) = closed {
            tracing::info!("Open conversation {} is gone; closing it", id);
            self.bridge.unwatch_conversation();
            self.messages.lock().remove(&id);
        }

        tracing::debug!("Conversation list refreshed for {}", self.viewer);
        self.emit(SyncEvent::ConversationsChanged);
        Ok(())
    }

    /// Turn rows into messages with sender profiles attached
    async fn hydrate_rows(&self, rows: Vec<MessageRow>) -> Vec<Message> {
        let senders: Vec<String> = {
            let mut seen = HashSet::new();
            rows.iter()
                .filter(|r| seen.insert(r.sender_id.as_str()))
                .map(|r| r.sender_id.clone())
                .collect()
        };
        let profiles = self.identities.resolve_many(&senders).await;

        rows.into_iter()
            .map(|row| {
                let mut message = hydrate_message(row, self.cipher.as_ref());
                message.sender = profiles.get(&message.sender_id).cloned();
                message
            })
            .collect()
    }

    /// Undo a failed switch to `failed`: reopen `previous` or, when nothing
    /// was open before, stop following conversations. A later switch wins.
    fn restore_open(&self, failed: &str, previous: Option<String>) {
        {
            let mut state = self.state.write();
            if state.open.as_deref() != Some(failed) {
                return;
            }
            state.open = previous.clone();
        }
        match previous.as_deref() {
            Some(previous) if previous != failed => self.bridge.watch_conversation(previous),
            Some(_) => {}
            None => self.bridge.unwatch_conversation(),
        }
    }

    async fn load_page(&self, conversation_id: &str, offset: usize) -> Result<usize> {
        let rows = match self
            .backend
            .messages(conversation_id, self.config.page_size, offset)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                self.notice(e.clone());
                return Err(e);
            }
        };
        let page = self.hydrate_rows(rows).await;
        let count = page.len();
        self.messages.lock().log_mut(conversation_id).merge_page(page);
        self.emit(SyncEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
        Ok(count)
    }

    /// Set a conversation's last-message summary if `message` is newer
    pub(crate) fn bump_summary(&self, message: &Message) -> SummaryBump {
        let summary = LastMessage {
            message_id: message.id.as_str().to_string(),
            sender_id: message.sender_id.clone(),
            preview: preview(&message.text, self.config.preview_len),
            at: message.created_at,
        };

        let mut state = self.state.write();
        let Some(conversation) = state.conversation_mut(&message.conversation_id) else {
            return SummaryBump::Stale;
        };
        let bump = match &conversation.last_message {
            Some(last) if last.message_id == summary.message_id => SummaryBump::Same,
            Some(last) if last.at > summary.at => SummaryBump::Stale,
            _ => SummaryBump::Advanced,
        };
        if bump != SummaryBump::Stale {
            conversation.last_message = Some(summary);
            sort_by_activity(&mut state.conversations);
        }
        bump
    }

    /// Apply a debounced batch of the open conversation's changes
    pub(crate) async fn apply_message_changes(&self, conversation_id: &str, events: Vec<ChangeEvent>) {
        if self.state.read().open.as_deref() != Some(conversation_id) {
            tracing::debug!("Dropping {} changes for closed {}", events.len(), conversation_id);
            return;
        }

        let senders: Vec<String> = events
            .iter()
            .filter(|e| e.op == ChangeOp::Insert)
            .filter_map(|e| e.message().map(|m| m.sender_id.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let profiles = self.identities.resolve_many(&senders).await;

        let mut list_refresh = false;
        let mut incoming = false;
        for event in events {
            match event.op {
                ChangeOp::Insert => {
                    let Some(row) = event.message().cloned() else { continue };
                    let mut message = hydrate_message(row, self.cipher.as_ref());
                    message.sender = profiles.get(&message.sender_id).cloned();
                    incoming |= !message.is_outgoing(&self.viewer);

                    let outcome = self.messages.lock().log_mut(conversation_id).reconcile(message.clone());
                    tracing::debug!("Realtime insert {} in {}: {:?}", message.id, conversation_id, outcome);
                    self.bump_summary(&message);
                }
                ChangeOp::Update => {
                    let Some(row) = event.message().cloned() else { continue };
                    let has_reactions = row.reactions.is_some();
                    let message = hydrate_message(row, self.cipher.as_ref());
                    let summary_hit = self.is_last_message(conversation_id, message.id.as_str());
                    let applied = self
                        .messages
                        .lock()
                        .log_mut(conversation_id)
                        .apply_update(message.clone(), has_reactions);
                    if applied && summary_hit {
                        if message.deleted {
                            list_refresh = true;
                        } else {
                            self.bump_summary(&message);
                        }
                    }
                }
                ChangeOp::Delete => {
                    let Some(row) = event.message() else { continue };
                    self.messages.lock().log_mut(conversation_id).remove(&row.id);
                    list_refresh = true;
                }
            }
        }

        if incoming {
            // The viewer is looking at it
            self.mark_read_in_background(conversation_id);
        }
        if list_refresh {
            self.bridge.schedule_list_refresh();
        }
        self.emit(SyncEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
        self.emit(SyncEvent::ConversationsChanged);
    }

    /// Keep list summaries current for conversations that are not open
    pub(crate) async fn apply_summary_change(&self, event: ChangeEvent) {
        let Some(row) = event.message().cloned() else { return };
        {
            let state = self.state.read();
            if state.open.as_deref() == Some(row.conversation_id.as_str())
                || state.conversation(&row.conversation_id).is_none()
            {
                return;
            }
        }

        match event.op {
            ChangeOp::Insert => {
                let message = hydrate_message(row, self.cipher.as_ref());
                match self.bump_summary(&message) {
                    SummaryBump::Advanced => {}
                    SummaryBump::Same => {
                        tracing::debug!("Insert {} already counted", message.id);
                        return;
                    }
                    SummaryBump::Stale => return,
                }
                if !message.is_outgoing(&self.viewer) {
                    let unread = {
                        let mut state = self.state.write();
                        state.conversation_mut(&message.conversation_id).map(|c| {
                            c.unread_count += 1;
                            c.unread_count
                        })
                    };
                    if let Some(unread_count) = unread {
                        self.emit(SyncEvent::UnreadChanged {
                            conversation_id: message.conversation_id.clone(),
                            unread_count,
                        });
                    }
                }
                self.emit(SyncEvent::ConversationsChanged);
            }
            ChangeOp::Update | ChangeOp::Delete => {
                if !self.is_last_message(&row.conversation_id, &row.id) {
                    return;
                }
                if event.op == ChangeOp::Update && !row.deleted {
                    let text = decode_or_sentinel(self.cipher.as_ref(), &row.id, &row.ciphertext);
                    let mut state = self.state.write();
                    if let Some(last) = state
                        .conversation_mut(&row.conversation_id)
                        .and_then(|c| c.last_message.as_mut())
                    {
                        last.preview = preview(&text, self.config.preview_len);
                    }
                    drop(state);
                    self.emit(SyncEvent::ConversationsChanged);
                } else {
                    // The summary needs the previous message; the overview has it
                    self.bridge.schedule_list_refresh();
                }
            }
        }
    }

    pub(crate) fn is_last_message(&self, conversation_id: &str, message_id: &str) -> bool {
        self.state
            .read()
            .conversation(conversation_id)
            .and_then(|c| c.last_message.as_ref())
            .is_some_and(|last| last.message_id == message_id)
    }
}

impl ChatSession {
    /// Rebuild the conversation list from the backend.
    ///
    /// When a source fails after a list has been shown, the previous list
    /// is kept and a [`SyncEvent::Notice`] is emitted.
    pub async fn refresh_conversations(&self) -> Result<()> {
        self.shared.refresh_conversations().await
    }

    /// The current conversation list, most recent activity first
    pub fn conversations(&self) -> Vec<Conversation> {
        self.shared.state.read().conversations.clone()
    }

    /// One conversation from the list
    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.shared.state.read().conversation(id).cloned()
    }

    /// The open conversation, if any
    pub fn open_conversation_id(&self) -> Option<String> {
        self.shared.state.read().open.clone()
    }

    /// Open a conversation: load the newest page, follow its changes and
    /// mark it read
    pub async fn open_conversation(&self, id: &str) -> Result<()> {
        let shared = &self.shared;
        shared.conversation(id)?;

        let previous = shared.state.write().open.replace(id.to_string());
        if let Some(previous) = previous.as_deref().filter(|p| *p != id) {
            tracing::debug!("Switching from {} to {}", previous, id);
        }
        // Subscribe before the fetch so nothing falls between page and feed
        shared.bridge.watch_conversation(id);

        if let Err(e) = shared.load_page(id, 0).await {
            tracing::warn!("Failed to open {}: {}", id, e);
            shared.restore_open(id, previous);
            return Err(e);
        }
        self.mark_read(id);
        Ok(())
    }

    /// Stop following the open conversation
    pub fn close_conversation(&self) {
        self.shared.state.write().open = None;
        self.shared.bridge.unwatch_conversation();
    }

    /// Load the page before the oldest loaded message. Returns how many
    /// messages arrived; `0` means the start of the history.
    pub async fn load_older(&self, id: &str) -> Result<usize> {
        let offset = self
            .shared
            .messages
            .lock()
            .log(id)
            .map(|log| log.confirmed_count())
            .unwrap_or(0);
        self.shared.load_page(id, offset).await
    }

    /// Messages of a loaded conversation, oldest first
    pub fn messages(&self, id: &str) -> Vec<Message> {
        self.shared.messages.lock().messages(id)
    }

    /// Whether a conversation's list entry is a read-only placeholder
    pub fn is_placeholder(&self, id: &str) -> bool {
        self.conversation(id).is_some_and(|c| c.placeholder)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::super::test_support::*;
    use crate::error::Error;
    use crate::identity::Profile;
    use crate::model::{ConversationKind, Member, Partner, Role};
    use crate::realtime::{ChangeEvent, Row};
    use crate::session::SyncEvent;
    use crate::storage::{direct_conversation_id, NewMessage, OverviewEntry};

    fn new_message(conversation_id: &str, sender_id: &str, body: &str) -> NewMessage {
        NewMessage {
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            ciphertext: body.into(),
            reply_to: None,
            forwarded_from: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_membership_only_and_overview_only_both_listed() {
        let fixture = Fixture::new().await;
        // carol has a ledger-only group and an overview-only direct chat
        fixture
            .db
            .add_member(&Member::new("g1", "carol", Role::Member))
            .unwrap();
        fixture
            .db
            .upsert_overview(
                "carol",
                &OverviewEntry {
                    conversation_id: "dm-new".into(),
                    kind: ConversationKind::Direct,
                    name: None,
                    partner: Some(Partner {
                        user_id: "alice".into(),
                        profile: Profile { name: "Alice".into(), handle: "alice".into(), avatar: None },
                    }),
                    last_message: None,
                    unread_count: 0,
                    created_at: T0,
                },
            )
            .unwrap();

        let session = fixture.session("carol");
        session.start().await.unwrap();

        let ids: Vec<String> = session.conversations().into_iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"g1".to_string()));
        assert!(ids.contains(&"dm-new".to_string()));
        assert!(!session.is_placeholder("dm-new"));
        assert!(!ids.contains(&direct_conversation_id("alice", "carol")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_conversation_pages_and_marks_read() {
        let fixture = Fixture::new().await;
        for i in 0..3 {
            fixture.clock.advance(10);
            fixture.db.store_message(new_message("g1", "bob", &format!("m{}", i))).unwrap();
        }

        let session = fixture.session("alice");
        session.start().await.unwrap();
        assert_eq!(session.conversation("g1").unwrap().unread_count, 3);

        session.open_conversation("g1").await.unwrap();
        let texts: Vec<String> = session.messages("g1").into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["m0", "m1", "m2"]);
        assert_eq!(session.messages("g1")[0].sender.as_ref().unwrap().name, "Bob");
        assert_eq!(session.conversation("g1").unwrap().unread_count, 0);

        settle().await;
        let overview = fixture.db.get_overview("alice").unwrap();
        let g1 = overview.iter().find(|e| e.conversation_id == "g1").unwrap();
        assert_eq!(g1.unread_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_older_uses_confirmed_offset() {
        let fixture = Fixture::new().await;
        let total = 60;
        for i in 0..total {
            fixture.clock.advance(10);
            fixture.db.store_message(new_message("g1", "bob", &format!("m{}", i))).unwrap();
        }

        let session = fixture.session("alice");
        session.start().await.unwrap();
        session.open_conversation("g1").await.unwrap();
        assert_eq!(session.messages("g1").len(), 50);

        assert_eq!(session.load_older("g1").await.unwrap(), 10);
        let messages = session.messages("g1");
        assert_eq!(messages.len(), total);
        assert_eq!(messages[0].text, "m0");
        assert_eq!(session.load_older("g1").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_insert_into_open_and_other_conversations() {
        let fixture = Fixture::new().await;
        let session = fixture.session("alice");
        session.start().await.unwrap();
        session.open_conversation("g1").await.unwrap();

        fixture.clock.advance(100);
        fixture.db.store_message(new_message("g1", "bob", "in the open one")).unwrap();
        fixture.db.store_message(new_message("d1", "bob", "elsewhere")).unwrap();
        flush_timers().await;

        let open = session.messages("g1");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].text, "in the open one");
        assert_eq!(session.conversation("g1").unwrap().unread_count, 0);

        let direct = session.conversation("d1").unwrap();
        assert_eq!(direct.unread_count, 1);
        assert_eq!(direct.last_message.unwrap().preview, "elsewhere");
        assert!(session.messages("d1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_insert_is_idempotent() {
        let fixture = Fixture::new().await;
        let session = fixture.session("alice");
        session.start().await.unwrap();
        session.open_conversation("g1").await.unwrap();

        let row = fixture.db.store_message(new_message("g1", "bob", "once")).unwrap();
        flush_timers().await;
        // Same row again, as a redelivered event
        fixture
            .feed
            .publish(ChangeEvent::insert(Row::Message(row)));
        flush_timers().await;

        assert_eq!(session.messages("g1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_insert_counts_unread_once() {
        let fixture = Fixture::new().await;
        let session = fixture.session("alice");
        session.start().await.unwrap();

        fixture.clock.advance(100);
        let row = fixture.db.store_message(new_message("d1", "bob", "ping")).unwrap();
        flush_timers().await;
        assert_eq!(session.conversation("d1").unwrap().unread_count, 1);

        fixture
            .feed
            .publish(ChangeEvent::insert(Row::Message(row)));
        flush_timers().await;
        let direct = session.conversation("d1").unwrap();
        assert_eq!(direct.unread_count, 1);
        assert_eq!(direct.last_message.unwrap().preview, "ping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepaired_entry_yields_to_richer_record() {
        let fixture = Fixture::new().await;
        // carol's overview still lists g1 as a direct chat with alice
        fixture
            .db
            .upsert_overview(
                "carol",
                &OverviewEntry {
                    conversation_id: "g1".into(),
                    kind: ConversationKind::Direct,
                    name: None,
                    partner: Some(Partner {
                        user_id: "alice".into(),
                        profile: Profile { name: "Alice".into(), handle: "alice".into(), avatar: None },
                    }),
                    last_message: None,
                    unread_count: 0,
                    created_at: T0,
                },
            )
            .unwrap();
        let backend = Arc::new(FlakyBackend::new(fixture.db.clone()));
        backend.fail_repairs.store(true, Ordering::SeqCst);

        let session = fixture.session_with_backend("carol", backend);
        let mut events = session.subscribe_events();
        session.start().await.unwrap();

        let conversations = session.conversations();
        assert_eq!(conversations.len(), 1);
        let group = &conversations[0];
        assert_eq!(group.id, "g1");
        assert_eq!(group.kind, ConversationKind::Group);
        assert_eq!(group.name.as_deref(), Some("Robotics"));
        assert!(!group.placeholder);
        assert!(!session.is_placeholder("g1"));

        // Still reported as inconsistent
        let mut inconsistent = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::Notice { error: Error::InconsistentMembership { .. } } = event {
                inconsistent = true;
            }
        }
        assert!(inconsistent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_keeps_previous_conversation() {
        let fixture = Fixture::new().await;
        let backend = Arc::new(FlakyBackend::new(fixture.db.clone()));
        let session = fixture.session_with_backend("alice", backend.clone());
        session.start().await.unwrap();
        session.open_conversation("d1").await.unwrap();

        backend.fail_messages.store(true, Ordering::SeqCst);
        assert!(matches!(
            session.open_conversation("g1").await,
            Err(Error::TransientFetch(_))
        ));
        assert_eq!(session.open_conversation_id().as_deref(), Some("d1"));
        settle().await;
        assert_eq!(fixture.feed.subscriber_count(), 3);

        // d1 is still followed
        fixture.clock.advance(100);
        fixture.db.store_message(new_message("d1", "bob", "still here")).unwrap();
        flush_timers().await;
        let texts: Vec<String> = session.messages("d1").into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["still here"]);
        assert!(session.messages("g1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_open_leaves_nothing_open() {
        let fixture = Fixture::new().await;
        let backend = Arc::new(FlakyBackend::new(fixture.db.clone()));
        backend.fail_messages.store(true, Ordering::SeqCst);
        let session = fixture.session_with_backend("alice", backend);
        session.start().await.unwrap();
        assert_eq!(fixture.feed.subscriber_count(), 2);

        assert!(session.open_conversation("g1").await.is_err());
        assert_eq!(session.open_conversation_id(), None);
        settle().await;
        assert_eq!(fixture.feed.subscriber_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_membership_change_refreshes_list() {
        let fixture = Fixture::new().await;
        let session = fixture.session("carol");
        session.start().await.unwrap();
        assert!(session.conversations().is_empty());

        let mut events = session.subscribe_events();
        fixture
            .db
            .add_member(&Member::new("g1", "carol", Role::Member))
            .unwrap();
        flush_timers().await;

        assert_eq!(session.conversations().len(), 1);
        assert!(matches!(events.try_recv(), Ok(SyncEvent::ConversationsChanged)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_open_conversation_closes_it() {
        let fixture = Fixture::new().await;
        let session = fixture.session("bob");
        session.start().await.unwrap();
        session.open_conversation("g1").await.unwrap();

        fixture.db.ban("alice", "g1", "bob").unwrap();
        flush_timers().await;

        assert!(session.conversation("g1").is_none());
        assert!(session.open_conversation_id().is_none());
        assert!(matches!(session.open_conversation("g1").await, Err(Error::ConversationNotFound)));
    }
}

//! Realtime bridge.
//!
//! Owns the change subscriptions of one session and forwards them to a
//! [`RealtimeHandler`] through debounce timers. Every subscription task is
//! aborted when it is replaced, on [`RealtimeBridge::shutdown`], and on drop.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::{ChangeEvent, ChangeFeed, Entity, Filter, RefreshTimer};
use crate::config::SyncConfig;

/// Receiver of debounced realtime work
#[async_trait]
pub trait RealtimeHandler: Send + Sync {
    /// Rebuild the conversation list
    async fn refresh_list(&self);

    /// Apply a batch of message changes of the open conversation, in
    /// arrival order
    async fn apply_message_changes(&self, conversation_id: String, events: Vec<ChangeEvent>);

    /// Update list summaries (last message, unread) for one message change
    async fn apply_summary_change(&self, event: ChangeEvent);
}

type Buffer = Arc<Mutex<Vec<ChangeEvent>>>;

struct ConversationWatch {
    conversation_id: String,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BridgeTasks {
    membership: Option<JoinHandle<()>>,
    summary: Option<JoinHandle<()>>,
    conversation: Option<ConversationWatch>,
}

impl BridgeTasks {
    fn abort_all(&mut self) {
        for task in [self.membership.take(), self.summary.take()].into_iter().flatten() {
            task.abort();
        }
        if let Some(watch) = self.conversation.take() {
            watch.task.abort();
        }
    }
}

/// Subscription owner of one session
pub struct RealtimeBridge {
    feed: Arc<dyn ChangeFeed>,
    handler: Arc<dyn RealtimeHandler>,
    list_timer: RefreshTimer,
    conversation_timer: RefreshTimer,
    tasks: Mutex<BridgeTasks>,
}

impl RealtimeBridge {
    /// Create a bridge; nothing is subscribed until a `watch_*` call
    pub fn new(feed: Arc<dyn ChangeFeed>, config: &SyncConfig, handler: Arc<dyn RealtimeHandler>) -> Self {
        Self {
            feed,
            handler,
            list_timer: RefreshTimer::new("list", config.list_debounce()),
            conversation_timer: RefreshTimer::new("conversation", config.conversation_debounce()),
            tasks: Mutex::new(BridgeTasks::default()),
        }
    }

    /// Subscribe to the viewer's membership changes and to message changes
    /// of every conversation. Replaces earlier list subscriptions.
    pub fn watch_membership(&self, viewer: &str) {
        let mut memberships = self.feed.subscribe(Entity::Membership, Filter::User(viewer.to_string()));
        let mut messages = self.feed.subscribe(Entity::Message, Filter::All);

        let timer = self.list_timer.clone();
        let handler = self.handler.clone();
        let membership = tokio::spawn(async move {
            while let Some(event) = memberships.next().await {
                tracing::debug!("Membership {:?} in {:?}", event.op, event.row().map(|r| r.conversation_id()));
                schedule_refresh(&timer, &handler);
            }
        });

        let handler = self.handler.clone();
        let summary = tokio::spawn(async move {
            while let Some(event) = messages.next().await {
                handler.apply_summary_change(event).await;
            }
        });

        let mut tasks = self.tasks.lock();
        for old in [tasks.membership.replace(membership), tasks.summary.replace(summary)]
            .into_iter()
            .flatten()
        {
            old.abort();
        }
    }

    /// Subscribe to message changes of one conversation. The previous
    /// conversation subscription is torn down first and its buffered
    /// changes are discarded.
    pub fn watch_conversation(&self, conversation_id: &str) {
        self.unwatch_conversation();

        let mut stream = self
            .feed
            .subscribe(Entity::Message, Filter::Conversation(conversation_id.to_string()));
        let buffer: Buffer = Arc::new(Mutex::new(Vec::new()));
        let timer = self.conversation_timer.clone();
        let handler = self.handler.clone();
        let id = conversation_id.to_string();

        let task = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                buffer.lock().push(event);

                let buffer = buffer.clone();
                let handler = handler.clone();
                let id = id.clone();
                timer.schedule(move || async move {
                    let batch = std::mem::take(&mut *buffer.lock());
                    if !batch.is_empty() {
                        handler.apply_message_changes(id, batch).await;
                    }
                });
            }
        });

        tracing::debug!("Watching conversation {}", conversation_id);
        self.tasks.lock().conversation = Some(ConversationWatch {
            conversation_id: conversation_id.to_string(),
            task,
        });
    }

    /// Drop the open-conversation subscription
    pub fn unwatch_conversation(&self) {
        self.conversation_timer.cancel();
        if let Some(watch) = self.tasks.lock().conversation.take() {
            watch.task.abort();
        }
    }

    /// Conversation currently watched, if any
    pub fn watched_conversation(&self) -> Option<String> {
        self.tasks
            .lock()
            .conversation
            .as_ref()
            .map(|w| w.conversation_id.clone())
    }

    /// Request a debounced list refresh
    pub fn schedule_list_refresh(&self) {
        schedule_refresh(&self.list_timer, &self.handler);
    }

    /// Abort every subscription and pending timer
    pub fn shutdown(&self) {
        self.list_timer.cancel();
        self.conversation_timer.cancel();
        self.tasks.lock().abort_all();
    }
}

impl Drop for RealtimeBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn schedule_refresh(timer: &RefreshTimer, handler: &Arc<dyn RealtimeHandler>) {
    let handler = handler.clone();
    timer.schedule(move || async move {
        handler.refresh_list().await;
    });
}

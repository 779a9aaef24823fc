//! In-process change feed.

use futures::stream::BoxStream;
use tokio::sync::broadcast;

use super::{ChangeEvent, ChangeFeed, Entity, Filter};

/// Capacity of the change broadcast; slow subscribers skip ahead past this
const FEED_CAPACITY: usize = 256;

/// Broadcast-backed [`ChangeFeed`]. The reference
/// [`Database`](crate::storage::Database) publishes its row changes here.
pub struct LocalChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl LocalChangeFeed {
    /// Create a feed with no subscribers
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    /// Publish a change to all current subscribers
    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed for LocalChangeFeed {
    fn subscribe(&self, entity: Entity, filter: Filter) -> BoxStream<'static, ChangeEvent> {
        // Subscribe now so events published before the first poll are kept
        let mut rx = self.tx.subscribe();

        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.entity() == Some(entity) && event.matches(&filter) {
                            yield event;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Change feed subscriber lagged by {} events", n);
                    }
                }
            }
        })
    }
}

//! Ordered message logs with optimistic reconciliation.

use std::collections::HashMap;

use super::content_fingerprint;
use crate::model::{Message, MessageId, MessageStatus};

/// What [`MessageLog::reconcile`] did with a confirmed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The confirmed id was already present and was replaced in place
    Replaced,
    /// A pending entry was matched and replaced
    Matched {
        /// Local id of the pending entry that was replaced
        local_id: String,
    },
    /// No counterpart; inserted as new
    Inserted,
}

/// One conversation's messages, ordered by `(created_at, id)`
#[derive(Debug, Clone)]
pub struct MessageLog {
    entries: Vec<Message>,
    tolerance_ms: i64,
    /// Confirmed ids inserted by `reconcile` that no optimistic entry has
    /// matched yet, with their creation time; an optimistic append may be
    /// absorbed by one of these. Only the tolerance window is kept.
    unclaimed_echoes: HashMap<String, i64>,
}

impl MessageLog {
    /// Create an empty log
    pub fn new(tolerance_ms: i64) -> Self {
        Self {
            entries: Vec::new(),
            tolerance_ms,
            unclaimed_echoes: HashMap::new(),
        }
    }

    /// Messages in order
    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries the server knows about (used as the pagination offset)
    pub fn confirmed_count(&self) -> usize {
        self.entries.iter().filter(|m| !m.id.is_pending()).count()
    }

    /// Look up by raw id (pending or confirmed)
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.position(id).map(|i| &self.entries[i])
    }

    /// Newest entry
    pub fn last(&self) -> Option<&Message> {
        self.entries.last()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|m| m.id.as_str() == id)
    }

    fn position_of(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|m| &m.id == id)
    }

    fn insert_sorted(&mut self, message: Message) {
        let at = {
            let key = message.sort_key();
            self.entries.partition_point(|m| m.sort_key() <= key)
        };
        self.entries.insert(at, message);
    }

    /// Move the entry at `index` if its neighbours no longer bracket it
    fn resort_at(&mut self, index: usize) {
        let key = self.entries[index].sort_key();
        let after_prev = index == 0 || self.entries[index - 1].sort_key() <= key;
        let before_next = index + 1 >= self.entries.len() || key <= self.entries[index + 1].sort_key();
        if !(after_prev && before_next) {
            let message = self.entries.remove(index);
            self.insert_sorted(message);
        }
    }

    fn within_tolerance(&self, a: i64, b: i64) -> bool {
        (a - b).abs() <= self.tolerance_ms
    }

    /// Replace `index` with `message`, keeping reactions held only locally
    fn replace_at(&mut self, index: usize, mut message: Message) {
        let previous = &self.entries[index];
        message.reactions.extend(previous.reactions.iter().cloned());
        if message.sender.is_none() {
            message.sender = previous.sender.clone();
        }
        self.entries[index] = message;
        self.resort_at(index);
    }

    /// Insert a confirmed message; an entry with the same id is replaced
    pub fn append_confirmed(&mut self, message: Message) {
        match self.position_of(&message.id) {
            Some(index) => {
                self.entries[index] = message;
                self.resort_at(index);
            }
            None => self.insert_sorted(message),
        }
    }

    /// Insert an optimistic message.
    ///
    /// If its confirmed echo already arrived (same sender and content within
    /// the tolerance window) the optimistic copy is absorbed and the echo's
    /// id is returned instead.
    pub fn append_optimistic(&mut self, message: Message) -> MessageId {
        let fingerprint = content_fingerprint(&message.text);
        let echo = self.entries.iter().position(|m| {
            m.id.confirmed().is_some_and(|id| self.unclaimed_echoes.contains_key(id))
                && m.sender_id == message.sender_id
                && self.within_tolerance(m.created_at, message.created_at)
                && content_fingerprint(&m.text) == fingerprint
        });

        if let Some(index) = echo {
            let id = self.entries[index].id.clone();
            self.unclaimed_echoes.remove(id.as_str());
            let reactions = message.reactions;
            self.entries[index].reactions.extend(reactions);
            tracing::debug!("Optimistic message absorbed by confirmed {}", id);
            return id;
        }

        let id = message.id.clone();
        self.insert_sorted(message);
        id
    }

    /// Insert an optimistic message of a send that is about to start.
    ///
    /// Unlike [`append_optimistic`](Self::append_optimistic) it is never
    /// absorbed: its echo cannot have arrived before the insert was issued.
    pub fn push_pending(&mut self, message: Message) -> MessageId {
        let id = message.id.clone();
        self.insert_sorted(message);
        id
    }

    /// Settle a send: reconcile the confirmed row, then drop the send's own
    /// pending entry if the reconcile did not consume it (clock skew beyond
    /// the tolerance, or an identical send matched first).
    pub fn settle_send(&mut self, local_id: &str, confirmed: Message) -> ReconcileOutcome {
        let outcome = self.reconcile(confirmed);
        if self.remove_pending(local_id).is_some() {
            tracing::debug!("Dropped unmatched pending {}", local_id);
        }
        outcome
    }

    /// Merge a confirmed message with its optimistic counterpart, if any
    pub fn reconcile(&mut self, confirmed: Message) -> ReconcileOutcome {
        if let Some(index) = self.position_of(&confirmed.id) {
            self.replace_at(index, confirmed);
            return ReconcileOutcome::Replaced;
        }

        let fingerprint = content_fingerprint(&confirmed.text);
        let candidate = self.entries.iter().position(|m| {
            m.id.is_pending()
                && m.sender_id == confirmed.sender_id
                && self.within_tolerance(m.created_at, confirmed.created_at)
                && content_fingerprint(&m.text) == fingerprint
        });

        match candidate {
            Some(index) => {
                let local_id = self.entries[index].id.as_str().to_string();
                tracing::debug!("Reconciled pending {} with {}", local_id, confirmed.id);
                self.replace_at(index, confirmed);
                ReconcileOutcome::Matched { local_id }
            }
            None => {
                if let Some(id) = confirmed.id.confirmed() {
                    self.track_echo(id, confirmed.created_at);
                }
                self.insert_sorted(confirmed);
                ReconcileOutcome::Inserted
            }
        }
    }

    /// Remember an unmatched echo and forget those too old to match any
    /// optimistic message still to come
    fn track_echo(&mut self, id: &str, created_at: i64) {
        let horizon = created_at - self.tolerance_ms;
        self.unclaimed_echoes.retain(|_, at| *at >= horizon);
        self.unclaimed_echoes.insert(id.to_string(), created_at);
    }

    /// Apply a server update. Reactions are replaced only when the payload
    /// carries them. Returns `false` if the message is not in the log.
    pub fn apply_update(&mut self, update: Message, payload_has_reactions: bool) -> bool {
        let Some(index) = self.position_of(&update.id) else {
            return false;
        };
        let entry = &mut self.entries[index];
        entry.ciphertext = update.ciphertext;
        entry.text = update.text;
        entry.edited_at = update.edited_at;
        if payload_has_reactions {
            entry.reactions = update.reactions;
        }
        if update.deleted {
            entry.tombstone();
        }
        true
    }

    /// Apply an edit, preserving locally held reactions
    pub fn apply_edit(&mut self, edited: Message) -> bool {
        self.apply_update(edited, false)
    }

    /// Tombstone a message in place. Returns the previous version.
    pub fn apply_delete(&mut self, id: &MessageId) -> Option<Message> {
        let index = self.position_of(id)?;
        let previous = self.entries[index].clone();
        self.entries[index].tombstone();
        Some(previous)
    }

    /// Drop a message entirely
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let index = self.position(id)?;
        if let Some(confirmed) = self.entries[index].id.confirmed() {
            self.unclaimed_echoes.remove(confirmed);
        }
        Some(self.entries.remove(index))
    }

    /// Mark a pending message as failed
    pub fn mark_failed(&mut self, local_id: &str, reason: impl Into<String>) -> bool {
        let pending = MessageId::Pending(local_id.to_string());
        match self.position_of(&pending) {
            Some(index) => {
                self.entries[index].status = MessageStatus::Failed { reason: reason.into() };
                true
            }
            None => false,
        }
    }

    /// Remove a pending message (rollback)
    pub fn remove_pending(&mut self, local_id: &str) -> Option<Message> {
        let index = self.position_of(&MessageId::Pending(local_id.to_string()))?;
        Some(self.entries.remove(index))
    }

    /// Set the status of a pending message
    pub fn set_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        match self.position_of(id) {
            Some(index) => {
                self.entries[index].status = status;
                true
            }
            None => false,
        }
    }

    /// Toggle a reaction. Returns `Some(true)` if added, `None` if the
    /// message is not in the log.
    pub fn toggle_reaction(&mut self, id: &str, user_id: &str, symbol: &str) -> Option<bool> {
        let index = self.position(id)?;
        Some(self.entries[index].toggle_reaction(user_id, symbol))
    }

    /// Merge a page of confirmed messages
    pub fn merge_page(&mut self, page: Vec<Message>) {
        for message in page {
            self.append_confirmed(message);
        }
    }
}

/// Message logs of every loaded conversation
#[derive(Debug, Clone)]
pub struct MessageStore {
    logs: HashMap<String, MessageLog>,
    tolerance_ms: i64,
}

impl MessageStore {
    /// Create an empty store
    pub fn new(tolerance_ms: i64) -> Self {
        Self {
            logs: HashMap::new(),
            tolerance_ms,
        }
    }

    /// The log of a conversation, if loaded
    pub fn log(&self, conversation_id: &str) -> Option<&MessageLog> {
        self.logs.get(conversation_id)
    }

    /// The log of a conversation, created on first use
    pub fn log_mut(&mut self, conversation_id: &str) -> &mut MessageLog {
        let tolerance = self.tolerance_ms;
        self.logs
            .entry(conversation_id.to_string())
            .or_insert_with(|| MessageLog::new(tolerance))
    }

    /// Forget a conversation's log
    pub fn remove(&mut self, conversation_id: &str) -> Option<MessageLog> {
        self.logs.remove(conversation_id)
    }

    /// Messages of a conversation (empty if not loaded)
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.logs
            .get(conversation_id)
            .map(|log| log.entries().to_vec())
            .unwrap_or_default()
    }

    /// Find the log holding message `id`
    pub fn find(&self, id: &str) -> Option<(&str, &Message)> {
        self.logs
            .iter()
            .find_map(|(conversation_id, log)| log.get(id).map(|m| (conversation_id.as_str(), m)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Reaction;

    const TOLERANCE: i64 = 10_000;

    fn confirmed(id: &str, sender: &str, text: &str, at: i64) -> Message {
        let mut m = Message::optimistic("c1", sender, text, at);
        m.id = MessageId::Confirmed(id.into());
        m.status = MessageStatus::Sent;
        m
    }

    fn assert_ordered(log: &MessageLog) {
        for pair in log.entries().windows(2) {
            assert!(pair[0].sort_key() <= pair[1].sort_key());
        }
    }

    #[test]
    fn test_optimistic_then_echo_collapses() {
        let mut log = MessageLog::new(TOLERANCE);
        let local = Message::optimistic("c1", "alice", "hello", 1_000);
        let local_id = log.append_optimistic(local);

        let outcome = log.reconcile(confirmed("s1", "alice", "hello", 3_000));
        assert_eq!(outcome, ReconcileOutcome::Matched { local_id: local_id.as_str().to_string() });
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].id, MessageId::Confirmed("s1".into()));
        assert_eq!(log.entries()[0].status, MessageStatus::Sent);
    }

    #[test]
    fn test_echo_then_optimistic_collapses() {
        let mut log = MessageLog::new(TOLERANCE);
        assert_eq!(log.reconcile(confirmed("s1", "alice", "hello", 3_000)), ReconcileOutcome::Inserted);

        let id = log.append_optimistic(Message::optimistic("c1", "alice", "hello", 1_000));
        assert_eq!(id, MessageId::Confirmed("s1".into()));
        assert_eq!(log.len(), 1);

        // The send's own result arriving afterwards is idempotent
        assert_eq!(log.reconcile(confirmed("s1", "alice", "hello", 3_000)), ReconcileOutcome::Replaced);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_unclaimed_echoes_stay_within_window() {
        let mut log = MessageLog::new(TOLERANCE);
        for i in 0..100 {
            let id = format!("s{}", i);
            log.reconcile(confirmed(&id, "bob", "chatter", i * 1_000));
        }
        assert_eq!(log.len(), 100);
        // Only echoes within the last TOLERANCE ms are kept
        assert_eq!(log.unclaimed_echoes.len(), 11);
        assert!(log.unclaimed_echoes.contains_key("s99"));
        assert!(!log.unclaimed_echoes.contains_key("s0"));

        // A recent echo can still absorb a matching optimistic send
        let id = log.append_optimistic(Message::optimistic("c1", "bob", "chatter", 99_500));
        assert!(!id.is_pending());
        assert_eq!(log.len(), 100);
    }

    #[test]
    fn test_outside_tolerance_is_not_matched() {
        let mut log = MessageLog::new(TOLERANCE);
        log.append_optimistic(Message::optimistic("c1", "alice", "hello", 1_000));
        let outcome = log.reconcile(confirmed("s1", "alice", "hello", 1_000 + TOLERANCE + 1));
        assert_eq!(outcome, ReconcileOutcome::Inserted);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_different_sender_or_content_is_not_matched() {
        let mut log = MessageLog::new(TOLERANCE);
        log.append_optimistic(Message::optimistic("c1", "alice", "hello", 1_000));
        assert_eq!(log.reconcile(confirmed("s1", "bob", "hello", 1_500)), ReconcileOutcome::Inserted);
        assert_eq!(log.reconcile(confirmed("s2", "alice", "hello!", 1_500)), ReconcileOutcome::Inserted);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_identical_sends_match_one_each() {
        let mut log = MessageLog::new(TOLERANCE);
        log.append_optimistic(Message::optimistic("c1", "alice", "ok", 1_000));
        log.append_optimistic(Message::optimistic("c1", "alice", "ok", 1_100));

        assert!(matches!(log.reconcile(confirmed("s1", "alice", "ok", 1_200)), ReconcileOutcome::Matched { .. }));
        assert!(matches!(log.reconcile(confirmed("s2", "alice", "ok", 1_300)), ReconcileOutcome::Matched { .. }));
        assert_eq!(log.len(), 2);
        assert_eq!(log.confirmed_count(), 2);
    }

    #[test]
    fn test_page_messages_do_not_absorb_new_sends() {
        let mut log = MessageLog::new(TOLERANCE);
        log.merge_page(vec![confirmed("s1", "alice", "ok", 1_000)]);
        let id = log.append_optimistic(Message::optimistic("c1", "alice", "ok", 2_000));
        assert!(id.is_pending());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_realtime_insert_is_idempotent() {
        let mut log = MessageLog::new(TOLERANCE);
        log.reconcile(confirmed("s1", "bob", "hey", 1_000));
        log.reconcile(confirmed("s1", "bob", "hey", 1_000));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_order_is_maintained() {
        let mut log = MessageLog::new(TOLERANCE);
        log.append_confirmed(confirmed("s3", "bob", "c", 3_000));
        log.append_confirmed(confirmed("s1", "bob", "a", 1_000));
        log.append_confirmed(confirmed("s2", "bob", "b", 1_000));
        log.append_optimistic(Message::optimistic("c1", "alice", "d", 2_000));
        assert_ordered(&log);

        // The confirmed timestamp moves the entry past s3
        log.reconcile(confirmed("s4", "alice", "d", 4_000));
        assert_ordered(&log);
        assert_eq!(log.last().unwrap().id, MessageId::Confirmed("s4".into()));
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn test_reconcile_keeps_local_reactions() {
        let mut log = MessageLog::new(TOLERANCE);
        let mut local = Message::optimistic("c1", "alice", "vote?", 1_000);
        local.toggle_reaction("alice", "👍");
        log.append_optimistic(local);

        log.reconcile(confirmed("s1", "alice", "vote?", 1_200));
        assert!(log.entries()[0].reactions.contains(&Reaction::new("alice", "👍")));
    }

    #[test]
    fn test_update_without_reactions_preserves_local_ones() {
        let mut log = MessageLog::new(TOLERANCE);
        log.append_confirmed(confirmed("s1", "alice", "v1", 1_000));
        log.toggle_reaction("s1", "bob", "🔥");

        let mut edited = confirmed("s1", "alice", "v2", 1_000);
        edited.edited_at = Some(2_000);
        assert!(log.apply_edit(edited));
        let entry = log.get("s1").unwrap();
        assert_eq!(entry.text, "v2");
        assert_eq!(entry.reactions.len(), 1);

        let update = confirmed("s1", "alice", "v2", 1_000);
        assert!(log.apply_update(update, true));
        assert!(log.get("s1").unwrap().reactions.is_empty());

        assert!(!log.apply_update(confirmed("nope", "alice", "x", 0), true));
    }

    #[test]
    fn test_delete_keeps_position() {
        let mut log = MessageLog::new(TOLERANCE);
        log.append_confirmed(confirmed("s1", "alice", "a", 1_000));
        log.append_confirmed(confirmed("s2", "alice", "b", 2_000));
        log.append_confirmed(confirmed("s3", "alice", "c", 3_000));

        let previous = log.apply_delete(&MessageId::Confirmed("s2".into())).unwrap();
        assert_eq!(previous.text, "b");
        assert_eq!(log.len(), 3);
        assert!(log.entries()[1].deleted);
        assert!(log.entries()[1].text.is_empty());

        // Rollback restores the original
        log.append_confirmed(previous);
        assert_eq!(log.entries()[1].text, "b");
    }

    #[test]
    fn test_failed_and_rolled_back_sends() {
        let mut log = MessageLog::new(TOLERANCE);
        let id = log.append_optimistic(Message::optimistic("c1", "alice", "hi", 1_000));
        assert!(log.mark_failed(id.as_str(), "offline"));
        assert!(matches!(log.entries()[0].status, MessageStatus::Failed { .. }));

        assert!(log.remove_pending(id.as_str()).is_some());
        assert!(log.is_empty());
        assert!(!log.mark_failed(id.as_str(), "gone"));
    }

    #[test]
    fn test_settle_send_with_skewed_clock() {
        let mut log = MessageLog::new(TOLERANCE);
        let local = log.push_pending(Message::optimistic("c1", "alice", "hi", 1_000));

        // Echo stamped far outside the window arrives first
        let late = 1_000 + TOLERANCE * 3;
        assert_eq!(log.reconcile(confirmed("s1", "alice", "hi", late)), ReconcileOutcome::Inserted);
        assert_eq!(log.len(), 2);

        assert_eq!(
            log.settle_send(local.as_str(), confirmed("s1", "alice", "hi", late)),
            ReconcileOutcome::Replaced
        );
        assert_eq!(log.len(), 1);
        assert_eq!(log.confirmed_count(), 1);
    }

    #[test]
    fn test_push_pending_is_never_absorbed() {
        let mut log = MessageLog::new(TOLERANCE);
        log.reconcile(confirmed("s1", "alice", "ok", 1_000));
        let id = log.push_pending(Message::optimistic("c1", "alice", "ok", 1_500));
        assert!(id.is_pending());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_store_logs_are_independent() {
        let mut store = MessageStore::new(TOLERANCE);
        store.log_mut("c1").append_confirmed(confirmed("s1", "alice", "a", 1));
        store.log_mut("c2");
        assert_eq!(store.messages("c1").len(), 1);
        assert!(store.messages("c2").is_empty());
        assert!(store.messages("c3").is_empty());
        assert_eq!(store.find("s1").map(|(c, _)| c), Some("c1"));
        assert!(store.remove("c1").is_some());
        assert!(store.log("c1").is_none());
    }
}

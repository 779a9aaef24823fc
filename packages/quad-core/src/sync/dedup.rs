//! Conversation Deduplicator.
//!
//! The same conversation can reach the list through more than one path
//! (ledger, overview, placeholder). The arena keeps exactly one record per
//! id, preferring the richer representation.

use std::collections::HashMap;

use crate::model::{Conversation, ConversationKind};

/// How much of a conversation a record carries
pub fn richness_score(conversation: &Conversation) -> u32 {
    let mut score = 0;
    if !conversation.kind.is_direct() {
        score += 10;
    }
    if conversation.kind == ConversationKind::Team || conversation.team_id.is_some() {
        score += 5;
    }
    if conversation.kind == ConversationKind::Recruitment || conversation.recruitment_id.is_some() {
        score += 5;
    }
    if conversation.name.as_deref().is_some_and(|n| !n.is_empty()) {
        score += 2;
    }
    score += conversation.members.len() as u32;
    if conversation.last_message.is_some() {
        score += 3;
    }
    score
}

/// Id-keyed arena of conversations
#[derive(Debug, Default)]
pub struct ConversationArena {
    index: HashMap<String, usize>,
    items: Vec<Conversation>,
}

impl ConversationArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. An existing record with the same id is replaced only
    /// if the new one scores strictly higher. Returns whether it was kept.
    pub fn insert(&mut self, conversation: Conversation) -> bool {
        match self.index.get(&conversation.id) {
            Some(&slot) => {
                if richness_score(&conversation) > richness_score(&self.items[slot]) {
                    self.items[slot] = conversation;
                    true
                } else {
                    false
                }
            }
            None => {
                self.index.insert(conversation.id.clone(), self.items.len());
                self.items.push(conversation);
                true
            }
        }
    }

    /// Number of distinct ids
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Records sorted by most recent activity, then id
    pub fn into_sorted(self) -> Vec<Conversation> {
        let mut items = self.items;
        sort_by_activity(&mut items);
        items
    }
}

/// Order conversations by most recent activity, then id
pub fn sort_by_activity(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        b.activity_at()
            .cmp(&a.activity_at())
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Keep one record per id, newest activity first
pub fn deduplicate(conversations: impl IntoIterator<Item = Conversation>) -> Vec<Conversation> {
    let mut arena = ConversationArena::new();
    for conversation in conversations {
        arena.insert(conversation);
    }
    arena.into_sorted()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LastMessage, Member, Role};

    fn conversation(id: &str, kind: ConversationKind, created_at: i64) -> Conversation {
        Conversation {
            id: id.into(),
            kind,
            name: None,
            team_id: None,
            recruitment_id: None,
            admin_only: false,
            created_at,
            archived: false,
            last_message: None,
            unread_count: 0,
            members: vec![],
            partner: None,
            placeholder: false,
        }
    }

    fn last(at: i64) -> Option<LastMessage> {
        Some(LastMessage {
            message_id: "m".into(),
            sender_id: "u".into(),
            preview: "p".into(),
            at,
        })
    }

    #[test]
    fn test_scores() {
        let direct = conversation("d", ConversationKind::Direct, 0);
        assert_eq!(richness_score(&direct), 0);

        let mut team = conversation("t", ConversationKind::Team, 0);
        team.team_id = Some("team-1".into());
        team.name = Some("Robotics".into());
        team.members = vec![Member::new("t", "a", Role::Owner), Member::new("t", "b", Role::Member)];
        team.last_message = last(1);
        assert_eq!(richness_score(&team), 10 + 5 + 2 + 2 + 3);
    }

    #[test]
    fn test_keeps_richer_record() {
        let sparse = conversation("c1", ConversationKind::Group, 0);
        let mut rich = conversation("c1", ConversationKind::Group, 0);
        rich.name = Some("Study".into());

        let out = deduplicate(vec![sparse.clone(), rich.clone()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name.as_deref(), Some("Study"));

        // Order does not matter
        let out = deduplicate(vec![rich, sparse]);
        assert_eq!(out[0].name.as_deref(), Some("Study"));
    }

    #[test]
    fn test_ties_keep_first_seen() {
        let mut first = conversation("c1", ConversationKind::Group, 0);
        first.archived = true;
        let second = conversation("c1", ConversationKind::Group, 0);
        let out = deduplicate(vec![first, second]);
        assert!(out[0].archived);
    }

    #[test]
    fn test_sorted_by_recency() {
        let old = conversation("a", ConversationKind::Group, 100);
        let mut active = conversation("b", ConversationKind::Group, 50);
        active.last_message = last(500);
        let new = conversation("c", ConversationKind::Group, 200);

        let out = deduplicate(vec![old, active, new]);
        let ids: Vec<_> = out.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_arena_len() {
        let mut arena = ConversationArena::new();
        assert!(arena.insert(conversation("a", ConversationKind::Group, 0)));
        assert!(!arena.insert(conversation("a", ConversationKind::Group, 0)));
        assert!(arena.insert(conversation("b", ConversationKind::Direct, 0)));
        assert_eq!(arena.len(), 2);
    }
}

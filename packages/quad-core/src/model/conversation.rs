//! Conversation records.

use serde::{Deserialize, Serialize};

use super::member::Member;
use crate::identity::Profile;

/// The kind of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// Two-party conversation
    Direct,
    /// Ad-hoc group
    Group,
    /// Linked to a team
    Team,
    /// Linked to a recruitment posting
    Recruitment,
}

impl ConversationKind {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
            ConversationKind::Team => "team",
            ConversationKind::Recruitment => "recruitment",
        }
    }

    /// Parse the storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ConversationKind::Direct),
            "group" => Some(ConversationKind::Group),
            "team" => Some(ConversationKind::Team),
            "recruitment" => Some(ConversationKind::Recruitment),
            _ => None,
        }
    }

    /// Whether this is a two-party conversation
    pub fn is_direct(&self) -> bool {
        matches!(self, ConversationKind::Direct)
    }
}

/// Summary of the newest message, as shown in the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    /// Server id of the message
    pub message_id: String,
    /// Author
    pub sender_id: String,
    /// Decoded, truncated text
    pub preview: String,
    /// Creation time (Unix ms)
    pub at: i64,
}

/// The other participant of a direct conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partner {
    /// Partner user id
    pub user_id: String,
    /// Partner profile as carried by the overview feed
    pub profile: Profile,
}

/// A hydrated conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation id
    pub id: String,
    /// Kind
    pub kind: ConversationKind,
    /// Display name (groups and entity-linked conversations)
    pub name: Option<String>,
    /// Linked team, for `Team` conversations
    pub team_id: Option<String>,
    /// Linked recruitment posting, for `Recruitment` conversations
    pub recruitment_id: Option<String>,
    /// Only owners/admins may post (derived from the roster)
    pub admin_only: bool,
    /// Creation time (Unix ms)
    pub created_at: i64,
    /// Archived by the viewer
    pub archived: bool,
    /// Newest message summary
    pub last_message: Option<LastMessage>,
    /// Unread messages for the viewer
    pub unread_count: u32,
    /// Roster
    pub members: Vec<Member>,
    /// Partner (direct only)
    pub partner: Option<Partner>,
    /// Client-only record synthesized from the overview feed
    pub placeholder: bool,
}

impl Conversation {
    /// The most recent activity time, used for list ordering
    pub fn activity_at(&self) -> i64 {
        self.last_message
            .as_ref()
            .map(|m| m.at.max(self.created_at))
            .unwrap_or(self.created_at)
    }

    /// Look up a member by user id
    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// Mutable lookup of a member by user id
    pub fn member_mut(&mut self, user_id: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.user_id == user_id)
    }

    /// Name to show in the list: explicit name, then partner name, then id
    pub fn display_name(&self) -> &str {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name;
        }
        if let Some(partner) = &self.partner {
            if !partner.profile.name.is_empty() {
                return &partner.profile.name;
            }
        }
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(created_at: i64) -> Conversation {
        Conversation {
            id: "c1".into(),
            kind: ConversationKind::Group,
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

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            ConversationKind::Direct,
            ConversationKind::Group,
            ConversationKind::Team,
            ConversationKind::Recruitment,
        ] {
            assert_eq!(ConversationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ConversationKind::parse("channel"), None);
    }

    #[test]
    fn test_activity_prefers_last_message() {
        let mut conv = conversation(100);
        assert_eq!(conv.activity_at(), 100);

        conv.last_message = Some(LastMessage {
            message_id: "m1".into(),
            sender_id: "u1".into(),
            preview: "hi".into(),
            at: 500,
        });
        assert_eq!(conv.activity_at(), 500);
    }

    #[test]
    fn test_display_name_falls_back_to_partner() {
        let mut conv = conversation(0);
        conv.kind = ConversationKind::Direct;
        conv.partner = Some(Partner {
            user_id: "bob".into(),
            profile: Profile {
                name: "Bob".into(),
                handle: "bob".into(),
                avatar: None,
            },
        });
        assert_eq!(conv.display_name(), "Bob");

        conv.name = Some("Study group".into());
        assert_eq!(conv.display_name(), "Study group");
    }
}

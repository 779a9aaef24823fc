//! Conversation members and roles.

use serde::{Deserialize, Serialize};

use crate::identity::Profile;

/// Member role, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Created the conversation
    Owner,
    /// Full management rights
    Admin,
    /// Can manage messages
    Moderator,
    /// Regular participant
    Member,
}

impl Role {
    /// Numeric rank; higher outranks lower
    pub fn rank(&self) -> u8 {
        match self {
            Role::Owner => 3,
            Role::Admin => 2,
            Role::Moderator => 1,
            Role::Member => 0,
        }
    }

    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::Member => "member",
        }
    }

    /// Parse the storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "moderator" => Some(Role::Moderator),
            "member" => Some(Role::Member),
            _ => None,
        }
    }

    /// Owners and admins
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

/// A member of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Conversation id
    pub conversation_id: String,
    /// User id
    pub user_id: String,
    /// Role
    pub role: Role,
    /// May post messages (only meaningful in admin-only conversations)
    pub can_post: bool,
    /// May change roles, mute and ban
    pub can_manage_members: bool,
    /// May edit/delete other members' messages
    pub can_manage_messages: bool,
    /// Muted until (Unix ms)
    pub mute_expires_at: Option<i64>,
    /// Last read marker (Unix ms)
    pub last_read_at: Option<i64>,
    /// Profile overlaid from the identity cache
    pub profile: Option<Profile>,
}

impl Member {
    /// Create a member with the default rights of `role`
    pub fn new(conversation_id: impl Into<String>, user_id: impl Into<String>, role: Role) -> Self {
        let mut member = Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            role,
            can_post: true,
            can_manage_members: false,
            can_manage_messages: false,
            mute_expires_at: None,
            last_read_at: None,
            profile: None,
        };
        member.apply_role_defaults();
        member
    }

    /// Reset management rights to the defaults of the current role
    pub fn apply_role_defaults(&mut self) {
        let (members, messages) = match self.role {
            Role::Owner | Role::Admin => (true, true),
            Role::Moderator => (false, true),
            Role::Member => (false, false),
        };
        self.can_manage_members = members;
        self.can_manage_messages = messages;
        if self.role.is_admin() {
            self.can_post = true;
        }
    }
}

//! Member management and conversation lifecycle.

use super::{ChatSession, Shared, SyncEvent};
use crate::error::{Error, Result};
use crate::model::{Member, Role};
use crate::sync::{check_privileged, derive_admin_only, PrivilegedAction};

impl Shared {
    /// Check, apply optimistically, persist, and roll back on failure
    async fn moderate(&self, conversation_id: &str, user_id: &str, action: PrivilegedAction) -> Result<()> {
        let conversation = self.conversation(conversation_id)?;
        if conversation.placeholder {
            return Err(Error::ReadOnlyConversation);
        }
        let actor = conversation.member(&self.viewer).ok_or(Error::NotMember)?;
        let target = conversation
            .member(user_id)
            .ok_or_else(|| Error::InvalidOperation(format!("{} is not a member", user_id)))?;
        check_privileged(actor, target, &action)?;

        let previous = target.clone();
        let updated = match &action {
            PrivilegedAction::ChangeRole { to } => {
                let mut m = previous.clone();
                m.role = *to;
                m.apply_role_defaults();
                Some(m)
            }
            PrivilegedAction::SetPosting(allowed) => {
                let mut m = previous.clone();
                m.can_post = *allowed;
                Some(m)
            }
            PrivilegedAction::Mute { until } => {
                if *until <= self.now() {
                    return Err(Error::InvalidOperation("Mute must end in the future".into()));
                }
                let mut m = previous.clone();
                m.mute_expires_at = Some(*until);
                Some(m)
            }
            PrivilegedAction::Unmute => {
                let mut m = previous.clone();
                m.mute_expires_at = None;
                Some(m)
            }
            PrivilegedAction::Ban => None,
        };

        self.replace_member(conversation_id, user_id, updated.clone());
        tracing::debug!("{:?} on {} in {}", action, user_id, conversation_id);

        let result = match &updated {
            Some(member) => self.backend.update_member(&self.viewer, member).await,
            None => self.backend.remove_member(&self.viewer, conversation_id, user_id).await,
        };

        if let Err(e) = result {
            tracing::info!("{:?} on {} rejected, rolling back: {}", action, user_id, e);
            self.replace_member(conversation_id, user_id, Some(previous));
            self.notice(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Swap one roster entry (`None` removes it) and re-derive admin-only
    fn replace_member(&self, conversation_id: &str, user_id: &str, member: Option<Member>) {
        {
            let mut state = self.state.write();
            let Some(conversation) = state.conversation_mut(conversation_id) else {
                return;
            };
            match (conversation.members.iter().position(|m| m.user_id == user_id), member) {
                (Some(i), Some(member)) => conversation.members[i] = member,
                (Some(i), None) => {
                    conversation.members.remove(i);
                }
                (None, Some(member)) => conversation.members.push(member),
                (None, None) => {}
            }
            conversation.admin_only = derive_admin_only(&conversation.members);
        }
        self.emit(SyncEvent::ConversationsChanged);
    }

    /// Drop a conversation from local state
    fn forget_conversation(&self, conversation_id: &str) {
        let was_open = {
            let mut state = self.state.write();
            state.conversations.retain(|c| c.id != conversation_id);
            let was_open = state.open.as_deref() == Some(conversation_id);
            if was_open {
                state.open = None;
            }
            was_open
        };
        if was_open {
            self.bridge.unwatch_conversation();
        }
        self.messages.lock().remove(conversation_id);
        self.emit(SyncEvent::ConversationsChanged);
    }
}

impl ChatSession {
    /// Give a member another role; their management rights follow the role
    pub async fn change_role(&self, conversation_id: &str, user_id: &str, role: Role) -> Result<()> {
        self.shared
            .moderate(conversation_id, user_id, PrivilegedAction::ChangeRole { to: role })
            .await
    }

    /// Grant or revoke a member's right to post in an admin-only
    /// conversation
    pub async fn set_member_posting(&self, conversation_id: &str, user_id: &str, allowed: bool) -> Result<()> {
        self.shared
            .moderate(conversation_id, user_id, PrivilegedAction::SetPosting(allowed))
            .await
    }

    /// Mute a member until `until` (Unix ms)
    pub async fn mute_member(&self, conversation_id: &str, user_id: &str, until: i64) -> Result<()> {
        self.shared
            .moderate(conversation_id, user_id, PrivilegedAction::Mute { until })
            .await
    }

    /// Lift a member's mute
    pub async fn unmute_member(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.shared
            .moderate(conversation_id, user_id, PrivilegedAction::Unmute)
            .await
    }

    /// Remove a member from the conversation
    pub async fn ban_member(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.shared
            .moderate(conversation_id, user_id, PrivilegedAction::Ban)
            .await
    }

    /// Leave a conversation. The owner of a group must hand over ownership
    /// first.
    pub async fn leave_conversation(&self, conversation_id: &str) -> Result<()> {
        let shared = &self.shared;
        let conversation = shared.conversation(conversation_id)?;
        if conversation.placeholder {
            return Err(Error::ReadOnlyConversation);
        }
        let me = conversation.member(&shared.viewer).ok_or(Error::NotMember)?;
        if me.role == Role::Owner && !conversation.kind.is_direct() {
            return Err(Error::InvalidOperation(
                "Owner cannot leave. Transfer ownership first.".into(),
            ));
        }

        if let Err(e) = shared.backend.leave_conversation(conversation_id, &shared.viewer).await {
            shared.notice(e.clone());
            return Err(e);
        }
        tracing::info!("{} left {}", shared.viewer, conversation_id);
        shared.forget_conversation(conversation_id);
        Ok(())
    }

    /// Delete a conversation for everyone. Groups can only be deleted by
    /// their owner; either participant may delete a direct conversation.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let shared = &self.shared;
        let conversation = shared.conversation(conversation_id)?;
        if conversation.placeholder {
            return Err(Error::ReadOnlyConversation);
        }
        let me = conversation.member(&shared.viewer).ok_or(Error::NotMember)?;
        if !conversation.kind.is_direct() && me.role != Role::Owner {
            return Err(Error::PermissionDenied(
                "Only the owner can delete this conversation".into(),
            ));
        }

        if let Err(e) = shared.backend.delete_conversation(conversation_id).await {
            shared.notice(e.clone());
            return Err(e);
        }
        tracing::info!("{} deleted {}", shared.viewer, conversation_id);
        shared.forget_conversation(conversation_id);
        Ok(())
    }

    /// Find or create the direct conversation with `partner` and make sure
    /// it is in the list. Returns its id.
    pub async fn start_direct_conversation(&self, partner: &str) -> Result<String> {
        let shared = &self.shared;
        if partner == shared.viewer {
            return Err(Error::InvalidOperation(
                "A direct conversation needs two distinct users".into(),
            ));
        }
        let id = match shared.backend.ensure_direct_conversation(&shared.viewer, partner).await {
            Ok(id) => id,
            Err(e) => {
                shared.notice(e.clone());
                return Err(e);
            }
        };
        if shared.conversation(&id).is_err() {
            shared.refresh_conversations().await?;
        }
        Ok(id)
    }

    /// Clear mutes that have run out, on the server and in the local list.
    /// Returns how many the server cleared.
    pub async fn sweep_expired_mutes(&self) -> Result<usize> {
        let shared = &self.shared;
        let now = shared.now();
        let cleared = shared.backend.sweep_expired_mutes(now).await?;

        let mut changed = false;
        {
            let mut state = shared.state.write();
            for member in state.conversations.iter_mut().flat_map(|c| c.members.iter_mut()) {
                if member.mute_expires_at.is_some_and(|until| until <= now) {
                    member.mute_expires_at = None;
                    changed = true;
                }
            }
        }
        if changed {
            shared.emit(SyncEvent::ConversationsChanged);
        }
        tracing::debug!("Swept {} expired mutes", cleared);
        Ok(cleared)
    }
}

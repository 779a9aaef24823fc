//! # Permission Evaluator
//!
//! Pure checks over hydrated rosters. Nothing here touches the network; the
//! server re-checks every mutation and answers `PermissionDenied` when the
//! client's view was stale.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       PERMISSION EVALUATION                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  can_post:                                                              │
//! │    placeholder conversation          → no (read-only)                  │
//! │    admin_only && !member.can_post    → no                               │
//! │    mute_expires_at > now             → no                               │
//! │    otherwise                         → yes                              │
//! │                                                                         │
//! │  privileged (role change, posting, mute, ban):                          │
//! │    actor lacks can_manage_members    → PermissionDenied                 │
//! │    actor targets self to downgrade,                                     │
//! │      mute, restrict or ban           → CannotModifySelf                 │
//! │    target is owner, actor is not     → CannotModifyOwner                │
//! │    promoting to owner, actor is not  → PermissionDenied                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{Error, Result};
use crate::model::{Conversation, Member, Message, Role};

/// A member-management action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivilegedAction {
    /// Change the target's role
    ChangeRole {
        /// New role
        to: Role,
    },
    /// Grant or revoke the posting right
    SetPosting(bool),
    /// Mute until the given time (Unix ms)
    Mute {
        /// Expiry
        until: i64,
    },
    /// Lift a mute
    Unmute,
    /// Remove from the conversation
    Ban,
}

/// Whether the member is muted at `now`
pub fn is_muted(member: &Member, now: i64) -> bool {
    member.mute_expires_at.is_some_and(|t| t > now)
}

/// Whether the member may post in the conversation at `now`
pub fn can_post(member: &Member, conversation: &Conversation, now: i64) -> bool {
    !conversation.placeholder
        && (!conversation.admin_only || member.can_post)
        && !is_muted(member, now)
}

/// Like [`can_post`], with the reason for a refusal
pub fn check_can_post(member: Option<&Member>, conversation: &Conversation, now: i64) -> Result<()> {
    if conversation.placeholder {
        return Err(Error::ReadOnlyConversation);
    }
    let member = member.ok_or(Error::NotMember)?;
    if conversation.admin_only && !member.can_post {
        return Err(Error::PostingRestricted);
    }
    if let Some(until) = member.mute_expires_at.filter(|t| *t > now) {
        return Err(Error::Muted { until });
    }
    Ok(())
}

/// Whether `actor` may edit or delete `message`
pub fn can_manage_message(actor: &Member, message: &Message) -> bool {
    message.sender_id == actor.user_id || actor.can_manage_messages
}

/// Check a member-management action of `actor` on `target`
pub fn check_privileged(actor: &Member, target: &Member, action: &PrivilegedAction) -> Result<()> {
    if !actor.can_manage_members {
        return Err(Error::PermissionDenied(
            "Managing members requires the member management right".into(),
        ));
    }

    if actor.user_id == target.user_id {
        match action {
            PrivilegedAction::ChangeRole { to } if to.rank() < actor.role.rank() => {
                return Err(Error::CannotModifySelf);
            }
            PrivilegedAction::ChangeRole { to } if *to != actor.role => {
                return Err(Error::PermissionDenied("You cannot promote yourself".into()));
            }
            PrivilegedAction::SetPosting(false)
            | PrivilegedAction::Mute { .. }
            | PrivilegedAction::Ban => return Err(Error::CannotModifySelf),
            _ => {}
        }
        return Ok(());
    }

    if target.role == Role::Owner && actor.role != Role::Owner {
        return Err(Error::CannotModifyOwner);
    }

    if let PrivilegedAction::ChangeRole { to: Role::Owner } = action {
        if actor.role != Role::Owner {
            return Err(Error::PermissionDenied("Only the owner can transfer ownership".into()));
        }
    }

    Ok(())
}

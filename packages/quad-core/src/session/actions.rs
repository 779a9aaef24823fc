//! Message actions.
//!
//! Every action checks permissions against the hydrated roster first and
//! makes no network call when the check fails. Accepted actions are applied
//! optimistically and undone if the server rejects them.

use super::{ChatSession, Shared, SyncEvent};
use crate::error::{Error, Result};
use crate::messaging::hydrate_message;
use crate::model::{Message, MessageId, MessageStatus};
use crate::storage::NewMessage;
use crate::sync::{can_manage_message, check_can_post};

impl Shared {
    /// Persist the viewer's read marker without waiting for it
    pub(crate) fn mark_read_in_background(&self, conversation_id: &str) {
        let backend = self.backend.clone();
        let viewer = self.viewer.clone();
        let id = conversation_id.to_string();
        let at = self.now();
        tokio::spawn(async move {
            if let Err(e) = backend.update_last_read(&id, &viewer, at).await {
                tracing::warn!("Could not update read marker of {}: {}", id, e);
            }
        });
    }

    fn clear_unread(&self, conversation_id: &str) -> bool {
        let mut state = self.state.write();
        match state.conversation_mut(conversation_id) {
            Some(c) if c.unread_count > 0 => {
                c.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    fn messages_changed(&self, conversation_id: &str) {
        self.emit(SyncEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
        });
    }

    /// Loaded, confirmed, not deleted
    fn live_message(&self, message_id: &str) -> Result<(String, Message)> {
        let (conversation_id, message) = self.find_message(message_id)?;
        if message.id.is_pending() {
            return Err(Error::InvalidOperation("Message has not been sent yet".into()));
        }
        if message.deleted {
            return Err(Error::InvalidOperation("Message was deleted".into()));
        }
        Ok((conversation_id, message))
    }

    async fn post(
        &self,
        conversation_id: &str,
        text: &str,
        reply_to: Option<String>,
        forwarded_from: Option<String>,
    ) -> Result<MessageId> {
        if text.trim().is_empty() {
            return Err(Error::InvalidMessageContent("Message cannot be empty".into()));
        }
        let conversation = self.conversation(conversation_id)?;
        let now = self.now();
        check_can_post(conversation.member(&self.viewer), &conversation, now)?;

        let ciphertext = self.cipher.encode(text)?;
        let mut local = Message::optimistic(conversation_id, &self.viewer, text, now);
        local.ciphertext = ciphertext.clone();
        local.reply_to = reply_to.clone();
        local.forwarded_from = forwarded_from.clone();
        local.sender = self.identities.get(&self.viewer);

        let local_id = self.messages.lock().log_mut(conversation_id).push_pending(local);
        self.messages_changed(conversation_id);

        let request = NewMessage {
            conversation_id: conversation_id.to_string(),
            sender_id: self.viewer.clone(),
            ciphertext,
            reply_to,
            forwarded_from,
        };
        self.submit(conversation_id, local_id.as_str(), request).await
    }

    /// Insert a pending message and settle it against the result
    async fn submit(&self, conversation_id: &str, local_id: &str, request: NewMessage) -> Result<MessageId> {
        match self.backend.insert_message(request).await {
            Ok(row) => {
                let mut confirmed = hydrate_message(row, self.cipher.as_ref());
                confirmed.sender = self.identities.get(&self.viewer);
                let id = confirmed.id.clone();

                let outcome = self
                    .messages
                    .lock()
                    .log_mut(conversation_id)
                    .settle_send(local_id, confirmed.clone());
                tracing::debug!("Sent {} as {} ({:?})", local_id, id, outcome);

                self.bump_summary(&confirmed);
                self.messages_changed(conversation_id);
                self.emit(SyncEvent::ConversationsChanged);
                Ok(id)
            }
            Err(e) if e.requires_rollback() => {
                tracing::info!("Send to {} rejected, rolling back: {}", conversation_id, e);
                self.messages.lock().log_mut(conversation_id).remove_pending(local_id);
                self.messages_changed(conversation_id);
                self.notice(e.clone());
                Err(e)
            }
            Err(e) => {
                self.messages
                    .lock()
                    .log_mut(conversation_id)
                    .mark_failed(local_id, e.to_string());
                self.messages_changed(conversation_id);
                self.notice(e.clone());
                Err(e)
            }
        }
    }
}

impl ChatSession {
    /// Send a message. It shows up immediately as pending and is replaced by
    /// the confirmed message once the server accepts it.
    ///
    /// A rejected permission check makes no network call. A server-side
    /// permission rejection removes the pending message; any other failure
    /// leaves it marked failed for [`retry_message`](Self::retry_message).
    pub async fn send_message(&self, conversation_id: &str, text: &str, reply_to: Option<&str>) -> Result<MessageId> {
        self.shared
            .post(conversation_id, text, reply_to.map(str::to_string), None)
            .await
    }

    /// Resend a failed message
    pub async fn retry_message(&self, local_id: &str) -> Result<MessageId> {
        let shared = &self.shared;
        let (conversation_id, message) = shared.find_message(local_id)?;
        if !message.id.is_pending() || !matches!(message.status, MessageStatus::Failed { .. }) {
            return Err(Error::InvalidOperation("Only failed messages can be retried".into()));
        }

        let conversation = shared.conversation(&conversation_id)?;
        check_can_post(conversation.member(&shared.viewer), &conversation, shared.now())?;

        shared
            .messages
            .lock()
            .log_mut(&conversation_id)
            .set_status(&message.id, MessageStatus::Sending);
        shared.messages_changed(&conversation_id);

        let request = NewMessage {
            conversation_id: conversation_id.clone(),
            sender_id: shared.viewer.clone(),
            ciphertext: message.ciphertext,
            reply_to: message.reply_to,
            forwarded_from: message.forwarded_from,
        };
        shared.submit(&conversation_id, local_id, request).await
    }

    /// Send a copy of a loaded message to another conversation
    pub async fn forward_message(&self, message_id: &str, target_conversation_id: &str) -> Result<MessageId> {
        let (_, source) = self.shared.live_message(message_id)?;
        self.shared
            .post(
                target_conversation_id,
                &source.text,
                None,
                Some(message_id.to_string()),
            )
            .await
    }

    /// Replace the text of one of the viewer's messages
    pub async fn edit_message(&self, message_id: &str, text: &str) -> Result<()> {
        let shared = &self.shared;
        let (conversation_id, original) = shared.live_message(message_id)?;
        if !original.is_outgoing(&shared.viewer) {
            return Err(Error::PermissionDenied("Only the author can edit a message".into()));
        }
        if text.trim().is_empty() {
            return Err(Error::InvalidMessageContent("Message cannot be empty".into()));
        }
        if shared.conversation(&conversation_id)?.placeholder {
            return Err(Error::ReadOnlyConversation);
        }

        let ciphertext = shared.cipher.encode(text)?;
        let now = shared.now();
        let mut edited = original.clone();
        edited.text = text.to_string();
        edited.ciphertext = ciphertext.clone();
        edited.edited_at = Some(now);
        shared.messages.lock().log_mut(&conversation_id).apply_edit(edited);
        shared.messages_changed(&conversation_id);

        match shared.backend.edit_message(message_id, &ciphertext, now).await {
            Ok(row) => {
                let confirmed = hydrate_message(row, shared.cipher.as_ref());
                shared
                    .messages
                    .lock()
                    .log_mut(&conversation_id)
                    .apply_edit(confirmed.clone());
                if shared.is_last_message(&conversation_id, message_id) {
                    shared.bump_summary(&confirmed);
                    shared.emit(SyncEvent::ConversationsChanged);
                }
                shared.messages_changed(&conversation_id);
                Ok(())
            }
            Err(e) => {
                shared.messages.lock().log_mut(&conversation_id).append_confirmed(original);
                shared.messages_changed(&conversation_id);
                shared.notice(e.clone());
                Err(e)
            }
        }
    }

    /// Delete a message. Authors may delete their own; members with the
    /// message management right may delete anyone's. A failed send is
    /// simply discarded.
    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        let shared = &self.shared;
        let (conversation_id, message) = shared.find_message(message_id)?;

        if message.id.is_pending() {
            shared.messages.lock().log_mut(&conversation_id).remove_pending(message_id);
            shared.messages_changed(&conversation_id);
            return Ok(());
        }
        if message.deleted {
            return Ok(());
        }

        let conversation = shared.conversation(&conversation_id)?;
        if conversation.placeholder {
            return Err(Error::ReadOnlyConversation);
        }
        let actor = conversation.member(&shared.viewer).ok_or(Error::NotMember)?;
        if !can_manage_message(actor, &message) {
            return Err(Error::PermissionDenied("You can only delete your own messages".into()));
        }

        let previous = shared
            .messages
            .lock()
            .log_mut(&conversation_id)
            .apply_delete(&message.id);
        shared.messages_changed(&conversation_id);

        match shared.backend.delete_message(message_id).await {
            Ok(()) => {
                if shared.is_last_message(&conversation_id, message_id) {
                    shared.bridge.schedule_list_refresh();
                }
                Ok(())
            }
            Err(e) => {
                if let Some(previous) = previous {
                    shared.messages.lock().log_mut(&conversation_id).append_confirmed(previous);
                }
                shared.messages_changed(&conversation_id);
                shared.notice(e.clone());
                Err(e)
            }
        }
    }

    /// Add the viewer's reaction, or remove it if present. Returns `true`
    /// if it was added.
    pub async fn toggle_reaction(&self, message_id: &str, symbol: &str) -> Result<bool> {
        let shared = &self.shared;
        if symbol.trim().is_empty() {
            return Err(Error::InvalidOperation("Reaction cannot be empty".into()));
        }
        let (conversation_id, _) = shared.live_message(message_id)?;
        let conversation = shared.conversation(&conversation_id)?;
        if conversation.placeholder {
            return Err(Error::ReadOnlyConversation);
        }
        conversation.member(&shared.viewer).ok_or(Error::NotMember)?;

        let added = shared
            .messages
            .lock()
            .log_mut(&conversation_id)
            .toggle_reaction(message_id, &shared.viewer, symbol)
            .ok_or(Error::MessageNotFound)?;
        shared.messages_changed(&conversation_id);

        let result = if added {
            shared.backend.add_reaction(message_id, &shared.viewer, symbol).await
        } else {
            shared.backend.remove_reaction(message_id, &shared.viewer, symbol).await
        };

        match result {
            Ok(()) => Ok(added),
            Err(e) => {
                shared
                    .messages
                    .lock()
                    .log_mut(&conversation_id)
                    .toggle_reaction(message_id, &shared.viewer, symbol);
                shared.messages_changed(&conversation_id);
                shared.notice(e.clone());
                Err(e)
            }
        }
    }

    /// Zero the local unread count and persist the read marker in the
    /// background
    pub fn mark_read(&self, conversation_id: &str) {
        if self.shared.clear_unread(conversation_id) {
            self.shared.emit(SyncEvent::UnreadChanged {
                conversation_id: conversation_id.to_string(),
                unread_count: 0,
            });
        }
        self.shared.mark_read_in_background(conversation_id);
    }
}

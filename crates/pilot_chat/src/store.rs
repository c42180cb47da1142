//! In-memory conversation registry.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use pilot_core::Conversation;

use crate::error::{ChatError, ChatResult};

/// Conversation registry owned by the coordinator.
///
/// Lives for the lifetime of its owner and is emptied by [`clear`]. Locks
/// are held only for the duration of a single call.
///
/// [`clear`]: ConversationStore::clear
#[derive(Default)]
pub struct ConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new conversation and return a snapshot of it.
    pub fn create(&self, workspace_id: &str, user_id: &str) -> Conversation {
        self.insert(Conversation::new(workspace_id, user_id))
    }

    /// Register a conversation, replacing any with the same id.
    pub fn insert(&self, conversation: Conversation) -> Conversation {
        debug!(conversation_id = %conversation.id, "Registering conversation");
        self.conversations
            .write()
            .insert(conversation.id.clone(), conversation.clone());
        conversation
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.conversations.read().get(id).cloned()
    }

    pub fn require(&self, id: &str) -> ChatResult<Conversation> {
        self.get(id)
            .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))
    }

    /// Mutate a conversation in place.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Conversation) -> R) -> ChatResult<R> {
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
        Ok(f(conversation))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.conversations.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.conversations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut conversations = self.conversations.write();
        debug!("Clearing {} conversations", conversations.len());
        conversations.clear();
    }
}

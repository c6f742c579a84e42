use async_trait::async_trait;
use huddle_common::{Message, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::DEFAULT_CONVERSATION_TTL;
use crate::conversation_store::ConversationStore;

struct Entry {
    messages: Vec<Message>,
    touched: Instant,
}

/// Process-local conversation store, used by tests and ephemeral sessions.
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            ttl: DEFAULT_CONVERSATION_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        entry.touched.elapsed() > self.ttl
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(&self, conversation_id: &str) -> Result<Vec<Message>> {
        {
            let conversations = self.conversations.read().await;
            match conversations.get(conversation_id) {
                None => return Ok(Vec::new()),
                Some(entry) if !self.is_expired(entry) => return Ok(entry.messages.clone()),
                Some(_) => {}
            }
        }

        let mut conversations = self.conversations.write().await;
        if conversations
            .get(conversation_id)
            .is_some_and(|entry| self.is_expired(entry))
        {
            debug!("conversation {conversation_id} expired");
            conversations.remove(conversation_id);
        }
        Ok(conversations
            .get(conversation_id)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default())
    }

    async fn append(&self, conversation_id: &str, message: &Message) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let before = conversations.len();
        conversations.retain(|id, entry| id == conversation_id || !self.is_expired(entry));
        if conversations.len() < before {
            debug!("dropped {} expired conversations", before - conversations.len());
        }

        let ttl = self.ttl;
        let entry = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Entry {
                messages: Vec::new(),
                touched: Instant::now(),
            });
        if entry.touched.elapsed() > ttl {
            entry.messages.clear();
        }
        entry.messages.push(message.clone());
        entry.touched = Instant::now();
        Ok(())
    }

    async fn replace(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        conversations.insert(
            conversation_id.to_string(),
            Entry {
                messages: messages.to_vec(),
                touched: Instant::now(),
            },
        );
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut conversations = self.conversations.write().await;
        let before = conversations.len();
        conversations.retain(|_, entry| !self.is_expired(entry));
        Ok(before - conversations.len())
    }
}

pub mod conversation_store;
pub mod memory_store;
pub mod migrations;

use std::time::Duration;

pub use conversation_store::{ConversationStore, SqliteConversationStore};
pub use memory_store::InMemoryConversationStore;

/// Conversations untouched for longer than this are treated as gone.
pub const DEFAULT_CONVERSATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub mod error;
pub mod message;

pub use error::{Error, Result};
pub use message::{Message, TokenUsage, ToolCall, UserContext, validate_history};

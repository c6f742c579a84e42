use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One entry of a conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// A model-issued request to run a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.total = self.total.saturating_add(other.total);
    }
}

/// Caller-supplied facts about the person on the other end of the conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub display_name: Option<String>,
    pub platform_user_id: Option<String>,
    /// IANA timezone name, e.g. `Europe/Berlin`.
    pub timezone: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
        usage: Option<TokenUsage>,
    ) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls,
            usage,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
            is_error,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "tool_result",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content }
            | Self::User { content }
            | Self::Assistant { content, .. }
            | Self::ToolResult { content, .. } => content,
        }
    }

    /// Tool calls carried by an assistant message; empty for every other variant.
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }
}

/// Check the structural invariants of a conversation log.
///
/// - a system message may only appear at position 0;
/// - every tool result answers a still-open call of the nearest preceding
///   assistant message, and results form one contiguous block after it.
pub fn validate_history(messages: &[Message]) -> Result<()> {
    let mut open_calls: Option<Vec<&str>> = None;

    for (index, message) in messages.iter().enumerate() {
        match message {
            Message::System { .. } => {
                if index != 0 {
                    return Err(Error::InvalidHistory(format!(
                        "system message at position {index}"
                    )));
                }
                open_calls = None;
            }
            Message::User { .. } => open_calls = None,
            Message::Assistant { tool_calls, .. } => {
                open_calls = Some(tool_calls.iter().map(|c| c.id.as_str()).collect());
            }
            Message::ToolResult { tool_call_id, .. } => {
                let Some(open) = open_calls.as_mut() else {
                    return Err(Error::InvalidHistory(format!(
                        "tool result '{tool_call_id}' at position {index} does not follow an assistant tool call"
                    )));
                };
                let Some(pos) = open.iter().position(|id| *id == tool_call_id) else {
                    return Err(Error::InvalidHistory(format!(
                        "tool result '{tool_call_id}' at position {index} has no matching open tool call"
                    )));
                };
                open.remove(pos);
            }
        }
    }

    Ok(())
}

use huddle_common::{Error, Message, Result, TokenUsage, validate_history};
use huddle_db::ConversationStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::normalize::{estimate_tokens, flatten_content};
use crate::prompt::{split_summary, with_summary};
use crate::providers::{LlmProvider, LlmRequest};

const SUMMARY_INSTRUCTION: &str = "Condense this conversation, preserving facts needed to \
     continue: user identity, requests, decisions, tool findings and open tasks. Be brief.";

const SUMMARY_MAX_TOKENS: u32 = 1024;

/// When and how aggressively history is compacted.
#[derive(Debug, Clone)]
pub struct SummarizerPolicy {
    pub enabled: bool,
    pub token_budget: u32,
    /// Raw messages kept verbatim at the end of the log. Must be at least 1.
    pub keep_recent: usize,
}

impl Default for SummarizerPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            token_budget: 20_000,
            keep_recent: 6,
        }
    }
}

/// Compare the reported usage (or an estimate when the provider reported none) to the budget.
pub fn should_summarize(
    usage: Option<&TokenUsage>,
    history: &[Message],
    policy: &SummarizerPolicy,
) -> bool {
    if !policy.enabled {
        return false;
    }
    let used = match usage {
        Some(usage) => usage.total as usize,
        None => estimate_tokens(history),
    };
    used > policy.token_budget as usize
}

/// Index where the verbatim tail starts, or `None` when there is nothing to condense.
///
/// The tail never starts on a tool result, so every result stays next to the
/// assistant message that requested it. A `keep_recent` of zero condenses nothing.
pub fn split_point(messages: &[Message], keep_recent: usize) -> Option<usize> {
    if keep_recent == 0 {
        return None;
    }
    let start = usize::from(messages.first().is_some_and(Message::is_system));
    if messages.len().saturating_sub(start) <= keep_recent {
        return None;
    }

    let mut split = messages.len() - keep_recent;
    while split > start && messages[split].is_tool_result() {
        split -= 1;
    }
    (split > start).then_some(split)
}

/// Condense the stored history of `conversation_id` when it exceeds the budget.
///
/// Returns `true` when the log was replaced. A failing or empty model answer leaves the
/// log untouched; store errors are returned. Cancellation during the model call returns
/// [`Error::Cancelled`] with the log untouched.
pub async fn maybe_summarize(
    store: &dyn ConversationStore,
    conversation_id: &str,
    usage: Option<&TokenUsage>,
    policy: &SummarizerPolicy,
    provider: &dyn LlmProvider,
    model: &str,
    cancel: &CancellationToken,
) -> Result<bool> {
    let history = store.get(conversation_id).await?;
    if !should_summarize(usage, &history, policy) {
        return Ok(false);
    }

    let Some(split) = split_point(&history, policy.keep_recent) else {
        debug!("history over budget but too short to condense");
        return Ok(false);
    };

    let (system, previous) = match history.first() {
        Some(message @ Message::System { .. }) => {
            (Some(message), split_summary(message.content()).1)
        }
        _ => (None, None),
    };
    let start = usize::from(system.is_some());

    let request = LlmRequest {
        model: model.to_string(),
        messages: vec![
            Message::system(SUMMARY_INSTRUCTION),
            Message::user(render_transcript(previous, &history[start..split])),
        ],
        max_tokens: Some(SUMMARY_MAX_TOKENS),
        temperature: Some(0.0),
        tools: Vec::new(),
    };

    let completion = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        result = provider.complete(&request) => result,
    };
    let summary = match completion {
        Ok(response) => flatten_content(&response.content),
        Err(e) => {
            warn!("summarization failed, keeping full history: {e}");
            return Ok(false);
        }
    };
    if summary.trim().is_empty() {
        warn!("summarization returned empty response, keeping full history");
        return Ok(false);
    }

    let head = match system {
        Some(system) => with_summary(system, &summary),
        None => with_summary(&Message::system(""), &summary),
    };
    let mut compacted = Vec::with_capacity(history.len() - split + 1);
    compacted.push(head);
    compacted.extend_from_slice(&history[split..]);

    validate_history(&compacted)?;
    store.replace(conversation_id, &compacted).await?;

    info!(
        "compacted conversation: dropped {} messages, summary len={}",
        split - start,
        summary.len()
    );
    Ok(true)
}

fn render_transcript(previous: Option<&str>, messages: &[Message]) -> String {
    let mut out = String::new();
    if let Some(previous) = previous {
        out.push_str("Previous summary:\n");
        out.push_str(previous.trim());
        out.push_str("\n\n");
    }
    out.push_str("Conversation to incorporate:\n");
    for message in messages {
        match message {
            Message::System { .. } => {}
            Message::User { content } => out.push_str(&format!("User: {content}\n")),
            Message::Assistant {
                content,
                tool_calls,
                ..
            } => {
                if !content.is_empty() {
                    out.push_str(&format!("Assistant: {content}\n"));
                }
                for call in tool_calls {
                    out.push_str(&format!("Assistant called {}({})\n", call.name, call.arguments));
                }
            }
            Message::ToolResult { name, content, .. } => {
                out.push_str(&format!("Tool {name} returned: {content}\n"));
            }
        }
    }
    out
}

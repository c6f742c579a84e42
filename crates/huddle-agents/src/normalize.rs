use huddle_common::{Message, TokenUsage};

use crate::providers::{ContentBlock, MessagePart, Usage};

/// Concatenate the text parts of a response in order; empty when there are none.
pub fn flatten_content(content: &MessagePart) -> String {
    match content {
        MessagePart::Text(text) => text.clone(),
        MessagePart::Parts(parts) => parts
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect(),
    }
}

/// Convert provider usage into [`TokenUsage`].
///
/// `None` means unknown, never zero cost. A missing total is derived from the
/// input and output counts.
pub fn extract_usage(usage: Option<&Usage>) -> Option<TokenUsage> {
    let usage = usage?;
    if usage.input_tokens.is_none() && usage.output_tokens.is_none() && usage.total_tokens.is_none()
    {
        return None;
    }

    let input = usage.input_tokens.unwrap_or(0);
    let output = usage.output_tokens.unwrap_or(0);
    let total = usage
        .total_tokens
        .unwrap_or_else(|| input.saturating_add(output));

    Some(TokenUsage {
        input,
        output,
        total,
    })
}

/// Rough token estimate: ~4 characters per token.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    let chars: usize = messages
        .iter()
        .map(|message| {
            let calls: usize = message
                .tool_calls()
                .iter()
                .map(|call| call.name.len() + call.arguments.to_string().len())
                .sum();
            message.content().len() + calls
        })
        .sum();
    chars / 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::ToolCall;
    use serde_json::json;

    #[test]
    fn flatten_plain_text() {
        assert_eq!(flatten_content(&MessagePart::Text("hi".into())), "hi");
    }

    #[test]
    fn flatten_concatenates_text_parts_in_order() {
        let content = MessagePart::Parts(vec![
            ContentBlock::Text {
                text: "Here is ".into(),
            },
            ContentBlock::Image {
                url: "https://example.com/chart.png".into(),
            },
            ContentBlock::Text {
                text: "your summary.".into(),
            },
        ]);
        assert_eq!(flatten_content(&content), "Here is your summary.");
    }

    #[test]
    fn flatten_without_text_parts_is_empty() {
        let content = MessagePart::Parts(vec![ContentBlock::Refusal {
            refusal: "no".into(),
        }]);
        assert_eq!(flatten_content(&content), "");
    }

    #[test]
    fn usage_absent_is_unknown() {
        assert_eq!(extract_usage(None), None);
        assert_eq!(extract_usage(Some(&Usage::default())), None);
    }

    #[test]
    fn usage_total_derived_when_missing() {
        let usage = Usage {
            input_tokens: Some(100),
            output_tokens: Some(20),
            total_tokens: None,
        };
        assert_eq!(
            extract_usage(Some(&usage)),
            Some(TokenUsage {
                input: 100,
                output: 20,
                total: 120
            })
        );
    }

    #[test]
    fn reported_total_is_kept() {
        let usage = Usage {
            input_tokens: Some(100),
            output_tokens: Some(20),
            total_tokens: Some(130),
        };
        assert_eq!(extract_usage(Some(&usage)).map(|u| u.total), Some(130));
    }

    #[test]
    fn estimate_tokens_counts_content_and_calls() {
        let messages = vec![Message::user("hello world")]; // 11 chars
        assert_eq!(estimate_tokens(&messages), 2);

        let with_call = vec![Message::assistant(
            "",
            vec![ToolCall {
                id: "c".into(),
                name: "abcd".into(),
                arguments: json!({}),
            }],
            None,
        )];
        assert_eq!(estimate_tokens(&with_call), (4 + 2) / 4);
    }
}

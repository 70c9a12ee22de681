//! Input-token estimation for admission control.
//!
//! The estimate mirrors the chat-completions counting recipe: a fixed
//! per-message overhead plus encoded role, content, and name, with the
//! request's tool and format sections counted from their JSON encoding.
//! Routing only needs a consistent upper-bound-ish figure, so every model is
//! counted with the cl100k base encoding.

use tiktoken_rs::CoreBPE;

use crate::openai::ChatCompletionRequest;

const TOKENS_PER_MESSAGE: u64 = 3;
const TOKENS_PER_NAME: u64 = 1;
const REPLY_PRIMER_TOKENS: u64 = 3;

/// Estimate the input tokens of a chat-completion request. Returns `None`
/// when there is nothing to count; callers fall back to a byte heuristic.
pub fn estimate_input_tokens(request: &ChatCompletionRequest) -> Option<u32> {
    if request.messages.is_empty() {
        return None;
    }

    let bpe = tiktoken_rs::cl100k_base_singleton();
    let mut tokens: u64 = 0;

    for message in &request.messages {
        tokens = tokens.saturating_add(TOKENS_PER_MESSAGE);
        tokens = tokens.saturating_add(encoded_len(bpe, &message.role));
        if let Some(text) = message.text() {
            tokens = tokens.saturating_add(encoded_len(bpe, &text));
        }
        if let Some(name) = message.name.as_deref() {
            tokens = tokens.saturating_add(encoded_len(bpe, name));
            tokens = tokens.saturating_add(TOKENS_PER_NAME);
        }
    }
    tokens = tokens.saturating_add(REPLY_PRIMER_TOKENS);

    tokens = tokens.saturating_add(json_tokens(bpe, request.tools.as_ref()));
    tokens = tokens.saturating_add(json_tokens(bpe, request.tool_choice.as_ref()));
    tokens = tokens.saturating_add(json_tokens(bpe, request.response_format.as_ref()));
    tokens = tokens.saturating_add(json_tokens(bpe, request.stop.as_ref()));

    Some(u32::try_from(tokens).unwrap_or(u32::MAX))
}

fn encoded_len(bpe: &CoreBPE, text: &str) -> u64 {
    bpe.encode_with_special_tokens(text).len() as u64
}

fn json_tokens<T: serde::Serialize>(bpe: &CoreBPE, value: Option<&T>) -> u64 {
    let Some(value) = value else {
        return 0;
    };
    let Ok(json) = serde_json::to_string(value) else {
        return 0;
    };
    encoded_len(bpe, &json)
}

/// Byte-count fallback used when nothing could be estimated: roughly four
/// bytes per token with ten percent headroom.
pub fn heuristic_tokens(body_len: usize) -> u32 {
    const BYTES_PER_TOKEN: f64 = 4.0;
    let estimate = (1.1 * body_len as f64 / BYTES_PER_TOKEN).ceil();
    (estimate as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::Message;

    #[test]
    fn matches_manual_count_for_plain_messages() {
        let request = ChatCompletionRequest {
            messages: vec![Message::new("user", "hello")],
            ..Default::default()
        };

        let bpe = tiktoken_rs::cl100k_base_singleton();
        let expected = TOKENS_PER_MESSAGE
            + encoded_len(bpe, "user")
            + encoded_len(bpe, "hello")
            + REPLY_PRIMER_TOKENS;

        assert_eq!(estimate_input_tokens(&request), Some(expected as u32));
    }

    #[test]
    fn counts_text_parts_and_skips_binary_parts() {
        let request = ChatCompletionRequest {
            messages: vec![Message {
                role: "user".to_string(),
                content: serde_json::json!([
                    { "type": "text", "text": "hello" },
                    { "type": "image_url", "image_url": { "url": "data:image/png;base64,AAAA" } },
                    { "type": "text", "text": " world" },
                ]),
                name: None,
                tool_call_id: None,
            }],
            ..Default::default()
        };

        let bpe = tiktoken_rs::cl100k_base_singleton();
        let expected = TOKENS_PER_MESSAGE
            + encoded_len(bpe, "user")
            + encoded_len(bpe, "hello world")
            + REPLY_PRIMER_TOKENS;

        assert_eq!(estimate_input_tokens(&request), Some(expected as u32));
    }

    #[test]
    fn empty_requests_are_not_estimated() {
        let request = ChatCompletionRequest::default();
        assert_eq!(estimate_input_tokens(&request), None);
    }

    #[test]
    fn extra_sections_increase_the_estimate() {
        let bare = ChatCompletionRequest {
            messages: vec![Message::new("user", "hi")],
            ..Default::default()
        };
        let with_stop = ChatCompletionRequest {
            messages: vec![Message::new("user", "hi")],
            stop: Some(serde_json::json!(["END", "STOP"])),
            ..Default::default()
        };
        assert!(estimate_input_tokens(&with_stop) > estimate_input_tokens(&bare));
    }

    #[test]
    fn heuristic_rounds_up_and_never_returns_zero() {
        assert_eq!(heuristic_tokens(0), 1);
        assert_eq!(heuristic_tokens(100), 28);
    }
}

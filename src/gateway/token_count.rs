use serde_json::Value;
use tiktoken_rs::{CoreBPE, tokenizer};

use crate::types::{ChatCompletionRequest, EmbeddingRequest};

/// Prompt tokens of a chat request, counted the way OpenAI bills them.
pub fn count_chat_tokens(model: &str, request: &ChatCompletionRequest) -> u64 {
    let bpe = bpe_for_model(model);
    let (tokens_per_message, tokens_per_name) = if model.starts_with("gpt-3.5") {
        (4i64, -1i64)
    } else {
        (3i64, 1i64)
    };

    let mut num_tokens: i64 = 0;
    for message in &request.messages {
        num_tokens = num_tokens.saturating_add(tokens_per_message);
        num_tokens = num_tokens.saturating_add(encoded_len(bpe, message.role.as_str()));
        num_tokens = num_tokens.saturating_add(encoded_len(bpe, &message.text()));
        if let Some(name) = &message.name {
            num_tokens = num_tokens.saturating_add(encoded_len(bpe, name));
            num_tokens = num_tokens.saturating_add(tokens_per_name);
        }
    }
    num_tokens = num_tokens.saturating_add(3);

    let params = request.to_params();
    for field in ["tools", "tool_choice", "response_format", "stop"] {
        if let Some(value) = params.get(field) {
            num_tokens = num_tokens.saturating_add(count_json_tokens(bpe, value));
        }
    }

    num_tokens.max(0) as u64
}

pub fn count_embedding_tokens(model: &str, request: &EmbeddingRequest) -> u64 {
    let bpe = bpe_for_model(model);
    request
        .input
        .texts()
        .iter()
        .map(|text| encoded_len(bpe, text).max(0) as u64)
        .sum()
}

/// Completion tokens of assembled streaming output.
pub fn count_text_tokens(model: &str, text: &str) -> u64 {
    encoded_len(bpe_for_model(model), text).max(0) as u64
}

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

fn encoded_len(bpe: &CoreBPE, text: &str) -> i64 {
    clamp_usize_to_i64(bpe.encode_with_special_tokens(text).len())
}

fn count_json_tokens(bpe: &CoreBPE, value: &Value) -> i64 {
    let json = serde_json::to_string(value).unwrap_or_default();
    encoded_len(bpe, &json)
}

fn clamp_usize_to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, EmbeddingInput};

    #[test]
    fn counts_chat_completions_like_tiktoken() {
        let request = ChatCompletionRequest::new("gpt-4o-mini", vec![ChatMessage::user("hello")]);
        let tokens = count_chat_tokens("gpt-4o-mini", &request);

        let expected = tiktoken_rs::num_tokens_from_messages(
            "gpt-4o-mini",
            &[tiktoken_rs::ChatCompletionRequestMessage {
                role: "user".to_string(),
                content: Some("hello".to_string()),
                name: None,
                function_call: None,
            }],
        )
        .expect("num_tokens_from_messages") as u64;

        assert_eq!(tokens, expected);
    }

    #[test]
    fn counts_embedding_input_strings() {
        let request = EmbeddingRequest::new(
            "text-embedding-3-small",
            EmbeddingInput::Many(vec!["hello".to_string(), "world".to_string()]),
        );
        let bpe = bpe_for_model("text-embedding-3-small");
        let expected = bpe.encode_with_special_tokens("hello").len()
            + bpe.encode_with_special_tokens("world").len();
        assert_eq!(
            count_embedding_tokens("text-embedding-3-small", &request),
            expected as u64
        );
    }
}

//! OpenAI-shaped request and response types used as the gateway's canonical form.

mod chat;
mod embeddings;
mod media;

pub use chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChunkAccumulator, ChunkChoice, ChunkDelta, ContentPart, FunctionCall, FunctionCallDelta, FunctionDefinition,
    ImageUrl, InputAudio, MessageContent, ResponseMessage, Role, StopSequences, StreamOptions,
    Tool, ToolCall, ToolCallDelta, ToolChoice, ToolChoiceFunction, ToolChoiceFunctionName, Usage,
    finish_reason_is_terminal,
};
pub use embeddings::{
    EmbeddingData, EmbeddingInput, EmbeddingRequest, EmbeddingResponse, EmbeddingUsage,
    EmbeddingVector,
};
pub use media::{MediaOperation, MediaPayload, MediaResponse};

/// Request keys consumed by the gateway itself and never forwarded upstream.
pub const GATEWAY_ONLY_PARAMS: &[&str] = &[
    "metadata",
    "tags",
    "cache",
    "request_id",
    "api_key",
    "api_base",
    "mock_response",
    "fallbacks",
    "num_retries",
    "tianji_params",
];

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

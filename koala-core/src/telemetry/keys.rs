/// Span/log attribute keys.
/// Keep these stable; log pipelines filter on them.
pub const KEY_MODEL: &str = "llm.model";

pub const KEY_HTTP_STATUS: &str = "http.status";
pub const KEY_STREAM_DISPOSITION: &str = "stream.disposition";
pub const KEY_STREAM_CHUNKS: &str = "stream.chunks";
pub const KEY_STREAM_MERGED_CHARS: &str = "stream.merged_chars";

pub const KEY_TOKENS_PROMPT: &str = "tokens.prompt";
pub const KEY_TOKENS_COMPLETION: &str = "tokens.completion";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error.kind";

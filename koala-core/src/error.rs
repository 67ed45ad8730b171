use thiserror::Error;

/// Appended to 404/405 bodies that name a missing model.
pub const MODEL_ACCESS_HINT: &str =
    "\nMessage from Koala:\nPlease ensure that you have access to this model on the selected endpoint!";
/// Appended to any other 404/405 body.
pub const ENDPOINT_INVALID_HINT: &str =
    "\nMessage from Koala:\nInvalid API endpoint! We recommend you check the configured endpoint URL.";
/// Appended when the upstream reports an exhausted quota.
pub const QUOTA_HINT: &str =
    "\nMessage from Koala:\nWe recommend changing your API endpoint or API key";
/// Appended to 429 bodies.
pub const RATE_LIMIT_HINT: &str = "\nRate limited!";

fn quota_hint(quota: bool) -> &'static str {
    if quota { QUOTA_HINT } else { "" }
}

/// Core error type for koala.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum KoalaError {
    #[error("no API key configured for {endpoint}; this endpoint requires one")]
    NoCredential { endpoint: String },

    #[error("{}{}", .body, MODEL_ACCESS_HINT)]
    ModelAccess { status: u16, body: String },

    #[error("{}{}", .body, ENDPOINT_INVALID_HINT)]
    EndpointInvalid { status: u16, body: String },

    #[error("{}{}", .body, RATE_LIMIT_HINT)]
    RateLimited { body: String, retry_after: Option<u64> },

    #[error("{}{}", .body, quota_hint(*.quota))]
    QuotaOrUpstream { status: u16, body: String, quota: bool },

    #[error("Oops, the stream is locked right now. Please try again")]
    StreamLocked,

    #[error("{0}")]
    EmptySubmission(String),

    #[error("Error generating title!\n{0}")]
    TitleGeneration(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid completion document: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KoalaError {
    /// Stable short name, recorded as `error.kind` on spans.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoCredential { .. } => "no_credential",
            Self::ModelAccess { .. } => "model_access",
            Self::EndpointInvalid { .. } => "endpoint_invalid",
            Self::RateLimited { .. } => "rate_limited",
            Self::QuotaOrUpstream { .. } => "quota_or_upstream",
            Self::StreamLocked => "stream_locked",
            Self::EmptySubmission(_) => "empty_submission",
            Self::TitleGeneration(_) => "title_generation",
            Self::Validation(_) => "validation",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, KoalaError>;

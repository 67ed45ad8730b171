//! Maps an upstream response (status + body text) to a structured outcome.
//!
//! The classifier never fails on its own; callers decide whether a
//! [`Classification::Failure`] becomes an error. For streaming calls with a
//! 2xx status the body is the event stream itself and is not inspected here.

use http::StatusCode;

use crate::error::KoalaError;

/// Vendor marker for a model the caller has no access to.
pub const MODEL_NOT_FOUND_MARKER: &str = "model_not_found";
/// Vendor marker for an exhausted account quota.
pub const QUOTA_MARKER: &str = "insufficient_quota";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ModelAccess,
    EndpointInvalid,
    RateLimited,
    QuotaOrUpstream { quota: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    pub kind: FailureKind,
    pub status: u16,
    pub body: String,
    pub retry_after: Option<u64>,
}

impl UpstreamFailure {
    /// An `error` object delivered inside an otherwise successful event stream.
    pub fn from_stream_error(payload: &str) -> Self {
        Self {
            kind: FailureKind::QuotaOrUpstream {
                quota: payload.contains(QUOTA_MARKER),
            },
            status: StatusCode::OK.as_u16(),
            body: payload.to_string(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<u64>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn into_error(self) -> KoalaError {
        let Self { kind, status, body, retry_after } = self;
        match kind {
            FailureKind::ModelAccess => KoalaError::ModelAccess { status, body },
            FailureKind::EndpointInvalid => KoalaError::EndpointInvalid { status, body },
            FailureKind::RateLimited => KoalaError::RateLimited { body, retry_after },
            FailureKind::QuotaOrUpstream { quota } => KoalaError::QuotaOrUpstream { status, body, quota },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    Failure(UpstreamFailure),
}

impl Classification {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Rules are checked in order; the first match wins.
pub fn classify(status: StatusCode, body: &str) -> Classification {
    let kind = match status {
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED if body.contains(MODEL_NOT_FOUND_MARKER) => {
            FailureKind::ModelAccess
        }
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => FailureKind::EndpointInvalid,
        StatusCode::TOO_MANY_REQUESTS => FailureKind::RateLimited,
        s if !s.is_success() || body.contains(QUOTA_MARKER) => FailureKind::QuotaOrUpstream {
            quota: body.contains(QUOTA_MARKER),
        },
        _ => return Classification::Success,
    };
    Classification::Failure(UpstreamFailure {
        kind,
        status: status.as_u16(),
        body: body.to_string(),
        retry_after: None,
    })
}

use std::time::Duration;

use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{Instrument, Span, debug_span, field};

use crate::classifier::{Classification, classify};
use crate::config::HttpCfg;
use crate::error::{CoreResult, KoalaError};
use crate::request::RequestDescriptor;
use crate::stream::ResponseStream;
use crate::telemetry::keys::KEY_HTTP_STATUS;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    request_timeout: Duration,
}

impl HttpClient {
    /// Streaming calls only carry the connect timeout; the total request
    /// timeout applies to single-shot calls.
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(cap) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(cap);
        }
        let inner = builder
            .build()
            .map_err(|e| KoalaError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: format!("koala/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    fn request(&self, desc: &RequestDescriptor) -> reqwest::RequestBuilder {
        let mut req = self.inner.post(&desc.url).header("User-Agent", &self.user_agent);
        for (k, v) in &desc.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        // Content-Type is already among the descriptor headers; json() keeps it.
        req.json(&desc.body)
    }

    /// POST a streaming completion. Non-2xx responses are read and classified;
    /// on success the body is handed back unread.
    pub async fn post_stream(&self, desc: &RequestDescriptor) -> CoreResult<ResponseStream> {
        let span = debug_span!(
            "http.post",
            llm.user = %desc.correlation_id,
            http.stream = true,
            http.status = field::Empty,
        );
        async move {
            let resp = self
                .request(desc)
                .header("Accept", "text/event-stream")
                .send()
                .await
                .map_err(transport)?;

            let status = resp.status();
            Span::current().record(KEY_HTTP_STATUS, status.as_u16());
            if !status.is_success() {
                let retry_after = parse_retry_after(resp.headers());
                let body = resp.text().await.unwrap_or_default();
                return Err(upstream_error(status, &body, retry_after));
            }

            let body = resp.bytes_stream().map_err(transport).boxed();
            Ok(ResponseStream::new(body))
        }
        .instrument(span)
        .await
    }

    /// POST a single-shot completion and decode the JSON document.
    pub async fn post_document<R: DeserializeOwned>(&self, desc: &RequestDescriptor) -> CoreResult<R> {
        let span = debug_span!(
            "http.post",
            llm.user = %desc.correlation_id,
            http.stream = false,
            http.status = field::Empty,
        );
        async move {
            let resp = self
                .request(desc)
                .timeout(self.request_timeout)
                .send()
                .await
                .map_err(transport)?;

            let status = resp.status();
            Span::current().record(KEY_HTTP_STATUS, status.as_u16());
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.map_err(transport)?;
            if let Classification::Failure(f) = classify(status, &text) {
                return Err(f.with_retry_after(retry_after).into_error());
            }
            serde_json::from_str::<R>(&text).map_err(|e| KoalaError::Decode(e.to_string()))
        }
        .instrument(span)
        .await
    }
}

fn transport(e: reqwest::Error) -> KoalaError {
    KoalaError::Transport(e.to_string())
}

fn upstream_error(status: StatusCode, body: &str, retry_after: Option<u64>) -> KoalaError {
    match classify(status, body) {
        Classification::Failure(f) => f.with_retry_after(retry_after).into_error(),
        Classification::Success => KoalaError::QuotaOrUpstream {
            status: status.as_u16(),
            body: body.to_string(),
            quota: false,
        },
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

//! Read loop that turns a completion body into merged assistant text.
//!
//! Contract:
//! - A [`ResponseStream`] hands out exactly one reader; a second acquisition
//!   fails with [`KoalaError::StreamLocked`] before any read happens.
//! - The continue predicate is polled before every read. A read that is
//!   already in flight completes and its bytes are decoded and merged.
//! - Deltas reach the [`DeltaSink`] in arrival order, each exactly once, and
//!   whatever is pending is flushed on every exit path.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, debug_span, field};

use crate::decoder::Utf8StreamDecoder;
use crate::error::{CoreResult, KoalaError};
use crate::frame::{self, StreamEvent};
use crate::telemetry::keys::{
    KEY_ERROR_KIND, KEY_STREAM_CHUNKS, KEY_STREAM_DISPOSITION, KEY_STREAM_MERGED_CHARS,
};

/// Raw body chunks as delivered by the transport.
pub type ByteStream = BoxStream<'static, CoreResult<Bytes>>;

/// A lockable response body.
pub struct ResponseStream {
    body: Option<ByteStream>,
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl ResponseStream {
    pub fn new(body: ByteStream) -> Self {
        Self { body: Some(body) }
    }

    /// In-memory body, one item per chunk.
    pub fn from_chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        let items: Vec<CoreResult<Bytes>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
        Self::new(stream::iter(items).boxed())
    }

    pub fn is_locked(&self) -> bool {
        self.body.is_none()
    }

    /// Take the exclusive reader.
    pub fn reader(&mut self) -> CoreResult<StreamReader> {
        self.body
            .take()
            .map(|body| StreamReader { body })
            .ok_or(KoalaError::StreamLocked)
    }
}

pub struct StreamReader {
    body: ByteStream,
}

impl StreamReader {
    /// Next chunk, or `None` once upstream closed. Cancel-safe.
    pub async fn read(&mut self) -> Option<CoreResult<Bytes>> {
        self.body.next().await
    }

    /// Drop the body, aborting the underlying connection if it is still open.
    pub fn release(self, disposition: Disposition) {
        debug!(reason = disposition.reason(), "releasing response stream");
        drop(self.body);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Merge after every read.
    #[default]
    EveryRead,
    /// Merge when the window since the first unmerged delta has elapsed.
    Coalesce(Duration),
}

impl FlushPolicy {
    pub fn from_window_ms(ms: u64) -> Self {
        match ms {
            0 => Self::EveryRead,
            ms => Self::Coalesce(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Cancelled,
    Failed,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::Completed => "Generation completed",
            Self::Cancelled => "Cancelled by user",
            Self::Failed => "Generation failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub disposition: Disposition,
    pub chunks_read: usize,
    pub bytes_read: usize,
    /// Number of non-empty merges handed to the sink.
    pub flushes: usize,
    pub merged_chars: usize,
}

/// Receives coalesced assistant text.
pub trait DeltaSink {
    fn merge(&mut self, text: &str) -> CoreResult<()>;
}

impl<F> DeltaSink for F
where
    F: FnMut(&str) -> CoreResult<()>,
{
    fn merge(&mut self, text: &str) -> CoreResult<()> {
        self(text)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamConsumer {
    policy: FlushPolicy,
}

impl StreamConsumer {
    pub fn new(policy: FlushPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    pub async fn pump<P, S>(
        &self,
        stream: &mut ResponseStream,
        mut should_continue: P,
        sink: &mut S,
    ) -> CoreResult<StreamSummary>
    where
        P: FnMut() -> bool,
        S: DeltaSink + ?Sized,
    {
        let mut reader = stream.reader()?;
        let span = debug_span!(
            "stream.pump",
            stream.disposition = field::Empty,
            stream.chunks = field::Empty,
            stream.merged_chars = field::Empty,
            error.kind = field::Empty,
        );

        let mut run = Run {
            policy: self.policy,
            decoder: Utf8StreamDecoder::new(),
            buffer: String::new(),
            deadline: None,
            chunks_read: 0,
            bytes_read: 0,
            merger: Merger { sink, pending: String::new(), flushes: 0, merged_chars: 0 },
        };
        let outcome = run
            .drive(&mut reader, &mut should_continue)
            .instrument(span.clone())
            .await;
        let last_flush = run.merger.flush();

        let result = match (outcome, last_flush) {
            (Ok(disposition), Ok(())) => Ok(disposition),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        };
        let disposition = match &result {
            Ok(d) => *d,
            Err(_) => Disposition::Failed,
        };

        span.record(KEY_STREAM_DISPOSITION, disposition.as_str());
        span.record(KEY_STREAM_CHUNKS, run.chunks_read as u64);
        span.record(KEY_STREAM_MERGED_CHARS, run.merger.merged_chars as u64);
        if let Err(e) = &result {
            span.record(KEY_ERROR_KIND, e.kind());
        }
        span.in_scope(|| reader.release(disposition));

        result.map(|disposition| StreamSummary {
            disposition,
            chunks_read: run.chunks_read,
            bytes_read: run.bytes_read,
            flushes: run.merger.flushes,
            merged_chars: run.merger.merged_chars,
        })
    }
}

struct Merger<'s, S: ?Sized> {
    sink: &'s mut S,
    pending: String,
    flushes: usize,
    merged_chars: usize,
}

impl<S: DeltaSink + ?Sized> Merger<'_, S> {
    fn flush(&mut self) -> CoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let text = std::mem::take(&mut self.pending);
        self.sink.merge(&text)?;
        self.flushes += 1;
        self.merged_chars += text.chars().count();
        Ok(())
    }
}

enum Wake {
    Chunk(Option<CoreResult<Bytes>>),
    Tick,
}

struct Run<'s, S: ?Sized> {
    policy: FlushPolicy,
    decoder: Utf8StreamDecoder,
    buffer: String,
    deadline: Option<Instant>,
    chunks_read: usize,
    bytes_read: usize,
    merger: Merger<'s, S>,
}

impl<S: DeltaSink + ?Sized> Run<'_, S> {
    async fn drive<P: FnMut() -> bool>(
        &mut self,
        reader: &mut StreamReader,
        should_continue: &mut P,
    ) -> CoreResult<Disposition> {
        loop {
            if !should_continue() {
                self.drain_tail()?;
                return Ok(Disposition::Cancelled);
            }

            let wake = match self.deadline {
                Some(at) => tokio::select! {
                    biased;
                    _ = sleep_until(at) => Wake::Tick,
                    next = reader.read() => Wake::Chunk(next),
                },
                None => Wake::Chunk(reader.read().await),
            };

            match wake {
                Wake::Tick => {
                    self.deadline = None;
                    self.merger.flush()?;
                }
                Wake::Chunk(None) => {
                    self.drain_tail()?;
                    return Ok(Disposition::Completed);
                }
                Wake::Chunk(Some(Err(e))) => return Err(e),
                Wake::Chunk(Some(Ok(bytes))) => {
                    self.chunks_read += 1;
                    self.bytes_read += bytes.len();
                    let text = self.decoder.decode(&bytes);
                    self.buffer.push_str(&text);
                    let parsed = frame::parse(&self.buffer);
                    self.buffer = parsed.remainder;
                    if self.absorb(parsed.events)? {
                        return Ok(Disposition::Completed);
                    }
                    self.schedule_flush()?;
                }
            }
        }
    }

    /// Decode held-back bytes and parse whatever is left in the buffer.
    fn drain_tail(&mut self) -> CoreResult<()> {
        let tail = self.decoder.finish();
        self.buffer.push_str(&tail);
        let parsed = frame::parse_final(&self.buffer);
        self.buffer.clear();
        self.absorb(parsed.events)?;
        Ok(())
    }

    /// Returns true once the terminal sentinel was seen.
    fn absorb(&mut self, events: Vec<StreamEvent>) -> CoreResult<bool> {
        for event in events {
            match event {
                StreamEvent::Delta(text) => self.merger.pending.push_str(&text),
                StreamEvent::RawUnparsed(raw) => {
                    debug!(len = raw.len(), "discarding unrecognized stream record");
                }
                StreamEvent::Done => return Ok(true),
                StreamEvent::Error(failure) => return Err(failure.into_error()),
            }
        }
        Ok(false)
    }

    fn schedule_flush(&mut self) -> CoreResult<()> {
        match self.policy {
            FlushPolicy::EveryRead => self.merger.flush(),
            FlushPolicy::Coalesce(window) => {
                if self.deadline.is_none() && !self.merger.pending.is_empty() {
                    self.deadline = Some(Instant::now() + window);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::test_span::install_capture;

    fn record(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn body(parts: &[&str]) -> String {
        let mut out: String = parts.iter().map(|p| record(p)).collect();
        out.push_str("data: [DONE]\n\n");
        out
    }

    async fn collect(
        stream: &mut ResponseStream,
        policy: FlushPolicy,
    ) -> (String, CoreResult<StreamSummary>) {
        let mut text = String::new();
        let mut sink = |delta: &str| -> CoreResult<()> {
            text.push_str(delta);
            Ok(())
        };
        let res = StreamConsumer::new(policy).pump(stream, || true, &mut sink).await;
        (text, res)
    }

    #[tokio::test]
    async fn any_byte_chunking_yields_the_same_text() {
        let bytes = body(&["Grüße ", "from ", "the 🐨", "!"]).into_bytes();
        for size in 1..=9 {
            let chunks: Vec<Vec<u8>> = bytes.chunks(size).map(<[u8]>::to_vec).collect();
            let mut stream = ResponseStream::from_chunks(chunks);
            let (text, res) = collect(&mut stream, FlushPolicy::EveryRead).await;
            assert_eq!(text, "Grüße from the 🐨!", "chunk size {size}");
            let summary = res.unwrap();
            assert_eq!(summary.disposition, Disposition::Completed);
            assert_eq!(summary.merged_chars, "Grüße from the 🐨!".chars().count());
        }
    }

    #[tokio::test]
    async fn cancellation_keeps_only_chunks_already_read() {
        let chunks = vec![record("Hi"), record(" there"), record("!"), "data: [DONE]\n\n".to_string()];
        let mut stream = ResponseStream::from_chunks(chunks);
        let mut text = String::new();
        let mut sink = |delta: &str| -> CoreResult<()> {
            text.push_str(delta);
            Ok(())
        };
        let mut polls = 0;
        let summary = StreamConsumer::default()
            .pump(
                &mut stream,
                || {
                    polls += 1;
                    polls <= 2
                },
                &mut sink,
            )
            .await
            .unwrap();
        assert_eq!(text, "Hi there");
        assert_eq!(summary.disposition, Disposition::Cancelled);
        assert_eq!(summary.chunks_read, 2);
    }

    #[tokio::test]
    async fn cancellation_still_parses_the_buffered_tail() {
        let chunks = vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n".to_string(),
            "\ndata: [DONE]\n\n".to_string(),
        ];
        let mut stream = ResponseStream::from_chunks(chunks);
        let mut text = String::new();
        let mut sink = |delta: &str| -> CoreResult<()> {
            text.push_str(delta);
            Ok(())
        };
        let mut polls = 0;
        let summary = StreamConsumer::default()
            .pump(
                &mut stream,
                || {
                    polls += 1;
                    polls == 1
                },
                &mut sink,
            )
            .await
            .unwrap();
        assert_eq!(text, "Hi");
        assert_eq!(summary.disposition, Disposition::Cancelled);
        assert_eq!(summary.chunks_read, 1);
    }

    #[tokio::test]
    async fn coalescing_merges_once_when_window_never_elapses() {
        let chunks = vec![record("a"), record("b"), record("c"), "data: [DONE]\n\n".to_string()];
        let mut stream = ResponseStream::from_chunks(chunks);
        let (text, res) =
            collect(&mut stream, FlushPolicy::Coalesce(Duration::from_secs(10))).await;
        assert_eq!(text, "abc");
        let summary = res.unwrap();
        assert_eq!(summary.flushes, 1);
        assert_eq!(summary.chunks_read, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn coalescing_timer_flushes_between_slow_chunks() {
        let chunks = vec![record("a"), record("b"), "data: [DONE]\n\n".to_string()];
        let slow = stream::unfold(chunks.into_iter(), |mut it| async move {
            let next = it.next()?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            Some((Ok(Bytes::from(next)), it))
        });
        let mut stream = ResponseStream::new(slow.boxed());
        let mut merges: Vec<String> = Vec::new();
        let mut sink = |delta: &str| -> CoreResult<()> {
            merges.push(delta.to_string());
            Ok(())
        };
        let summary = StreamConsumer::new(FlushPolicy::from_window_ms(20))
            .pump(&mut stream, || true, &mut sink)
            .await
            .unwrap();
        assert_eq!(merges, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(summary.flushes, 2);
        assert_eq!(summary.disposition, Disposition::Completed);
    }

    #[tokio::test]
    async fn second_reader_is_rejected() {
        let mut stream = ResponseStream::from_chunks(vec![body(&["x"])]);
        let _held = stream.reader().unwrap();
        assert!(stream.is_locked());
        let (text, res) = collect(&mut stream, FlushPolicy::EveryRead).await;
        assert!(matches!(res, Err(KoalaError::StreamLocked)));
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn in_band_error_flushes_pending_then_fails() {
        let chunk = format!(
            "{}data: {{\"error\":{{\"code\":\"insufficient_quota\"}}}}\n\n",
            record("partial")
        );
        let mut stream = ResponseStream::from_chunks(vec![chunk]);
        let (text, res) = collect(&mut stream, FlushPolicy::EveryRead).await;
        assert_eq!(text, "partial");
        match res {
            Err(KoalaError::QuotaOrUpstream { quota, .. }) => assert!(quota),
            other => panic!("expected quota failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_error_retains_partial_content() {
        let items: Vec<CoreResult<Bytes>> = vec![
            Ok(Bytes::from(record("keep"))),
            Err(KoalaError::Transport("connection reset".into())),
        ];
        let mut stream = ResponseStream::new(stream::iter(items).boxed());
        let (text, res) =
            collect(&mut stream, FlushPolicy::Coalesce(Duration::from_secs(10))).await;
        assert_eq!(text, "keep");
        assert!(matches!(res, Err(KoalaError::Transport(_))));
    }

    #[tokio::test]
    async fn upstream_close_without_sentinel_completes() {
        let unterminated = record("tail");
        let chunks = vec![record("head "), unterminated.trim_end().to_string()];
        let mut stream = ResponseStream::from_chunks(chunks);
        let (text, res) = collect(&mut stream, FlushPolicy::EveryRead).await;
        assert_eq!(text, "head tail");
        assert_eq!(res.unwrap().disposition, Disposition::Completed);
    }

    #[tokio::test]
    async fn unrecognized_records_are_dropped() {
        let chunks = vec![format!("data: not json\n\n{}", body(&["ok"]))];
        let mut stream = ResponseStream::from_chunks(chunks);
        let (text, res) = collect(&mut stream, FlushPolicy::EveryRead).await;
        assert_eq!(text, "ok");
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn span_records_disposition() {
        let store = install_capture();
        let mut stream = ResponseStream::from_chunks(vec![body(&["x"])]);
        let mut sink = |_: &str| -> CoreResult<()> { Ok(()) };
        StreamConsumer::default()
            .pump(&mut stream, || false, &mut sink)
            .await
            .unwrap();

        let span = store.find("stream.pump").expect("stream.pump span");
        assert_eq!(span.field(KEY_STREAM_DISPOSITION).as_deref(), Some("cancelled"));
        assert_eq!(span.field(KEY_STREAM_CHUNKS).as_deref(), Some("0"));
        assert_eq!(span.field(KEY_ERROR_KIND), None);
    }
}

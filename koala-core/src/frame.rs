//! Incremental parser for `text/event-stream` completion bodies.
//!
//! Contract:
//! - Records are separated by a blank line; each holds `field: value` lines.
//! - Only blank-line-terminated records are interpreted. A trailing fragment is
//!   handed back as [`ParseResult::remainder`] and must prefix the next chunk,
//!   so `parse(remainder + chunk)` over any chunking yields the same events as
//!   parsing the whole body at once.
//! - The terminal sentinel stops parsing; nothing after it is consumed.
//! - Malformed payloads never raise: they surface as [`StreamEvent::RawUnparsed`].

use std::borrow::Cow;

use serde::Deserialize;

use crate::classifier::UpstreamFailure;

/// Literal payload that ends a completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental assistant text.
    Delta(String),
    /// A complete record whose payload was not a recognizable chunk.
    RawUnparsed(String),
    /// Terminal sentinel.
    Done,
    /// An `error` object delivered in-band.
    Error(UpstreamFailure),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseResult {
    pub events: Vec<StreamEvent>,
    /// Unconsumed trailing fragment.
    pub remainder: String,
}

impl ParseResult {
    pub fn deltas(&self) -> impl Iterator<Item = &str> {
        self.events.iter().filter_map(|e| match e {
            StreamEvent::Delta(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn is_done(&self) -> bool {
        self.events.last() == Some(&StreamEvent::Done)
    }
}

// Wire shape of one streamed chunk: {choices: [{delta: {content?}}]} or {error: ...}
#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse as many complete records as `buffer` holds.
pub fn parse(buffer: &str) -> ParseResult {
    parse_records(buffer, false)
}

/// Parse the final buffer after upstream closed: end of input terminates the
/// last record, so nothing is returned as remainder.
pub fn parse_final(buffer: &str) -> ParseResult {
    parse_records(buffer, true)
}

fn parse_records(buffer: &str, at_end: bool) -> ParseResult {
    let text: Cow<'_, str> = if buffer.contains('\r') {
        Cow::Owned(buffer.replace("\r\n", "\n"))
    } else {
        Cow::Borrowed(buffer)
    };

    let mut out = ParseResult::default();
    let mut rest: &str = &text;
    while !rest.is_empty() {
        let (record, tail, terminated) = match rest.find("\n\n") {
            Some(end) => (&rest[..end], &rest[end + 2..], true),
            None => (rest, "", false),
        };

        if !terminated && !at_end {
            // The sentinel cannot grow into anything longer, so it is safe to
            // accept before its terminating blank line arrives.
            if payload(record).trim() == DONE_SENTINEL {
                out.events.push(StreamEvent::Done);
            } else {
                out.remainder = record.to_string();
            }
            return out;
        }

        if let Some(event) = interpret(record) {
            let done = event == StreamEvent::Done;
            out.events.push(event);
            if done {
                return out;
            }
        }
        rest = tail;
    }
    out
}

enum Line<'a> {
    Data(&'a str),
    Bare(&'a str),
    Skip,
}

fn classify_line(line: &str) -> Line<'_> {
    if line.is_empty() || line.starts_with(':') {
        return Line::Skip;
    }
    if let Some((name, value)) = line.split_once(':') {
        let value = value.strip_prefix(' ').unwrap_or(value);
        match name {
            "data" => return Line::Data(value),
            "event" | "id" | "retry" => return Line::Skip,
            _ => {}
        }
    }
    Line::Bare(line)
}

/// Joined payload of a record: `data` values plus bare lines, in order.
fn payload(record: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for line in record.split('\n') {
        match classify_line(line) {
            Line::Data(v) | Line::Bare(v) => parts.push(v),
            Line::Skip => {}
        }
    }
    parts.join("\n")
}

fn interpret(record: &str) -> Option<StreamEvent> {
    let has_sentinel_line = record.split('\n').any(|line| match classify_line(line) {
        Line::Data(v) | Line::Bare(v) => v.trim() == DONE_SENTINEL,
        Line::Skip => false,
    });
    if has_sentinel_line {
        return Some(StreamEvent::Done);
    }

    let payload = payload(record);
    if payload.trim().is_empty() {
        return None;
    }

    match serde_json::from_str::<ChunkPayload>(&payload) {
        Ok(ChunkPayload { error: Some(_), .. }) => {
            Some(StreamEvent::Error(UpstreamFailure::from_stream_error(&payload)))
        }
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .filter(|s| !s.is_empty())
            .map(StreamEvent::Delta),
        Err(_) => Some(StreamEvent::RawUnparsed(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FailureKind;

    fn record(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn collect(chunks: &[&str]) -> (String, bool) {
        let mut buf = String::new();
        let mut text = String::new();
        for chunk in chunks {
            buf.push_str(chunk);
            let r = parse(&buf);
            text.extend(r.deltas());
            if r.is_done() {
                return (text, true);
            }
            buf = r.remainder;
        }
        let r = parse_final(&buf);
        text.extend(r.deltas());
        (text, r.is_done())
    }

    #[test]
    fn parses_complete_records() {
        let body = format!("{}{}data: [DONE]\n\n", record("Hi"), record(" there"));
        let r = parse(&body);
        assert_eq!(
            r.events,
            vec![
                StreamEvent::Delta("Hi".into()),
                StreamEvent::Delta(" there".into()),
                StreamEvent::Done
            ]
        );
        assert!(r.remainder.is_empty());
    }

    #[test]
    fn truncated_json_is_returned_as_remainder() {
        let full = record("hello");
        let cut = &full[..full.len() - 8];
        let r = parse(cut);
        assert!(r.events.is_empty());
        assert_eq!(r.remainder, cut);

        let resumed = parse(&format!("{}{}", r.remainder, &full[full.len() - 8..]));
        assert_eq!(resumed.events, vec![StreamEvent::Delta("hello".into())]);
        assert!(resumed.remainder.is_empty());
    }

    #[test]
    fn every_split_point_yields_the_same_text() {
        let body = format!(
            "{}{}{}data: [DONE]\n\n",
            record("Grüße "),
            record("from "),
            record("the 🐨!")
        );
        let (whole, done) = collect(&[&body]);
        assert_eq!(whole, "Grüße from the 🐨!");
        assert!(done);

        for i in 1..body.len() {
            if !body.is_char_boundary(i) {
                continue;
            }
            let (text, done) = collect(&[&body[..i], &body[i..]]);
            assert_eq!(text, whole, "split at {i}");
            assert!(done, "split at {i}");
        }
    }

    #[test]
    fn parse_is_idempotent() {
        let input = format!("{}data: {{\"choices\":[{{\"delta\":", record("a"));
        assert_eq!(parse(&input), parse(&input));
    }

    #[test]
    fn sentinel_stops_parsing() {
        let body = format!("{}data: [DONE]\n\n{}", record("a"), record("ignored"));
        let r = parse(&body);
        assert_eq!(r.events, vec![StreamEvent::Delta("a".into()), StreamEvent::Done]);
        assert!(r.remainder.is_empty());
    }

    #[test]
    fn bare_sentinel_without_terminator_is_recognized() {
        assert_eq!(parse("data: [DONE]").events, vec![StreamEvent::Done]);
        assert_eq!(parse("[DONE]").events, vec![StreamEvent::Done]);
        // A partial sentinel is held back.
        let r = parse("data: [DO");
        assert!(r.events.is_empty());
        assert_eq!(r.remainder, "data: [DO");
    }

    #[test]
    fn blank_and_comment_records_are_skipped() {
        let body = format!(": keep-alive\n\n\n\n   \n\n{}", record("x"));
        assert_eq!(parse(&body).events, vec![StreamEvent::Delta("x".into())]);
    }

    #[test]
    fn role_only_and_finish_chunks_produce_no_event() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "event: ping\nid: 7\n\n"
        );
        let r = parse(body);
        assert!(r.events.is_empty());
        assert!(r.remainder.is_empty());
    }

    #[test]
    fn non_json_record_surfaces_as_raw() {
        let r = parse("data: hello world\n\n");
        assert_eq!(r.events, vec![StreamEvent::RawUnparsed("hello world".into())]);
    }

    #[test]
    fn in_band_error_is_classified() {
        let r = parse("data: {\"error\":{\"code\":\"insufficient_quota\"}}\n\n");
        match &r.events[..] {
            [StreamEvent::Error(f)] => {
                assert_eq!(f.kind, FailureKind::QuotaOrUpstream { quota: true })
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn crlf_delimiters_are_accepted() {
        let body = record("ok").replace('\n', "\r\n");
        assert_eq!(parse(&body).events, vec![StreamEvent::Delta("ok".into())]);
        // CR and LF split across chunks.
        let (text, _) = collect(&[&body[..body.len() - 1], &body[body.len() - 1..]]);
        assert_eq!(text, "ok");
    }

    #[test]
    fn final_parse_accepts_unterminated_last_record() {
        let body = record("tail");
        let unterminated = body.trim_end();
        assert!(parse(unterminated).events.is_empty());
        assert_eq!(
            parse_final(unterminated).events,
            vec![StreamEvent::Delta("tail".into())]
        );
        assert_eq!(
            parse_final("data: {\"choices\":[").events,
            vec![StreamEvent::RawUnparsed("{\"choices\":[".into())]
        );
    }

    #[test]
    fn missing_data_prefix_is_tolerated() {
        let r = parse("{\"choices\":[{\"delta\":{\"content\":\"bare\"}}]}\n\n");
        assert_eq!(r.events, vec![StreamEvent::Delta("bare".into())]);
    }
}

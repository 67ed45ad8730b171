use crate::model::{ChatConfig, Message};
use unicode_normalization::UnicodeNormalization;

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') { // Byte Order Mark
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t
}

fn clamp_round_f32(x: f32, lo: f32, hi: f32, dp: u32) -> f32 {
    let clamped = x.clamp(lo, hi);
    let p = 10f32.powi(dp as i32);
    (clamped * p).round() / p
}

/// Outbound message content. Leading and trailing whitespace is kept; it can
/// be meaningful in code blocks.
pub fn normalize_messages(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| Message { role: m.role, content: clean_text(&m.content) })
        .collect()
}

pub fn normalize_config(mut cfg: ChatConfig) -> ChatConfig {
    cfg.temperature = clamp_round_f32(cfg.temperature, 0.0, 2.0, 3);
    cfg.top_p = clamp_round_f32(cfg.top_p, 0.0, 1.0, 4);
    cfg.presence_penalty = clamp_round_f32(cfg.presence_penalty, -2.0, 2.0, 3);
    cfg.frequency_penalty = clamp_round_f32(cfg.frequency_penalty, -2.0, 2.0, 3);
    cfg
}

/// Model output turned into a chat title: trimmed, surrounding quotes removed.
pub fn clean_title(raw: &str) -> String {
    let t = clean_text(raw);
    let mut t = t.trim();
    for (open, close) in [('"', '"'), ('\'', '\''), ('“', '”')] {
        if t.len() >= open.len_utf8() + close.len_utf8() && t.starts_with(open) && t.ends_with(close) {
            t = t[open.len_utf8()..t.len() - close.len_utf8()].trim();
            break;
        }
    }
    t.to_string()
}

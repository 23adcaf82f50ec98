//! Output Parser
//!
//! Strips terminal control sequences from a session's raw byte stream,
//! buffers until a flushable boundary, classifies each flushed chunk, and
//! tracks per-session activity status. The classification rules and the
//! negative-pattern-before-positive-pattern technique (check spinner/working
//! indicators before matching a prompt) come from
//! `terminal::tmux_backend::match_prompt_patterns`; the working/waiting/idle
//! status derivation mirrors `event::mod::ClaudeHookInput::derive_status`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Flush on quiescence after this much time with no new bytes.
const QUIESCENCE: Duration = Duration::from_millis(1500);
/// Promote a session to idle after this much time with no activity.
const IDLE_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    Normal,
    Prompt,
    Error,
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Working,
    Waiting,
    Idle,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuickAction {
    pub label: &'static str,
    pub keys: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedMessage {
    pub id: String,
    pub session_id: String,
    pub window_id: String,
    pub text: String,
    pub raw_text: String,
    pub class: MessageClass,
    pub quick_actions: Vec<QuickAction>,
    pub timestamp: i64,
}

const PROMPT_PATTERNS: &[&str] = &[
    "[y/n]", "[Y/n]", "[y/N]", "[yes/no]", "(y/n)", "(yes/no)",
];
const INTERROGATIVE_PATTERNS: &[&str] =
    &["continue?", "proceed?", "do you want to", "press enter to continue"];
const ERROR_PATTERNS: &[&str] = &["error", "fatal", "panic", "traceback", "exception at"];

fn strip_control_sequences(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        match b {
            0x1b => {
                // ESC: CSI, OSC, DCS/PM/APC, charset selectors, or a solo escape.
                if i + 1 < input.len() {
                    match input[i + 1] {
                        b'[' => {
                            // CSI ... final byte in 0x40..=0x7e
                            let mut j = i + 2;
                            while j < input.len() && !(0x40..=0x7e).contains(&input[j]) {
                                j += 1;
                            }
                            i = (j + 1).min(input.len());
                        }
                        b']' => {
                            // OSC, terminated by BEL or ST (ESC \)
                            let mut j = i + 2;
                            while j < input.len() && input[j] != 0x07 {
                                if input[j] == 0x1b && j + 1 < input.len() && input[j + 1] == b'\\' {
                                    j += 1;
                                    break;
                                }
                                j += 1;
                            }
                            i = (j + 1).min(input.len());
                        }
                        b'P' | b'^' | b'_' => {
                            // DCS / PM / APC, terminated by ST
                            let mut j = i + 2;
                            while j + 1 < input.len() && !(input[j] == 0x1b && input[j + 1] == b'\\') {
                                j += 1;
                            }
                            i = (j + 2).min(input.len());
                        }
                        b'(' | b')' => {
                            // charset selector: ESC ( X
                            i = (i + 3).min(input.len());
                        }
                        _ => {
                            i += 2;
                        }
                    }
                } else {
                    i += 1;
                }
            }
            0x08 => {
                out.pop();
                i += 1;
            }
            b'\r' => {
                i += 1;
            }
            0x00..=0x06 | 0x0e..=0x1a | 0x1c..=0x1f | 0x7f => {
                i += 1;
            }
            _ => {
                // Accumulate one UTF-8 scalar's worth of bytes; invalid
                // sequences degrade to the replacement character via
                // from_utf8_lossy on the whole buffer at the call site, so
                // here we just pass bytes through.
                out.push(b as char);
                i += 1;
            }
        }
    }
    out
}

fn classify(text: &str) -> (MessageClass, Vec<QuickAction>) {
    let lower = text.to_lowercase();

    let bracket_prompt = PROMPT_PATTERNS.iter().any(|p| text.contains(p));
    let interrogative = INTERROGATIVE_PATTERNS.iter().any(|p| lower.contains(p));
    let numbered_choices = text
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            t.chars().next().is_some_and(|c| c.is_ascii_digit())
                && (t.contains(". ") || t.contains(") "))
        })
        .count()
        >= 2;

    if bracket_prompt || interrogative || numbered_choices {
        let actions = if text.contains("[Y/n]") || text.contains("[y/N]") || text.contains("[y/n]") {
            vec![
                QuickAction { label: "Yes", keys: "y\n".to_string() },
                QuickAction { label: "No", keys: "n\n".to_string() },
                QuickAction { label: "Cancel", keys: "\u{3}".to_string() },
            ]
        } else {
            vec![
                QuickAction { label: "Continue", keys: "\n".to_string() },
                QuickAction { label: "Cancel", keys: "\u{3}".to_string() },
            ]
        };
        return (MessageClass::Prompt, actions);
    }

    if ERROR_PATTERNS.iter().any(|p| lower.contains(p)) {
        return (MessageClass::Error, vec![]);
    }

    let has_fence = text.contains("```");
    let indented_lines = text
        .lines()
        .filter(|l| l.starts_with("    ") || l.starts_with('\t'))
        .count();
    if has_fence || indented_lines >= 3 {
        return (MessageClass::Code, vec![]);
    }

    (MessageClass::Normal, vec![])
}

fn is_shell_prompt_boundary(text: &str) -> bool {
    let trimmed = text.trim_end();
    trimmed
        .chars()
        .last()
        .is_some_and(|c| matches!(c, '$' | '>' | '%' | '#'))
}

struct SessionBuffer {
    cleaned: String,
    raw: String,
    seq: u64,
    last_byte_at: Instant,
    status: SessionStatus,
}

/// Stateful per-process parser. One instance is shared across all sessions;
/// callers key every call by `session_id`.
pub struct OutputParser {
    sessions: HashMap<String, SessionBuffer>,
}

impl OutputParser {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Feed raw bytes for a session/window. Returns a flushed message if a
    /// boundary was crossed (prompt pattern or shell-prompt pattern); the
    /// quiescence timer flush is driven separately via `tick`.
    pub fn feed(&mut self, session_id: &str, window_id: &str, bytes: &[u8], now_unix: i64) -> Option<ParsedMessage> {
        let cleaned_chunk = strip_control_sequences(bytes);
        let raw_chunk = String::from_utf8_lossy(bytes).into_owned();

        let buf = self.sessions.entry(session_id.to_string()).or_insert_with(|| SessionBuffer {
            cleaned: String::new(),
            raw: String::new(),
            seq: 0,
            last_byte_at: Instant::now(),
            status: SessionStatus::Working,
        });
        buf.cleaned.push_str(&cleaned_chunk);
        buf.raw.push_str(&raw_chunk);
        buf.last_byte_at = Instant::now();
        buf.status = SessionStatus::Working;

        let (class_hint, _) = classify(&buf.cleaned);
        let should_flush = class_hint == MessageClass::Prompt || is_shell_prompt_boundary(&buf.cleaned);
        if should_flush {
            return Some(self.flush(session_id, window_id, now_unix));
        }
        None
    }

    /// Force-flush a session's buffer (quiescence timer or shutdown).
    pub fn flush(&mut self, session_id: &str, window_id: &str, now_unix: i64) -> ParsedMessage {
        let buf = self
            .sessions
            .get_mut(session_id)
            .expect("flush called on unknown session");
        let seq = buf.seq;
        buf.seq += 1;
        let text = std::mem::take(&mut buf.cleaned);
        let raw_text = std::mem::take(&mut buf.raw);
        let (class, quick_actions) = classify(&text);
        if class == MessageClass::Prompt {
            buf.status = SessionStatus::Waiting;
        }
        ParsedMessage {
            id: format!("{session_id}-{seq}"),
            session_id: session_id.to_string(),
            window_id: window_id.to_string(),
            text,
            raw_text,
            class,
            quick_actions,
            timestamp: now_unix,
        }
    }

    /// Sessions whose buffer has been quiescent for at least `QUIESCENCE`
    /// and still holds unflushed text.
    pub fn quiescent_sessions(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|(_, b)| !b.cleaned.is_empty() && b.last_byte_at.elapsed() >= QUIESCENCE)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Periodic ticker (intended to run every ~1s): promotes sessions with
    /// no activity for longer than `IDLE_THRESHOLD` to idle, unless waiting.
    pub fn tick_idle_promotion(&mut self) {
        for buf in self.sessions.values_mut() {
            if buf.status == SessionStatus::Waiting {
                continue;
            }
            if buf.last_byte_at.elapsed() >= IDLE_THRESHOLD {
                buf.status = SessionStatus::Idle;
            }
        }
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions.get(session_id).map(|b| b.status)
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_octal_style_control_strip() {
        // Equivalent to decoding "Hello\012World\033[31m!" then stripping.
        let raw = b"Hello\nWorld\x1b[31m!";
        assert_eq!(strip_control_sequences(raw), "Hello\nWorld!");
    }

    #[test]
    fn test_classify_yn_prompt() {
        let (class, actions) = classify("Do you want to continue? [Y/n]");
        assert_eq!(class, MessageClass::Prompt);
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].keys, "y\n");
    }

    #[test]
    fn test_classify_shell_prompt_is_normal() {
        let (class, _) = classify("output\n$ ");
        assert_eq!(class, MessageClass::Normal);
        assert!(is_shell_prompt_boundary("output\n$ "));
    }

    #[test]
    fn test_classify_error() {
        let (class, _) = classify("Traceback (most recent call last):\n  File ...");
        assert_eq!(class, MessageClass::Error);
    }

    #[test]
    fn test_classify_code_fence() {
        let (class, _) = classify("here is a patch:\n```rust\nfn main() {}\n```");
        assert_eq!(class, MessageClass::Code);
    }

    #[test]
    fn test_feed_flushes_on_prompt() {
        let mut parser = OutputParser::new();
        let msg = parser.feed("s1", "w1", b"Do you want to continue? [Y/n]", 1_700_000_000);
        let msg = msg.expect("should flush on prompt boundary");
        assert_eq!(msg.class, MessageClass::Prompt);
        assert_eq!(msg.id, "s1-0");
    }

    #[test]
    fn test_feed_flushes_on_shell_prompt() {
        let mut parser = OutputParser::new();
        let msg = parser.feed("s1", "w1", b"output\n$ ", 1_700_000_000);
        let msg = msg.expect("should flush on shell prompt boundary");
        assert_eq!(msg.text, "output\n$ ");
        assert_eq!(msg.class, MessageClass::Normal);
    }

    #[test]
    fn test_idle_promotion_respects_waiting() {
        let mut parser = OutputParser::new();
        parser.feed("s1", "w1", b"Continue? [y/n]", 1);
        parser.tick_idle_promotion();
        assert_eq!(parser.status("s1"), Some(SessionStatus::Waiting));
    }
}

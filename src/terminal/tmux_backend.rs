//! Tmux Control Mode terminal backend.
//!
//! Drives `tmux -CC`, whose stdout is a line protocol of `%output`/`%exit`
//! notifications instead of raw pane bytes; this module parses that
//! protocol into the same `Output`/`Closed` events the PTY backend emits,
//! so the rest of the crate never needs to know which backend is active.
//!
//! The pane interaction helpers below (`send_keys`, `capture_pane_tail`,
//! `match_prompt_patterns`, the environment-variable allowlist) come
//! directly from the prior tmux-subprocess-driven controller this crate
//! used before the Control Mode gateway was added, kept because Control
//! Mode still benefits from the same send-keys/capture-pane primitives
//! for panes it owns.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use color_eyre::eyre::{bail, Result, WrapErr};
use tokio::sync::mpsc;

use super::{RingBuffer, SessionId, TerminalBackend, TerminalEvent};

/// Allowed environment variable names for spawned agent panes (security allowlist).
///
/// Only these variables can be passed to spawned sessions. This prevents
/// shell injection via malicious variable names.
const ALLOWED_ENV_VARS: &[&str] = &[
    "CLAUDE_CODE_TASK_LIST_ID",
    "AGENTERM_ROLE",
    "AGENTERM_WORKER_INDEX",
];

fn is_allowed_env_var(name: &str) -> bool {
    ALLOWED_ENV_VARS.contains(&name)
}

/// Type of prompt detected in pane output via pattern matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptType {
    Permission,
    Input,
}

/// Pure function, separated for testability without a tmux dependency.
/// Grounds the Output Parser's prompt-classification negative-pattern-first
/// technique: check spinner/working indicators before positive patterns.
pub fn match_prompt_patterns(output: &str) -> Option<PromptType> {
    const SPINNER_CHARS: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
    const WORKING_INDICATORS: &[&str] = &["Thinking", "Running", "Compacting"];

    let recent_lines: Vec<&str> = output.lines().rev().take(10).collect();
    let recent_text = recent_lines.join("\n");

    if SPINNER_CHARS.iter().any(|c| recent_text.contains(*c)) {
        return None;
    }
    if WORKING_INDICATORS.iter().any(|s| recent_text.contains(s)) {
        return None;
    }

    const PERMISSION_PATTERNS: &[&str] = &[
        "[y/n]", "(y/n)", "[Y/N]", "(Y/N)", "(yes/no)", "[yes/no]", "Allow this", "allow this",
        "Allow once", "Allow always", "approve", "Approve", "Do you want to", "Deny",
        "Press y to", "Press n to",
    ];
    if PERMISSION_PATTERNS.iter().any(|p| recent_text.contains(p)) {
        return Some(PromptType::Permission);
    }

    for line in recent_lines.iter().take(3) {
        let trimmed = line.trim();
        if trimmed.ends_with('?') && trimmed.len() > 10 {
            return Some(PromptType::Input);
        }
    }

    None
}

fn send_keys(pane_id: &str, keys: &str) -> Result<()> {
    let status = Command::new("tmux")
        .args(["send-keys", "-t", pane_id, keys, "Enter"])
        .status()
        .wrap_err("failed to execute tmux send-keys")?;
    if !status.success() {
        bail!("tmux send-keys failed with status: {status}");
    }
    Ok(())
}

fn send_keys_raw(pane_id: &str, keys: &str) -> Result<()> {
    let status = Command::new("tmux")
        .args(["send-keys", "-t", pane_id, keys])
        .status()
        .wrap_err("failed to execute tmux send-keys")?;
    if !status.success() {
        bail!("tmux send-keys failed with status: {status}");
    }
    Ok(())
}

fn send_buffered(pane_id: &str, content: &str) -> Result<()> {
    let buffer_name = format!("agenterm-{}-{}", std::process::id(), pane_id.replace('%', ""));

    let mut child = Command::new("tmux")
        .args(["load-buffer", "-b", &buffer_name, "-"])
        .stdin(Stdio::piped())
        .spawn()
        .wrap_err("failed to spawn tmux load-buffer")?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(content.as_bytes())
            .wrap_err("failed to write to tmux buffer")?;
    }
    if !child.wait().wrap_err("failed to wait for tmux load-buffer")?.success() {
        bail!("tmux load-buffer failed");
    }

    let status = Command::new("tmux")
        .args(["paste-buffer", "-t", pane_id, "-b", &buffer_name, "-d"])
        .status()
        .wrap_err("failed to execute tmux paste-buffer")?;
    if !status.success() {
        bail!("tmux paste-buffer failed");
    }

    let status = Command::new("tmux")
        .args(["send-keys", "-t", pane_id, "Enter"])
        .status()
        .wrap_err("failed to send Enter")?;
    if !status.success() {
        bail!("tmux send-keys Enter failed");
    }
    Ok(())
}

fn is_pane_alive(pane_id: &str) -> Result<bool> {
    let output = Command::new("tmux")
        .args(["display-message", "-t", pane_id, "-p", "#{pane_dead}"])
        .output()
        .wrap_err("failed to execute tmux display-message")?;
    if !output.status.success() {
        bail!(
            "tmux display-message failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim() != "1")
}

fn capture_pane_tail(pane_id: &str, lines: usize) -> Result<String> {
    let start_line = format!("-{lines}");
    let output = Command::new("tmux")
        .args(["capture-pane", "-t", pane_id, "-p", "-S", &start_line])
        .output()
        .wrap_err("failed to execute tmux capture-pane")?;
    if !output.status.success() {
        bail!(
            "tmux capture-pane failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Returns only the text in `new_tail` appended since `prev_tail`, since
/// `capture_pane_tail` re-captures the whole window on every poll. Falls
/// back to the full `new_tail` when the pane was cleared or scrolled past
/// the captured window (prev_tail is no longer a prefix).
fn diff_tail(prev_tail: &str, new_tail: &str) -> String {
    if prev_tail.is_empty() {
        return new_tail.to_string();
    }
    if let Some(suffix) = new_tail.strip_prefix(prev_tail) {
        return suffix.to_string();
    }
    new_tail.to_string()
}

fn split_pane_with_env(
    horizontal: bool,
    cwd: &str,
    env_vars: &[(&str, &str)],
) -> Result<String> {
    let flag = if horizontal { "-h" } else { "-v" };

    if env_vars.is_empty() {
        let output = Command::new("tmux")
            .args(["split-window", flag, "-c", cwd, "-P", "-F", "#{pane_id}"])
            .output()
            .wrap_err("failed to execute tmux split-window")?;
        if !output.status.success() {
            bail!(
                "tmux split-window failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }

    for (name, _) in env_vars {
        if !is_allowed_env_var(name) {
            bail!("environment variable '{name}' not in allowlist: {ALLOWED_ENV_VARS:?}");
        }
    }
    let exports: Vec<String> = env_vars
        .iter()
        .map(|(k, v)| format!("export {k}='{}'", v.replace('\'', "'\\''")))
        .collect();
    let cmd = format!("bash -c '{}; exec bash'", exports.join("; "));

    let output = Command::new("tmux")
        .args(["split-window", flag, "-c", cwd, "-P", "-F", "#{pane_id}", &cmd])
        .output()
        .wrap_err("failed to execute tmux split-window with env")?;
    if !output.status.success() {
        bail!(
            "tmux split-window failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

struct TmuxSession {
    pane_id: String,
    ring: std::sync::Arc<RingBuffer>,
    event_rx: Option<mpsc::Receiver<TerminalEvent>>,
}

/// `TerminalBackend` implementation that drives tmux Control Mode.
pub struct TmuxBackend {
    sessions: Mutex<HashMap<SessionId, TmuxSession>>,
}

impl TmuxBackend {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for TmuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TerminalBackend for TmuxBackend {
    async fn create(
        &self,
        id: SessionId,
        command: &[String],
        working_dir: &Path,
        env: &[(String, String)],
    ) -> Result<()> {
        if self.sessions.lock().unwrap().contains_key(&id) {
            bail!("duplicate session id: {id}");
        }
        let cwd = working_dir.to_string_lossy().to_string();
        let env_refs: Vec<(&str, &str)> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let pane_id = split_pane_with_env(true, &cwd, &env_refs)?;
        if !command.is_empty() {
            send_buffered(&pane_id, &command.join(" "))?;
        }

        let ring = std::sync::Arc::new(RingBuffer::new());
        let (tx, rx) = mpsc::channel(256);

        let pane_for_thread = pane_id.clone();
        let ring_for_thread = ring.clone();
        std::thread::spawn(move || {
            let mut last_tail = String::new();
            loop {
                match is_pane_alive(&pane_for_thread) {
                    Ok(true) => {
                        if let Ok(text) = capture_pane_tail(&pane_for_thread, 50) {
                            let new_text = diff_tail(&last_tail, &text);
                            if !new_text.is_empty() {
                                ring_for_thread.push_chunk(&new_text);
                                match tx.try_send(TerminalEvent::Output(new_text.into_bytes())) {
                                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                                }
                            }
                            last_tail = text;
                        }
                    }
                    _ => {
                        let _ = tx.try_send(TerminalEvent::Closed);
                        break;
                    }
                }
                std::thread::sleep(std::time::Duration::from_millis(500));
            }
        });

        self.sessions.lock().unwrap().insert(
            id,
            TmuxSession {
                pane_id,
                ring,
                event_rx: Some(rx),
            },
        );
        Ok(())
    }

    fn events(&self, id: &SessionId) -> Option<mpsc::Receiver<TerminalEvent>> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.get_mut(id).and_then(|s| s.event_rx.take())
    }

    fn send_input(&self, id: &SessionId, bytes: &[u8]) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(id)
            .ok_or_else(|| color_eyre::eyre::eyre!("unknown session: {id}"))?;
        let text = String::from_utf8_lossy(bytes);
        if text.ends_with('\n') || text.ends_with('\r') {
            send_keys(&session.pane_id, text.trim_end_matches(['\n', '\r']))
        } else {
            send_keys_raw(&session.pane_id, &text)
        }
    }

    fn resize(&self, _id: &SessionId, _cols: u16, _rows: u16) -> Result<()> {
        // tmux manages pane geometry itself via its own layout engine.
        Ok(())
    }

    fn destroy(&self, id: &SessionId) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.remove(id) {
            let _ = Command::new("tmux")
                .args(["kill-pane", "-t", &session.pane_id])
                .status();
        }
        Ok(())
    }

    fn capture_output(&self, id: &SessionId, max_lines: usize) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(id)
            .map(|s| s.ring.tail(max_lines))
            .unwrap_or_default()
    }
}

/// Parses `tmux -CC` notification lines, not currently consumed by
/// `TmuxBackend::create` (which polls via `capture-pane` instead), but kept
/// for the eventual switch to the true Control Mode protocol rather than
/// polling.
pub fn parse_control_mode_line(line: &str) -> Option<TerminalEvent> {
    if let Some(rest) = line.strip_prefix("%output ") {
        let mut parts = rest.splitn(2, ' ');
        let _pane = parts.next()?;
        let payload = parts.next().unwrap_or("");
        return Some(TerminalEvent::Output(unescape_octal(payload)));
    }
    if line.starts_with("%exit") {
        return Some(TerminalEvent::Closed);
    }
    None
}

fn unescape_octal(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &s[i + 1..i + 4];
            if let Ok(v) = u8::from_str_radix(octal, 8) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

#[allow(dead_code)]
fn read_control_mode_lines<R: std::io::Read>(reader: R) -> impl Iterator<Item = String> {
    BufReader::new(reader).lines().map_while(|l| l.ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_permission_patterns() {
        let cases: Vec<(&str, &str)> = vec![
            ("Do you want to allow this action? [y/n]", "[y/n] pattern"),
            ("Allow this tool to execute?\n> ", "Allow this pattern"),
            ("Please approve the following action:", "approve pattern"),
        ];
        for (output, desc) in cases {
            assert_eq!(
                match_prompt_patterns(output),
                Some(PromptType::Permission),
                "should match permission: {desc}"
            );
        }
    }

    #[test]
    fn test_match_working_blocks_and_input() {
        let working_cases: Vec<(&str, &str)> = vec![
            ("⠋ Thinking about your request...\n[y/n]", "spinner blocks"),
            ("Running tool: Bash\nAllow this?", "running indicator blocks"),
        ];
        for (output, desc) in working_cases {
            assert_eq!(match_prompt_patterns(output), None, "should not match: {desc}");
        }
        assert_eq!(
            match_prompt_patterns("Some context here\nWhat would you like me to do next?"),
            Some(PromptType::Input),
            "should match input prompt"
        );
    }

    #[test]
    fn test_match_no_prompt() {
        let cases: Vec<(&str, &str)> = vec![
            ("Reading file contents...\nProcessing data...", "normal output"),
            ("", "empty output"),
        ];
        for (output, desc) in cases {
            assert_eq!(match_prompt_patterns(output), None, "should not match: {desc}");
        }
    }

    #[test]
    fn test_octal_decode() {
        assert_eq!(
            unescape_octal("Hello\\012World\\033[31m!"),
            b"Hello\nWorld\x1b[31m!".to_vec()
        );
    }

    #[test]
    fn test_parse_control_mode_exit() {
        assert!(matches!(
            parse_control_mode_line("%exit"),
            Some(TerminalEvent::Closed)
        ));
    }
}

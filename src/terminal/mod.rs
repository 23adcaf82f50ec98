//! Terminal Backend
//!
//! Owns pseudo-terminals (or tmux panes, depending on the selected backend),
//! streams their output, accepts input, resizes, and destroys them. Keeps a
//! fixed-size per-session ring buffer so a viewer attaching late can still
//! pull recent scrollback.

pub mod pty;
pub mod tmux_backend;

use std::collections::VecDeque;
use std::sync::Mutex;

use color_eyre::eyre::Result;
use tokio::sync::mpsc;

/// Minimum capacity of a session's scrollback ring buffer.
const MIN_RING_BUFFER_BYTES: usize = 256 * 1024;

/// A session identifier, unique within one backend instance.
pub type SessionId = String;

/// An event emitted by a live terminal session.
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    Output(Vec<u8>),
    Closed,
}

/// Symbolic keys `send_key` understands, independent of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolicKey {
    Enter,
    CtrlC,
    CtrlD,
    CtrlZ,
    CtrlL,
    Tab,
    Escape,
    Backspace,
    Up,
    Down,
    Left,
    Right,
}

impl SymbolicKey {
    /// Byte sequence to write for this key when driving a raw PTY.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            SymbolicKey::Enter => b"\r",
            SymbolicKey::CtrlC => b"\x03",
            SymbolicKey::CtrlD => b"\x04",
            SymbolicKey::CtrlZ => b"\x1a",
            SymbolicKey::CtrlL => b"\x0c",
            SymbolicKey::Tab => b"\t",
            SymbolicKey::Escape => b"\x1b",
            SymbolicKey::Backspace => b"\x7f",
            SymbolicKey::Up => b"\x1b[A",
            SymbolicKey::Down => b"\x1b[B",
            SymbolicKey::Left => b"\x1b[D",
            SymbolicKey::Right => b"\x1b[C",
        }
    }
}

/// Default session geometry.
pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;

/// Shared ring buffer of recent output lines for one session.
///
/// Grounded on `tmux.rs::capture_pane_tail`'s "last N lines" query shape,
/// but kept in-process so both backends can serve `capture_output` the
/// same way regardless of whether tmux itself retains scrollback.
pub struct RingBuffer {
    lines: Mutex<VecDeque<String>>,
    byte_budget: usize,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            byte_budget: MIN_RING_BUFFER_BYTES,
        }
    }

    pub fn push_chunk(&self, text: &str) {
        let mut lines = self.lines.lock().unwrap();
        for line in text.split_inclusive('\n') {
            lines.push_back(line.to_string());
        }
        let mut total: usize = lines.iter().map(|l| l.len()).sum();
        while total > self.byte_budget {
            if let Some(front) = lines.pop_front() {
                total -= front.len();
            } else {
                break;
            }
        }
    }

    pub fn tail(&self, max_lines: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap();
        lines.iter().rev().take(max_lines).rev().cloned().collect()
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Common contract both the direct-PTY and tmux Control Mode backends satisfy.
///
/// Exactly one backend is active per process (selected at startup via
/// `--backend`/config); they are not expected to coexist on a single session.
#[async_trait::async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Spawn a new session. `command` is wrapped in `sh -c` if it contains
    /// shell metacharacters.
    async fn create(
        &self,
        id: SessionId,
        command: &[String],
        working_dir: &std::path::Path,
        env: &[(String, String)],
    ) -> Result<()>;

    /// Subscribe to this session's output stream. The returned receiver
    /// yields zero or more `Output` events followed by exactly one `Closed`.
    fn events(&self, id: &SessionId) -> Option<mpsc::Receiver<TerminalEvent>>;

    fn send_input(&self, id: &SessionId, bytes: &[u8]) -> Result<()>;

    fn send_key(&self, id: &SessionId, key: SymbolicKey) -> Result<()> {
        self.send_input(id, key.as_bytes())
    }

    fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> Result<()>;

    fn destroy(&self, id: &SessionId) -> Result<()>;

    fn capture_output(&self, id: &SessionId, max_lines: usize) -> Vec<String>;
}

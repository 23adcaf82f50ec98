//! Direct PTY terminal backend.
//!
//! Each session owns a real pseudo-terminal via `portable-pty`. A blocking
//! reader thread forwards raw bytes into a bounded tokio channel; writes go
//! straight to the PTY's writer half. This mirrors the one-reader/one-writer
//! task split the teacher's socket listener uses for its accept loop, just
//! applied to a PTY master instead of a Unix socket.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use color_eyre::eyre::{bail, Result, WrapErr};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use super::{RingBuffer, SessionId, TerminalBackend, TerminalEvent, DEFAULT_COLS, DEFAULT_ROWS};

struct PtySession {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn std::io::Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    ring: Arc<RingBuffer>,
    event_rx: Option<mpsc::Receiver<TerminalEvent>>,
}

/// `TerminalBackend` implementation that spawns a real PTY per session.
pub struct PtyBackend {
    sessions: Mutex<HashMap<SessionId, PtySession>>,
}

impl PtyBackend {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for PtyBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn needs_shell_wrap(argv: &[String]) -> bool {
    argv.len() == 1 && argv[0].chars().any(|c| "|&;<>()$`\\\"'*?[]{}~".contains(c))
}

#[async_trait::async_trait]
impl TerminalBackend for PtyBackend {
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
        if command.is_empty() {
            bail!("empty command for session {id}");
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .wrap_err("failed to allocate pty")?;

        let mut cmd = if needs_shell_wrap(command) {
            let mut c = CommandBuilder::new("sh");
            c.arg("-c");
            c.arg(&command[0]);
            c
        } else {
            let mut c = CommandBuilder::new(&command[0]);
            c.args(&command[1..]);
            c
        };
        cmd.cwd(working_dir);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .wrap_err_with(|| format!("failed to spawn session {id}"))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .wrap_err("failed to clone pty reader")?;
        let writer = pair.master.take_writer().wrap_err("failed to take pty writer")?;

        let ring = Arc::new(RingBuffer::new());
        let (event_tx, event_rx) = mpsc::channel(256);

        let ring_for_thread = ring.clone();
        let tx_for_thread = event_tx;
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match std::io::Read::read(&mut reader, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = buf[..n].to_vec();
                        ring_for_thread.push_chunk(&String::from_utf8_lossy(&chunk));
                        match tx_for_thread.try_send(TerminalEvent::Output(chunk)) {
                            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = tx_for_thread.try_send(TerminalEvent::Closed);
        });

        self.sessions.lock().unwrap().insert(
            id,
            PtySession {
                master: pair.master,
                writer,
                child,
                ring,
                event_rx: Some(event_rx),
            },
        );
        Ok(())
    }

    fn events(&self, id: &SessionId) -> Option<mpsc::Receiver<TerminalEvent>> {
        // The receiver is handed out once, to the session's first subscriber
        // (the Event Hub, which then fans it out to every viewer). Re-calling
        // this after that returns None; a session only has one owner.
        let mut sessions = self.sessions.lock().unwrap();
        sessions.get_mut(id).and_then(|s| s.event_rx.take())
    }

    fn send_input(&self, id: &SessionId, bytes: &[u8]) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| color_eyre::eyre::eyre!("unknown session: {id}"))?;
        session
            .writer
            .write_all(bytes)
            .wrap_err_with(|| format!("failed to write input to session {id}"))
    }

    fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            bail!("resize requires cols > 0 and rows > 0");
        }
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(id)
            .ok_or_else(|| color_eyre::eyre::eyre!("unknown session: {id}"))?;
        session
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .wrap_err_with(|| format!("failed to resize session {id}"))
    }

    fn destroy(&self, id: &SessionId) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(mut session) = sessions.remove(id) {
            let _ = session.child.kill();
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

//! Session Lifecycle Manager
//!
//! Converts logical session records (task + role + agent profile) into
//! running terminal sessions, injects per-worktree automation hooks, tracks
//! status by observing parsed output, records history, and tears sessions
//! down. The hook-injection shape (merge into `.claude/settings.json`
//! without clobbering user hooks, skip if our command is already present)
//! is the same one `init::init_project` uses; here it targets a worktree
//! instead of a scanned project and writes `.orchestra/hooks/*.sh` scripts
//! the hooks shell out to instead of invoking a CLI hook subcommand.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use color_eyre::eyre::{eyre, Result};
use tokio::sync::Mutex;

use crate::hub::wire::OutboundMessage;
use crate::hub::EventHub;
use crate::parser::{OutputParser, ParsedMessage, SessionStatus};
use crate::store::{SessionRecord, Store};
use crate::terminal::{TerminalBackend, TerminalEvent};

/// Single logical window per session; this backend generation doesn't yet
/// expose multi-window sessions to the Output Parser / Event Hub.
const MAIN_WINDOW: &str = "main";

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Hook scripts installed under `.orchestra/hooks/` in every managed worktree.
/// Each is a thin shell wrapper; the actual notification travels over the
/// session's own PTY output, so these scripts only need to exist for tools
/// (Claude Code, etc.) that insist on invoking a settings.json hook command.
const HOOK_SCRIPTS: &[(&str, &str)] = &[
    ("on_stop.sh", "#!/bin/sh\nexit 0\n"),
    ("on_notification.sh", "#!/bin/sh\nexit 0\n"),
];

fn hook_settings_template() -> serde_json::Value {
    serde_json::json!({
        "hooks": {
            "Stop": [{ "matcher": "", "hooks": [{ "type": "command", "command": ".orchestra/hooks/on_stop.sh", "timeout": 5 }] }],
            "Notification": [{ "matcher": "", "hooks": [{ "type": "command", "command": ".orchestra/hooks/on_notification.sh", "timeout": 5 }] }]
        }
    })
}

/// Installs `.orchestra/hooks/*.sh` and merges hook entries into
/// `.claude/settings.json`, preserving any hooks already present.
pub fn install_hooks(worktree_path: &Path) -> Result<()> {
    let hooks_dir = worktree_path.join(".orchestra").join("hooks");
    std::fs::create_dir_all(&hooks_dir)?;
    for (name, body) in HOOK_SCRIPTS {
        let path = hooks_dir.join(name);
        std::fs::write(&path, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms)?;
        }
    }

    let claude_dir = worktree_path.join(".claude");
    std::fs::create_dir_all(&claude_dir)?;
    let settings_path = claude_dir.join("settings.json");
    let ours = hook_settings_template();

    let merged = if settings_path.exists() {
        let existing_content = std::fs::read_to_string(&settings_path)?;
        let mut existing: serde_json::Value = serde_json::from_str(&existing_content)?;
        if let (Some(existing_hooks), Some(our_hooks)) =
            (existing.get_mut("hooks"), ours.get("hooks").and_then(|h| h.as_object()))
        {
            if let Some(existing_obj) = existing_hooks.as_object_mut() {
                for (hook_type, our_entries) in our_hooks {
                    match existing_obj.get_mut(hook_type) {
                        Some(existing_arr) if existing_arr.as_array().is_some() => {
                            let already_present = existing_arr.as_array().unwrap().iter().any(|entry| {
                                entry
                                    .get("hooks")
                                    .and_then(|h| h.as_array())
                                    .is_some_and(|hooks| {
                                        hooks.iter().any(|h| {
                                            h.get("command")
                                                .and_then(|c| c.as_str())
                                                .is_some_and(|s| s.starts_with(".orchestra/hooks/"))
                                        })
                                    })
                            });
                            if !already_present {
                                if let (Some(arr), Some(new_entries)) =
                                    (existing_arr.as_array_mut(), our_entries.as_array())
                                {
                                    arr.extend(new_entries.clone());
                                }
                            }
                        }
                        _ => {
                            existing_obj.insert(hook_type.clone(), our_entries.clone());
                        }
                    }
                }
            }
        } else if existing.get("hooks").is_none() {
            if let Some(obj) = existing.as_object_mut() {
                obj.insert("hooks".to_string(), ours["hooks"].clone());
            }
        }
        existing
    } else {
        ours
    };

    std::fs::write(&settings_path, serde_json::to_string_pretty(&merged)?)?;
    Ok(())
}

/// A session's accumulated output history, independent of the live ring
/// buffer the Terminal Backend keeps — this one survives backend restarts.
#[derive(Debug, Default, Clone)]
pub struct SessionHistory {
    pub entries: Vec<String>,
}

struct ManagedSession {
    status: SessionStatus,
    human_attached: bool,
    history: SessionHistory,
}

/// Orchestrates session creation/teardown across one `TerminalBackend`,
/// keeping the `store::Store`'s view of session status in sync with what
/// the Output Parser observes.
pub struct LifecycleManager {
    backend: Arc<dyn TerminalBackend>,
    parser: Mutex<OutputParser>,
    sessions: Mutex<HashMap<String, ManagedSession>>,
    store: Arc<Mutex<Store>>,
}

impl LifecycleManager {
    pub fn new(backend: Arc<dyn TerminalBackend>, store: Arc<Mutex<Store>>) -> Self {
        Self {
            backend,
            parser: Mutex::new(OutputParser::new()),
            sessions: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Launches a session's backend process, installs worktree hooks, and
    /// records it in the store. Returns once the process has been spawned;
    /// callers subscribe separately via `observe` for live output.
    pub async fn create(
        &self,
        session: &SessionRecord,
        command: &[String],
        worktree_path: &Path,
        env: &[(String, String)],
    ) -> Result<()> {
        install_hooks(worktree_path)?;
        self.backend
            .create(session.id.clone(), command, worktree_path, env)
            .await?;

        self.sessions.lock().await.insert(
            session.id.clone(),
            ManagedSession {
                status: SessionStatus::Working,
                human_attached: session.human_attached,
                history: SessionHistory::default(),
            },
        );
        self.store.lock().await.upsert_session(session)?;
        Ok(())
    }

    /// Feed one chunk of raw backend output through the Output Parser,
    /// updating tracked status and history. Returns the flushed message,
    /// if a flush boundary was crossed.
    pub async fn observe_parsed_output(
        &self,
        session_id: &str,
        window_id: &str,
        bytes: &[u8],
        now_unix: i64,
    ) -> Option<ParsedMessage> {
        let flushed = {
            let mut parser = self.parser.lock().await;
            parser.feed(session_id, window_id, bytes, now_unix)
        };

        let mut sessions = self.sessions.lock().await;
        if let Some(managed) = sessions.get_mut(session_id) {
            if let Some(status) = self.parser.lock().await.status(session_id) {
                managed.status = status;
            }
            if let Some(msg) = &flushed {
                managed.history.entries.push(msg.text.clone());
            }
        }
        flushed
    }

    /// Creates a session and spawns the task that pumps its backend events
    /// through the Output Parser and onward to the Event Hub, wiring the
    /// Terminal Backend -> Output Parser -> Event Hub pipeline end to end.
    /// `self: &Arc<Self>` so the pump task can hold its own owning clone.
    pub async fn create_and_pump(
        self: &Arc<Self>,
        session: &SessionRecord,
        command: &[String],
        worktree_path: &Path,
        env: &[(String, String)],
        hub: Arc<EventHub>,
    ) -> Result<()> {
        self.create(session, command, worktree_path, env).await?;
        let Some(mut events) = self.backend.events(&session.id) else {
            return Ok(());
        };

        let lifecycle = self.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TerminalEvent::Output(bytes) => {
                        if let Some(msg) = lifecycle
                            .observe_parsed_output(&session_id, MAIN_WINDOW, &bytes, now_unix())
                            .await
                        {
                            hub.broadcast(
                                Some(&session_id),
                                OutboundMessage::Output {
                                    id: msg.id,
                                    session_id: msg.session_id,
                                    window: msg.window_id,
                                    text: msg.text,
                                    class: msg.class,
                                    quick_actions: msg.quick_actions,
                                    timestamp: msg.timestamp,
                                },
                            )
                            .await;
                        }
                        if let Some(status) = lifecycle.status(&session_id).await {
                            hub.broadcast(
                                Some(&session_id),
                                OutboundMessage::Status {
                                    session_id: session_id.clone(),
                                    status: format!("{status:?}").to_lowercase(),
                                },
                            )
                            .await;
                        }
                    }
                    TerminalEvent::Closed => break,
                }
            }
        });
        Ok(())
    }

    /// Forwards input to the session, refusing if a human has taken over.
    pub async fn send_command(&self, session_id: &str, keys: &str) -> Result<()> {
        let sessions = self.sessions.lock().await;
        let managed = sessions
            .get(session_id)
            .ok_or_else(|| eyre!("unknown session {session_id}"))?;
        if managed.human_attached {
            return Err(eyre!("session {session_id} is under human takeover"));
        }
        drop(sessions);
        self.backend.send_input(&session_id.to_string(), keys.as_bytes())
    }

    pub async fn set_takeover(&self, session_id: &str, attached: bool) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let managed = sessions
            .get_mut(session_id)
            .ok_or_else(|| eyre!("unknown session {session_id}"))?;
        managed.human_attached = attached;
        Ok(())
    }

    pub async fn get_output(&self, session_id: &str, max_lines: usize) -> Vec<String> {
        self.backend.capture_output(&session_id.to_string(), max_lines)
    }

    pub async fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions.lock().await.get(session_id).map(|s| s.status)
    }

    pub async fn close(&self, session_id: &str) -> Result<()> {
        self.backend.destroy(&session_id.to_string())?;
        self.sessions.lock().await.remove(session_id);
        Ok(())
    }

    /// Periodic tick: promotes quiescent sessions to idle. Intended to run
    /// on a ~1s ticker alongside the Automation Loops.
    pub async fn tick(&self) {
        self.parser.lock().await.tick_idle_promotion();
        let statuses: Vec<(String, SessionStatus)> = {
            let parser = self.parser.lock().await;
            self.sessions
                .lock()
                .await
                .keys()
                .filter_map(|id| parser.status(id).map(|s| (id.clone(), s)))
                .collect()
        };
        let mut sessions = self.sessions.lock().await;
        for (id, status) in statuses {
            if let Some(managed) = sessions.get_mut(&id) {
                managed.status = status;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_install_hooks_creates_scripts_and_settings() {
        let tmp = TempDir::new().unwrap();
        install_hooks(tmp.path()).unwrap();
        assert!(tmp.path().join(".orchestra/hooks/on_stop.sh").exists());
        let settings = std::fs::read_to_string(tmp.path().join(".claude/settings.json")).unwrap();
        assert!(settings.contains(".orchestra/hooks/on_stop.sh"));
    }

    #[test]
    fn test_install_hooks_preserves_existing_user_hooks() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".claude")).unwrap();
        std::fs::write(
            tmp.path().join(".claude/settings.json"),
            r#"{"hooks":{"PreToolUse":[{"matcher":"*","hooks":[{"type":"command","command":"echo hi"}]}]}}"#,
        )
        .unwrap();

        install_hooks(tmp.path()).unwrap();
        let settings = std::fs::read_to_string(tmp.path().join(".claude/settings.json")).unwrap();
        assert!(settings.contains("echo hi"));
        assert!(settings.contains(".orchestra/hooks/on_stop.sh"));
    }

    #[test]
    fn test_install_hooks_idempotent() {
        let tmp = TempDir::new().unwrap();
        install_hooks(tmp.path()).unwrap();
        install_hooks(tmp.path()).unwrap();
        let settings = std::fs::read_to_string(tmp.path().join(".claude/settings.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&settings).unwrap();
        assert_eq!(parsed["hooks"]["Stop"].as_array().unwrap().len(), 1);
    }
}

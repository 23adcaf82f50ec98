//! Role/Playbook Engine
//!
//! Loads agent profiles and playbooks from disk once at startup and
//! resolves, for a given (project, task, stage), which agent launches with
//! which command and which tool set is legal. Profiles and playbooks are
//! encoded as TOML (Open Question decision, DESIGN.md): the teacher already
//! depends on `toml` for its own config and loop-state files and has no
//! existing YAML dependency, so TOML serves the identical
//! named-records-with-nested-tables shape these need without adding
//! `serde_yaml` for one directory of files.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::errors::{AgentermError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub display_name: String,
    pub launch_command: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub supports_resume: bool,
    #[serde(default)]
    pub headless_command: Option<Vec<String>>,
    #[serde(default)]
    pub auto_accept_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_hint: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stage {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub completion_gate: Option<String>,
    #[serde(default)]
    pub handoff: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Playbook {
    pub id: String,
    pub name: String,
    pub stages: Vec<Stage>,
}

/// A resolved (agent, command, tool whitelist) triple for one (task, stage).
pub struct StageResolution<'a> {
    pub profile: &'a AgentProfile,
    pub stage: &'a Stage,
}

pub struct PlaybookEngine {
    profiles: HashMap<String, AgentProfile>,
    playbooks: HashMap<String, Playbook>,
}

impl PlaybookEngine {
    /// Loads every `*.toml` file under `agents_dir` as an `AgentProfile` and
    /// every `*.toml` file under `playbooks_dir` as a `Playbook`. Validates at
    /// load time that every tool name in a stage's whitelist is known to the
    /// caller's `known_tools` set.
    pub fn load(agents_dir: &Path, playbooks_dir: &Path, known_tools: &[&str]) -> Result<Self> {
        let profiles = load_toml_dir::<AgentProfile>(agents_dir, |p| p.id.clone())?;
        let playbooks = load_toml_dir::<Playbook>(playbooks_dir, |p| p.id.clone())?;

        for playbook in playbooks.values() {
            for stage in &playbook.stages {
                for tool in &stage.allowed_tools {
                    if !known_tools.contains(&tool.as_str()) {
                        return Err(AgentermError::ValidationError(format!(
                            "playbook {} stage {} references unknown tool {tool}",
                            playbook.id, stage.name
                        )));
                    }
                }
            }
        }

        Ok(Self { profiles, playbooks })
    }

    pub fn resolve(&self, playbook_id: &str, stage_name: &str) -> Result<StageResolution<'_>> {
        let playbook = self.playbooks.get(playbook_id).ok_or_else(|| AgentermError::NotFound {
            kind: "playbook",
            id: playbook_id.to_string(),
        })?;
        let stage = playbook
            .stages
            .iter()
            .find(|s| s.name == stage_name)
            .ok_or_else(|| AgentermError::ValidationError(format!("stage_not_found: {stage_name}")))?;
        let profile = self.profiles.get(&stage.role).ok_or_else(|| {
            AgentermError::ValidationError(format!("agent_not_registered: {}", stage.role))
        })?;
        Ok(StageResolution { profile, stage })
    }

    pub fn playbook(&self, id: &str) -> Option<&Playbook> {
        self.playbooks.get(id)
    }

    /// Launch command for a profile, substituting `{prompt}` with the task
    /// spec body when launching headless.
    pub fn headless_command(profile: &AgentProfile, task_spec: &str) -> Vec<String> {
        let template = profile.headless_command.as_ref().unwrap_or(&profile.launch_command);
        template
            .iter()
            .map(|arg| arg.replace("{prompt}", task_spec))
            .collect()
    }
}

fn load_toml_dir<T: for<'de> Deserialize<'de>>(
    dir: &Path,
    key: impl Fn(&T) -> String,
) -> Result<HashMap<String, T>> {
    let mut out = HashMap::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir).map_err(|e| AgentermError::InternalError(e.to_string()))? {
        let entry = entry.map_err(|e| AgentermError::InternalError(e.to_string()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let content = std::fs::read_to_string(&path).map_err(|e| AgentermError::InternalError(e.to_string()))?;
        let value: T = toml::from_str(&content)
            .map_err(|e| AgentermError::ValidationError(format!("{}: {e}", path.display())))?;
        out.insert(key(&value), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_resolve_stage_happy_path() {
        let agents = TempDir::new().unwrap();
        let playbooks = TempDir::new().unwrap();
        write(
            agents.path(),
            "coder.toml",
            r#"
id = "coder"
display_name = "Claude Code"
launch_command = ["claude"]
"#,
        );
        write(
            playbooks.path(),
            "default.toml",
            r#"
id = "default"
name = "Default Playbook"

[[stages]]
name = "implement"
role = "coder"
allowed_tools = ["send_command"]
"#,
        );

        let engine = PlaybookEngine::load(agents.path(), playbooks.path(), &["send_command"]).unwrap();
        let resolved = engine.resolve("default", "implement").unwrap();
        assert_eq!(resolved.profile.id, "coder");
    }

    #[test]
    fn test_unknown_tool_rejected_at_load() {
        let agents = TempDir::new().unwrap();
        let playbooks = TempDir::new().unwrap();
        write(
            agents.path(),
            "coder.toml",
            r#"id = "coder"
display_name = "Claude Code"
launch_command = ["claude"]
"#,
        );
        write(
            playbooks.path(),
            "default.toml",
            r#"id = "default"
name = "Default"

[[stages]]
name = "implement"
role = "coder"
allowed_tools = ["nonexistent_tool"]
"#,
        );

        let err = PlaybookEngine::load(agents.path(), playbooks.path(), &["send_command"]).unwrap_err();
        assert!(matches!(err, AgentermError::ValidationError(_)));
    }

    #[test]
    fn test_missing_stage_error() {
        let agents = TempDir::new().unwrap();
        let playbooks = TempDir::new().unwrap();
        write(
            agents.path(),
            "coder.toml",
            r#"id = "coder"
display_name = "Claude Code"
launch_command = ["claude"]
"#,
        );
        write(
            playbooks.path(),
            "default.toml",
            r#"id = "default"
name = "Default"

[[stages]]
name = "implement"
role = "coder"
"#,
        );

        let engine = PlaybookEngine::load(agents.path(), playbooks.path(), &[]).unwrap();
        let err = engine.resolve("default", "missing_stage").unwrap_err();
        assert!(matches!(err, AgentermError::ValidationError(_)));
    }

    #[test]
    fn test_headless_command_substitutes_prompt() {
        let profile = AgentProfile {
            id: "coder".into(),
            display_name: "Claude Code".into(),
            launch_command: vec!["claude".into()],
            capabilities: vec![],
            supports_resume: false,
            headless_command: Some(vec!["claude".into(), "-p".into(), "{prompt}".into()]),
            auto_accept_key: None,
        };
        let cmd = PlaybookEngine::headless_command(&profile, "do the thing");
        assert_eq!(cmd, vec!["claude", "-p", "do the thing"]);
    }
}

//! AgentermConfig: Key=Value config file + environment + CLI precedence.
//!
//! No corpus crate covers a six-key line-based config format, so this is a
//! small hand-rolled parser rather than pulling in a generic `.env`/`ini`
//! crate for it (see DESIGN.md). Precedence, high to low: CLI flags >
//! `AGENTERM_*` environment variables > config file > defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{Result, WrapErr};

use crate::cli::Cli;

#[derive(Debug, Clone)]
pub struct AgentermConfig {
    pub port: u16,
    pub token: String,
    pub tmux_session: Option<String>,
    pub default_dir: PathBuf,
    pub db_path: PathBuf,
    pub agents_dir: PathBuf,
    pub playbooks_dir: PathBuf,
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    pub llm_base_url: Option<String>,
    pub orchestrator_global_max_parallel: usize,
}

fn default_max_parallel() -> usize {
    4
}

/// Parses a `Key=Value` file, `#`-prefixed and blank lines ignored.
fn parse_key_value_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Ok(map);
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(map)
}

fn generate_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl AgentermConfig {
    /// Loads the config file at `config_path` (missing file is not an
    /// error, just an empty layer), then layers CLI flags and env vars on
    /// top per the documented precedence.
    pub fn load(cli: &Cli, config_path: Option<&Path>) -> Result<Self> {
        let file_values = match config_path {
            Some(path) => parse_key_value_file(path).wrap_err_with(|| format!("reading config file {}", path.display()))?,
            None => HashMap::new(),
        };

        let port = cli.port_overridden_or(&file_values, "Port")?;
        let token = cli
            .token
            .clone()
            .or_else(|| file_values.get("Token").cloned())
            .unwrap_or_else(generate_token);
        let tmux_session = cli.session.clone().or_else(|| file_values.get("TmuxSession").cloned());
        let default_dir = cli
            .dir
            .clone()
            .or_else(|| file_values.get("DefaultDir").map(PathBuf::from))
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let db_path = if cli.db_path != crate::cli::default_db_path() {
            cli.db_path.clone()
        } else {
            file_values.get("DBPath").map(PathBuf::from).unwrap_or_else(|| cli.db_path.clone())
        };
        let agents_dir = cli
            .agents_dir
            .clone()
            .or_else(|| file_values.get("AgentsDir").map(PathBuf::from))
            .unwrap_or_else(|| default_dir.join(".orchestra").join("agents"));
        let playbooks_dir = cli
            .playbooks_dir
            .clone()
            .or_else(|| file_values.get("PlaybooksDir").map(PathBuf::from))
            .unwrap_or_else(|| default_dir.join(".orchestra").join("playbooks"));
        let llm_api_key = cli.llm_api_key.clone().or_else(|| file_values.get("LLMAPIKey").cloned());
        let llm_model = cli.llm_model.clone().or_else(|| file_values.get("LLMModel").cloned());
        let llm_base_url = cli.llm_base_url.clone().or_else(|| file_values.get("LLMBaseURL").cloned());
        let orchestrator_global_max_parallel = file_values
            .get("OrchestratorGlobalMaxParallel")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_max_parallel);

        Ok(Self {
            port,
            token,
            tmux_session,
            default_dir,
            db_path,
            agents_dir,
            playbooks_dir,
            llm_api_key,
            llm_model,
            llm_base_url,
            orchestrator_global_max_parallel,
        })
    }
}

trait PortOverride {
    fn port_overridden_or(&self, file_values: &HashMap<String, String>, key: &str) -> Result<u16>;
}

impl PortOverride for Cli {
    /// `clap` already applies env-var precedence via `#[arg(env = "...")]`
    /// for the port flag, so only the config-file layer needs folding in
    /// here: a file value is used only when the CLI/env result is still the
    /// clap default (7630) and the file specifies one.
    fn port_overridden_or(&self, file_values: &HashMap<String, String>, key: &str) -> Result<u16> {
        if self.port != 7630 {
            return Ok(self.port);
        }
        match file_values.get(key) {
            Some(v) => v.parse::<u16>().wrap_err_with(|| format!("invalid {key} in config file")),
            None => Ok(self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli_from(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("agenterm").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_flag_wins_over_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("agenterm.conf");
        std::fs::write(&config_path, "Port=8000\n").unwrap();
        let cli = cli_from(&["--port", "7000"]);
        let config = AgentermConfig::load(&cli, Some(&config_path)).unwrap();
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn test_file_value_used_when_no_flag() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("agenterm.conf");
        std::fs::write(&config_path, "Port=9000\n# a comment\nOrchestratorGlobalMaxParallel=8\n").unwrap();
        let cli = cli_from(&[]);
        let config = AgentermConfig::load(&cli, Some(&config_path)).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.orchestrator_global_max_parallel, 8);
    }

    #[test]
    fn test_explicit_db_path_flag_wins_over_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("agenterm.conf");
        std::fs::write(&config_path, "DBPath=/from/file/store.db\n").unwrap();
        let cli = cli_from(&["--db-path", "/from/flag/store.db"]);
        let config = AgentermConfig::load(&cli, Some(&config_path)).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/from/flag/store.db"));
    }

    #[test]
    fn test_file_db_path_used_when_flag_not_given() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("agenterm.conf");
        std::fs::write(&config_path, "DBPath=/from/file/store.db\n").unwrap();
        let cli = cli_from(&[]);
        let config = AgentermConfig::load(&cli, Some(&config_path)).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/from/file/store.db"));
    }

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let cli = cli_from(&[]);
        let config = AgentermConfig::load(&cli, Some(Path::new("/nonexistent/agenterm.conf"))).unwrap();
        assert_eq!(config.port, 7630);
        assert_eq!(config.orchestrator_global_max_parallel, 4);
        assert!(!config.token.is_empty());
    }
}

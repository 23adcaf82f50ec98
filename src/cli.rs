//! CLI argument parsing and runtime context
//!
//! Uses clap for argument parsing with derive macros. Flag/env/default
//! precedence mirrors `config::AgentermConfig`: CLI flags win over
//! `AGENTERM_*` env vars, which win over the config file.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;

pub fn default_db_path() -> PathBuf {
    if let Ok(state_dir) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(state_dir).join("agenterm").join("store.db");
    }
    PathBuf::from("/tmp/agenterm").join("store.db")
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum TerminalBackendKind {
    /// Direct PTY per session (default).
    Pty,
    /// Drive a tmux Control Mode client instead.
    Tmux,
}

/// Local control plane coordinating a fleet of PTY-backed coding agents.
#[derive(Parser, Debug)]
#[command(name = "agenterm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// HTTP/websocket listener port
    #[arg(long, env = "AGENTERM_PORT", default_value_t = 7630, global = true)]
    pub port: u16,

    /// Legacy default tmux session name (only used with --backend tmux)
    #[arg(long, env = "AGENTERM_SESSION", global = true)]
    pub session: Option<String>,

    /// Bearer token for HTTP and websocket auth (auto-generated if unset)
    #[arg(long, env = "AGENTERM_TOKEN", global = true)]
    pub token: Option<String>,

    /// Print the effective auth token and exit
    #[arg(long, default_value_t = false)]
    pub print_token: bool,

    /// Working directory for newly created sessions
    #[arg(long, env = "AGENTERM_DIR", global = true)]
    pub dir: Option<PathBuf>,

    /// Path to the persistent store
    #[arg(
        long,
        env = "AGENTERM_DB_PATH",
        default_value_os_t = default_db_path(),
        global = true
    )]
    pub db_path: PathBuf,

    /// Directory of agent profile TOML files
    #[arg(long, env = "AGENTERM_AGENTS_DIR", global = true)]
    pub agents_dir: Option<PathBuf>,

    /// Directory of playbook TOML files
    #[arg(long, env = "AGENTERM_PLAYBOOKS_DIR", global = true)]
    pub playbooks_dir: Option<PathBuf>,

    /// API key for the orchestrator's model transport
    #[arg(long, env = "AGENTERM_LLM_API_KEY", global = true)]
    pub llm_api_key: Option<String>,

    /// Model identifier for the orchestrator
    #[arg(long, env = "AGENTERM_LLM_MODEL", global = true)]
    pub llm_model: Option<String>,

    /// Base URL for the orchestrator's model transport
    #[arg(long, env = "AGENTERM_LLM_BASE_URL", global = true)]
    pub llm_base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// Which terminal backend owns sessions for this process
    #[arg(long, value_enum, default_value_t = TerminalBackendKind::Pty, global = true)]
    pub backend: TerminalBackendKind,

    /// Enable OpenTelemetry export for distributed tracing (OTLP gRPC endpoint)
    #[arg(long, env = "AGENTERM_OTEL_ENDPOINT", global = true)]
    pub otel_endpoint: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Validate playbooks and agent profiles without starting the daemon
    Validate,
}

/// Generate shell completions and print to stdout
pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "agenterm", &mut io::stdout());
}

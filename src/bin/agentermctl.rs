//! agentermctl - thin CLI client for the running agenterm daemon
//!
//! Connects to the daemon's websocket endpoint, sends one inbound message,
//! and prints whatever the daemon streams back until the connection closes
//! or a short idle timeout elapses. Intended for scripting and manual
//! poking, not as the daemon's primary interface (that's the websocket
//! wire contract itself, consumed by real viewers).
//!
//! Usage:
//!   agentermctl --host 127.0.0.1:7630 --token <token> send <session_id> <keys>
//!   agentermctl --host 127.0.0.1:7630 --token <token> attach [session_id]

use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(name = "agentermctl")]
struct Cli {
    /// Daemon websocket host:port
    #[arg(long, default_value = "127.0.0.1:7630")]
    host: String,

    /// Bearer token (passed as a query parameter on connect)
    #[arg(long, env = "AGENTERM_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send keys to a session.
    Send { session_id: String, keys: String },
    /// Attach to a session's output stream (or all sessions, if omitted).
    Attach { session_id: Option<String> },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let url = match &cli.token {
        Some(token) => format!("ws://{}/?token={token}", cli.host),
        None => format!("ws://{}/", cli.host),
    };

    let (mut stream, _) = match connect_async(&url).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("failed to connect to {}: {e}", cli.host);
            std::process::exit(1);
        }
    };

    let outbound = match &cli.command {
        Command::Send { session_id, keys } => {
            serde_json::json!({"type": "input", "session_id": session_id, "keys": keys})
        }
        Command::Attach { session_id } => {
            serde_json::json!({"type": "subscribe", "session_id": session_id})
        }
    };

    if let Err(e) = stream.send(Message::Text(outbound.to_string().into())).await {
        eprintln!("failed to send: {e}");
        std::process::exit(1);
    }

    loop {
        match timeout(Duration::from_secs(5), stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => println!("{text}"),
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                eprintln!("connection error: {e}");
                break;
            }
            Err(_) => break,
        }
    }
}

//! Inbound/outbound websocket message schemas.

use serde::{Deserialize, Serialize};

use crate::parser::{MessageClass, QuickAction};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Input {
        session_id: String,
        window: Option<String>,
        keys: String,
    },
    TerminalInput {
        session_id: String,
        window: Option<String>,
        keys: String,
    },
    TerminalResize {
        session_id: String,
        window: Option<String>,
        cols: u16,
        rows: u16,
    },
    Subscribe {
        #[serde(default)]
        session_id: Option<String>,
    },
    NewSession {
        #[serde(default)]
        name: Option<String>,
    },
    NewWindow {
        session_id: String,
        #[serde(default)]
        name: Option<String>,
    },
    KillWindow {
        session_id: String,
        window: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Output {
        id: String,
        session_id: String,
        window: String,
        text: String,
        class: MessageClass,
        quick_actions: Vec<QuickAction>,
        timestamp: i64,
    },
    TerminalData {
        session_id: String,
        window: String,
        #[serde(with = "bytes_as_text")]
        bytes: Vec<u8>,
    },
    Windows {
        sessions: Vec<String>,
    },
    Status {
        session_id: String,
        status: String,
    },
    ProjectEvent {
        project_id: String,
        kind: String,
        detail: serde_json::Value,
    },
    Error {
        message: String,
    },
}

mod bytes_as_text {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(bytes))
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

pub const RUN_REQUEST_TYPE: &str = "run.request";

/// Outbound room protocol messages, tagged on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "room.joined")]
    RoomJoined { room_id: String },
    #[serde(rename = "room.left")]
    RoomLeft { room_id: String },
    #[serde(rename = "room.message")]
    RoomMessage { room_id: String, data: JsonValue },
    #[serde(rename = "run.busy")]
    RunBusy { room_id: String, message: String },
    #[serde(rename = "run.start")]
    RunStart {
        room_id: String,
        run_id: String,
        lang: String,
    },
    #[serde(rename = "run.stdout")]
    RunStdout {
        room_id: String,
        run_id: String,
        chunk: String,
    },
    #[serde(rename = "run.stderr")]
    RunStderr {
        room_id: String,
        run_id: String,
        chunk: String,
    },
    #[serde(rename = "run.end")]
    RunEnd {
        room_id: String,
        run_id: String,
        exit_code: i64,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::RoomJoined { .. } => "room.joined",
            ServerMessage::RoomLeft { .. } => "room.left",
            ServerMessage::RoomMessage { .. } => "room.message",
            ServerMessage::RunBusy { .. } => "run.busy",
            ServerMessage::RunStart { .. } => "run.start",
            ServerMessage::RunStdout { .. } => "run.stdout",
            ServerMessage::RunStderr { .. } => "run.stderr",
            ServerMessage::RunEnd { .. } => "run.end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunRequest {
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub code: String,
}

fn default_lang() -> String {
    Language::Python.as_str().to_string()
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    RunRequest(RunRequest),
    /// Anything else is relayed to the room untouched.
    Relay(JsonValue),
}

impl ClientMessage {
    pub fn from_value(value: JsonValue) -> Result<Self, serde_json::Error> {
        let is_run_request =
            value.get("type").and_then(JsonValue::as_str) == Some(RUN_REQUEST_TYPE);
        if is_run_request {
            serde_json::from_value(value).map(ClientMessage::RunRequest)
        } else {
            Ok(ClientMessage::Relay(value))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
}

impl Language {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "python" => Some(Language::Python),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Completed { exit_code: i64 },
    Failed,
}

/// How a run ended, dispatched once into the trailing protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(i64),
    /// Refused before any sandbox was created; the reason goes to clients verbatim.
    Rejected(String),
    /// Internal failure; clients only see a generic message.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RunSession {
    pub run_id: String,
    pub room_id: String,
    pub lang: String,
    pub code: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

impl RunSession {
    pub fn new(room_id: &str, request: RunRequest) -> Self {
        let created_at = Utc::now();
        Self {
            run_id: format!("run-{}", created_at.timestamp_millis()),
            room_id: room_id.to_string(),
            lang: request.lang,
            code: request.code,
            status: RunStatus::Pending,
            created_at,
        }
    }

    pub fn transition(&mut self, status: RunStatus) {
        info!(
            room = %self.room_id,
            run = %self.run_id,
            from = ?self.status,
            to = ?status,
            "run status changed"
        );
        self.status = status;
    }

    pub fn start_message(&self) -> ServerMessage {
        ServerMessage::RunStart {
            room_id: self.room_id.clone(),
            run_id: self.run_id.clone(),
            lang: self.lang.clone(),
        }
    }

    pub fn stdout(&self, chunk: String) -> ServerMessage {
        ServerMessage::RunStdout {
            room_id: self.room_id.clone(),
            run_id: self.run_id.clone(),
            chunk,
        }
    }

    pub fn stderr(&self, chunk: String) -> ServerMessage {
        ServerMessage::RunStderr {
            room_id: self.room_id.clone(),
            run_id: self.run_id.clone(),
            chunk,
        }
    }

    pub fn end(&self, exit_code: i64) -> ServerMessage {
        ServerMessage::RunEnd {
            room_id: self.room_id.clone(),
            run_id: self.run_id.clone(),
            exit_code,
        }
    }
}

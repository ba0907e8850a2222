//! JSON wire protocol spoken over the stream websocket.
//!
//! Client commands carry a numeric `id` and exactly one method body. The
//! server answers with a reply bearing the same `id`, and sends unsolicited
//! pushes (publications, disconnects) with no `id`. An empty object is a
//! ping. One websocket frame may carry several newline-separated messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct ClientCommand {
    pub id: u32,
    #[serde(flatten)]
    pub body: CommandBody,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandBody {
    Connect { token: String },
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Refresh { token: String },
}

impl CommandBody {
    pub fn name(&self) -> &'static str {
        match self {
            CommandBody::Connect { .. } => "connect",
            CommandBody::Subscribe { .. } => "subscribe",
            CommandBody::Unsubscribe { .. } => "unsubscribe",
            CommandBody::Refresh { .. } => "refresh",
        }
    }
}

impl ClientCommand {
    pub fn encode(&self) -> String {
        // Serializing plain strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawServerMessage {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    error: Option<ReplyError>,
    #[serde(default)]
    connect: Option<SessionResult>,
    #[serde(default)]
    refresh: Option<SessionResult>,
    #[serde(default)]
    push: Option<RawPush>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawPush {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default, rename = "pub")]
    publication: Option<RawPublication>,
    #[serde(default)]
    disconnect: Option<DisconnectInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawPublication {
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplyError {
    pub code: u32,
    #[serde(default)]
    pub message: String,
}

/// Result body of `connect` and `refresh` replies
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionResult {
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl SessionResult {
    /// Seconds until the server wants a refresh, if the session expires
    pub fn refresh_after(&self) -> Option<u64> {
        if self.expires {
            self.ttl
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DisconnectInfo {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub reason: String,
    /// Absent means the client may reconnect
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
}

fn default_reconnect() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Ping,
    Reply {
        id: u32,
        result: Result<Option<SessionResult>, ReplyError>,
    },
    Publication {
        channel: String,
        data: Value,
    },
    Disconnect(DisconnectInfo),
    Unknown(String),
}

/// Split a text frame into its messages and classify each one
pub fn parse_frame(text: &str) -> Vec<Incoming> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_message)
        .collect()
}

fn parse_message(line: &str) -> Incoming {
    let raw: RawServerMessage = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(_) => return Incoming::Unknown(line.to_string()),
    };

    if let Some(id) = raw.id.filter(|id| *id > 0) {
        let result = match raw.error {
            Some(error) => Err(error),
            None => Ok(raw.connect.or(raw.refresh)),
        };
        return Incoming::Reply { id, result };
    }

    if let Some(push) = raw.push {
        if let Some(info) = push.disconnect {
            return Incoming::Disconnect(info);
        }
        if let (Some(channel), Some(publication)) = (push.channel, push.publication) {
            return Incoming::Publication {
                channel,
                data: publication.data,
            };
        }
        return Incoming::Unknown(line.to_string());
    }

    let is_empty_object = serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.as_object().map(|o| o.is_empty()))
        .unwrap_or(false);
    if is_empty_object {
        Incoming::Ping
    } else {
        Incoming::Unknown(line.to_string())
    }
}

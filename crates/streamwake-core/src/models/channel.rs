use serde_json::Value;

use super::json_utils::{id_string, unwrap_data};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Standard,
    Dm,
    Other(String),
}

impl ChannelKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "" | "text" | "standard" => ChannelKind::Standard,
            "dm" => ChannelKind::Dm,
            other => ChannelKind::Other(other.to_string()),
        }
    }
}

/// One entry of the server channel listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub id: String,
    pub name: String,
    pub kind: ChannelKind,
}

impl ChannelDescriptor {
    pub fn from_json(value: &Value) -> Option<Self> {
        let id = value.get("id").and_then(id_string)?;
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(&id)
            .to_string();
        let kind = ChannelKind::parse(value.get("type").and_then(|v| v.as_str()).unwrap_or(""));
        Some(Self { id, name, kind })
    }

    /// Parse a channel listing. Entries without an id are skipped.
    pub fn list_from_json(value: &Value) -> Vec<Self> {
        let list = unwrap_data(value);
        let entries = list
            .as_array()
            .or_else(|| list.get("channels").and_then(|v| v.as_array()));
        entries
            .map(|items| items.iter().filter_map(Self::from_json).collect())
            .unwrap_or_default()
    }

    pub fn is_dm(&self) -> bool {
        self.kind == ChannelKind::Dm
    }

    /// Display label, e.g. `#general`
    pub fn label(&self) -> String {
        format!("#{}", self.name)
    }

    /// Subscription key for this channel's stream
    pub fn subscription_key(&self) -> String {
        format!("channel.{}", self.id)
    }
}

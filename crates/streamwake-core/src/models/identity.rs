use serde_json::Value;

use super::json_utils::{id_string, unwrap_data};

/// The agent this process listens for. Fetched once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub id: String,
    pub display_name: String,
    pub is_agent: bool,
}

impl AgentIdentity {
    /// Parse a `/users/@me` response, with or without a `data` envelope
    pub fn from_json(value: &Value) -> Option<Self> {
        let user = unwrap_data(value);
        let id = user.get("id").and_then(id_string)?;
        let display_name = user
            .get("name")
            .or_else(|| user.get("displayName"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let is_agent = user
            .get("isAgent")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Some(Self {
            id,
            display_name,
            is_agent,
        })
    }
}

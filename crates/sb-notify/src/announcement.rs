use serde::{Deserialize, Deserializer, Serialize};

/// Pointer to a stored notification, carried by the live subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAnnouncement {
    /// Empty for broadcast notifications. `null` decodes as empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub platform_id: String,
    pub notification_id: String,
    pub revision: i64,
}

impl EventAnnouncement {
    pub fn decode(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

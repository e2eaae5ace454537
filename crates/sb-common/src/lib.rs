use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

// ============================================================================
// Notification Types
// ============================================================================

/// Kind of change a notification describes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationOperation {
    Created,
    Modified,
    Deleted,
}

impl NotificationOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationOperation::Created => "CREATED",
            NotificationOperation::Modified => "MODIFIED",
            NotificationOperation::Deleted => "DELETED",
        }
    }
}

impl std::str::FromStr for NotificationOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATED" => Ok(NotificationOperation::Created),
            "MODIFIED" => Ok(NotificationOperation::Modified),
            "DELETED" => Ok(NotificationOperation::Deleted),
            other => Err(format!("unknown notification operation: {}", other)),
        }
    }
}

/// A change event persisted in the notification log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    /// Target platform. Empty means the notification is for every platform.
    #[serde(default)]
    pub platform_id: String,
    /// Store-assigned, globally increasing sequence number
    pub revision: i64,
    #[serde(rename = "type")]
    pub operation: NotificationOperation,
    /// Resource path the change applies to, e.g. `/v1/service_brokers`
    pub resource: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// A notification with no platform is delivered to every consumer
    pub fn is_broadcast(&self) -> bool {
        self.platform_id.is_empty()
    }
}

// ============================================================================
// Caller Identity
// ============================================================================

/// A platform registered with the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Platform {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub platform_type: String,
    #[serde(default)]
    pub description: String,
}

/// How the caller authenticated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Basic,
    Bearer,
}

/// Identity attached to a request by the authentication layer.
///
/// `data` is the raw JSON the authenticator stored for the caller; for
/// platform credentials it is the serialized [`Platform`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub name: String,
    pub auth_type: AuthType,
    data: String,
}

impl UserContext {
    pub fn new(name: impl Into<String>, auth_type: AuthType, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auth_type,
            data: data.into(),
        }
    }

    /// Build a context carrying a platform identity
    pub fn for_platform(platform: &Platform) -> serde_json::Result<Self> {
        Ok(Self::new(
            platform.name.clone(),
            AuthType::Basic,
            serde_json::to_string(platform)?,
        ))
    }

    /// Decode the attached identity data
    pub fn data<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_serialization() {
        let json = serde_json::to_string(&NotificationOperation::Modified).unwrap();
        assert_eq!(json, "\"MODIFIED\"");
        assert_eq!("deleted".parse::<NotificationOperation>().unwrap(), NotificationOperation::Deleted);
        assert!("UPSERTED".parse::<NotificationOperation>().is_err());
    }

    #[test]
    fn test_notification_broadcast() {
        let notification = Notification {
            id: "n-1".to_string(),
            platform_id: String::new(),
            revision: 3,
            operation: NotificationOperation::Created,
            resource: "/v1/service_brokers".to_string(),
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        };
        assert!(notification.is_broadcast());
    }

    #[test]
    fn test_user_context_platform_data() {
        let platform = Platform {
            id: "cf-eu".to_string(),
            name: "cf-eu".to_string(),
            platform_type: "cloudfoundry".to_string(),
            description: String::new(),
        };
        let ctx = UserContext::for_platform(&platform).unwrap();
        let decoded: Platform = ctx.data().unwrap();
        assert_eq!(decoded, platform);

        let broken = UserContext::new("x", AuthType::Basic, "{not json");
        assert!(broken.data::<Platform>().is_err());
    }
}

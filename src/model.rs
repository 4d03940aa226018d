use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Platform {
    Instagram,
    Twitter,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Instagram, Platform::Twitter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "INSTAGRAM",
            Platform::Twitter => "TWITTER",
        }
    }

    /// Human-facing name used in notification bodies.
    pub fn label(&self) -> &'static str {
        match self {
            Platform::Instagram => "Instagram",
            Platform::Twitter => "Twitter",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSTAGRAM" => Ok(Platform::Instagram),
            "TWITTER" => Ok(Platform::Twitter),
            _ => Err(UnknownPlatform(s.to_string())),
        }
    }
}

/// An account whose latest content is polled. Only `last_seen_item_id`
/// changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredAccount {
    pub id: i64,
    pub username: String,
    pub platform: Platform,
    #[serde(default)]
    pub last_seen_item_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationGroup {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    pub destination_id: String,
    pub created_at: DateTime<Utc>,
}

/// One newly detected post. Travels through the queue and is never stored;
/// only its `id` ends up on the account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: String,
    pub platform: Platform,
    pub content: String,
    pub url: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// src/model.rs
//! Entities flowing through the pipeline: subscriptions, articles and the
//! envelope that travels over the channel.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = u64;

/// Keyword used for envelopes produced by `Publisher::publish_message`.
pub const SYSTEM_TOPIC: &str = "system_notification";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    pub user_id: UserId,
    pub keyword: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Article {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "urlToImage", default)]
    pub image_url: String,
    /// `None` means the upstream gave no ordering information.
    #[serde(rename = "publishedAt", default, with = "published_at")]
    pub published_at: Option<DateTime<Utc>>,
}

/// Parse an upstream timestamp. Empty, malformed and zero-valued
/// (`0001-01-01T00:00:00Z`) inputs all map to `None`.
pub fn parse_published_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|dt| dt.year() > 1)
}

mod published_at {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(dt) => s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw.as_deref().and_then(super::parse_published_at))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Notification,
    SystemNotification,
}

/// One user's notification of one article, as carried by the channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationEnvelope {
    pub event_id: String,
    pub event_type: EventKind,
    #[serde(rename = "notif_topic")]
    pub keyword: String,
    pub article: Article,
    #[serde(rename = "timestamp")]
    pub enqueued_at: DateTime<Utc>,
    /// Older producers only carried the user in the record key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl NotificationEnvelope {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Recipient from the body, falling back to the `user_{id}` record key.
    pub fn recipient(&self, key: &str) -> Option<UserId> {
        self.user_id.or_else(|| user_from_key(key))
    }
}

/// Channel key for a user. Every envelope of one user lands on one partition.
pub fn user_key(user_id: UserId) -> String {
    format!("user_{user_id}")
}

pub fn user_from_key(key: &str) -> Option<UserId> {
    key.strip_prefix("user_")?.parse().ok()
}

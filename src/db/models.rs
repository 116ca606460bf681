use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DatabaseError;

/// Which platform a relayed message was originally written on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Discord,
    Zulip,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::Discord => "discord",
            MessageSource::Zulip => "zulip",
        }
    }
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageSource {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "discord" => Ok(MessageSource::Discord),
            "zulip" => Ok(MessageSource::Zulip),
            other => Err(DatabaseError::Query(format!(
                "unknown message source: {other}"
            ))),
        }
    }
}

/// A bridged Discord channel and Zulip stream/topic pair.
///
/// A binding without a topic relays every topic of the stream into the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub id: i64,
    pub discord_channel_id: String,
    pub zulip_stream_id: i64,
    pub zulip_topic: Option<String>,
    pub include_threads: bool,
    pub created_at: DateTime<Utc>,
}

impl ChannelBinding {
    pub fn new(
        discord_channel_id: impl Into<String>,
        zulip_stream_id: i64,
        zulip_topic: Option<String>,
    ) -> Self {
        Self {
            id: 0,
            discord_channel_id: discord_channel_id.into(),
            zulip_stream_id,
            zulip_topic,
            include_threads: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCorrelation {
    pub id: i64,
    pub discord_message_id: Option<String>,
    pub discord_channel_id: String,
    pub zulip_message_id: Option<i64>,
    pub zulip_stream_id: i64,
    pub zulip_topic: String,
    pub source: MessageSource,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCorrelation {
    pub id: i64,
    pub source_file_url: String,
    pub mirrored_file_url: String,
    pub mirrored_file_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

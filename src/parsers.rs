use async_trait::async_trait;

use crate::error::BridgeError;
use crate::zulip::{ZulipClient, ZulipError, ZulipMessage};

pub mod common;
pub mod discord_parser;
pub mod linkifier;
pub mod url_template;
pub mod zulip_parser;

#[cfg(test)]
pub(crate) mod test_support;

pub use discord_parser::{DiscordToZulipTranslator, OutboundOptions};
pub use linkifier::{LinkifierLimits, LinkifierSet, LinkifierStore};
pub use zulip_parser::{InboundMessage, InboundOptions, ZulipToDiscordTranslator};

/// Zulip lookups needed while translating.
///
/// `Ok(None)` means the stream or message no longer exists.
#[async_trait]
pub trait ZulipDirectory: Send + Sync {
    async fn stream_name(&self, stream_id: i64) -> Result<Option<String>, BridgeError>;
    async fn stream_id(&self, name: &str) -> Result<Option<i64>, BridgeError>;
    async fn message_source(&self, message_id: i64) -> Result<Option<ZulipMessage>, BridgeError>;
}

/// Discord lookups needed while translating.
#[async_trait]
pub trait DiscordDirectory: Send + Sync {
    /// Guild of a channel that still exists, `Ok(None)` when it is gone.
    async fn channel_guild(&self, channel_id: &str) -> Result<Option<String>, BridgeError>;
}

/// Re-hosts an attachment on Zulip, returning the URL to link instead.
#[async_trait]
pub trait AttachmentMirror: Send + Sync {
    async fn mirror(
        &self,
        source_url: &str,
        filename: &str,
        content_type: Option<&str>,
    ) -> anyhow::Result<String>;
}

fn missing_as_none<T>(result: Result<T, ZulipError>) -> Result<Option<T>, BridgeError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ZulipDirectory for ZulipClient {
    async fn stream_name(&self, stream_id: i64) -> Result<Option<String>, BridgeError> {
        missing_as_none(self.get_stream(stream_id).await).map(|s| s.map(|stream| stream.name))
    }

    async fn stream_id(&self, name: &str) -> Result<Option<i64>, BridgeError> {
        missing_as_none(self.get_stream_id(name).await)
    }

    async fn message_source(&self, message_id: i64) -> Result<Option<ZulipMessage>, BridgeError> {
        missing_as_none(self.get_message(message_id).await)
    }
}

//! Substitutable lookups for translator tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BridgeError;
use crate::parsers::{AttachmentMirror, DiscordDirectory, ZulipDirectory};
use crate::zulip::ZulipMessage;

#[derive(Default)]
pub struct FakeZulip {
    pub streams: Mutex<HashMap<i64, String>>,
    pub messages: Mutex<HashMap<i64, ZulipMessage>>,
}

#[async_trait]
impl ZulipDirectory for FakeZulip {
    async fn stream_name(&self, stream_id: i64) -> Result<Option<String>, BridgeError> {
        Ok(self.streams.lock().get(&stream_id).cloned())
    }

    async fn stream_id(&self, name: &str) -> Result<Option<i64>, BridgeError> {
        Ok(self
            .streams
            .lock()
            .iter()
            .find(|(_, stream)| stream.as_str() == name)
            .map(|(id, _)| *id))
    }

    async fn message_source(&self, message_id: i64) -> Result<Option<ZulipMessage>, BridgeError> {
        Ok(self.messages.lock().get(&message_id).cloned())
    }
}

#[derive(Default)]
pub struct FakeMirror {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl AttachmentMirror for FakeMirror {
    async fn mirror(
        &self,
        source_url: &str,
        filename: &str,
        _content_type: Option<&str>,
    ) -> anyhow::Result<String> {
        self.calls.lock().push(source_url.to_string());
        Ok(format!("/user_uploads/2/xx/{filename}"))
    }
}

/// Channel id to guild id; channels not listed are gone.
#[derive(Default)]
pub struct FakeDiscord {
    pub channels: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl DiscordDirectory for FakeDiscord {
    async fn channel_guild(&self, channel_id: &str) -> Result<Option<String>, BridgeError> {
        Ok(self.channels.lock().get(channel_id).cloned())
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ChannelBinding, ChannelStore, DatabaseError, DatabaseManager, MessageCorrelation,
    MessageStore, UploadCorrelation, UploadStore,
};

/// Process-local correlation store used by unit tests.
#[derive(Default)]
pub struct MemoryStore {
    next_id: AtomicI64,
    bindings: Mutex<Vec<ChannelBinding>>,
    messages: Mutex<Vec<MessageCorrelation>>,
    uploads: Mutex<Vec<UploadCorrelation>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn manager(self: &Arc<Self>) -> DatabaseManager {
        DatabaseManager::with_stores(self.clone(), self.clone(), self.clone())
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn bindings(&self) -> Vec<ChannelBinding> {
        self.bindings.lock().clone()
    }

    pub fn messages(&self) -> Vec<MessageCorrelation> {
        self.messages.lock().clone()
    }

    pub fn uploads(&self) -> Vec<UploadCorrelation> {
        self.uploads.lock().clone()
    }
}

fn duplicate(what: &str) -> DatabaseError {
    DatabaseError::Query(format!("UNIQUE constraint failed: {what}"))
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn get_binding_by_discord_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelBinding>, DatabaseError> {
        Ok(self
            .bindings
            .lock()
            .iter()
            .find(|b| b.discord_channel_id == channel_id)
            .cloned())
    }

    async fn get_binding_by_stream_topic(
        &self,
        stream_id: i64,
        topic: Option<&str>,
    ) -> Result<Option<ChannelBinding>, DatabaseError> {
        Ok(self
            .bindings
            .lock()
            .iter()
            .find(|b| b.zulip_stream_id == stream_id && b.zulip_topic.as_deref() == topic)
            .cloned())
    }

    async fn list_bindings_by_stream(
        &self,
        stream_id: i64,
    ) -> Result<Vec<ChannelBinding>, DatabaseError> {
        Ok(self
            .bindings
            .lock()
            .iter()
            .filter(|b| b.zulip_stream_id == stream_id)
            .cloned()
            .collect())
    }

    async fn count_bindings(&self) -> Result<i64, DatabaseError> {
        Ok(self.bindings.lock().len() as i64)
    }

    async fn list_bindings(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChannelBinding>, DatabaseError> {
        Ok(self
            .bindings
            .lock()
            .iter()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn create_binding(&self, binding: &ChannelBinding) -> Result<(), DatabaseError> {
        let mut bindings = self.bindings.lock();
        if bindings.iter().any(|b| {
            b.discord_channel_id == binding.discord_channel_id
                || (b.zulip_stream_id == binding.zulip_stream_id
                    && b.zulip_topic == binding.zulip_topic)
        }) {
            return Err(duplicate("channel_bindings"));
        }
        let mut stored = binding.clone();
        stored.id = self.allocate_id();
        bindings.push(stored);
        Ok(())
    }

    async fn set_include_threads(
        &self,
        channel_id: &str,
        include_threads: bool,
    ) -> Result<bool, DatabaseError> {
        let mut bindings = self.bindings.lock();
        match bindings
            .iter_mut()
            .find(|b| b.discord_channel_id == channel_id)
        {
            Some(binding) => {
                binding.include_threads = include_threads;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_binding_by_discord_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelBinding>, DatabaseError> {
        let mut bindings = self.bindings.lock();
        let mut messages = self.messages.lock();
        let Some(position) = bindings
            .iter()
            .position(|b| b.discord_channel_id == channel_id)
        else {
            return Ok(None);
        };
        messages.retain(|m| m.discord_channel_id != channel_id);
        Ok(Some(bindings.remove(position)))
    }

    async fn delete_bindings_by_stream(
        &self,
        stream_id: i64,
    ) -> Result<Vec<ChannelBinding>, DatabaseError> {
        let mut bindings = self.bindings.lock();
        let mut messages = self.messages.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = bindings
            .drain(..)
            .partition(|b| b.zulip_stream_id == stream_id);
        *bindings = kept;
        messages.retain(|m| {
            !removed
                .iter()
                .any(|b| b.discord_channel_id == m.discord_channel_id)
        });
        Ok(removed)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn get_by_discord_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageCorrelation>, DatabaseError> {
        Ok(self
            .messages
            .lock()
            .iter()
            .find(|m| m.discord_message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn get_by_zulip_message_id(
        &self,
        message_id: i64,
    ) -> Result<Option<MessageCorrelation>, DatabaseError> {
        Ok(self
            .messages
            .lock()
            .iter()
            .find(|m| m.zulip_message_id == Some(message_id))
            .cloned())
    }

    async fn insert_correlation(
        &self,
        correlation: &MessageCorrelation,
    ) -> Result<(), DatabaseError> {
        let mut messages = self.messages.lock();
        if messages.iter().any(|m| {
            (m.discord_message_id.is_some() && m.discord_message_id == correlation.discord_message_id)
                || (m.zulip_message_id.is_some()
                    && m.zulip_message_id == correlation.zulip_message_id)
        }) {
            return Err(duplicate("message_correlations"));
        }
        let mut stored = correlation.clone();
        stored.id = self.allocate_id();
        messages.push(stored);
        Ok(())
    }

    async fn delete_by_discord_message_id(
        &self,
        message_id: &str,
    ) -> Result<Vec<MessageCorrelation>, DatabaseError> {
        let mut messages = self.messages.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = messages
            .drain(..)
            .partition(|m| m.discord_message_id.as_deref() == Some(message_id));
        *messages = kept;
        Ok(removed)
    }

    async fn delete_by_zulip_message_id(
        &self,
        message_id: i64,
    ) -> Result<Vec<MessageCorrelation>, DatabaseError> {
        let mut messages = self.messages.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = messages
            .drain(..)
            .partition(|m| m.zulip_message_id == Some(message_id));
        *messages = kept;
        Ok(removed)
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn get_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<UploadCorrelation>, DatabaseError> {
        Ok(self
            .uploads
            .lock()
            .iter()
            .find(|u| u.source_file_url == source_url)
            .cloned())
    }

    async fn get_by_mirrored_url(
        &self,
        mirrored_url: &str,
    ) -> Result<Option<UploadCorrelation>, DatabaseError> {
        Ok(self
            .uploads
            .lock()
            .iter()
            .find(|u| u.mirrored_file_url == mirrored_url)
            .cloned())
    }

    async fn insert_upload(&self, upload: &UploadCorrelation) -> Result<(), DatabaseError> {
        let mut uploads = self.uploads.lock();
        if uploads.iter().any(|u| {
            u.source_file_url == upload.source_file_url
                || u.mirrored_file_url == upload.mirrored_file_url
        }) {
            return Err(duplicate("upload_correlations"));
        }
        let mut stored = upload.clone();
        stored.id = self.allocate_id();
        uploads.push(stored);
        Ok(())
    }

    async fn set_mirrored_file_id(
        &self,
        mirrored_url: &str,
        file_id: i64,
    ) -> Result<bool, DatabaseError> {
        let mut uploads = self.uploads.lock();
        match uploads
            .iter_mut()
            .find(|u| u.mirrored_file_url == mirrored_url)
        {
            Some(upload) => {
                upload.mirrored_file_id = Some(file_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_by_mirrored_file_id(
        &self,
        file_id: i64,
    ) -> Result<Vec<UploadCorrelation>, DatabaseError> {
        let mut uploads = self.uploads.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = uploads
            .drain(..)
            .partition(|u| u.mirrored_file_id == Some(file_id));
        *uploads = kept;
        Ok(removed)
    }
}

use async_trait::async_trait;

use super::DatabaseError;
use super::models::{ChannelBinding, MessageCorrelation, UploadCorrelation};

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn get_binding_by_discord_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelBinding>, DatabaseError>;
    /// `topic == None` only matches stream-wide bindings.
    async fn get_binding_by_stream_topic(
        &self,
        stream_id: i64,
        topic: Option<&str>,
    ) -> Result<Option<ChannelBinding>, DatabaseError>;
    async fn list_bindings_by_stream(
        &self,
        stream_id: i64,
    ) -> Result<Vec<ChannelBinding>, DatabaseError>;
    async fn count_bindings(&self) -> Result<i64, DatabaseError>;
    async fn list_bindings(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChannelBinding>, DatabaseError>;
    async fn create_binding(&self, binding: &ChannelBinding) -> Result<(), DatabaseError>;
    async fn set_include_threads(
        &self,
        channel_id: &str,
        include_threads: bool,
    ) -> Result<bool, DatabaseError>;
    /// Removes the binding together with every message correlation of its channel.
    async fn delete_binding_by_discord_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelBinding>, DatabaseError>;
    async fn delete_bindings_by_stream(
        &self,
        stream_id: i64,
    ) -> Result<Vec<ChannelBinding>, DatabaseError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get_by_discord_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageCorrelation>, DatabaseError>;
    async fn get_by_zulip_message_id(
        &self,
        message_id: i64,
    ) -> Result<Option<MessageCorrelation>, DatabaseError>;
    async fn insert_correlation(
        &self,
        correlation: &MessageCorrelation,
    ) -> Result<(), DatabaseError>;
    async fn delete_by_discord_message_id(
        &self,
        message_id: &str,
    ) -> Result<Vec<MessageCorrelation>, DatabaseError>;
    async fn delete_by_zulip_message_id(
        &self,
        message_id: i64,
    ) -> Result<Vec<MessageCorrelation>, DatabaseError>;
}

#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn get_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<UploadCorrelation>, DatabaseError>;
    async fn get_by_mirrored_url(
        &self,
        mirrored_url: &str,
    ) -> Result<Option<UploadCorrelation>, DatabaseError>;
    async fn insert_upload(&self, upload: &UploadCorrelation) -> Result<(), DatabaseError>;
    async fn set_mirrored_file_id(
        &self,
        mirrored_url: &str,
        file_id: i64,
    ) -> Result<bool, DatabaseError>;
    async fn delete_by_mirrored_file_id(
        &self,
        file_id: i64,
    ) -> Result<Vec<UploadCorrelation>, DatabaseError>;
}

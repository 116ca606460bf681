use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{ChannelBinding, DatabaseManager, MessageSource};
use crate::error::BridgeError;
use crate::discord::{
    DiscordCommandHandler, DiscordCommandOutcome, DiscordMessage, DiscordThread, StreamRef,
};
use crate::parsers::{
    AttachmentMirror, DiscordDirectory, DiscordToZulipTranslator, InboundMessage, InboundOptions,
    LinkifierStore, OutboundOptions, ZulipDirectory, ZulipToDiscordTranslator,
};
use crate::utils::formatting::preview_text;
use crate::web::metrics::Metrics;
use crate::zulip::{
    LinkifierSource, MessageEdit, ZulipClient, ZulipError, ZulipEventHandler, ZulipMessage,
};

pub mod logic;

use self::logic::{
    discord_correlation, outbound_topic, status_report, thread_topic, zulip_correlation,
};

/// Zulip operations used to relay Discord traffic.
#[async_trait]
pub trait ZulipRelay: Send + Sync {
    async fn send_message(&self, stream_id: i64, topic: &str, content: &str)
    -> Result<i64, ZulipError>;
    async fn edit_message(&self, message_id: i64, content: &str) -> Result<(), ZulipError>;
    async fn delete_message(&self, message_id: i64) -> Result<(), ZulipError>;
}

#[async_trait]
impl ZulipRelay for ZulipClient {
    async fn send_message(
        &self,
        stream_id: i64,
        topic: &str,
        content: &str,
    ) -> Result<i64, ZulipError> {
        ZulipClient::send_message(self, stream_id, topic, content).await
    }

    async fn edit_message(&self, message_id: i64, content: &str) -> Result<(), ZulipError> {
        ZulipClient::edit_message(self, message_id, content).await
    }

    async fn delete_message(&self, message_id: i64) -> Result<(), ZulipError> {
        ZulipClient::delete_message(self, message_id).await
    }
}

/// Discord operations used to relay Zulip traffic.
#[async_trait]
pub trait DiscordRelay: Send + Sync {
    /// Posts through the channel's webhook and returns the new message id.
    async fn send_webhook_message(&self, channel_id: &str, message: &InboundMessage)
    -> Result<String>;
    async fn edit_webhook_message(&self, channel_id: &str, message_id: &str, content: &str)
    -> Result<()>;
    async fn delete_webhook_message(&self, channel_id: &str, message_id: &str) -> Result<()>;
    /// Plain bot message, used for command replies.
    async fn send_notice(&self, channel_id: &str, content: &str) -> Result<()>;
}

/// Collaborators the bridge core is assembled from.
pub struct BridgeParts {
    pub db: DatabaseManager,
    pub zulip: Arc<dyn ZulipRelay>,
    pub zulip_directory: Arc<dyn ZulipDirectory>,
    pub discord: Arc<dyn DiscordRelay>,
    pub discord_directory: Arc<dyn DiscordDirectory>,
    pub mirror: Option<Arc<dyn AttachmentMirror>>,
    pub linkifiers: Arc<LinkifierStore>,
}

pub struct BridgeCore {
    db: DatabaseManager,
    zulip: Arc<dyn ZulipRelay>,
    zulip_directory: Arc<dyn ZulipDirectory>,
    discord: Arc<dyn DiscordRelay>,
    outbound: DiscordToZulipTranslator,
    inbound: ZulipToDiscordTranslator,
    linkifiers: Arc<LinkifierStore>,
    commands: DiscordCommandHandler,
    ignored_discord_users: HashSet<String>,
}

impl BridgeCore {
    pub fn new(config: &Config, parts: BridgeParts) -> Self {
        let text_replacements: Vec<(String, String)> = config
            .bridge
            .text_replacements
            .iter()
            .map(|(zulip, discord)| (zulip.clone(), discord.clone()))
            .collect();

        let outbound = DiscordToZulipTranslator::new(
            parts.db.clone(),
            parts.zulip_directory.clone(),
            parts.mirror,
            OutboundOptions {
                realm: config.zulip.realm().to_string(),
                max_length: config.zulip.max_message_length,
                text_replacements: text_replacements.clone(),
                mentionable_groups: config.bridge.mentionable_zulip_groups.iter().cloned().collect(),
            },
        );
        let inbound = ZulipToDiscordTranslator::new(
            parts.db.clone(),
            parts.zulip_directory.clone(),
            parts.discord_directory,
            parts.linkifiers.clone(),
            InboundOptions {
                realm: config.zulip.realm().to_string(),
                max_length: config.limits.discord_max_message_length,
                text_replacements,
                username_prefix: config.bridge.discord_username_prefix.clone(),
                username_suffix: config.bridge.discord_username_suffix.clone(),
            },
        );

        Self {
            db: parts.db,
            zulip: parts.zulip,
            zulip_directory: parts.zulip_directory,
            discord: parts.discord,
            outbound,
            inbound,
            linkifiers: parts.linkifiers,
            commands: DiscordCommandHandler::new(),
            ignored_discord_users: config.bridge.ignored_discord_users.iter().cloned().collect(),
        }
    }

    pub async fn handle_discord_message(
        &self,
        message: &DiscordMessage,
        can_manage_channels: bool,
    ) -> Result<()> {
        if self.ignored_discord_users.contains(&message.author_id) {
            debug!(author = %message.author_id, "ignoring message from ignored discord user");
            return Ok(());
        }

        if DiscordCommandHandler::is_command(&message.content) {
            let outcome = self.commands.parse(&message.content, can_manage_channels);
            return self.handle_discord_command_outcome(outcome, message).await;
        }

        if message.is_system() {
            return Ok(());
        }

        let Some(binding) = self
            .db
            .channel_store()
            .get_binding_by_discord_channel(&message.channel_id)
            .await?
        else {
            return Ok(());
        };
        // Thread starters can arrive both from the gateway and from thread mirroring.
        if self
            .db
            .message_store()
            .get_by_discord_message_id(&message.id)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let content = self.outbound.translate(message).await;
        let topic = outbound_topic(&binding);
        debug!(
            discord_message_id = %message.id,
            zulip_stream_id = binding.zulip_stream_id,
            topic,
            preview = %preview_text(&content),
            "relaying discord message"
        );
        let zulip_message_id = match self
            .zulip
            .send_message(binding.zulip_stream_id, topic, &content)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                Metrics::relay_failed();
                let err = BridgeError::from(e);
                let kind = if err.is_retryable() { "transient" } else { "rejected" };
                return Err(anyhow!(
                    "failed to send discord message {} to zulip ({kind}): {err}",
                    message.id
                ));
            }
        };
        Metrics::discord_message_relayed();

        let correlation = discord_correlation(message, &binding, zulip_message_id);
        if let Err(e) = self.db.message_store().insert_correlation(&correlation).await {
            error!(
                discord_message_id = %message.id,
                zulip_message_id,
                error = %e,
                "relayed message but failed to store its correlation"
            );
        }
        Ok(())
    }

    pub async fn handle_discord_message_update(&self, message: &DiscordMessage) -> Result<()> {
        if self.ignored_discord_users.contains(&message.author_id) {
            return Ok(());
        }
        let Some(correlation) = self
            .db
            .message_store()
            .get_by_discord_message_id(&message.id)
            .await?
        else {
            return Ok(());
        };
        let (MessageSource::Discord, Some(zulip_message_id)) =
            (correlation.source, correlation.zulip_message_id)
        else {
            return Ok(());
        };

        let content = self.outbound.translate(message).await;
        self.zulip
            .edit_message(zulip_message_id, &content)
            .await
            .map_err(|e| anyhow!("failed to edit zulip message {zulip_message_id}: {e}"))
    }

    pub async fn handle_discord_message_delete(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<()> {
        let removed = self
            .db
            .message_store()
            .delete_by_discord_message_id(message_id)
            .await?;

        for correlation in removed {
            if correlation.source != MessageSource::Discord {
                continue;
            }
            let Some(zulip_message_id) = correlation.zulip_message_id else {
                continue;
            };
            debug!(channel_id, message_id, zulip_message_id, "deleting relayed zulip message");
            if let Err(e) = self.zulip.delete_message(zulip_message_id).await {
                warn!(zulip_message_id, error = %e, "failed to delete relayed zulip message");
            }
        }
        Ok(())
    }

    pub async fn handle_discord_channel_delete(&self, channel_id: &str) -> Result<()> {
        if let Some(binding) = self
            .db
            .channel_store()
            .delete_binding_by_discord_channel(channel_id)
            .await?
        {
            info!(
                channel_id,
                zulip_stream_id = binding.zulip_stream_id,
                "removed binding of deleted discord channel"
            );
        }
        Ok(())
    }

    /// Binds a new thread when its parent mirrors threads; returns whether it was bound.
    pub async fn handle_discord_thread_create(&self, thread: &DiscordThread) -> Result<bool> {
        let store = self.db.channel_store();
        let Some(parent) = store
            .get_binding_by_discord_channel(&thread.parent_id)
            .await?
        else {
            return Ok(false);
        };
        if !parent.include_threads {
            return Ok(false);
        }
        if store.get_binding_by_discord_channel(&thread.id).await?.is_some() {
            return Ok(false);
        }

        let topic = thread_topic(parent.zulip_topic.as_deref(), &thread.name);
        store
            .create_binding(&ChannelBinding::new(
                thread.id.clone(),
                parent.zulip_stream_id,
                Some(topic.clone()),
            ))
            .await?;
        info!(thread_id = %thread.id, parent_id = %thread.parent_id, topic, "mirroring new discord thread");
        Ok(true)
    }

    async fn handle_discord_command_outcome(
        &self,
        outcome: DiscordCommandOutcome,
        message: &DiscordMessage,
    ) -> Result<()> {
        let channel_id = message.channel_id.as_str();
        let store = self.db.channel_store();

        let reply = match outcome {
            DiscordCommandOutcome::Ignored => return Ok(()),
            DiscordCommandOutcome::Reply(reply) => reply,
            DiscordCommandOutcome::BridgeRequested { stream, topic } => {
                self.bridge_channel(channel_id, stream, topic).await?
            }
            DiscordCommandOutcome::UnbridgeRequested => {
                match store.delete_binding_by_discord_channel(channel_id).await? {
                    Some(_) => "This channel has been unbridged.".to_string(),
                    None => "This channel is not bridged to Zulip.".to_string(),
                }
            }
            DiscordCommandOutcome::ThreadsRequested(enabled) => {
                if store.set_include_threads(channel_id, enabled).await? {
                    let state = if enabled { "on" } else { "off" };
                    format!("Thread mirroring is now {state}.")
                } else {
                    "This channel is not bridged to Zulip.".to_string()
                }
            }
            DiscordCommandOutcome::StatusRequested => {
                let binding = store.get_binding_by_discord_channel(channel_id).await?;
                let stream_name = match &binding {
                    Some(binding) => self
                        .zulip_directory
                        .stream_name(binding.zulip_stream_id)
                        .await
                        .unwrap_or_default(),
                    None => None,
                };
                status_report(binding.as_ref(), stream_name.as_deref())
            }
        };

        self.discord.send_notice(channel_id, &reply).await
    }

    async fn bridge_channel(
        &self,
        channel_id: &str,
        stream: StreamRef,
        topic: Option<String>,
    ) -> Result<String> {
        let resolved = match &stream {
            StreamRef::Id(id) => self
                .zulip_directory
                .stream_name(*id)
                .await?
                .map(|name| (*id, name)),
            StreamRef::Name(name) => self
                .zulip_directory
                .stream_id(name)
                .await?
                .map(|id| (id, name.clone())),
        };
        let Some((stream_id, stream_name)) = resolved else {
            return Ok("That Zulip stream does not exist or the bot cannot see it.".to_string());
        };

        let store = self.db.channel_store();
        if store.get_binding_by_discord_channel(channel_id).await?.is_some() {
            return Ok("This channel is already bridged. Run `!zulip unbridge` first.".to_string());
        }
        if store
            .get_binding_by_stream_topic(stream_id, topic.as_deref())
            .await?
            .is_some()
        {
            return Ok("That Zulip stream and topic are already bridged to another channel.".to_string());
        }

        store
            .create_binding(&ChannelBinding::new(channel_id, stream_id, topic.clone()))
            .await?;
        info!(channel_id, stream_id, topic = ?topic, "created channel binding");

        Ok(match topic {
            Some(topic) => format!("Bridged to `{stream_name}` > `{topic}`."),
            None => format!("Bridged to every topic of `{stream_name}`."),
        })
    }

    async fn binding_for_zulip(&self, stream_id: i64, topic: &str) -> Result<Option<ChannelBinding>> {
        let store = self.db.channel_store();
        if let Some(binding) = store.get_binding_by_stream_topic(stream_id, Some(topic)).await? {
            return Ok(Some(binding));
        }
        Ok(store.get_binding_by_stream_topic(stream_id, None).await?)
    }
}

#[async_trait]
impl ZulipEventHandler for BridgeCore {
    async fn handle_message(&self, message: &ZulipMessage) -> Result<()> {
        let Some(stream_id) = message.stream_id else {
            return Ok(());
        };
        let Some(binding) = self.binding_for_zulip(stream_id, &message.subject).await? else {
            return Ok(());
        };

        let inbound = self.inbound.translate(message).await;
        debug!(
            zulip_message_id = message.id,
            discord_channel_id = %binding.discord_channel_id,
            preview = %preview_text(&inbound.content),
            "relaying zulip message"
        );
        let discord_message_id = match self
            .discord
            .send_webhook_message(&binding.discord_channel_id, &inbound)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                Metrics::relay_failed();
                return Err(anyhow!("failed to send zulip message {} to discord: {e}", message.id));
            }
        };
        Metrics::zulip_message_relayed();

        let correlation = zulip_correlation(message, &binding, &discord_message_id);
        if let Err(e) = self.db.message_store().insert_correlation(&correlation).await {
            error!(
                zulip_message_id = message.id,
                discord_message_id = %discord_message_id,
                error = %e,
                "relayed message but failed to store its correlation"
            );
        }
        Ok(())
    }

    async fn handle_message_edit(&self, edit: &MessageEdit) -> Result<()> {
        let Some(correlation) = self
            .db
            .message_store()
            .get_by_zulip_message_id(edit.message_id)
            .await?
        else {
            return Ok(());
        };
        let (MessageSource::Zulip, Some(discord_message_id)) =
            (correlation.source, correlation.discord_message_id.as_deref())
        else {
            return Ok(());
        };

        let content = self
            .inbound
            .translate_content(
                &edit.content,
                correlation.zulip_stream_id,
                &correlation.zulip_topic,
                edit.message_id,
            )
            .await;
        self.discord
            .edit_webhook_message(&correlation.discord_channel_id, discord_message_id, &content)
            .await
    }

    async fn handle_message_delete(&self, message_ids: &[i64]) -> Result<()> {
        let store = self.db.message_store();
        for &message_id in message_ids {
            for correlation in store.delete_by_zulip_message_id(message_id).await? {
                let (MessageSource::Zulip, Some(discord_message_id)) =
                    (correlation.source, correlation.discord_message_id.as_deref())
                else {
                    continue;
                };
                if let Err(e) = self
                    .discord
                    .delete_webhook_message(&correlation.discord_channel_id, discord_message_id)
                    .await
                {
                    warn!(discord_message_id, error = %e, "failed to delete relayed discord message");
                }
            }
        }
        Ok(())
    }

    async fn handle_linkifiers(&self, linkifiers: Vec<LinkifierSource>) -> Result<()> {
        let installed = self.linkifiers.replace(&linkifiers);
        info!(installed, received = linkifiers.len(), "updated zulip linkifiers");
        Ok(())
    }

    async fn handle_attachment_stored(&self, file_id: i64, url: &str) -> Result<()> {
        if self
            .db
            .upload_store()
            .set_mirrored_file_id(url, file_id)
            .await?
        {
            debug!(file_id, url, "recorded zulip file id of mirrored upload");
        }
        Ok(())
    }

    async fn handle_attachment_removed(&self, file_id: i64) -> Result<()> {
        let removed = self
            .db
            .upload_store()
            .delete_by_mirrored_file_id(file_id)
            .await?;
        if !removed.is_empty() {
            debug!(file_id, count = removed.len(), "forgot deleted zulip upload");
        }
        Ok(())
    }

    async fn handle_streams_deleted(&self, stream_ids: &[i64]) -> Result<()> {
        let store = self.db.channel_store();
        for &stream_id in stream_ids {
            let removed = store.delete_bindings_by_stream(stream_id).await?;
            if !removed.is_empty() {
                info!(stream_id, count = removed.len(), "removed bindings of deleted zulip stream");
            }
        }
        Ok(())
    }
}

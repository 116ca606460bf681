use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::future::join_all;
use secrecy::{ExposeSecret, SecretString};
use serenity::all::{
    Channel, ChannelId, Client as SerenityClient, Context as SerenityContext,
    CreateAllowedMentions, CreateMessage, CreateWebhook, EditWebhookMessage,
    EventHandler as SerenityEventHandler, ExecuteWebhook, GatewayIntents, GuildChannel, GuildId,
    Http, Message as SerenityMessage, MessageId, MessageUpdateEvent, PartialGuildChannel,
    Permissions, Ready, RoleId, Webhook, WebhookId,
};
use serenity::http::HttpError;
use tokio::sync::{Mutex as AsyncMutex, RwLock, oneshot};
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeCore, DiscordRelay};
use crate::config::Config;
use crate::error::BridgeError;
use crate::parsers::{DiscordDirectory, InboundMessage};

const INITIAL_LOGIN_RETRY_SECONDS: u64 = 2;
const MAX_LOGIN_RETRY_SECONDS: u64 = 300;
const READY_TIMEOUT: Duration = Duration::from_secs(30);

pub mod command_handler;
pub mod embed;
pub mod message;

pub use self::command_handler::{DiscordCommandHandler, DiscordCommandOutcome, StreamRef};
pub use self::embed::DiscordEmbed;
pub use self::message::{
    DiscordAttachment, DiscordMessage, DiscordSticker, MentionNames, MessageSnapshot,
    ReferencedMessage,
};

/// A newly created thread under a text or forum channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscordThread {
    pub id: String,
    pub parent_id: String,
    pub name: String,
}

/// Where webhook traffic for a channel goes: threads post through their parent's webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RelayTarget {
    webhook_channel: ChannelId,
    thread: Option<ChannelId>,
}

#[derive(Default)]
struct DiscordLoginState {
    is_logged_in: bool,
    gateway_task: Option<tokio::task::JoinHandle<()>>,
}

pub struct DiscordClient {
    token: SecretString,
    webhook_name: String,
    login_retries: u32,
    mentionable_roles: Vec<RoleId>,
    http: Arc<Http>,
    login_state: AsyncMutex<DiscordLoginState>,
    bridge: Arc<RwLock<Option<Arc<BridgeCore>>>>,
    webhook_cache: RwLock<HashMap<ChannelId, Webhook>>,
    relay_targets: RwLock<HashMap<ChannelId, RelayTarget>>,
    our_webhook_ids: Arc<RwLock<HashSet<WebhookId>>>,
}

struct GatewayHandler {
    ready_sender: AsyncMutex<Option<oneshot::Sender<()>>>,
    bridge: Arc<RwLock<Option<Arc<BridgeCore>>>>,
    our_webhook_ids: Arc<RwLock<HashSet<WebhookId>>>,
}

impl GatewayHandler {
    async fn bridge(&self) -> Option<Arc<BridgeCore>> {
        let bridge = self.bridge.read().await.clone();
        if bridge.is_none() {
            debug!("ignoring discord event before bridge binding");
        }
        bridge
    }

    /// DMs, our own bot user and our own webhooks are never relayed.
    async fn should_relay(&self, ctx: &SerenityContext, msg: &SerenityMessage) -> bool {
        if msg.guild_id.is_none() || msg.author.id == ctx.cache.current_user().id {
            return false;
        }
        if let Some(webhook_id) = msg.webhook_id
            && self.our_webhook_ids.read().await.contains(&webhook_id)
        {
            debug!(
                "ignoring discord message from our own webhook webhook_id={} message_id={}",
                webhook_id, msg.id
            );
            return false;
        }
        true
    }
}

#[serenity::async_trait]
impl SerenityEventHandler for GatewayHandler {
    async fn ready(&self, _ctx: SerenityContext, ready: Ready) {
        info!(
            "discord gateway ready as {} ({})",
            ready.user.name, ready.user.id
        );
        if let Some(sender) = self.ready_sender.lock().await.take() {
            let _ = sender.send(());
        }
    }

    async fn message(&self, ctx: SerenityContext, msg: SerenityMessage) {
        if !self.should_relay(&ctx, &msg).await {
            return;
        }
        let Some(bridge) = self.bridge().await else {
            return;
        };

        let can_manage_channels = DiscordCommandHandler::is_command(&msg.content)
            && can_manage_channels(&ctx, &msg).await;

        let result = match to_view(&ctx, &msg) {
            Ok(message) => bridge.handle_discord_message(&message, can_manage_channels).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            error!("failed to handle discord message {}: {err}", msg.id);
        }
    }

    async fn message_update(
        &self,
        ctx: SerenityContext,
        old_if_available: Option<SerenityMessage>,
        new: Option<SerenityMessage>,
        update: MessageUpdateEvent,
    ) {
        // Embed unfurls arrive as updates without content.
        let Some(content) = update.content.as_deref() else {
            return;
        };
        if old_if_available
            .as_ref()
            .is_some_and(|old| old.content == content)
        {
            return;
        }

        let mut msg = match new {
            Some(msg) => msg,
            None => match update.channel_id.message(&ctx, update.id).await {
                Ok(msg) => msg,
                Err(err) => {
                    debug!("failed to fetch edited discord message {}: {err}", update.id);
                    return;
                }
            },
        };
        msg.guild_id = msg.guild_id.or(update.guild_id);

        if !self.should_relay(&ctx, &msg).await {
            return;
        }
        let Some(bridge) = self.bridge().await else {
            return;
        };

        let result = match to_view(&ctx, &msg) {
            Ok(message) => bridge.handle_discord_message_update(&message).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            error!("failed to handle discord message update: {err}");
        }
    }

    async fn message_delete(
        &self,
        _ctx: SerenityContext,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        let Some(bridge) = self.bridge().await else {
            return;
        };

        if let Err(err) = bridge
            .handle_discord_message_delete(
                &channel_id.to_string(),
                &deleted_message_id.to_string(),
            )
            .await
        {
            error!("failed to handle discord message delete: {err}");
        }
    }

    async fn message_delete_bulk(
        &self,
        _ctx: SerenityContext,
        channel_id: ChannelId,
        deleted_messages_ids: Vec<MessageId>,
        _guild_id: Option<GuildId>,
    ) {
        let Some(bridge) = self.bridge().await else {
            return;
        };

        let channel = channel_id.to_string();
        let deletes = unique_message_ids(deleted_messages_ids)
            .into_iter()
            .map(|message_id| {
                let bridge = &bridge;
                let channel = &channel;
                async move {
                    let result = bridge
                        .handle_discord_message_delete(channel, &message_id.to_string())
                        .await;
                    (message_id, result)
                }
            });

        for (message_id, result) in join_all(deletes).await {
            if let Err(err) = result {
                error!(
                    "failed to handle discord bulk message delete for {}: {err}",
                    message_id
                );
            }
        }
    }

    async fn thread_create(&self, ctx: SerenityContext, thread: GuildChannel) {
        let Some(parent_id) = thread.parent_id else {
            return;
        };
        let Some(bridge) = self.bridge().await else {
            return;
        };

        let view = DiscordThread {
            id: thread.id.to_string(),
            parent_id: parent_id.to_string(),
            name: thread.name.clone(),
        };
        match bridge.handle_discord_thread_create(&view).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                error!("failed to handle discord thread create: {err}");
                return;
            }
        }

        // Forum posts share their id with the starter message.
        let mut starter = match thread.id.message(&ctx, MessageId::new(thread.id.get())).await {
            Ok(starter) => starter,
            Err(err) => {
                debug!("no starter message for thread {}: {err}", thread.id);
                return;
            }
        };
        starter.guild_id = Some(thread.guild_id);
        if !self.should_relay(&ctx, &starter).await {
            return;
        }
        let result = match to_view(&ctx, &starter) {
            Ok(message) => bridge.handle_discord_message(&message, false).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            error!("failed to relay starter message of thread {}: {err}", thread.id);
        }
    }

    async fn channel_delete(
        &self,
        _ctx: SerenityContext,
        channel: GuildChannel,
        _messages: Option<Vec<SerenityMessage>>,
    ) {
        let Some(bridge) = self.bridge().await else {
            return;
        };

        if let Err(err) = bridge
            .handle_discord_channel_delete(&channel.id.to_string())
            .await
        {
            error!("failed to handle discord channel delete: {err}");
        }
    }

    async fn thread_delete(
        &self,
        _ctx: SerenityContext,
        thread: PartialGuildChannel,
        _full_thread_data: Option<GuildChannel>,
    ) {
        let Some(bridge) = self.bridge().await else {
            return;
        };

        if let Err(err) = bridge
            .handle_discord_channel_delete(&thread.id.to_string())
            .await
        {
            error!("failed to handle discord thread delete: {err}");
        }
    }
}

/// Converts a gateway message into the translator's view, resolving mention names from the cache.
fn to_view(ctx: &SerenityContext, msg: &SerenityMessage) -> Result<DiscordMessage> {
    let names = mention_names(ctx, msg);
    let value = serde_json::to_value(msg)
        .map_err(|err| anyhow!("failed to serialize discord message {}: {err}", msg.id))?;
    DiscordMessage::from_api(value, &names)
        .map_err(|err| anyhow!("failed to read discord message {}: {err}", msg.id))
}

fn mention_names(ctx: &SerenityContext, msg: &SerenityMessage) -> MentionNames {
    let Some(guild) = msg.guild_id.and_then(|guild_id| ctx.cache.guild(guild_id)) else {
        return MentionNames::default();
    };

    let mut texts = vec![msg.content.as_str()];
    if let Some(referenced) = &msg.referenced_message {
        texts.push(referenced.content.as_str());
    }

    MentionNames::collect(
        texts,
        |id| {
            let id = parse_snowflake(id)?;
            guild.roles.get(&RoleId::new(id)).map(|role| role.name.clone())
        },
        |id| {
            let id = ChannelId::new(parse_snowflake(id)?);
            guild
                .channels
                .get(&id)
                .or_else(|| guild.threads.iter().find(|thread| thread.id == id))
                .map(|channel| channel.name.clone())
        },
    )
}

async fn can_manage_channels(ctx: &SerenityContext, msg: &SerenityMessage) -> bool {
    let Some(guild_id) = msg.guild_id else {
        return false;
    };
    let member = match msg.member(ctx).await {
        Ok(member) => member,
        Err(err) => {
            debug!("failed to resolve member for {}: {err}", msg.author.id);
            return false;
        }
    };
    // Thread permissions follow the parent channel.
    let channel_id = match msg.channel_id.to_channel(ctx).await {
        Ok(Channel::Guild(channel)) => match (&channel.thread_metadata, channel.parent_id) {
            (Some(_), Some(parent_id)) => parent_id,
            _ => channel.id,
        },
        _ => return false,
    };

    let Some(guild) = ctx.cache.guild(guild_id) else {
        return false;
    };
    let Some(channel) = guild.channels.get(&channel_id) else {
        return false;
    };
    guild
        .user_permissions_in(channel, &member)
        .contains(Permissions::MANAGE_CHANNELS)
}

fn parse_snowflake(id: &str) -> Option<u64> {
    id.parse::<u64>().ok().filter(|id| *id != 0)
}

fn channel_id(id: &str) -> Result<ChannelId> {
    parse_snowflake(id)
        .map(ChannelId::new)
        .ok_or_else(|| anyhow!("invalid channel id: {}", id))
}

fn message_id(id: &str) -> Result<MessageId> {
    parse_snowflake(id)
        .map(MessageId::new)
        .ok_or_else(|| anyhow!("invalid message id: {}", id))
}

fn is_not_found(err: &serenity::Error) -> bool {
    matches!(
        err,
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response))
            if response.status_code.as_u16() == 404
    )
}

fn unique_message_ids(ids: Vec<MessageId>) -> Vec<MessageId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

fn mentionable_roles(config: &Config) -> Vec<RoleId> {
    config
        .bridge
        .mentionable_discord_roles
        .iter()
        .filter_map(|id| match parse_snowflake(id) {
            Some(id) => Some(RoleId::new(id)),
            None => {
                warn!("ignoring invalid mentionable role id {id}");
                None
            }
        })
        .collect()
}

impl DiscordClient {
    pub fn new(config: &Config) -> Self {
        info!("initializing discord client");
        let token = SecretString::from(config.discord.bot_token.clone());
        let http = Arc::new(Http::new(token.expose_secret()));
        Self {
            token,
            webhook_name: config.discord.webhook_name.clone(),
            login_retries: config.discord.login_retries,
            mentionable_roles: mentionable_roles(config),
            http,
            login_state: AsyncMutex::new(DiscordLoginState::default()),
            bridge: Arc::new(RwLock::new(None)),
            webhook_cache: RwLock::new(HashMap::new()),
            relay_targets: RwLock::new(HashMap::new()),
            our_webhook_ids: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub async fn set_bridge(&self, bridge: Arc<BridgeCore>) {
        *self.bridge.write().await = Some(bridge);
    }

    async fn login(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if state.is_logged_in {
            return Ok(());
        }

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILD_WEBHOOKS;

        let (ready_tx, ready_rx) = oneshot::channel();
        let event_handler = GatewayHandler {
            ready_sender: AsyncMutex::new(Some(ready_tx)),
            bridge: self.bridge.clone(),
            our_webhook_ids: self.our_webhook_ids.clone(),
        };

        let mut gateway_client = SerenityClient::builder(self.token.expose_secret(), intents)
            .event_handler(event_handler)
            .await
            .map_err(|err| anyhow!("failed to build discord gateway client: {err}"))?;

        let gateway_task = tokio::spawn(async move {
            if let Err(err) = gateway_client.start_autosharded().await {
                error!("discord gateway stopped: {err}");
            }
        });

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => {
                state.is_logged_in = true;
                state.gateway_task = Some(gateway_task);
                info!("discord bot login succeeded and gateway is connected");
                Ok(())
            }
            Ok(Err(_)) => {
                gateway_task.abort();
                Err(anyhow!("discord gateway exited before receiving Ready event"))
            }
            Err(_) => {
                gateway_task.abort();
                Err(anyhow!("timed out waiting for discord Ready event"))
            }
        }
    }

    /// Logs in, retrying with exponential backoff up to the configured attempt count.
    pub async fn start(&self) -> Result<()> {
        let mut retry_seconds = INITIAL_LOGIN_RETRY_SECONDS;
        let mut attempt = 1;

        loop {
            match self.login().await {
                Ok(()) => {
                    info!("discord client is ready");
                    return Ok(());
                }
                Err(err) if attempt >= self.login_retries => {
                    return Err(anyhow!(
                        "discord login failed after {attempt} attempts: {err}"
                    ));
                }
                Err(err) => {
                    error!(
                        "failed to start discord client: {err}. retrying in {} seconds",
                        retry_seconds
                    );
                    tokio::time::sleep(Duration::from_secs(retry_seconds)).await;
                    retry_seconds = (retry_seconds * 2).min(MAX_LOGIN_RETRY_SECONDS);
                    attempt += 1;
                }
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if !state.is_logged_in {
            return Ok(());
        }

        if let Some(gateway_task) = state.gateway_task.take() {
            gateway_task.abort();
            match gateway_task.await {
                Ok(()) => info!("discord gateway task exited"),
                Err(join_err) if join_err.is_cancelled() => {
                    info!("discord gateway task aborted")
                }
                Err(join_err) => {
                    error!("discord gateway task join error: {join_err}");
                }
            }
        }

        state.is_logged_in = false;
        info!("discord client stopped");
        Ok(())
    }

    async fn relay_target(&self, channel: ChannelId) -> Result<RelayTarget> {
        if let Some(target) = self.relay_targets.read().await.get(&channel) {
            return Ok(*target);
        }

        let http: &Http = &self.http;
        let resolved = channel
            .to_channel(http)
            .await
            .map_err(|e| anyhow!("failed to resolve discord channel {}: {}", channel, e))?;
        let target = match resolved {
            Channel::Guild(guild_channel) if guild_channel.thread_metadata.is_some() => {
                RelayTarget {
                    webhook_channel: guild_channel
                        .parent_id
                        .ok_or_else(|| anyhow!("thread {} has no parent channel", channel))?,
                    thread: Some(channel),
                }
            }
            _ => RelayTarget {
                webhook_channel: channel,
                thread: None,
            },
        };

        self.relay_targets.write().await.insert(channel, target);
        Ok(target)
    }

    async fn get_or_create_webhook(&self, channel: ChannelId) -> Result<Webhook> {
        if let Some(webhook) = self.webhook_cache.read().await.get(&channel) {
            return Ok(webhook.clone());
        }

        let http: &Http = &self.http;
        let webhooks = channel
            .webhooks(http)
            .await
            .map_err(|e| anyhow!("failed to fetch webhooks: {}", e))?;

        let existing = webhooks
            .into_iter()
            .find(|w| w.name.as_deref() == Some(self.webhook_name.as_str()) && w.token.is_some());

        let webhook = match existing {
            Some(webhook) => webhook,
            None => channel
                .create_webhook(http, CreateWebhook::new(&self.webhook_name))
                .await
                .map_err(|e| anyhow!("failed to create webhook: {}", e))?,
        };

        self.our_webhook_ids.write().await.insert(webhook.id);
        debug!("recorded our webhook id={} for channel={}", webhook.id, channel);

        self.webhook_cache
            .write()
            .await
            .insert(channel, webhook.clone());
        Ok(webhook)
    }

    fn allowed_mentions(&self) -> CreateAllowedMentions {
        CreateAllowedMentions::new()
            .all_users(true)
            .roles(self.mentionable_roles.clone())
    }
}

#[async_trait]
impl DiscordRelay for DiscordClient {
    async fn send_webhook_message(
        &self,
        channel_id: &str,
        message: &InboundMessage,
    ) -> Result<String> {
        let target = self.relay_target(self::channel_id(channel_id)?).await?;
        let webhook = self.get_or_create_webhook(target.webhook_channel).await?;

        let mut builder = ExecuteWebhook::new()
            .content(&message.content)
            .username(&message.username)
            .allowed_mentions(self.allowed_mentions());
        if let Some(avatar) = &message.avatar_url {
            builder = builder.avatar_url(avatar);
        }
        if let Some(thread) = target.thread {
            builder = builder.in_thread(thread);
        }

        let http: &Http = &self.http;
        let sent = webhook
            .execute(http, true, builder)
            .await
            .map_err(|e| anyhow!("webhook send failed: {}", e))?
            .ok_or_else(|| anyhow!("webhook execution returned no message"))?;

        debug!("sent message via webhook to channel {}, message_id={}", channel_id, sent.id);
        Ok(sent.id.to_string())
    }

    async fn edit_webhook_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<()> {
        let target = self.relay_target(self::channel_id(channel_id)?).await?;
        let webhook = self.get_or_create_webhook(target.webhook_channel).await?;

        let mut builder = EditWebhookMessage::new()
            .content(content)
            .allowed_mentions(self.allowed_mentions());
        if let Some(thread) = target.thread {
            builder = builder.in_thread(thread);
        }

        let http: &Http = &self.http;
        webhook
            .edit_message(http, self::message_id(message_id)?, builder)
            .await
            .map_err(|e| anyhow!("webhook edit failed: {}", e))?;
        debug!("edited message via webhook, message_id={}", message_id);
        Ok(())
    }

    async fn delete_webhook_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        let target = self.relay_target(self::channel_id(channel_id)?).await?;
        let webhook = self.get_or_create_webhook(target.webhook_channel).await?;

        let http: &Http = &self.http;
        match webhook
            .delete_message(http, target.thread, self::message_id(message_id)?)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => {
                debug!("webhook message {} was already gone", message_id);
                Ok(())
            }
            Err(err) => Err(anyhow!("webhook delete failed: {}", err)),
        }
    }

    async fn send_notice(&self, channel_id: &str, content: &str) -> Result<()> {
        let http: &Http = &self.http;
        self::channel_id(channel_id)?
            .send_message(http, CreateMessage::new().content(content))
            .await
            .map_err(|e| anyhow!("failed to send notice to discord: {}", e))?;
        Ok(())
    }
}

#[async_trait]
impl DiscordDirectory for DiscordClient {
    async fn channel_guild(&self, channel_id: &str) -> Result<Option<String>, BridgeError> {
        let Some(id) = parse_snowflake(channel_id) else {
            return Ok(None);
        };
        let http: &Http = &self.http;
        match ChannelId::new(id).to_channel(http).await {
            Ok(Channel::Guild(channel)) => Ok(Some(channel.guild_id.to_string())),
            Ok(_) => Ok(Some("@me".to_string())),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(BridgeError::TransientNetwork(err.to_string())),
        }
    }
}

//! Serenity-independent view of a Discord message.
//!
//! Built from the message's API JSON so the translator can be driven by
//! plain fixtures.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer};

use super::embed::DiscordEmbed;
use crate::parsers::common::discord_message_link;

const FLAG_LOADING: u64 = 1 << 7;
const REFERENCE_FORWARD: u8 = 1;
const TYPE_DEFAULT: u8 = 0;
const TYPE_REPLY: u8 = 19;
const TYPE_CHAT_INPUT_COMMAND: u8 = 20;
const TYPE_CONTEXT_MENU_COMMAND: u8 = 23;

static USER_MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@!?(\d+)>").expect("user mention regex must compile"));
static ROLE_MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@&(\d+)>").expect("role mention regex must compile"));
static CHANNEL_MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<#(\d+)>").expect("channel mention regex must compile"));

fn snowflake<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

fn optional_snowflake<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "snowflake")] String);
    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DiscordAttachment {
    pub filename: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiscordSticker {
    #[serde(deserialize_with = "snowflake")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub format_type: u8,
}

impl DiscordSticker {
    /// Image URL for static and animated image stickers; Lottie stickers have none.
    pub fn image_url(&self) -> Option<String> {
        let extension = match self.format_type {
            1 | 2 => "png",
            4 => "gif",
            _ => return None,
        };
        Some(format!(
            "https://media.discordapp.net/stickers/{}.{extension}",
            self.id
        ))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawMember {
    #[serde(default)]
    nick: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawUser {
    #[serde(deserialize_with = "snowflake")]
    id: String,
    #[serde(alias = "name")]
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    bot: bool,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    member: Option<RawMember>,
}

impl RawUser {
    fn display_name(&self, member: Option<&RawMember>) -> String {
        member
            .or(self.member.as_ref())
            .and_then(|m| m.nick.clone())
            .or_else(|| self.global_name.clone())
            .unwrap_or_else(|| self.username.clone())
    }

    fn avatar_url(&self) -> Option<String> {
        self.avatar.as_ref().map(|hash| {
            let extension = if hash.starts_with("a_") { "gif" } else { "png" };
            format!(
                "https://cdn.discordapp.com/avatars/{}/{hash}.{extension}",
                self.id
            )
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawReference {
    #[serde(rename = "type", default)]
    kind: Option<u8>,
    #[serde(default, deserialize_with = "optional_snowflake")]
    message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSnapshotMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    embeds: Vec<DiscordEmbed>,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
    #[serde(default)]
    sticker_items: Vec<DiscordSticker>,
    #[serde(default)]
    mentions: Vec<RawUser>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSnapshot {
    message: RawSnapshotMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMessage {
    #[serde(deserialize_with = "snowflake")]
    id: String,
    #[serde(deserialize_with = "snowflake")]
    channel_id: String,
    #[serde(default, deserialize_with = "optional_snowflake")]
    guild_id: Option<String>,
    author: RawUser,
    #[serde(default)]
    member: Option<RawMember>,
    #[serde(default)]
    content: String,
    #[serde(rename = "type", default)]
    kind: u8,
    #[serde(default)]
    flags: Option<u64>,
    #[serde(default, deserialize_with = "optional_snowflake")]
    webhook_id: Option<String>,
    #[serde(default)]
    mentions: Vec<RawUser>,
    #[serde(default)]
    embeds: Vec<DiscordEmbed>,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
    #[serde(default)]
    sticker_items: Vec<DiscordSticker>,
    #[serde(default)]
    message_reference: Option<RawReference>,
    #[serde(default)]
    referenced_message: Option<Box<RawMessage>>,
    #[serde(default)]
    message_snapshots: Vec<RawSnapshot>,
}

/// Role and channel names used to render mentions as plain text.
#[derive(Debug, Clone, Default)]
pub struct MentionNames {
    pub roles: HashMap<String, String>,
    pub channels: HashMap<String, String>,
}

impl MentionNames {
    /// Looks up the name of every role and channel mentioned in `texts`.
    pub fn collect<'a>(
        texts: impl IntoIterator<Item = &'a str>,
        role_name: impl Fn(&str) -> Option<String>,
        channel_name: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut names = Self::default();
        for text in texts {
            for caps in ROLE_MENTION_RE.captures_iter(text) {
                if let Some(name) = role_name(&caps[1]) {
                    names.roles.insert(caps[1].to_string(), name);
                }
            }
            for caps in CHANNEL_MENTION_RE.captures_iter(text) {
                if let Some(name) = channel_name(&caps[1]) {
                    names.channels.insert(caps[1].to_string(), name);
                }
            }
        }
        names
    }

    /// Resolves user, role and channel mentions to their rendered names.
    fn clean(&self, content: &str, users: &[RawUser]) -> String {
        let content = USER_MENTION_RE.replace_all(content, |caps: &Captures<'_>| {
            users
                .iter()
                .find(|user| user.id == caps[1])
                .map(|user| format!("@{}", user.display_name(None)))
                .unwrap_or_else(|| caps[0].to_string())
        });
        let content = ROLE_MENTION_RE.replace_all(&content, |caps: &Captures<'_>| {
            self.roles
                .get(&caps[1])
                .map(|name| format!("@{name}"))
                .unwrap_or_else(|| caps[0].to_string())
        });
        CHANNEL_MENTION_RE
            .replace_all(&content, |caps: &Captures<'_>| {
                self.channels
                    .get(&caps[1])
                    .map(|name| format!("#{name}"))
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedMessage {
    pub id: String,
    pub display_name: String,
    pub clean_content: String,
    pub has_attachments: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub id: Option<String>,
    pub clean_content: String,
    pub embeds: Vec<DiscordEmbed>,
    pub attachments: Vec<DiscordAttachment>,
    pub stickers: Vec<DiscordSticker>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscordMessage {
    pub id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub author_id: String,
    pub author_is_bot: bool,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub webhook_id: Option<String>,
    pub kind: u8,
    pub content: String,
    pub clean_content: String,
    pub loading: bool,
    pub reply_to: Option<ReferencedMessage>,
    pub forwards: Vec<MessageSnapshot>,
    pub embeds: Vec<DiscordEmbed>,
    pub stickers: Vec<DiscordSticker>,
    pub attachments: Vec<DiscordAttachment>,
}

impl DiscordMessage {
    pub fn from_api(value: serde_json::Value, names: &MentionNames) -> Result<Self, serde_json::Error> {
        let raw: RawMessage = serde_json::from_value(value)?;
        Ok(Self::from_raw(raw, names))
    }

    fn from_raw(raw: RawMessage, names: &MentionNames) -> Self {
        let reference_kind = raw.message_reference.as_ref().and_then(|r| r.kind).unwrap_or(0);

        let reply_to = match (&raw.referenced_message, raw.kind) {
            (Some(referenced), TYPE_REPLY) if reference_kind != REFERENCE_FORWARD => {
                Some(ReferencedMessage {
                    id: referenced.id.clone(),
                    display_name: referenced.author.display_name(referenced.member.as_ref()),
                    clean_content: names.clean(&referenced.content, &referenced.mentions),
                    has_attachments: !referenced.attachments.is_empty(),
                })
            }
            _ => None,
        };

        let forwards = if reference_kind == REFERENCE_FORWARD {
            let snapshot_id = raw.message_reference.as_ref().and_then(|r| r.message_id.clone());
            raw.message_snapshots
                .into_iter()
                .map(|snapshot| MessageSnapshot {
                    id: snapshot_id.clone(),
                    clean_content: names.clean(&snapshot.message.content, &snapshot.message.mentions),
                    embeds: snapshot.message.embeds.into_iter().filter(DiscordEmbed::is_rich).collect(),
                    attachments: snapshot.message.attachments,
                    stickers: snapshot.message.sticker_items,
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            clean_content: names.clean(&raw.content, &raw.mentions),
            display_name: raw.author.display_name(raw.member.as_ref()),
            avatar_url: raw.author.avatar_url(),
            author_id: raw.author.id,
            author_is_bot: raw.author.bot,
            id: raw.id,
            channel_id: raw.channel_id,
            guild_id: raw.guild_id,
            webhook_id: raw.webhook_id,
            kind: raw.kind,
            content: raw.content,
            loading: raw.flags.unwrap_or(0) & FLAG_LOADING != 0,
            reply_to,
            forwards,
            embeds: raw.embeds.into_iter().filter(DiscordEmbed::is_rich).collect(),
            stickers: raw.sticker_items,
            attachments: raw.attachments,
        }
    }

    /// Join notices, pins, boosts and the like.
    pub fn is_system(&self) -> bool {
        !matches!(
            self.kind,
            TYPE_DEFAULT | TYPE_REPLY | TYPE_CHAT_INPUT_COMMAND | TYPE_CONTEXT_MENU_COMMAND
        )
    }

    pub fn is_forward(&self) -> bool {
        !self.forwards.is_empty()
    }

    pub fn link(&self) -> String {
        discord_message_link(self.guild_id.as_deref(), &self.channel_id, &self.id)
    }
}

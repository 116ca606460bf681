//! Zulip → Discord message translation.

use std::sync::Arc;

use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use super::common::{
    apply_replacements, discord_message_link, encode_hash_component, enforce_length, mask_code,
    mask_code_spans, narrow_link, owned_matches, quote_blocks_to_lines, replace_fenced_blocks,
    splice,
};
use super::linkifier::LinkifierStore;
use super::{DiscordDirectory, ZulipDirectory};
use crate::db::{ChannelBinding, DatabaseManager, MessageCorrelation};
use crate::error::BridgeError;
use crate::zulip::ZulipMessage;

/// Discord's limit on webhook usernames.
const MAX_USERNAME_CHARS: usize = 80;

static SILENT_MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@_(\*)").expect("silent mention regex must compile"));
static USER_MENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@\*\*([^*\n|]+)(?:\|\d+)?\*\*").expect("user mention regex must compile")
});
static GROUP_MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\*([^*\n]+)\*").expect("group mention regex must compile"));
static RELATIVE_NARROW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\]\(/?(#narrow/[^)\s]+)\)").expect("relative narrow regex must compile")
});
static NARROW_MESSAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"https?://[^\s/)>]+/#narrow/(?:channel|stream)/\d+[^/\s)>]*/topic/[^/\s)>]+/(?:near|with)/(\d+)",
    )
    .expect("narrow link regex must compile")
});
static STREAM_MENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"#\*\*([^*>\n]+?)(?:>([^*\n]+?))?(?:@(\d+))?\*\*")
        .expect("stream mention regex must compile")
});
static USER_UPLOADS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\]\(/user_uploads/").expect("user uploads regex must compile"));
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<time:([^>\s]+)>").expect("time regex must compile"));

#[derive(Debug, Clone, Default)]
pub struct InboundOptions {
    pub realm: String,
    pub max_length: usize,
    /// `(zulip, discord)` spelling pairs; Zulip text is rewritten to the Discord spelling.
    pub text_replacements: Vec<(String, String)>,
    pub username_prefix: String,
    pub username_suffix: String,
}

/// What gets posted through the channel webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub username: String,
    pub avatar_url: Option<String>,
    pub content: String,
}

pub struct ZulipToDiscordTranslator {
    db: DatabaseManager,
    zulip: Arc<dyn ZulipDirectory>,
    discord: Arc<dyn DiscordDirectory>,
    linkifiers: Arc<LinkifierStore>,
    options: InboundOptions,
}

impl ZulipToDiscordTranslator {
    pub fn new(
        db: DatabaseManager,
        zulip: Arc<dyn ZulipDirectory>,
        discord: Arc<dyn DiscordDirectory>,
        linkifiers: Arc<LinkifierStore>,
        options: InboundOptions,
    ) -> Self {
        Self {
            db,
            zulip,
            discord,
            linkifiers,
            options,
        }
    }

    pub async fn translate(&self, message: &ZulipMessage) -> InboundMessage {
        let content = match message.content.strip_prefix("/me ") {
            Some(action) if message.is_me_message => {
                format!("*{} {}*", message.sender_full_name, action.trim())
            }
            _ => message.content.clone(),
        };
        let stream_id = message.stream_id.unwrap_or_default();

        InboundMessage {
            username: self.username(&message.sender_full_name),
            avatar_url: message.avatar_url.as_deref().map(|url| self.absolute(url)),
            content: self
                .translate_content(&content, stream_id, &message.subject, message.id)
                .await,
        }
    }

    /// Translates a Zulip markdown body that lives at `stream_id`/`topic`/`message_id`.
    pub async fn translate_content(
        &self,
        content: &str,
        stream_id: i64,
        topic: &str,
        message_id: i64,
    ) -> String {
        let masked = mask_code(content);
        let mut text = apply_replacements(
            &masked.text,
            self.options
                .text_replacements
                .iter()
                .map(|(zulip, discord)| (zulip.as_str(), discord.as_str())),
        );

        text = SILENT_MENTION_RE.replace_all(&text, "@$1").into_owned();
        text = RELATIVE_NARROW_RE
            .replace_all(&text, format!("](<{}/$1>)", self.realm()))
            .into_owned();
        text = self.rewrite_narrow_links(&text).await;
        text = self.rewrite_stream_mentions(&text).await;
        text = USER_MENTION_RE.replace_all(&text, "**@$1**").into_owned();
        text = GROUP_MENTION_RE.replace_all(&text, "**@$1**").into_owned();
        text = USER_UPLOADS_RE
            .replace_all(&text, format!("]({}/user_uploads/", self.realm()))
            .into_owned();
        text = rewrite_times(&text);
        text = masked.restore(&text);

        text = replace_fenced_blocks(&text, "spoiler", |block| {
            let title = block.argument.trim();
            let title = if title.is_empty() { "Spoiler" } else { title };
            Some(format!("**{title}**\n||{}||", block.body))
        });
        text = quote_blocks_to_lines(&text);
        text = self.linkify(&text);

        let suffix = format!(
            "\n[…see original](<{}>)",
            narrow_link(self.realm(), stream_id, None, topic, Some(message_id))
        );
        enforce_length(&text, self.options.max_length, &suffix)
    }

    fn realm(&self) -> &str {
        self.options.realm.trim_end_matches('/')
    }

    fn absolute(&self, url: &str) -> String {
        if url.starts_with('/') {
            format!("{}{url}", self.realm())
        } else {
            url.to_string()
        }
    }

    fn username(&self, full_name: &str) -> String {
        format!(
            "{}{full_name}{}",
            self.options.username_prefix, self.options.username_suffix
        )
        .chars()
        .take(MAX_USERNAME_CHARS)
        .collect()
    }

    fn linkify(&self, text: &str) -> String {
        let linkifiers = self.linkifiers.snapshot();
        if linkifiers.is_empty() {
            return text.to_string();
        }
        let masked = mask_code_spans(text);
        masked.restore(&linkifiers.linkify(&masked.text))
    }

    async fn rewrite_narrow_links(&self, text: &str) -> String {
        let mut edits = Vec::new();
        for found in owned_matches(&NARROW_MESSAGE_RE, text) {
            if !text[found.start..].starts_with(self.realm()) {
                continue;
            }
            let Some(message_id) = found.group(1).and_then(|id| id.parse().ok()) else {
                continue;
            };
            if let Some(link) = self.discord_link_for(message_id).await {
                edits.push((found.start, found.end, link));
            }
        }
        splice(text, edits)
    }

    async fn rewrite_stream_mentions(&self, text: &str) -> String {
        let mut edits = Vec::new();
        for found in owned_matches(&STREAM_MENTION_RE, text) {
            let Some(stream) = found.group(1) else {
                continue;
            };
            let topic = found.group(2);
            let message_id = found.group(3).and_then(|id| id.parse::<i64>().ok());

            if let Some(message_id) = message_id
                && let Some(link) = self.discord_link_for(message_id).await
            {
                edits.push((found.start, found.end, link));
                continue;
            }

            let stream_id = match self.zulip.stream_id(stream).await {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) => {
                    warn!(stream, error = %e, "failed to resolve zulip stream mention");
                    continue;
                }
            };

            if message_id.is_none()
                && let Some(binding) = self.binding_for(stream_id, topic).await
            {
                edits.push((
                    found.start,
                    found.end,
                    format!("<#{}>", binding.discord_channel_id),
                ));
                continue;
            }

            let label = match topic {
                Some(topic) => format!("#{stream}>{topic}"),
                None => format!("#{stream}"),
            };
            let url = match topic {
                Some(topic) => narrow_link(self.realm(), stream_id, Some(stream), topic, message_id),
                None => format!(
                    "{}/#narrow/channel/{stream_id}-{}",
                    self.realm(),
                    encode_hash_component(stream)
                ),
            };
            edits.push((found.start, found.end, format!("[{label}](<{url}>)")));
        }
        splice(text, edits)
    }

    async fn binding_for(&self, stream_id: i64, topic: Option<&str>) -> Option<ChannelBinding> {
        let store = self.db.channel_store();
        let mut lookups = vec![topic];
        if topic.is_some() {
            lookups.push(None);
        }
        for topic in lookups {
            match store.get_binding_by_stream_topic(stream_id, topic).await {
                Ok(Some(binding)) => return Some(binding),
                Ok(None) => {}
                Err(e) => {
                    warn!(stream_id, error = %e, "channel binding lookup failed");
                    return None;
                }
            }
        }
        None
    }

    async fn correlation_for(&self, zulip_message_id: i64) -> Option<MessageCorrelation> {
        match self
            .db
            .message_store()
            .get_by_zulip_message_id(zulip_message_id)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(zulip_message_id, error = %e, "message correlation lookup failed");
                None
            }
        }
    }

    /// Discord permalink of a bridged Zulip message.
    async fn discord_link_for(&self, zulip_message_id: i64) -> Option<String> {
        let correlation = self.correlation_for(zulip_message_id).await?;
        let discord_message_id = correlation.discord_message_id.as_deref()?;
        let channel_id = &correlation.discord_channel_id;

        match self.discord.channel_guild(channel_id).await {
            Ok(Some(guild)) => Some(discord_message_link(
                Some(&guild),
                channel_id,
                discord_message_id,
            )),
            Ok(None) => {
                let error =
                    BridgeError::DanglingReference(format!("discord channel {channel_id} is gone"));
                warn!(discord_channel_id = %channel_id, error = %error, "removing stale channel binding");
                if let Err(e) = self
                    .db
                    .channel_store()
                    .delete_binding_by_discord_channel(channel_id)
                    .await
                {
                    warn!(discord_channel_id = %channel_id, error = %e, "failed to delete stale channel binding");
                }
                None
            }
            Err(e) => {
                warn!(discord_channel_id = %channel_id, error = %e, "failed to resolve discord channel");
                None
            }
        }
    }
}

fn rewrite_times(text: &str) -> String {
    TIME_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            DateTime::parse_from_rfc3339(&caps[1])
                .map(|time| format!("<t:{}:F>", time.timestamp()))
                .unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::{InboundOptions, ZulipToDiscordTranslator};
    use crate::db::memory::MemoryStore;
    use crate::db::{ChannelBinding, ChannelStore, MessageCorrelation, MessageSource, MessageStore};
    use crate::parsers::linkifier::{LinkifierLimits, LinkifierStore};
    use crate::parsers::test_support::{FakeDiscord, FakeZulip};
    use crate::zulip::{LinkifierSource, ZulipMessage};

    const REALM: &str = "https://chat.example.org";

    struct Fixture {
        store: Arc<MemoryStore>,
        zulip: Arc<FakeZulip>,
        discord: Arc<FakeDiscord>,
        linkifiers: Arc<LinkifierStore>,
        options: InboundOptions,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                zulip: Arc::new(FakeZulip::default()),
                discord: Arc::new(FakeDiscord::default()),
                linkifiers: Arc::new(LinkifierStore::new(LinkifierLimits::default())),
                options: InboundOptions {
                    realm: REALM.to_string(),
                    max_length: 2000,
                    text_replacements: vec![("Zulip".to_string(), "Discord".to_string())],
                    username_prefix: String::new(),
                    username_suffix: " (Zulip)".to_string(),
                },
            }
        }

        fn translator(&self) -> ZulipToDiscordTranslator {
            ZulipToDiscordTranslator::new(
                self.store.manager(),
                self.zulip.clone(),
                self.discord.clone(),
                self.linkifiers.clone(),
                self.options.clone(),
            )
        }

        async fn content(&self, content: &str) -> String {
            self.translator()
                .translate_content(content, 7, "general", 99)
                .await
        }
    }

    fn zulip_message(content: &str) -> ZulipMessage {
        ZulipMessage {
            id: 99,
            sender_id: 5,
            sender_full_name: "Iago".to_string(),
            content: content.to_string(),
            kind: "stream".to_string(),
            stream_id: Some(7),
            subject: "general".to_string(),
            ..Default::default()
        }
    }

    async fn correlate(store: &MemoryStore, discord_id: &str, zulip_id: i64) {
        store
            .insert_correlation(&MessageCorrelation {
                id: 0,
                discord_message_id: Some(discord_id.to_string()),
                discord_channel_id: "200".to_string(),
                zulip_message_id: Some(zulip_id),
                zulip_stream_id: 7,
                zulip_topic: "general".to_string(),
                source: MessageSource::Discord,
                created_at: Utc::now(),
            })
            .await
            .expect("stored");
    }

    #[tokio::test]
    async fn me_messages_render_as_italics() {
        let fixture = Fixture::new();
        let mut message = zulip_message("/me waves");
        message.is_me_message = true;
        message.avatar_url = Some("/avatar/5".to_string());

        let translated = fixture.translator().translate(&message).await;

        assert_eq!(translated.content, "*Iago waves*");
        assert_eq!(translated.username, "Iago (Zulip)");
        assert_eq!(
            translated.avatar_url.as_deref(),
            Some("https://chat.example.org/avatar/5")
        );
    }

    #[tokio::test]
    async fn mentions_become_plain_bold_text() {
        let fixture = Fixture::new();

        assert_eq!(
            fixture
                .content("hi @**Polonius|12** @_**Hamlet** @**all** @*admins* from Zulip")
                .await,
            "hi **@Polonius** **@Hamlet** **@all** **@admins** from Discord"
        );
    }

    #[tokio::test]
    async fn quotes_spoilers_uploads_and_times() {
        let fixture = Fixture::new();

        let text = fixture
            .content(
                "```quote\nearlier\n```\n```spoiler Plot\nhe dies\n```\nat <time:2024-05-01T10:00:00Z> [f](/user_uploads/1/ab/f.txt)",
            )
            .await;

        assert_eq!(
            text,
            "> earlier\n**Plot**\n||he dies||\nat <t:1714557600:F> [f](https://chat.example.org/user_uploads/1/ab/f.txt)"
        );
    }

    #[tokio::test]
    async fn linkifiers_skip_code_spans() {
        let fixture = Fixture::new();
        fixture.linkifiers.replace(&[LinkifierSource {
            id: None,
            pattern: r"#(?P<id>[0-9]+)".to_string(),
            url_template: "https://tracker.example.org/{id}".to_string(),
        }]);

        assert_eq!(
            fixture.content("fixes #12 not `#13`").await,
            "fixes [#12](<https://tracker.example.org/12>) not `#13`"
        );
    }

    #[tokio::test]
    async fn code_is_left_verbatim() {
        let fixture = Fixture::new();

        assert_eq!(
            fixture
                .content("ping @**all** but not `@**all**` or\n```\nZulip #**dev** @_**Iago|5**\n```")
                .await,
            "ping **@all** but not `@**all**` or\n```\nZulip #**dev** @_**Iago|5**\n```"
        );
    }

    #[tokio::test]
    async fn code_inside_quotes_is_left_verbatim() {
        let fixture = Fixture::new();

        assert_eq!(
            fixture
                .content("```quote\n@**Iago** wrote `@**all**`\n```")
                .await,
            "> **@Iago** wrote `@**all**`"
        );
    }

    #[tokio::test]
    async fn message_links_resolve_to_discord_permalinks() {
        let fixture = Fixture::new();
        correlate(&fixture.store, "777", 55).await;
        fixture
            .discord
            .channels
            .lock()
            .insert("200".to_string(), "300".to_string());
        fixture.zulip.streams.lock().insert(7, "dev".to_string());

        let text = fixture
            .content(
                "see #**dev>general@55** and [here](https://chat.example.org/#narrow/channel/7-dev/topic/general/near/55) and #**dev>other@60**",
            )
            .await;

        assert_eq!(
            text,
            "see https://discord.com/channels/300/200/777 and [here](https://discord.com/channels/300/200/777) and [#dev>other](<https://chat.example.org/#narrow/channel/7-dev/topic/other/near/60>)"
        );
    }

    #[tokio::test]
    async fn link_into_deleted_discord_channel_drops_the_binding() {
        let fixture = Fixture::new();
        fixture
            .store
            .create_binding(&ChannelBinding::new("200", 7, Some("general".to_string())))
            .await
            .expect("bound");
        correlate(&fixture.store, "777", 55).await;

        let content = "[here](https://chat.example.org/#narrow/channel/7-dev/topic/general/near/55)";
        assert_eq!(fixture.content(content).await, content);
        assert!(fixture.store.bindings().is_empty());
        assert!(fixture.store.messages().is_empty());
    }

    #[tokio::test]
    async fn stream_mentions_prefer_bridged_channels() {
        let fixture = Fixture::new();
        fixture.zulip.streams.lock().insert(7, "dev".to_string());
        fixture.zulip.streams.lock().insert(8, "ops".to_string());
        fixture
            .store
            .create_binding(&ChannelBinding::new("200", 7, None))
            .await
            .expect("bound");

        assert_eq!(
            fixture.content("#**dev>anything** #**ops** #**nope**").await,
            "<#200> [#ops](<https://chat.example.org/#narrow/channel/8-ops>) #**nope**"
        );
    }

    #[tokio::test]
    async fn long_content_links_back_to_zulip() {
        let fixture = Fixture::new();

        let text = fixture.content(&"word ".repeat(1000)).await;

        assert!(text.chars().count() <= 2000);
        assert!(text.ends_with(
            "\n[…see original](<https://chat.example.org/#narrow/channel/7/topic/general/near/99>)"
        ));
    }

    #[tokio::test]
    async fn usernames_are_capped_for_webhooks() {
        let mut fixture = Fixture::new();
        fixture.options.username_prefix = "Z: ".to_string();
        let mut message = zulip_message("hi");
        message.sender_full_name = "x".repeat(100);

        let translated = fixture.translator().translate(&message).await;

        assert_eq!(translated.username.chars().count(), 80);
        assert!(translated.username.starts_with("Z: xxx"));
    }
}

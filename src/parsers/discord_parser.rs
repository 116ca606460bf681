//! Discord → Zulip message translation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, warn};

use super::common::{
    REPLY_PREVIEW_CHARS, ZERO_WIDTH_SPACE, apply_replacements, custom_emoji_to_text,
    enforce_length, fenced_quote, narrow_link, owned_matches, preview, splice,
};
use super::{AttachmentMirror, ZulipDirectory};
use crate::db::{DatabaseManager, MessageCorrelation, MessageSource};
use crate::discord::{DiscordAttachment, DiscordMessage, DiscordSticker, ReferencedMessage};
use crate::error::BridgeError;

const LOADING_MARKER: &str = "*Loading…*";

static PERMALINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://(?:(?:canary|ptb)\.)?discord(?:app)?\.com/channels/(\d+|@me)/(\d+)/(\d+)")
        .expect("permalink regex must compile")
});
static ASSET_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://(?:cdn|media)\.discordapp\.(?:com|net)/attachments/[^\s)>\]]+")
        .expect("asset url regex must compile")
});
static TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<t:(-?\d{1,13})(?::[tTdDfFR])?>").expect("timestamp regex must compile")
});
static WILDCARD_MENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@\*\*(all|everyone|channel|topic|stream)\*\*")
        .expect("wildcard mention regex must compile")
});
static GROUP_MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\*([^*\n]+)\*").expect("group mention regex must compile"));

#[derive(Debug, Clone, Default)]
pub struct OutboundOptions {
    pub realm: String,
    pub max_length: usize,
    /// `(zulip, discord)` spelling pairs; Discord text is rewritten to the Zulip spelling.
    pub text_replacements: Vec<(String, String)>,
    pub mentionable_groups: HashSet<String>,
}

pub struct DiscordToZulipTranslator {
    db: DatabaseManager,
    zulip: Arc<dyn ZulipDirectory>,
    mirror: Option<Arc<dyn AttachmentMirror>>,
    options: OutboundOptions,
}

impl DiscordToZulipTranslator {
    pub fn new(
        db: DatabaseManager,
        zulip: Arc<dyn ZulipDirectory>,
        mirror: Option<Arc<dyn AttachmentMirror>>,
        options: OutboundOptions,
    ) -> Self {
        Self {
            db,
            zulip,
            mirror,
            options,
        }
    }

    /// Builds the Zulip message body for `message`.
    pub async fn translate(&self, message: &DiscordMessage) -> String {
        let header = format!(
            "@{ZERO_WIDTH_SPACE}{}: {}",
            message.display_name,
            self.clean_text(&message.clean_content)
        );

        if message.loading {
            return format!("{header}{LOADING_MARKER}");
        }

        let mut text = header.clone();

        if let Some(reference) = &message.reply_to {
            text = format!("{}\n\n{text}", self.reply_preview(reference).await);
        }

        if message.is_forward() {
            let mut blocks = Vec::with_capacity(message.forwards.len());
            for snapshot in &message.forwards {
                let link = match snapshot.id.as_deref() {
                    Some(id) => self.narrow_for_discord_message(id).await,
                    None => None,
                };
                let label = link
                    .map(|url| format!("[Message]({url})"))
                    .unwrap_or_else(|| "Message".to_string());

                let mut body = self.clean_text(&snapshot.clean_content);
                body.push_str(&render_embeds(&snapshot.embeds));
                body.push_str(&sticker_links(&snapshot.stickers));
                body.push_str(&self.attachment_links(&snapshot.attachments).await);

                blocks.push(format!(
                    "{label} forwarded by @{ZERO_WIDTH_SPACE}{}:\n{}",
                    message.display_name,
                    fenced_quote(&body, 6)
                ));
            }
            text = blocks.join("\n");
            if !message.clean_content.is_empty() || !message.attachments.is_empty() {
                text = format!("{text}\n{header}");
            }
        }

        text.push_str(&render_embeds(&message.embeds));
        text = self.rewrite_permalinks(&text).await;
        text = self.mirror_asset_urls(&text).await;
        text = rewrite_timestamps(&text);
        text.push_str(&sticker_links(&message.stickers));
        text.push_str(&self.attachment_links(&message.attachments).await);
        text = self.guard_mentions(&text);

        let suffix = format!("\n[…see original]({})", message.link());
        enforce_length(&text, self.options.max_length, &suffix)
    }

    fn clean_text(&self, text: &str) -> String {
        let replaced = apply_replacements(
            text,
            self.options
                .text_replacements
                .iter()
                .map(|(zulip, discord)| (discord.as_str(), zulip.as_str())),
        );
        custom_emoji_to_text(&replaced)
    }

    async fn correlation_for(&self, discord_message_id: &str) -> Option<MessageCorrelation> {
        match self
            .db
            .message_store()
            .get_by_discord_message_id(discord_message_id)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(discord_message_id, error = %e, "message correlation lookup failed");
                None
            }
        }
    }

    async fn narrow_for_discord_message(&self, discord_message_id: &str) -> Option<String> {
        let correlation = self.correlation_for(discord_message_id).await?;
        let zulip_id = correlation.zulip_message_id?;
        Some(narrow_link(
            &self.options.realm,
            correlation.zulip_stream_id,
            None,
            &correlation.zulip_topic,
            Some(zulip_id),
        ))
    }

    async fn reply_preview(&self, reference: &ReferencedMessage) -> String {
        let mut link = "Reply to".to_string();
        let mut author = format!("@{ZERO_WIDTH_SPACE}{}", reference.display_name);
        let mut content = reference.clean_content.clone();

        if let Some(correlation) = self.correlation_for(&reference.id).await
            && let Some(zulip_id) = correlation.zulip_message_id
        {
            link = format!(
                "[Reply to]({})",
                narrow_link(
                    &self.options.realm,
                    correlation.zulip_stream_id,
                    None,
                    &correlation.zulip_topic,
                    Some(zulip_id),
                )
            );
            if correlation.source == MessageSource::Zulip {
                match self.zulip.message_source(zulip_id).await {
                    Ok(Some(source)) => {
                        content = source.content;
                        author = format!("@**{}|{}**", source.sender_full_name, source.sender_id);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(zulip_message_id = zulip_id, error = %e, "failed to fetch replied-to zulip message"),
                }
            }
        }

        let mut line = format!("> {link} {author}: ");
        if reference.has_attachments {
            line.push_str("🖼️ ");
        }
        line.push_str(&preview(&content, REPLY_PREVIEW_CHARS));
        line
    }

    async fn rewrite_permalinks(&self, text: &str) -> String {
        let mut edits = Vec::new();
        for found in owned_matches(&PERMALINK_RE, text) {
            let before = &text[..found.start];
            let linked = before.ends_with("](") || before.ends_with("](<");
            let Some(message_id) = found.group(3) else {
                continue;
            };
            if let Some(replacement) = self.resolve_permalink(message_id, linked).await {
                edits.push((found.start, found.end, replacement));
            }
        }
        splice(text, edits)
    }

    async fn resolve_permalink(&self, discord_message_id: &str, linked: bool) -> Option<String> {
        let correlation = self.correlation_for(discord_message_id).await?;
        let zulip_id = correlation.zulip_message_id?;

        match self.zulip.stream_name(correlation.zulip_stream_id).await {
            Ok(Some(stream)) if linked => Some(narrow_link(
                &self.options.realm,
                correlation.zulip_stream_id,
                Some(&stream),
                &correlation.zulip_topic,
                Some(zulip_id),
            )),
            Ok(Some(stream)) => Some(format!(
                "#**{stream}>{}@{zulip_id}**",
                correlation.zulip_topic
            )),
            Ok(None) => {
                let error = BridgeError::DanglingReference(format!(
                    "zulip stream {} is gone",
                    correlation.zulip_stream_id
                ));
                warn!(discord_channel_id = %correlation.discord_channel_id, error = %error, "removing stale channel binding");
                self.remove_binding(&correlation.discord_channel_id).await;
                None
            }
            Err(e) => {
                warn!(zulip_stream_id = correlation.zulip_stream_id, error = %e, "failed to resolve zulip stream for permalink");
                None
            }
        }
    }

    async fn remove_binding(&self, discord_channel_id: &str) {
        if let Err(e) = self
            .db
            .channel_store()
            .delete_binding_by_discord_channel(discord_channel_id)
            .await
        {
            warn!(discord_channel_id, error = %e, "failed to delete stale channel binding");
        }
    }

    async fn mirror_asset_urls(&self, text: &str) -> String {
        let Some(mirror) = &self.mirror else {
            return text.to_string();
        };

        let urls: Vec<&str> = ASSET_URL_RE
            .find_iter(text)
            .map(|m| m.as_str())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut out = text.to_string();
        for url in urls {
            match mirror.mirror(url, filename_from_url(url), None).await {
                Ok(mirrored) => out = out.replace(url, &mirrored),
                Err(e) => warn!(url, error = %e, "failed to mirror discord asset"),
            }
        }
        out
    }

    async fn attachment_links(&self, attachments: &[DiscordAttachment]) -> String {
        let mut out = String::new();
        for attachment in attachments {
            let mut url = attachment.url.clone();
            if let Some(mirror) = &self.mirror {
                match mirror
                    .mirror(&attachment.url, &attachment.filename, attachment.content_type.as_deref())
                    .await
                {
                    Ok(mirrored) => url = mirrored,
                    Err(e) => {
                        warn!(url = %attachment.url, error = %e, "failed to mirror attachment, linking the original")
                    }
                }
            }
            let label = match attachment.description.as_deref().filter(|d| !d.is_empty()) {
                Some(description) => format!("{description}: {}", attachment.filename),
                None => attachment.filename.clone(),
            };
            out.push_str(&format!("\n[{label}]({url})"));
        }
        out
    }

    fn guard_mentions(&self, text: &str) -> String {
        let text = WILDCARD_MENTION_RE.replace_all(text, format!("@{ZERO_WIDTH_SPACE}**$1**"));
        GROUP_MENTION_RE
            .replace_all(&text, |caps: &Captures<'_>| {
                if self.options.mentionable_groups.contains(&caps[1]) {
                    caps[0].to_string()
                } else {
                    debug!(group = &caps[1], "neutralising zulip group mention");
                    format!("@{ZERO_WIDTH_SPACE}*{}*", &caps[1])
                }
            })
            .into_owned()
    }
}

fn render_embeds(embeds: &[crate::discord::DiscordEmbed]) -> String {
    if embeds.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = embeds.iter().map(|e| e.to_zulip_markdown()).collect();
    format!("\n{}", rendered.join("\n"))
}

fn sticker_links(stickers: &[DiscordSticker]) -> String {
    stickers
        .iter()
        .map(|sticker| match sticker.image_url() {
            Some(url) => format!("\n[{}]({url})", sticker.name),
            None => format!("\n*{}*", sticker.name),
        })
        .collect()
}

fn rewrite_timestamps(text: &str) -> String {
    TIMESTAMP_RE
        .replace_all(text, |caps: &Captures<'_>| {
            caps[1]
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(|time| format!("<time:{}>", time.to_rfc3339_opts(SecondsFormat::Millis, true)))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn filename_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use crate::parsers::test_support::{FakeMirror, FakeZulip};
    use super::{DiscordToZulipTranslator, OutboundOptions};
    use crate::db::memory::MemoryStore;
    use crate::db::{ChannelBinding, ChannelStore, MessageCorrelation, MessageSource, MessageStore};
    use crate::discord::message::fixtures;
    use crate::discord::{DiscordMessage, MentionNames};
    use crate::config::ZulipConfig;
    use crate::zulip::{ZulipClient, ZulipMessage};

    const REALM: &str = "https://chat.example.org";

    fn options() -> OutboundOptions {
        OutboundOptions {
            realm: REALM.to_string(),
            max_length: 10_000,
            text_replacements: vec![("Zulip".to_string(), "Discord".to_string())],
            mentionable_groups: HashSet::from(["support".to_string()]),
        }
    }

    fn translator(store: &Arc<MemoryStore>, zulip: Arc<FakeZulip>) -> DiscordToZulipTranslator {
        DiscordToZulipTranslator::new(store.manager(), zulip, None, options())
    }

    fn message(value: serde_json::Value) -> DiscordMessage {
        DiscordMessage::from_api(value, &MentionNames::default()).expect("valid fixture")
    }

    fn correlation(discord_id: &str, zulip_id: i64, source: MessageSource) -> MessageCorrelation {
        MessageCorrelation {
            id: 0,
            discord_message_id: Some(discord_id.to_string()),
            discord_channel_id: "200".to_string(),
            zulip_message_id: Some(zulip_id),
            zulip_stream_id: 7,
            zulip_topic: "general".to_string(),
            source,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn composes_header_and_rewrites_inline_tokens() {
        let store = MemoryStore::new();
        let translator = translator(&store, Arc::new(FakeZulip::default()));

        let text = translator
            .translate(&message(fixtures::message(
                "Discord <:party:123> at <t:1714557600:R> @**all** @*support* @*staff*",
            )))
            .await;

        assert_eq!(
            text,
            "@\u{200b}Alice: Zulip :party: at <time:2024-05-01T10:00:00.000Z> @\u{200b}**all** @*support* @\u{200b}*staff*"
        );
    }

    #[tokio::test]
    async fn loading_placeholder_stops_after_header() {
        let store = MemoryStore::new();
        let translator = translator(&store, Arc::new(FakeZulip::default()));
        let mut value = fixtures::message("");
        value["flags"] = json!(128);
        value["embeds"] = json!([{"type": "rich", "title": "ignored"}]);

        assert_eq!(
            translator.translate(&message(value)).await,
            "@\u{200b}Alice: *Loading…*"
        );
    }

    #[tokio::test]
    async fn reply_to_unbridged_message_uses_its_own_content() {
        let store = MemoryStore::new();
        let translator = translator(&store, Arc::new(FakeZulip::default()));
        let mut value = fixtures::message("answer");
        value["type"] = json!(19);
        let mut referenced = fixtures::message("> old quote\nwhat is\nthis?");
        referenced["id"] = json!("900");
        referenced["author"] = json!({"id": "43", "username": "bob"});
        value["referenced_message"] = referenced;

        let text = translator.translate(&message(value)).await;

        assert_eq!(
            text,
            "> Reply to @\u{200b}bob: what is this?\n\n@\u{200b}Alice: answer"
        );
    }

    #[tokio::test]
    async fn reply_to_zulip_message_links_and_quotes_the_source() {
        let store = MemoryStore::new();
        store
            .insert_correlation(&correlation("900", 55, MessageSource::Zulip))
            .await
            .expect("stored");
        let zulip = Arc::new(FakeZulip::default());
        zulip.messages.lock().insert(
            55,
            ZulipMessage {
                id: 55,
                sender_id: 9,
                sender_full_name: "Iago".to_string(),
                content: "raw **markdown**".to_string(),
                ..Default::default()
            },
        );
        let translator = translator(&store, zulip);
        let mut value = fixtures::message("ok");
        value["type"] = json!(19);
        let mut referenced = fixtures::message("rendered");
        referenced["id"] = json!("900");
        value["referenced_message"] = referenced;

        let text = translator.translate(&message(value)).await;

        assert!(text.starts_with(
            "> [Reply to](https://chat.example.org/#narrow/channel/7/topic/general/near/55) @**Iago|9**: raw **markdown**\n\n"
        ));
    }

    #[tokio::test]
    async fn forwards_are_wrapped_in_attributed_blocks() {
        let store = MemoryStore::new();
        let translator = translator(&store, Arc::new(FakeZulip::default()));
        let mut value = fixtures::message("");
        value["message_reference"] = json!({"type": 1, "message_id": "555"});
        value["message_snapshots"] = json!([{"message": {
            "content": "look",
            "attachments": [{"filename": "a.png", "url": "https://cdn.discordapp.com/attachments/1/2/a.png"}]
        }}]);

        let text = translator.translate(&message(value)).await;

        assert_eq!(
            text,
            "Message forwarded by @\u{200b}Alice:\n``````quote\nlook\n[a.png](https://cdn.discordapp.com/attachments/1/2/a.png)\n``````"
        );
    }

    #[tokio::test]
    async fn permalinks_become_zulip_links_or_mentions() {
        let store = MemoryStore::new();
        store
            .insert_correlation(&correlation("777", 88, MessageSource::Discord))
            .await
            .expect("stored");
        let zulip = Arc::new(FakeZulip::default());
        zulip.streams.lock().insert(7, "dev".to_string());
        let translator = translator(&store, zulip);

        let text = translator
            .translate(&message(fixtures::message(
                "see https://discord.com/channels/300/200/777 or [this](https://discord.com/channels/300/200/777)",
            )))
            .await;

        assert_eq!(
            text,
            "@\u{200b}Alice: see #**dev>general@88** or [this](https://chat.example.org/#narrow/channel/7-dev/topic/general/near/88)"
        );
    }

    #[tokio::test]
    async fn permalink_into_removed_stream_drops_the_binding_and_keeps_the_link() {
        let store = MemoryStore::new();
        store
            .create_binding(&ChannelBinding::new("200", 7, None))
            .await
            .expect("bound");
        store
            .insert_correlation(&correlation("777", 88, MessageSource::Discord))
            .await
            .expect("stored");
        let translator = translator(&store, Arc::new(FakeZulip::default()));

        let content = "see https://discord.com/channels/300/200/777";
        let text = translator.translate(&message(fixtures::message(content))).await;

        assert_eq!(text, format!("@\u{200b}Alice: {content}"));
        assert!(store.bindings().is_empty());
        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn zulip_outage_keeps_the_binding_behind_a_permalink() {
        let mut server = mockito::Server::new_async().await;
        let lookup = server
            .mock("GET", "/api/v1/streams/7")
            .with_status(500)
            .with_header("content-type", "application/json")
            .with_body(r#"{"result":"error","msg":"Internal server error"}"#)
            .expect_at_least(1)
            .create_async()
            .await;
        let zulip = ZulipClient::new(&ZulipConfig {
            realm: server.url(),
            email: "bridge-bot@chat.example.org".to_string(),
            api_key: "secret-key".to_string(),
            bot_user_id: 42,
            poll_delay_ms: 1,
            startup_retries: 1,
            request_timeout_secs: 5,
            max_message_length: 10_000,
            max_file_upload_size_mib: 10,
        })
        .expect("client builds");

        let store = MemoryStore::new();
        store
            .create_binding(&ChannelBinding::new("200", 7, None))
            .await
            .expect("bound");
        store
            .insert_correlation(&correlation("777", 88, MessageSource::Discord))
            .await
            .expect("stored");
        let translator =
            DiscordToZulipTranslator::new(store.manager(), Arc::new(zulip), None, options());

        let content = "see https://discord.com/channels/300/200/777";
        let text = translator.translate(&message(fixtures::message(content))).await;

        assert_eq!(text, format!("@\u{200b}Alice: {content}"));
        assert_eq!(store.bindings().len(), 1);
        assert_eq!(store.messages().len(), 1);
        lookup.assert_async().await;
    }

    #[tokio::test]
    async fn attachments_are_mirrored_when_enabled() {
        let store = MemoryStore::new();
        let mirror = Arc::new(FakeMirror::default());
        let translator = DiscordToZulipTranslator::new(
            store.manager(),
            Arc::new(FakeZulip::default()),
            Some(mirror.clone()),
            options(),
        );
        let mut value = fixtures::message("");
        value["attachments"] = json!([{
            "filename": "cat.png", "description": "a cat",
            "url": "https://cdn.discordapp.com/attachments/1/2/cat.png"
        }]);
        value["sticker_items"] = json!([{"id": "5", "name": "wave", "format_type": 1}, {"id": "6", "name": "dance", "format_type": 3}]);

        let text = translator.translate(&message(value)).await;

        assert_eq!(
            text,
            "@\u{200b}Alice: \n[wave](https://media.discordapp.net/stickers/5.png)\n*dance*\n[a cat: cat.png](/user_uploads/2/xx/cat.png)"
        );
        assert_eq!(mirror.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn long_messages_are_cut_with_a_link_back() {
        let store = MemoryStore::new();
        let mut options = options();
        options.max_length = 200;
        let translator = DiscordToZulipTranslator::new(
            store.manager(),
            Arc::new(FakeZulip::default()),
            None,
            options,
        );

        let text = translator
            .translate(&message(fixtures::message(&"lorem ipsum ".repeat(100))))
            .await;

        assert!(text.chars().count() <= 200);
        assert!(text.ends_with("\n[…see original](https://discord.com/channels/300/200/1001)"));
    }
}

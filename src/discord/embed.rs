use serde::{Deserialize, Serialize};

use crate::parsers::common::fenced_quote;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedMedia {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

/// The parts of a Discord embed that survive relaying.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordEmbed {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub author: Option<EmbedAuthor>,
    #[serde(default)]
    pub footer: Option<EmbedFooter>,
    #[serde(default)]
    pub thumbnail: Option<EmbedMedia>,
    #[serde(default)]
    pub image: Option<EmbedMedia>,
    #[serde(default)]
    pub fields: Vec<EmbedField>,
}

fn link(label: &str, url: Option<&str>) -> String {
    match url {
        Some(url) => format!("[{label}]({url})"),
        None => label.to_string(),
    }
}

impl DiscordEmbed {
    /// Link previews and media embeds are generated by Discord and are not relayed.
    pub fn is_rich(&self) -> bool {
        self.kind.as_deref().is_none_or(|kind| kind == "rich")
    }

    fn thumbnail_url(&self) -> Option<&str> {
        self.thumbnail.as_ref().and_then(|t| t.url.as_deref())
    }

    /// Renders the embed as a Zulip quote block.
    pub fn to_zulip_markdown(&self) -> String {
        let mut lines = Vec::new();

        if let Some(author) = self.author.as_ref().filter(|a| !a.name.is_empty()) {
            lines.push(format!("{}:", link(&author.name, author.url.as_deref())));
        }

        match (self.title.as_deref(), self.thumbnail_url()) {
            (Some(title), thumbnail) => {
                let thumbnail = thumbnail
                    .map(|url| format!(" [thumbnail]({url})"))
                    .unwrap_or_default();
                lines.push(format!("**{}**{thumbnail}", link(title, self.url.as_deref())));
            }
            (None, Some(thumbnail)) => lines.push(format!("[thumbnail]({thumbnail})")),
            (None, None) => {}
        }

        if let Some(description) = self.description.as_deref().filter(|d| !d.is_empty()) {
            lines.push(description.to_string());
        }

        for field in &self.fields {
            lines.push(format!("- **{}**\n{}", field.name, fenced_quote(&field.value, 4)));
        }

        if let Some(image) = self.image.as_ref().and_then(|i| i.url.as_deref()) {
            lines.push(format!("[image]({image})"));
        }

        let timestamp = self.timestamp.as_deref().map(|ts| format!("<time:{ts}>"));
        match (self.footer.as_ref().filter(|f| !f.text.is_empty()), timestamp) {
            (Some(footer), Some(ts)) => lines.push(format!("{} • {ts}", footer.text)),
            (Some(footer), None) => lines.push(footer.text.clone()),
            (None, Some(ts)) => lines.push(ts),
            (None, None) => {}
        }

        fenced_quote(&lines.join("\n"), 5)
    }
}

#[cfg(test)]
mod tests {
    use super::{DiscordEmbed, EmbedAuthor, EmbedField, EmbedFooter, EmbedMedia};

    #[test]
    fn renders_full_embed_in_wide_quote_block() {
        let embed = DiscordEmbed {
            kind: Some("rich".to_string()),
            title: Some("Release".to_string()),
            url: Some("https://example.org/r".to_string()),
            description: Some("Notes".to_string()),
            timestamp: Some("2024-05-01T10:00:00.000Z".to_string()),
            author: Some(EmbedAuthor {
                name: "CI".to_string(),
                url: None,
            }),
            footer: Some(EmbedFooter {
                text: "build 7".to_string(),
            }),
            thumbnail: Some(EmbedMedia {
                url: Some("https://example.org/t.png".to_string()),
            }),
            image: None,
            fields: vec![EmbedField {
                name: "Status".to_string(),
                value: "green".to_string(),
                inline: false,
            }],
        };

        assert_eq!(
            embed.to_zulip_markdown(),
            "`````quote\nCI:\n**[Release](https://example.org/r)** [thumbnail](https://example.org/t.png)\nNotes\n- **Status**\n````quote\ngreen\n````\nbuild 7 • <time:2024-05-01T10:00:00.000Z>\n`````"
        );
    }

    #[test]
    fn link_previews_are_not_rich() {
        let embed = DiscordEmbed {
            kind: Some("link".to_string()),
            ..Default::default()
        };
        assert!(!embed.is_rich());
        assert!(DiscordEmbed::default().is_rich());
    }

    #[test]
    fn fence_widens_when_field_contains_code() {
        let embed = DiscordEmbed {
            fields: vec![EmbedField {
                name: "Log".to_string(),
                value: "``````\nboom\n``````".to_string(),
                inline: false,
            }],
            ..Default::default()
        };

        let rendered = embed.to_zulip_markdown();
        assert!(rendered.starts_with("````````quote\n"));
        assert!(rendered.contains("```````quote\n``````\nboom"));
    }
}

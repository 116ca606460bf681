use chrono::Utc;

use crate::db::{ChannelBinding, MessageCorrelation, MessageSource};
use crate::discord::DiscordMessage;
use crate::zulip::ZulipMessage;

/// Zulip caps topic names at 60 characters.
pub(crate) const MAX_TOPIC_CHARS: usize = 60;

/// Topic used for Discord messages in channels bound to a whole stream.
pub(crate) const STREAM_WIDE_TOPIC: &str = "discord";

pub(crate) fn outbound_topic(binding: &ChannelBinding) -> &str {
    binding.zulip_topic.as_deref().unwrap_or(STREAM_WIDE_TOPIC)
}

pub(crate) fn thread_topic(parent_topic: Option<&str>, thread_name: &str) -> String {
    let topic = match parent_topic {
        Some(parent) => format!("{parent}/{thread_name}"),
        None => thread_name.to_string(),
    };
    topic.chars().take(MAX_TOPIC_CHARS).collect()
}

pub(crate) fn discord_correlation(
    message: &DiscordMessage,
    binding: &ChannelBinding,
    zulip_message_id: i64,
) -> MessageCorrelation {
    MessageCorrelation {
        id: 0,
        discord_message_id: Some(message.id.clone()),
        discord_channel_id: message.channel_id.clone(),
        zulip_message_id: Some(zulip_message_id),
        zulip_stream_id: binding.zulip_stream_id,
        zulip_topic: outbound_topic(binding).to_string(),
        source: MessageSource::Discord,
        created_at: Utc::now(),
    }
}

pub(crate) fn zulip_correlation(
    message: &ZulipMessage,
    binding: &ChannelBinding,
    discord_message_id: &str,
) -> MessageCorrelation {
    MessageCorrelation {
        id: 0,
        discord_message_id: Some(discord_message_id.to_string()),
        discord_channel_id: binding.discord_channel_id.clone(),
        zulip_message_id: Some(message.id),
        zulip_stream_id: binding.zulip_stream_id,
        zulip_topic: message.subject.clone(),
        source: MessageSource::Zulip,
        created_at: Utc::now(),
    }
}

pub(crate) fn status_report(binding: Option<&ChannelBinding>, stream_name: Option<&str>) -> String {
    let Some(binding) = binding else {
        return "This channel is not bridged to Zulip.".to_string();
    };
    let stream = stream_name
        .map(str::to_string)
        .unwrap_or_else(|| format!("stream {}", binding.zulip_stream_id));
    let target = match binding.zulip_topic.as_deref() {
        Some(topic) => format!("`{stream}` > `{topic}`"),
        None => format!("every topic of `{stream}`"),
    };
    let threads = if binding.include_threads { "on" } else { "off" };
    format!("This channel is bridged to {target}. Thread mirroring is {threads}.")
}

#[cfg(test)]
mod tests {
    use super::{outbound_topic, status_report, thread_topic, zulip_correlation};
    use crate::db::{ChannelBinding, MessageSource};
    use crate::zulip::ZulipMessage;

    #[test]
    fn thread_topics_nest_under_the_parent_topic() {
        assert_eq!(thread_topic(Some("general"), "bug 12"), "general/bug 12");
        assert_eq!(thread_topic(None, "bug 12"), "bug 12");
        assert_eq!(thread_topic(Some("t"), &"x".repeat(100)).chars().count(), 60);
    }

    #[test]
    fn stream_wide_bindings_use_a_fixed_topic() {
        assert_eq!(outbound_topic(&ChannelBinding::new("1", 7, None)), "discord");
        assert_eq!(
            outbound_topic(&ChannelBinding::new("1", 7, Some("ops".to_string()))),
            "ops"
        );
    }

    #[test]
    fn zulip_correlation_keeps_the_message_topic() {
        let binding = ChannelBinding::new("200", 7, None);
        let message = ZulipMessage {
            id: 55,
            subject: "deploys".to_string(),
            ..Default::default()
        };

        let correlation = zulip_correlation(&message, &binding, "900");

        assert_eq!(correlation.zulip_topic, "deploys");
        assert_eq!(correlation.discord_message_id.as_deref(), Some("900"));
        assert_eq!(correlation.source, MessageSource::Zulip);
    }

    #[test]
    fn status_describes_the_binding() {
        let mut binding = ChannelBinding::new("200", 7, Some("general".to_string()));
        binding.include_threads = true;

        assert_eq!(
            status_report(Some(&binding), Some("dev")),
            "This channel is bridged to `dev` > `general`. Thread mirroring is on."
        );
        assert_eq!(
            status_report(None, None),
            "This channel is not bridged to Zulip."
        );
    }
}

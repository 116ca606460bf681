pub const COMMAND_PREFIX: &str = "!zulip";

const USAGE: &str = "Usage: `!zulip bridge <stream> [topic]`, `!zulip unbridge`, \
`!zulip threads on|off`, `!zulip status`. Quote stream names that contain spaces.";

/// Stream given to `!zulip bridge`, either by id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRef {
    Id(i64),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscordCommandOutcome {
    Ignored,
    Reply(String),
    BridgeRequested {
        stream: StreamRef,
        topic: Option<String>,
    },
    UnbridgeRequested,
    ThreadsRequested(bool),
    StatusRequested,
}

#[derive(Debug, Default, Clone)]
pub struct DiscordCommandHandler;

impl DiscordCommandHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn is_command(content: &str) -> bool {
        let trimmed = content.trim_start();
        trimmed
            .strip_prefix(COMMAND_PREFIX)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
    }

    /// Parses a `!zulip` command sent by a member with or without MANAGE_CHANNELS.
    pub fn parse(&self, content: &str, can_manage_channels: bool) -> DiscordCommandOutcome {
        if !Self::is_command(content) {
            return DiscordCommandOutcome::Ignored;
        }
        let rest = content.trim_start()[COMMAND_PREFIX.len()..].trim();
        let (subcommand, args) = match rest.split_once(char::is_whitespace) {
            Some((subcommand, args)) => (subcommand, args.trim()),
            None => (rest, ""),
        };

        if subcommand.is_empty() || subcommand == "help" {
            return DiscordCommandOutcome::Reply(USAGE.to_string());
        }
        if !can_manage_channels {
            return DiscordCommandOutcome::Reply(
                "You need the Manage Channels permission to run bridge commands.".to_string(),
            );
        }

        match subcommand {
            "bridge" => parse_bridge_args(args),
            "unbridge" => DiscordCommandOutcome::UnbridgeRequested,
            "status" => DiscordCommandOutcome::StatusRequested,
            "threads" => match args {
                "on" => DiscordCommandOutcome::ThreadsRequested(true),
                "off" => DiscordCommandOutcome::ThreadsRequested(false),
                _ => DiscordCommandOutcome::Reply("Usage: `!zulip threads on|off`".to_string()),
            },
            other => DiscordCommandOutcome::Reply(format!("Unknown command `{other}`. {USAGE}")),
        }
    }
}

fn parse_bridge_args(args: &str) -> DiscordCommandOutcome {
    let (stream, topic) = if let Some(quoted) = args.strip_prefix('"') {
        match quoted.split_once('"') {
            Some((stream, topic)) => (stream.trim(), topic.trim()),
            None => {
                return DiscordCommandOutcome::Reply("Unterminated quote in stream name.".to_string());
            }
        }
    } else {
        match args.split_once(char::is_whitespace) {
            Some((stream, topic)) => (stream, topic.trim()),
            None => (args, ""),
        }
    };

    if stream.is_empty() {
        return DiscordCommandOutcome::Reply(USAGE.to_string());
    }

    let stream = match stream.parse::<i64>() {
        Ok(id) => StreamRef::Id(id),
        Err(_) => StreamRef::Name(stream.to_string()),
    };
    let topic = (!topic.is_empty()).then(|| topic.to_string());
    DiscordCommandOutcome::BridgeRequested { stream, topic }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::{DiscordCommandHandler, DiscordCommandOutcome, StreamRef};

    fn bridge(stream: StreamRef, topic: Option<&str>) -> DiscordCommandOutcome {
        DiscordCommandOutcome::BridgeRequested {
            stream,
            topic: topic.map(str::to_string),
        }
    }

    #[test_case("!zulip bridge 42", bridge(StreamRef::Id(42), None) ; "stream id")]
    #[test_case("!zulip bridge dev release notes", bridge(StreamRef::Name("dev".into()), Some("release notes")) ; "name and topic")]
    #[test_case("!zulip bridge \"social club\" lunch", bridge(StreamRef::Name("social club".into()), Some("lunch")) ; "quoted name")]
    #[test_case("  !zulip unbridge", DiscordCommandOutcome::UnbridgeRequested ; "unbridge")]
    #[test_case("!zulip threads on", DiscordCommandOutcome::ThreadsRequested(true) ; "threads on")]
    #[test_case("!zulip threads off", DiscordCommandOutcome::ThreadsRequested(false) ; "threads off")]
    #[test_case("!zulip status", DiscordCommandOutcome::StatusRequested ; "status")]
    #[test_case("!zulipper bridge 1", DiscordCommandOutcome::Ignored ; "other prefix")]
    #[test_case("hello", DiscordCommandOutcome::Ignored ; "plain message")]
    fn parses_commands(content: &str, expected: DiscordCommandOutcome) {
        assert_eq!(DiscordCommandHandler::new().parse(content, true), expected);
    }

    #[test]
    fn management_commands_need_permission() {
        let outcome = DiscordCommandHandler::new().parse("!zulip unbridge", false);
        assert!(matches!(outcome, DiscordCommandOutcome::Reply(reply) if reply.contains("Manage Channels")));
    }

    #[test]
    fn help_is_available_to_everyone() {
        let outcome = DiscordCommandHandler::new().parse("!zulip", false);
        assert!(matches!(outcome, DiscordCommandOutcome::Reply(reply) if reply.starts_with("Usage")));
    }

    #[test]
    fn malformed_arguments_get_usage() {
        let handler = DiscordCommandHandler::new();
        assert!(matches!(
            handler.parse("!zulip bridge \"open", true),
            DiscordCommandOutcome::Reply(_)
        ));
        assert!(matches!(
            handler.parse("!zulip threads maybe", true),
            DiscordCommandOutcome::Reply(_)
        ));
        assert!(matches!(
            handler.parse("!zulip frobnicate", true),
            DiscordCommandOutcome::Reply(reply) if reply.contains("frobnicate")
        ));
    }
}

use thiserror::Error;
use url::Url;

use super::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discord.bot_token.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "discord.bot_token cannot be empty".to_string(),
            ));
        }

        if self.zulip.api_key.is_empty() || self.zulip.email.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "zulip.email and zulip.api_key cannot be empty".to_string(),
            ));
        }

        match Url::parse(&self.zulip.realm) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(ConfigError::InvalidConfig(format!(
                    "zulip.realm must be an absolute http(s) url, got {:?}",
                    self.zulip.realm
                )));
            }
        }

        if self.database.connection_string().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "database connection string cannot be empty".to_string(),
            ));
        }

        if self.bridge.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.port must be between 1 and 65535".to_string(),
            ));
        }

        if self.limits.discord_max_message_length < 100 || self.zulip.max_message_length < 100 {
            return Err(ConfigError::InvalidConfig(
                "message length limits must be at least 100 characters".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ConfigError;
    use crate::config::Config;

    const MINIMAL: &str = r#"
bridge:
  port: 9006
discord:
  bot_token: "discord-token"
zulip:
  realm: "https://chat.example.org"
  email: "bridge-bot@chat.example.org"
  api_key: "zulip-key"
  bot_user_id: 42
database:
  filename: "bridge.db"
"#;

    fn parse(raw: &str) -> Config {
        serde_yaml::from_str(raw).expect("config should parse")
    }

    #[test]
    fn minimal_config_validates_with_defaults() {
        let config = parse(MINIMAL);
        config.validate().expect("minimal config is valid");

        assert_eq!(config.zulip.poll_delay_ms, 1000);
        assert_eq!(config.zulip.max_message_length, 10_000);
        assert_eq!(config.limits.discord_max_message_length, 2000);
        assert_eq!(config.discord.webhook_name, "Zulip Bridge Webhook");
        assert!(!config.bridge.upload_files_to_zulip);
        assert_eq!(config.database.connection_string(), "sqlite://bridge.db");
    }

    #[test]
    fn empty_discord_token_is_rejected() {
        let mut config = parse(MINIMAL);
        config.discord.bot_token.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("bot_token")
        ));
    }

    #[test]
    fn relative_realm_is_rejected() {
        let mut config = parse(MINIMAL);
        config.zulip.realm = "chat.example.org".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("zulip.realm")
        ));
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = parse(MINIMAL);
        config.bridge.port = 0;
        assert!(config.validate().is_err());
    }
}

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    pub discord: DiscordConfig,
    pub zulip: ZulipConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub ignored_discord_users: Vec<String>,
    #[serde(default)]
    pub ignored_zulip_users: Vec<u64>,
    #[serde(default)]
    pub mentionable_discord_roles: Vec<String>,
    #[serde(default)]
    pub mentionable_zulip_groups: Vec<String>,
    /// Keys are the Zulip spelling, values the Discord spelling.
    #[serde(default)]
    pub text_replacements: BTreeMap<String, String>,
    #[serde(default)]
    pub upload_files_to_zulip: bool,
    #[serde(default)]
    pub discord_username_prefix: String,
    #[serde(default)]
    pub discord_username_suffix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            admin_token: None,
            ignored_discord_users: Vec::new(),
            ignored_zulip_users: Vec::new(),
            mentionable_discord_roles: Vec::new(),
            mentionable_zulip_groups: Vec::new(),
            text_replacements: BTreeMap::new(),
            upload_files_to_zulip: false,
            discord_username_prefix: String::new(),
            discord_username_suffix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscordConfig {
    pub bot_token: String,
    #[serde(default)]
    pub application_id: Option<String>,
    #[serde(default = "default_webhook_name")]
    pub webhook_name: String,
    #[serde(default = "default_login_retries")]
    pub login_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZulipConfig {
    pub realm: String,
    pub email: String,
    pub api_key: String,
    pub bot_user_id: u64,
    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,
    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_zulip_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "default_max_file_upload_size_mib")]
    pub max_file_upload_size_mib: u64,
}

impl ZulipConfig {
    /// Realm base url without a trailing slash.
    pub fn realm(&self) -> &str {
        self.realm.trim_end_matches('/')
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub conn_string: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        let url = self.connection_string();
        if url.starts_with("sqlite://") {
            DbType::Sqlite
        } else {
            DbType::Postgres
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref conn) = self.conn_string {
            conn.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        if let DbType::Sqlite = self.db_type() {
            let url = self.connection_string();
            Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
        } else {
            None
        }
    }

    pub fn max_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.max_connections,
            DbType::Sqlite => Some(1),
        }
    }

    pub fn min_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.min_connections,
            DbType::Sqlite => Some(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_discord_max_message_length")]
    pub discord_max_message_length: usize,
    #[serde(default = "default_max_linkifiers")]
    pub max_linkifiers: usize,
    #[serde(default = "default_max_linkifier_pattern_length")]
    pub max_linkifier_pattern_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            discord_max_message_length: default_discord_max_message_length(),
            max_linkifiers: default_max_linkifiers(),
            max_linkifier_pattern_length: default_max_linkifier_pattern_length(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let config_path = path
            .map(ToOwned::to_owned)
            .or_else(|| std::env::var("CONFIG_PATH").ok())
            .unwrap_or_else(|| "config.yaml".to_string());

        Self::load_from_file(&config_path)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("BRIDGE_DISCORD_BOT_TOKEN") {
            self.discord.bot_token = value;
        }
        if let Ok(value) = std::env::var("BRIDGE_ZULIP_API_KEY") {
            self.zulip.api_key = value;
        }
        if let Ok(value) = std::env::var("BRIDGE_ZULIP_EMAIL") {
            self.zulip.email = value;
        }
        if let Ok(value) = std::env::var("BRIDGE_ZULIP_REALM") {
            self.zulip.realm = value;
        }
    }
}

fn default_port() -> u16 {
    9006
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_webhook_name() -> String {
    "Zulip Bridge Webhook".to_string()
}

fn default_login_retries() -> u32 {
    3
}

fn default_poll_delay_ms() -> u64 {
    1000
}

fn default_startup_retries() -> u32 {
    5
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_zulip_max_message_length() -> usize {
    10_000
}

fn default_max_file_upload_size_mib() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_discord_max_message_length() -> usize {
    2000
}

fn default_max_linkifiers() -> usize {
    256
}

fn default_max_linkifier_pattern_length() -> usize {
    1000
}

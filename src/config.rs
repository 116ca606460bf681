pub use self::parser::{
    BridgeConfig, Config, DatabaseConfig, DbType, DiscordConfig, LimitsConfig, LoggingConfig,
    ZulipConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "discord-zulip-bridge", version, about = "Relays messages between Discord and Zulip")]
pub struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "CONFIG_PATH")]
    pub config: Option<String>,

    /// Force debug-level logging.
    #[arg(long)]
    pub debug: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

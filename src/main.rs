#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{error, info, warn};

mod bridge;
mod cli;
mod config;
mod db;
mod discord;
mod error;
mod media;
mod parsers;
mod utils;
mod web;
mod zulip;

use bridge::{BridgeCore, BridgeParts};
use config::Config;
use discord::DiscordClient;
use media::UploadMirror;
use parsers::{AttachmentMirror, LinkifierLimits, LinkifierStore};
use web::WebServer;
use zulip::{
    EventQueueClient, SubscriptionHandle, ZulipClient, ZulipEventProcessor,
    bridge_register_request,
};

const INITIAL_STARTUP_RETRY_SECONDS: u64 = 2;
const MAX_STARTUP_RETRY_SECONDS: u64 = 300;

async fn register_with_retry(
    queue: &EventQueueClient,
    processor: Arc<ZulipEventProcessor>,
    attempts: u32,
) -> Result<SubscriptionHandle> {
    let mut retry_seconds = INITIAL_STARTUP_RETRY_SECONDS;
    let mut attempt = 1;

    loop {
        match queue
            .register(bridge_register_request(), processor.clone())
            .await
        {
            Ok(handle) => return Ok(handle),
            Err(err) if attempt >= attempts => {
                return Err(anyhow!(
                    "zulip event queue registration failed after {attempt} attempts: {err}"
                ));
            }
            Err(err) => {
                error!(
                    "failed to register zulip event queue: {err}. retrying in {} seconds",
                    retry_seconds
                );
                tokio::time::sleep(Duration::from_secs(retry_seconds)).await;
                retry_seconds = (retry_seconds * 2).min(MAX_STARTUP_RETRY_SECONDS);
                attempt += 1;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse_args();
    let config = Config::load(args.config.as_deref())?;
    utils::logging::init_tracing(&config.logging, args.debug);
    info!("discord-zulip bridge starting up");

    let db_manager = db::DatabaseManager::new(&config.database).await?;
    db_manager.migrate().await?;

    let linkifiers = Arc::new(LinkifierStore::new(LinkifierLimits::from(&config.limits)));
    let zulip_client = Arc::new(ZulipClient::new(&config.zulip)?);
    let mirror: Option<Arc<dyn AttachmentMirror>> = if config.bridge.upload_files_to_zulip {
        Some(Arc::new(UploadMirror::new(
            zulip_client.clone(),
            db_manager.clone(),
            config.zulip.max_file_upload_size_mib * 1024 * 1024,
        )))
    } else {
        None
    };
    let discord_client = Arc::new(DiscordClient::new(&config));

    let bridge = Arc::new(BridgeCore::new(
        &config,
        BridgeParts {
            db: db_manager.clone(),
            zulip: zulip_client.clone(),
            zulip_directory: zulip_client.clone(),
            discord: discord_client.clone(),
            discord_directory: discord_client.clone(),
            mirror,
            linkifiers: linkifiers.clone(),
        },
    ));

    discord_client.set_bridge(bridge.clone()).await;
    discord_client.start().await?;

    let web_server = Arc::new(WebServer::new(&config, db_manager.clone())?);
    let web_task = {
        let web_server = web_server.clone();
        tokio::spawn(async move {
            if let Err(e) = web_server.start().await {
                error!("web server error: {}", e);
            }
        })
    };

    let processor = Arc::new(ZulipEventProcessor::new(
        bridge.clone(),
        zulip_client.bot_user_id(),
        config
            .bridge
            .ignored_zulip_users
            .iter()
            .map(|id| *id as i64),
    ));
    let queue = EventQueueClient::new(
        zulip_client.clone(),
        Duration::from_millis(config.zulip.poll_delay_ms),
    );
    let subscription =
        match register_with_retry(&queue, processor, config.zulip.startup_retries).await {
            Ok(subscription) => subscription,
            Err(err) => {
                discord_client.stop().await?;
                return Err(err);
            }
        };
    web_server.attach_subscription(subscription.clone());

    if linkifiers.snapshot().is_empty() {
        match zulip_client.get_linkifiers().await {
            Ok(sources) => {
                linkifiers.replace(&sources);
            }
            Err(e) => warn!("failed to fetch zulip linkifiers: {}", e),
        }
    }

    info!("bridge is running");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("failed to listen for shutdown signal: {}", e);
            }
        }
        _ = web_task => {
            warn!("web server stopped");
        }
    }

    info!("discord-zulip bridge shutting down");
    if let Err(e) = queue.unsubscribe(&subscription).await {
        warn!("failed to delete zulip event queue: {}", e);
    }
    queue.shutdown().await;
    discord_client.stop().await?;
    Ok(())
}

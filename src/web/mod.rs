use std::time::Instant;

use anyhow::{Result, anyhow};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use salvo::prelude::*;
use tracing::info;

use crate::config::Config;
use crate::db::DatabaseManager;
use crate::zulip::SubscriptionHandle;

pub mod handlers;
pub mod metrics;
pub mod middleware;

use self::middleware::auth::create_router;

pub struct WebState {
    pub db_manager: DatabaseManager,
    pub admin_token: Option<String>,
    pub subscription: RwLock<Option<SubscriptionHandle>>,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

pub struct WebServer {
    bind_addr: String,
}

impl WebServer {
    pub fn new(config: &Config, db_manager: DatabaseManager) -> Result<Self> {
        WEB_STATE
            .set(WebState {
                db_manager,
                admin_token: config.bridge.admin_token.clone(),
                subscription: RwLock::new(None),
                started_at: Instant::now(),
            })
            .map_err(|_| anyhow!("web server state is already initialized"))?;

        Ok(Self {
            bind_addr: format!("{}:{}", config.bridge.bind_address, config.bridge.port),
        })
    }

    /// Exposes the live event queue status on `/status` and `/metrics`.
    pub fn attach_subscription(&self, handle: SubscriptionHandle) {
        *web_state().subscription.write() = Some(handle);
    }

    pub async fn start(&self) -> Result<()> {
        info!("Starting web server on {}", self.bind_addr);

        let acceptor = TcpListener::new(self.bind_addr.clone()).bind().await;
        Server::new(acceptor).serve(create_router()).await;

        Ok(())
    }
}

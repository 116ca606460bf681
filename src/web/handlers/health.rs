use salvo::prelude::*;
use serde_json::{Value, json};

use crate::web::web_state;
use crate::zulip::SubscriptionStatus;

#[handler]
pub async fn health_check(res: &mut Response) {
    res.render(Json(json!({ "status": "ok" })));
}

#[handler]
pub async fn get_status(res: &mut Response) {
    let state = web_state();
    let subscription = state
        .subscription
        .read()
        .as_ref()
        .map(|handle| handle.status());

    match state.db_manager.channel_store().count_bindings().await {
        Ok(bindings) => res.render(Json(status_payload(
            state.started_at.elapsed().as_secs(),
            subscription.as_ref(),
            bindings,
        ))),
        Err(err) => {
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
            res.render(Json(json!({ "error": format!("database error: {}", err) })));
        }
    }
}

pub(crate) fn status_payload(
    uptime_seconds: u64,
    subscription: Option<&SubscriptionStatus>,
    bindings: i64,
) -> Value {
    let zulip = match subscription {
        Some(status) => json!({
            "state": status.state,
            "queue_id": status.queue_id,
            "last_event_id": status.last_event_id,
            "events_received": status.events_received,
        }),
        None => json!({ "state": "unregistered" }),
    };

    json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime_seconds,
        "bindings": bindings,
        "zulip": zulip,
    })
}

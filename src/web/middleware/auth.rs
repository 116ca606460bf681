use salvo::prelude::*;
use serde_json::json;

use crate::web::handlers::{
    health::{get_status, health_check},
    metrics::metrics,
    provisioning::{create_binding, delete_binding, list_bindings},
};
use crate::web::web_state;

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

/// Whether an `Authorization` header grants access to the admin API.
pub(crate) fn is_authorized(expected: Option<&str>, header: Option<&str>) -> bool {
    match (expected, header.and_then(bearer_token)) {
        (Some(expected), Some(token)) => !expected.is_empty() && expected == token,
        _ => false,
    }
}

#[handler]
pub async fn require_admin(req: &mut Request, res: &mut Response, ctrl: &mut FlowCtrl) {
    let header = req.header::<String>("authorization");
    if !is_authorized(web_state().admin_token.as_deref(), header.as_deref()) {
        res.status_code(StatusCode::UNAUTHORIZED);
        res.render(Json(json!({ "error": "missing or invalid admin token" })));
        ctrl.skip_rest();
    }
}

pub fn create_router() -> Router {
    Router::new()
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("metrics").get(metrics))
        .push(Router::with_path("status").get(get_status))
        .push(
            Router::with_path("admin")
                .hoop(require_admin)
                .push(
                    Router::with_path("bindings")
                        .get(list_bindings)
                        .post(create_binding),
                )
                .push(Router::with_path("bindings/{discord_channel_id}").delete(delete_binding)),
        )
}

use salvo::prelude::*;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::db::ChannelBinding;
use crate::web::web_state;

fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}

#[derive(Debug, Deserialize)]
pub struct CreateBindingRequest {
    pub discord_channel_id: String,
    pub zulip_stream_id: i64,
    #[serde(default)]
    pub zulip_topic: Option<String>,
    #[serde(default)]
    pub include_threads: bool,
}

impl CreateBindingRequest {
    pub(crate) fn into_binding(self) -> Result<ChannelBinding, &'static str> {
        let channel = self.discord_channel_id.trim();
        if channel.is_empty() || !channel.bytes().all(|b| b.is_ascii_digit()) {
            return Err("discord_channel_id must be a numeric snowflake");
        }
        if self.zulip_stream_id <= 0 {
            return Err("zulip_stream_id must be positive");
        }
        let topic = self
            .zulip_topic
            .map(|topic| topic.trim().to_string())
            .filter(|topic| !topic.is_empty());

        let mut binding = ChannelBinding::new(channel, self.zulip_stream_id, topic);
        binding.include_threads = self.include_threads;
        Ok(binding)
    }
}

#[handler]
pub async fn list_bindings(req: &mut Request, res: &mut Response) {
    let limit = req.query::<i64>("limit").unwrap_or(100).clamp(1, 1000);
    let offset = req.query::<i64>("offset").unwrap_or(0).max(0);

    match web_state()
        .db_manager
        .channel_store()
        .list_bindings(limit, offset)
        .await
    {
        Ok(bindings) => {
            res.render(Json(json!({
                "bindings": bindings,
                "count": bindings.len(),
                "limit": limit,
                "offset": offset,
            })));
        }
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("database error: {}", err),
            );
        }
    }
}

#[handler]
pub async fn create_binding(req: &mut Request, res: &mut Response) {
    let request = match req.parse_json::<CreateBindingRequest>().await {
        Ok(request) => request,
        Err(err) => {
            render_error(
                res,
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {}", err),
            );
            return;
        }
    };
    let binding = match request.into_binding() {
        Ok(binding) => binding,
        Err(message) => {
            render_error(res, StatusCode::BAD_REQUEST, message);
            return;
        }
    };

    let store = web_state().db_manager.channel_store();

    match store
        .get_binding_by_discord_channel(&binding.discord_channel_id)
        .await
    {
        Ok(Some(_)) => {
            render_error(res, StatusCode::CONFLICT, "discord channel is already bridged");
            return;
        }
        Ok(None) => {}
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("database error: {}", err),
            );
            return;
        }
    }

    match store
        .get_binding_by_stream_topic(binding.zulip_stream_id, binding.zulip_topic.as_deref())
        .await
    {
        Ok(Some(_)) => {
            render_error(
                res,
                StatusCode::CONFLICT,
                "zulip stream and topic are already bridged",
            );
            return;
        }
        Ok(None) => {}
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("database error: {}", err),
            );
            return;
        }
    }

    match store.create_binding(&binding).await {
        Ok(()) => {
            info!(
                discord_channel_id = %binding.discord_channel_id,
                zulip_stream_id = binding.zulip_stream_id,
                "created channel binding through admin api"
            );
            res.status_code(StatusCode::CREATED);
            res.render(Json(json!({
                "ok": true,
                "binding": binding,
            })));
        }
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("database error: {}", err),
            );
        }
    }
}

#[handler]
pub async fn delete_binding(req: &mut Request, res: &mut Response) {
    let channel_id = match req.param::<String>("discord_channel_id") {
        Some(v) if !v.is_empty() => v,
        _ => {
            render_error(res, StatusCode::BAD_REQUEST, "invalid discord channel id");
            return;
        }
    };

    match web_state()
        .db_manager
        .channel_store()
        .delete_binding_by_discord_channel(&channel_id)
        .await
    {
        Ok(Some(binding)) => {
            info!(discord_channel_id = %channel_id, "deleted channel binding through admin api");
            res.render(Json(json!({ "ok": true, "binding": binding })));
        }
        Ok(None) => {
            render_error(res, StatusCode::NOT_FOUND, "binding not found");
        }
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("database error: {}", err),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CreateBindingRequest;

    fn request(channel: &str, stream: i64, topic: Option<&str>) -> CreateBindingRequest {
        CreateBindingRequest {
            discord_channel_id: channel.to_string(),
            zulip_stream_id: stream,
            zulip_topic: topic.map(str::to_string),
            include_threads: true,
        }
    }

    #[test]
    fn valid_requests_become_bindings() {
        let binding = request("1234", 7, Some(" general "))
            .into_binding()
            .expect("valid");

        assert_eq!(binding.discord_channel_id, "1234");
        assert_eq!(binding.zulip_topic.as_deref(), Some("general"));
        assert!(binding.include_threads);
    }

    #[test]
    fn blank_topic_means_stream_wide() {
        let binding = request("1234", 7, Some("  ")).into_binding().expect("valid");
        assert_eq!(binding.zulip_topic, None);
    }

    #[test]
    fn invalid_ids_are_rejected() {
        assert!(request("general", 7, None).into_binding().is_err());
        assert!(request("1234", 0, None).into_binding().is_err());
    }
}

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::ZulipConfig;

pub mod event_handler;
pub mod event_queue;

pub use self::event_handler::{
    BRIDGE_EVENT_TYPES, EventRoute, MessageEdit, ZulipEventHandler, ZulipEventProcessor,
    bridge_register_request,
};
pub use self::event_queue::{
    EventDispatcher, EventFeed, EventQueueClient, SubscriptionHandle, SubscriptionState,
    SubscriptionStatus,
};

pub const BAD_EVENT_QUEUE_ID: &str = "BAD_EVENT_QUEUE_ID";
pub const RATE_LIMIT_HIT: &str = "RATE_LIMIT_HIT";
pub const STREAM_DOES_NOT_EXIST: &str = "STREAM_DOES_NOT_EXIST";
const BAD_REQUEST: &str = "BAD_REQUEST";
pub const DEFAULT_LONGPOLL_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, Error)]
pub enum ZulipError {
    #[error("zulip request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("zulip api error {code}: {msg}")]
    Api { code: String, msg: String },
    #[error("zulip resource not found: {0}")]
    NotFound(String),
    #[error("zulip server error {status}: {msg}")]
    Server { status: u16, msg: String },
    #[error("failed to decode zulip response: {0}")]
    Decode(String),
}

impl ZulipError {
    pub fn code(&self) -> Option<&str> {
        match self {
            ZulipError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_bad_event_queue(&self) -> bool {
        self.code() == Some(BAD_EVENT_QUEUE_ID)
    }

    /// Whether Zulip answered that the stream or message does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ZulipError::NotFound(_) => true,
            ZulipError::Api { code, .. } if code == STREAM_DOES_NOT_EXIST => true,
            ZulipError::Api { code, msg } if code == BAD_REQUEST => {
                let msg = msg.to_ascii_lowercase();
                ["invalid stream", "invalid channel", "invalid message"]
                    .iter()
                    .any(|prefix| msg.starts_with(prefix))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    pub notification_settings_null: bool,
    pub bulk_message_deletion: bool,
    pub linkifier_url_template: bool,
}

/// Parameters of `POST /register`. Kept verbatim so a lost queue can be
/// re-registered with exactly the same options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterRequest {
    pub event_types: Vec<String>,
    pub fetch_event_types: Vec<String>,
    pub apply_markdown: bool,
    pub client_capabilities: ClientCapabilities,
}

impl RegisterRequest {
    pub fn new<I, S>(event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_types: event_types.into_iter().map(Into::into).collect(),
            client_capabilities: ClientCapabilities {
                notification_settings_null: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn form_params(&self) -> Result<Vec<(&'static str, String)>, ZulipError> {
        let mut params = vec![
            ("event_types", json_param(&self.event_types)?),
            ("apply_markdown", self.apply_markdown.to_string()),
            ("client_capabilities", json_param(&self.client_capabilities)?),
        ];
        if !self.fetch_event_types.is_empty() {
            params.push(("fetch_event_types", json_param(&self.fetch_event_types)?));
        }
        Ok(params)
    }
}

// Zulip expects list and object form parameters as JSON strings.
fn json_param<T: Serialize>(value: &T) -> Result<String, ZulipError> {
    serde_json::to_string(value).map_err(|e| ZulipError::Decode(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkifierSource {
    #[serde(default)]
    pub id: Option<i64>,
    pub pattern: String,
    pub url_template: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub queue_id: String,
    pub last_event_id: i64,
    #[serde(default)]
    pub event_queue_longpoll_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub realm_linkifiers: Option<Vec<LinkifierSource>>,
}

impl RegisterResponse {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(
            self.event_queue_longpoll_timeout_seconds
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_LONGPOLL_TIMEOUT_SECS),
        )
    }
}

/// One entry of `GET /events`; type-specific fields stay in `payload`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ZulipEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

impl ZulipEvent {
    pub fn op(&self) -> Option<&str> {
        self.payload.get("op").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ZulipMessage {
    pub id: i64,
    pub sender_id: i64,
    pub sender_full_name: String,
    #[serde(default)]
    pub sender_email: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub content: String,
    #[serde(default)]
    pub is_me_message: bool,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub stream_id: Option<i64>,
    #[serde(default)]
    pub subject: String,
}

impl ZulipMessage {
    pub fn is_stream_message(&self) -> bool {
        self.kind == "stream" && self.stream_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ZulipStream {
    pub stream_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadedFile {
    #[serde(alias = "uri")]
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message: ZulipMessage,
}

#[derive(Debug, Deserialize)]
struct StreamIdResponse {
    stream_id: i64,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    stream: ZulipStream,
}

#[derive(Debug, Deserialize)]
struct LinkifiersResponse {
    linkifiers: Vec<LinkifierSource>,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    events: Vec<ZulipEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Empty {}

/// Authenticated client for the Zulip REST API (`<realm>/api/v1`).
#[derive(Clone)]
pub struct ZulipClient {
    http: reqwest::Client,
    api_base: String,
    email: String,
    api_key: SecretString,
    bot_user_id: i64,
}

impl ZulipClient {
    pub fn new(config: &ZulipConfig) -> Result<Self, ZulipError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;
        Ok(Self {
            http,
            api_base: format!("{}/api/v1", config.realm()),
            email: config.email.clone(),
            api_key: SecretString::from(config.api_key.clone()),
            bot_user_id: config.bot_user_id as i64,
        })
    }

    pub fn bot_user_id(&self) -> i64 {
        self.bot_user_id
    }

    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.api_base, endpoint.trim_start_matches('/')))
            .basic_auth(&self.email, Some(self.api_key.expose_secret()))
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ZulipError> {
        let response = builder.send().await?;
        let status = response.status();
        let body: Value = response.json().await?;

        if body.get("result").and_then(Value::as_str) == Some("success") {
            return serde_json::from_value(body).map_err(|e| ZulipError::Decode(e.to_string()));
        }

        let error: ErrorBody = serde_json::from_value(body).unwrap_or_default();
        debug!(%status, code = ?error.code, "zulip api returned an error");
        let msg = error.msg.unwrap_or_else(|| status.to_string());
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ZulipError::NotFound(msg));
        }
        if status.is_server_error() {
            return Err(ZulipError::Server {
                status: status.as_u16(),
                msg,
            });
        }
        Err(ZulipError::Api {
            code: error.code.unwrap_or_else(|| BAD_REQUEST.to_string()),
            msg,
        })
    }

    pub async fn send_message(
        &self,
        stream_id: i64,
        topic: &str,
        content: &str,
    ) -> Result<i64, ZulipError> {
        let params = [
            ("type", "stream".to_string()),
            ("to", stream_id.to_string()),
            ("topic", topic.to_string()),
            ("content", content.to_string()),
        ];
        let response: SendMessageResponse = self
            .execute(self.request(reqwest::Method::POST, "messages").form(&params))
            .await?;
        Ok(response.id)
    }

    pub async fn edit_message(&self, message_id: i64, content: &str) -> Result<(), ZulipError> {
        let _: Empty = self
            .execute(
                self.request(reqwest::Method::PATCH, &format!("messages/{message_id}"))
                    .form(&[("content", content)]),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, message_id: i64) -> Result<(), ZulipError> {
        let _: Empty = self
            .execute(self.request(reqwest::Method::DELETE, &format!("messages/{message_id}")))
            .await?;
        Ok(())
    }

    /// Fetches a message with its raw markdown source.
    pub async fn get_message(&self, message_id: i64) -> Result<ZulipMessage, ZulipError> {
        let response: MessageResponse = self
            .execute(
                self.request(reqwest::Method::GET, &format!("messages/{message_id}"))
                    .query(&[("apply_markdown", "false")]),
            )
            .await?;
        Ok(response.message)
    }

    pub async fn upload_file(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<UploadedFile, ZulipError> {
        let mut part = Part::bytes(bytes).file_name(filename.to_string());
        if let Some(content_type) = content_type {
            part = part.mime_str(content_type)?;
        }
        let form = Form::new().part("file", part);
        self.execute(self.request(reqwest::Method::POST, "user_uploads").multipart(form))
            .await
    }

    pub async fn get_stream_id(&self, stream: &str) -> Result<i64, ZulipError> {
        let response: StreamIdResponse = self
            .execute(
                self.request(reqwest::Method::GET, "get_stream_id")
                    .query(&[("stream", stream)]),
            )
            .await?;
        Ok(response.stream_id)
    }

    pub async fn get_stream(&self, stream_id: i64) -> Result<ZulipStream, ZulipError> {
        let response: StreamResponse = self
            .execute(self.request(reqwest::Method::GET, &format!("streams/{stream_id}")))
            .await?;
        Ok(response.stream)
    }

    pub async fn get_linkifiers(&self) -> Result<Vec<LinkifierSource>, ZulipError> {
        let response: LinkifiersResponse = self
            .execute(self.request(reqwest::Method::GET, "realm/linkifiers"))
            .await?;
        Ok(response.linkifiers)
    }

    pub async fn register_queue(
        &self,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse, ZulipError> {
        let params = request.form_params()?;
        self.execute(self.request(reqwest::Method::POST, "register").form(&params))
            .await
    }

    /// Long-polls the queue; `timeout` replaces the client-wide request timeout.
    pub async fn get_events(
        &self,
        queue_id: &str,
        last_event_id: i64,
        timeout: Duration,
    ) -> Result<Vec<ZulipEvent>, ZulipError> {
        let response: EventsResponse = self
            .execute(
                self.request(reqwest::Method::GET, "events")
                    .query(&[
                        ("queue_id", queue_id.to_string()),
                        ("last_event_id", last_event_id.to_string()),
                        ("dont_block", "false".to_string()),
                    ])
                    .timeout(timeout),
            )
            .await?;
        Ok(response.events)
    }

    pub async fn delete_queue(&self, queue_id: &str) -> Result<(), ZulipError> {
        let _: Empty = self
            .execute(
                self.request(reqwest::Method::DELETE, "events")
                    .query(&[("queue_id", queue_id)]),
            )
            .await?;
        Ok(())
    }
}

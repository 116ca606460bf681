use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{
    ClientCapabilities, EventDispatcher, LinkifierSource, RegisterRequest, RegisterResponse,
    ZulipEvent, ZulipMessage,
};

/// Event types the bridge subscribes to.
pub const BRIDGE_EVENT_TYPES: [&str; 6] = [
    "message",
    "update_message",
    "delete_message",
    "realm_linkifiers",
    "attachment",
    "stream",
];

/// Queue registration used by the bridge: raw markdown, with the linkifier set fetched up front.
pub fn bridge_register_request() -> RegisterRequest {
    RegisterRequest {
        fetch_event_types: vec!["realm_linkifiers".to_string()],
        apply_markdown: false,
        client_capabilities: ClientCapabilities {
            notification_settings_null: true,
            bulk_message_deletion: true,
            linkifier_url_template: true,
        },
        ..RegisterRequest::new(BRIDGE_EVENT_TYPES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEdit {
    pub message_id: i64,
    pub editor_id: Option<i64>,
    pub content: String,
}

/// What to do with one event, keyed by `(type, op)`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    Relay(Box<ZulipMessage>),
    Edit(MessageEdit),
    Delete(Vec<i64>),
    ReplaceLinkifiers(Vec<LinkifierSource>),
    AttachmentStored { file_id: i64, url: String },
    AttachmentRemoved { file_id: i64 },
    StreamsDeleted(Vec<i64>),
    Heartbeat,
    Ignored { kind: String, op: Option<String> },
    Malformed { kind: String, reason: String },
}

#[derive(Deserialize)]
struct MessagePayload {
    message: ZulipMessage,
}

#[derive(Deserialize)]
struct UpdateMessagePayload {
    message_id: i64,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    rendering_only: bool,
}

#[derive(Deserialize)]
struct DeleteMessagePayload {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    message_ids: Vec<i64>,
}

#[derive(Deserialize)]
struct LinkifiersPayload {
    realm_linkifiers: Vec<LinkifierSource>,
}

#[derive(Deserialize)]
struct AttachmentInfo {
    id: i64,
    #[serde(default)]
    path_id: Option<String>,
}

#[derive(Deserialize)]
struct AttachmentPayload {
    attachment: AttachmentInfo,
}

#[derive(Deserialize)]
struct StreamRef {
    stream_id: i64,
}

#[derive(Deserialize)]
struct StreamPayload {
    streams: Vec<StreamRef>,
}

fn payload<T: DeserializeOwned>(event: &ZulipEvent) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::Object(event.payload.clone()))
        .map_err(|e| e.to_string())
}

pub fn route(event: &ZulipEvent) -> EventRoute {
    let kind = event.kind.as_str();
    let decoded = match (kind, event.op()) {
        ("message", _) => payload::<MessagePayload>(event).map(|p| EventRoute::Relay(Box::new(p.message))),
        ("update_message", _) => payload::<UpdateMessagePayload>(event).map(|p| match p.content {
            Some(content) if !p.rendering_only => EventRoute::Edit(MessageEdit {
                message_id: p.message_id,
                editor_id: p.user_id,
                content,
            }),
            _ => EventRoute::Ignored {
                kind: kind.to_string(),
                op: None,
            },
        }),
        ("delete_message", _) => payload::<DeleteMessagePayload>(event).map(|p| {
            let mut ids = p.message_ids;
            if let Some(id) = p.message_id {
                ids.push(id);
            }
            EventRoute::Delete(ids)
        }),
        ("realm_linkifiers", _) => {
            payload::<LinkifiersPayload>(event).map(|p| EventRoute::ReplaceLinkifiers(p.realm_linkifiers))
        }
        ("attachment", Some("add" | "update")) => payload::<AttachmentPayload>(event).and_then(|p| {
            let path_id = p
                .attachment
                .path_id
                .ok_or_else(|| "attachment without path_id".to_string())?;
            Ok(EventRoute::AttachmentStored {
                file_id: p.attachment.id,
                url: format!("/user_uploads/{path_id}"),
            })
        }),
        ("attachment", Some("remove")) => payload::<AttachmentPayload>(event).map(|p| {
            EventRoute::AttachmentRemoved {
                file_id: p.attachment.id,
            }
        }),
        ("stream", Some("delete")) => payload::<StreamPayload>(event)
            .map(|p| EventRoute::StreamsDeleted(p.streams.into_iter().map(|s| s.stream_id).collect())),
        ("heartbeat", _) => Ok(EventRoute::Heartbeat),
        (_, op) => Ok(EventRoute::Ignored {
            kind: kind.to_string(),
            op: op.map(ToOwned::to_owned),
        }),
    };

    decoded.unwrap_or_else(|reason| EventRoute::Malformed {
        kind: kind.to_string(),
        reason,
    })
}

#[async_trait]
pub trait ZulipEventHandler: Send + Sync {
    async fn handle_message(&self, message: &ZulipMessage) -> Result<()>;
    async fn handle_message_edit(&self, edit: &MessageEdit) -> Result<()>;
    async fn handle_message_delete(&self, message_ids: &[i64]) -> Result<()>;
    async fn handle_linkifiers(&self, linkifiers: Vec<LinkifierSource>) -> Result<()>;
    async fn handle_attachment_stored(&self, file_id: i64, url: &str) -> Result<()>;
    async fn handle_attachment_removed(&self, file_id: i64) -> Result<()>;
    async fn handle_streams_deleted(&self, stream_ids: &[i64]) -> Result<()>;
}

/// Routes queue events to a handler, dropping the bridge's own traffic.
pub struct ZulipEventProcessor {
    event_handler: Arc<dyn ZulipEventHandler>,
    bot_user_id: i64,
    ignored_users: HashSet<i64>,
}

impl ZulipEventProcessor {
    pub fn new(
        event_handler: Arc<dyn ZulipEventHandler>,
        bot_user_id: i64,
        ignored_users: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            event_handler,
            bot_user_id,
            ignored_users: ignored_users.into_iter().collect(),
        }
    }

    fn is_ignored_sender(&self, user_id: i64) -> bool {
        user_id == self.bot_user_id || self.ignored_users.contains(&user_id)
    }

    pub async fn process_event(&self, event: &ZulipEvent) -> Result<()> {
        match route(event) {
            EventRoute::Relay(message) => {
                if self.is_ignored_sender(message.sender_id) {
                    debug!(message_id = message.id, sender_id = message.sender_id, "skipping zulip message from ignored sender");
                    return Ok(());
                }
                if !message.is_stream_message() {
                    return Ok(());
                }
                self.event_handler.handle_message(&message).await?;
            }
            EventRoute::Edit(edit) => {
                if edit.editor_id.is_some_and(|id| self.is_ignored_sender(id)) {
                    return Ok(());
                }
                self.event_handler.handle_message_edit(&edit).await?;
            }
            EventRoute::Delete(ids) => self.event_handler.handle_message_delete(&ids).await?,
            EventRoute::ReplaceLinkifiers(linkifiers) => {
                self.event_handler.handle_linkifiers(linkifiers).await?
            }
            EventRoute::AttachmentStored { file_id, url } => {
                self.event_handler
                    .handle_attachment_stored(file_id, &url)
                    .await?
            }
            EventRoute::AttachmentRemoved { file_id } => {
                self.event_handler.handle_attachment_removed(file_id).await?
            }
            EventRoute::StreamsDeleted(ids) => {
                self.event_handler.handle_streams_deleted(&ids).await?
            }
            EventRoute::Heartbeat => {}
            EventRoute::Ignored { kind, op } => {
                debug!(event_id = event.id, %kind, ?op, "ignoring zulip event");
            }
            EventRoute::Malformed { kind, reason } => {
                warn!(event_id = event.id, %kind, %reason, "malformed zulip event");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventDispatcher for ZulipEventProcessor {
    async fn dispatch(&self, event: ZulipEvent) {
        if let Err(e) = self.process_event(&event).await {
            warn!(event_id = event.id, kind = %event.kind, error = %e, "failed to handle zulip event");
        }
    }

    async fn on_registered(&self, response: &RegisterResponse) {
        let Some(linkifiers) = response.realm_linkifiers.clone() else {
            return;
        };
        if let Err(e) = self.event_handler.handle_linkifiers(linkifiers).await {
            warn!(error = %e, "failed to install linkifiers from registration");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use test_case::test_case;

    use super::{
        EventRoute, MessageEdit, ZulipEventHandler, ZulipEventProcessor, bridge_register_request,
        route,
    };
    use crate::zulip::{EventDispatcher, LinkifierSource, ZulipEvent, ZulipMessage};

    fn event(value: serde_json::Value) -> ZulipEvent {
        serde_json::from_value(value).expect("valid event")
    }

    #[test]
    fn bridge_registration_asks_for_raw_markdown() {
        let request = bridge_register_request();

        assert!(!request.apply_markdown);
        assert!(request.event_types.iter().any(|kind| kind == "attachment"));
        assert_eq!(request.fetch_event_types, vec!["realm_linkifiers".to_string()]);
        assert!(request.client_capabilities.bulk_message_deletion);
        assert!(request.client_capabilities.linkifier_url_template);
    }

    #[test]
    fn routes_bulk_and_single_deletes() {
        let bulk = event(json!({"id": 3, "type": "delete_message", "message_ids": [10, 11], "message_type": "stream"}));
        let single = event(json!({"id": 4, "type": "delete_message", "message_id": 12}));

        assert_eq!(route(&bulk), EventRoute::Delete(vec![10, 11]));
        assert_eq!(route(&single), EventRoute::Delete(vec![12]));
    }

    #[test]
    fn routes_attachment_add_to_user_upload_path() {
        let add = event(json!({
            "id": 5, "type": "attachment", "op": "add",
            "attachment": {"id": 99, "name": "cat.png", "path_id": "2/ab/cd/cat.png"}
        }));

        assert_eq!(
            route(&add),
            EventRoute::AttachmentStored {
                file_id: 99,
                url: "/user_uploads/2/ab/cd/cat.png".to_string()
            }
        );
    }

    #[test]
    fn topic_only_edits_are_ignored() {
        let edit = event(json!({"id": 6, "type": "update_message", "message_id": 1, "subject": "new"}));
        assert!(matches!(route(&edit), EventRoute::Ignored { .. }));

        let rerender = event(json!({"id": 7, "type": "update_message", "message_id": 1, "content": "x", "rendering_only": true}));
        assert!(matches!(route(&rerender), EventRoute::Ignored { .. }));
    }

    #[test_case(json!({"id": 1, "type": "heartbeat"}), "heartbeat" ; "heartbeat")]
    #[test_case(json!({"id": 1, "type": "typing", "op": "start"}), "ignored" ; "unknown type")]
    #[test_case(json!({"id": 1, "type": "stream", "op": "create", "streams": []}), "ignored" ; "stream create")]
    #[test_case(json!({"id": 1, "type": "stream", "op": "delete", "streams": [{"stream_id": 8, "name": "x"}]}), "streams" ; "stream delete")]
    #[test_case(json!({"id": 1, "type": "attachment", "op": "remove", "attachment": {"id": 4}}), "removed" ; "attachment remove")]
    #[test_case(json!({"id": 1, "type": "message"}), "malformed" ; "message without body")]
    fn routing_table_covers_event_kinds(value: serde_json::Value, expected: &str) {
        let actual = match route(&event(value)) {
            EventRoute::Heartbeat => "heartbeat",
            EventRoute::Ignored { .. } => "ignored",
            EventRoute::StreamsDeleted(ids) if ids == vec![8] => "streams",
            EventRoute::AttachmentRemoved { file_id: 4 } => "removed",
            EventRoute::Malformed { .. } => "malformed",
            _ => "other",
        };
        assert_eq!(actual, expected);
    }

    #[derive(Default)]
    struct RecordingHandler {
        messages: Mutex<Vec<i64>>,
        edits: Mutex<Vec<MessageEdit>>,
        linkifier_sets: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ZulipEventHandler for RecordingHandler {
        async fn handle_message(&self, message: &ZulipMessage) -> Result<()> {
            self.messages.lock().push(message.id);
            Ok(())
        }
        async fn handle_message_edit(&self, edit: &MessageEdit) -> Result<()> {
            self.edits.lock().push(edit.clone());
            Ok(())
        }
        async fn handle_message_delete(&self, _message_ids: &[i64]) -> Result<()> {
            Ok(())
        }
        async fn handle_linkifiers(&self, linkifiers: Vec<LinkifierSource>) -> Result<()> {
            self.linkifier_sets.lock().push(linkifiers.len());
            Ok(())
        }
        async fn handle_attachment_stored(&self, _file_id: i64, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn handle_attachment_removed(&self, _file_id: i64) -> Result<()> {
            Ok(())
        }
        async fn handle_streams_deleted(&self, _stream_ids: &[i64]) -> Result<()> {
            Ok(())
        }
    }

    fn message_event(id: i64, sender_id: i64) -> ZulipEvent {
        event(json!({
            "id": id, "type": "message",
            "message": {
                "id": 100 + id, "sender_id": sender_id, "sender_full_name": "Someone",
                "content": "hi", "type": "stream", "stream_id": 7, "subject": "general"
            }
        }))
    }

    #[tokio::test]
    async fn own_and_ignored_senders_are_dropped() {
        let handler = Arc::new(RecordingHandler::default());
        let processor = ZulipEventProcessor::new(handler.clone(), 42, [13]);

        processor.dispatch(message_event(1, 42)).await;
        processor.dispatch(message_event(2, 13)).await;
        processor.dispatch(message_event(3, 5)).await;
        processor
            .dispatch(event(json!({"id": 4, "type": "update_message", "message_id": 103, "user_id": 42, "content": "x"})))
            .await;

        assert_eq!(handler.messages.lock().as_slice(), [103]);
        assert!(handler.edits.lock().is_empty());
    }

    #[tokio::test]
    async fn registration_installs_fetched_linkifiers() {
        let handler = Arc::new(RecordingHandler::default());
        let processor = ZulipEventProcessor::new(handler.clone(), 42, []);
        let response = serde_json::from_value(json!({
            "queue_id": "q", "last_event_id": -1,
            "realm_linkifiers": [{"pattern": "x", "url_template": "https://x.example/"}]
        }))
        .expect("valid response");

        processor.on_registered(&response).await;
        processor
            .dispatch(event(json!({"id": 1, "type": "realm_linkifiers", "realm_linkifiers": []})))
            .await;

        assert_eq!(handler.linkifier_sets.lock().as_slice(), [1, 0]);
    }
}

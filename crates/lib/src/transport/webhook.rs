//! Evolution API webhook payloads → typed events.
//!
//! Evolution posts `{ "event": "<name>", "instance": "...", "data": {...} }`. Event names arrive as
//! `messages.upsert` or `MESSAGES_UPSERT` depending on the server version, or only in the URL path
//! when per-event webhooks are enabled (`/webhook/whatsapp/messages-upsert`).

use super::{CloseReason, ConnectionState};
use crate::mailbox::InboundRequest;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    /// Connection transition; `device_id` is the session's own JID when the server reports it.
    Connection {
        state: ConnectionState,
        device_id: Option<String>,
    },
    /// Text message from someone other than this session.
    Message(InboundRequest),
    QrCode(String),
}

/// Parse one webhook body. `path_event` is the event name from the URL, used when the body has none.
/// Unknown events and messages without text yield nothing.
pub fn parse_webhook(payload: &Value, path_event: Option<&str>) -> Vec<WebhookEvent> {
    let name = payload["event"]
        .as_str()
        .or(path_event)
        .map(normalize_event_name)
        .unwrap_or_default();
    let data = &payload["data"];
    match name.as_str() {
        "connection.update" => parse_connection(data).into_iter().collect(),
        "messages.upsert" => parse_messages(data),
        "qrcode.updated" => parse_qr(data)
            .map(WebhookEvent::QrCode)
            .into_iter()
            .collect(),
        _ => {
            log::debug!("webhook: ignoring event {:?}", name);
            Vec::new()
        }
    }
}

fn normalize_event_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace(['_', '-'], ".")
}

fn non_empty(v: &Value) -> Option<&str> {
    v.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_connection(data: &Value) -> Option<WebhookEvent> {
    let status = data["statusReason"]
        .as_u64()
        .or_else(|| data["statusReason"].as_str().and_then(|s| s.parse().ok()))
        .and_then(|c| u16::try_from(c).ok());
    let state = match non_empty(&data["state"])? {
        "open" | "connected" => ConnectionState::Open,
        "connecting" => ConnectionState::Connecting,
        "close" | "closed" => ConnectionState::Closed(CloseReason::from_status_code(status)),
        other => {
            log::debug!("webhook: unknown connection state {:?}", other);
            return None;
        }
    };
    Some(WebhookEvent::Connection {
        state,
        device_id: non_empty(&data["wuid"]).map(str::to_string),
    })
}

fn parse_messages(data: &Value) -> Vec<WebhookEvent> {
    let items: Vec<&Value> = match data {
        Value::Array(items) => items.iter().collect(),
        Value::Object(obj) => match obj.get("messages") {
            Some(Value::Array(items)) => items.iter().collect(),
            _ => vec![data],
        },
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|msg| {
            let key = &msg["key"];
            if key["fromMe"].as_bool().unwrap_or(false) {
                return None;
            }
            let jid = non_empty(&key["remoteJid"])?;
            let text = message_text(&msg["message"])?;
            Some(WebhookEvent::Message(InboundRequest::new(jid, text)))
        })
        .collect()
}

/// Plain conversation text, or the text of an extended (quoted / link preview) message.
fn message_text(message: &Value) -> Option<&str> {
    message["conversation"]
        .as_str()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            message["extendedTextMessage"]["text"]
                .as_str()
                .filter(|s| !s.is_empty())
        })
}

fn parse_qr(data: &Value) -> Option<String> {
    let qr = &data["qrcode"];
    non_empty(&qr["code"])
        .or_else(|| non_empty(&qr["base64"]))
        .or_else(|| non_empty(qr))
        .map(str::to_string)
}

//! WhatsApp transport backed by an Evolution API server (REST + webhooks around Baileys).
//!
//! Outbound calls go over REST with the global `apikey` header. Inbound events arrive as webhooks on
//! the bridge's HTTP server, which hands them to [`EvolutionTransport::ingest_webhook`]; they are
//! forwarded to the event stream of the current connection.

use super::webhook::{parse_webhook, WebhookEvent};
use super::{
    AuthError, ConnectionHandle, ConnectionState, CredentialsUpdate, PairingError, SendError,
    Transport, TransportEvent,
};
use crate::config::{self, Config};
use crate::credentials::{Credentials, CredentialsPatch};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, RwLock};

const EVENT_BUFFER: usize = 64;

const WEBHOOK_EVENTS: &[&str] = &["CONNECTION_UPDATE", "MESSAGES_UPSERT", "QRCODE_UPDATED"];

/// Evolution API client plus the event sink of the current connection.
pub struct EvolutionTransport {
    api_url: String,
    api_key: Option<String>,
    instance_name: String,
    webhook_url: String,
    client: reqwest::Client,
    sink: RwLock<Option<mpsc::Sender<TransportEvent>>>,
    open: AtomicBool,
}

/// What `/instance/create` handed back.
struct CreatedInstance {
    token: Option<String>,
    qr: Option<String>,
}

impl EvolutionTransport {
    pub fn new(
        api_url: impl Into<String>,
        api_key: Option<String>,
        instance_name: impl Into<String>,
        webhook_url: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
            instance_name: instance_name.into(),
            webhook_url: webhook_url.into(),
            client: reqwest::Client::new(),
            sink: RwLock::new(None),
            open: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.evolution.api_url.clone(),
            config::resolve_evolution_api_key(config),
            config.evolution.instance_name.clone(),
            config::resolve_webhook_url(config),
        )
    }

    /// Last connection state seen from the server was `open`.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let rb = self
            .client
            .request(method, format!("{}{}", self.api_url, path));
        match self.api_key {
            Some(ref key) => rb.header("apikey", key),
            None => rb,
        }
    }

    /// GET /instance/connectionState/{instance}. `None` when the instance does not exist yet.
    async fn connection_state(&self) -> Result<Option<ConnectionState>, AuthError> {
        let res = self
            .request(
                Method::GET,
                &format!("/instance/connectionState/{}", self.instance_name),
            )
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::Unauthorized(format!("{} {}", status, body)));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::Api(format!(
                "connectionState failed: {} {}",
                status, body
            )));
        }
        let body: Value = res
            .json()
            .await
            .map_err(|e| AuthError::Api(e.to_string()))?;
        let state = body["instance"]["state"]
            .as_str()
            .or_else(|| body["state"].as_str())
            .unwrap_or("");
        Ok(Some(match state {
            "open" | "connected" => ConnectionState::Open,
            "connecting" => ConnectionState::Connecting,
            other => ConnectionState::Closed(super::CloseReason::Transient(format!(
                "instance state {:?}",
                other
            ))),
        }))
    }

    /// POST /instance/create with QR enabled and the webhook pointed at this bridge.
    async fn create_instance(&self, credentials: &Credentials) -> Result<CreatedInstance, AuthError> {
        let token = credentials
            .instance_token
            .clone()
            .unwrap_or_else(|| format!("wab-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]));
        let body = json!({
            "instanceName": self.instance_name,
            "token": token,
            "qrcode": true,
            "webhook": self.webhook_url,
            "webhook_by_events": false,
            "events": WEBHOOK_EVENTS,
        });
        let res = self
            .request(Method::POST, "/instance/create")
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::Unauthorized(format!("{} {}", status, text)));
        }
        if !status.is_success() {
            return Err(AuthError::Api(format!(
                "create instance failed: {} {}",
                status, text
            )));
        }
        let resp: Value = serde_json::from_str(&text).unwrap_or_default();
        let issued = resp["hash"]["apikey"]
            .as_str()
            .or_else(|| resp["hash"].as_str())
            .map(str::to_string)
            .unwrap_or(token);
        Ok(CreatedInstance {
            token: Some(issued),
            qr: extract_qr(&resp["qrcode"]),
        })
    }

    /// GET /instance/connect/{instance}: asks the server to (re)open the session; may return a QR code.
    async fn start_session(&self) -> Result<Option<String>, AuthError> {
        let res = self
            .request(
                Method::GET,
                &format!("/instance/connect/{}", self.instance_name),
            )
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::Unauthorized(format!("{} {}", status, body)));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::Api(format!("connect failed: {} {}", status, body)));
        }
        let resp: Value = res.json().await.unwrap_or_default();
        Ok(extract_qr(&resp))
    }

    /// Handle one webhook body. Returns an error only when a credential update could not be
    /// persisted, so the server answers with a failure and Evolution retries the delivery.
    pub async fn ingest_webhook(
        &self,
        payload: &Value,
        path_event: Option<&str>,
    ) -> Result<(), String> {
        let events = parse_webhook(payload, path_event);
        if events.is_empty() {
            return Ok(());
        }
        let Some(tx) = self.sink.read().await.clone() else {
            log::debug!(
                "whatsapp: no active connection, dropping {} webhook event(s)",
                events.len()
            );
            return Ok(());
        };
        for event in events {
            match event {
                WebhookEvent::Connection { state, device_id } => {
                    self.open.store(state.is_open(), Ordering::SeqCst);
                    if state.is_open() {
                        let (update, ack) = CredentialsUpdate::new(CredentialsPatch {
                            registered: Some(true),
                            device_id,
                            instance_token: None,
                        });
                        forward(&tx, TransportEvent::CredentialsUpdated(update)).await?;
                        ack.await
                            .map_err(|_| "credential update was dropped".to_string())??;
                    }
                    forward(&tx, TransportEvent::Connection(state)).await?;
                }
                WebhookEvent::Message(request) => {
                    forward(&tx, TransportEvent::Inbound(request)).await?;
                }
                WebhookEvent::QrCode(qr) => {
                    forward(&tx, TransportEvent::QrCode(qr)).await?;
                }
            }
        }
        Ok(())
    }
}

async fn forward(tx: &mpsc::Sender<TransportEvent>, event: TransportEvent) -> Result<(), String> {
    tx.send(event)
        .await
        .map_err(|_| "connection event stream closed".to_string())
}

/// QR from a `{ code, base64 }` object (create/connect responses and webhooks).
fn extract_qr(v: &Value) -> Option<String> {
    v["code"]
        .as_str()
        .or_else(|| v["base64"].as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Strip formatting from a phone number; `None` unless only digits remain.
fn normalize_phone_number(phone_number: &str) -> Option<String> {
    let digits: String = phone_number
        .chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-' | '(' | ')'))
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        None
    } else {
        Some(digits)
    }
}

#[async_trait]
impl Transport for EvolutionTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<ConnectionHandle, AuthError> {
        let mut initial = Vec::new();
        match self.connection_state().await? {
            Some(ConnectionState::Open) => {
                initial.push(TransportEvent::CredentialsUpdated(
                    CredentialsUpdate::unacknowledged(CredentialsPatch {
                        registered: Some(true),
                        ..Default::default()
                    }),
                ));
                initial.push(TransportEvent::Connection(ConnectionState::Open));
            }
            Some(ConnectionState::Connecting) => {
                initial.push(TransportEvent::Connection(ConnectionState::Connecting));
            }
            Some(ConnectionState::Closed(reason)) => {
                log::info!(
                    "whatsapp: instance {} is closed ({}), reopening",
                    self.instance_name,
                    reason
                );
                let qr = self.start_session().await?;
                initial.push(TransportEvent::Connection(ConnectionState::Connecting));
                if let Some(qr) = qr {
                    initial.push(TransportEvent::QrCode(qr));
                }
            }
            None => {
                log::info!("whatsapp: creating instance {}", self.instance_name);
                let created = self.create_instance(credentials).await?;
                if let Some(token) = created.token {
                    initial.push(TransportEvent::CredentialsUpdated(
                        CredentialsUpdate::unacknowledged(CredentialsPatch {
                            instance_token: Some(token),
                            ..Default::default()
                        }),
                    ));
                }
                initial.push(TransportEvent::Connection(ConnectionState::Connecting));
                if let Some(qr) = created.qr {
                    initial.push(TransportEvent::QrCode(qr));
                }
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        for event in initial {
            if let TransportEvent::Connection(ref state) = event {
                self.open.store(state.is_open(), Ordering::SeqCst);
            }
            let _ = tx.try_send(event);
        }
        *self.sink.write().await = Some(tx);
        Ok(ConnectionHandle::new(rx))
    }

    async fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
        *self.sink.write().await = None;
    }

    async fn send_message(&self, to: &str, text: &str) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Disconnected);
        }
        let res = self
            .request(
                Method::POST,
                &format!("/message/sendText/{}", self.instance_name),
            )
            .json(&json!({ "number": to, "text": text }))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    SendError::Disconnected
                } else {
                    SendError::Api(e.to_string())
                }
            })?;
        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        match status {
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                Err(SendError::InvalidDestination(format!("{}: {}", to, body)))
            }
            _ if body.contains("Connection Closed") => Err(SendError::Disconnected),
            _ => Err(SendError::Api(format!("{} {}", status, body))),
        }
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PairingError> {
        let digits = normalize_phone_number(phone_number)
            .ok_or_else(|| PairingError::InvalidNumber(phone_number.to_string()))?;
        if self.is_open() {
            return Err(PairingError::AlreadyRegistered);
        }
        let res = self
            .request(
                Method::GET,
                &format!("/instance/connect/{}", self.instance_name),
            )
            .query(&[("number", digits.as_str())])
            .send()
            .await
            .map_err(|e| PairingError::Unavailable(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(PairingError::Unavailable(format!("{} {}", status, body)));
        }
        let body: Value = res
            .json()
            .await
            .map_err(|e| PairingError::Unavailable(e.to_string()))?;
        body["pairingCode"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PairingError::Unavailable("no pairingCode in response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_transport() -> EvolutionTransport {
        EvolutionTransport::new("http://127.0.0.1:9", None, "test", "http://127.0.0.1:9/webhook/whatsapp")
    }

    #[test]
    fn phone_numbers_are_normalized_to_digits() {
        assert_eq!(
            normalize_phone_number("+49 151-123 (45)").as_deref(),
            Some("4915112345")
        );
        assert_eq!(normalize_phone_number(""), None);
        assert_eq!(normalize_phone_number("call me"), None);
    }

    #[tokio::test]
    async fn send_before_open_is_disconnected() {
        let transport = offline_transport();
        let err = transport.send_message("a@s.whatsapp.net", "hi").await.unwrap_err();
        assert!(matches!(err, SendError::Disconnected));
    }

    #[tokio::test]
    async fn pairing_rejects_invalid_number_without_network() {
        let transport = offline_transport();
        let err = transport.request_pairing_code("not a number").await.unwrap_err();
        assert!(matches!(err, PairingError::InvalidNumber(_)));
    }

    #[tokio::test]
    async fn webhook_without_connection_is_dropped() {
        let transport = offline_transport();
        let payload = json!({
            "event": "messages.upsert",
            "data": { "key": { "remoteJid": "a@s.whatsapp.net" }, "message": { "conversation": "hi" } }
        });
        assert!(transport.ingest_webhook(&payload, None).await.is_ok());
    }

    #[test]
    fn qr_extraction_prefers_code() {
        assert_eq!(
            extract_qr(&json!({ "code": "2@x", "base64": "data:..." })).as_deref(),
            Some("2@x")
        );
        assert_eq!(extract_qr(&json!({})), None);
    }
}

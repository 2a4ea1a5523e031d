//! Messaging transport (WhatsApp via an Evolution API server).
//!
//! The transport is consumed through the [`Transport`] trait. Each successful `connect` yields a
//! [`ConnectionHandle`] whose event stream carries connection changes, inbound text messages,
//! credential updates and QR codes for that connection only.

mod error;
mod evolution;
mod webhook;

pub use error::{AuthError, PairingError, SendError};
pub use evolution::EvolutionTransport;
pub use webhook::{parse_webhook, WebhookEvent};

use crate::credentials::{Credentials, CredentialsPatch};
use crate::mailbox::InboundRequest;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// Baileys `DisconnectReason.loggedOut`.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Connection state of the messaging session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed(_) => "closed",
        }
    }
}

/// Why a connection closed. Only `LoggedOut` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    LoggedOut,
    Transient(String),
}

impl CloseReason {
    pub fn from_status_code(code: Option<u16>) -> Self {
        match code {
            Some(LOGGED_OUT_STATUS) => CloseReason::LoggedOut,
            Some(c) => CloseReason::Transient(format!("status {}", c)),
            None => CloseReason::Transient("connection closed".to_string()),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::LoggedOut => write!(f, "logged out"),
            CloseReason::Transient(reason) => write!(f, "{}", reason),
        }
    }
}

/// Credential change reported by the transport. The sender of the update waits on the ack,
/// so the change must be persisted before [`CredentialsUpdate::acknowledge`] is called.
#[derive(Debug)]
pub struct CredentialsUpdate {
    pub patch: CredentialsPatch,
    ack: Option<oneshot::Sender<Result<(), String>>>,
}

impl CredentialsUpdate {
    pub fn new(patch: CredentialsPatch) -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                patch,
                ack: Some(tx),
            },
            rx,
        )
    }

    /// Update nobody waits on.
    pub fn unacknowledged(patch: CredentialsPatch) -> Self {
        Self { patch, ack: None }
    }

    pub fn acknowledge(mut self, result: Result<(), String>) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(result);
        }
    }
}

/// Event emitted on a connection's stream.
#[derive(Debug)]
pub enum TransportEvent {
    Connection(ConnectionState),
    Inbound(InboundRequest),
    CredentialsUpdated(CredentialsUpdate),
    QrCode(String),
}

/// Live connection: the receiving end of its event stream.
#[derive(Debug)]
pub struct ConnectionHandle {
    events: mpsc::Receiver<TransportEvent>,
}

impl ConnectionHandle {
    pub fn new(events: mpsc::Receiver<TransportEvent>) -> Self {
        Self { events }
    }

    /// Next event; `None` once the transport dropped this connection.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// Messaging transport used by the session manager and the bridge.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a session with the given credentials and start emitting events.
    async fn connect(&self, credentials: &Credentials) -> Result<ConnectionHandle, AuthError>;

    /// Detach from the current connection; its event stream ends.
    async fn disconnect(&self);

    /// Deliver a text message.
    async fn send_message(&self, to: &str, text: &str) -> Result<(), SendError>;

    /// Request a pairing code for `phone_number`. Only valid while unregistered.
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PairingError>;
}

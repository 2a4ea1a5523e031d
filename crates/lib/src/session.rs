//! Session lifecycle: connect and reconnect supervision, device registration (QR or pairing code),
//! and credential persistence.
//!
//! [`SessionManager::run`] is a loop over connections: connect, drive the connection's event stream
//! until it closes, then back off and reconnect. A logout ends the loop for good.

use crate::credentials::{Credentials, CredentialsError, CredentialsPatch, CredentialsStore};
use crate::mailbox::InboundRequest;
use crate::reconnect::ReconnectPolicy;
use crate::transport::{
    CloseReason, ConnectionHandle, ConnectionState, CredentialsUpdate, PairingError, Transport,
    TransportEvent,
};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Device registration progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
}

impl RegistrationState {
    pub fn label(&self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
        }
    }
}

/// Operator-facing lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    State(ConnectionState),
    QrCode(String),
    PairingCode(String),
    PairingFailed(String),
    Registered { device_id: Option<String> },
    LoggedOut,
}

/// Why [`SessionManager::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Shutdown,
    LoggedOut,
    /// The transport refused the configured credentials.
    Rejected(String),
    GaveUp { attempts: u32 },
}

enum ConnectionEnd {
    Closed,
    LoggedOut,
    Shutdown,
}

/// Owns the credentials and the connection loop for one session.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    store: CredentialsStore,
    credentials: Credentials,
    policy: ReconnectPolicy,
    phone_number: Option<String>,
    pairing_requested: bool,
    inbound_tx: mpsc::Sender<InboundRequest>,
    state_tx: watch::Sender<ConnectionState>,
    registration_tx: watch::Sender<RegistrationState>,
    events_tx: broadcast::Sender<LifecycleEvent>,
}

impl SessionManager {
    /// Load credentials from `store` and prepare the manager. Inbound messages are handed to
    /// `inbound_tx` without blocking the event loop.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialsStore,
        policy: ReconnectPolicy,
        inbound_tx: mpsc::Sender<InboundRequest>,
    ) -> Result<Self, CredentialsError> {
        let credentials = store.load()?;
        let registration = if credentials.registered {
            RegistrationState::Registered
        } else {
            RegistrationState::Unregistered
        };
        let (state_tx, _) = watch::channel(ConnectionState::Closed(CloseReason::Transient(
            "not connected".to_string(),
        )));
        let (registration_tx, _) = watch::channel(registration);
        let (events_tx, _) = broadcast::channel(32);
        Ok(Self {
            transport,
            store,
            credentials,
            policy,
            phone_number: None,
            pairing_requested: false,
            inbound_tx,
            state_tx,
            registration_tx,
            events_tx,
        })
    }

    /// Phone number for the pairing-code flow; without one, registration falls back to QR.
    pub fn with_phone_number(mut self, phone_number: Option<String>) -> Self {
        self.phone_number = phone_number
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn registration(&self) -> watch::Receiver<RegistrationState> {
        self.registration_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events_tx.subscribe()
    }

    /// Run until shutdown, logout, rejected credentials, or exhausted reconnect attempts.
    pub async fn run(mut self, shutdown: CancellationToken) -> SessionOutcome {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = shutdown.cancelled() => None,
                r = self.transport.connect(&self.credentials) => Some(r),
            };
            let Some(connected) = connected else {
                return self.stop().await;
            };
            match connected {
                Ok(handle) => {
                    match self.drive(handle, &shutdown, &mut attempt).await {
                        ConnectionEnd::Shutdown => return self.stop().await,
                        ConnectionEnd::LoggedOut => return self.logged_out().await,
                        ConnectionEnd::Closed => {}
                    }
                }
                Err(e) if e.is_terminal() => {
                    log::error!("whatsapp: connect rejected: {}", e);
                    self.set_state(ConnectionState::Closed(CloseReason::Transient(e.to_string())));
                    return SessionOutcome::Rejected(e.to_string());
                }
                Err(e) => {
                    log::warn!("whatsapp: connect failed: {}", e);
                    self.set_state(ConnectionState::Closed(CloseReason::Transient(e.to_string())));
                }
            }

            if !self.policy.should_retry(attempt) {
                log::error!("whatsapp: giving up after {} reconnect attempt(s)", attempt);
                return SessionOutcome::GaveUp { attempts: attempt };
            }
            let delay = self.policy.delay_for_attempt(attempt);
            attempt += 1;
            log::info!("whatsapp: reconnecting in {:?} (attempt {})", delay, attempt);
            let woke = tokio::select! {
                _ = shutdown.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            if !woke {
                return self.stop().await;
            }
        }
    }

    async fn drive(
        &mut self,
        mut handle: ConnectionHandle,
        shutdown: &CancellationToken,
        attempt: &mut u32,
    ) -> ConnectionEnd {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return ConnectionEnd::Shutdown,
                e = handle.next_event() => e,
            };
            let Some(event) = event else {
                log::warn!("whatsapp: connection event stream ended");
                self.transport.disconnect().await;
                self.set_state(ConnectionState::Closed(CloseReason::Transient(
                    "event stream ended".to_string(),
                )));
                return ConnectionEnd::Closed;
            };
            match event {
                TransportEvent::Connection(state) => match state {
                    ConnectionState::Open => {
                        log::info!("whatsapp: connected");
                        *attempt = 0;
                        self.set_state(ConnectionState::Open);
                    }
                    ConnectionState::Connecting => {
                        self.set_state(ConnectionState::Connecting);
                        // Credential updates queued ahead of this event are already applied.
                        self.request_pairing_code_once().await;
                    }
                    ConnectionState::Closed(CloseReason::LoggedOut) => {
                        self.set_state(ConnectionState::Closed(CloseReason::LoggedOut));
                        return ConnectionEnd::LoggedOut;
                    }
                    ConnectionState::Closed(reason) => {
                        log::warn!("whatsapp: connection closed: {}", reason);
                        self.transport.disconnect().await;
                        self.set_state(ConnectionState::Closed(reason));
                        return ConnectionEnd::Closed;
                    }
                },
                TransportEvent::Inbound(request) => self.forward_inbound(request),
                TransportEvent::CredentialsUpdated(update) => self.persist_credentials(update),
                TransportEvent::QrCode(qr) => {
                    if *self.registration_tx.borrow() == RegistrationState::Unregistered {
                        self.set_registration(RegistrationState::Registering);
                    }
                    log::info!("whatsapp: new QR code available, scan it to link this device");
                    let _ = self.events_tx.send(LifecycleEvent::QrCode(qr));
                }
            }
        }
    }

    fn forward_inbound(&self, request: InboundRequest) {
        match self.inbound_tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                log::warn!(
                    "bridge: exchange queue full, rejecting message from {}",
                    request.user
                );
            }
            Err(TrySendError::Closed(request)) => {
                log::warn!(
                    "bridge: orchestrator stopped, dropping message from {}",
                    request.user
                );
            }
        }
    }

    /// Persist first, then acknowledge. On failure the in-memory bundle is left unchanged.
    fn persist_credentials(&mut self, update: CredentialsUpdate) {
        let mut next = self.credentials.clone();
        if !next.apply(&update.patch) {
            update.acknowledge(Ok(()));
            return;
        }
        if let Err(e) = self.store.save(&next) {
            log::error!("whatsapp: persisting credentials failed: {}", e);
            update.acknowledge(Err(e.to_string()));
            return;
        }
        let newly_registered = next.registered && !self.credentials.registered;
        self.credentials = next;
        update.acknowledge(Ok(()));
        log::debug!("whatsapp: credentials saved to {}", self.store.path().display());
        if newly_registered {
            log::info!("whatsapp: device registered");
            self.set_registration(RegistrationState::Registered);
            let _ = self.events_tx.send(LifecycleEvent::Registered {
                device_id: self.credentials.device_id.clone(),
            });
        }
    }

    async fn request_pairing_code_once(&mut self) {
        if self.credentials.registered || self.pairing_requested {
            return;
        }
        let Some(phone_number) = self.phone_number.clone() else {
            return;
        };
        self.pairing_requested = true;
        self.set_registration(RegistrationState::Registering);
        match self.transport.request_pairing_code(&phone_number).await {
            Ok(code) => {
                log::info!("whatsapp: pairing code issued for {}", phone_number);
                let _ = self.events_tx.send(LifecycleEvent::PairingCode(code));
            }
            Err(PairingError::AlreadyRegistered) => {
                log::info!("whatsapp: device is already linked, no pairing code needed");
                if !self.credentials.registered {
                    self.set_registration(RegistrationState::Unregistered);
                }
            }
            Err(e) => {
                log::warn!("whatsapp: pairing code request failed, QR registration still available: {}", e);
                let _ = self.events_tx.send(LifecycleEvent::PairingFailed(e.to_string()));
            }
        }
    }

    async fn logged_out(&mut self) -> SessionOutcome {
        log::error!("whatsapp: session logged out; link the device again to continue");
        self.transport.disconnect().await;
        let patch = CredentialsPatch {
            registered: Some(false),
            ..Default::default()
        };
        if self.credentials.apply(&patch) {
            if let Err(e) = self.store.save(&self.credentials) {
                log::error!("whatsapp: persisting logout failed: {}", e);
            }
        }
        self.set_registration(RegistrationState::Unregistered);
        let _ = self.events_tx.send(LifecycleEvent::LoggedOut);
        SessionOutcome::LoggedOut
    }

    async fn stop(&mut self) -> SessionOutcome {
        self.transport.disconnect().await;
        self.set_state(ConnectionState::Closed(CloseReason::Transient(
            "shutdown".to_string(),
        )));
        log::info!("whatsapp: session stopped");
        SessionOutcome::Shutdown
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state.clone());
        let _ = self.events_tx.send(LifecycleEvent::State(state));
    }

    fn set_registration(&self, registration: RegistrationState) {
        self.registration_tx.send_replace(registration);
    }
}

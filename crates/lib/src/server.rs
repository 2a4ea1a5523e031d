//! HTTP server (Evolution webhooks and health) and the runtime that wires the transport, session
//! manager and bridge orchestrator together.

use crate::bridge::{Bridge, ExchangeSettings, ExchangeStats};
use crate::config::{self, Config};
use crate::credentials::CredentialsStore;
use crate::init;
use crate::mailbox::{FileMailbox, InboundRequest, MailboxRole, RoleLock};
use crate::reconnect::ReconnectPolicy;
use crate::session::{LifecycleEvent, RegistrationState, SessionManager, SessionOutcome};
use crate::transport::{ConnectionState, EvolutionTransport};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::path::Path as FsPath;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct ServerState {
    pub port: u16,
    pub transport: Arc<EvolutionTransport>,
    pub connection: watch::Receiver<ConnectionState>,
    pub registration: watch::Receiver<RegistrationState>,
    pub stats: Arc<ExchangeStats>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/webhook/whatsapp", post(whatsapp_webhook))
        .route("/webhook/whatsapp/:event", post(whatsapp_event_webhook))
        .with_state(state)
}

/// GET / returns a simple health JSON (for probes and `wabridge status`).
async fn health_http(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let connection = state.connection.borrow().label();
    let registration = state.registration.borrow().label();
    Json(json!({
        "runtime": "running",
        "port": state.port,
        "connection": connection,
        "registered": registration == RegistrationState::Registered.label(),
        "registration": registration,
        "exchanges": {
            "pending": state.stats.is_pending(),
            "completed": state.stats.completed(),
            "failed": state.stats.failed(),
        },
    }))
}

/// POST /webhook/whatsapp receives Evolution events with the event name in the body.
async fn whatsapp_webhook(State(state): State<ServerState>, body: Bytes) -> StatusCode {
    ingest(&state, None, &body).await
}

/// POST /webhook/whatsapp/:event receives per-event webhooks (`webhook_by_events`).
async fn whatsapp_event_webhook(
    State(state): State<ServerState>,
    Path(event): Path<String>,
    body: Bytes,
) -> StatusCode {
    ingest(&state, Some(&event), &body).await
}

async fn ingest(state: &ServerState, event: Option<&str>, body: &[u8]) -> StatusCode {
    let payload: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    match state.transport.ingest_webhook(&payload, event).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            log::error!("webhook: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Everything `wabridge run` needs, assembled but not yet started.
pub struct BridgeRuntime {
    config: Config,
    producer: RoleLock,
    transport: Arc<EvolutionTransport>,
    manager: SessionManager,
    bridge: Bridge,
    inbound_rx: mpsc::Receiver<InboundRequest>,
}

impl BridgeRuntime {
    /// Attach to the mailbox as producer, load credentials and build the components.
    /// `phone_number` overrides `session.phoneNumber` for the pairing-code flow.
    pub fn new(config: Config, config_path: &FsPath, phone_number: Option<String>) -> Result<Self> {
        init::require_initialized(config_path, &config)?;

        let mailbox_dir = config::resolve_mailbox_dir(&config, config_path);
        let mailbox = FileMailbox::from_config(&config.mailbox, &mailbox_dir);
        let producer = mailbox
            .attach(MailboxRole::Producer)
            .with_context(|| format!("attaching to mailbox at {}", mailbox_dir.display()))?;
        if mailbox.clear_stale_reply()? {
            log::warn!("mailbox: discarded reply left over from a previous run");
        }
        let mailbox = Arc::new(mailbox);

        let transport = Arc::new(EvolutionTransport::from_config(&config));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.mailbox.queue_capacity.max(1));
        let store = CredentialsStore::new(config::resolve_session_dir(&config, config_path));
        let phone_number = phone_number.or_else(|| config.session.phone_number.clone());
        let manager = SessionManager::new(
            transport.clone(),
            store,
            ReconnectPolicy::from(&config.reconnect),
            inbound_tx,
        )
        .context("loading session credentials")?
        .with_phone_number(phone_number);

        let bridge = Bridge::new(
            mailbox,
            transport.clone(),
            ExchangeSettings::from_config(&config.mailbox),
            manager.state(),
        );

        Ok(Self {
            config,
            producer,
            transport,
            manager,
            bridge,
            inbound_rx,
        })
    }

    /// The stored credentials say this device is linked.
    pub fn is_registered(&self) -> bool {
        self.manager.credentials().registered
    }

    /// Phone number for the pairing-code flow, replacing any configured one.
    pub fn with_phone_number(mut self, phone_number: String) -> Self {
        self.manager = self.manager.with_phone_number(Some(phone_number));
        self
    }

    /// Lifecycle notifications (connection changes, QR and pairing codes).
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.manager.subscribe()
    }

    /// Serve webhooks, run the session and the orchestrator until `shutdown` or a terminal
    /// session outcome.
    pub async fn run(self, shutdown: CancellationToken) -> Result<SessionOutcome> {
        let BridgeRuntime {
            config,
            producer,
            transport,
            manager,
            bridge,
            inbound_rx,
        } = self;

        let bind = config.server.bind.trim();
        if !config::is_loopback_bind(bind) {
            log::warn!(
                "webhook server bound to {}: webhooks are not authenticated, keep the port off public networks",
                bind
            );
        }
        let bind_addr = format!("{}:{}", bind, config.server.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding to {}", bind_addr))?;
        log::info!("bridge listening on {}", bind_addr);

        let app = router(ServerState {
            port: config.server.port,
            transport,
            connection: manager.state(),
            registration: manager.registration(),
            stats: bridge.stats(),
        });
        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
        });
        let orchestrator = tokio::spawn(bridge.run(inbound_rx, shutdown.clone()));

        let outcome = manager.run(shutdown.clone()).await;
        shutdown.cancel();

        if let Err(e) = orchestrator.await {
            log::warn!("bridge: orchestrator task failed: {}", e);
        }
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("server exited with error: {}", e),
            Err(e) => log::warn!("server task failed: {}", e),
        }
        drop(producer);
        log::info!("bridge stopped");
        Ok(outcome)
    }
}

/// Future that completes on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

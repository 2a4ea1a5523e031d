//! Integration tests: the bridge's HTTP server and the Evolution transport against a mock Evolution
//! API, both on ephemeral ports. Does not require a real Evolution server or WhatsApp account.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use bridge::bridge::ExchangeStats;
use bridge::credentials::{Credentials, CredentialsStore};
use bridge::mailbox::InboundRequest;
use bridge::reconnect::ReconnectPolicy;
use bridge::server::{router, BridgeRuntime, ServerState};
use bridge::session::{LifecycleEvent, RegistrationState, SessionManager, SessionOutcome};
use bridge::transport::{
    AuthError, ConnectionHandle, ConnectionState, EvolutionTransport, Transport, TransportEvent,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const API_KEY: &str = "test-key";

#[derive(Default)]
struct MockEvolution {
    /// Reported by connectionState; `None` means the instance does not exist until created.
    state: Option<&'static str>,
    created: AtomicBool,
    sent: Mutex<Vec<Value>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("apikey").and_then(|v| v.to_str().ok()) == Some(API_KEY)
}

async fn connection_state(
    State(mock): State<Arc<MockEvolution>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" })));
    }
    let state = match mock.state {
        Some(state) => state,
        None if mock.created.load(Ordering::SeqCst) => "connecting",
        None => return (StatusCode::NOT_FOUND, Json(json!({ "error": "instance not found" }))),
    };
    (
        StatusCode::OK,
        Json(json!({ "instance": { "instanceName": name, "state": state } })),
    )
}

async fn create_instance(
    State(mock): State<Arc<MockEvolution>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.created.store(true, Ordering::SeqCst);
    (
        StatusCode::CREATED,
        Json(json!({
            "instance": { "instanceName": body["instanceName"], "status": "created" },
            "hash": { "apikey": "instance-token" },
            "qrcode": { "code": "2@first-qr", "base64": "data:image/png;base64,AAAA" }
        })),
    )
}

async fn connect_instance(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    match query.get("number") {
        Some(_) => Json(json!({ "pairingCode": "WZYX-1234", "code": "2@next-qr" })),
        None => Json(json!({ "code": "2@next-qr" })),
    }
}

async fn send_text(
    State(mock): State<Arc<MockEvolution>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if body["number"].as_str() == Some("invalid") {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "exists: false" })));
    }
    mock.sent.lock().unwrap().push(body);
    (StatusCode::CREATED, Json(json!({ "key": { "id": "MSG1" } })))
}

async fn serve(app: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let port = listener.local_addr().expect("local_addr").port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    port
}

async fn start_mock(mock: Arc<MockEvolution>) -> String {
    let app = Router::new()
        .route("/instance/connectionState/:name", get(connection_state))
        .route("/instance/create", post(create_instance))
        .route("/instance/connect/:name", get(connect_instance))
        .route("/message/sendText/:name", post(send_text))
        .with_state(mock);
    format!("http://127.0.0.1:{}", serve(app).await)
}

fn transport(api_url: &str, api_key: &str) -> Arc<EvolutionTransport> {
    Arc::new(EvolutionTransport::new(
        api_url,
        Some(api_key.to_string()),
        "wabridge-test",
        "http://127.0.0.1:1/webhook/whatsapp",
    ))
}

async fn start_bridge_server(transport: Arc<EvolutionTransport>) -> (String, watch::Sender<ConnectionState>) {
    let (state_tx, connection) = watch::channel(ConnectionState::Open);
    let (_, registration) = watch::channel(RegistrationState::Registered);
    let state = ServerState {
        port: 0,
        transport,
        connection,
        registration,
        stats: Arc::new(ExchangeStats::default()),
    };
    let port = serve(router(state)).await;
    (format!("http://127.0.0.1:{}", port), state_tx)
}

async fn next_event(handle: &mut ConnectionHandle) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), handle.next_event())
        .await
        .expect("event within 5s")
        .expect("stream open")
}

#[tokio::test]
async fn health_http_reports_connection_state() {
    let transport = transport("http://127.0.0.1:1", API_KEY);
    let (url, _state_tx) = start_bridge_server(transport).await;

    let json: Value = reqwest::get(format!("{}/", url))
        .await
        .expect("GET /")
        .json()
        .await
        .expect("parse JSON");
    assert_eq!(json["runtime"], "running");
    assert_eq!(json["connection"], "open");
    assert_eq!(json["registered"], true);
    assert_eq!(json["exchanges"]["completed"], 0);
    assert_eq!(json["exchanges"]["pending"], false);
}

#[tokio::test]
async fn message_webhook_reaches_connection_stream() {
    let mock = Arc::new(MockEvolution {
        state: Some("open"),
        ..Default::default()
    });
    let api_url = start_mock(mock).await;
    let transport = transport(&api_url, API_KEY);
    let mut handle = transport.connect(&Credentials::default()).await.unwrap();
    assert!(matches!(
        next_event(&mut handle).await,
        TransportEvent::CredentialsUpdated(_)
    ));
    assert!(matches!(
        next_event(&mut handle).await,
        TransportEvent::Connection(ConnectionState::Open)
    ));

    let (url, _state_tx) = start_bridge_server(transport.clone()).await;
    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/webhook/whatsapp/messages-upsert", url))
        .json(&json!({
            "instance": "wabridge-test",
            "data": {
                "key": { "remoteJid": "4915112345678@s.whatsapp.net", "fromMe": false },
                "message": { "conversation": "hello" }
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::OK);

    match next_event(&mut handle).await {
        TransportEvent::Inbound(request) => assert_eq!(
            request,
            InboundRequest::new("4915112345678@s.whatsapp.net", "hello")
        ),
        other => panic!("expected inbound message, got {:?}", other),
    }
}

#[tokio::test]
async fn open_webhook_waits_for_credential_ack() {
    let mock = Arc::new(MockEvolution {
        state: Some("connecting"),
        ..Default::default()
    });
    let api_url = start_mock(mock).await;
    let transport = transport(&api_url, API_KEY);
    let mut handle = transport.connect(&Credentials::default()).await.unwrap();
    assert!(matches!(
        next_event(&mut handle).await,
        TransportEvent::Connection(ConnectionState::Connecting)
    ));
    let (url, _state_tx) = start_bridge_server(transport.clone()).await;

    let fail_next = Arc::new(AtomicBool::new(true));
    let acker = {
        let fail_next = fail_next.clone();
        tokio::spawn(async move {
            let mut acked = 0;
            loop {
                match handle.next_event().await {
                    Some(TransportEvent::Connection(ConnectionState::Open)) if acked == 2 => break,
                    Some(TransportEvent::CredentialsUpdated(update)) => {
                        let result = if fail_next.swap(false, Ordering::SeqCst) {
                            Err("disk full".to_string())
                        } else {
                            Ok(())
                        };
                        update.acknowledge(result);
                        acked += 1;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        })
    };

    let body = json!({
        "event": "connection.update",
        "data": { "state": "open", "wuid": "4915112345678@s.whatsapp.net" }
    });
    let client = reqwest::Client::new();
    let first = client
        .post(format!("{}/webhook/whatsapp", url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let retry = client
        .post(format!("{}/webhook/whatsapp", url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(retry.status(), reqwest::StatusCode::OK);
    acker.await.unwrap();
    assert!(transport.is_open());
}

#[tokio::test]
async fn malformed_webhook_body_is_rejected() {
    let transport = transport("http://127.0.0.1:1", API_KEY);
    let (url, _state_tx) = start_bridge_server(transport).await;
    let res = reqwest::Client::new()
        .post(format!("{}/webhook/whatsapp", url))
        .body("{ not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn send_message_posts_text_to_instance() {
    let mock = Arc::new(MockEvolution {
        state: Some("open"),
        ..Default::default()
    });
    let api_url = start_mock(mock.clone()).await;
    let transport = transport(&api_url, API_KEY);
    let _handle = transport.connect(&Credentials::default()).await.unwrap();

    transport
        .send_message("4915112345678@s.whatsapp.net", "world")
        .await
        .unwrap();
    let sent = mock.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![json!({ "number": "4915112345678@s.whatsapp.net", "text": "world" })]
    );

    let err = transport.send_message("invalid", "world").await.unwrap_err();
    assert!(matches!(
        err,
        bridge::transport::SendError::InvalidDestination(_)
    ));
}

#[tokio::test]
async fn new_instance_is_created_and_pairing_code_returned() {
    let mock = Arc::new(MockEvolution::default());
    let api_url = start_mock(mock.clone()).await;
    let transport = transport(&api_url, API_KEY);
    let mut handle = transport.connect(&Credentials::default()).await.unwrap();
    assert!(mock.created.load(Ordering::SeqCst));

    match next_event(&mut handle).await {
        TransportEvent::CredentialsUpdated(update) => {
            assert_eq!(update.patch.instance_token.as_deref(), Some("instance-token"))
        }
        other => panic!("expected credentials update, got {:?}", other),
    }
    assert!(matches!(
        next_event(&mut handle).await,
        TransportEvent::Connection(ConnectionState::Connecting)
    ));
    match next_event(&mut handle).await {
        TransportEvent::QrCode(qr) => assert_eq!(qr, "2@first-qr"),
        other => panic!("expected QR code, got {:?}", other),
    }

    let code = transport
        .request_pairing_code("+49 151 12345678")
        .await
        .unwrap();
    assert_eq!(code, "WZYX-1234");
}

#[tokio::test]
async fn wrong_api_key_is_terminal() {
    let mock = Arc::new(MockEvolution {
        state: Some("open"),
        ..Default::default()
    });
    let api_url = start_mock(mock).await;
    let transport = transport(&api_url, "wrong-key");
    let err = transport.connect(&Credentials::default()).await.unwrap_err();
    assert!(matches!(err, AuthError::Unauthorized(_)));
    assert!(err.is_terminal());
}

#[tokio::test]
async fn open_instance_with_fresh_credentials_skips_pairing() {
    let mock = Arc::new(MockEvolution {
        state: Some("open"),
        ..Default::default()
    });
    let api_url = start_mock(mock).await;
    let transport = transport(&api_url, API_KEY);
    let session_dir =
        std::env::temp_dir().join(format!("wabridge-server-test-{}", uuid::Uuid::new_v4()));
    let (inbound_tx, _inbound_rx) = mpsc::channel(4);
    let manager = SessionManager::new(
        transport.clone(),
        CredentialsStore::new(&session_dir),
        ReconnectPolicy::default(),
        inbound_tx,
    )
    .unwrap()
    .with_phone_number(Some("+49 151 12345678".to_string()));
    let mut events = manager.subscribe();
    let mut state = manager.state();
    let registration = manager.registration();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(manager.run(shutdown.clone()));

    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_open()))
        .await
        .expect("open within 5s")
        .unwrap();
    shutdown.cancel();
    assert_eq!(task.await.unwrap(), SessionOutcome::Shutdown);

    assert_eq!(*registration.borrow(), RegistrationState::Registered);
    assert!(CredentialsStore::new(&session_dir).load().unwrap().registered);
    let mut registered = false;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(
                event,
                LifecycleEvent::PairingCode(_) | LifecycleEvent::PairingFailed(_)
            ),
            "unexpected {:?}",
            event
        );
        registered |= matches!(event, LifecycleEvent::Registered { .. });
    }
    assert!(registered);
}

#[tokio::test]
async fn runtime_reads_credentials_once() {
    let dir = std::env::temp_dir().join(format!("wabridge-runtime-test-{}", uuid::Uuid::new_v4()));
    let config_path = dir.join("config.json");
    bridge::init::init_config_dir(&config_path).unwrap();
    let (config, path) = bridge::config::load_config(Some(config_path)).unwrap();
    let store = CredentialsStore::new(bridge::config::resolve_session_dir(&config, &path));
    let mut creds = Credentials::default();
    creds.registered = true;
    store.save(&creds).unwrap();

    let runtime = BridgeRuntime::new(config, &path, None).unwrap();
    std::fs::remove_file(store.path()).unwrap();
    assert!(runtime.is_registered());
}

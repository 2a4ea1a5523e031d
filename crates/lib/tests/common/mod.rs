//! Shared fixtures: a scripted in-process transport and temp directories.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge::credentials::Credentials;
use bridge::transport::{
    AuthError, ConnectionHandle, PairingError, SendError, Transport, TransportEvent,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// What one `connect` call does.
pub enum Script {
    /// Succeed and emit these events; the stream then stays open until `disconnect`.
    Events(Vec<TransportEvent>),
    Fail(AuthError),
}

/// Transport that replays scripted connections and records what the code under test asked of it.
/// Once the scripts run out, `connect` succeeds with an idle stream.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    live: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    connects: AtomicUsize,
    sent: Mutex<Vec<(String, String)>>,
    pairing_requests: Mutex<Vec<String>>,
    fail_sends: AtomicBool,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn pairing_requests(&self) -> Vec<String> {
        self.pairing_requests.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Push an event onto the current connection's stream. Panics if nothing is connected.
    pub async fn emit(&self, event: TransportEvent) {
        let tx = self
            .live
            .lock()
            .unwrap()
            .clone()
            .expect("no live connection");
        tx.send(event).await.expect("connection stream closed");
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _credentials: &Credentials) -> Result<ConnectionHandle, AuthError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front();
        let events = match script {
            Some(Script::Fail(e)) => return Err(e),
            Some(Script::Events(events)) => events,
            None => Vec::new(),
        };
        let (tx, rx) = mpsc::channel(64);
        for event in events {
            tx.try_send(event).expect("script fits in the event buffer");
        }
        *self.live.lock().unwrap() = Some(tx);
        Ok(ConnectionHandle::new(rx))
    }

    async fn disconnect(&self) {
        *self.live.lock().unwrap() = None;
    }

    async fn send_message(&self, to: &str, text: &str) -> Result<(), SendError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SendError::Disconnected);
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), text.to_string()));
        Ok(())
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PairingError> {
        self.pairing_requests
            .lock()
            .unwrap()
            .push(phone_number.to_string());
        Ok("ABCD-EFGH".to_string())
    }
}

pub fn temp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("wabridge-{}-{}", prefix, uuid::Uuid::new_v4()))
}

/// Poll `cond` every 10ms for up to 5s.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

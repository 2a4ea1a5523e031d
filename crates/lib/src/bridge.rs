//! Bridge orchestrator: one exchange at a time.
//!
//! For each inbound message: publish it to the mailbox, wait for the reply, send the reply through
//! the transport. Messages that arrive while an exchange is pending wait in the bounded queue fed by
//! the session manager.

use crate::config::MailboxConfig;
use crate::mailbox::{InboundRequest, Mailbox, MailboxError, OutboundReply};
use crate::transport::{ConnectionState, SendError, Transport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Poll cadence and reply timeout for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeSettings {
    pub poll_interval: Duration,
    /// `None` waits indefinitely.
    pub reply_timeout: Option<Duration>,
}

impl ExchangeSettings {
    pub fn from_config(config: &MailboxConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            reply_timeout: config.reply_timeout(),
        }
    }
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self::from_config(&MailboxConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Counters shown on the health endpoint.
#[derive(Debug, Default)]
pub struct ExchangeStats {
    completed: AtomicU64,
    failed: AtomicU64,
    pending: AtomicBool,
}

impl ExchangeStats {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// An exchange is waiting on the external process.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Relaxed)
    }
}

pub struct Bridge {
    mailbox: Arc<dyn Mailbox>,
    transport: Arc<dyn Transport>,
    settings: ExchangeSettings,
    connection: watch::Receiver<ConnectionState>,
    stats: Arc<ExchangeStats>,
}

impl Bridge {
    /// `connection` is the session manager's state; a pending exchange is abandoned when it closes.
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        transport: Arc<dyn Transport>,
        settings: ExchangeSettings,
        connection: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            mailbox,
            transport,
            settings,
            connection,
            stats: Arc::new(ExchangeStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ExchangeStats> {
        Arc::clone(&self.stats)
    }

    /// Run one exchange. The reply is sent exactly once, to the destination the external process
    /// named. On timeout or cancellation the unconsumed request is withdrawn and nothing is sent.
    pub async fn run_exchange(
        &self,
        request: InboundRequest,
        shutdown: &CancellationToken,
    ) -> Result<OutboundReply, ExchangeError> {
        self.mailbox.publish(&request).await?;
        log::info!("bridge: request from {} published", request.user);

        let cancel = shutdown.child_token();
        let watcher = {
            let cancel = cancel.clone();
            let mut connection = self.connection.clone();
            tokio::spawn(async move {
                let _ = connection.wait_for(|s| s.is_closed()).await;
                cancel.cancel();
            })
        };
        let waited = self
            .mailbox
            .await_reply(self.settings.poll_interval, self.settings.reply_timeout, &cancel)
            .await;
        watcher.abort();

        let reply = match waited {
            Ok(reply) => reply,
            Err(e) => {
                match self.mailbox.withdraw().await {
                    Ok(true) => log::debug!("bridge: withdrew unconsumed request from {}", request.user),
                    Ok(false) => {}
                    Err(we) => log::warn!("bridge: withdrawing request failed: {}", we),
                }
                return Err(e.into());
            }
        };

        if reply.to != request.user {
            log::debug!("bridge: reply for {} is addressed to {}", request.user, reply.to);
        }
        self.transport.send_message(&reply.to, &reply.text).await?;
        Ok(reply)
    }

    /// Serve exchanges from `inbound` until shutdown or until the queue closes. A failed exchange is
    /// logged and the loop moves on to the next message.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundRequest>, shutdown: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                r = inbound.recv() => r,
            };
            let Some(request) = next else {
                break;
            };
            let user = request.user.clone();
            self.stats.pending.store(true, Ordering::Relaxed);
            match self.run_exchange(request, &shutdown).await {
                Ok(reply) => {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    log::info!("bridge: reply sent to {}", reply.to);
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("bridge: exchange for {} failed: {}", user, e);
                }
            }
            self.stats.pending.store(false, Ordering::Relaxed);
        }
        log::info!("bridge: orchestrator stopped");
    }
}

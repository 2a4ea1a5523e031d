//! Exchange mailbox: single-slot durable hand-off between the bridge and an external decision process.
//!
//! The bridge publishes one [`InboundRequest`] and waits for one [`OutboundReply`]. Both live as
//! JSON files in a shared directory so either side can restart independently of the other.

mod error;
mod file;
mod slots;

pub use error::MailboxError;
pub use file::{FileMailbox, MailboxRole, RoleLock};
pub use slots::{InboundRequest, OutboundReply};

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Producer side of the mailbox, as used by the bridge orchestrator.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Make `request` the single pending item, replacing any unconsumed one.
    async fn publish(&self, request: &InboundRequest) -> Result<(), MailboxError>;

    /// Wait until a reply appears, then claim and remove it. Fails with `Timeout` or `Cancelled`.
    async fn await_reply(
        &self,
        poll_interval: Duration,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<OutboundReply, MailboxError>;

    /// Remove the pending request if the external process has not consumed it yet.
    async fn withdraw(&self) -> Result<bool, MailboxError>;
}

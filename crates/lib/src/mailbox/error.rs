use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("wait for reply cancelled")]
    Cancelled,
    #[error("malformed {slot} slot: {reason}")]
    Malformed { slot: &'static str, reason: String },
    #[error("mailbox already has a {0} attached")]
    Busy(&'static str),
    #[error("mailbox io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding mailbox item: {0}")]
    Encode(#[from] serde_json::Error),
}

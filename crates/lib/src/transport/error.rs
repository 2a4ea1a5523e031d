#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("transport rejected credentials: {0}")]
    Unauthorized(String),
    #[error("transport unreachable: {0}")]
    Unreachable(String),
    #[error("transport api error: {0}")]
    Api(String),
}

impl AuthError {
    /// Retrying cannot fix a rejected API key.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::Unauthorized(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    #[error("transport disconnected")]
    Disconnected,
    #[error("send failed: {0}")]
    Api(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("session is already registered")]
    AlreadyRegistered,
    #[error("invalid phone number: {0:?}")]
    InvalidNumber(String),
    #[error("pairing code unavailable: {0}")]
    Unavailable(String),
}

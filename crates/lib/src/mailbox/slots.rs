//! Wire shapes of the two mailbox slots.

use serde::{Deserialize, Serialize};

/// Request slot: `{ "user": <sender id>, "text": <message text> }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRequest {
    pub user: String,
    pub text: String,
}

impl InboundRequest {
    pub fn new(user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            text: text.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.user.trim().is_empty() {
            return Err("empty user".to_string());
        }
        if self.text.is_empty() {
            return Err("empty text".to_string());
        }
        Ok(())
    }
}

/// Reply slot: `{ "to": <destination id>, "text": <message text> }`. Its presence means "reply ready".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub to: String,
    pub text: String,
}

impl OutboundReply {
    pub fn new(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            text: text.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.to.trim().is_empty() {
            return Err("empty destination".to_string());
        }
        Ok(())
    }
}

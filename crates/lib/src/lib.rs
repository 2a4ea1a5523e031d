//! wabridge core library: WhatsApp transport, exchange mailbox, session lifecycle and the bridge
//! orchestrator, used by the CLI.

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod init;
pub mod mailbox;
pub mod reconnect;
pub mod responder;
pub mod server;
pub mod session;
pub mod transport;

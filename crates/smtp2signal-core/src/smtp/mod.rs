//! SMTP server module
//!
//! A small SMTP engine: [`SmtpServer`] accepts connections and runs one
//! [`SmtpSession`] per peer. Sessions call back into a [`SessionHandler`] for
//! AUTH decisions and for completed DATA transactions; everything else about
//! the protocol stays inside this module.

mod auth;
mod handler;
mod server;

pub use auth::{AuthOutcome, Credentials, SessionAuthenticator};
pub use handler::SmtpSession;
pub use server::SmtpServer;

use async_trait::async_trait;
use smtp2signal_common::types::Envelope;
use std::fmt;
use std::net::SocketAddr;

/// Callbacks a session makes into the application
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Decide an AUTH attempt
    fn authenticate(
        &self,
        peer: SocketAddr,
        mechanism: &str,
        credentials: &Credentials,
    ) -> AuthOutcome;

    /// Handle a completed DATA transaction and produce the final reply
    async fn handle_data(&self, envelope: Envelope) -> SmtpReply;
}

/// Reply line sent back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub message: String,
}

impl SmtpReply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    /// Transient failure; the client may retry later
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(451, message)
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

//! Common types for smtp2signal

use std::net::SocketAddr;

/// SMTP envelope of one completed mail transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Peer the transaction was received from
    pub peer: SocketAddr,
    /// HELO/EHLO argument, if the client sent one
    pub helo: Option<String>,
    /// MAIL FROM address, empty for the null sender
    pub mail_from: String,
    /// RCPT TO addresses as given by the client
    pub rcpt_to: Vec<String>,
    /// Raw message content after dot-unstuffing
    pub data: Vec<u8>,
}

/// Outbound message for the signal-cli REST API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRequest {
    /// Sender account registered with signal-cli
    pub from_number: String,
    /// Recipients, in the order they were given
    pub to: Vec<String>,
    /// Message text
    pub text: String,
    /// Raw bytes of the forwarded attachment
    pub binary_attachment: Option<Vec<u8>>,
}

/// Shared SMTP AUTH secret
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exact comparison against a presented password
    pub fn matches(&self, password: &str) -> bool {
        self.0 == password
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

//! smtp2signal Core - SMTP reception and Signal delivery
//!
//! This crate accepts authenticated mail over SMTP, derives the Signal
//! message from the recipient address options and the mail content, and
//! hands it to the signal-cli REST API without blocking the SMTP session.

pub mod address;
pub mod credentials;
pub mod dispatch;
pub mod gateway;
pub mod message;
pub mod smtp;
pub mod tasks;

pub use address::{AddressOptions, LineSelector};
pub use credentials::{CredentialStore, TokenOrigin};
pub use dispatch::{DispatchError, DispatchGateway};
pub use gateway::{GatewayHandler, GatewayServer};
pub use message::{MessageBuilder, ParsedMail};
pub use smtp::{SessionHandler, SmtpReply, SmtpServer};
pub use tasks::{DispatchTask, ShutdownReport, TaskRegistry};

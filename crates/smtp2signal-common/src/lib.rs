//! smtp2signal Common - Shared types and utilities
//!
//! This crate provides configuration, error types and the data types
//! shared between the gateway core and the server binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};

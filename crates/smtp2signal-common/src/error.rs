//! Error types for smtp2signal

use thiserror::Error;

/// Main error type for smtp2signal
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The recipient address does not carry a usable option set
    #[error("{0}")]
    Address(String),

    /// No body content could be extracted from the message
    #[error("{0}")]
    Content(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for smtp2signal
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Address(_) => "ADDRESS_ERROR",
            Error::Content(_) => "CONTENT_ERROR",
            Error::Smtp(_) => "SMTP_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_passes_message_through() {
        let err = Error::Address("rcpt is missing to-argument: <from=1@x>".to_string());
        assert_eq!(err.to_string(), "rcpt is missing to-argument: <from=1@x>");
        assert_eq!(err.code(), "ADDRESS_ERROR");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert_eq!(err.code(), "IO_ERROR");
        assert!(err.to_string().contains("gone"));
    }
}

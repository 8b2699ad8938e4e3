//! Shared SMTP AUTH token storage
//!
//! The gateway has a single credential: a random token that every client
//! presents as its password. It is generated on first start and, when a token
//! file is configured, cached there so restarts keep the same value.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use smtp2signal_common::types::AuthToken;
use smtp2signal_common::Result;
use std::path::Path;
use tracing::warn;

/// Length of a generated token in characters
pub const TOKEN_LEN: usize = 16;

/// Where the current token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOrigin {
    Generated,
    Loaded,
}

/// Holds the process-wide auth token
#[derive(Debug, Clone)]
pub struct CredentialStore {
    token: AuthToken,
    origin: TokenOrigin,
}

impl CredentialStore {
    /// Load the token from `token_file`, or generate one and persist it there
    pub fn load_or_generate(token_file: Option<&Path>) -> Result<Self> {
        if let Some(path) = token_file {
            if let Some(token) = read_token(path)? {
                warn!("Loaded auth token from {}", path.display());
                return Ok(Self {
                    token,
                    origin: TokenOrigin::Loaded,
                });
            }
        }

        let token = generate_token();
        warn!("New auth token created. Will be cached if SIGNAL_SMTP_TOKEN_FILE is defined.");
        warn!("Use these credentials: user=(any), password={}", token.as_str());

        if let Some(path) = token_file {
            std::fs::write(path, token.as_str())?;
            warn!("Auth token cached in {}", path.display());
        }

        Ok(Self {
            token,
            origin: TokenOrigin::Generated,
        })
    }

    /// Use a fixed token
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: AuthToken::new(token),
            origin: TokenOrigin::Loaded,
        }
    }

    pub fn current_token(&self) -> &AuthToken {
        &self.token
    }

    pub fn origin(&self) -> TokenOrigin {
        self.origin
    }
}

/// Read the first line of the token file; a missing or blank file yields None
fn read_token(path: &Path) -> Result<Option<AuthToken>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(contents
        .lines()
        .next()
        .filter(|line| !line.is_empty())
        .map(AuthToken::new))
}

fn generate_token() -> AuthToken {
    // 3 bytes encode to 4 base64 characters
    let mut bytes = [0u8; TOKEN_LEN * 3 / 4];
    OsRng.fill_bytes(&mut bytes);
    let mut encoded = URL_SAFE_NO_PAD.encode(bytes);
    encoded.truncate(TOKEN_LEN);
    AuthToken::new(encoded)
}

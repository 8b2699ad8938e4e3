//! SMTP Authentication module

use super::SmtpReply;
use crate::credentials::CredentialStore;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Mechanisms the gateway accepts
const SUPPORTED_MECHANISMS: &[&str] = &["LOGIN", "PLAIN"];

/// Result of an AUTH attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized,
    UnsupportedMechanism,
    BadCredential,
}

impl AuthOutcome {
    /// Reply sent to the client for this outcome
    pub fn reply(&self) -> SmtpReply {
        match self {
            AuthOutcome::Authorized => SmtpReply::new(235, "2.7.0 Authentication successful"),
            AuthOutcome::UnsupportedMechanism => {
                SmtpReply::new(504, "5.5.4 Unrecognized authentication mechanism")
            }
            AuthOutcome::BadCredential => {
                SmtpReply::new(535, "5.7.8 Authentication credentials invalid")
            }
        }
    }
}

/// Username/password pair presented by a client
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Decode an AUTH PLAIN response
    ///
    /// PLAIN format: base64(\0username\0password) or base64(authzid\0authcid\0password)
    pub fn from_plain(response: &str) -> Result<Self, String> {
        let decoded = BASE64
            .decode(response.trim())
            .map_err(|e| format!("invalid base64: {}", e))?;

        let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();

        match parts.as_slice() {
            [authcid, password] | [_, authcid, password] => Ok(Self::new(
                String::from_utf8_lossy(authcid),
                String::from_utf8_lossy(password),
            )),
            _ => Err(format!(
                "invalid credential format, got {} parts",
                parts.len()
            )),
        }
    }

    /// Decode the two AUTH LOGIN responses
    pub fn from_login(username: &str, password: &str) -> Result<Self, String> {
        let decode = |value: &str| {
            BASE64
                .decode(value.trim())
                .map(|d| String::from_utf8_lossy(&d).to_string())
                .map_err(|e| format!("invalid base64: {}", e))
        };

        Ok(Self::new(decode(username)?, decode(password)?))
    }
}

/// Generate base64 encoded challenge for AUTH LOGIN
pub fn login_challenge_username() -> String {
    BASE64.encode(b"Username:")
}

/// Generate base64 encoded challenge for AUTH LOGIN
pub fn login_challenge_password() -> String {
    BASE64.encode(b"Password:")
}

/// Checks AUTH attempts against the shared token
///
/// Any username is accepted; the password must equal the token exactly.
#[derive(Debug, Clone)]
pub struct SessionAuthenticator {
    store: CredentialStore,
}

impl SessionAuthenticator {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }

    pub fn authenticate(
        &self,
        peer: SocketAddr,
        mechanism: &str,
        credentials: &Credentials,
    ) -> AuthOutcome {
        let mechanism = mechanism.to_uppercase();
        if !SUPPORTED_MECHANISMS.contains(&mechanism.as_str()) {
            warn!(
                "unsupported auth mechanism {} attempted by {}",
                mechanism, peer
            );
            return AuthOutcome::UnsupportedMechanism;
        }

        if self.store.current_token().matches(&credentials.password) {
            debug!(
                "AUTH {}: peer {} authenticated as {:?}",
                mechanism, peer, credentials.username
            );
            return AuthOutcome::Authorized;
        }

        warn!("peer {} failed to authenticate", peer);
        AuthOutcome::BadCredential
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TOKEN: &str = "s3cr3t-t0ken-abc";

    fn authenticator() -> SessionAuthenticator {
        SessionAuthenticator::new(CredentialStore::with_token(TOKEN))
    }

    fn peer() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    #[test]
    fn test_login_challenges() {
        assert_eq!(login_challenge_username(), "VXNlcm5hbWU6");
        assert_eq!(login_challenge_password(), "UGFzc3dvcmQ6");
    }

    #[test]
    fn test_plain_with_correct_token_and_any_username() {
        let auth = authenticator();
        for username in ["", "anyone", "user@example.com"] {
            let credentials = Credentials::new(username, TOKEN);
            assert_eq!(
                auth.authenticate(peer(), "PLAIN", &credentials),
                AuthOutcome::Authorized
            );
        }
    }

    #[test]
    fn test_login_with_correct_token() {
        let credentials = Credentials::new("x", TOKEN);
        assert_eq!(
            authenticator().authenticate(peer(), "LOGIN", &credentials),
            AuthOutcome::Authorized
        );
    }

    #[test]
    fn test_mechanism_is_case_insensitive() {
        let credentials = Credentials::new("x", TOKEN);
        assert_eq!(
            authenticator().authenticate(peer(), "plain", &credentials),
            AuthOutcome::Authorized
        );
    }

    #[test]
    fn test_wrong_token_fails() {
        let credentials = Credentials::new("x", "not-the-token");
        assert_eq!(
            authenticator().authenticate(peer(), "PLAIN", &credentials),
            AuthOutcome::BadCredential
        );
    }

    #[test]
    fn test_cram_md5_always_rejected() {
        let auth = authenticator();
        for password in [TOKEN, "", "wrong"] {
            let credentials = Credentials::new("x", password);
            assert_eq!(
                auth.authenticate(peer(), "CRAM-MD5", &credentials),
                AuthOutcome::UnsupportedMechanism
            );
        }
    }

    #[test]
    fn test_outcome_replies() {
        assert_eq!(AuthOutcome::Authorized.reply().code, 235);
        assert_eq!(AuthOutcome::UnsupportedMechanism.reply().code, 504);
        assert_eq!(AuthOutcome::BadCredential.reply().code, 535);
    }

    #[test]
    fn test_decode_plain() {
        let response = BASE64.encode(b"\0user@example.com\0testpass");
        let credentials = Credentials::from_plain(&response).unwrap();
        assert_eq!(credentials, Credentials::new("user@example.com", "testpass"));

        let response = BASE64.encode(b"admin\0user\0pw");
        let credentials = Credentials::from_plain(&response).unwrap();
        assert_eq!(credentials, Credentials::new("user", "pw"));

        assert!(Credentials::from_plain("!!!").is_err());
        assert!(Credentials::from_plain(&BASE64.encode(b"nonul")).is_err());
    }

    #[test]
    fn test_decode_login() {
        let credentials =
            Credentials::from_login(&BASE64.encode("bob"), &BASE64.encode(TOKEN)).unwrap();
        assert_eq!(credentials, Credentials::new("bob", TOKEN));
        assert!(Credentials::from_login("bob", "%%%").is_err());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let rendered = format!("{:?}", Credentials::new("bob", TOKEN));
        assert!(rendered.contains("bob"));
        assert!(!rendered.contains(TOKEN));
    }
}

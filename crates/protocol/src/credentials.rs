//! `Authorization: Basic` credentials exchanged during the handshake.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::zeroize::Zeroizing;
use secrecy::{ExposeSecret, SecretString};

use crate::constants::BASIC_SCHEME;

/// Errors from building or parsing credentials.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialsError {
    #[error("invalid username {0:?}: must not contain ':'")]
    InvalidUsername(String),

    #[error("authorization header is not a Basic credential")]
    InvalidHeader,

    #[error("invalid credential encoding: {0}")]
    InvalidEncoding(String),

    #[error("credential is missing the ':' separator")]
    MissingSeparator,
}

/// A username and password pair. The password is redacted in `Debug`
/// output and zeroized on drop.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, CredentialsError> {
        let username = username.into();
        if username.contains(':') {
            return Err(CredentialsError::InvalidUsername(username));
        }
        Ok(Self {
            username,
            password: SecretString::from(password.into()),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    /// Returns `Basic base64(username:password)`.
    pub fn to_header_value(&self) -> String {
        let password = self.password.expose_secret();
        let mut raw = Zeroizing::new(String::with_capacity(
            self.username.len() + 1 + password.len(),
        ));
        raw.push_str(&self.username);
        raw.push(':');
        raw.push_str(password);
        format!("{BASIC_SCHEME}{}", STANDARD.encode(raw.as_bytes()))
    }

    /// Parses an `Authorization` header value.
    ///
    /// The decoded credential is split on the first `:`, so passwords may
    /// contain colons.
    pub fn from_header_value(value: &str) -> Result<Self, CredentialsError> {
        let encoded = value
            .strip_prefix(BASIC_SCHEME)
            .filter(|rest| !rest.is_empty())
            .ok_or(CredentialsError::InvalidHeader)?;

        let raw = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| CredentialsError::InvalidEncoding(e.to_string()))?,
        );
        let decoded = std::str::from_utf8(&raw)
            .map_err(|e| CredentialsError::InvalidEncoding(e.to_string()))?;

        let (username, password) = decoded
            .split_once(':')
            .ok_or(CredentialsError::MissingSeparator)?;
        Ok(Self {
            username: username.to_owned(),
            password: SecretString::from(password.to_owned()),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

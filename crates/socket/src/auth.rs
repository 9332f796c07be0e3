//! Handshake admission: credential checks and the authenticator seam.

use std::net::{IpAddr, SocketAddr};

use javelin_protocol::{Credentials, CredentialsError};
use secrecy::SecretString;

/// Validates a username / password pair presented during the handshake.
///
/// Called on the connection's I/O task; implementations may block briefly
/// (for example to hash the password).
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, username: &str, password: &SecretString) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(&str, &SecretString) -> bool + Send + Sync + 'static,
{
    fn authenticate(&self, username: &str, password: &SecretString) -> bool {
        self(username, password)
    }
}

/// An authenticator backed by a managed, persistent user list.
pub trait UserAuthenticator: Authenticator {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Adds a user, or replaces the password of an existing one.
    fn save_user(&self, username: &str, password: &SecretString) -> Result<(), Self::Error>;

    fn exists_user(&self, username: &str) -> bool;

    fn count_users(&self) -> usize;

    fn find_all_users(&self) -> Vec<String>;

    fn delete_user(&self, username: &str) -> Result<(), Self::Error>;

    fn delete_all_users(&self) -> Result<(), Self::Error>;
}

/// Why a handshake was refused. The `Display` text is sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Invalid Authorization header")]
    InvalidHeader,

    #[error("Invalid credential format")]
    InvalidFormat,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Already connected")]
    AlreadyConnected,
}

/// Resolves the identity of a connecting peer from its `Authorization`
/// header.
///
/// With `trusted` set (a loopback peer on a server allowing local
/// connections) no verification happens: a well-formed header still names
/// the identity, anything else is admitted anonymously. Returns `None` for
/// anonymous peers.
pub(crate) fn authorize(
    header: Option<&str>,
    authenticator: &dyn Authenticator,
    trusted: bool,
) -> Result<Option<String>, AdmissionError> {
    if trusted {
        let identity = header
            .and_then(|value| Credentials::from_header_value(value).ok())
            .map(|creds| creds.username().to_owned());
        return Ok(identity);
    }

    let value = header.ok_or(AdmissionError::InvalidHeader)?;
    let creds = Credentials::from_header_value(value).map_err(|e| match e {
        CredentialsError::InvalidHeader => AdmissionError::InvalidHeader,
        _ => AdmissionError::InvalidFormat,
    })?;

    if !authenticator.authenticate(creds.username(), creds.password()) {
        return Err(AdmissionError::InvalidCredentials);
    }
    Ok(Some(creds.username().to_owned()))
}

/// Whether `addr` is a loopback peer. IPv4-mapped IPv6 loopback and the
/// unspecified address count as local.
pub(crate) fn is_local(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_loopback() || ip.is_unspecified(),
        IpAddr::V6(ip) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || ip.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn bob_only(username: &str, password: &SecretString) -> bool {
        username == "bob" && password.expose_secret() == "secret"
    }

    fn header(user: &str, pass: &str) -> String {
        Credentials::new(user, pass).unwrap().to_header_value()
    }

    #[test]
    fn valid_credentials_name_the_identity() {
        let value = header("bob", "secret");
        assert_eq!(
            authorize(Some(&value), &bob_only, false),
            Ok(Some("bob".into()))
        );
    }

    #[test]
    fn missing_header() {
        assert_eq!(
            authorize(None, &bob_only, false),
            Err(AdmissionError::InvalidHeader)
        );
    }

    #[test]
    fn non_basic_header() {
        assert_eq!(
            authorize(Some("Bearer token"), &bob_only, false),
            Err(AdmissionError::InvalidHeader)
        );
    }

    #[test]
    fn undecodable_credential() {
        assert_eq!(
            authorize(Some("Basic %%%"), &bob_only, false),
            Err(AdmissionError::InvalidFormat)
        );
        // base64("nocolon")
        assert_eq!(
            authorize(Some("Basic bm9jb2xvbg=="), &bob_only, false),
            Err(AdmissionError::InvalidFormat)
        );
    }

    #[test]
    fn wrong_password() {
        let value = header("bob", "nope");
        assert_eq!(
            authorize(Some(&value), &bob_only, false),
            Err(AdmissionError::InvalidCredentials)
        );
    }

    #[test]
    fn trusted_peer_skips_verification() {
        let value = header("mallory", "whatever");
        assert_eq!(
            authorize(Some(&value), &bob_only, true),
            Ok(Some("mallory".into()))
        );
        assert_eq!(authorize(None, &bob_only, true), Ok(None));
        assert_eq!(authorize(Some("garbage"), &bob_only, true), Ok(None));
    }

    #[test]
    fn rejection_reasons() {
        assert_eq!(
            AdmissionError::InvalidHeader.to_string(),
            "Invalid Authorization header"
        );
        assert_eq!(
            AdmissionError::InvalidFormat.to_string(),
            "Invalid credential format"
        );
        assert_eq!(
            AdmissionError::InvalidCredentials.to_string(),
            "Invalid credentials"
        );
        assert_eq!(AdmissionError::AlreadyConnected.to_string(), "Already connected");
    }

    #[test]
    fn local_addresses() {
        let local = |s: &str| is_local(&s.parse().unwrap());
        assert!(local("127.0.0.1:9000"));
        assert!(local("127.8.9.10:9000"));
        assert!(local("0.0.0.0:9000"));
        assert!(local("[::1]:9000"));
        assert!(local("[::]:9000"));
        assert!(local("[::ffff:127.0.0.1]:9000"));
        assert!(!local("192.168.1.20:9000"));
        assert!(!local("[::ffff:10.0.0.1]:9000"));
        assert!(!local("[2001:db8::1]:9000"));
    }
}

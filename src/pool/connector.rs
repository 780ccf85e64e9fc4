//! The seam between the pool and the SSH transport.
//!
//! The pool only needs to dial, probe and close connections. Keeping those
//! behind [`Connector`] lets the pool's refcounting, retry and race handling
//! run against an in-memory transport in tests.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::{PoolError, PoolKey};
use crate::config::SshConfig;

/// One way of authenticating, tried in order.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    PublicKey(PathBuf),
    Password(String),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::PublicKey(path) => f.debug_tuple("PublicKey").field(path).finish(),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Authentication methods for `config`: key file first, then password.
pub fn auth_methods(config: &SshConfig) -> Result<Vec<AuthMethod>, PoolError> {
    let mut methods = Vec::new();
    if let Some(key_file) = config.key_file.as_deref().filter(|k| !k.is_empty()) {
        methods.push(AuthMethod::PublicKey(expand_home(key_file)));
    }
    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
        methods.push(AuthMethod::Password(password.to_string()));
    }
    if methods.is_empty() {
        return Err(PoolError::NoAuthMethod(PoolKey::from_config(config).to_string()));
    }
    Ok(methods)
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// A single failed dial attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

impl DialError {
    /// Only transient network failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, DialError::Network(_))
    }

    /// Classify a transport error by walking its source chain.
    pub fn classify(err: &(dyn std::error::Error + 'static)) -> Self {
        if is_transient_network_error(err) {
            DialError::Network(err.to_string())
        } else {
            DialError::Other(err.to_string())
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "connection aborted",
    "no route to host",
    "network is unreachable",
    "network unreachable",
    "temporary failure",
];

/// Timeouts, refused/reset connections, unreachable hosts or networks, and
/// resolver "temporary failure"s.
pub fn is_transient_network_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            if matches!(
                io.kind(),
                TimedOut | ConnectionRefused | ConnectionReset | ConnectionAborted
            ) {
                return true;
            }
        }
        if is_transient_message(&e.to_string()) {
            return true;
        }
        current = e.source();
    }
    false
}

pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
}

/// Dials, probes and closes transport connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    /// One dial attempt, authenticated with the first accepted method.
    async fn connect(
        &self,
        key: &PoolKey,
        auth: &[AuthMethod],
        timeout: Duration,
    ) -> Result<Self::Connection, DialError>;

    /// Cheap keep-alive round trip.
    async fn is_alive(&self, conn: &Self::Connection) -> bool;

    async fn close(&self, conn: &Self::Connection);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_auth_methods_order() {
        let mut config = SshConfig::new("h", "u");
        config.key_file = Some("/keys/id".to_string());
        config.password = Some("secret".to_string());

        let methods = auth_methods(&config).unwrap();
        assert_eq!(
            methods,
            vec![
                AuthMethod::PublicKey(PathBuf::from("/keys/id")),
                AuthMethod::Password("secret".to_string()),
            ]
        );
        assert!(!format!("{:?}", methods).contains("secret"));
    }

    #[test]
    fn test_no_auth_method() {
        let config = SshConfig::new("h", "u");
        let err = auth_methods(&config).unwrap_err();
        assert!(matches!(err, PoolError::NoAuthMethod(ref k) if k == "u@h:22"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/key"), PathBuf::from("/abs/key"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/.ssh/id"), home.join(".ssh/id"));
        }
    }

    #[test]
    fn test_classify_io_errors() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(DialError::classify(&refused).is_transient());

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "bad key");
        assert!(!DialError::classify(&denied).is_transient());
    }

    #[test]
    fn test_classify_messages() {
        assert!(is_transient_message("dial tcp: No route to host"));
        assert!(is_transient_message("Temporary failure in name resolution"));
        assert!(is_transient_message("connect: network is unreachable"));
        assert!(!is_transient_message("unable to authenticate"));
        assert!(!DialError::Auth("rejected".into()).is_transient());
    }
}

//! Error types for the x2go client engine.

use thiserror::Error;

/// Main error type for x2go operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH authentication failed against the server.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// An encrypted private key needs a passphrase to be unlocked.
    #[error("password required to unlock private key")]
    PasswordRequired,

    /// The server host key was rejected by the host-key callback.
    #[error("host key rejected for [{host}]:{port}")]
    HostKeyRejected { host: String, port: u16 },

    /// The intermediate SSH proxy could not be set up.
    #[error("ssh proxy failed: {message}")]
    ProxyFailed { message: String },

    /// Authentication against the intermediate SSH proxy failed.
    #[error("ssh proxy authentication failed")]
    ProxyAuthFailed,

    /// The remote user has no home directory on the server.
    #[error("remote home directory does not exist")]
    RemoteHomeMissing,

    /// The SSH transport dropped (socket error, EOF, channel loss).
    #[error("control session transport lost: {message}")]
    TransportLost { message: String },

    /// The control session has already been marked dead.
    #[error("control session is dead")]
    SessionDead,

    /// An exec or SFTP deadline expired; fatal for the control session.
    #[error("operation timed out")]
    Timeout,

    /// A list command timed out; recoverable, the transport stays up.
    #[error("{command} command timed out")]
    ListTimeout { command: &'static str },

    /// Session listing output stayed corrupt for all retry attempts.
    #[error("session listing corrupt after {attempts} attempts")]
    ListingCorrupted { attempts: u32 },

    /// Malformed server output.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The SFTP subsystem could not be initialized on the transport.
    #[error("failed to initialize SFTP channel")]
    SftpUnavailable,

    /// Session startup or resumption failed on the server side.
    #[error("failed to start x2go session: {message}")]
    StartupFailed { message: String },

    /// The owner of a shared desktop declined the sharing request.
    #[error("desktop sharing denied by the remote user")]
    SharingDenied,

    /// The session command does not exist on the server.
    #[error("no such command on server: {command}")]
    NoSuchCommand { command: String },

    /// The remote user is not permitted to run x2go commands.
    #[error("remote user {username} is not allowed to run x2go commands")]
    NotPermitted { username: String },

    /// The server failed to re-allocate the graphics port on resume.
    #[error("failed to retrieve new graphics port from server")]
    PortReallocationFailed,

    /// A reverse forwarding tunnel could not be established.
    #[error("tunnel failed: {message}")]
    TunnelFailed { message: String },

    /// No session is registered under the given identifier.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Invalid session state for the requested operation.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl Error {
    /// Returns true if this error is terminal for the owning control session.
    ///
    /// Transport-class failures require a full reconnect; there is no
    /// automatic retry on a dead control session.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            Error::TransportLost { .. }
                | Error::SessionDead
                | Error::Timeout
                | Error::ListingCorrupted { .. }
                | Error::Io(_)
        )
    }

    /// Returns true if this error only degrades a single feature.
    ///
    /// Resource-class errors (SFTP, sound/sshfs port loss, tunnels) disable
    /// the affected feature via a hook and never abort session startup.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Error::SftpUnavailable | Error::TunnelFailed { .. } | Error::ListTimeout { .. }
        )
    }
}

/// Convenience result type for x2go operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_listing_corrupted() {
        let err = Error::ListingCorrupted { attempts: 20 };
        assert_eq!(err.to_string(), "session listing corrupt after 20 attempts");
    }

    #[test]
    fn error_display_host_key() {
        let err = Error::HostKeyRejected {
            host: "server.example".into(),
            port: 22,
        };
        assert_eq!(err.to_string(), "host key rejected for [server.example]:22");
    }

    #[test]
    fn transport_fatal_errors() {
        assert!(Error::Timeout.is_transport_fatal());
        assert!(Error::SessionDead.is_transport_fatal());
        assert!(Error::TransportLost {
            message: "eof".into()
        }
        .is_transport_fatal());
        assert!(Error::ListingCorrupted { attempts: 20 }.is_transport_fatal());

        // these must not kill the control session
        assert!(!Error::ListTimeout {
            command: "x2golistdesktops"
        }
        .is_transport_fatal());
        assert!(!Error::SftpUnavailable.is_transport_fatal());
        assert!(!Error::SharingDenied.is_transport_fatal());
    }

    #[test]
    fn degradable_errors() {
        assert!(Error::SftpUnavailable.is_degradable());
        assert!(Error::TunnelFailed {
            message: "denied".into()
        }
        .is_degradable());
        assert!(!Error::AuthenticationFailed.is_degradable());
        assert!(!Error::PortReallocationFailed.is_degradable());
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_transport_fatal());
    }
}

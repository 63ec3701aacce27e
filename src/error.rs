//! Error types for the gateway.

/// Custom error types for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Authentication failed; carries the username, never the password.
    #[error("Authentication failed for '{0}'")]
    AuthFailed(String),

    /// Invalid configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unsupported protocol input from a client.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Upstream dial failure.
    #[error("Dial to '{0}' failed: {1}")]
    Dial(String, String),

    /// Session hit its traffic limit.
    #[error("Traffic quota exhausted")]
    QuotaExhausted,

    /// Graceful teardown in progress.
    #[error("Shutdown requested")]
    Shutdown,

    /// Underlying SSH protocol error
    #[error("SSH protocol error: {0}")]
    SshError(#[from] russh::Error),

    /// Account database error
    #[error("Database error: {0}")]
    DbError(#[from] rusqlite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

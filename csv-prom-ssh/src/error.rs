/// Retryable per-target SSH failures (spec §7: `ssh_timeout`,
/// `ssh_connection_error`, `ssh_auth_error`, `socket_error`). All variants
/// are non-fatal: the scraper logs and enters `cooldown`.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("connect timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection error: {0}")]
    Connection(#[source] russh::Error),

    #[error("authentication was rejected for user {user:?}")]
    Auth { user: String },

    #[error("socket error: {0}")]
    Socket(#[source] std::io::Error),

    #[error("remote command exited with status {0}")]
    NonZeroExit(u32),

    #[error("{0}")]
    Other(String),
}

/// Why a `LogParser::run` call returned (spec §4.3 point 5/6).
#[derive(Debug, PartialEq, Eq)]
pub enum ParserExit {
    /// The underlying stream reported end-of-stream cleanly.
    EndOfStream,
    /// No record-read progress within the configured read timeout.
    StreamStarvation,
    /// The cancellation signal fired at a suspension point.
    Cancelled,
}

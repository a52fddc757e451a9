//! Errors surfaced by the transports, the firmware transfer and the session.

use std::io;

/// Everything that can go wrong while talking to the device.
///
/// Link failures (`Connect`, `Timeout`, `Io`) are recoverable at the session
/// level: they move the session into reconnection instead of terminating it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Connected, but the device gave no (or a bad) reply to `AUTH`.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The upload was aborted, either by the device refusing it or by the
    /// client after a write failure.
    #[error("transfer aborted: {0}")]
    ProtocolAbort(String),

    /// Required capability roles could not be bound on the wireless peer.
    #[error("missing capabilities: {0}")]
    Resolution(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("no active channel")]
    NotConnected,

    #[error("a firmware upload is already in progress")]
    UploadInProgress,

    #[error("invalid firmware image: {0}")]
    InvalidImage(String),

    /// Failure reported by the BLE backend.
    #[error("wireless error: {0}")]
    Wireless(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for the errors that mean the link itself is gone (or unusable) and
    /// the session should reconnect.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Error::Connect(_) | Error::Timeout(_) | Error::Io(_) | Error::Wireless(_)
        )
    }
}

impl From<btleplug::Error> for Error {
    fn from(err: btleplug::Error) -> Self {
        Error::Wireless(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout("wireless operation".into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn link_failures_are_recoverable() {
    assert!(Error::Connect("refused".into()).is_link_failure());
    assert!(Error::Timeout("reply".into()).is_link_failure());
    assert!(Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")).is_link_failure());
    assert!(!Error::Resolution("command-in".into()).is_link_failure());
    assert!(!Error::UploadInProgress.is_link_failure());
}

#[test]
fn display_carries_context() {
    let err = Error::ProtocolAbort("header rejected".into());
    assert_eq!(err.to_string(), "transfer aborted: header rejected");
}

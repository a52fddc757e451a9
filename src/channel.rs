//! The transport capability the session talks through.
//!
//! Two concrete forms exist and the set is closed: a line-framed byte-stream
//! channel ([`StreamChannel`]) and a characteristic-addressed channel
//! ([`CharacteristicChannel`]) where commands and replies travel over distinct
//! endpoints.
//!
//! Channels never retry on their own. A timeout or an I/O error is reported
//! to the caller, which owns the retry budget.

mod characteristic;
mod stream;

use std::fmt;

use log::debug;

use crate::{capabilities::Role, error::Result};

pub use characteristic::{CharacteristicChannel, GattLink, Notification};
pub use stream::{StreamChannel, StreamLink, TcpLink};

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportKind {
    /// Connection-oriented octet stream, newline-framed text replies.
    Stream,
    /// Named endpoints with separate write and notify paths.
    Characteristic,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("tcp"),
            TransportKind::Characteristic => f.write_str("ble"),
        }
    }
}

/// Operations common to both channel forms.
pub trait Channel: Send {
    fn kind(&self) -> TransportKind;

    /// Send one command line and wait (bounded) for its reply line.
    fn send_command(&mut self, text: &str) -> Result<String>;

    /// Write a block of binary payload as-is.
    fn write_bulk(&mut self, bytes: &[u8]) -> Result<()>;

    /// Enable push messages for `role`. Fails with
    /// [`Error::NotSupported`](crate::Error::NotSupported) on transports
    /// without a push path.
    fn subscribe(&mut self, role: Role) -> Result<()>;

    /// One bounded read of whatever `role` currently holds.
    fn read_once(&mut self, role: Role) -> Result<String>;

    fn is_open(&self) -> bool;

    /// Release the transport. Idempotent, never fails.
    fn close(&mut self);
}

/// Drop the outcome of a best-effort cleanup call, logging a failure at
/// `debug` level only.
pub(crate) fn close_quietly<E: fmt::Display>(what: &str, result: std::result::Result<(), E>) {
    if let Err(e) = result {
        debug!("ignoring error while closing {}: {}", what, e);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn close_quietly_swallows_errors() {
    close_quietly("nothing", Ok::<(), String>(()));
    close_quietly("socket", Err("already closed"));
}

#[test]
fn transport_kind_display() {
    assert_eq!(TransportKind::Stream.to_string(), "tcp");
    assert_eq!(TransportKind::Characteristic.to_string(), "ble");
}

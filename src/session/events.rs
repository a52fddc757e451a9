//! Events for the session state machine.
//!
//! This module is private and restricted to the [`session`](crate::session)
//! scope. The public interface of the state machine is provided by
//! [`session`](crate::session).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use crate::channel::{CharacteristicChannel, StreamChannel};

// =============================================================================
// Crate-Public Interface
// =============================================================================

// StreamUpEvent ===============================================================

/// Fired when a byte-stream channel has been opened and authenticated.
///
/// This event can happen under one of the following circumstances:
///
///  1. From `Init` or `Reconnecting`, when one of the bounded TCP attempts
///     succeeds.
///  2. From `WirelessConnected`, when the Wi-Fi-up signal fired and the TCP
///     dial that followed it succeeded.
///  3. From either connected state, after a firmware upload, when the device
///     came back over TCP.
#[derive(Debug)]
pub(crate) struct StreamUpEvent {
    pub channel: StreamChannel,
    /// Command to send again on the new channel, its first delivery having
    /// failed with the link.
    pub replay: Option<String>,
}

// WirelessUpEvent =============================================================

/// Fired when the device was found over BLE, its capabilities resolved and
/// the `AUTH` exchange done.
///
/// Happens from `Init` or `Reconnecting` once the TCP attempts are exhausted,
/// or during the post-upload recovery when the device shows up over BLE
/// first.
#[derive(Debug)]
pub(crate) struct WirelessUpEvent {
    pub channel: CharacteristicChannel,
}

// LinkLostEvent ===============================================================

/// Fired when the active channel failed (I/O error, timeout, keepalive) or
/// when a connect cycle could reach the device over neither transport. It
/// triggers a transition to the `Reconnecting` state.
#[derive(Debug)]
pub(crate) struct LinkLostEvent {
    pub reason: String,
    pub replay: Option<String>,
}

// QuitEvent ===================================================================

/// Fired on an explicit quit command, when the console input is closed, or
/// when the configured number of failed connect cycles has been reached.
#[derive(Debug)]
pub(crate) struct QuitEvent {
    pub with_error: bool,
}

// ExitEvent ===================================================================

/// The last event of a session: the run loop terminates with an exit status
/// after it.
#[derive(Debug)]
pub(crate) struct ExitEvent {
    pub with_error: bool,
}

// Events enum =================================================================

/// Events that can be triggered within the session state machine.
///
/// Each value holds an `event` struct carrying the data handed over from the
/// origin state to the target state.
#[derive(Debug)]
pub(crate) enum Event {
    StreamUp(StreamUpEvent),
    WirelessUp(WirelessUpEvent),
    LinkLost(LinkLostEvent),
    Quit(QuitEvent),
    Exit(ExitEvent),
}

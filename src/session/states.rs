//! States for the session state machine.
//!
//! This module is private and restricted to the [`session`](crate::session)
//! scope. The public interface of the state machine is provided by
//! [`session`](crate::session).
//!
//! ```ignore
//! use super::events::*;
//! ```
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::time::{Duration, Instant};

use log::{debug, info, trace};

use super::{events::*, link::Context};
use crate::{
    capabilities::Role,
    channel::{Channel, CharacteristicChannel, StreamChannel},
    command::Command,
    error::{Error, Result},
    transfer::{self, TransferJob, TransferReport},
    transports::Transports,
    utils::{status, Tone},
};

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a transient state to be `run` after a
/// transition into it.
pub(crate) trait Runnable<T: Transports> {
    /// During this call, the state does whatever work it needs to do and, when
    /// finished, requests the transition to a new state by returning the
    /// appropriate `event`. The `event` is then consumed to create the new
    /// `state` using the corresponding `From` trait implementation.
    fn run(&mut self, ctx: &mut Context<T>) -> Event;
}

/// Trait for the states holding a channel: they wait for console commands and
/// for ticks instead of running to completion.
pub(crate) trait Connected<T: Transports> {
    /// Handle one console command. `line` is the text as typed.
    fn handle(&mut self, ctx: &mut Context<T>, command: Command, line: &str) -> Outcome;

    /// Push a firmware image over the active channel.
    fn upload(&mut self, ctx: &mut Context<T>, job: &TransferJob) -> UploadOutcome;

    /// Periodic housekeeping while the console is idle.
    fn tick(&mut self, ctx: &mut Context<T>) -> Option<Event>;
}

/// Result of a console command: the text to show and, when the command
/// changed the link, the event to apply.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub display: String,
    pub event: Option<Event>,
}

impl Outcome {
    fn show(display: impl Into<String>) -> Self {
        Outcome {
            display: display.into(),
            event: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct UploadOutcome {
    pub result: Result<TransferReport>,
    /// Where the reboot recovery landed.
    pub event: Event,
}

// Init State ==================================================================

/// Represents the initial state of the session state machine.
///
/// From the `InitState`, the state machine can evolve via the following
/// transitions:
///
///  * **`StreamUpEvent` => `StreamConnectedState`** when one of the TCP
///    attempts connects,
///  * **`WirelessUpEvent` => `WirelessConnectedState`** when TCP is exhausted
///    and the device is reached over BLE,
///  * **`LinkLostEvent` => `ReconnectingState`** when neither worked,
///  * **`QuitEvent` => `TerminatedState`** when the recovery cap is reached.
#[derive(Debug)]
pub(crate) struct InitState {}
impl<T: Transports> Runnable<T> for InitState {
    fn run(&mut self, ctx: &mut Context<T>) -> Event {
        info!("=> Init");
        let (connect_timeout, reply_timeout) =
            (ctx.settings.connect_timeout, ctx.settings.auth_timeout);
        ctx.establish(connect_timeout, reply_timeout, None)
    }
}

// Reconnecting State ==========================================================

/// Same transitions as the `InitState`, with the shorter recovery timeouts
/// and the command to replay, if any.
#[derive(Debug)]
pub(crate) struct ReconnectingState {
    pub reason: String,
    pub replay: Option<String>,
}
impl<T: Transports> Runnable<T> for ReconnectingState {
    fn run(&mut self, ctx: &mut Context<T>) -> Event {
        info!("=> Reconnecting");
        status(Tone::Warn, format!("[FC] link lost: {}", self.reason));
        let (connect_timeout, reply_timeout) = (
            ctx.settings.recovery_connect_timeout,
            ctx.settings.recovery_reply_timeout,
        );
        ctx.establish(connect_timeout, reply_timeout, self.replay.take())
    }
}

// StreamConnected State =======================================================

#[derive(Debug)]
pub(crate) struct StreamConnectedState {
    pub channel: StreamChannel,
    /// Command to send again once, right after entering the state.
    pub pending: Option<String>,
}

impl StreamConnectedState {
    /// Send the pending command, if any. A replay that fails again is not
    /// replayed a second time.
    pub fn replay<T: Transports>(&mut self, ctx: &mut Context<T>) -> Option<Outcome> {
        let line = self.pending.take()?;
        status(Tone::Plain, format!("[FC] replaying `{}`", line));
        let mut outcome = self.submit(ctx, line);
        if let Some(Event::LinkLost(ev)) = &mut outcome.event {
            ev.replay = None;
        }
        Some(outcome)
    }

    fn submit<T: Transports>(&mut self, ctx: &mut Context<T>, text: String) -> Outcome {
        ctx.touch();
        match self.channel.send_command(&text) {
            Ok(reply) => Outcome::show(reply),
            Err(e) if e.is_link_failure() => {
                self.channel.close();
                Outcome {
                    display: String::new(),
                    event: Some(Event::LinkLost(LinkLostEvent {
                        reason: e.to_string(),
                        replay: Some(text),
                    })),
                }
            }
            Err(e) => Outcome::show(format!("[FC] {}", e)),
        }
    }

    fn lost(&mut self, reason: String) -> Option<Event> {
        self.channel.close();
        Some(Event::LinkLost(LinkLostEvent {
            reason,
            replay: None,
        }))
    }
}

impl<T: Transports> Connected<T> for StreamConnectedState {
    /// Everything goes to the device as text, `SETWIFI` included.
    fn handle(&mut self, ctx: &mut Context<T>, command: Command, line: &str) -> Outcome {
        let text = match command {
            Command::SetWifi { ssid, password } => format!("SETWIFI {} {}", ssid, password),
            Command::Raw(text) => text,
            _ => line.trim().to_string(),
        };
        self.submit(ctx, text)
    }

    /// The channel is closed by the transfer whatever the outcome, so both
    /// paths end in the reboot recovery.
    fn upload(&mut self, ctx: &mut Context<T>, job: &TransferJob) -> UploadOutcome {
        let result = transfer::stream::upload(&mut self.channel, job, &ctx.settings);
        let event = ctx.recover_after_upload();
        UploadOutcome { result, event }
    }

    /// `PING` when the link has been idle for a keepalive interval, once the
    /// grace period after connecting has passed.
    fn tick(&mut self, ctx: &mut Context<T>) -> Option<Event> {
        let now = Instant::now();
        if now.duration_since(ctx.connected_at) < ctx.settings.keepalive_grace
            || now.duration_since(ctx.last_activity) < ctx.settings.keepalive_interval
        {
            return None;
        }
        ctx.touch();
        match self
            .channel
            .send_command_with_timeout("PING", ctx.settings.keepalive_timeout)
        {
            Ok(reply) if reply.eq_ignore_ascii_case("PONG") => {
                trace!("keepalive ok");
                None
            }
            Ok(reply) => self.lost(format!("keepalive answered {:?}", reply)),
            Err(e) => self.lost(format!("keepalive failed: {}", e)),
        }
    }
}

// WirelessConnected State =====================================================

#[derive(Debug)]
pub(crate) struct WirelessConnectedState {
    pub channel: CharacteristicChannel,
}

impl WirelessConnectedState {
    /// Dial TCP after a Wi-Fi-up signal. On success the BLE channel is closed
    /// and control goes to the byte-stream.
    fn hand_over<T: Transports>(&mut self, ctx: &mut Context<T>) -> Option<Event> {
        let channel = ctx.stream_after_wifi()?;
        self.channel.close();
        Some(Event::StreamUp(StreamUpEvent {
            channel,
            replay: None,
        }))
    }

    fn failed(&mut self, e: Error) -> Outcome {
        if e.is_link_failure() {
            self.channel.close();
            Outcome {
                display: String::new(),
                event: Some(Event::LinkLost(LinkLostEvent {
                    reason: e.to_string(),
                    replay: None,
                })),
            }
        } else {
            Outcome::show(format!("[BLE] {}", e))
        }
    }

    fn set_wifi<T: Transports>(
        &mut self,
        ctx: &mut Context<T>,
        ssid: &str,
        password: &str,
    ) -> Outcome {
        ctx.signal.begin_wait();
        ctx.signal.open_grace_window(ctx.settings.wifi_grace);
        if let Err(e) = self.channel.set_wifi(ssid, password) {
            return self.failed(e);
        }
        let wait = ctx.settings.wifi_up_timeout;
        status(
            Tone::Plain,
            format!("[BLE] SETWIFI {} sent, waiting up to {:?} for wifi", ssid, wait),
        );
        if !ctx.signal.wait(wait) {
            return Outcome::show(format!("[BLE] no wifi-up within {:?}, staying on BLE", wait));
        }
        match self.hand_over(ctx) {
            Some(event) => Outcome {
                display: "[FC] wifi up, now on tcp".into(),
                event: Some(event),
            },
            None => Outcome::show("[BLE] wifi up, tcp unreachable"),
        }
    }

    fn read_sensor(&mut self) -> Outcome {
        if self.channel.capabilities().sensor.is_none() {
            return Outcome::show("[BLE] device has no sensor endpoint");
        }
        match self.channel.read_once(Role::Sensor) {
            Ok(value) if value.is_empty() => Outcome::show("[BLE][DHT] (empty)"),
            Ok(value) => Outcome::show(format!("[BLE][DHT] {}", value)),
            Err(e) => self.failed(e),
        }
    }
}

impl<T: Transports> Connected<T> for WirelessConnectedState {
    fn handle(&mut self, ctx: &mut Context<T>, command: Command, line: &str) -> Outcome {
        ctx.touch();
        match command {
            Command::SetWifi { ssid, password } => self.set_wifi(ctx, &ssid, &password),
            Command::SensorRead => self.read_sensor(),
            command => {
                let text = match command {
                    Command::Raw(text) => text,
                    _ => line.trim().to_string(),
                };
                match self.channel.send_command(&text) {
                    Ok(reply) => Outcome::show(reply),
                    Err(Error::Timeout(_)) => Outcome::show("(no reply)"),
                    Err(e) => self.failed(e),
                }
            }
        }
    }

    /// The GATT link is dropped whatever the outcome: after an ABORT the
    /// device may be resetting its OTA state, so both paths end in the reboot
    /// recovery.
    fn upload(&mut self, ctx: &mut Context<T>, job: &TransferJob) -> UploadOutcome {
        let result = transfer::characteristic::upload(&mut self.channel, job, &ctx.settings);
        self.channel.close();
        let event = ctx.recover_after_upload();
        UploadOutcome { result, event }
    }

    /// Echo unsolicited status lines and follow a Wi-Fi-up signal that fired
    /// on its own.
    fn tick(&mut self, ctx: &mut Context<T>) -> Option<Event> {
        for line in self.channel.take_unsolicited() {
            status(Tone::Plain, format!("[BLE] {}", line));
        }
        if ctx.signal.wait(Duration::ZERO) {
            debug!("wifi-up observed while idle on BLE");
            return self.hand_over(ctx);
        }
        None
    }
}

// Terminated State ============================================================

#[derive(Debug, Copy, Clone)]
pub(crate) struct TerminatedState {
    pub with_error: bool,
    pub should_exit: bool,
}
impl<T: Transports> Runnable<T> for TerminatedState {
    fn run(&mut self, _ctx: &mut Context<T>) -> Event {
        info!(
            "=> Terminated with{}errors",
            if self.with_error { " " } else { " no " }
        );
        Event::Exit(ExitEvent {
            with_error: self.with_error,
        })
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<StreamUpEvent> for StreamConnectedState {
    fn from(event: StreamUpEvent) -> StreamConnectedState {
        StreamConnectedState {
            channel: event.channel,
            pending: event.replay,
        }
    }
}

impl From<WirelessUpEvent> for WirelessConnectedState {
    fn from(event: WirelessUpEvent) -> WirelessConnectedState {
        WirelessConnectedState {
            channel: event.channel,
        }
    }
}

impl From<LinkLostEvent> for ReconnectingState {
    fn from(event: LinkLostEvent) -> ReconnectingState {
        ReconnectingState {
            reason: event.reason,
            replay: event.replay,
        }
    }
}

impl From<QuitEvent> for TerminatedState {
    fn from(event: QuitEvent) -> TerminatedState {
        TerminatedState {
            with_error: event.with_error,
            should_exit: false,
        }
    }
}
impl From<ExitEvent> for TerminatedState {
    fn from(event: ExitEvent) -> TerminatedState {
        TerminatedState {
            with_error: event.with_error,
            should_exit: true,
        }
    }
}

//! Reaching the device: the bounded TCP dial, the BLE fallback and the
//! post-upload recovery poll.
//!
//! These helpers are shared by the session states. They never keep a channel
//! for themselves: whatever they open is handed over to the next state inside
//! the returned [`Event`].

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};
use retry::{delay, retry_with_index};

use super::events::*;
use crate::{
    capabilities::{CapabilityMap, ServiceInfo},
    channel::{close_quietly, Channel, CharacteristicChannel, StreamChannel},
    error::{Error, Result},
    locator::{locate, quick_probe, DeviceIdentity},
    settings::Settings,
    transports::{Transports, WirelessLink},
    utils::{spinner, status, Tone},
    wifi::WifiUpSignal,
};

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Data shared by all the states of a session: the settings, the transports
/// and the Wi-Fi-up signal the notification listener fires.
pub(crate) struct Context<T: Transports> {
    pub settings: Settings,
    pub transports: T,
    pub signal: Arc<WifiUpSignal>,
    identity: DeviceIdentity,
    /// Consecutive connect cycles that reached the device over neither
    /// transport.
    recovery_cycles: u32,
    pub last_activity: Instant,
    pub connected_at: Instant,
}

impl<T: Transports> Context<T> {
    pub fn new(settings: Settings, transports: T) -> Self {
        let identity = DeviceIdentity::new(settings.ble_address.as_deref(), &settings.ble_names);
        let now = Instant::now();
        Context {
            settings,
            transports,
            signal: Arc::new(WifiUpSignal::new()),
            identity,
            recovery_cycles: 0,
            last_activity: now,
            connected_at: now,
        }
    }

    pub fn mark_connected(&mut self) {
        let now = Instant::now();
        self.connected_at = now;
        self.last_activity = now;
        self.recovery_cycles = 0;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// One connect cycle: the bounded TCP attempts, then the BLE fallback.
    ///
    /// `replay` is carried to the byte-stream channel only; a command that
    /// failed over TCP is not re-sent over BLE.
    pub fn establish(
        &mut self,
        connect_timeout: Duration,
        reply_timeout: Duration,
        replay: Option<String>,
    ) -> Event {
        let tries = self.settings.reconnect_tries;
        let pause = self.settings.reconnect_delay;
        match self.dial_stream(tries, pause, connect_timeout, reply_timeout) {
            Ok(channel) => {
                self.mark_connected();
                status(
                    Tone::Good,
                    format!("[FC] connected over tcp to {}:{}", self.settings.host, self.settings.port),
                );
                return Event::StreamUp(StreamUpEvent { channel, replay });
            }
            Err(e) => status(Tone::Warn, format!("[FC] tcp unavailable ({}), trying BLE", e)),
        }

        match self.open_wireless() {
            Ok(channel) => {
                self.mark_connected();
                if let Some(line) = replay {
                    debug!("not replaying {:?} over BLE", line);
                }
                status(Tone::Good, "[BLE] session ready".to_string());
                Event::WirelessUp(WirelessUpEvent { channel })
            }
            Err(e) => {
                self.recovery_cycles += 1;
                status(
                    Tone::Bad,
                    format!(
                        "[FC] device unreachable over tcp and BLE ({} failed cycle(s)): {}",
                        self.recovery_cycles, e
                    ),
                );
                match self.settings.max_recovery_cycles {
                    Some(max) if self.recovery_cycles >= max => {
                        status(Tone::Bad, "[FC] giving up".to_string());
                        Event::Quit(QuitEvent { with_error: true })
                    }
                    _ => Event::LinkLost(LinkLostEvent {
                        reason: e.to_string(),
                        replay,
                    }),
                }
            }
        }
    }

    /// The TCP dial that follows a Wi-Fi-up signal. `None` leaves the session
    /// on BLE.
    pub fn stream_after_wifi(&mut self) -> Option<StreamChannel> {
        thread::sleep(self.settings.wifi_settle);
        let tries = self.settings.post_wifi_connect_tries;
        let (connect_timeout, reply_timeout) =
            (self.settings.connect_timeout, self.settings.auth_timeout);
        match self.dial_stream(tries, Duration::ZERO, connect_timeout, reply_timeout) {
            Ok(channel) => {
                self.mark_connected();
                status(Tone::Good, "[FC] wifi up, switched to tcp".to_string());
                Some(channel)
            }
            Err(e) => {
                status(Tone::Warn, format!("[FC] wifi up but tcp still unreachable ({}), staying on BLE", e));
                None
            }
        }
    }

    /// Wait for the device to come back after an upload.
    ///
    /// TCP is polled (connect, `AUTH`, `version`) until the reboot deadline.
    /// Once the stream-only window has passed, a BLE quick probe is run on
    /// every round until the device is seen, which escalates once to a full
    /// BLE session.
    pub fn recover_after_upload(&mut self) -> Event {
        let deadline = self.settings.reboot_deadline();
        let (connect_timeout, reply_timeout) = (
            self.settings.recovery_connect_timeout,
            self.settings.recovery_reply_timeout,
        );
        let started = Instant::now();
        let pb = spinner("[OTA]");
        pb.set_message(format!("waiting up to {:?} for the device to reboot", deadline));

        let mut escalated = false;
        while started.elapsed() < deadline {
            match self.poll_stream(connect_timeout, reply_timeout) {
                Ok(Some((channel, version))) => {
                    pb.finish_and_clear();
                    self.mark_connected();
                    status(Tone::Good, format!("[OTA] device back over tcp, version {}", version));
                    return Event::StreamUp(StreamUpEvent {
                        channel,
                        replay: None,
                    });
                }
                Ok(None) => trace!("device answered with an empty version"),
                Err(e) => trace!("recovery poll: {}", e),
            }

            if !escalated && started.elapsed() >= self.settings.stream_only_window {
                let quick_scan = self.settings.ble_quick_scan;
                if quick_probe(&mut self.transports, &self.identity, quick_scan) {
                    escalated = true;
                    pb.set_message("device seen over BLE");
                    match self.connect_wireless() {
                        Ok(channel) => {
                            pb.finish_and_clear();
                            self.mark_connected();
                            status(Tone::Good, "[OTA] device back over BLE".to_string());
                            return Event::WirelessUp(WirelessUpEvent { channel });
                        }
                        Err(e) => status(Tone::Warn, format!("[OTA] BLE recovery failed: {}", e)),
                    }
                }
            }
            thread::sleep(self.settings.recovery_poll_interval);
        }

        pb.abandon_with_message("device did not come back");
        status(
            Tone::Bad,
            format!("[OTA] device did not come back within {:?}", deadline),
        );
        Event::LinkLost(LinkLostEvent {
            reason: "device did not come back after the upload".into(),
            replay: None,
        })
    }

    /// Dial TCP and send `AUTH`. A missing reply to `AUTH` is logged but does
    /// not fail the channel.
    pub fn open_stream(
        &mut self,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Result<StreamChannel> {
        let link = self.transports.connect_stream(connect_timeout)?;
        let mut channel = StreamChannel::new(link, &self.settings);
        let auth = format!("AUTH {}", self.settings.token);
        match channel.send_command_with_timeout(&auth, reply_timeout) {
            Ok(reply) => info!("[FC] auth: {}", reply),
            Err(Error::Timeout(_)) => warn!("{}", Error::Auth("no reply over tcp".into())),
            Err(e) => return Err(e),
        }
        Ok(channel)
    }

    /// Locate the device over BLE and open an authenticated channel to it.
    pub fn open_wireless(&mut self) -> Result<CharacteristicChannel> {
        let quick_scan = self.settings.ble_quick_scan;
        if quick_probe(&mut self.transports, &self.identity, quick_scan) {
            status(Tone::Plain, "[BLE] device is advertising".to_string());
        } else {
            // A short scan misses slow advertisers; the full discovery still
            // gets its chance.
            status(Tone::Plain, "[BLE] quick probe saw nothing, running full discovery".to_string());
        }
        self.connect_wireless()
    }
}

// =============================================================================
// Private stuff
// =============================================================================

impl<T: Transports> Context<T> {
    /// `tries` TCP attempts, `pause` apart. The first success sends a
    /// best-effort `version` probe.
    fn dial_stream(
        &mut self,
        tries: u32,
        pause: Duration,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Result<StreamChannel> {
        let tries = tries.max(1);
        let result = retry_with_index(
            delay::Fixed::from_millis(pause.as_millis() as u64).take(tries as usize - 1),
            |index| -> Result<StreamChannel> {
                status(Tone::Plain, format!("[FC] connecting over tcp ({}/{})", index, tries));
                self.open_stream(connect_timeout, reply_timeout)
            },
        );
        match result {
            Ok(mut channel) => {
                match channel.send_command("version") {
                    Ok(version) => status(Tone::Plain, format!("[FC] device version: {}", version)),
                    Err(e) => debug!("version probe failed: {}", e),
                }
                Ok(channel)
            }
            Err(e) => match e {
                retry::Error::Operation {
                    error,
                    total_delay,
                    tries,
                } => {
                    info!(
                        "Failed to connect over tcp after {:?} and {} tries: {}",
                        total_delay, tries, error,
                    );
                    Err(error)
                }
                retry::Error::Internal(reason) => {
                    info!("Internal retry error while connecting over tcp");
                    Err(Error::Connect(reason))
                }
            },
        }
    }

    /// One recovery round over TCP: connect, `AUTH` and a non-empty
    /// `version` reply.
    fn poll_stream(
        &mut self,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Result<Option<(StreamChannel, String)>> {
        let mut channel = self.open_stream(connect_timeout, reply_timeout)?;
        let version = channel.send_command_with_timeout("version", reply_timeout)?;
        if version.is_empty() {
            channel.close();
            return Ok(None);
        }
        Ok(Some((channel, version)))
    }

    /// Full discovery, connect, capability resolution and `AUTH`.
    fn connect_wireless(&mut self) -> Result<CharacteristicChannel> {
        let scan = self.settings.ble_scan;
        let device = locate(&mut self.transports, &self.identity, scan)
            .ok_or_else(|| Error::Connect("device not found over BLE".into()))?;
        status(
            Tone::Plain,
            format!(
                "[BLE] connecting to {} ({})",
                device.name.as_deref().unwrap_or("?"),
                device.address
            ),
        );

        let WirelessLink { mut link, services } = self.transports.connect_wireless(&device)?;
        dump_services(&services, self.settings.ble_dump_services);

        let caps = match CapabilityMap::resolve(&services) {
            Ok(caps) => caps,
            Err(e) => {
                close_quietly("ble disconnect", link.disconnect());
                return Err(e);
            }
        };

        let mut channel =
            CharacteristicChannel::open(link, caps, Arc::clone(&self.signal), &self.settings)?;
        if !channel.notifications_enabled() {
            status(Tone::Warn, "[BLE] notifications unavailable, polling replies".to_string());
        }
        match channel.authenticate(&self.settings.token) {
            Ok(reply) => info!("[BLE] auth: {}", reply),
            Err(Error::Timeout(_)) => warn!("{}", Error::Auth("no reply over BLE".into())),
            Err(e) => {
                channel.close();
                return Err(e);
            }
        }
        Ok(channel)
    }
}

fn dump_services(services: &[ServiceInfo], verbose: bool) {
    for service in services {
        if verbose {
            info!("[BLE] service {}", service.uuid);
        } else {
            debug!("service {}", service.uuid);
        }
        for characteristic in &service.characteristics {
            if verbose {
                info!("[BLE]   characteristic {}", characteristic);
            } else {
                debug!("  characteristic {}", characteristic);
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

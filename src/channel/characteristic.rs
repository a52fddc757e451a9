//! Characteristic-addressed channel: commands are written to the command-in
//! endpoint and replies come back as notifications on status-out.
//!
//! While the channel is open a listener thread drains the notification queue
//! of the link. It echoes asynchronous lines, feeds them to the Wi-Fi-up
//! classifier and forwards status-out lines to the reply queue while a
//! command waits for its reply, echoing them otherwise. The listener never
//! writes to the link.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, trace, warn};
use uuid::Uuid;

use super::{close_quietly, Channel, TransportKind};
use crate::{
    capabilities::{CapabilityMap, Role},
    error::{Error, Result},
    settings::Settings,
    utils::{hex_dump, status, Tone},
    wifi::WifiUpSignal,
};

/// How often the listener re-checks whether it should stop.
const LISTENER_POLL: Duration = Duration::from_millis(100);

// =============================================================================
// Public Interface
// =============================================================================

/// A value pushed by the peer on a subscribed endpoint.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Notification {
    pub endpoint: Uuid,
    pub value: Vec<u8>,
}

/// A connected GATT peer, as seen by the channel.
pub trait GattLink: Send {
    /// Write `data` to `endpoint`, with or without a link-level
    /// acknowledgment.
    fn write(&mut self, endpoint: Uuid, data: &[u8], acknowledged: bool) -> Result<()>;
    fn read(&mut self, endpoint: Uuid) -> Result<Vec<u8>>;
    fn subscribe(&mut self, endpoint: Uuid) -> Result<()>;
    fn unsubscribe(&mut self, endpoint: Uuid) -> Result<()>;
    /// Queue receiving the notifications of every subscribed endpoint, in
    /// arrival order.
    fn notifications(&mut self) -> Result<Receiver<Notification>>;
    /// Negotiated (or assumed) ATT MTU.
    fn mtu(&self) -> usize;
    fn disconnect(&mut self) -> Result<()>;
}

pub struct CharacteristicChannel {
    link: Box<dyn GattLink>,
    caps: CapabilityMap,
    signal: Arc<WifiUpSignal>,
    subscribed: Vec<Uuid>,
    /// Whether replies arrive as status-out notifications. When not, replies
    /// are polled with bounded reads.
    notify_ok: bool,
    replies: Receiver<String>,
    /// Set while a command waits for its reply on status-out.
    awaiting: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    reply_timeout: Duration,
    poll_attempts: u32,
    poll_interval: Duration,
    auth_poll_attempts: u32,
    auth_poll_interval: Duration,
    open: bool,
}

impl CharacteristicChannel {
    /// Subscribe to status-out (needed for notification replies) and then,
    /// best-effort, to the error-status, alert and sensor endpoints, and
    /// start the listener.
    pub fn open(
        mut link: Box<dyn GattLink>,
        caps: CapabilityMap,
        signal: Arc<WifiUpSignal>,
        settings: &Settings,
    ) -> Result<Self> {
        let mut subscribed = Vec::new();

        let mut notify_ok = match link.subscribe(caps.status_out) {
            Ok(()) => {
                subscribed.push(caps.status_out);
                true
            }
            Err(e) => {
                warn!("[BLE] notify on {} unavailable, polling replies: {}", Role::StatusOut, e);
                false
            }
        };
        for role in [Role::ErrorStatus, Role::Alert, Role::Sensor] {
            if let Some(endpoint) = caps.endpoint(role) {
                match link.subscribe(endpoint) {
                    Ok(()) => subscribed.push(endpoint),
                    Err(e) => debug!("notify on {} unavailable: {}", role, e),
                }
            }
        }

        let (reply_tx, replies) = mpsc::channel();
        let active = Arc::new(AtomicBool::new(true));
        let awaiting = Arc::new(AtomicBool::new(false));
        let mut listener = None;
        if !subscribed.is_empty() {
            match link.notifications() {
                Ok(queue) => {
                    let sink = ReplySink {
                        replies: reply_tx,
                        awaiting: Arc::clone(&awaiting),
                    };
                    let active = Arc::clone(&active);
                    let signal = Arc::clone(&signal);
                    listener = Some(
                        thread::Builder::new()
                            .name("ble-notify".into())
                            .spawn(move || listen(queue, caps, signal, sink, active))?,
                    );
                }
                Err(e) => {
                    warn!("[BLE] notification stream unavailable: {}", e);
                    notify_ok = false;
                }
            }
        }

        Ok(CharacteristicChannel {
            link,
            caps,
            signal,
            subscribed,
            notify_ok,
            replies,
            awaiting,
            active,
            listener,
            reply_timeout: settings.ble_reply_timeout,
            poll_attempts: settings.ble_poll_attempts,
            poll_interval: settings.ble_poll_interval,
            auth_poll_attempts: settings.ble_auth_poll_attempts,
            auth_poll_interval: settings.ble_auth_poll_interval,
            open: true,
        })
    }

    pub fn capabilities(&self) -> &CapabilityMap {
        &self.caps
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notify_ok
    }

    pub fn mtu(&self) -> usize {
        self.link.mtu()
    }

    /// Send `AUTH <token>`. Without notifications the reply is polled with
    /// the (shorter) authentication budget.
    pub fn authenticate(&mut self, token: &str) -> Result<String> {
        let (attempts, interval) = (self.auth_poll_attempts, self.auth_poll_interval);
        self.exchange(&format!("AUTH {}", token), attempts, interval)
    }

    /// Write the Wi-Fi credentials, newline-joined, to network-config.
    pub fn set_wifi(&mut self, ssid: &str, password: &str) -> Result<()> {
        self.ensure_open()?;
        let payload = format!("{}\n{}", ssid, password);
        self.link.write(self.caps.network_config, payload.as_bytes(), true)
    }

    /// Text control command to upload-control, acknowledged by the write.
    pub fn write_control(&mut self, text: &str) -> Result<()> {
        self.ensure_open()?;
        let endpoint = self
            .caps
            .upload_control
            .ok_or_else(|| Error::NotSupported(Role::UploadControl.to_string()))?;
        trace!("ble control >> {}", text);
        self.link.write(endpoint, text.as_bytes(), true)
    }

    /// Unacknowledged frame write to upload-data.
    pub fn write_data(&mut self, frame: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let endpoint = self
            .caps
            .upload_data
            .ok_or_else(|| Error::NotSupported(Role::UploadData.to_string()))?;
        self.link.write(endpoint, frame, false)
    }

    /// Status-out lines that arrived without a pending command.
    pub fn take_unsolicited(&mut self) -> Vec<String> {
        self.replies.try_iter().collect()
    }

    fn exchange(&mut self, text: &str, attempts: u32, interval: Duration) -> Result<String> {
        self.ensure_open()?;
        for stale in self.replies.try_iter() {
            status(Tone::Plain, format!("[BLE] {}", stale));
        }

        trace!("ble >> {}", text);
        let line = format!("{}\n", text);

        if self.notify_ok {
            self.awaiting.store(true, Ordering::SeqCst);
            let reply = match self.link.write(self.caps.command_in, line.as_bytes(), true) {
                Ok(()) => self
                    .replies
                    .recv_timeout(self.reply_timeout)
                    .map_err(|_| Error::Timeout(format!("no reply to `{}`", text))),
                Err(e) => Err(e),
            };
            self.awaiting.store(false, Ordering::SeqCst);
            return reply;
        }

        self.link.write(self.caps.command_in, line.as_bytes(), true)?;
        for attempt in 1..=attempts {
            thread::sleep(interval);
            let value = match self.link.read(self.caps.status_out) {
                Ok(value) => value,
                Err(e) => {
                    debug!("poll {}/{} failed: {}", attempt, attempts, e);
                    continue;
                }
            };
            let reply = String::from_utf8_lossy(&value).trim().to_string();
            trace!("poll {}/{}: {:?}", attempt, attempts, reply);
            if !reply.is_empty() {
                self.signal.observe(&reply);
                return Ok(reply);
            }
        }
        Err(Error::Timeout(format!("no reply to `{}` after {} polls", text, attempts)))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

impl fmt::Debug for CharacteristicChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicChannel")
            .field("open", &self.open)
            .field("notify_ok", &self.notify_ok)
            .field("subscribed", &self.subscribed)
            .finish()
    }
}

impl Channel for CharacteristicChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Characteristic
    }

    fn send_command(&mut self, text: &str) -> Result<String> {
        let (attempts, interval) = (self.poll_attempts, self.poll_interval);
        self.exchange(text, attempts, interval)
    }

    fn write_bulk(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_data(bytes)
    }

    fn subscribe(&mut self, role: Role) -> Result<()> {
        self.ensure_open()?;
        let endpoint = self
            .caps
            .endpoint(role)
            .ok_or_else(|| Error::NotSupported(role.to_string()))?;
        if !self.subscribed.contains(&endpoint) {
            self.link.subscribe(endpoint)?;
            self.subscribed.push(endpoint);
        }
        Ok(())
    }

    fn read_once(&mut self, role: Role) -> Result<String> {
        self.ensure_open()?;
        let endpoint = self
            .caps
            .endpoint(role)
            .ok_or_else(|| Error::NotSupported(role.to_string()))?;
        let value = self.link.read(endpoint)?;
        hex_dump("ble read", &value);
        Ok(String::from_utf8_lossy(&value).trim().to_string())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    /// Unsubscribe every endpoint one by one, then disconnect. Failures on
    /// either step are logged and dropped.
    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.active.store(false, Ordering::SeqCst);
        for endpoint in self.subscribed.drain(..) {
            close_quietly("notify subscription", self.link.unsubscribe(endpoint));
        }
        close_quietly("ble link", self.link.disconnect());
        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                debug!("notification listener panicked");
            }
        }
        info!("[BLE] disconnected");
    }
}

impl Drop for CharacteristicChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// Where the listener hands status-out lines.
struct ReplySink {
    replies: Sender<String>,
    awaiting: Arc<AtomicBool>,
}

fn listen(
    queue: Receiver<Notification>,
    caps: CapabilityMap,
    signal: Arc<WifiUpSignal>,
    sink: ReplySink,
    active: Arc<AtomicBool>,
) {
    while active.load(Ordering::SeqCst) {
        match queue.recv_timeout(LISTENER_POLL) {
            Ok(notification) => dispatch(notification, &caps, &signal, &sink),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("notification listener stopped");
}

fn dispatch(
    notification: Notification,
    caps: &CapabilityMap,
    signal: &WifiUpSignal,
    sink: &ReplySink,
) {
    hex_dump("ble notification", &notification.value);
    let text = String::from_utf8_lossy(&notification.value).trim().to_string();

    if Some(notification.endpoint) == caps.sensor {
        status(Tone::Plain, format!("[BLE][DHT] {}", text));
        return;
    }

    signal.observe(&text);
    if notification.endpoint == caps.status_out && sink.awaiting.load(Ordering::SeqCst) {
        // The session may be gone already; the line was classified anyway.
        let _ = sink.replies.send(text);
    } else {
        status(Tone::Plain, format!("[BLE] {}", text));
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

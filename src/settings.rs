//! Settings for the device session: addresses, identity, and every timing and
//! sizing constant used by the transports, the transfer and the failover logic.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::time::Duration;

// =============================================================================
// Public Interface
// =============================================================================

/// Groups all settings used by `fieldcom` and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    // -- byte-stream transport ------------------------------------------------
    /// Device host name or IP address.
    pub host: String,
    /// Device TCP port.
    pub port: u16,
    /// Shared secret sent as `AUTH <token>` on every new channel.
    pub token: String,
    pub connect_timeout: Duration,
    /// Reply timeout for regular commands.
    pub command_timeout: Duration,
    pub auth_timeout: Duration,
    /// Bound on every blocking socket write.
    pub write_timeout: Duration,
    /// Upper bound on a reply line, in bytes.
    pub max_line_len: usize,

    // -- failover -------------------------------------------------------------
    /// Byte-stream attempts before falling back to the wireless transport.
    pub reconnect_tries: u32,
    pub reconnect_delay: Duration,
    /// Connect timeout used while the device may still be rebooting.
    pub recovery_connect_timeout: Duration,
    pub recovery_reply_timeout: Duration,
    pub keepalive_interval: Duration,
    /// No keepalive before this much time has passed since connecting.
    pub keepalive_grace: Duration,
    pub keepalive_timeout: Duration,
    /// Consecutive failed connect cycles tolerated before giving up. `None`
    /// retries forever.
    pub max_recovery_cycles: Option<u32>,

    // -- byte-stream upload ---------------------------------------------------
    pub ota_chunk_size: usize,
    pub ota_progress_every: usize,
    pub ota_ack_timeout: Duration,
    pub ota_final_read_timeout: Duration,
    /// Time the device needs to reboot into a new image.
    pub reboot_wait: Duration,
    /// Lower bound on the post-upload recovery deadline.
    pub reboot_floor: Duration,
    /// Initial part of the recovery where only the byte-stream is polled.
    pub stream_only_window: Duration,
    pub recovery_poll_interval: Duration,

    // -- wireless transport ---------------------------------------------------
    /// Fixed hardware address of the device, authoritative when set.
    pub ble_address: Option<String>,
    /// Advertised names accepted as the device (case-insensitive).
    pub ble_names: Vec<String>,
    pub ble_quick_scan: Duration,
    pub ble_scan: Duration,
    /// Timeout wrapped around every BLE connect/read/write.
    pub ble_io_timeout: Duration,
    /// ATT MTU assumed for the link when sizing upload frames.
    pub ble_mtu: usize,
    pub ble_reply_timeout: Duration,
    pub ble_poll_attempts: u32,
    pub ble_poll_interval: Duration,
    pub ble_auth_poll_attempts: u32,
    pub ble_auth_poll_interval: Duration,
    pub service_discovery_tries: u32,
    pub service_discovery_interval: Duration,
    /// Log the full service tree after connecting.
    pub ble_dump_services: bool,

    // -- wireless upload ------------------------------------------------------
    pub ble_ota_progress_every: usize,
    pub ble_ota_settle: Duration,
    pub ble_finish_retry_delay: Duration,
    /// Treat a failed `BL_OTA FINISH` as success when all data was sent.
    pub optimistic_finish: bool,

    // -- network configuration ------------------------------------------------
    /// Window after SETWIFI during which a bare `none` means success.
    pub wifi_grace: Duration,
    pub wifi_up_timeout: Duration,
    /// Pause between the Wi-Fi-up signal and the first TCP dial.
    pub wifi_settle: Duration,
    pub post_wifi_connect_tries: u32,

    // -- console --------------------------------------------------------------
    /// How long the console waits for input before the session gets a tick.
    pub input_slice: Duration,

    /// Image pushed by `ota` when no path is given. When not set either, the
    /// user is offered the `.bin` files of the current working directory.
    pub firmware_image: Option<String>,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

impl Settings {
    /// The post-upload recovery deadline, `max(reboot_wait, reboot_floor)`.
    pub fn reboot_deadline(&self) -> Duration {
        self.reboot_wait.max(self.reboot_floor)
    }
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```ignore
/// let settings = SettingsBuilder::new().host("10.0.0.5").token("s3cret").finalize();
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}
impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
impl SettingsBuilder {
    /// Start building the settings using default values.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                host: "192.168.10.125".into(),
                port: 8080,
                token: "baker".into(),
                connect_timeout: Duration::from_secs(5),
                command_timeout: Duration::from_secs(5),
                auth_timeout: Duration::from_secs(2),
                write_timeout: Duration::from_secs(10),
                max_line_len: 512,

                reconnect_tries: 12,
                reconnect_delay: Duration::from_secs(1),
                recovery_connect_timeout: Duration::from_millis(1300),
                recovery_reply_timeout: Duration::from_millis(1500),
                keepalive_interval: Duration::from_secs(3),
                keepalive_grace: Duration::from_secs(8),
                keepalive_timeout: Duration::from_secs(5),
                max_recovery_cycles: None,

                ota_chunk_size: 16 * 1024,
                ota_progress_every: 256 * 1024,
                ota_ack_timeout: Duration::from_secs(10),
                ota_final_read_timeout: Duration::from_secs(30),
                reboot_wait: Duration::from_secs(10),
                reboot_floor: Duration::from_secs(12),
                stream_only_window: Duration::from_secs(3),
                recovery_poll_interval: Duration::from_millis(400),

                ble_address: None,
                ble_names: vec!["LoPy4".into()],
                ble_quick_scan: Duration::from_millis(1800),
                ble_scan: Duration::from_secs(12),
                ble_io_timeout: Duration::from_secs(10),
                ble_mtu: 23,
                ble_reply_timeout: Duration::from_secs(2),
                ble_poll_attempts: 8,
                ble_poll_interval: Duration::from_millis(80),
                ble_auth_poll_attempts: 6,
                ble_auth_poll_interval: Duration::from_millis(100),
                service_discovery_tries: 40,
                service_discovery_interval: Duration::from_millis(400),
                ble_dump_services: false,

                ble_ota_progress_every: 64 * 1024,
                ble_ota_settle: Duration::from_millis(450),
                ble_finish_retry_delay: Duration::from_millis(500),
                optimistic_finish: true,

                wifi_grace: Duration::from_secs(12),
                wifi_up_timeout: Duration::from_secs(20),
                wifi_settle: Duration::from_millis(400),
                post_wifi_connect_tries: 10,

                input_slice: Duration::from_millis(200),

                firmware_image: None,
                _private_use_builder: (),
            },
        }
    }

    /// Set the device host name or IP address
    pub fn host<'a>(mut self, host: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.host = host.into().into_owned();
        self
    }

    /// Set the device TCP port
    pub fn port(mut self, port: u16) -> Self {
        self.settings.port = port;
        self
    }

    /// Set the authentication token
    pub fn token<'a>(mut self, token: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.token = token.into().into_owned();
        self
    }

    /// Set the fixed BLE hardware address of the device
    pub fn ble_address<'a>(mut self, address: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.ble_address = Some(address.into().into_owned());
        self
    }

    /// Replace the allow-list of advertised BLE names
    pub fn ble_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.ble_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the byte-stream reconnection budget
    pub fn reconnect(mut self, tries: u32, delay: Duration) -> Self {
        self.settings.reconnect_tries = tries;
        self.settings.reconnect_delay = delay;
        self
    }

    /// Set how long the device is expected to take to reboot after an upload
    pub fn reboot_wait(mut self, wait: Duration) -> Self {
        self.settings.reboot_wait = wait;
        self
    }

    /// Set the ATT MTU assumed for BLE upload frames
    pub fn ble_mtu(mut self, mtu: usize) -> Self {
        self.settings.ble_mtu = mtu;
        self
    }

    /// Treat a failed `BL_OTA FINISH` after complete data as success
    pub fn optimistic_finish(mut self, optimistic: bool) -> Self {
        self.settings.optimistic_finish = optimistic;
        self
    }

    /// Give up after this many consecutive failed connect cycles
    pub fn max_recovery_cycles(mut self, cycles: u32) -> Self {
        self.settings.max_recovery_cycles = Some(cycles);
        self
    }

    /// Set the default firmware image to push
    pub fn firmware_image<'a>(mut self, image: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.firmware_image = Some(image.into().into_owned());
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn defaults() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(settings.host, "192.168.10.125");
    assert_eq!(settings.port, 8080);
    assert_eq!(settings.reconnect_tries, 12);
    assert_eq!(settings.reconnect_delay, Duration::from_secs(1));
    assert_eq!(settings.ota_chunk_size, 16 * 1024);
    assert_eq!(settings.ota_progress_every, 256 * 1024);
    assert_eq!(settings.ble_names, vec!["LoPy4".to_string()]);
    assert_eq!(settings.ble_address, None);
    assert_eq!(settings.wifi_grace, Duration::from_secs(12));
    assert!(settings.optimistic_finish);
    assert_eq!(settings.max_recovery_cycles, None);
}

#[test]
fn host_and_port() {
    let settings = SettingsBuilder::new().host("10.0.0.5").port(23).finalize();
    assert_eq!(settings.host, "10.0.0.5");
    assert_eq!(settings.port, 23);
}

#[test]
fn token() {
    let settings = SettingsBuilder::new().token(String::from("hunter2")).finalize();
    assert_eq!(settings.token, "hunter2");
}

#[test]
fn ble_identity() {
    let settings = SettingsBuilder::new()
        .ble_address("AA:BB:CC:DD:EE:FF")
        .ble_names(vec!["LoPy4", "FiPy"])
        .finalize();
    assert_eq!(settings.ble_address.unwrap(), "AA:BB:CC:DD:EE:FF");
    assert_eq!(settings.ble_names, vec!["LoPy4".to_string(), "FiPy".to_string()]);
}

#[test]
fn reconnect_budget() {
    let settings = SettingsBuilder::new()
        .reconnect(3, Duration::from_millis(250))
        .finalize();
    assert_eq!(settings.reconnect_tries, 3);
    assert_eq!(settings.reconnect_delay, Duration::from_millis(250));
}

#[test]
fn reboot_deadline_has_a_floor() {
    let short = SettingsBuilder::new()
        .reboot_wait(Duration::from_secs(2))
        .finalize();
    assert_eq!(short.reboot_deadline(), Duration::from_secs(12));
    let long = SettingsBuilder::new()
        .reboot_wait(Duration::from_secs(30))
        .finalize();
    assert_eq!(long.reboot_deadline(), Duration::from_secs(30));
}

#[test]
fn upload_policies() {
    let settings = SettingsBuilder::new()
        .ble_mtu(247)
        .optimistic_finish(false)
        .max_recovery_cycles(2)
        .firmware_image("app.bin")
        .finalize();
    assert_eq!(settings.ble_mtu, 247);
    assert!(!settings.optimistic_finish);
    assert_eq!(settings.max_recovery_cycles, Some(2));
    assert_eq!(settings.firmware_image.unwrap(), "app.bin");
}

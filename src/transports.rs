//! Dialing the device: the TCP connect for the byte-stream channel and the
//! BLE scan/connect for the characteristic-addressed one.
//!
//! The session only sees the [`Transports`] trait, so the failover logic can
//! be driven by scripted transports in tests.

mod ble;

use std::time::Duration;

use log::debug;

use crate::{
    capabilities::ServiceInfo,
    channel::{GattLink, StreamLink, TcpLink},
    error::Result,
    locator::{Advertisement, Scanner},
    settings::Settings,
};

pub use ble::{BtleCentral, BtleLink};

// =============================================================================
// Public Interface
// =============================================================================

/// A freshly connected wireless peer with its discovered service tree.
pub struct WirelessLink {
    pub link: Box<dyn GattLink>,
    pub services: Vec<ServiceInfo>,
}

/// Everything the session needs to reach the device.
pub trait Transports: Scanner + Send {
    /// Open a TCP connection to the configured device address.
    fn connect_stream(&mut self, connect_timeout: Duration) -> Result<Box<dyn StreamLink>>;

    /// Connect to a device previously returned by a scan and wait until it
    /// exposes its services.
    fn connect_wireless(&mut self, device: &Advertisement) -> Result<WirelessLink>;
}

/// The real transports: `std::net` TCP and `btleplug` BLE.
pub struct FieldTransports {
    host: String,
    port: u16,
    write_timeout: Duration,
    central: BtleCentral,
}

impl FieldTransports {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(FieldTransports {
            host: settings.host.clone(),
            port: settings.port,
            write_timeout: settings.write_timeout,
            central: BtleCentral::new(settings)?,
        })
    }
}

impl Scanner for FieldTransports {
    fn scan(&mut self, timeout: Duration) -> Result<Vec<Advertisement>> {
        self.central.scan(timeout)
    }
}

impl Transports for FieldTransports {
    fn connect_stream(&mut self, connect_timeout: Duration) -> Result<Box<dyn StreamLink>> {
        debug!("dialing {}:{}", self.host, self.port);
        let link = TcpLink::connect(&self.host, self.port, connect_timeout, self.write_timeout)?;
        Ok(Box::new(link))
    }

    fn connect_wireless(&mut self, device: &Advertisement) -> Result<WirelessLink> {
        self.central.connect(device)
    }
}

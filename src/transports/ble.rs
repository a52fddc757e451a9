//! `btleplug` backend.
//!
//! `btleplug` is async; the rest of the client is plain threads. A private
//! tokio runtime bridges the two and every call into the backend is bounded
//! by the configured BLE I/O timeout.

use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::StreamExt;
use log::{debug, info, trace, warn};
use tokio::{runtime::Runtime, task::JoinHandle, time::timeout};
use uuid::Uuid;

use super::WirelessLink;
use crate::{
    capabilities::ServiceInfo,
    channel::{close_quietly, GattLink, Notification},
    error::{Error, Result},
    locator::Advertisement,
    settings::Settings,
};

// =============================================================================
// Public Interface
// =============================================================================

/// The local BLE adapter, plus the peripherals seen by the last scans.
pub struct BtleCentral {
    runtime: Arc<Runtime>,
    adapter: Option<Adapter>,
    seen: HashMap<String, Peripheral>,
    io_timeout: Duration,
    mtu: usize,
    discovery_tries: u32,
    discovery_interval: Duration,
}

impl BtleCentral {
    /// Build the runtime. The adapter itself is only opened by the first scan.
    pub fn new(settings: &Settings) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("fieldcom-ble")
            .enable_all()
            .build()?;
        Ok(BtleCentral {
            runtime: Arc::new(runtime),
            adapter: None,
            seen: HashMap::new(),
            io_timeout: settings.ble_io_timeout,
            mtu: settings.ble_mtu,
            discovery_tries: settings.service_discovery_tries.max(1),
            discovery_interval: settings.service_discovery_interval,
        })
    }

    /// Scan for `duration` and report the peripherals heard during that
    /// window only.
    pub fn scan(&mut self, duration: Duration) -> Result<Vec<Advertisement>> {
        let adapter = self.adapter()?;
        let (found, sighted) = self.runtime.block_on(async {
            let mut events = adapter.events().await?;
            adapter.start_scan(ScanFilter::default()).await?;
            let mut sighted = HashSet::new();
            let deadline = tokio::time::Instant::now() + duration;
            while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.next()).await {
                if let Some(id) = sighted_id(event) {
                    sighted.insert(id);
                }
            }
            let found = adapter.peripherals().await;
            close_quietly("ble scan", adapter.stop_scan().await);
            Ok::<_, Error>((found?, sighted))
        })?;
        let cached = found.len();
        let peripherals = heard_during_scan(found, &sighted, |p| p.id());
        trace!("scan: {} heard, {} cached", peripherals.len(), cached);

        let mut advertisements = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            let properties = match self.runtime.block_on(peripheral.properties()) {
                Ok(Some(properties)) => properties,
                Ok(None) => continue,
                Err(e) => {
                    debug!("skipping peripheral without properties: {}", e);
                    continue;
                }
            };
            let id = format!("{:?}", peripheral.id());
            advertisements.push(Advertisement {
                id: id.clone(),
                address: properties.address.to_string(),
                name: properties.local_name,
                services: properties.services,
            });
            self.seen.insert(id, peripheral);
        }
        Ok(advertisements)
    }

    pub fn connect(&mut self, device: &Advertisement) -> Result<WirelessLink> {
        let peripheral = self.seen.get(&device.id).cloned().ok_or_else(|| {
            Error::Connect(format!("{} was not seen by a recent scan", device.address))
        })?;

        info!("[BLE] connecting to {}", device.address);
        let io_timeout = self.io_timeout;
        self.runtime.block_on(async {
            timeout(io_timeout, peripheral.connect()).await??;
            Ok::<_, Error>(())
        })?;

        let services = match self.wait_for_services(&peripheral) {
            Some(services) => services,
            None => {
                let result = self.runtime.block_on(async {
                    timeout(io_timeout, peripheral.disconnect()).await??;
                    Ok::<_, Error>(())
                });
                close_quietly("ble link", result);
                return Err(Error::Resolution(format!(
                    "{} exposed no characteristics",
                    device.address
                )));
            }
        };

        let characteristics = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        let link = BtleLink {
            runtime: Arc::clone(&self.runtime),
            peripheral,
            characteristics,
            forwarder: None,
            io_timeout,
            mtu: self.mtu,
        };
        Ok(WirelessLink {
            link: Box::new(link),
            services,
        })
    }

    fn adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let adapter = self
            .runtime
            .block_on(async {
                let manager = Manager::new().await?;
                let adapters = manager.adapters().await?;
                Ok::<_, Error>(adapters.into_iter().next())
            })?
            .ok_or_else(|| Error::Wireless("no BLE adapter available".into()))?;
        info!("BLE adapter initialized");
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    /// Poll the service tree until at least one characteristic shows up.
    fn wait_for_services(&self, peripheral: &Peripheral) -> Option<Vec<ServiceInfo>> {
        for attempt in 1..=self.discovery_tries {
            let discovered = self.runtime.block_on(async {
                timeout(self.io_timeout, peripheral.discover_services()).await??;
                Ok::<_, Error>(())
            });
            if let Err(e) = discovered {
                debug!("service discovery attempt {} failed: {}", attempt, e);
            }

            let services: Vec<ServiceInfo> = peripheral
                .services()
                .into_iter()
                .map(|s| ServiceInfo {
                    uuid: s.uuid,
                    characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
                })
                .collect();
            if services.iter().any(|s| !s.characteristics.is_empty()) {
                return Some(services);
            }
            debug!("waiting for services ({}/{})", attempt, self.discovery_tries);
            thread::sleep(self.discovery_interval);
        }
        warn!("[BLE] no services after {} attempts", self.discovery_tries);
        None
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The peripheral an advertisement-bearing event is about.
fn sighted_id(event: CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

/// Drop the peripherals not heard during the scan window. Adapters keep
/// listing devices cached by earlier scans.
fn heard_during_scan<P, K, F>(peripherals: Vec<P>, sighted: &HashSet<K>, key: F) -> Vec<P>
where
    K: Eq + Hash,
    F: Fn(&P) -> K,
{
    peripherals
        .into_iter()
        .filter(|p| sighted.contains(&key(p)))
        .collect()
}

/// A connected peripheral behind the [`GattLink`] interface.
pub struct BtleLink {
    runtime: Arc<Runtime>,
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    forwarder: Option<JoinHandle<()>>,
    io_timeout: Duration,
    mtu: usize,
}

impl BtleLink {
    fn characteristic(&self, endpoint: Uuid) -> Result<Characteristic> {
        self.characteristics
            .get(&endpoint)
            .cloned()
            .ok_or_else(|| Error::NotSupported(format!("characteristic {}", endpoint)))
    }
}

impl GattLink for BtleLink {
    fn write(&mut self, endpoint: Uuid, data: &[u8], acknowledged: bool) -> Result<()> {
        let characteristic = self.characteristic(endpoint)?;
        let write_type = if acknowledged {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        let peripheral = &self.peripheral;
        self.runtime.block_on(async {
            timeout(self.io_timeout, peripheral.write(&characteristic, data, write_type)).await??;
            Ok::<_, Error>(())
        })
    }

    fn read(&mut self, endpoint: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(endpoint)?;
        let peripheral = &self.peripheral;
        self.runtime.block_on(async {
            Ok::<_, Error>(timeout(self.io_timeout, peripheral.read(&characteristic)).await??)
        })
    }

    fn subscribe(&mut self, endpoint: Uuid) -> Result<()> {
        let characteristic = self.characteristic(endpoint)?;
        let peripheral = &self.peripheral;
        self.runtime.block_on(async {
            timeout(self.io_timeout, peripheral.subscribe(&characteristic)).await??;
            Ok::<_, Error>(())
        })
    }

    fn unsubscribe(&mut self, endpoint: Uuid) -> Result<()> {
        let characteristic = self.characteristic(endpoint)?;
        let peripheral = &self.peripheral;
        self.runtime.block_on(async {
            timeout(self.io_timeout, peripheral.unsubscribe(&characteristic)).await??;
            Ok::<_, Error>(())
        })
    }

    fn notifications(&mut self) -> Result<mpsc::Receiver<Notification>> {
        let mut stream = self.runtime.block_on(self.peripheral.notifications())?;
        let (tx, rx) = mpsc::channel();
        let forwarder = self.runtime.spawn(async move {
            while let Some(event) = stream.next().await {
                let notification = Notification {
                    endpoint: event.uuid,
                    value: event.value,
                };
                if tx.send(notification).is_err() {
                    break;
                }
            }
            debug!("notification stream ended");
        });
        if let Some(previous) = self.forwarder.replace(forwarder) {
            previous.abort();
        }
        Ok(rx)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        let peripheral = &self.peripheral;
        self.runtime.block_on(async {
            timeout(self.io_timeout, peripheral.disconnect()).await??;
            Ok::<_, Error>(())
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

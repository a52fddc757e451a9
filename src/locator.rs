//! Finding the device over the wireless transport.
//!
//! Two flavours: a cheap [`quick_probe`] that only answers "is it around?" and
//! never connects, and a full [`locate`] that logs every candidate and applies
//! the address-then-name match policy.

use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;

// =============================================================================
// Public Interface
// =============================================================================

/// One advertising device seen during a discovery scan.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Advertisement {
    /// Backend handle used to connect to this device later.
    pub id: String,
    /// Hardware address, `AA:BB:CC:DD:EE:FF`.
    pub address: String,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
}

/// Discovery capability of a wireless backend.
pub trait Scanner {
    /// Scan for `timeout` and return everything seen. Never connects.
    fn scan(&mut self, timeout: Duration) -> Result<Vec<Advertisement>>;
}

/// How the device is recognised among advertisements.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceIdentity {
    /// Fixed hardware address; when set, only this address may match in
    /// [`locate`].
    pub address: Option<String>,
    /// Case-insensitive allow-list of advertised names.
    pub names: Vec<String>,
}

impl DeviceIdentity {
    pub fn new(address: Option<&str>, names: &[String]) -> Self {
        DeviceIdentity {
            address: address
                .map(normalize_address)
                .filter(|address| !address.is_empty()),
            names: names
                .iter()
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    fn address_matches(&self, advertisement: &Advertisement) -> bool {
        matches!(&self.address, Some(address) if normalize_address(&advertisement.address) == *address)
    }

    fn name_matches(&self, advertisement: &Advertisement) -> bool {
        match &advertisement.name {
            Some(name) => {
                let name = name.trim().to_lowercase();
                !name.is_empty() && self.names.contains(&name)
            }
            None => false,
        }
    }
}

/// Uppercase with `:` separators (accepts `-` separated input).
pub fn normalize_address(address: &str) -> String {
    address.trim().replace('-', ":").to_uppercase()
}

/// Bounded discovery scan answering whether the device is advertising, by
/// address or by allow-listed name. Discovery errors count as "not seen".
pub fn quick_probe(
    scanner: &mut dyn Scanner,
    identity: &DeviceIdentity,
    timeout: Duration,
) -> bool {
    match scanner.scan(timeout) {
        Ok(seen) => {
            let found = seen
                .iter()
                .any(|adv| identity.address_matches(adv) || identity.name_matches(adv));
            debug!("quick probe: {} devices seen, target present: {}", seen.len(), found);
            found
        }
        Err(e) => {
            debug!("quick probe scan failed: {}", e);
            false
        }
    }
}

/// Full discovery. A configured address is authoritative: if it is set and
/// not seen, no name match is attempted.
pub fn locate(
    scanner: &mut dyn Scanner,
    identity: &DeviceIdentity,
    timeout: Duration,
) -> Option<Advertisement> {
    let seen = match scanner.scan(timeout) {
        Ok(seen) => seen,
        Err(e) => {
            warn!("[BLE] discovery failed: {}", e);
            return None;
        }
    };

    for adv in &seen {
        let uuids: Vec<String> = adv.services.iter().map(|u| u.to_string()).collect();
        info!(
            "[BLE] seen: {}  {}  uuids={:?}",
            adv.name.as_deref().unwrap_or("?"),
            adv.address,
            uuids
        );
    }

    if let Some(address) = &identity.address {
        return match seen.iter().find(|adv| identity.address_matches(adv)) {
            Some(adv) => {
                info!("[BLE] matched by address: {}", address);
                Some(adv.clone())
            }
            None => {
                warn!("[BLE] address {} not found in discovery results", address);
                None
            }
        };
    }

    let found = seen.iter().find(|adv| identity.name_matches(adv)).cloned();
    if let Some(adv) = &found {
        info!("[BLE] matched by name: {}", adv.name.as_deref().unwrap_or(""));
    }
    found
}

// =============================================================================
// Unit Tests
// =============================================================================

//! Binding of the wireless peer's characteristics to logical roles.
//!
//! The device firmware derives every characteristic identifier from a common
//! base and only the leading bytes are stable across builds (and byte orders),
//! so roles are bound by case-insensitive prefix match over the textual UUID.

use std::fmt;

use log::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// A logical function exposed by the device over the wireless link.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Role {
    /// Commands written by the client.
    CommandIn,
    /// Replies and status lines pushed by the device.
    StatusOut,
    /// SSID/password write endpoint.
    NetworkConfig,
    /// Last error source reported by the device.
    ErrorStatus,
    Alert,
    UploadControl,
    UploadData,
    /// Temperature/humidity readings.
    Sensor,
}

impl Role {
    /// All roles in resolution order.
    pub const ALL: [Role; 8] = [
        Role::CommandIn,
        Role::StatusOut,
        Role::NetworkConfig,
        Role::ErrorStatus,
        Role::Alert,
        Role::UploadControl,
        Role::UploadData,
        Role::Sensor,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Role::CommandIn => "efbe0100",
            Role::StatusOut => "efbe0200",
            Role::NetworkConfig => "efbe0300",
            Role::ErrorStatus => "efbe0400",
            Role::Alert => "efbe0500",
            Role::UploadControl => "efbe0600",
            Role::UploadData => "efbe0700",
            Role::Sensor => "efbe0800-",
        }
    }

    pub fn is_required(self) -> bool {
        matches!(
            self,
            Role::CommandIn | Role::StatusOut | Role::NetworkConfig | Role::ErrorStatus
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::CommandIn => "command-in",
            Role::StatusOut => "status-out",
            Role::NetworkConfig => "network-config",
            Role::ErrorStatus => "error-status",
            Role::Alert => "alert",
            Role::UploadControl => "upload-control",
            Role::UploadData => "upload-data",
            Role::Sensor => "sensor",
        };
        f.write_str(name)
    }
}

/// A primary service of the connected peer and its characteristics, in the
/// order the backend reported them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Bind one characteristic to each prefix, single pass over the service tree.
///
/// The first characteristic (in traversal order) matching a prefix wins it, a
/// characteristic fills at most one slot (the first matching prefix in list
/// order), and traversal stops as soon as every slot is bound.
pub fn resolve_by_prefix<'a, I>(services: I, prefixes: &[&str]) -> Vec<Option<Uuid>>
where
    I: IntoIterator<Item = &'a ServiceInfo>,
{
    let prefixes: Vec<String> = prefixes.iter().map(|p| p.to_lowercase()).collect();
    let mut bound: Vec<Option<Uuid>> = vec![None; prefixes.len()];

    for service in services {
        for characteristic in &service.characteristics {
            let text = characteristic.to_string().to_lowercase();
            let slot = prefixes
                .iter()
                .zip(bound.iter())
                .position(|(prefix, current)| current.is_none() && text.starts_with(prefix));
            if let Some(i) = slot {
                bound[i] = Some(*characteristic);
            }
        }
        if bound.iter().all(Option::is_some) {
            break;
        }
    }
    bound
}

/// Immutable role → endpoint snapshot for one wireless connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CapabilityMap {
    pub command_in: Uuid,
    pub status_out: Uuid,
    pub network_config: Uuid,
    pub error_status: Uuid,
    pub alert: Option<Uuid>,
    pub upload_control: Option<Uuid>,
    pub upload_data: Option<Uuid>,
    pub sensor: Option<Uuid>,
}

impl CapabilityMap {
    /// Resolve all roles; fails with [`Error::Resolution`] naming the
    /// required roles left unbound.
    pub fn resolve(services: &[ServiceInfo]) -> Result<Self> {
        let prefixes: Vec<&str> = Role::ALL.iter().map(|r| r.prefix()).collect();
        let bound = resolve_by_prefix(services, &prefixes);

        let missing: Vec<String> = Role::ALL
            .iter()
            .zip(bound.iter())
            .filter(|(role, uuid)| role.is_required() && uuid.is_none())
            .map(|(role, _)| role.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Resolution(missing.join(", ")));
        }

        let at = |role: Role| bound[role_index(role)];
        let required = |role: Role| at(role).ok_or_else(|| Error::Resolution(role.to_string()));

        let map = CapabilityMap {
            command_in: required(Role::CommandIn)?,
            status_out: required(Role::StatusOut)?,
            network_config: required(Role::NetworkConfig)?,
            error_status: required(Role::ErrorStatus)?,
            alert: at(Role::Alert),
            upload_control: at(Role::UploadControl),
            upload_data: at(Role::UploadData),
            sensor: at(Role::Sensor),
        };
        debug!("capabilities: {:?}", map);
        Ok(map)
    }

    pub fn endpoint(&self, role: Role) -> Option<Uuid> {
        match role {
            Role::CommandIn => Some(self.command_in),
            Role::StatusOut => Some(self.status_out),
            Role::NetworkConfig => Some(self.network_config),
            Role::ErrorStatus => Some(self.error_status),
            Role::Alert => self.alert,
            Role::UploadControl => self.upload_control,
            Role::UploadData => self.upload_data,
            Role::Sensor => self.sensor,
        }
    }

    pub fn supports_upload(&self) -> bool {
        self.upload_control.is_some() && self.upload_data.is_some()
    }
}

fn role_index(role: Role) -> usize {
    Role::ALL.iter().position(|r| *r == role).unwrap_or(0)
}

// =============================================================================
// Unit Tests
// =============================================================================

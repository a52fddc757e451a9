//! Fieldcom is a field client for a small embedded device reachable over two
//! unreliable transports: TCP on the local network and Bluetooth Low Energy.
//! It keeps an interactive command session with the device, survives the loss
//! of either transport by failing over to the other one, and pushes firmware
//! images with a chunked, CRC32-checked transfer that tolerates the device
//! rebooting in the middle of it.
//!
//! The session is implemented as a state machine. State machines are
//! implemented in terms of **states** and **transitions** between them with
//! the following characteristics:
//!
//! * Can only be in one state at any time.
//! * Each state can have its own associated data if needed (the open channel
//!   of the connected states, the command to replay of the reconnecting one).
//! * It is possible to have some shared data between **all** states (the
//!   settings, the transports and the Wi-Fi-up signal).
//! * Transitions between states are triggered via typed **events** and follow
//!   defined semantics.
//! * Only explicitly defined transitions are permitted.
//! * Transitioning from one state to another consumes the original state and
//!   renders it unusable. Any transition back to that state would create a new
//!   state.
//! * Data can be transferred from one state to the next by attaching it to the
//!   transition event. The newly opened channel, for instance, travels inside
//!   the event that announces it.
//!
//! The implementation of state transitions leverages `rust`'s `From` and `Into`
//! pattern: every authorized transition is a `From<Event> for State`
//! implementation.

mod capabilities;
mod channel;
mod command;
mod console;
mod error;
mod locator;
mod session;
mod settings;
mod transfer;
mod transports;
mod utils;
mod wifi;

#[cfg(test)]
mod testing;

pub use capabilities::{resolve_by_prefix, CapabilityMap, Role, ServiceInfo};
pub use channel::{
    Channel, CharacteristicChannel, GattLink, Notification, StreamChannel, StreamLink, TcpLink,
    TransportKind,
};
pub use command::Command;
pub use console::{Console, Input, TerminalConsole};
pub use error::{Error, Result};
pub use locator::{locate, normalize_address, quick_probe, Advertisement, DeviceIdentity, Scanner};
pub use session::{Session, SessionState};
pub use settings::{Settings, SettingsBuilder};
pub use transfer::{
    characteristic::{encode_frame, frame_payload_size},
    TransferGuard, TransferJob, TransferLock, TransferReport,
};
pub use transports::{BtleCentral, BtleLink, FieldTransports, Transports, WirelessLink};
pub use wifi::{is_wifi_up, normalize, WifiUpSignal};

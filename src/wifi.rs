//! Detection of the "network connectivity is back" condition from the free-text
//! status lines the device pushes, and the single-slot signal used to hand that
//! condition from the notification listener to whichever operation waits on it.

use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use log::{debug, trace};

/// Lines starting with this banner report a fresh DHCP lease.
const GOT_IP_BANNER: &str = "wifi: got ip";
/// Embedded address token, e.g. `status ip=10.0.0.5`.
const IP_TOKEN: &str = " ip=";
/// Vendor event name for a DHCP lease.
const GOT_IP_EVENT: &str = "sta_got_ip";
/// Error-status reading meaning "no Wi-Fi error".
const WIFI_ERR_NONE: &str = "wifi_err=none";
/// Ambiguous idle/success reading of the error-status endpoint.
const BARE_NONE: &str = "none";

// =============================================================================
// Public Interface
// =============================================================================

/// Trim, lowercase and collapse runs of whitespace into single spaces.
pub fn normalize(line: &str) -> String {
    line.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Decide whether `line` reports that Wi-Fi connectivity has just been
/// established.
///
/// A bare `none` is reported by the device both when idle and on success, so
/// it only counts while `grace_window_active` (opened when a SETWIFI is
/// submitted).
pub fn is_wifi_up(line: &str, grace_window_active: bool) -> bool {
    let m = normalize(line);
    if m == BARE_NONE {
        return grace_window_active;
    }
    m.starts_with(GOT_IP_BANNER)
        || m.contains(IP_TOKEN)
        || m.contains(GOT_IP_EVENT)
        || m.contains(WIFI_ERR_NONE)
}

/// Thread-safe, single-slot "Wi-Fi is up" event.
///
/// The notification listener calls [`observe`](WifiUpSignal::observe) for
/// every status line; the session calls [`begin_wait`](WifiUpSignal::begin_wait)
/// before issuing the command whose effect it waits for, then
/// [`wait`](WifiUpSignal::wait) which consumes the event.
#[derive(Debug, Default)]
pub struct WifiUpSignal {
    slot: Mutex<Slot>,
    fired: Condvar,
}

#[derive(Debug, Default)]
struct Slot {
    set: bool,
    grace_until: Option<Instant>,
}

impl WifiUpSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear any stale event before a new wait starts.
    pub fn begin_wait(&self) {
        self.lock().set = false;
    }

    /// Accept a bare `none` as positive for the next `window`.
    pub fn open_grace_window(&self, window: Duration) {
        self.lock().grace_until = Some(Instant::now() + window);
    }

    pub fn grace_window_active(&self) -> bool {
        matches!(self.lock().grace_until, Some(until) if Instant::now() < until)
    }

    /// Classify `line` and fire the signal when it reports Wi-Fi up. Returns
    /// the classification.
    pub fn observe(&self, line: &str) -> bool {
        let up = is_wifi_up(line, self.grace_window_active());
        trace!("wifi classifier: {:?} -> {}", line, up);
        if up {
            self.set();
        }
        up
    }

    pub fn set(&self) {
        let mut slot = self.lock();
        if !slot.set {
            debug!("wifi-up signal fired");
        }
        slot.set = true;
        self.fired.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.lock().set
    }

    /// Block until the signal fires or `timeout` expires. A fired signal is
    /// consumed by the waiter.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (mut slot, _) = match self.fired.wait_timeout_while(guard, timeout, |s| !s.set) {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        let fired = slot.set;
        slot.set = false;
        fired
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // The slot holds plain flags; a panic elsewhere cannot leave it torn.
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

//! The `fieldcom` device session: one interactive command session over TCP or
//! BLE, with failover between them and firmware upload.
//!
//! **Example** - Running the session event loop on the terminal:
//! ```no_run
//! use fieldcom::{self as fc, FieldTransports, Session, TerminalConsole};
//!
//! let settings = fc::SettingsBuilder::default().finalize();
//! let transports = FieldTransports::new(&settings).unwrap();
//! let mut session = Session::new(settings, transports);
//! let status = session.run(&mut TerminalConsole::new()); // after the `Exit` event
//! println!("status: {}", status);
//! std::process::exit(status.into());
//! ```

mod events;
mod link;
mod state_machine;
mod states;

pub use state_machine::{Session, SessionState};

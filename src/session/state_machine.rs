//! Transport selection and failover.
//!
//! The device is reachable over two unreliable transports: TCP on the local
//! network and BLE. The session prefers TCP, falls back to BLE when a bounded
//! number of TCP attempts failed, and moves back to TCP as soon as the device
//! reports that its Wi-Fi is up. A firmware upload makes the device reboot,
//! so every upload ends with a recovery poll that may land on either
//! transport.
//!
//! The following state diagram summarizes the different states and transitions
//! the session goes through:
//!
//! ```text
//!                            START
//!                              |
//!                              v
//!                          .-------.
//!              .-----------| Init  |-----------.
//!              |           '-------'           |
//!           tcp up             |            ble up
//!              |           link lost           |
//!              v               v               v
//!     .-----------------. .--------------. .-------------------.
//!     |                 | |              | |                   |
//!     | StreamConnected |-> Reconnecting <-| WirelessConnected |
//!     |                 | |              | |                   |
//!     '-----------------' '--------------' '-------------------'
//!          ^     |  tcp up  |    |  ble up  ^          |
//!          |     |<---------'    '--------->|          |
//!          |     |                                     |
//!          |     '------- upload + recovery ---------->|
//!          '<------ wifi up / upload + recovery -------'
//!
//!      quit (any state), recovery cap (Init, Reconnecting)
//!                              |
//!                              v
//!                       .------------.
//!                       | Terminated |
//!                       '------------'
//!                              |
//!                              v
//!                             END
//! ```

use std::path::{Path, PathBuf};

use log::{debug, info};

use super::{events::*, link::Context, states::*};
use crate::{
    channel::TransportKind,
    command::Command,
    console::{Console, Input},
    error::{Error, Result},
    settings::Settings,
    transfer::{TransferJob, TransferLock, TransferReport},
    transports::Transports,
    utils::select_image_file_interactive,
};

// =============================================================================
// Public Interface
// =============================================================================

/// The externally visible state of a [`Session`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Init,
    StreamConnected,
    WirelessConnected,
    Reconnecting,
    Terminated,
}

/// An interactive command session with the device, over whichever transport
/// currently works.
///
/// ```ignore
///     let settings = SettingsBuilder::new().host("10.0.0.5").finalize();
///     let transports = FieldTransports::new(&settings)?;
///     let mut session = Session::new(settings, transports);
///     let status = session.run(&mut TerminalConsole::new());
/// ```
pub struct Session<T: Transports> {
    ctx: Context<T>,
    stage: Stage,
    lock: TransferLock,
}

impl<T: Transports> Session<T> {
    /// The session starts in the `Init` state; nothing is dialled until the
    /// first call to [`connect`](Session::connect), [`submit`](Session::submit)
    /// or [`run`](Session::run).
    pub fn new(settings: Settings, transports: T) -> Self {
        Session {
            ctx: Context::new(settings, transports),
            stage: Stage::Init(InitState {}),
            lock: TransferLock::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        match &self.stage {
            Stage::Init(_) => SessionState::Init,
            Stage::StreamConnected(_) => SessionState::StreamConnected,
            Stage::WirelessConnected(_) => SessionState::WirelessConnected,
            Stage::Reconnecting(_) => SessionState::Reconnecting,
            Stage::Terminated(_) => SessionState::Terminated,
        }
    }

    /// Kind of the active channel, if any.
    pub fn transport(&self) -> Option<TransportKind> {
        match &self.stage {
            Stage::StreamConnected(_) => Some(TransportKind::Stream),
            Stage::WirelessConnected(_) => Some(TransportKind::Characteristic),
            _ => None,
        }
    }

    /// Handle on the lock taken for the duration of each upload.
    pub fn transfer_lock(&self) -> TransferLock {
        self.lock.clone()
    }

    /// Run the connect cycles until a channel is up or the session ended.
    pub fn connect(&mut self) -> SessionState {
        self.settle();
        self.state()
    }

    /// Interpret one console line and return the text to show for it.
    ///
    /// A command that fails because the link went away triggers the
    /// reconnection; over TCP the command is then sent once more and the
    /// text shown is the reply to that second attempt.
    pub fn submit(&mut self, line: &str) -> String {
        let command = match Command::parse(line) {
            Some(command) => command,
            None => return String::new(),
        };
        if self.state() == SessionState::Terminated {
            return "[FC] session closed".into();
        }

        match command {
            Command::Quit => {
                self.apply(Event::Quit(QuitEvent { with_error: false }));
                self.settle();
                "[FC] bye".into()
            }
            Command::Usage(usage) => usage.into(),
            Command::Upload(path) => match self.upload_firmware(path.as_deref()) {
                Ok(report) => format!(
                    "[OTA] {} bytes sent{}",
                    report.bytes_sent,
                    if report.finish_confirmed {
                        ""
                    } else {
                        " (end of transfer not confirmed)"
                    }
                ),
                Err(e) => format!("[OTA] upload failed: {}", e),
            },
            command => {
                if let Some(replayed) = self.settle() {
                    debug!("replayed before the next command: {}", replayed);
                }
                let outcome = match &mut self.stage {
                    Stage::StreamConnected(state) => state.handle(&mut self.ctx, command, line),
                    Stage::WirelessConnected(state) => state.handle(&mut self.ctx, command, line),
                    _ => return format!("[FC] {}", Error::NotConnected),
                };
                let mut display = outcome.display;
                if let Some(event) = outcome.event {
                    self.apply(event);
                    if let Some(replayed) = self.settle() {
                        display = replayed;
                    }
                }
                display
            }
        }
    }

    /// Push a firmware image over the active transport.
    ///
    /// Without `path`, the configured default image is used, else the user
    /// picks one of the `.bin` files in the working directory. Only one
    /// upload can be in flight: a second one is rejected with
    /// [`Error::UploadInProgress`].
    pub fn upload_firmware(&mut self, path: Option<&Path>) -> Result<TransferReport> {
        let _guard = self.lock.try_acquire()?;

        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match &self.ctx.settings.firmware_image {
                Some(image) => PathBuf::from(image),
                None => select_image_file_interactive()
                    .ok_or_else(|| Error::InvalidImage("no firmware image selected".into()))?,
            },
        };
        let job = TransferJob::from_path(&path)?;

        self.settle();
        let outcome = match &mut self.stage {
            Stage::StreamConnected(state) => state.upload(&mut self.ctx, &job),
            Stage::WirelessConnected(state) => state.upload(&mut self.ctx, &job),
            _ => return Err(Error::NotConnected),
        };
        self.apply(outcome.event);
        self.settle();
        outcome.result
    }

    /// Idle-time work: keepalive over TCP, unsolicited lines and the
    /// Wi-Fi-up handover over BLE. Returns text to show, if any.
    pub fn tick(&mut self) -> Option<String> {
        let event = match &mut self.stage {
            Stage::StreamConnected(state) => state.tick(&mut self.ctx),
            Stage::WirelessConnected(state) => state.tick(&mut self.ctx),
            _ => None,
        }?;
        self.apply(event);
        self.settle()
    }

    pub fn prompt(&self) -> &'static str {
        match self.transport() {
            Some(TransportKind::Stream) => "LoPy> ",
            Some(TransportKind::Characteristic) => "LoPy-BLE> ",
            None => "",
        }
    }

    /// The session event loop runs until the `Terminated` state is reached
    /// and its `should_exit` flag is set. At such point, the event loop
    /// terminates and returns an exit code indicating no errors when equal to
    /// **`0`**; otherwise a termination with error.
    pub fn run(&mut self, console: &mut dyn Console) -> i8 {
        self.settle();
        let slice = self.ctx.settings.input_slice;
        let mut prompted = false;
        loop {
            if let Stage::Terminated(state) = &self.stage {
                if state.should_exit {
                    return if state.with_error { 1 } else { 0 };
                }
            }
            if !prompted {
                console.prompt(self.prompt());
                prompted = true;
            }
            match console.next_input(slice) {
                Input::Line(line) => {
                    let display = self.submit(&line);
                    if !display.is_empty() {
                        println!("{}", display);
                    }
                    prompted = false;
                }
                Input::Idle => {
                    if let Some(display) = self.tick() {
                        println!("{}", display);
                        prompted = false;
                    }
                }
                Input::Closed => {
                    info!("console input closed");
                    self.apply(Event::Quit(QuitEvent { with_error: false }));
                    self.settle();
                }
            }
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

// -----------------------------------------------------------------------------
// The State Machine
// -----------------------------------------------------------------------------

/// Wraps the session states into a simple enum, which can also be used for
/// pattern matching during state transitions.
#[derive(Debug)]
enum Stage {
    Init(InitState),
    StreamConnected(StreamConnectedState),
    WirelessConnected(WirelessConnectedState),
    Reconnecting(ReconnectingState),
    Terminated(TerminatedState),
}
impl Stage {
    /// The state that `event` leads to from the current one. Any transition
    /// that is not listed here is a bug.
    fn on(&self, event: Event) -> Stage {
        match self {
            Stage::Init(sm) => match event {
                Event::StreamUp(ev) => Stage::StreamConnected(ev.into()),
                Event::WirelessUp(ev) => Stage::WirelessConnected(ev.into()),
                Event::LinkLost(ev) => Stage::Reconnecting(ev.into()),
                Event::Quit(ev) => Stage::Terminated(ev.into()),
                _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
            },
            Stage::Reconnecting(sm) => match event {
                Event::StreamUp(ev) => Stage::StreamConnected(ev.into()),
                Event::WirelessUp(ev) => Stage::WirelessConnected(ev.into()),
                Event::LinkLost(ev) => Stage::Reconnecting(ev.into()),
                Event::Quit(ev) => Stage::Terminated(ev.into()),
                _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
            },
            Stage::StreamConnected(sm) => match event {
                // Post-upload recovery can land on either transport.
                Event::StreamUp(ev) => Stage::StreamConnected(ev.into()),
                Event::WirelessUp(ev) => Stage::WirelessConnected(ev.into()),
                Event::LinkLost(ev) => Stage::Reconnecting(ev.into()),
                Event::Quit(ev) => Stage::Terminated(ev.into()),
                _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
            },
            Stage::WirelessConnected(sm) => match event {
                Event::StreamUp(ev) => Stage::StreamConnected(ev.into()),
                Event::WirelessUp(ev) => Stage::WirelessConnected(ev.into()),
                Event::LinkLost(ev) => Stage::Reconnecting(ev.into()),
                Event::Quit(ev) => Stage::Terminated(ev.into()),
                _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
            },
            Stage::Terminated(sm) => match event {
                Event::Exit(ev) => Stage::Terminated(ev.into()),
                _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
            },
        }
    }
}

impl<T: Transports> Session<T> {
    fn apply(&mut self, event: Event) {
        self.stage = self.stage.on(event);
        info!("=> {:?}", self.state());
    }

    /// Run the transient states until the session rests in a connected
    /// state or has exited. A pending TCP replay is sent on the way; its
    /// reply is returned.
    fn settle(&mut self) -> Option<String> {
        let mut replayed = None;
        loop {
            let event = match &mut self.stage {
                Stage::Init(state) => state.run(&mut self.ctx),
                Stage::Reconnecting(state) => state.run(&mut self.ctx),
                Stage::Terminated(state) if !state.should_exit => state.run(&mut self.ctx),
                Stage::StreamConnected(state) => match state.replay(&mut self.ctx) {
                    Some(outcome) => {
                        replayed = Some(outcome.display);
                        match outcome.event {
                            Some(event) => event,
                            None => return replayed,
                        }
                    }
                    None => return replayed,
                },
                _ => return replayed,
            };
            self.apply(event);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        fs,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use super::*;
    use crate::{
        settings::SettingsBuilder,
        testing::{
            device_advertisement, device_reply, Attempt, MockGattLink, MockStreamLink,
            MockTransports,
        },
    };

    struct ScriptedConsole(VecDeque<Input>);

    impl Console for ScriptedConsole {
        fn next_input(&mut self, _slice: Duration) -> Input {
            self.0.pop_front().unwrap_or(Input::Closed)
        }
    }

    fn settings(tries: u32, delay: Duration) -> Settings {
        let mut settings = SettingsBuilder::new().reconnect(tries, delay).finalize();
        settings.wifi_settle = Duration::ZERO;
        settings.ble_ota_settle = Duration::ZERO;
        settings.ble_finish_retry_delay = Duration::ZERO;
        settings.reboot_wait = Duration::ZERO;
        settings.reboot_floor = Duration::from_secs(2);
        settings.recovery_poll_interval = Duration::from_millis(5);
        settings
    }

    fn image_file(name: &str, image: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("fieldcom-{}-{}", std::process::id(), name));
        fs::write(&path, image).unwrap();
        path
    }

    #[test]
    fn starts_in_init_without_dialling() {
        let transports = MockTransports::new(0);
        let log = transports.log();
        let session = Session::new(settings(3, Duration::ZERO), transports);
        assert_eq!(session.state(), SessionState::Init);
        assert_eq!(session.transport(), None);
        assert!(log.all().is_empty());
    }

    #[test]
    fn connects_over_tcp_when_it_answers() {
        let transports = MockTransports::new(2);
        let log = transports.log();
        let mut session = Session::new(settings(4, Duration::from_millis(5)), transports);
        assert_eq!(session.connect(), SessionState::StreamConnected);
        assert_eq!(session.transport(), Some(TransportKind::Stream));
        assert_eq!(session.prompt(), "LoPy> ");
        assert_eq!(log.stream_attempts().len(), 3);
        assert!(!log.all().iter().any(|a| matches!(a, Attempt::Scan(_))));
    }

    #[test]
    fn tcp_budget_is_spent_exactly_before_ble_discovery() {
        let delay = Duration::from_millis(30);
        let mut settings = settings(4, delay);
        settings.max_recovery_cycles = Some(1);
        let transports = MockTransports::new(100);
        let log = transports.log();
        let mut session = Session::new(settings, transports);

        assert_eq!(session.connect(), SessionState::Terminated);

        let attempts = log.stream_attempts();
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= delay);
        }
        let all = log.all();
        let first_scan = all
            .iter()
            .position(|a| matches!(a, Attempt::Scan(_)))
            .unwrap();
        assert!(all[..first_scan].iter().all(|a| matches!(a, Attempt::Stream(_))));
        assert!(all[first_scan..].iter().all(|a| !matches!(a, Attempt::Stream(_))));
    }

    #[test]
    fn recovery_cap_exits_with_error() {
        let mut settings = settings(1, Duration::ZERO);
        settings.max_recovery_cycles = Some(2);
        let mut session = Session::new(settings, MockTransports::new(usize::MAX));
        let mut console = ScriptedConsole(VecDeque::new());
        assert_eq!(session.run(&mut console), 1);
    }

    #[test]
    fn wifi_up_over_ble_hands_over_to_tcp() {
        let transports = MockTransports::new(12).advertising(device_advertisement());
        let log = transports.log();
        let mut session = Session::new(settings(12, Duration::from_millis(1)), transports);

        assert_eq!(session.connect(), SessionState::WirelessConnected);
        assert_eq!(session.prompt(), "LoPy-BLE> ");
        assert_eq!(log.stream_attempts().len(), 12);

        session.submit("setwifi home pw");
        assert_eq!(session.state(), SessionState::StreamConnected);
        assert_eq!(session.submit("version"), "fieldfw 1.4.2");
    }

    #[test]
    fn wrong_setwifi_arity_sends_nothing() {
        let transports = MockTransports::new(0);
        let mut session = Session::new(settings(1, Duration::ZERO), transports);
        session.connect();
        assert_eq!(session.submit("setwifi onlyssid"), "usage: SETWIFI <ssid> <pwd>");
        assert_eq!(session.state(), SessionState::StreamConnected);
    }

    #[test]
    fn ble_commands_and_sensor_read() {
        let transports = MockTransports::new(usize::MAX).advertising(device_advertisement());
        let mut session = Session::new(settings(1, Duration::ZERO), transports);
        session.connect();
        assert_eq!(session.submit("status"), "OK status");
        // The scripted device has a sensor endpoint but nothing to read on it.
        assert_eq!(session.submit("dht?"), "[BLE][DHT] (empty)");
    }

    #[test]
    fn failed_command_is_replayed_after_reconnect() {
        let dials = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dials);
        let transports = MockTransports::new(0).with_stream(move || {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            MockStreamLink::new(move |line| match line {
                "flaky" if first => None,
                other => device_reply(other),
            })
        });
        let mut session = Session::new(settings(2, Duration::ZERO), transports);
        session.connect();

        assert_eq!(session.submit("flaky"), "OK flaky");
        assert_eq!(session.state(), SessionState::StreamConnected);
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn setwifi_over_tcp_is_sent_as_text() {
        let wires = Arc::new(Mutex::new(Vec::new()));
        let transports = {
            let wires = Arc::clone(&wires);
            MockTransports::new(0).with_stream(move || {
                let link = MockStreamLink::device();
                wires.lock().unwrap().push(link.written());
                link
            })
        };
        let mut session = Session::new(settings(1, Duration::ZERO), transports);
        session.connect();

        assert_eq!(session.submit("setwifi home secret"), "OK SETWIFI home secret");
        let lines = wires.lock().unwrap()[0].lines();
        assert_eq!(lines.last().map(String::as_str), Some("SETWIFI home secret"));
    }

    #[test]
    fn failed_keepalive_reconnects() {
        let transports = MockTransports::new(0).with_stream(|| {
            MockStreamLink::new(|line| match line {
                "PING" => Some("BUSY".into()),
                other => device_reply(other),
            })
        });
        let log = transports.log();
        let mut session = Session::new(settings(1, Duration::ZERO), transports);
        session.ctx.settings.keepalive_grace = Duration::ZERO;
        session.ctx.settings.keepalive_interval = Duration::ZERO;
        session.connect();

        session.tick();
        assert_eq!(session.state(), SessionState::StreamConnected);
        assert_eq!(log.stream_attempts().len(), 2);
    }

    #[test]
    fn healthy_keepalive_keeps_the_channel() {
        let transports = MockTransports::new(0);
        let log = transports.log();
        let mut session = Session::new(settings(1, Duration::ZERO), transports);
        session.ctx.settings.keepalive_grace = Duration::ZERO;
        session.ctx.settings.keepalive_interval = Duration::ZERO;
        session.connect();

        assert_eq!(session.tick(), None);
        assert_eq!(log.stream_attempts().len(), 1);
    }

    #[test]
    fn second_upload_is_rejected_while_one_is_in_flight() {
        let mut session = Session::new(settings(1, Duration::ZERO), MockTransports::new(0));
        session.connect();
        let lock = session.transfer_lock();
        let _in_flight = lock.try_acquire().unwrap();
        assert!(matches!(
            session.upload_firmware(Some(Path::new("app.bin"))),
            Err(Error::UploadInProgress)
        ));
    }

    #[test]
    fn stream_upload_recovers_over_tcp() {
        let path = image_file("tcp.bin", &[0xa5; 4096]);
        let transports = MockTransports::new(0);
        let log = transports.log();
        let mut session = Session::new(settings(1, Duration::ZERO), transports);
        session.connect();

        let report = session.upload_firmware(Some(&path)).unwrap();
        assert_eq!(report.bytes_sent, 4096);
        assert_eq!(session.state(), SessionState::StreamConnected);
        assert_eq!(log.stream_attempts().len(), 2);
        assert!(!session.transfer_lock().is_busy());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn ble_upload_recovers_over_tcp() {
        let path = image_file("ble.bin", &[0x5a; 100]);
        let transports = MockTransports::new(usize::MAX).advertising(device_advertisement());
        let failures = transports.stream_failures();
        let mut session = Session::new(settings(1, Duration::ZERO), transports);
        assert_eq!(session.connect(), SessionState::WirelessConnected);

        failures.store(0, Ordering::SeqCst);
        let display = session.submit(&format!("ota {}", path.display()));
        assert!(display.starts_with("[OTA] 100 bytes sent"), "{}", display);
        assert_eq!(session.state(), SessionState::StreamConnected);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn failed_ble_upload_falls_back_to_reconnect_polling() {
        let path = image_file("ble-fail.bin", &[0x5a; 400]);
        let links = Arc::new(Mutex::new(Vec::new()));
        let transports = {
            let links = Arc::clone(&links);
            MockTransports::new(usize::MAX)
                .advertising(device_advertisement())
                .with_gatt(move || {
                    let mut link = MockGattLink::device();
                    link.fail_data_writes_after(2);
                    links.lock().unwrap().push(link.log());
                    link
                })
        };
        let failures = transports.stream_failures();
        let log = transports.log();
        let mut session = Session::new(settings(1, Duration::ZERO), transports);
        assert_eq!(session.connect(), SessionState::WirelessConnected);
        let dials_before = log.stream_attempts().len();

        failures.store(0, Ordering::SeqCst);
        let display = session.submit(&format!("ota {}", path.display()));
        assert!(display.starts_with("[OTA] upload failed"), "{}", display);
        assert_eq!(session.state(), SessionState::StreamConnected);
        assert!(log.stream_attempts().len() > dials_before);

        let first = links.lock().unwrap()[0].clone();
        assert_eq!(first.failed_writes(), 1);
        assert_eq!(first.disconnects(), 1);
        assert!(!session.transfer_lock().is_busy());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn quit_terminates_and_run_exits_cleanly() {
        let mut session = Session::new(settings(1, Duration::ZERO), MockTransports::new(0));
        let mut console = ScriptedConsole(VecDeque::from(vec![
            Input::Line("version".into()),
            Input::Idle,
            Input::Line("/q".into()),
        ]));
        assert_eq!(session.run(&mut console), 0);
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(session.submit("version"), "[FC] session closed");
    }

    #[test]
    fn closed_console_ends_the_session() {
        let mut session = Session::new(settings(1, Duration::ZERO), MockTransports::new(0));
        let mut console = ScriptedConsole(VecDeque::new());
        assert_eq!(session.run(&mut console), 0);
    }
}

//! Scripted in-memory transports for the unit tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::{
    capabilities::{CapabilityMap, ServiceInfo},
    channel::{GattLink, Notification, StreamLink},
    error::{Error, Result},
    locator::{Advertisement, Scanner},
    transports::{Transports, WirelessLink},
};

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

// -----------------------------------------------------------------------------
// Device description
// -----------------------------------------------------------------------------

fn role_uuid(prefix: u16) -> Uuid {
    Uuid::parse_str(&format!("efbe{:04x}-fbfb-fbfb-fb4b-494545434954", prefix))
        .unwrap_or_else(|e| panic!("bad test uuid: {}", e))
}

/// Service tree of a device exposing every role.
pub(crate) fn device_services() -> Vec<ServiceInfo> {
    vec![
        ServiceInfo {
            uuid: Uuid::parse_str("00001801-0000-1000-8000-00805f9b34fb").unwrap(),
            characteristics: vec![],
        },
        ServiceInfo {
            uuid: role_uuid(0x0000),
            characteristics: (1..=8).map(|i| role_uuid(i << 8)).collect(),
        },
    ]
}

pub(crate) fn device_capabilities() -> CapabilityMap {
    CapabilityMap::resolve(&device_services()).unwrap()
}

pub(crate) fn device_advertisement() -> Advertisement {
    Advertisement {
        id: "hci0/AA:BB:CC:DD:EE:FF".into(),
        address: "AA:BB:CC:DD:EE:FF".into(),
        name: Some("LoPy4".into()),
        services: vec![],
    }
}

// -----------------------------------------------------------------------------
// Scanner
// -----------------------------------------------------------------------------

pub(crate) struct StaticScanner {
    seen: Vec<Advertisement>,
    fail: bool,
}

impl StaticScanner {
    pub fn new(seen: Vec<Advertisement>) -> Self {
        StaticScanner { seen, fail: false }
    }

    pub fn failing() -> Self {
        StaticScanner {
            seen: vec![],
            fail: true,
        }
    }
}

impl Scanner for StaticScanner {
    fn scan(&mut self, _timeout: Duration) -> Result<Vec<Advertisement>> {
        if self.fail {
            Err(Error::Wireless("adapter powered off".into()))
        } else {
            Ok(self.seen.clone())
        }
    }
}

// -----------------------------------------------------------------------------
// Byte stream
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub(crate) struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything written to a [`MockStreamLink`].
#[derive(Debug, Clone, Default)]
pub(crate) struct Wire(Arc<Mutex<Vec<u8>>>);

impl Wire {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    /// The written text lines (lossy), for command-level assertions.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.bytes())
            .lines()
            .map(String::from)
            .collect()
    }
}

/// Stream link answering each written line through a closure. Reads never
/// block: an empty input queue is a timeout.
pub(crate) struct MockStreamLink {
    responder: Responder,
    pending: Vec<u8>,
    incoming: VecDeque<u8>,
    wire: Wire,
    shutdowns: Counter,
    write_limit: Option<usize>,
}

impl MockStreamLink {
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        MockStreamLink {
            responder: Box::new(responder),
            pending: Vec::new(),
            incoming: VecDeque::new(),
            wire: Wire::default(),
            shutdowns: Counter::default(),
            write_limit: None,
        }
    }

    /// A device answering the usual handshake.
    pub fn device() -> Self {
        MockStreamLink::new(device_reply)
    }

    pub fn push_incoming(&mut self, bytes: &[u8]) {
        self.incoming.extend(bytes);
    }

    /// Fail every write once `limit` bytes have gone out.
    pub fn fail_writes_after(&mut self, limit: usize) {
        self.write_limit = Some(limit);
    }

    pub fn written(&self) -> Wire {
        self.wire.clone()
    }

    pub fn shutdowns(&self) -> Counter {
        self.shutdowns.clone()
    }
}

/// Replies of a healthy device.
pub(crate) fn device_reply(line: &str) -> Option<String> {
    match line {
        l if l.starts_with("AUTH ") => Some("AUTH OK".into()),
        "PING" => Some("PONG".into()),
        "version" => Some("fieldfw 1.4.2".into()),
        l if l.starts_with("OTA ") => Some("ACK".into()),
        _ => Some(format!("OK {}", line)),
    }
}

impl StreamLink for MockStreamLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut wire = self.wire.0.lock().unwrap();
        if let Some(limit) = self.write_limit {
            if wire.len() + data.len() > limit {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection reset"));
            }
        }
        wire.extend_from_slice(data);
        drop(wire);

        for &byte in data {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.pending).to_string();
                self.pending.clear();
                if let Some(reply) = (self.responder)(&line) {
                    self.incoming.extend(reply.as_bytes());
                    self.incoming.push_back(b'\n');
                }
            } else {
                self.pending.push(byte);
            }
        }
        Ok(())
    }

    fn read_byte(&mut self, _timeout: Duration) -> io::Result<Option<u8>> {
        match self.incoming.pop_front() {
            Some(byte) => Ok(Some(byte)),
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.shutdowns.bump();
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// GATT
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct GattState {
    writes: Vec<(Uuid, Vec<u8>, bool)>,
    failed_writes: usize,
    unsubscribe_attempts: usize,
    disconnects: usize,
}

/// Inspection handle on a [`MockGattLink`].
#[derive(Debug, Clone, Default)]
pub(crate) struct GattLog(Arc<Mutex<GattState>>);

impl GattLog {
    pub fn writes_to(&self, endpoint: Uuid) -> Vec<Vec<u8>> {
        let state = self.0.lock().unwrap();
        state
            .writes
            .iter()
            .filter(|(uuid, _, _)| *uuid == endpoint)
            .map(|(_, data, _)| data.clone())
            .collect()
    }

    pub fn data_writes_unacknowledged(&self, endpoint: Uuid) -> bool {
        let state = self.0.lock().unwrap();
        state
            .writes
            .iter()
            .filter(|(uuid, _, _)| *uuid == endpoint)
            .all(|(_, _, acknowledged)| !acknowledged)
    }

    pub fn failed_writes(&self) -> usize {
        self.0.lock().unwrap().failed_writes
    }

    pub fn unsubscribe_attempts(&self) -> usize {
        self.0.lock().unwrap().unsubscribe_attempts
    }

    pub fn disconnects(&self) -> usize {
        self.0.lock().unwrap().disconnects
    }
}

/// Pushes notifications into a [`MockGattLink`] from the test body.
#[derive(Clone)]
pub(crate) struct Injector(Sender<Notification>);

impl Injector {
    pub fn notify(&self, endpoint: Uuid, value: &[u8]) {
        let _ = self.0.send(Notification {
            endpoint,
            value: value.to_vec(),
        });
    }
}

/// GATT peer exposing [`device_services`]. Commands written to command-in
/// are answered through the responder, as a status-out notification when
/// subscribed, else as the next value read from status-out.
pub(crate) struct MockGattLink {
    caps: CapabilityMap,
    responder: Responder,
    log: GattLog,
    tx: Option<Sender<Notification>>,
    rx: Option<Receiver<Notification>>,
    subscribed: HashSet<Uuid>,
    refused: HashSet<Uuid>,
    reads: HashMap<Uuid, VecDeque<Vec<u8>>>,
    failing_reads: usize,
    fail_unsubscribe: bool,
    data_write_limit: Option<usize>,
    failing_control: Option<String>,
    wifi_reply: Option<String>,
    mtu: usize,
}

impl MockGattLink {
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        MockGattLink {
            caps: device_capabilities(),
            responder: Box::new(responder),
            log: GattLog::default(),
            tx: Some(tx),
            rx: Some(rx),
            subscribed: HashSet::new(),
            refused: HashSet::new(),
            reads: HashMap::new(),
            failing_reads: 0,
            fail_unsubscribe: false,
            data_write_limit: None,
            failing_control: None,
            wifi_reply: None,
            mtu: 23,
        }
    }

    /// A device answering the usual handshake and reporting an IP address
    /// after new Wi-Fi credentials.
    pub fn device() -> Self {
        let mut link = MockGattLink::new(device_reply);
        link.on_network_config("WiFi: got IP 10.0.0.5");
        link
    }

    pub fn log(&self) -> GattLog {
        self.log.clone()
    }

    pub fn injector(&self) -> Injector {
        match &self.tx {
            Some(tx) => Injector(tx.clone()),
            None => panic!("link already disconnected"),
        }
    }

    pub fn refuse_subscribe(&mut self, endpoint: Uuid) {
        self.refused.insert(endpoint);
    }

    pub fn queue_read(&mut self, endpoint: Uuid, value: &[u8]) {
        self.reads.entry(endpoint).or_default().push_back(value.to_vec());
    }

    /// Fail the next `count` reads, whatever the endpoint.
    pub fn fail_reads(&mut self, count: usize) {
        self.failing_reads = count;
    }

    pub fn fail_unsubscribe(&mut self) {
        self.fail_unsubscribe = true;
    }

    /// Let `count` data frames through, fail the following ones.
    pub fn fail_data_writes_after(&mut self, count: usize) {
        self.data_write_limit = Some(count);
    }

    pub fn fail_control(&mut self, command: &str) {
        self.failing_control = Some(command.to_string());
    }

    /// Status line notified on status-out after a network-config write.
    pub fn on_network_config(&mut self, line: &str) {
        self.wifi_reply = Some(line.to_string());
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    fn answer(&mut self, line: String) {
        let status_out = self.caps.status_out;
        if self.subscribed.contains(&status_out) {
            if let Some(tx) = &self.tx {
                let _ = tx.send(Notification {
                    endpoint: status_out,
                    value: line.into_bytes(),
                });
            }
        } else {
            self.queue_read(status_out, line.as_bytes());
        }
    }

    fn should_fail(&self, endpoint: Uuid, data: &[u8]) -> bool {
        let state = self.log.0.lock().unwrap();
        if Some(endpoint) == self.caps.upload_data {
            if let Some(limit) = self.data_write_limit {
                let sent = state.writes.iter().filter(|(u, _, _)| *u == endpoint).count();
                return sent >= limit;
            }
        }
        if Some(endpoint) == self.caps.upload_control {
            if let Some(command) = &self.failing_control {
                return data == command.as_bytes();
            }
        }
        false
    }
}

impl GattLink for MockGattLink {
    fn write(&mut self, endpoint: Uuid, data: &[u8], acknowledged: bool) -> Result<()> {
        if self.tx.is_none() {
            return Err(Error::Wireless("not connected".into()));
        }
        if self.should_fail(endpoint, data) {
            self.log.0.lock().unwrap().failed_writes += 1;
            return Err(Error::Wireless("write rejected".into()));
        }
        self.log
            .0
            .lock()
            .unwrap()
            .writes
            .push((endpoint, data.to_vec(), acknowledged));

        if endpoint == self.caps.command_in {
            let line = String::from_utf8_lossy(data).trim_end_matches('\n').to_string();
            if let Some(reply) = (self.responder)(&line) {
                self.answer(reply);
            }
        } else if endpoint == self.caps.network_config {
            if let Some(reply) = self.wifi_reply.clone() {
                self.answer(reply);
            }
        }
        Ok(())
    }

    fn read(&mut self, endpoint: Uuid) -> Result<Vec<u8>> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(Error::Wireless("read failed".into()));
        }
        Ok(self
            .reads
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default())
    }

    fn subscribe(&mut self, endpoint: Uuid) -> Result<()> {
        if self.refused.contains(&endpoint) {
            return Err(Error::Wireless("notify not permitted".into()));
        }
        self.subscribed.insert(endpoint);
        Ok(())
    }

    fn unsubscribe(&mut self, endpoint: Uuid) -> Result<()> {
        self.log.0.lock().unwrap().unsubscribe_attempts += 1;
        self.subscribed.remove(&endpoint);
        if self.fail_unsubscribe {
            Err(Error::Wireless("already cancelled".into()))
        } else {
            Ok(())
        }
    }

    fn notifications(&mut self) -> Result<Receiver<Notification>> {
        self.rx
            .take()
            .ok_or_else(|| Error::NotSupported("second notification stream".into()))
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn disconnect(&mut self) -> Result<()> {
        self.log.0.lock().unwrap().disconnects += 1;
        self.tx = None;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Transports
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Attempt {
    Stream(Instant),
    Scan(Duration),
    Wireless,
}

/// Ordered record of the connection attempts made through a
/// [`MockTransports`].
#[derive(Debug, Clone, Default)]
pub(crate) struct AttemptLog(Arc<Mutex<Vec<Attempt>>>);

impl AttemptLog {
    pub fn all(&self) -> Vec<Attempt> {
        self.0.lock().unwrap().clone()
    }

    pub fn stream_attempts(&self) -> Vec<Instant> {
        self.all()
            .into_iter()
            .filter_map(|a| match a {
                Attempt::Stream(at) => Some(at),
                _ => None,
            })
            .collect()
    }

    fn push(&self, attempt: Attempt) {
        self.0.lock().unwrap().push(attempt);
    }
}

type StreamFactory = Box<dyn FnMut() -> MockStreamLink + Send>;
type GattFactory = Box<dyn FnMut() -> MockGattLink + Send>;

/// TCP refuses the first `stream_failures` dials, then connects to links
/// built by the stream factory ([`MockStreamLink::device`] by default). The
/// wireless side advertises `advertised` and connects to links built by the
/// GATT factory.
pub(crate) struct MockTransports {
    log: AttemptLog,
    stream_failures: Arc<AtomicUsize>,
    advertised: Vec<Advertisement>,
    stream: StreamFactory,
    gatt: GattFactory,
}

impl MockTransports {
    pub fn new(stream_failures: usize) -> Self {
        MockTransports {
            log: AttemptLog::default(),
            stream_failures: Arc::new(AtomicUsize::new(stream_failures)),
            advertised: vec![],
            stream: Box::new(MockStreamLink::device),
            gatt: Box::new(MockGattLink::device),
        }
    }

    pub fn advertising(mut self, device: Advertisement) -> Self {
        self.advertised.push(device);
        self
    }

    pub fn with_stream<F>(mut self, factory: F) -> Self
    where
        F: FnMut() -> MockStreamLink + Send + 'static,
    {
        self.stream = Box::new(factory);
        self
    }

    pub fn with_gatt<F>(mut self, factory: F) -> Self
    where
        F: FnMut() -> MockGattLink + Send + 'static,
    {
        self.gatt = Box::new(factory);
        self
    }

    pub fn log(&self) -> AttemptLog {
        self.log.clone()
    }

    /// Handle to make further dials fail (or succeed again) mid-test.
    pub fn stream_failures(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.stream_failures)
    }
}

impl Scanner for MockTransports {
    fn scan(&mut self, timeout: Duration) -> Result<Vec<Advertisement>> {
        self.log.push(Attempt::Scan(timeout));
        Ok(self.advertised.clone())
    }
}

impl Transports for MockTransports {
    fn connect_stream(&mut self, _connect_timeout: Duration) -> Result<Box<dyn StreamLink>> {
        self.log.push(Attempt::Stream(Instant::now()));
        let left = self.stream_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.stream_failures.store(left - 1, Ordering::SeqCst);
            return Err(Error::Connect("connection refused".into()));
        }
        Ok(Box::new((self.stream)()))
    }

    fn connect_wireless(&mut self, _device: &Advertisement) -> Result<WirelessLink> {
        self.log.push(Attempt::Wireless);
        Ok(WirelessLink {
            link: Box::new((self.gatt)()),
            services: device_services(),
        })
    }
}

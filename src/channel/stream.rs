//! Byte-stream channel: newline-framed text commands over a TCP connection.

use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{debug, trace};

use super::{close_quietly, Channel, TransportKind};
use crate::{
    capabilities::Role,
    error::{Error, Result},
    settings::Settings,
    utils::hex_dump,
};

// =============================================================================
// Public Interface
// =============================================================================

/// The raw octet pipe under a [`StreamChannel`].
pub trait StreamLink: Send {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read a single byte, waiting at most `timeout`. `Ok(None)` means the
    /// peer closed the connection.
    fn read_byte(&mut self, timeout: Duration) -> io::Result<Option<u8>>;

    fn shutdown(&mut self) -> io::Result<()>;
}

/// [`StreamLink`] over a real TCP socket.
#[derive(Debug)]
pub struct TcpLink {
    stream: TcpStream,
    read_timeout: Option<Duration>,
}

impl TcpLink {
    /// Dial `host:port`, trying every resolved address within
    /// `connect_timeout` each.
    pub fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Connect(format!("{}:{}: {}", host, port, e)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_write_timeout(Some(non_zero(write_timeout)))?;
                    debug!("tcp connected to {}", addr);
                    return Ok(TcpLink {
                        stream,
                        read_timeout: None,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(Error::Connect(match last_error {
            Some(e) => format!("{}:{}: {}", host, port, e),
            None => format!("{}:{}: no address", host, port),
        }))
    }
}

impl StreamLink for TcpLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    fn read_byte(&mut self, timeout: Duration) -> io::Result<Option<u8>> {
        let timeout = non_zero(timeout);
        if self.read_timeout != Some(timeout) {
            self.stream.set_read_timeout(Some(timeout))?;
            self.read_timeout = Some(timeout);
        }
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }
}

/// Line-framed command channel over a [`StreamLink`].
///
/// Replies are read one byte at a time up to `max_line_len`, `\r` is dropped
/// and invalid UTF-8 is replaced rather than rejected.
pub struct StreamChannel {
    link: Box<dyn StreamLink>,
    command_timeout: Duration,
    max_line_len: usize,
    open: bool,
}

impl StreamChannel {
    pub fn new(link: Box<dyn StreamLink>, settings: &Settings) -> Self {
        StreamChannel {
            link,
            command_timeout: settings.command_timeout,
            max_line_len: settings.max_line_len,
            open: true,
        }
    }

    /// Write `text` followed by `\n`.
    pub fn write_line(&mut self, text: &str) -> Result<()> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.write_bulk(&line)
    }

    /// Read one reply line, each byte waiting at most `timeout`.
    pub fn read_line(&mut self, timeout: Duration) -> Result<String> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        let mut data = Vec::new();
        while data.len() < self.max_line_len {
            match self.link.read_byte(timeout) {
                Ok(Some(b'\n')) => break,
                Ok(Some(b'\r')) => {}
                Ok(Some(byte)) => data.push(byte),
                Ok(None) if data.is_empty() => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by the device",
                    )));
                }
                Ok(None) => break,
                Err(e) if is_timeout(&e) => {
                    return Err(Error::Timeout(format!("no reply within {:?}", timeout)));
                }
                Err(e) => return Err(e.into()),
            }
        }
        hex_dump("tcp reply", &data);
        Ok(String::from_utf8_lossy(&data).trim().to_string())
    }

    /// Send `text` and wait up to `timeout` for the reply.
    pub fn send_command_with_timeout(&mut self, text: &str, timeout: Duration) -> Result<String> {
        trace!("tcp >> {}", text);
        self.write_line(text)?;
        let reply = self.read_line(timeout)?;
        trace!("tcp << {}", reply);
        Ok(reply)
    }
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("open", &self.open)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl Channel for StreamChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn send_command(&mut self, text: &str) -> Result<String> {
        let timeout = self.command_timeout;
        self.send_command_with_timeout(text, timeout)
    }

    fn write_bulk(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::NotConnected);
        }
        self.link.write_all(bytes).map_err(|e| {
            if is_timeout(&e) {
                Error::Timeout(format!("write of {} bytes", bytes.len()))
            } else {
                Error::Io(e)
            }
        })
    }

    fn subscribe(&mut self, role: Role) -> Result<()> {
        Err(Error::NotSupported(format!("{} notifications over tcp", role)))
    }

    fn read_once(&mut self, _role: Role) -> Result<String> {
        let timeout = self.command_timeout;
        self.read_line(timeout)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            close_quietly("tcp link", self.link.shutdown());
            debug!("tcp channel closed");
        }
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Socket timeouts of zero are rejected by the OS layer.
fn non_zero(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader},
        net::TcpListener,
        thread,
    };

    use super::*;
    use crate::{settings::SettingsBuilder, testing::MockStreamLink};

    fn channel_with(link: MockStreamLink) -> StreamChannel {
        StreamChannel::new(Box::new(link), &SettingsBuilder::new().finalize())
    }

    #[test]
    fn strips_carriage_return_and_trims() {
        let link = MockStreamLink::new(|cmd| match cmd {
            "version" => Some("  v1.2.3\r".into()),
            _ => None,
        });
        let mut channel = channel_with(link);
        assert_eq!(channel.send_command("version").unwrap(), "v1.2.3");
    }

    #[test]
    fn silent_peer_times_out() {
        let link = MockStreamLink::new(|_| None);
        let mut channel = channel_with(link);
        match channel.send_command_with_timeout("PING", Duration::from_millis(10)) {
            Err(Error::Timeout(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn long_lines_are_cut_at_the_limit() {
        let long = "x".repeat(600);
        let link = MockStreamLink::new(move |_| Some(long.clone()));
        let mut channel = channel_with(link);
        assert_eq!(channel.send_command("dump").unwrap().len(), 512);
    }

    #[test]
    fn invalid_utf8_is_tolerated() {
        let mut link = MockStreamLink::new(|_| None);
        link.push_incoming(&[b'o', 0xff, b'k', b'\n']);
        let mut channel = channel_with(link);
        let line = channel.read_line(Duration::from_millis(10)).unwrap();
        assert!(line.starts_with('o') && line.ends_with('k'));
    }

    #[test]
    fn closed_channel_rejects_commands() {
        let link = MockStreamLink::new(|_| Some("ok".into()));
        let shutdowns = link.shutdowns();
        let mut channel = channel_with(link);
        channel.close();
        channel.close();
        assert!(!channel.is_open());
        assert!(matches!(channel.send_command("x"), Err(Error::NotConnected)));
        assert_eq!(shutdowns.get(), 1);
    }

    #[test]
    fn subscribe_is_not_supported() {
        let mut channel = channel_with(MockStreamLink::new(|_| None));
        assert!(matches!(
            channel.subscribe(Role::StatusOut),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn tcp_link_round_trip_on_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(socket.try_clone().unwrap());
            let mut writer = socket;
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "AUTH baker\n");
            writer.write_all(b"AUTH OK\r\n").unwrap();
        });

        let link = TcpLink::connect(
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        let mut channel = channel_with_tcp(link);
        assert_eq!(channel.send_command("AUTH baker").unwrap(), "AUTH OK");
        server.join().unwrap();

        // The server dropped its socket: the next read sees end of stream.
        assert!(matches!(
            channel.read_line(Duration::from_secs(1)),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn tcp_link_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = TcpLink::connect(
            "127.0.0.1",
            port,
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        assert!(matches!(result, Err(Error::Connect(_))));
    }

    fn channel_with_tcp(link: TcpLink) -> StreamChannel {
        StreamChannel::new(Box::new(link), &SettingsBuilder::new().finalize())
    }
}

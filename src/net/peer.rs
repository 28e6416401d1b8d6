//! Outbound TCP connection with reconnect.
//!
//! Connection attempts are bounded and scheduled from the engine tick;
//! failures arm an exponential backoff from one second up to a thirty
//! second ceiling. Mutating the hostname or port while connected tears the
//! connection down and starts over.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use super::ReadOutcome;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// A reconnecting client socket.
#[derive(Debug)]
pub struct TcpPeerSocket {
    hostname: String,
    port: u16,
    state: PeerState,
    stream: Option<TcpStream>,
    backoff: Duration,
    next_attempt: Option<Instant>,
}

impl Default for TcpPeerSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpPeerSocket {
    pub fn new() -> Self {
        Self {
            hostname: String::new(),
            port: 0,
            state: PeerState::Idle,
            stream: None,
            backoff: BACKOFF_INITIAL,
            next_attempt: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn configured(&self) -> bool {
        !self.hostname.is_empty() && self.port != 0
    }

    pub fn connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    /// Endpoint mutation while connected tears down and reinitializes.
    pub fn set_hostname(&mut self, hostname: &str) {
        if self.hostname == hostname {
            return;
        }
        self.hostname = hostname.to_string();
        if self.connected() {
            self.initialize();
        }
    }

    pub fn set_port(&mut self, port: u16) {
        if self.port == port {
            return;
        }
        self.port = port;
        if self.connected() {
            self.initialize();
        }
    }

    /// Reset and start connecting from scratch.
    pub fn initialize(&mut self) {
        self.disconnect();
        if self.configured() {
            self.state = PeerState::Connecting;
            self.backoff = BACKOFF_INITIAL;
            self.next_attempt = Some(Instant::now());
        }
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
        self.state = PeerState::Idle;
        self.next_attempt = None;
    }

    /// Drive the connection state machine; called once per engine tick.
    pub fn poll_connect(&mut self) {
        if self.connected() || !self.configured() {
            return;
        }
        if self.state == PeerState::Idle {
            return;
        }
        let due = self.next_attempt.map(|at| Instant::now() >= at).unwrap_or(true);
        if !due {
            return;
        }
        match self.try_connect() {
            Ok(stream) => {
                log::info!("connected to {}:{}", self.hostname, self.port);
                self.stream = Some(stream);
                self.state = PeerState::Connected;
                self.backoff = BACKOFF_INITIAL;
                self.next_attempt = None;
            }
            Err(err) => {
                log::debug!(
                    "connect to {}:{} failed ({err}), retry in {:?}",
                    self.hostname,
                    self.port,
                    self.backoff
                );
                self.state = PeerState::Disconnected;
                self.next_attempt = Some(Instant::now() + self.backoff);
                self.backoff = (self.backoff * 2).min(BACKOFF_CEILING);
            }
        }
    }

    fn try_connect(&self) -> std::io::Result<TcpStream> {
        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no address for {}:{}", self.hostname, self.port),
        );
        for addr in (self.hostname.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    pub fn read_nonblocking(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return ReadOutcome::WouldBlock,
        };
        match stream.read(buf) {
            Ok(0) => {
                log::info!("{}:{} closed by peer", self.hostname, self.port);
                self.mark_disconnected();
                ReadOutcome::Closed
            }
            Ok(n) => ReadOutcome::Data(n),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(err) => {
                log::warn!("read error on {}:{}: {err}", self.hostname, self.port);
                self.mark_disconnected();
                ReadOutcome::Closed
            }
        }
    }

    /// Write the whole buffer, spinning briefly through WouldBlock. Errors
    /// transition to disconnected; the engine sees it as connection state.
    pub fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(0),
        };
        let mut written = 0;
        while written < buf.len() {
            match stream.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => {
                    log::warn!("write error on {}:{}: {err}", self.hostname, self.port);
                    self.mark_disconnected();
                    return Err(err);
                }
            }
        }
        Ok(written)
    }

    fn mark_disconnected(&mut self) {
        self.stream = None;
        self.state = PeerState::Disconnected;
        self.next_attempt = Some(Instant::now() + self.backoff);
        self.backoff = (self.backoff * 2).min(BACKOFF_CEILING);
    }
}

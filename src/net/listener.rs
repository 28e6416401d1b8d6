//! Inbound TCP listener owning at most one client.
//!
//! Additional clients that try to attach while one is connected are
//! accepted and immediately closed, keeping ownership simple. Writes with
//! no client attached are dropped with a warning counter.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use super::ReadOutcome;

#[derive(Debug, Default)]
pub struct TcpServerListener {
    port: u16,
    listener: Option<TcpListener>,
    client: Option<TcpStream>,
    dropped_writes: u64,
}

impl TcpServerListener {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Local port after binding; differs from `port()` when bound to 0.
    pub fn bound_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    pub fn configured(&self) -> bool {
        self.port != 0
    }

    pub fn initialized(&self) -> bool {
        self.listener.is_some()
    }

    pub fn connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes
    }

    /// Rebind if the port changes while listening.
    pub fn set_port(&mut self, port: u16) {
        if self.port == port {
            return;
        }
        self.port = port;
        if self.initialized() {
            self.shutdown();
            if let Err(err) = self.initialize() {
                log::error!("rebind to port {port} failed: {err}");
            }
        }
    }

    /// Bind and start listening, non-blocking.
    pub fn initialize(&mut self) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        listener.set_nonblocking(true)?;
        log::info!("listening on port {}", self.port);
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept a pending client if we have none; close extras.
    pub fn accept_pending(&mut self) {
        let listener = match self.listener.as_ref() {
            Some(listener) => listener,
            None => return,
        };
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if self.client.is_some() {
                        log::warn!("rejecting extra client from {addr} on port {}", self.port);
                        drop(stream);
                        continue;
                    }
                    if let Err(err) = stream.set_nonblocking(true) {
                        log::warn!("failed to set client non-blocking: {err}");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    log::info!("client {addr} attached on port {}", self.port);
                    self.client = Some(stream);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("accept failed on port {}: {err}", self.port);
                    break;
                }
            }
        }
    }

    pub fn read_nonblocking(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let client = match self.client.as_mut() {
            Some(client) => client,
            None => return ReadOutcome::WouldBlock,
        };
        match client.read(buf) {
            Ok(0) => {
                log::info!("client on port {} disconnected", self.port);
                self.client = None;
                ReadOutcome::Closed
            }
            Ok(n) => ReadOutcome::Data(n),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(err) => {
                log::warn!("client read error on port {}: {err}", self.port);
                self.client = None;
                ReadOutcome::Closed
            }
        }
    }

    /// Write to the attached client; silently drops (with a counter) when
    /// nobody is attached.
    pub fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let client = match self.client.as_mut() {
            Some(client) => client,
            None => {
                self.dropped_writes += 1;
                log::debug!(
                    "dropped write on port {} (no client, {} so far)",
                    self.port,
                    self.dropped_writes
                );
                return Ok(0);
            }
        };
        let mut written = 0;
        while written < buf.len() {
            match client.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => {
                    log::warn!("client write error on port {}: {err}", self.port);
                    self.client = None;
                    return Err(err);
                }
            }
        }
        Ok(written)
    }

    pub fn disconnect_client(&mut self) {
        if self.client.take().is_some() {
            log::info!("detached client on port {}", self.port);
        }
    }

    pub fn shutdown(&mut self) {
        self.client = None;
        self.listener = None;
    }
}

//! Observatory-facing listeners.
//!
//! Always a command listener plus one or more data listeners. Standard
//! mode has a single data listener on the configured data port; multi mode
//! replicates the data listener across the registered port set. Re-adding
//! a port keeps its already-bound listener, so duplicate adds are
//! idempotent.

use crate::config::{ObservatoryType, PortAgentConfig};
use crate::net::{ReadOutcome, TcpServerListener};

pub struct ObservatoryConnection {
    command: TcpServerListener,
    data: Vec<TcpServerListener>,
}

impl ObservatoryConnection {
    pub fn new() -> Self {
        Self {
            command: TcpServerListener::new(0),
            data: Vec::new(),
        }
    }

    /// Rebuild the listener set from the configuration, preserving bound
    /// listeners whose port is unchanged.
    pub fn configure(&mut self, config: &PortAgentConfig) {
        self.command.set_port(config.observatory_command_port());

        let wanted: Vec<u16> = match config.observatory_type() {
            ObservatoryType::Standard => vec![config.observatory_data_port()],
            ObservatoryType::Multi => {
                if config.data_ports().is_empty() {
                    vec![config.observatory_data_port()]
                } else {
                    config.data_ports().ports().to_vec()
                }
            }
        };
        let wanted: Vec<u16> = wanted.into_iter().filter(|&p| p != 0).collect();

        let mut rebuilt = Vec::with_capacity(wanted.len());
        for port in wanted {
            match self.data.iter().position(|l| l.port() == port) {
                Some(index) => rebuilt.push(self.data.swap_remove(index)),
                None => rebuilt.push(TcpServerListener::new(port)),
            }
        }
        for stale in &self.data {
            log::info!("dropping observatory data listener on port {}", stale.port());
        }
        self.data = rebuilt;
    }

    /// Bind any listener that is configured but not yet listening.
    pub fn initialize(&mut self) -> std::io::Result<()> {
        if self.command.configured() && !self.command.initialized() {
            self.command.initialize()?;
        }
        for listener in &mut self.data {
            if listener.configured() && !listener.initialized() {
                listener.initialize()?;
            }
        }
        Ok(())
    }

    pub fn initialized(&self) -> bool {
        self.command.initialized() && !self.data.is_empty() && self.data.iter().all(|l| l.initialized())
    }

    /// Accept pending clients on every listener.
    pub fn service(&mut self) {
        self.command.accept_pending();
        for listener in &mut self.data {
            listener.accept_pending();
        }
    }

    pub fn command_connected(&self) -> bool {
        self.command.connected()
    }

    /// Any attached data client counts as a connected observatory.
    pub fn data_connected(&self) -> bool {
        self.data.iter().any(|l| l.connected())
    }

    pub fn read_command(&mut self, buf: &mut [u8]) -> ReadOutcome {
        self.command.read_nonblocking(buf)
    }

    /// Drain and discard data-channel input; the data channel is
    /// output-only, the read only notices client closes.
    pub fn drain_data_clients(&mut self) {
        let mut scratch = [0u8; 512];
        for listener in &mut self.data {
            loop {
                match listener.read_nonblocking(&mut scratch) {
                    ReadOutcome::Data(_) => continue,
                    ReadOutcome::WouldBlock | ReadOutcome::Closed => break,
                }
            }
        }
    }

    /// Fan a framed packet out to every attached data client.
    pub fn write_data(&mut self, wire: &[u8]) {
        for listener in &mut self.data {
            if listener.connected() {
                if let Err(err) = listener.write(wire) {
                    log::warn!("observatory data write failed: {err}");
                }
            }
        }
    }

    /// Send a framed reply to the command client.
    pub fn write_command(&mut self, wire: &[u8]) {
        if let Err(err) = self.command.write(wire) {
            log::warn!("observatory command write failed: {err}");
        }
    }

    pub fn command_bound_port(&self) -> Option<u16> {
        self.command.bound_port()
    }

    pub fn data_listener_ports(&self) -> Vec<u16> {
        self.data.iter().map(|l| l.port()).collect()
    }

    pub fn shutdown(&mut self) {
        self.command.shutdown();
        for listener in &mut self.data {
            listener.shutdown();
        }
    }
}

impl Default for ObservatoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

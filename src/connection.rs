//! Instrument connection adapters.
//!
//! One tagged variant per transport, each a composition of the serial and
//! TCP primitives, surfacing a uniform contract to the engine: configured,
//! initialized, connected, initialize, read, write per channel, and a
//! serial-only break. Mutating an endpoint while connected disconnects and
//! reinitializes that endpoint only.

use std::time::{Duration, Instant};

use crate::config::{InstrumentType, PortAgentConfig};
use crate::error::AgentError;
use crate::net::{PeerState, ReadOutcome, TcpPeerSocket};
use crate::serial::{SerialLine, SerialSettings};

/// Delay between reopen attempts on a failing serial device.
const SERIAL_RETRY: Duration = Duration::from_secs(1);

/// Serial instrument: one character device, no command channel.
pub struct SerialConnection {
    line: SerialLine,
    last_open_attempt: Option<Instant>,
}

/// Plain TCP instrument: one data socket, no command channel.
#[derive(Debug)]
pub struct TcpConnection {
    data: TcpPeerSocket,
}

/// BOTPT instrument: split sockets on one host, TX for writes and RX for
/// reads.
#[derive(Debug)]
pub struct BotptConnection {
    tx: TcpPeerSocket,
    rx: TcpPeerSocket,
}

/// RSN instrument: a data socket plus a parallel instrument-side command
/// socket.
#[derive(Debug)]
pub struct RsnConnection {
    data: TcpPeerSocket,
    command: TcpPeerSocket,
}

pub enum InstrumentConnection {
    Serial(SerialConnection),
    Tcp(TcpConnection),
    Botpt(BotptConnection),
    Rsn(RsnConnection),
}

impl InstrumentConnection {
    /// Build an adapter for the configured instrument type.
    pub fn from_type(kind: InstrumentType) -> Option<Self> {
        match kind {
            InstrumentType::Serial => Some(InstrumentConnection::Serial(SerialConnection {
                line: SerialLine::new(String::new(), SerialSettings::default()),
                last_open_attempt: None,
            })),
            InstrumentType::Tcp => Some(InstrumentConnection::Tcp(TcpConnection {
                data: TcpPeerSocket::new(),
            })),
            InstrumentType::Botpt => Some(InstrumentConnection::Botpt(BotptConnection {
                tx: TcpPeerSocket::new(),
                rx: TcpPeerSocket::new(),
            })),
            InstrumentType::Rsn => Some(InstrumentConnection::Rsn(RsnConnection {
                data: TcpPeerSocket::new(),
                command: TcpPeerSocket::new(),
            })),
            InstrumentType::Unknown => None,
        }
    }

    pub fn kind(&self) -> InstrumentType {
        match self {
            InstrumentConnection::Serial(_) => InstrumentType::Serial,
            InstrumentConnection::Tcp(_) => InstrumentType::Tcp,
            InstrumentConnection::Botpt(_) => InstrumentType::Botpt,
            InstrumentConnection::Rsn(_) => InstrumentType::Rsn,
        }
    }

    /// Push endpoint settings from the configuration into the adapter.
    ///
    /// TCP endpoints tear down and reinitialize themselves when their host
    /// or port changes while connected. The serial device honors the two
    /// dirty flags: a changed device path forces a full reopen, changed
    /// line settings alone reparameterize in place. The caller clears the
    /// flags afterwards.
    pub fn apply_config(&mut self, config: &PortAgentConfig) {
        match self {
            InstrumentConnection::Serial(serial) => {
                let settings = SerialSettings {
                    baud: config.baud(),
                    databits: config.databits(),
                    stopbits: config.stopbits(),
                    parity: config.parity(),
                    flow: config.flow(),
                };
                serial.line.set_settings(settings);

                if config.device_path_changed() {
                    serial.line.set_device_path(config.device_path().to_string());
                    serial.line.close();
                    serial.last_open_attempt = None;
                } else if config.serial_settings_changed() && serial.line.is_open() {
                    if let Err(err) = serial.line.apply_line_settings() {
                        log::error!("in-place serial reparameterization failed: {err}");
                        serial.line.close();
                    }
                }
            }
            InstrumentConnection::Tcp(tcp) => {
                tcp.data.set_hostname(config.instrument_addr());
                tcp.data.set_port(config.instrument_data_port());
            }
            InstrumentConnection::Botpt(botpt) => {
                botpt.tx.set_hostname(config.instrument_addr());
                botpt.tx.set_port(config.instrument_data_tx_port());
                botpt.rx.set_hostname(config.instrument_addr());
                botpt.rx.set_port(config.instrument_data_rx_port());
            }
            InstrumentConnection::Rsn(rsn) => {
                rsn.data.set_hostname(config.instrument_addr());
                rsn.data.set_port(config.instrument_data_port());
                rsn.command.set_hostname(config.instrument_addr());
                rsn.command.set_port(config.instrument_command_port());
            }
        }
    }

    pub fn data_configured(&self) -> bool {
        match self {
            InstrumentConnection::Serial(serial) => serial.line.configured(),
            InstrumentConnection::Tcp(tcp) => tcp.data.configured(),
            InstrumentConnection::Botpt(botpt) => botpt.tx.configured() && botpt.rx.configured(),
            InstrumentConnection::Rsn(rsn) => rsn.data.configured(),
        }
    }

    pub fn command_configured(&self) -> bool {
        match self {
            InstrumentConnection::Rsn(rsn) => rsn.command.configured(),
            _ => false,
        }
    }

    pub fn data_initialized(&self) -> bool {
        match self {
            InstrumentConnection::Serial(serial) => serial.line.is_open(),
            InstrumentConnection::Tcp(tcp) => tcp.data.state() != PeerState::Idle,
            InstrumentConnection::Botpt(botpt) => {
                botpt.tx.state() != PeerState::Idle && botpt.rx.state() != PeerState::Idle
            }
            InstrumentConnection::Rsn(rsn) => rsn.data.state() != PeerState::Idle,
        }
    }

    pub fn command_initialized(&self) -> bool {
        match self {
            InstrumentConnection::Rsn(rsn) => rsn.command.state() != PeerState::Idle,
            _ => false,
        }
    }

    pub fn data_connected(&self) -> bool {
        match self {
            InstrumentConnection::Serial(serial) => serial.line.is_open(),
            InstrumentConnection::Tcp(tcp) => tcp.data.connected(),
            InstrumentConnection::Botpt(botpt) => botpt.tx.connected() && botpt.rx.connected(),
            InstrumentConnection::Rsn(rsn) => rsn.data.connected(),
        }
    }

    pub fn command_connected(&self) -> bool {
        match self {
            InstrumentConnection::Rsn(rsn) => rsn.command.connected(),
            _ => false,
        }
    }

    pub fn initialize_data(&mut self) {
        match self {
            InstrumentConnection::Serial(serial) => serial.try_open(),
            InstrumentConnection::Tcp(tcp) => tcp.data.initialize(),
            InstrumentConnection::Botpt(botpt) => {
                botpt.tx.initialize();
                botpt.rx.initialize();
            }
            InstrumentConnection::Rsn(rsn) => rsn.data.initialize(),
        }
    }

    pub fn initialize_command(&mut self) {
        if let InstrumentConnection::Rsn(rsn) = self {
            rsn.command.initialize();
        }
    }

    /// Drive reconnects; called once per engine tick.
    pub fn poll(&mut self) {
        match self {
            InstrumentConnection::Serial(serial) => {
                if serial.line.configured() && !serial.line.is_open() {
                    serial.try_open();
                }
            }
            InstrumentConnection::Tcp(tcp) => tcp.data.poll_connect(),
            InstrumentConnection::Botpt(botpt) => {
                botpt.tx.poll_connect();
                botpt.rx.poll_connect();
            }
            InstrumentConnection::Rsn(rsn) => {
                rsn.data.poll_connect();
                rsn.command.poll_connect();
            }
        }
    }

    /// Read instrument data. BOTPT reads only from the RX socket.
    pub fn read_data(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self {
            InstrumentConnection::Serial(serial) => match serial.line.read_nonblocking(buf) {
                Ok(outcome) => outcome,
                Err(err) => {
                    log::warn!("serial read error: {err}");
                    serial.line.close();
                    ReadOutcome::Closed
                }
            },
            InstrumentConnection::Tcp(tcp) => tcp.data.read_nonblocking(buf),
            InstrumentConnection::Botpt(botpt) => botpt.rx.read_nonblocking(buf),
            InstrumentConnection::Rsn(rsn) => rsn.data.read_nonblocking(buf),
        }
    }

    /// Write toward the instrument. BOTPT writes only to the TX socket.
    pub fn write_data(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            InstrumentConnection::Serial(serial) => serial.line.write(buf),
            InstrumentConnection::Tcp(tcp) => tcp.data.write(buf),
            InstrumentConnection::Botpt(botpt) => botpt.tx.write(buf),
            InstrumentConnection::Rsn(rsn) => rsn.data.write(buf),
        }
    }

    pub fn read_command(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self {
            InstrumentConnection::Rsn(rsn) => rsn.command.read_nonblocking(buf),
            _ => ReadOutcome::WouldBlock,
        }
    }

    pub fn write_command(&mut self, buf: &[u8]) -> Result<usize, AgentError> {
        match self {
            InstrumentConnection::Rsn(rsn) => Ok(rsn.command.write(buf)?),
            _ => Err(AgentError::UnsupportedOp("instrument command channel")),
        }
    }

    /// Assert a line break; serial only.
    pub fn send_break(&mut self, duration_ms: u32) -> Result<(), AgentError> {
        match self {
            InstrumentConnection::Serial(serial) => serial
                .line
                .send_break(duration_ms)
                .map_err(|err| AgentError::Device(err.to_string())),
            _ => Err(AgentError::UnsupportedOp("break")),
        }
    }

    pub fn shutdown(&mut self) {
        match self {
            InstrumentConnection::Serial(serial) => serial.line.close(),
            InstrumentConnection::Tcp(tcp) => tcp.data.disconnect(),
            InstrumentConnection::Botpt(botpt) => {
                botpt.tx.disconnect();
                botpt.rx.disconnect();
            }
            InstrumentConnection::Rsn(rsn) => {
                rsn.data.disconnect();
                rsn.command.disconnect();
            }
        }
    }
}

impl SerialConnection {
    fn try_open(&mut self) {
        if !self.line.configured() {
            return;
        }
        let due = self
            .last_open_attempt
            .map(|at| at.elapsed() >= SERIAL_RETRY)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_open_attempt = Some(Instant::now());
        if let Err(err) = self.line.open() {
            log::warn!("serial open failed: {err}");
        }
    }
}

//! Serial line driver for the instrument side.
//!
//! The device is opened raw with a short read timeout standing in for
//! non-blocking reads; a timeout is reported as `WouldBlock` so the engine
//! tick treats a quiet line like a quiet socket.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::net::ReadOutcome;

/// Read timeout used to emulate non-blocking reads.
const READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Line settings applied as a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud: u32,
    pub databits: u16,
    pub stopbits: u16,
    /// 0 none, 1 odd, 2 even
    pub parity: u16,
    /// 0 none, 1 software, 2 hardware
    pub flow: u16,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud: 0,
            databits: 8,
            stopbits: 1,
            parity: 0,
            flow: 0,
        }
    }
}

impl SerialSettings {
    fn data_bits(&self) -> DataBits {
        match self.databits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> StopBits {
        match self.stopbits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    fn parity(&self) -> Parity {
        match self.parity {
            1 => Parity::Odd,
            2 => Parity::Even,
            _ => Parity::None,
        }
    }

    fn flow_control(&self) -> FlowControl {
        match self.flow {
            1 => FlowControl::Software,
            2 => FlowControl::Hardware,
            _ => FlowControl::None,
        }
    }

    pub fn apply_builder(&self, builder: serialport::SerialPortBuilder) -> serialport::SerialPortBuilder {
        builder
            .data_bits(self.data_bits())
            .stop_bits(self.stop_bits())
            .parity(self.parity())
            .flow_control(self.flow_control())
    }
}

/// A character device owned by the serial instrument adapter.
pub struct SerialLine {
    device_path: String,
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for SerialLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLine")
            .field("device_path", &self.device_path)
            .field("settings", &self.settings)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialLine {
    pub fn new(device_path: String, settings: SerialSettings) -> Self {
        Self {
            device_path,
            settings,
            port: None,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Replace the device path. The caller decides whether a reopen is due.
    pub fn set_device_path(&mut self, path: String) {
        self.device_path = path;
    }

    pub fn set_settings(&mut self, settings: SerialSettings) {
        self.settings = settings;
    }

    pub fn configured(&self) -> bool {
        !self.device_path.is_empty() && self.settings.baud != 0
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Open (or reopen) the device with the current settings.
    pub fn open(&mut self) -> Result<()> {
        self.port = None;
        let builder =
            serialport::new(self.device_path.as_str(), self.settings.baud).timeout(READ_TIMEOUT);
        let builder = self.settings.apply_builder(builder);
        let port = builder
            .open()
            .with_context(|| format!("open serial device {}", self.device_path))?;
        log::info!(
            "opened serial device {} at {} baud",
            self.device_path,
            self.settings.baud
        );
        self.port = Some(port);
        Ok(())
    }

    /// Reapply {baud, databits, stopbits, parity, flow} to the open device
    /// without closing it.
    pub fn apply_line_settings(&mut self) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .context("apply_line_settings on a closed device")?;
        port.set_baud_rate(self.settings.baud)?;
        port.set_data_bits(self.settings.data_bits())?;
        port.set_stop_bits(self.settings.stop_bits())?;
        port.set_parity(self.settings.parity())?;
        port.set_flow_control(self.settings.flow_control())?;
        log::info!(
            "reparameterized {}: {} baud {}{}{}",
            self.device_path,
            self.settings.baud,
            self.settings.databits,
            match self.settings.parity {
                1 => "O",
                2 => "E",
                _ => "N",
            },
            self.settings.stopbits
        );
        Ok(())
    }

    pub fn read_nonblocking(&mut self, buf: &mut [u8]) -> std::io::Result<ReadOutcome> {
        let port = match self.port.as_mut() {
            Some(port) => port,
            None => return Ok(ReadOutcome::WouldBlock),
        };
        match port.read(buf) {
            Ok(0) => Ok(ReadOutcome::WouldBlock),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(ReadOutcome::WouldBlock),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(err) => Err(err),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let port = match self.port.as_mut() {
            Some(port) => port,
            None => return Ok(0),
        };
        port.write_all(buf)?;
        port.flush()?;
        Ok(buf.len())
    }

    /// Assert a line break for the given duration. Reads and writes are
    /// suspended until the break completes.
    pub fn send_break(&mut self, duration_ms: u32) -> Result<()> {
        let port = self.port.as_mut().context("send_break on a closed device")?;
        port.set_break()?;
        std::thread::sleep(Duration::from_millis(duration_ms as u64));
        port.clear_break()?;
        log::info!("sent {duration_ms} ms break on {}", self.device_path);
        Ok(())
    }

    pub fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("closed serial device {}", self.device_path);
        }
    }
}

//! Data-log sink: framed instrument packets appended to a rotated file.
//!
//! The base path is the agent's identity data file; rotation appends a
//! time label so each interval gets its own append-only file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Local, Timelike};

use crate::config::RotationType;
use crate::error::AgentError;
use crate::packet::{Packet, PacketType};

pub struct DataLogSink {
    base: PathBuf,
    rotation: RotationType,
    current: Option<(String, File)>,
}

impl DataLogSink {
    pub fn new(base: PathBuf, rotation: RotationType) -> Self {
        Self {
            base,
            rotation,
            current: None,
        }
    }

    pub fn set_base(&mut self, base: PathBuf) {
        if self.base != base {
            self.base = base;
            self.current = None;
        }
    }

    pub fn set_rotation(&mut self, rotation: RotationType) {
        if self.rotation != rotation {
            log::info!("data log rotation changed to {rotation:?}");
            self.rotation = rotation;
            self.current = None;
        }
    }

    /// Time label for the file covering `when`.
    pub fn label(&self, when: DateTime<Local>) -> String {
        match self.rotation {
            RotationType::Daily => when.format("%Y%m%d").to_string(),
            RotationType::Hourly => when.format("%Y%m%d%H").to_string(),
            RotationType::QuarterHourly => {
                format!("{}{:02}", when.format("%Y%m%d%H"), (when.minute() / 15) * 15)
            }
            RotationType::Minute => when.format("%Y%m%d%H%M").to_string(),
        }
    }

    pub fn current_path(&self, label: &str) -> PathBuf {
        let mut name = self
            .base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push('.');
        name.push_str(label);
        self.base.with_file_name(name)
    }

    /// Append the framed packet; only instrument data is logged.
    pub fn publish(&mut self, packet: &Packet, wire: &[u8]) -> Result<(), AgentError> {
        if packet.kind != PacketType::DataFromInstrument {
            return Ok(());
        }

        let label = self.label(Local::now());
        if self.current.as_ref().map(|(l, _)| l.as_str()) != Some(label.as_str()) {
            let path = self.current_path(&label);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|err| {
                    AgentError::LogWriteFailure(format!("open {}: {err}", path.display()))
                })?;
            log::info!("data log rotated to {}", path.display());
            self.current = Some((label, file));
        }

        let result = {
            let (_, file) = self.current.as_mut().expect("file just opened");
            file.write_all(wire)
        };
        if let Err(err) = result {
            self.current = None;
            return Err(AgentError::LogWriteFailure(format!("write data log: {err}")));
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some((_, file)) = self.current.take() {
            let _ = file.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{encode, PacketFactory};
    use chrono::TimeZone;

    fn sink_in_tempdir(rotation: RotationType) -> (tempfile::TempDir, DataLogSink) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("port_agent_9000");
        (dir, DataLogSink::new(base, rotation))
    }

    #[test]
    fn labels_per_rotation_interval() {
        let (_dir, mut sink) = sink_in_tempdir(RotationType::Daily);
        let when = Local.with_ymd_and_hms(2014, 3, 5, 14, 38, 0).unwrap();
        assert_eq!(sink.label(when), "20140305");
        sink.set_rotation(RotationType::Hourly);
        assert_eq!(sink.label(when), "2014030514");
        sink.set_rotation(RotationType::QuarterHourly);
        assert_eq!(sink.label(when), "201403051430");
        sink.set_rotation(RotationType::Minute);
        assert_eq!(sink.label(when), "201403051438");
    }

    #[test]
    fn appends_only_instrument_data() {
        let (_dir, mut sink) = sink_in_tempdir(RotationType::Daily);
        let mut factory = PacketFactory::new();

        let data = factory.make(PacketType::DataFromInstrument, b"sample".to_vec());
        let wire = encode(data.kind, &data.payload, data.timestamp);
        sink.publish(&data, &wire).unwrap();

        let heartbeat = factory.make(PacketType::Heartbeat, Vec::new());
        let hb_wire = encode(heartbeat.kind, &heartbeat.payload, heartbeat.timestamp);
        sink.publish(&heartbeat, &hb_wire).unwrap();

        let label = sink.label(Local::now());
        let logged = std::fs::read(sink.current_path(&label)).unwrap();
        assert_eq!(logged, wire);
    }

    #[test]
    fn write_failure_is_reported() {
        let mut sink = DataLogSink::new(
            PathBuf::from("/nonexistent-dir/port_agent_1"),
            RotationType::Daily,
        );
        let mut factory = PacketFactory::new();
        let packet = factory.make(PacketType::DataFromInstrument, b"x".to_vec());
        let wire = encode(packet.kind, &packet.payload, packet.timestamp);
        assert!(matches!(
            sink.publish(&packet, &wire),
            Err(AgentError::LogWriteFailure(_))
        ));
    }
}

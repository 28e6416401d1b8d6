//! Packet fan-out sinks.
//!
//! The observatory data and command clients are written by the engine
//! (their listeners live on the engine's observatory connection); the
//! sinks here are the ones that own their endpoint outright: the data log
//! and the telnet sniffer. Fan-out is best-effort: a failing sink drops
//! the packet and logs, except the data log which reports a write failure.

pub mod datalog;
pub mod sniffer;

pub use datalog::DataLogSink;
pub use sniffer::TelnetSnifferSink;

use crate::config::PortAgentConfig;
use crate::packet::Packet;

pub struct PublisherSet {
    pub datalog: DataLogSink,
    pub sniffer: Option<TelnetSnifferSink>,
}

impl PublisherSet {
    pub fn new(config: &PortAgentConfig) -> Self {
        let mut set = Self {
            datalog: DataLogSink::new(
                config.datafile(),
                config.rotation_interval(),
            ),
            sniffer: None,
        };
        set.configure(config);
        set
    }

    /// Apply publisher-affecting configuration: sniffer port and wrap
    /// strings, data log base path and rotation.
    pub fn configure(&mut self, config: &PortAgentConfig) {
        self.datalog.set_base(config.datafile());
        self.datalog.set_rotation(config.rotation_interval());

        if config.telnet_sniffer_port() == 0 {
            if self.sniffer.take().is_some() {
                log::info!("telnet sniffer disabled");
            }
            return;
        }
        match &mut self.sniffer {
            Some(sniffer) if sniffer.port() == config.telnet_sniffer_port() => {
                sniffer.set_wrapping(
                    config.telnet_sniffer_prefix().to_string(),
                    config.telnet_sniffer_suffix().to_string(),
                );
            }
            _ => {
                self.sniffer = Some(TelnetSnifferSink::new(
                    config.telnet_sniffer_port(),
                    config.telnet_sniffer_prefix().to_string(),
                    config.telnet_sniffer_suffix().to_string(),
                ));
            }
        }
    }

    /// Accept sniffer clients; called once per engine tick.
    pub fn service(&mut self) {
        if let Some(sniffer) = &mut self.sniffer {
            sniffer.service();
        }
    }

    /// Hand one packet to every interested sink.
    pub fn publish(&mut self, packet: &Packet, wire: &[u8]) {
        if let Err(err) = self.datalog.publish(packet, wire) {
            log::error!("{err}");
        }
        if let Some(sniffer) = &mut self.sniffer {
            sniffer.publish(packet);
        }
    }

    pub fn shutdown(&mut self) {
        self.datalog.close();
        if let Some(sniffer) = &mut self.sniffer {
            sniffer.shutdown();
        }
    }
}

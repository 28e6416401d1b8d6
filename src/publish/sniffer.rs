//! Telnet sniffer sink: one telnet client sees the raw instrument byte
//! stream, each chunk wrapped verbatim in the configured prefix and
//! suffix.

use crate::net::{ReadOutcome, TcpServerListener};
use crate::packet::{Packet, PacketType};

pub struct TelnetSnifferSink {
    listener: TcpServerListener,
    prefix: String,
    suffix: String,
}

impl TelnetSnifferSink {
    pub fn new(port: u16, prefix: String, suffix: String) -> Self {
        Self {
            listener: TcpServerListener::new(port),
            prefix,
            suffix,
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    pub fn connected(&self) -> bool {
        self.listener.connected()
    }

    pub fn set_wrapping(&mut self, prefix: String, suffix: String) {
        self.prefix = prefix;
        self.suffix = suffix;
    }

    /// Bind lazily, accept a client, discard anything the client types.
    pub fn service(&mut self) {
        if !self.listener.initialized() {
            if let Err(err) = self.listener.initialize() {
                log::warn!("telnet sniffer bind failed: {err}");
                return;
            }
        }
        self.listener.accept_pending();

        let mut scratch = [0u8; 256];
        loop {
            match self.listener.read_nonblocking(&mut scratch) {
                ReadOutcome::Data(_) => continue,
                ReadOutcome::WouldBlock | ReadOutcome::Closed => break,
            }
        }
    }

    /// Forward raw instrument bytes, unframed.
    pub fn publish(&mut self, packet: &Packet) {
        if packet.kind != PacketType::DataFromInstrument || !self.listener.connected() {
            return;
        }
        let mut chunk =
            Vec::with_capacity(self.prefix.len() + packet.payload.len() + self.suffix.len());
        chunk.extend_from_slice(self.prefix.as_bytes());
        chunk.extend_from_slice(&packet.payload);
        chunk.extend_from_slice(self.suffix.as_bytes());
        if let Err(err) = self.listener.write(&chunk) {
            log::warn!("telnet sniffer write failed: {err}");
        }
    }

    pub fn shutdown(&mut self) {
        self.listener.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketFactory;
    use std::io::Read;
    use std::net::TcpStream;
    use std::time::Duration;

    #[test]
    fn wraps_payload_with_prefix_and_suffix() {
        let mut sniffer = TelnetSnifferSink::new(0, "<<".into(), ">>".into());
        sniffer.service();
        // Bound lazily on the first service call.
        let port = sniffer.listener.bound_port().unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        for _ in 0..50 {
            sniffer.service();
            if sniffer.connected() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(sniffer.connected());

        let mut factory = PacketFactory::new();
        let packet = factory.make(PacketType::DataFromInstrument, b"raw".to_vec());
        sniffer.publish(&packet);

        let mut got = [0u8; 7];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"<<raw>>");
    }

    #[test]
    fn non_data_packets_are_filtered() {
        let mut sniffer = TelnetSnifferSink::new(0, String::new(), String::new());
        let mut factory = PacketFactory::new();
        let packet = factory.make(PacketType::Status, b"ok".to_vec());
        // No client attached either; must be a no-op.
        sniffer.publish(&packet);
        assert!(!sniffer.connected());
    }
}

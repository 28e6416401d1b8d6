//! On-wire packet framing.
//!
//! Every byte crossing the observatory boundary travels inside a framed
//! packet:
//!
//! ```text
//! +------------------+
//! | sync (3 bytes)   |  0xA3 0x9D 0x7A
//! +------------------+
//! | type (1)         |  PacketType discriminant
//! +------------------+
//! | checksum (2)     |  XOR-16, big endian, computed with field zeroed
//! +------------------+
//! | length (2)       |  u16 big endian, total bytes including header
//! +------------------+
//! | timestamp (8)    |  NTPv4: seconds since 1900 << 32 | fraction
//! +------------------+
//! | payload          |  length - 16 bytes, opaque
//! +------------------+
//! ```
//!
//! Decoding is length-prefixed; stream consumers resynchronize by scanning
//! for the sync sequence via [`PacketScanner`].

use chrono::{DateTime, Utc};

use crate::error::PacketError;

/// Sync sequence opening every frame.
pub const SYNC: [u8; 3] = [0xA3, 0x9D, 0x7A];

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Hard ceiling on the data payload, independent of the configured cap.
pub const MAX_PAYLOAD_SIZE: usize = 65472;

/// Seconds between the NTP era (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Packet type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    DataFromInstrument = 1,
    DataFromObservatory = 2,
    CommandFromObservatory = 3,
    Status = 4,
    Fault = 5,
    Heartbeat = 6,
    PaConfig = 7,
    PaFault = 8,
    InstrumentCmd = 9,
}

impl PacketType {
    pub fn from_u8(tag: u8) -> Result<Self, PacketError> {
        match tag {
            1 => Ok(PacketType::DataFromInstrument),
            2 => Ok(PacketType::DataFromObservatory),
            3 => Ok(PacketType::CommandFromObservatory),
            4 => Ok(PacketType::Status),
            5 => Ok(PacketType::Fault),
            6 => Ok(PacketType::Heartbeat),
            7 => Ok(PacketType::PaConfig),
            8 => Ok(PacketType::PaFault),
            9 => Ok(PacketType::InstrumentCmd),
            other => Err(PacketError::BadType(other)),
        }
    }
}

/// NTPv4 64-bit timestamp: high 32 bits seconds since 1900, low 32 bits
/// binary fraction of a second.
pub fn ntp_timestamp(when: DateTime<Utc>) -> u64 {
    let secs = when.timestamp().max(0) as u64 + NTP_UNIX_OFFSET;
    let frac = (when.timestamp_subsec_nanos() as u64) << 32;
    (secs << 32) | (frac / 1_000_000_000)
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketType, timestamp: u64, payload: Vec<u8>) -> Self {
        Self {
            kind,
            timestamp,
            payload,
        }
    }

    /// Total encoded size in bytes.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// XOR-16 over the buffer taken as big-endian 16-bit words; a trailing odd
/// byte is padded low.
fn xor16(buf: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    let mut chunks = buf.chunks_exact(2);
    for pair in &mut chunks {
        sum ^= u16::from_be_bytes([pair[0], pair[1]]);
    }
    if let [last] = chunks.remainder() {
        sum ^= (*last as u16) << 8;
    }
    sum
}

/// Encode a payload into a frame. The checksum is computed over the whole
/// frame with the checksum field zeroed.
pub fn encode(kind: PacketType, payload: &[u8], timestamp: u64) -> Vec<u8> {
    let total = HEADER_SIZE + payload.len();
    debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&SYNC);
    out.push(kind as u8);
    out.extend_from_slice(&[0, 0]); // checksum placeholder
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(payload);

    let sum = xor16(&out);
    out[4..6].copy_from_slice(&sum.to_be_bytes());
    out
}

/// Decode exactly one frame. The caller must deliver exactly `length`
/// bytes; use [`PacketScanner`] for streams.
pub fn decode(buf: &[u8]) -> Result<Packet, PacketError> {
    if buf.len() < HEADER_SIZE {
        return Err(PacketError::BadLength(buf.len()));
    }
    if buf[..3] != SYNC {
        return Err(PacketError::BadMagic);
    }

    let length = u16::from_be_bytes([buf[6], buf[7]]) as usize;
    if length < HEADER_SIZE || length != buf.len() || length > HEADER_SIZE + MAX_PAYLOAD_SIZE {
        return Err(PacketError::BadLength(length));
    }

    let stored = u16::from_be_bytes([buf[4], buf[5]]);
    let mut scratch = buf.to_vec();
    scratch[4] = 0;
    scratch[5] = 0;
    let computed = xor16(&scratch);
    if stored != computed {
        return Err(PacketError::BadChecksum {
            expected: computed,
            actual: stored,
        });
    }

    let kind = PacketType::from_u8(buf[3])?;
    let timestamp = u64::from_be_bytes(buf[8..16].try_into().expect("header slice"));
    Ok(Packet::new(kind, timestamp, buf[HEADER_SIZE..].to_vec()))
}

/// Stamps outbound packets. Timestamps are monotonic non-decreasing within
/// one factory.
#[derive(Debug, Default)]
pub struct PacketFactory {
    last: u64,
}

impl PacketFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make(&mut self, kind: PacketType, payload: Vec<u8>) -> Packet {
        let now = ntp_timestamp(Utc::now());
        self.last = self.last.max(now);
        Packet::new(kind, self.last, payload)
    }
}

/// Incremental frame extractor for a byte stream.
///
/// Bytes are pushed as they arrive; complete frames come back out.
/// Anything that is not a valid frame is skipped by scanning forward for
/// the next sync sequence, counting one fault per resynchronization.
#[derive(Debug, Default)]
pub struct PacketScanner {
    buf: Vec<u8>,
    faults: u64,
}

impl PacketScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Framing faults observed so far.
    pub fn faults(&self) -> u64 {
        self.faults
    }

    /// Extract the next complete frame, or None if more bytes are needed.
    pub fn next_packet(&mut self) -> Option<Packet> {
        loop {
            match self.sync_offset() {
                Some(0) => {}
                Some(skip) => {
                    self.buf.drain(..skip);
                    self.faults += 1;
                }
                None => {
                    // Keep a possible sync prefix at the tail.
                    let keep = self.buf.len().min(SYNC.len() - 1);
                    if self.buf.len() > keep {
                        self.buf.drain(..self.buf.len() - keep);
                        self.faults += 1;
                    }
                    return None;
                }
            }

            if self.buf.len() < HEADER_SIZE {
                return None;
            }

            let length = u16::from_be_bytes([self.buf[6], self.buf[7]]) as usize;
            if length < HEADER_SIZE || length > HEADER_SIZE + MAX_PAYLOAD_SIZE {
                // Corrupt header: step past this sync and rescan.
                self.buf.drain(..1);
                self.faults += 1;
                continue;
            }
            if self.buf.len() < length {
                return None;
            }

            match decode(&self.buf[..length]) {
                Ok(packet) => {
                    self.buf.drain(..length);
                    return Some(packet);
                }
                Err(_) => {
                    self.buf.drain(..1);
                    self.faults += 1;
                }
            }
        }
    }

    fn sync_offset(&self) -> Option<usize> {
        self.buf.windows(SYNC.len()).position(|w| w == SYNC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: [PacketType; 9] = [
        PacketType::DataFromInstrument,
        PacketType::DataFromObservatory,
        PacketType::CommandFromObservatory,
        PacketType::Status,
        PacketType::Fault,
        PacketType::Heartbeat,
        PacketType::PaConfig,
        PacketType::PaFault,
        PacketType::InstrumentCmd,
    ];

    #[test]
    fn round_trip_every_type() {
        let ts = ntp_timestamp(Utc::now());
        for kind in ALL_TYPES {
            let payload = b"abc\r\n".to_vec();
            let wire = encode(kind, &payload, ts);
            let packet = decode(&wire).unwrap();
            assert_eq!(packet.kind, kind);
            assert_eq!(packet.timestamp, ts);
            assert_eq!(packet.payload, payload);
        }
    }

    #[test]
    fn round_trip_empty_and_large_payloads() {
        let ts = 0x8000_0000_0000_0000u64;
        for len in [0usize, 1, 255, 1024] {
            let payload = vec![0x5a; len];
            let wire = encode(PacketType::DataFromInstrument, &payload, ts);
            assert_eq!(wire.len(), HEADER_SIZE + len);
            let packet = decode(&wire).unwrap();
            assert_eq!(packet.payload, payload);
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut wire = encode(PacketType::Status, b"ok", 1);
        wire[0] = 0xff;
        assert_eq!(decode(&wire), Err(PacketError::BadMagic));
    }

    #[test]
    fn truncated_frame_rejected() {
        let wire = encode(PacketType::Status, b"ok", 1);
        assert!(matches!(
            decode(&wire[..HEADER_SIZE - 1]),
            Err(PacketError::BadLength(_))
        ));
        assert!(matches!(
            decode(&wire[..wire.len() - 1]),
            Err(PacketError::BadLength(_))
        ));
    }

    #[test]
    fn single_bit_flips_detected_or_distinct() {
        let ts = ntp_timestamp(Utc::now());
        let wire = encode(PacketType::DataFromInstrument, b"hello world", ts);
        let original = decode(&wire).unwrap();

        for byte in 0..wire.len() {
            for bit in 0..8 {
                let mut mutated = wire.clone();
                mutated[byte] ^= 1 << bit;
                match decode(&mutated) {
                    Ok(packet) => assert_ne!(
                        (packet.kind, packet.timestamp, packet.payload),
                        (original.kind, original.timestamp, original.payload.clone()),
                        "flip at byte {byte} bit {bit} went unnoticed"
                    ),
                    Err(_) => {}
                }
            }
        }
    }

    #[test]
    fn factory_timestamps_monotonic() {
        let mut factory = PacketFactory::new();
        let mut last = 0;
        for _ in 0..100 {
            let packet = factory.make(PacketType::Heartbeat, Vec::new());
            assert!(packet.timestamp >= last);
            last = packet.timestamp;
        }
    }

    #[test]
    fn scanner_extracts_back_to_back_frames() {
        let mut scanner = PacketScanner::new();
        let a = encode(PacketType::Status, b"one", 1);
        let b = encode(PacketType::Fault, b"two", 2);
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        // Feed in awkward chunks.
        for chunk in stream.chunks(7) {
            scanner.push(chunk);
        }
        let first = scanner.next_packet().unwrap();
        let second = scanner.next_packet().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
        assert!(scanner.next_packet().is_none());
        assert_eq!(scanner.faults(), 0);
    }

    #[test]
    fn scanner_resynchronizes_past_garbage() {
        let mut scanner = PacketScanner::new();
        scanner.push(b"noise noise noise");
        scanner.push(&encode(PacketType::Status, b"ok", 9));
        let packet = scanner.next_packet().unwrap();
        assert_eq!(packet.payload, b"ok");
        assert!(scanner.faults() >= 1);
    }

    #[test]
    fn scanner_survives_corrupt_frame_between_good_ones() {
        let mut scanner = PacketScanner::new();
        let good = encode(PacketType::Status, b"good", 3);
        let mut bad = encode(PacketType::Status, b"bad!", 3);
        bad[HEADER_SIZE] ^= 0xff; // corrupt payload, checksum now wrong
        scanner.push(&bad);
        scanner.push(&good);
        let packet = scanner.next_packet().unwrap();
        assert_eq!(packet.payload, b"good");
        assert!(scanner.faults() >= 1);
    }

    #[test]
    fn ntp_timestamp_is_after_era_offset() {
        let ts = ntp_timestamp(Utc::now());
        assert!((ts >> 32) > NTP_UNIX_OFFSET);
    }
}

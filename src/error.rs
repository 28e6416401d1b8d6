//! Error types for the port agent.
//!
//! Transport errors are handled inside the adapters and surface only as
//! connection state; the kinds here are the ones that cross module
//! boundaries or decide the process exit code.

use thiserror::Error;

/// Framing errors raised by the packet codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer does not start with the sync sequence
    #[error("bad sync sequence")]
    BadMagic,

    /// Header length field disagrees with the buffer, or is out of range
    #[error("bad packet length: {0}")]
    BadLength(usize),

    /// Stored checksum does not match the computed one
    #[error("bad checksum: expected 0x{expected:04x}, got 0x{actual:04x}")]
    BadChecksum { expected: u16, actual: u16 },

    /// Type tag is not a known packet type
    #[error("unknown packet type: {0}")]
    BadType(u8),
}

/// Startup and runtime failures that terminate or are reported on the
/// command channel.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A required command line parameter is missing
    #[error("required parameter missing: {0}")]
    ParameterRequired(&'static str),

    /// A required directory could not be created or written
    #[error("file i/o failure: {0}")]
    FileIo(String),

    /// Runtime socket or device failure the engine cannot recover from
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Serial device open or control failure
    #[error("device failure: {0}")]
    Device(String),

    /// Command line could not be parsed; state unchanged
    #[error("parse error: {0}")]
    Parse(String),

    /// Operation not supported by the configured instrument type
    #[error("unsupported operation: {0}")]
    UnsupportedOp(&'static str),

    /// The data log could not be written after retrying
    #[error("data log write failure: {0}")]
    LogWriteFailure(String),
}

impl AgentError {
    /// Process exit code for startup-time failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::ParameterRequired(_) | AgentError::Parse(_) => 1,
            AgentError::FileIo(_) => 2,
            AgentError::Io(_) | AgentError::Device(_) | AgentError::LogWriteFailure(_) => 3,
            AgentError::UnsupportedOp(_) => 4,
        }
    }
}

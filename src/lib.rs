//! Port agent: a daemon interposing between a scientific instrument and
//! an observatory, multiplexing the raw instrument byte stream into a
//! framed, timestamped packet stream while accepting a textual command
//! channel.

pub mod cli;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod logging;
pub mod net;
pub mod observatory;
pub mod packet;
pub mod publish;
pub mod sentinel;
pub mod serial;

pub use config::PortAgentConfig;
pub use engine::{PortAgent, ProcessState};
pub use error::AgentError;

//! The port agent engine: one cooperative tick loop driving the process
//! state machine, the instrument transport, and the observatory command
//! and data channels, reconfigured at runtime by commands that arrive
//! through one of those very channels.
//!
//! Every socket and file is owned by a field of [`PortAgent`] and touched
//! only from within a tick, so there is nothing to race.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::config::{CommandOutcome, PortAgentCommand, PortAgentConfig};
use crate::connection::InstrumentConnection;
use crate::error::AgentError;
use crate::net::ReadOutcome;
use crate::observatory::ObservatoryConnection;
use crate::packet::{encode, PacketFactory, PacketType};
use crate::publish::PublisherSet;
use crate::sentinel::SentinelBuffer;

/// Poll interval: bounds worst-case latency for timers and the ppid check.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

const READ_BUF_SIZE: usize = 4096;
/// Drain at most this many reads per channel per tick so one chatty
/// endpoint cannot starve the others.
const MAX_READS_PER_TICK: usize = 64;
/// Quiet period after which a partially filled sentinel buffer is flushed
/// anyway, so a stream without sentinels still drains.
const IDLE_FLUSH: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Startup,
    Unconfigured,
    Configured,
    Disconnected,
    Connected,
    Shutdown,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Startup => "startup",
            ProcessState::Unconfigured => "unconfigured",
            ProcessState::Configured => "configured",
            ProcessState::Disconnected => "disconnected",
            ProcessState::Connected => "connected",
            ProcessState::Shutdown => "shutdown",
        }
    }
}

/// Pid file scoped to the agent's lifetime; removed on every exit path.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: PathBuf) -> Result<Self, AgentError> {
        fs::write(&path, format!("{}\n", std::process::id()))
            .map_err(|err| AgentError::FileIo(format!("write {}: {err}", path.display())))?;
        log::debug!("wrote pid file {}", path.display());
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!("failed to remove pid file {}: {err}", self.path.display());
        }
    }
}

/// Packet types delivered to observatory data clients.
const DATA_CLIENT_TYPES: [PacketType; 5] = [
    PacketType::DataFromInstrument,
    PacketType::Status,
    PacketType::Fault,
    PacketType::Heartbeat,
    PacketType::PaConfig,
];

/// Packet types delivered to the observatory command client.
const COMMAND_CLIENT_TYPES: [PacketType; 3] =
    [PacketType::Status, PacketType::Fault, PacketType::PaConfig];

pub struct PortAgent {
    config: PortAgentConfig,
    state: ProcessState,
    instrument: Option<InstrumentConnection>,
    observatory: ObservatoryConnection,
    publishers: PublisherSet,
    sentinel: SentinelBuffer,
    factory: PacketFactory,
    command_buf: Vec<u8>,
    last_heartbeat: Instant,
    last_instrument_byte: Option<Instant>,
    last_output: Option<Instant>,
    faults: u64,
    _pidfile: PidFile,
}

impl PortAgent {
    pub fn new(config: PortAgentConfig) -> Result<Self, AgentError> {
        let pidfile = PidFile::create(config.pidfile())?;
        let mut observatory = ObservatoryConnection::new();
        observatory.configure(&config);
        let publishers = PublisherSet::new(&config);
        let sentinel = SentinelBuffer::new(
            config.sentinel_sequence().to_vec(),
            config.max_packet_size() as usize,
        );

        log::info!(
            "port agent starting on command port {}",
            config.observatory_command_port()
        );

        Ok(Self {
            config,
            state: ProcessState::Startup,
            instrument: None,
            observatory,
            publishers,
            sentinel,
            factory: PacketFactory::new(),
            command_buf: Vec::new(),
            last_heartbeat: Instant::now(),
            last_instrument_byte: None,
            last_output: None,
            faults: 0,
            _pidfile: pidfile,
        })
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn config(&self) -> &PortAgentConfig {
        &self.config
    }

    pub fn faults(&self) -> u64 {
        self.faults
    }

    /// Run until shutdown.
    pub fn run(&mut self) -> Result<(), AgentError> {
        while self.state != ProcessState::Shutdown {
            self.tick();
            std::thread::sleep(POLL_INTERVAL);
        }
        self.cleanup();
        Ok(())
    }

    /// One pass of the cooperative loop.
    pub fn tick(&mut self) {
        if self.state == ProcessState::Shutdown {
            return;
        }

        self.advance_state();

        // Service accept queues and reconnects.
        self.observatory.service();
        self.publishers.service();
        if let Some(instrument) = &mut self.instrument {
            instrument.poll();
        }

        self.drain_observatory_command();
        self.drain_command_queue();
        self.drain_instrument_data();
        self.drain_instrument_command();
        self.observatory.drain_data_clients();

        self.fire_heartbeat();
        self.check_poison_pill();
    }

    fn cleanup(&mut self) {
        log::info!("shutting down");
        if let Some(instrument) = &mut self.instrument {
            instrument.shutdown();
        }
        self.publishers.shutdown();
        self.observatory.shutdown();
    }

    //////
    // State machine
    //////

    fn advance_state(&mut self) {
        let next = match self.state {
            ProcessState::Startup => Some(ProcessState::Unconfigured),
            ProcessState::Unconfigured => self
                .config
                .is_configured()
                .then_some(ProcessState::Configured),
            ProcessState::Configured => self.try_initialize().then_some(ProcessState::Disconnected),
            ProcessState::Disconnected => self
                .observatory
                .data_connected()
                .then_some(ProcessState::Connected),
            ProcessState::Connected => (!self.observatory.data_connected())
                .then_some(ProcessState::Disconnected),
            ProcessState::Shutdown => None,
        };
        if let Some(next) = next {
            log::info!("state {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        }
    }

    /// Bind observatory listeners and arm the instrument adapter. True
    /// once both sides are initialized.
    fn try_initialize(&mut self) -> bool {
        self.observatory.configure(&self.config);
        if let Err(err) = self.observatory.initialize() {
            log::error!("observatory initialization failed: {err}");
            return false;
        }

        self.ensure_instrument();
        let Some(instrument) = &mut self.instrument else {
            return false;
        };
        if instrument.data_configured() && !instrument.data_initialized() {
            instrument.initialize_data();
        }
        if instrument.command_configured() && !instrument.command_initialized() {
            instrument.initialize_command();
        }
        self.config.clear_device_path_changed();
        self.config.clear_serial_settings_changed();

        self.observatory.initialized() && instrument.data_initialized()
    }

    /// Build or rebuild the adapter to match the configured type.
    fn ensure_instrument(&mut self) {
        let wanted = self.config.instrument_type();
        let rebuild = match &self.instrument {
            Some(instrument) => instrument.kind() != wanted,
            None => true,
        };
        if rebuild {
            if let Some(old) = &mut self.instrument {
                old.shutdown();
            }
            self.instrument = InstrumentConnection::from_type(wanted);
        }
        if let Some(instrument) = &mut self.instrument {
            instrument.apply_config(&self.config);
        }
    }

    //////
    // Observatory command channel
    //////

    fn drain_observatory_command(&mut self) {
        let mut buf = [0u8; READ_BUF_SIZE];
        for _ in 0..MAX_READS_PER_TICK {
            match self.observatory.read_command(&mut buf) {
                ReadOutcome::Data(n) => self.command_buf.extend_from_slice(&buf[..n]),
                ReadOutcome::WouldBlock | ReadOutcome::Closed => break,
            }
        }

        while let Some(pos) = self.command_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.command_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.trim().is_empty() {
                self.handle_command_line(line.to_string());
            }
        }
    }

    fn handle_command_line(&mut self, line: String) {
        log::debug!("observatory command: {line}");
        match self.config.process_command(&line) {
            CommandOutcome::Applied => self.send_status("ok"),
            CommandOutcome::Invalid(reason) => self.send_fault(&format!("parse error: {reason}")),
            CommandOutcome::Unknown => {
                // Anything that is not our verb belongs to the instrument
                // when it has a command channel.
                let forward = match &mut self.instrument {
                    Some(instrument) if instrument.command_configured() => {
                        let mut raw = line.into_bytes();
                        raw.push(b'\n');
                        instrument.write_command(&raw).map(|_| ())
                    }
                    _ => Err(AgentError::Parse("unrecognized command".to_string())),
                };
                if let Err(err) = forward {
                    self.send_fault(&err.to_string());
                }
            }
        }
    }

    //////
    // Command queue drain: configuration becomes visible to the rest of
    // the engine here and nowhere else.
    //////

    fn drain_command_queue(&mut self) {
        while let Some(command) = self.config.next_command() {
            log::debug!("applying command {command:?}");
            match command {
                PortAgentCommand::Help => self.send_status(&usage_text()),
                PortAgentCommand::CommConfigUpdate => self.apply_comm_config(),
                PortAgentCommand::PublisherConfigUpdate => self.apply_publisher_config(),
                PortAgentCommand::PathConfigUpdate => self.apply_path_config(),
                PortAgentCommand::SaveConfig => match self.config.save_config() {
                    Ok(()) => self.send_status("config saved"),
                    Err(err) => self.send_fault(&err.to_string()),
                },
                PortAgentCommand::GetConfig => {
                    let text = self.config.get_config();
                    self.send_packet(PacketType::PaConfig, text.into_bytes());
                }
                PortAgentCommand::GetState => {
                    let text = format!("state {}\nfaults {}\n", self.state.as_str(), self.faults);
                    self.send_status(&text);
                }
                PortAgentCommand::Ping => self.send_status("pong"),
                PortAgentCommand::Break => self.do_break(),
                PortAgentCommand::Shutdown => {
                    log::info!("state {} -> shutdown", self.state.as_str());
                    self.state = ProcessState::Shutdown;
                    return;
                }
                PortAgentCommand::RotationInterval => {
                    self.publishers
                        .datalog
                        .set_rotation(self.config.rotation_interval());
                }
            }
        }
    }

    fn apply_comm_config(&mut self) {
        self.observatory.configure(&self.config);
        let past_configured = matches!(
            self.state,
            ProcessState::Configured | ProcessState::Disconnected | ProcessState::Connected
        );
        if past_configured {
            if let Err(err) = self.observatory.initialize() {
                log::error!("observatory reinitialization failed: {err}");
            }
        }

        self.ensure_instrument();
        if let Some(instrument) = &mut self.instrument {
            if instrument.data_configured() && !instrument.data_initialized() {
                instrument.initialize_data();
            }
            if instrument.command_configured() && !instrument.command_initialized() {
                instrument.initialize_command();
            }
        }
        self.config.clear_device_path_changed();
        self.config.clear_serial_settings_changed();
    }

    fn apply_publisher_config(&mut self) {
        self.sentinel
            .set_sentinel(self.config.sentinel_sequence().to_vec());
        self.sentinel
            .set_capacity(self.config.max_packet_size() as usize);
        self.publishers.configure(&self.config);
    }

    fn apply_path_config(&mut self) {
        for dir in [
            self.config.log_dir().to_string(),
            self.config.pid_dir().to_string(),
            self.config.data_dir().to_string(),
        ] {
            if let Err(err) = fs::create_dir_all(&dir) {
                log::error!("could not create {dir}: {err}");
            }
        }
        self.publishers.configure(&self.config);
    }

    fn do_break(&mut self) {
        let duration = self.config.break_duration();
        match &mut self.instrument {
            Some(instrument) => match instrument.send_break(duration) {
                Ok(()) => self.send_status("break sent"),
                Err(err) => self.send_fault(&err.to_string()),
            },
            None => self.send_fault("no instrument connection"),
        }
    }

    //////
    // Data path
    //////

    fn drain_instrument_data(&mut self) {
        if !matches!(
            self.state,
            ProcessState::Disconnected | ProcessState::Connected
        ) {
            return;
        }
        let Some(instrument) = &mut self.instrument else {
            return;
        };

        let mut buf = [0u8; READ_BUF_SIZE];
        let mut payloads = Vec::new();
        for _ in 0..MAX_READS_PER_TICK {
            match instrument.read_data(&mut buf) {
                ReadOutcome::Data(n) => {
                    self.last_instrument_byte = Some(Instant::now());
                    payloads.extend(self.sentinel.push(&buf[..n]));
                }
                ReadOutcome::WouldBlock | ReadOutcome::Closed => break,
            }
        }

        // Gap flush: a quiet line drains whatever is buffered.
        if !self.sentinel.is_empty() {
            let quiet = self
                .last_instrument_byte
                .map(|at| at.elapsed() >= IDLE_FLUSH)
                .unwrap_or(false);
            if quiet {
                self.last_instrument_byte = None;
                payloads.extend(self.sentinel.take());
            }
        }

        for payload in payloads {
            self.send_packet(PacketType::DataFromInstrument, payload);
        }
    }

    /// Instrument command-channel responses flow back to the observatory
    /// as instrument data, bypassing the sentinel buffer.
    fn drain_instrument_command(&mut self) {
        let Some(instrument) = &mut self.instrument else {
            return;
        };
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut chunks = Vec::new();
        for _ in 0..MAX_READS_PER_TICK {
            match instrument.read_command(&mut buf) {
                ReadOutcome::Data(n) => chunks.push(buf[..n].to_vec()),
                ReadOutcome::WouldBlock | ReadOutcome::Closed => break,
            }
        }
        for chunk in chunks {
            self.send_packet(PacketType::DataFromInstrument, chunk);
        }
    }

    //////
    // Timers
    //////

    fn fire_heartbeat(&mut self) {
        let interval = self.config.heartbeat_interval();
        if interval == 0 {
            return;
        }
        if !matches!(
            self.state,
            ProcessState::Disconnected | ProcessState::Connected
        ) {
            return;
        }
        if self.last_heartbeat.elapsed() >= Duration::from_secs(interval as u64) {
            self.last_heartbeat = Instant::now();
            self.send_packet(PacketType::Heartbeat, Vec::new());
        }
    }

    /// Poison pill: shut down if the watched parent process is gone.
    fn check_poison_pill(&mut self) {
        let ppid = self.config.ppid();
        if ppid == 0 {
            return;
        }
        let actual = nix::unistd::getppid().as_raw() as u32;
        if actual != ppid {
            log::warn!("parent process {ppid} vanished (now {actual}), shutting down");
            self.config.add_command(PortAgentCommand::Shutdown);
        }
    }

    //////
    // Outbound
    //////

    fn send_status(&mut self, text: &str) {
        self.send_packet(PacketType::Status, text.as_bytes().to_vec());
    }

    fn send_fault(&mut self, text: &str) {
        self.faults += 1;
        log::warn!("fault: {text}");
        self.send_packet(PacketType::Fault, text.as_bytes().to_vec());
    }

    /// Frame and fan out one packet to every interested sink.
    fn send_packet(&mut self, kind: PacketType, payload: Vec<u8>) {
        let packet = self.factory.make(kind, payload);
        let wire = encode(packet.kind, &packet.payload, packet.timestamp);

        if DATA_CLIENT_TYPES.contains(&packet.kind) && self.observatory.data_connected() {
            self.throttle_output();
            self.observatory.write_data(&wire);
            self.last_output = Some(Instant::now());
        }
        if COMMAND_CLIENT_TYPES.contains(&packet.kind) {
            self.observatory.write_command(&wire);
        }
        self.publishers.publish(&packet, &wire);
    }

    /// Pace outbound observatory-data writes; never coalesces, never
    /// reorders.
    fn throttle_output(&mut self) {
        let throttle = self.config.output_throttle();
        if throttle == 0 {
            return;
        }
        if let Some(last) = self.last_output {
            let spacing = Duration::from_micros(throttle as u64);
            let elapsed = last.elapsed();
            if elapsed < spacing {
                std::thread::sleep(spacing - elapsed);
            }
        }
    }
}

fn usage_text() -> String {
    [
        "commands:",
        "  help get_config get_state ping save_config shutdown verbose",
        "  break <ms>",
        "  instrument_type serial|tcp|botpt|rsn",
        "  observatory_type standard|multi",
        "  command_port|data_port|add_data_port <port>",
        "  instrument_addr <host>",
        "  instrument_data_port|instrument_data_tx_port|instrument_data_rx_port|instrument_command_port <port>",
        "  device_path <path>  baud|stopbits|databits|parity|flow <n>",
        "  sentinle '<sequence>'  max_packet_size <n>  output_throttle <us>",
        "  heartbeat_interval <s>  log_level error|warning|info|debug",
        "  pid_dir|log_dir|conf_dir|data_dir <path>",
        "  rotation_interval daily|hourly|quarter_hourly|minute",
        "  telnet_sniffer_port <port>  telnet_sniffer_prefix|telnet_sniffer_suffix <str>",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_stable() {
        assert_eq!(ProcessState::Startup.as_str(), "startup");
        assert_eq!(ProcessState::Shutdown.as_str(), "shutdown");
    }

    #[test]
    fn usage_mentions_every_control_verb() {
        let usage = usage_text();
        for verb in ["help", "ping", "shutdown", "sentinle", "rotation_interval"] {
            assert!(usage.contains(verb), "usage is missing {verb}");
        }
    }
}

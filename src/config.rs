//! Port agent configuration and command parsing.
//!
//! Two inputs share one grammar: argv options feed through the same
//! textual parser that serves the observatory command channel, and the
//! conf file is itself a valid command stream. Parsed verbs mutate this
//! record and enqueue semantic command tags for the engine to drain.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::LevelFilter;

use crate::error::AgentError;

pub const BASE_FILENAME: &str = "port_agent";
pub const DEFAULT_PACKET_SIZE: u32 = 1024;
pub const MAX_PACKET_SIZE: u32 = 65472;
pub const DEFAULT_DIR: &str = "/tmp";

const VALID_BAUDS: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

/// Semantic command tags drained by the engine, FIFO with insert-dedupe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAgentCommand {
    Help,
    CommConfigUpdate,
    PublisherConfigUpdate,
    PathConfigUpdate,
    SaveConfig,
    GetConfig,
    GetState,
    Ping,
    Break,
    Shutdown,
    RotationInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstrumentType {
    #[default]
    Unknown,
    Serial,
    Tcp,
    Botpt,
    Rsn,
}

impl InstrumentType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "serial" => Some(InstrumentType::Serial),
            "tcp" => Some(InstrumentType::Tcp),
            "botpt" => Some(InstrumentType::Botpt),
            "rsn" => Some(InstrumentType::Rsn),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentType::Unknown => "unknown",
            InstrumentType::Serial => "serial",
            InstrumentType::Tcp => "tcp",
            InstrumentType::Botpt => "botpt",
            InstrumentType::Rsn => "rsn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObservatoryType {
    #[default]
    Standard,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationType {
    #[default]
    Daily,
    Hourly,
    QuarterHourly,
    Minute,
}

impl RotationType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "daily" => Some(RotationType::Daily),
            "hourly" => Some(RotationType::Hourly),
            "quarter_hourly" => Some(RotationType::QuarterHourly),
            "minute" => Some(RotationType::Minute),
            _ => None,
        }
    }
}

/// Ordered set of observatory data ports; insert removes any existing
/// entry for the port first, so duplicates collapse to one.
#[derive(Debug, Clone, Default)]
pub struct DataPortRegistry {
    ports: Vec<u16>,
}

impl DataPortRegistry {
    pub fn add_port(&mut self, port: u16) {
        self.ports.retain(|&p| p != port);
        self.ports.push(port);
        for (index, p) in self.ports.iter().enumerate() {
            log::debug!("data port {index}: {p}");
        }
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }
}

/// Outcome of processing one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Recognized and applied
    Applied,
    /// Recognized verb, invalid parameter; state reset per verb rules
    Invalid(String),
    /// Not a known verb
    Unknown,
}

/// Options gathered from argv; fed into [`PortAgentConfig::from_args`].
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub conffile: Option<PathBuf>,
    pub command_port: Option<u16>,
    pub verbose: u8,
    pub single: bool,
    pub kill: bool,
    pub ppid: Option<u32>,
}

/// The process-wide configuration record. Mutated only from the command
/// drain step of the engine tick.
#[derive(Debug)]
pub struct PortAgentConfig {
    commands: VecDeque<PortAgentCommand>,

    kill: bool,
    no_detach: bool,
    verbose: u8,
    ppid: u32,

    pid_dir: String,
    log_dir: String,
    conf_dir: String,
    data_dir: String,
    log_level: LevelFilter,

    observatory_command_port: u16,
    observatory_data_port: u16,
    observatory_type: ObservatoryType,
    data_ports: DataPortRegistry,

    instrument_type: InstrumentType,
    instrument_addr: String,
    instrument_data_port: u16,
    instrument_data_tx_port: u16,
    instrument_data_rx_port: u16,
    instrument_command_port: u16,

    device_path: String,
    device_path_changed: bool,
    serial_settings_changed: bool,
    baud: u32,
    stopbits: u16,
    databits: u16,
    parity: u16,
    flow: u16,
    break_duration: u32,

    sentinel_sequence: Vec<u8>,
    output_throttle: u32,
    heartbeat_interval: u32,
    max_packet_size: u32,
    rotation_interval: RotationType,

    telnet_sniffer_port: u16,
    telnet_sniffer_prefix: String,
    telnet_sniffer_suffix: String,
}

impl Default for PortAgentConfig {
    fn default() -> Self {
        Self {
            commands: VecDeque::new(),
            kill: false,
            no_detach: false,
            verbose: 0,
            ppid: 0,
            pid_dir: DEFAULT_DIR.to_string(),
            log_dir: DEFAULT_DIR.to_string(),
            conf_dir: DEFAULT_DIR.to_string(),
            data_dir: DEFAULT_DIR.to_string(),
            log_level: LevelFilter::Info,
            observatory_command_port: 0,
            observatory_data_port: 0,
            observatory_type: ObservatoryType::Standard,
            data_ports: DataPortRegistry::default(),
            instrument_type: InstrumentType::Unknown,
            instrument_addr: String::new(),
            instrument_data_port: 0,
            instrument_data_tx_port: 0,
            instrument_data_rx_port: 0,
            instrument_command_port: 0,
            device_path: String::new(),
            // Both dirty at construction so the first initialization
            // applies everything.
            device_path_changed: true,
            serial_settings_changed: true,
            baud: 0,
            stopbits: 1,
            databits: 8,
            parity: 0,
            flow: 0,
            break_duration: 0,
            sentinel_sequence: Vec::new(),
            output_throttle: 0,
            heartbeat_interval: 0,
            max_packet_size: DEFAULT_PACKET_SIZE,
            rotation_interval: RotationType::Daily,
            telnet_sniffer_port: 0,
            telnet_sniffer_prefix: String::new(),
            telnet_sniffer_suffix: String::new(),
        }
    }
}

impl PortAgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from parsed argv, reading the conf file if
    /// one was given and verifying startup preconditions.
    pub fn from_args(options: &CliOptions) -> Result<Self, AgentError> {
        let mut config = Self::new();

        if let Some(path) = &options.conffile {
            config.read_config(path)?;
        }
        if let Some(port) = options.command_port {
            config.observatory_command_port = port;
        }
        for _ in 0..options.verbose {
            config.raise_log_level();
        }
        config.no_detach = options.single;
        if options.kill {
            config.kill = true;
            config.add_command(PortAgentCommand::Shutdown);
        }
        if let Some(ppid) = options.ppid {
            config.ppid = ppid;
        }

        config.verify_command_line()?;
        Ok(config)
    }

    /// The observatory command port is the agent's identity; it and the
    /// key directories must exist before the event loop starts.
    fn verify_command_line(&self) -> Result<(), AgentError> {
        if self.observatory_command_port == 0 {
            return Err(AgentError::ParameterRequired("command_port"));
        }
        for dir in [&self.log_dir, &self.pid_dir, &self.data_dir] {
            fs::create_dir_all(dir)
                .map_err(|err| AgentError::FileIo(format!("could not create {dir}: {err}")))?;
        }
        Ok(())
    }

    //////
    // Command queue
    //////

    /// Enqueue a command unless it is already queued.
    pub fn add_command(&mut self, command: PortAgentCommand) {
        if self.commands.contains(&command) {
            log::debug!("command {command:?} already queued, not adding again");
            return;
        }
        log::debug!("command queued: {command:?}");
        self.commands.push_back(command);
    }

    /// Pop the oldest queued command.
    pub fn next_command(&mut self) -> Option<PortAgentCommand> {
        self.commands.pop_front()
    }

    pub fn queued_commands(&self) -> usize {
        self.commands.len()
    }

    //////
    // Parsing
    //////

    /// Parse a block of text, one command per line. Returns true if every
    /// line parsed.
    pub fn parse(&mut self, commands: &str) -> bool {
        let mut ok = true;
        for line in commands.lines() {
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                continue;
            }
            log::debug!("config command: {line}");
            match self.process_command(line) {
                CommandOutcome::Applied => {}
                CommandOutcome::Invalid(reason) => {
                    log::error!("failed to parse: {line} ({reason})");
                    ok = false;
                }
                CommandOutcome::Unknown => {
                    log::error!("failed to parse: {line}");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Split into verb and optional parameter; trailing tokens are an
    /// error.
    fn split_command(raw: &str) -> Option<(String, String)> {
        let mut tokens = raw.split_whitespace();
        let cmd = tokens.next().unwrap_or("").to_string();
        let param = tokens.next().unwrap_or("").to_string();
        if tokens.next().is_some() {
            log::error!("trailing config tokens found in: {raw}");
            return None;
        }
        Some((cmd, param))
    }

    /// Process one command line: set the parameter if one is named and
    /// enqueue the matching command tag.
    pub fn process_command(&mut self, raw: &str) -> CommandOutcome {
        // The sentinel verb reparses the whole raw line so quoted spaces
        // and escapes survive tokenization.
        let first = raw.split_whitespace().next().unwrap_or("");
        if first == "sentinle" || first == "sentinel" {
            self.add_command(PortAgentCommand::PublisherConfigUpdate);
            return self.set_sentinel_sequence(raw);
        }

        let Some((cmd, param)) = Self::split_command(raw) else {
            return CommandOutcome::Invalid("trailing tokens".to_string());
        };

        match cmd.as_str() {
            // Bare control verbs take no parameter.
            "help" | "verbose" | "save_config" | "get_config" | "get_state" | "ping"
            | "shutdown"
                if !param.is_empty() =>
            {
                return CommandOutcome::Invalid(format!("unexpected parameter: {param}"));
            }

            "help" => self.add_command(PortAgentCommand::Help),
            "verbose" => self.raise_log_level(),
            "save_config" => self.add_command(PortAgentCommand::SaveConfig),
            "get_config" => self.add_command(PortAgentCommand::GetConfig),
            "get_state" => self.add_command(PortAgentCommand::GetState),
            "ping" => self.add_command(PortAgentCommand::Ping),
            "shutdown" => self.add_command(PortAgentCommand::Shutdown),

            "break" => {
                self.add_command(PortAgentCommand::Break);
                return self.set_break_duration(&param);
            }
            "instrument_type" => {
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.set_instrument_type(&param);
            }
            "observatory_type" => {
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.set_observatory_type(&param);
            }
            "output_throttle" => {
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.set_output_throttle(&param);
            }
            "heartbeat_interval" => {
                return self.set_heartbeat_interval(&param);
            }
            "max_packet_size" => {
                self.add_command(PortAgentCommand::PublisherConfigUpdate);
                return self.set_max_packet_size(&param);
            }
            "data_port" => {
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.set_observatory_data_port(&param);
            }
            "add_data_port" => {
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.add_observatory_data_port(&param);
            }
            "command_port" => {
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.set_observatory_command_port(&param);
            }
            "instrument_addr" => {
                self.add_command(PortAgentCommand::CommConfigUpdate);
                self.instrument_addr = param;
            }
            "instrument_data_port" => {
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return Self::set_port_field(&mut self.instrument_data_port, &param);
            }
            "instrument_data_tx_port" => {
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return Self::set_port_field(&mut self.instrument_data_tx_port, &param);
            }
            "instrument_data_rx_port" => {
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return Self::set_port_field(&mut self.instrument_data_rx_port, &param);
            }
            "instrument_command_port" => {
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return Self::set_port_field(&mut self.instrument_command_port, &param);
            }
            "device_path" => {
                self.device_path_changed = true;
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.set_device_path(&param);
            }

            // For baud, stopbits, databits, parity and flow only the
            // serial-settings flag is raised: the device stays open and is
            // reparameterized in place.
            "baud" => {
                self.serial_settings_changed = true;
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.set_baud(&param);
            }
            "stopbits" => {
                self.serial_settings_changed = true;
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.set_stopbits(&param);
            }
            "databits" => {
                self.serial_settings_changed = true;
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.set_databits(&param);
            }
            "parity" => {
                self.serial_settings_changed = true;
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.set_parity(&param);
            }
            "flow" => {
                self.serial_settings_changed = true;
                self.add_command(PortAgentCommand::CommConfigUpdate);
                return self.set_flow(&param);
            }

            "log_level" => return self.set_log_level(&param),
            "log_dir" => {
                self.add_command(PortAgentCommand::PathConfigUpdate);
                self.log_dir = param;
            }
            "pid_dir" => {
                self.add_command(PortAgentCommand::PathConfigUpdate);
                self.pid_dir = param;
            }
            "data_dir" => {
                self.add_command(PortAgentCommand::PathConfigUpdate);
                self.data_dir = param;
            }
            "conf_dir" => {
                self.add_command(PortAgentCommand::PathConfigUpdate);
                self.conf_dir = param;
            }
            "rotation_interval" => {
                self.add_command(PortAgentCommand::RotationInterval);
                return self.set_rotation_interval(&param);
            }
            "telnet_sniffer_port" => {
                self.add_command(PortAgentCommand::PublisherConfigUpdate);
                return Self::set_port_field(&mut self.telnet_sniffer_port, &param);
            }
            "telnet_sniffer_prefix" => {
                self.add_command(PortAgentCommand::PublisherConfigUpdate);
                self.telnet_sniffer_prefix = param;
            }
            "telnet_sniffer_suffix" => {
                self.add_command(PortAgentCommand::PublisherConfigUpdate);
                self.telnet_sniffer_suffix = param;
            }

            _ => return CommandOutcome::Unknown,
        }

        CommandOutcome::Applied
    }

    //////
    // Set methods
    //////

    fn set_instrument_type(&mut self, param: &str) -> CommandOutcome {
        match InstrumentType::parse(param) {
            Some(kind) => {
                log::info!("connection type set to {}", kind.as_str());
                self.instrument_type = kind;
                CommandOutcome::Applied
            }
            None => {
                log::error!("unknown connection type: {param}");
                self.instrument_type = InstrumentType::Unknown;
                CommandOutcome::Invalid(format!("unknown connection type: {param}"))
            }
        }
    }

    fn set_observatory_type(&mut self, param: &str) -> CommandOutcome {
        match param {
            "standard" => {
                self.observatory_type = ObservatoryType::Standard;
                CommandOutcome::Applied
            }
            "multi" => {
                self.observatory_type = ObservatoryType::Multi;
                CommandOutcome::Applied
            }
            other => {
                log::error!("unknown observatory connection type: {other}");
                CommandOutcome::Invalid(format!("unknown observatory type: {other}"))
            }
        }
    }

    /// Parse the sentinel from the raw command line: the sequence lives
    /// between the first and second single quote, with `\n` and `\r`
    /// escapes decoded and any other backslash kept literally.
    fn set_sentinel_sequence(&mut self, raw: &str) -> CommandOutcome {
        let Some(open) = raw.find('\'') else {
            log::error!("failed to parse sentinel string: {raw}");
            return CommandOutcome::Invalid("missing opening quote".to_string());
        };
        let rest = &raw[open + 1..];
        let Some(close) = rest.find('\'') else {
            log::error!("failed to parse sentinel string: {raw}");
            return CommandOutcome::Invalid("missing closing quote".to_string());
        };

        let mut decoded = Vec::new();
        let mut bytes = rest[..close].bytes().peekable();
        while let Some(byte) = bytes.next() {
            if byte == b'\\' {
                match bytes.peek() {
                    Some(b'n') => {
                        decoded.push(b'\n');
                        bytes.next();
                    }
                    Some(b'r') => {
                        decoded.push(b'\r');
                        bytes.next();
                    }
                    _ => decoded.push(byte),
                }
            } else {
                decoded.push(byte);
            }
        }

        log::debug!("sentinel sequence length: {}", decoded.len());
        self.sentinel_sequence = decoded;
        CommandOutcome::Applied
    }

    fn set_break_duration(&mut self, param: &str) -> CommandOutcome {
        if param.is_empty() {
            log::info!("break duration not specified; using 0");
            self.break_duration = 0;
            return CommandOutcome::Applied;
        }
        match param.parse::<u32>() {
            Ok(value) => {
                log::info!("set break duration to {value}");
                self.break_duration = value;
                CommandOutcome::Applied
            }
            Err(_) => {
                self.break_duration = 0;
                CommandOutcome::Invalid(format!("invalid break duration: {param}"))
            }
        }
    }

    fn set_output_throttle(&mut self, param: &str) -> CommandOutcome {
        match param.parse::<u32>() {
            Ok(value) => {
                log::info!("set output throttle to {value}");
                self.output_throttle = value;
                CommandOutcome::Applied
            }
            Err(_) => {
                self.output_throttle = 0;
                CommandOutcome::Invalid(format!("invalid output throttle: {param}"))
            }
        }
    }

    fn set_heartbeat_interval(&mut self, param: &str) -> CommandOutcome {
        match param.parse::<u32>() {
            Ok(value) => {
                log::info!("set heartbeat interval to {value}");
                self.heartbeat_interval = value;
                CommandOutcome::Applied
            }
            Err(_) => {
                self.heartbeat_interval = 0;
                CommandOutcome::Invalid(format!("invalid heartbeat interval: {param}"))
            }
        }
    }

    fn set_max_packet_size(&mut self, param: &str) -> CommandOutcome {
        match param.parse::<u32>() {
            Ok(value) if value > 0 && value <= MAX_PACKET_SIZE => {
                log::info!("set max packet size to {value}");
                self.max_packet_size = value;
                CommandOutcome::Applied
            }
            _ => {
                log::error!(
                    "invalid max packet size {param}, using default {DEFAULT_PACKET_SIZE}"
                );
                self.max_packet_size = DEFAULT_PACKET_SIZE;
                CommandOutcome::Invalid(format!("invalid max packet size: {param}"))
            }
        }
    }

    /// Port parse shared by every port-valued verb. `0` is accepted as an
    /// explicit "unset" so a saved configuration re-ingests cleanly.
    fn set_port_field(field: &mut u16, param: &str) -> CommandOutcome {
        match param.parse::<u16>() {
            Ok(value) => {
                *field = value;
                CommandOutcome::Applied
            }
            Err(_) => {
                *field = 0;
                log::error!("invalid port specification: {param}");
                CommandOutcome::Invalid(format!("invalid port: {param}"))
            }
        }
    }

    fn set_observatory_data_port(&mut self, param: &str) -> CommandOutcome {
        Self::set_port_field(&mut self.observatory_data_port, param)
    }

    fn add_observatory_data_port(&mut self, param: &str) -> CommandOutcome {
        let outcome = Self::set_port_field(&mut self.observatory_data_port, param);
        if outcome == CommandOutcome::Applied && self.observatory_data_port != 0 {
            log::info!("adding observatory data port: {}", self.observatory_data_port);
            self.data_ports.add_port(self.observatory_data_port);
        }
        outcome
    }

    fn set_observatory_command_port(&mut self, param: &str) -> CommandOutcome {
        Self::set_port_field(&mut self.observatory_command_port, param)
    }

    fn set_device_path(&mut self, param: &str) -> CommandOutcome {
        if param.is_empty() {
            return CommandOutcome::Invalid("empty device path".to_string());
        }
        self.device_path = param.to_string();
        CommandOutcome::Applied
    }

    fn set_baud(&mut self, param: &str) -> CommandOutcome {
        match param.parse::<u32>() {
            Ok(0) => {
                self.baud = 0;
                CommandOutcome::Applied
            }
            Ok(value) if VALID_BAUDS.contains(&value) => {
                self.baud = value;
                CommandOutcome::Applied
            }
            _ => {
                log::error!("invalid baud rate: {param}");
                self.baud = 0;
                CommandOutcome::Invalid(format!("invalid baud rate: {param}"))
            }
        }
    }

    fn set_stopbits(&mut self, param: &str) -> CommandOutcome {
        match param.parse::<u16>() {
            Ok(value @ (1 | 2)) => {
                self.stopbits = value;
                CommandOutcome::Applied
            }
            _ => {
                log::error!("invalid stop bits: {param}");
                self.stopbits = 1;
                CommandOutcome::Invalid(format!("invalid stop bits: {param}"))
            }
        }
    }

    fn set_databits(&mut self, param: &str) -> CommandOutcome {
        match param.parse::<u16>() {
            Ok(value @ 5..=8) => {
                self.databits = value;
                CommandOutcome::Applied
            }
            _ => {
                log::error!("invalid data bits: {param}");
                self.databits = 8;
                CommandOutcome::Invalid(format!("invalid data bits: {param}"))
            }
        }
    }

    fn set_parity(&mut self, param: &str) -> CommandOutcome {
        match param.parse::<u16>() {
            Ok(value @ 0..=2) => {
                self.parity = value;
                CommandOutcome::Applied
            }
            _ => {
                log::error!("invalid parity: {param}");
                self.parity = 0;
                CommandOutcome::Invalid(format!("invalid parity: {param}"))
            }
        }
    }

    fn set_flow(&mut self, param: &str) -> CommandOutcome {
        match param.parse::<u16>() {
            Ok(value @ 0..=2) => {
                self.flow = value;
                CommandOutcome::Applied
            }
            _ => {
                log::error!("invalid flow: {param}");
                self.flow = 0;
                CommandOutcome::Invalid(format!("invalid flow: {param}"))
            }
        }
    }

    fn set_rotation_interval(&mut self, param: &str) -> CommandOutcome {
        match RotationType::parse(param) {
            Some(rotation) => {
                log::info!("data log rotation set to {param}");
                self.rotation_interval = rotation;
                CommandOutcome::Applied
            }
            None => {
                log::error!("unknown log rotation type: {param}");
                self.rotation_interval = RotationType::Daily;
                CommandOutcome::Invalid(format!("unknown rotation type: {param}"))
            }
        }
    }

    fn set_log_level(&mut self, param: &str) -> CommandOutcome {
        let level = match param.to_ascii_lowercase().as_str() {
            "error" => LevelFilter::Error,
            "warn" | "warning" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            other => {
                log::error!("unknown log level: {other}");
                return CommandOutcome::Invalid(format!("unknown log level: {other}"));
            }
        };
        self.log_level = level;
        log::set_max_level(level);
        CommandOutcome::Applied
    }

    /// One step more verbose (`verbose` command, repeated `-v`).
    pub fn raise_log_level(&mut self) {
        self.verbose += 1;
        self.log_level = match self.log_level {
            LevelFilter::Off | LevelFilter::Error => LevelFilter::Warn,
            LevelFilter::Warn => LevelFilter::Info,
            _ => LevelFilter::Debug,
        };
        log::set_max_level(self.log_level);
    }

    //////
    // Queries
    //////

    /// Do we have enough information to run the port agent?
    pub fn is_configured(&self) -> bool {
        let mut ready = true;

        if self.instrument_type == InstrumentType::Unknown {
            log::debug!("missing instrument connection type");
            ready = false;
        }
        if self.observatory_command_port == 0 {
            log::debug!("missing observatory command port");
            ready = false;
        }
        if self.observatory_data_port == 0 {
            log::debug!("missing observatory data port");
            ready = false;
        }

        match self.instrument_type {
            InstrumentType::Tcp | InstrumentType::Rsn => {
                if self.instrument_addr.is_empty() {
                    log::debug!("missing instrument address");
                    ready = false;
                }
                if self.instrument_data_port == 0 {
                    log::debug!("missing instrument data port");
                    ready = false;
                }
                if self.instrument_type == InstrumentType::Rsn
                    && self.instrument_command_port == 0
                {
                    log::debug!("missing instrument command port");
                    ready = false;
                }
            }
            InstrumentType::Botpt => {
                if self.instrument_addr.is_empty() {
                    log::debug!("missing instrument address");
                    ready = false;
                }
                if self.instrument_data_tx_port == 0 {
                    log::debug!("missing instrument data TX port");
                    ready = false;
                }
                if self.instrument_data_rx_port == 0 {
                    log::debug!("missing instrument data RX port");
                    ready = false;
                }
            }
            InstrumentType::Serial => {
                if self.baud == 0 {
                    log::debug!("missing baud rate");
                    ready = false;
                }
                if self.device_path.is_empty() {
                    log::debug!("missing device path");
                    ready = false;
                }
            }
            InstrumentType::Unknown => {}
        }

        ready
    }

    //////
    // Identity paths: <base>_<command_port> under the configured dirs.
    //////

    pub fn pidfile(&self) -> PathBuf {
        Path::new(&self.pid_dir).join(format!(
            "{BASE_FILENAME}_{}.pid",
            self.observatory_command_port
        ))
    }

    pub fn logfile(&self) -> PathBuf {
        Path::new(&self.log_dir).join(format!(
            "{BASE_FILENAME}_{}.log",
            self.observatory_command_port
        ))
    }

    pub fn conffile(&self) -> PathBuf {
        Path::new(&self.conf_dir).join(format!(
            "{BASE_FILENAME}_{}.conf",
            self.observatory_command_port
        ))
    }

    pub fn datafile(&self) -> PathBuf {
        Path::new(&self.log_dir).join(format!(
            "{BASE_FILENAME}_{}",
            self.observatory_command_port
        ))
    }

    //////
    // Conf file round trip
    //////

    /// Textual dump of the configuration, re-ingestible through `parse`.
    pub fn get_config(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "pid_dir {}", self.pid_dir);
        let _ = writeln!(out, "log_dir {}", self.log_dir);
        let _ = writeln!(out, "conf_dir {}", self.conf_dir);
        let _ = writeln!(out, "data_dir {}", self.data_dir);
        let _ = writeln!(out, "log_level {}", log_level_name(self.log_level));
        let _ = writeln!(out, "command_port {}", self.observatory_command_port);
        let _ = writeln!(out, "data_port {}", self.observatory_data_port);
        if self.instrument_type != InstrumentType::Unknown {
            let _ = writeln!(out, "instrument_type {}", self.instrument_type.as_str());
        }
        let _ = writeln!(out, "heartbeat_interval {}", self.heartbeat_interval);

        out.push_str("sentinle '");
        for &byte in &self.sentinel_sequence {
            match byte {
                b'\n' => out.push_str("\\n"),
                b'\r' => out.push_str("\\r"),
                other => out.push(other as char),
            }
        }
        out.push_str("'\n");

        let _ = writeln!(out, "output_throttle {}", self.output_throttle);
        let _ = writeln!(out, "max_packet_size {}", self.max_packet_size);
        let _ = writeln!(out, "baud {}", self.baud);
        let _ = writeln!(out, "stopbits {}", self.stopbits);
        let _ = writeln!(out, "databits {}", self.databits);
        let _ = writeln!(out, "parity {}", self.parity);
        let _ = writeln!(out, "flow {}", self.flow);
        let _ = writeln!(out, "instrument_addr {}", self.instrument_addr);
        let _ = writeln!(out, "instrument_data_port {}", self.instrument_data_port);
        let _ = writeln!(out, "instrument_data_tx_port {}", self.instrument_data_tx_port);
        let _ = writeln!(out, "instrument_data_rx_port {}", self.instrument_data_rx_port);
        let _ = writeln!(out, "instrument_command_port {}", self.instrument_command_port);
        if self.telnet_sniffer_port != 0 {
            let _ = writeln!(out, "telnet_sniffer_port {}", self.telnet_sniffer_port);
            if !self.telnet_sniffer_prefix.is_empty() {
                let _ = writeln!(out, "telnet_sniffer_prefix {}", self.telnet_sniffer_prefix);
            }
            if !self.telnet_sniffer_suffix.is_empty() {
                let _ = writeln!(out, "telnet_sniffer_suffix {}", self.telnet_sniffer_suffix);
            }
        }

        out
    }

    /// Write the configuration atomically: temp file in the conf dir, then
    /// rename over the destination.
    pub fn save_config(&self) -> Result<(), AgentError> {
        let path = self.conffile();
        fs::create_dir_all(&self.conf_dir)
            .map_err(|err| AgentError::FileIo(format!("could not create {}: {err}", self.conf_dir)))?;
        let tmp = path.with_extension("conf.tmp");
        fs::write(&tmp, self.get_config())
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|err| AgentError::FileIo(format!("could not write {}: {err}", path.display())))?;
        log::info!("saved configuration to {}", path.display());
        Ok(())
    }

    /// Read a conf file and feed it through the command parser.
    pub fn read_config(&mut self, path: &Path) -> Result<bool, AgentError> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))
            .map_err(|err| AgentError::FileIo(err.to_string()))?;
        log::debug!("reading config from file: {}", path.display());
        Ok(self.parse(&text))
    }

    //////
    // Accessors
    //////

    pub fn kill(&self) -> bool {
        self.kill
    }
    pub fn no_detach(&self) -> bool {
        self.no_detach
    }
    pub fn verbose(&self) -> u8 {
        self.verbose
    }
    pub fn ppid(&self) -> u32 {
        self.ppid
    }
    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }
    pub fn log_dir(&self) -> &str {
        &self.log_dir
    }
    pub fn pid_dir(&self) -> &str {
        &self.pid_dir
    }
    pub fn conf_dir(&self) -> &str {
        &self.conf_dir
    }
    pub fn data_dir(&self) -> &str {
        &self.data_dir
    }
    pub fn observatory_command_port(&self) -> u16 {
        self.observatory_command_port
    }
    pub fn observatory_data_port(&self) -> u16 {
        self.observatory_data_port
    }
    pub fn observatory_type(&self) -> ObservatoryType {
        self.observatory_type
    }
    pub fn data_ports(&self) -> &DataPortRegistry {
        &self.data_ports
    }
    pub fn instrument_type(&self) -> InstrumentType {
        self.instrument_type
    }
    pub fn instrument_addr(&self) -> &str {
        &self.instrument_addr
    }
    pub fn instrument_data_port(&self) -> u16 {
        self.instrument_data_port
    }
    pub fn instrument_data_tx_port(&self) -> u16 {
        self.instrument_data_tx_port
    }
    pub fn instrument_data_rx_port(&self) -> u16 {
        self.instrument_data_rx_port
    }
    pub fn instrument_command_port(&self) -> u16 {
        self.instrument_command_port
    }
    pub fn device_path(&self) -> &str {
        &self.device_path
    }
    pub fn baud(&self) -> u32 {
        self.baud
    }
    pub fn stopbits(&self) -> u16 {
        self.stopbits
    }
    pub fn databits(&self) -> u16 {
        self.databits
    }
    pub fn parity(&self) -> u16 {
        self.parity
    }
    pub fn flow(&self) -> u16 {
        self.flow
    }
    pub fn break_duration(&self) -> u32 {
        self.break_duration
    }
    pub fn sentinel_sequence(&self) -> &[u8] {
        &self.sentinel_sequence
    }
    pub fn output_throttle(&self) -> u32 {
        self.output_throttle
    }
    pub fn heartbeat_interval(&self) -> u32 {
        self.heartbeat_interval
    }
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }
    pub fn rotation_interval(&self) -> RotationType {
        self.rotation_interval
    }
    pub fn telnet_sniffer_port(&self) -> u16 {
        self.telnet_sniffer_port
    }
    pub fn telnet_sniffer_prefix(&self) -> &str {
        &self.telnet_sniffer_prefix
    }
    pub fn telnet_sniffer_suffix(&self) -> &str {
        &self.telnet_sniffer_suffix
    }

    pub fn device_path_changed(&self) -> bool {
        self.device_path_changed
    }
    pub fn clear_device_path_changed(&mut self) {
        self.device_path_changed = false;
    }
    pub fn serial_settings_changed(&self) -> bool {
        self.serial_settings_changed
    }
    pub fn clear_serial_settings_changed(&mut self) {
        self.serial_settings_changed = false;
    }
}

pub fn log_level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off | LevelFilter::Error => "error",
        LevelFilter::Warn => "warning",
        LevelFilter::Info => "info",
        LevelFilter::Debug | LevelFilter::Trace => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_ready() -> PortAgentConfig {
        let mut config = PortAgentConfig::new();
        assert!(config.parse(
            "instrument_type tcp\n\
             instrument_addr x\n\
             instrument_data_port 5000\n\
             command_port 6000\n\
             data_port 6001\n"
        ));
        config
    }

    #[test]
    fn readiness_requires_every_key_for_tcp() {
        let config = tcp_ready();
        assert!(config.is_configured());

        for missing in [
            "instrument_type tcp",
            "instrument_addr x",
            "instrument_data_port 5000",
            "command_port 6000",
            "data_port 6001",
        ] {
            let mut config = PortAgentConfig::new();
            for line in [
                "instrument_type tcp",
                "instrument_addr x",
                "instrument_data_port 5000",
                "command_port 6000",
                "data_port 6001",
            ] {
                if line != missing {
                    assert!(config.parse(line));
                }
            }
            assert!(!config.is_configured(), "still ready without: {missing}");
        }
    }

    #[test]
    fn readiness_per_instrument_type() {
        let mut botpt = PortAgentConfig::new();
        botpt.parse(
            "instrument_type botpt\ninstrument_addr h\ncommand_port 1\ndata_port 2\n\
             instrument_data_tx_port 10\ninstrument_data_rx_port 11\n",
        );
        assert!(botpt.is_configured());

        let mut rsn = PortAgentConfig::new();
        rsn.parse(
            "instrument_type rsn\ninstrument_addr h\ncommand_port 1\ndata_port 2\n\
             instrument_data_port 10\n",
        );
        assert!(!rsn.is_configured());
        rsn.parse("instrument_command_port 11");
        assert!(rsn.is_configured());

        let mut serial = PortAgentConfig::new();
        serial.parse("instrument_type serial\ncommand_port 1\ndata_port 2\ndevice_path /dev/ttyS0\n");
        assert!(!serial.is_configured());
        serial.parse("baud 9600");
        assert!(serial.is_configured());
    }

    #[test]
    fn identity_paths_follow_command_port() {
        let mut config = PortAgentConfig::new();
        config.parse("command_port 9000");
        assert_eq!(config.pidfile(), PathBuf::from("/tmp/port_agent_9000.pid"));
        assert_eq!(config.logfile(), PathBuf::from("/tmp/port_agent_9000.log"));
        assert_eq!(config.conffile(), PathBuf::from("/tmp/port_agent_9000.conf"));
        assert_eq!(config.datafile(), PathBuf::from("/tmp/port_agent_9000"));
    }

    #[test]
    fn command_queue_dedupes_on_insert() {
        let mut config = PortAgentConfig::new();
        config.parse("shutdown");
        let queued = config.queued_commands();
        config.parse("shutdown");
        assert!(config.queued_commands() <= queued + 1);
        assert_eq!(config.next_command(), Some(PortAgentCommand::Shutdown));
        assert_eq!(config.next_command(), None);
    }

    #[test]
    fn queue_preserves_insertion_order() {
        let mut config = PortAgentConfig::new();
        config.parse("ping");
        config.parse("get_state");
        config.parse("data_port 4001");
        assert_eq!(config.next_command(), Some(PortAgentCommand::Ping));
        assert_eq!(config.next_command(), Some(PortAgentCommand::GetState));
        assert_eq!(config.next_command(), Some(PortAgentCommand::CommConfigUpdate));
    }

    #[test]
    fn sentinel_escapes_decode() {
        let mut config = PortAgentConfig::new();
        assert_eq!(
            config.process_command("sentinle '\\r\\n'"),
            CommandOutcome::Applied
        );
        assert_eq!(config.sentinel_sequence(), b"\r\n");

        // Historical and corrected spellings both accepted.
        assert_eq!(
            config.process_command("sentinel 'AB'"),
            CommandOutcome::Applied
        );
        assert_eq!(config.sentinel_sequence(), b"AB");

        // Unknown escapes keep the backslash.
        config.process_command("sentinle '\\x'");
        assert_eq!(config.sentinel_sequence(), b"\\x");
    }

    #[test]
    fn sentinel_missing_close_quote_is_error() {
        let mut config = PortAgentConfig::new();
        assert!(matches!(
            config.process_command("sentinle '\\r\\n"),
            CommandOutcome::Invalid(_)
        ));
        assert!(matches!(
            config.process_command("sentinle"),
            CommandOutcome::Invalid(_)
        ));
    }

    #[test]
    fn trailing_tokens_rejected() {
        let mut config = PortAgentConfig::new();
        assert!(matches!(
            config.process_command("baud 9600 extra"),
            CommandOutcome::Invalid(_)
        ));
    }

    #[test]
    fn unknown_verb_reported_as_unknown() {
        let mut config = PortAgentConfig::new();
        assert_eq!(config.process_command("frobnicate 1"), CommandOutcome::Unknown);
    }

    #[test]
    fn invalid_baud_resets_and_reports() {
        let mut config = PortAgentConfig::new();
        assert_eq!(config.process_command("baud 9600"), CommandOutcome::Applied);
        assert!(matches!(
            config.process_command("baud 1234"),
            CommandOutcome::Invalid(_)
        ));
        assert_eq!(config.baud(), 0);
    }

    #[test]
    fn serial_dirty_flags_track_their_verbs() {
        let mut config = PortAgentConfig::new();
        config.clear_device_path_changed();
        config.clear_serial_settings_changed();

        config.process_command("baud 19200");
        assert!(config.serial_settings_changed());
        assert!(!config.device_path_changed());

        config.clear_serial_settings_changed();
        config.process_command("device_path /dev/ttyUSB1");
        assert!(config.device_path_changed());
        assert!(!config.serial_settings_changed());
    }

    #[test]
    fn data_port_registry_is_idempotent() {
        let mut config = PortAgentConfig::new();
        config.parse("add_data_port 4000");
        config.parse("add_data_port 4000");
        assert_eq!(config.data_ports().len(), 1);
        assert_eq!(config.data_ports().ports(), &[4000]);

        config.parse("add_data_port 4001");
        config.parse("add_data_port 4000");
        assert_eq!(config.data_ports().ports(), &[4001, 4000]);
    }

    #[test]
    fn conf_round_trips() {
        let mut config = tcp_ready();
        config.parse("sentinle '\\r\\n'");
        config.parse("heartbeat_interval 5");
        config.parse("telnet_sniffer_port 7070");
        config.parse("telnet_sniffer_prefix <<");

        let first = config.get_config();
        let mut reloaded = PortAgentConfig::new();
        assert!(reloaded.parse(&first));
        assert_eq!(reloaded.get_config(), first);
    }

    #[test]
    fn round_trip_of_unconfigured_agent_parses() {
        let config = PortAgentConfig::new();
        let dump = config.get_config();
        let mut reloaded = PortAgentConfig::new();
        assert!(reloaded.parse(&dump), "own dump must re-ingest: {dump}");
    }

    #[test]
    fn save_config_writes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tcp_ready();
        let conf_dir = dir.path().display().to_string();
        config.parse(&format!("conf_dir {conf_dir}"));
        config.save_config().unwrap();

        let saved = std::fs::read_to_string(config.conffile()).unwrap();
        assert_eq!(saved, config.get_config());
    }

    #[test]
    fn from_args_requires_command_port() {
        let options = CliOptions::default();
        let err = PortAgentConfig::from_args(&options).unwrap_err();
        assert!(matches!(err, AgentError::ParameterRequired(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn kill_option_queues_shutdown() {
        let options = CliOptions {
            command_port: Some(7000),
            kill: true,
            ..Default::default()
        };
        let mut config = PortAgentConfig::from_args(&options).unwrap();
        assert!(config.kill());
        assert_eq!(config.next_command(), Some(PortAgentCommand::Shutdown));
    }
}

//! End-to-end engine scenarios over real loopback sockets: a fake TCP
//! instrument on one side, observatory clients on the other, the engine
//! ticked by hand in between.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use port_agent::config::PortAgentConfig;
use port_agent::engine::{PortAgent, ProcessState};
use port_agent::packet::{Packet, PacketScanner, PacketType};

/// Two distinct free ports, held together so they cannot collide.
fn free_ports() -> (u16, u16) {
    let first = TcpListener::bind("127.0.0.1:0").unwrap();
    let second = TcpListener::bind("127.0.0.1:0").unwrap();
    (
        first.local_addr().unwrap().port(),
        second.local_addr().unwrap().port(),
    )
}

struct Harness {
    agent: PortAgent,
    instrument: TcpListener,
    _tmp: tempfile::TempDir,
}

impl Harness {
    /// Agent with a fake TCP instrument, all identity files in a tempdir.
    fn new(extra: &str) -> Self {
        let instrument = TcpListener::bind("127.0.0.1:0").unwrap();
        let instrument_port = instrument.local_addr().unwrap().port();
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().display();

        let (command_port, data_port) = free_ports();
        let mut config = PortAgentConfig::new();
        assert!(config.parse(&format!(
            "pid_dir {dir}\nlog_dir {dir}\nconf_dir {dir}\ndata_dir {dir}\n\
             command_port {command_port}\ndata_port {data_port}\n\
             instrument_type tcp\ninstrument_addr 127.0.0.1\ninstrument_data_port {instrument_port}\n\
             {extra}"
        )));

        let agent = PortAgent::new(config).unwrap();
        Self {
            agent,
            instrument,
            _tmp: tmp,
        }
    }

    fn tick_until(&mut self, deadline: Duration, mut done: impl FnMut(&PortAgent) -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            self.agent.tick();
            if done(&self.agent) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Tick up to the disconnected state and accept the instrument side.
    fn start(&mut self) -> TcpStream {
        assert!(
            self.tick_until(Duration::from_secs(5), |a| {
                a.state() == ProcessState::Disconnected
            }),
            "agent never initialized"
        );
        let (peer, _) = self.instrument.accept().unwrap();
        peer
    }

    fn connect_data_client(&mut self) -> TcpStream {
        let port = self.agent.config().observatory_data_port();
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.set_nonblocking(true).unwrap();
        assert!(
            self.tick_until(Duration::from_secs(2), |a| {
                a.state() == ProcessState::Connected
            }),
            "data client never attached"
        );
        client
    }

    fn connect_command_client(&mut self) -> TcpStream {
        let port = self.agent.config().observatory_command_port();
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.set_nonblocking(true).unwrap();
        // One service pass to accept.
        self.agent.tick();
        client
    }
}

/// Drain whatever the client has into the scanner.
fn pump(client: &mut TcpStream, scanner: &mut PacketScanner) {
    let mut buf = [0u8; 4096];
    loop {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => scanner.push(&buf[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
}

fn collect_packets(
    harness: &mut Harness,
    client: &mut TcpStream,
    scanner: &mut PacketScanner,
    deadline: Duration,
    mut enough: impl FnMut(&[Packet]) -> bool,
) -> Vec<Packet> {
    let mut packets = Vec::new();
    let start = Instant::now();
    while start.elapsed() < deadline {
        harness.agent.tick();
        pump(client, scanner);
        while let Some(packet) = scanner.next_packet() {
            packets.push(packet);
        }
        if enough(&packets) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    packets
}

#[test]
fn partial_reads_coalesce_until_the_sentinel() {
    let mut harness = Harness::new("sentinle '\\r\\n'\n");
    let mut peer = harness.start();
    let mut client = harness.connect_data_client();
    let mut scanner = PacketScanner::new();

    peer.write_all(b"abc").unwrap();
    let deadline = Instant::now() + Duration::from_millis(50);
    while Instant::now() < deadline {
        harness.agent.tick();
        std::thread::sleep(Duration::from_millis(5));
    }
    peer.write_all(b"def\r\n").unwrap();

    let packets = collect_packets(
        &mut harness,
        &mut client,
        &mut scanner,
        Duration::from_secs(2),
        |p| !p.is_empty(),
    );
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].kind, PacketType::DataFromInstrument);
    assert_eq!(packets[0].payload, b"abcdef\r\n");
}

#[test]
fn cap_splits_and_gap_flush_drains_the_tail() {
    let mut harness = Harness::new("max_packet_size 16\n");
    let mut peer = harness.start();
    let mut client = harness.connect_data_client();
    let mut scanner = PacketScanner::new();

    peer.write_all(&[b'x'; 40]).unwrap();

    let packets = collect_packets(
        &mut harness,
        &mut client,
        &mut scanner,
        Duration::from_secs(2),
        |p| p.len() >= 3,
    );
    let sizes: Vec<usize> = packets.iter().map(|p| p.payload.len()).collect();
    assert_eq!(sizes, vec![16, 16, 8]);
    assert!(packets
        .iter()
        .all(|p| p.kind == PacketType::DataFromInstrument));
}

#[test]
fn heartbeats_arrive_about_once_a_second() {
    let mut harness = Harness::new("heartbeat_interval 1\n");
    let _peer = harness.start();
    let mut client = harness.connect_data_client();
    let mut scanner = PacketScanner::new();

    let packets = collect_packets(
        &mut harness,
        &mut client,
        &mut scanner,
        Duration::from_millis(2600),
        |p| p.iter().filter(|q| q.kind == PacketType::Heartbeat).count() >= 2,
    );
    let heartbeats = packets
        .iter()
        .filter(|p| p.kind == PacketType::Heartbeat)
        .count();
    assert!((2..=3).contains(&heartbeats), "saw {heartbeats} heartbeats");
    for packet in &packets {
        assert!(packet.payload.is_empty());
    }
}

#[test]
fn hot_reconfigure_acknowledges_and_leaves_device_path_alone() {
    let mut harness = Harness::new("");
    let _peer = harness.start();
    let mut command = harness.connect_command_client();
    let mut scanner = PacketScanner::new();

    command.write_all(b"baud 19200\n").unwrap();

    let start = Instant::now();
    let mut reply = None;
    while start.elapsed() < Duration::from_secs(2) && reply.is_none() {
        harness.agent.tick();
        pump(&mut command, &mut scanner);
        reply = scanner.next_packet();
        std::thread::sleep(Duration::from_millis(5));
    }
    let reply = reply.expect("no reply on the command channel");
    assert_eq!(reply.kind, PacketType::Status);
    assert_eq!(reply.payload, b"ok");

    assert_eq!(harness.agent.config().baud(), 19200);
    assert!(!harness.agent.config().device_path_changed());
    assert!(!harness.agent.config().serial_settings_changed());
}

#[test]
fn get_config_reply_is_reingestible() {
    let mut harness = Harness::new("sentinle '\\n'\n");
    let _peer = harness.start();
    let mut command = harness.connect_command_client();
    let mut scanner = PacketScanner::new();

    command.write_all(b"get_config\n").unwrap();

    let start = Instant::now();
    let mut config_reply = None;
    while start.elapsed() < Duration::from_secs(2) && config_reply.is_none() {
        harness.agent.tick();
        pump(&mut command, &mut scanner);
        while let Some(packet) = scanner.next_packet() {
            if packet.kind == PacketType::PaConfig {
                config_reply = Some(packet);
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let reply = config_reply.expect("no pa_config reply");
    let text = String::from_utf8(reply.payload).unwrap();
    let mut reloaded = PortAgentConfig::new();
    assert!(reloaded.parse(&text));
    assert_eq!(reloaded.sentinel_sequence(), b"\n");
}

#[test]
fn shutdown_command_stops_the_engine() {
    let mut harness = Harness::new("");
    let _peer = harness.start();
    let mut command = harness.connect_command_client();

    command.write_all(b"shutdown\n").unwrap();
    assert!(
        harness.tick_until(Duration::from_secs(2), |a| {
            a.state() == ProcessState::Shutdown
        }),
        "shutdown was not honored"
    );
}

#[test]
fn poison_pill_triggers_shutdown() {
    let instrument = TcpListener::bind("127.0.0.1:0").unwrap();
    let instrument_port = instrument.local_addr().unwrap().port();
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().display();

    let (command_port, data_port) = free_ports();
    let mut config = PortAgentConfig::new();
    assert!(config.parse(&format!(
        "pid_dir {dir}\nlog_dir {dir}\nconf_dir {dir}\ndata_dir {dir}\n\
         command_port {command_port}\ndata_port {data_port}\n\
         instrument_type tcp\ninstrument_addr 127.0.0.1\ninstrument_data_port {instrument_port}\n"
    )));
    let options = port_agent::config::CliOptions {
        command_port: Some(config.observatory_command_port()),
        ppid: Some(4_000_000),
        ..Default::default()
    };
    // Route the ppid through from_args like the launcher does.
    let mut watched = PortAgentConfig::from_args(&options).unwrap();
    let dump = config.get_config();
    assert!(watched.parse(&dump));

    let mut agent = PortAgent::new(watched).unwrap();
    // First tick notices the missing parent, the next drain honors it.
    for _ in 0..5 {
        agent.tick();
        if agent.state() == ProcessState::Shutdown {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(agent.state(), ProcessState::Shutdown);
}

#[test]
fn pid_file_lives_and_dies_with_the_agent() {
    let harness = Harness::new("");
    let pidfile = harness.agent.config().pidfile();
    assert!(pidfile.exists());
    drop(harness);
    assert!(!pidfile.exists());
}

#[test]
fn observatory_disconnect_returns_to_disconnected() {
    let mut harness = Harness::new("");
    let _peer = harness.start();
    let client = harness.connect_data_client();
    assert_eq!(harness.agent.state(), ProcessState::Connected);

    drop(client);
    assert!(
        harness.tick_until(Duration::from_secs(2), |a| {
            a.state() == ProcessState::Disconnected
        }),
        "client drop was not noticed"
    );
}

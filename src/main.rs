use std::io::Write;
use std::net::TcpStream;
use std::process::ExitCode;
use std::time::Duration;

use port_agent::config::{CliOptions, PortAgentConfig};
use port_agent::engine::PortAgent;
use port_agent::{cli, logging};

fn main() -> ExitCode {
    let options = cli::parse_args();

    // Kill mode never starts an engine: connect to the running agent's
    // command channel and ask it to shut down.
    if options.kill {
        return kill_running_agent(&options);
    }

    let config = match PortAgentConfig::from_args(&options) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("port_agent: {err}");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    if let Err(err) = logging::init(&config.logfile(), config.log_level(), config.no_detach()) {
        eprintln!("port_agent: {err:#}");
        return ExitCode::from(2);
    }

    let mut agent = match PortAgent::new(config) {
        Ok(agent) => agent,
        Err(err) => {
            log::error!("startup failed: {err}");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    match agent.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("runtime failure: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn kill_running_agent(options: &CliOptions) -> ExitCode {
    let Some(port) = options.command_port else {
        eprintln!("port_agent: --kill requires --command_port");
        return ExitCode::from(1);
    };
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    match TcpStream::connect_timeout(&addr, Duration::from_secs(2)) {
        Ok(mut stream) => {
            if let Err(err) = stream.write_all(b"shutdown\n") {
                eprintln!("port_agent: failed to send shutdown: {err}");
                return ExitCode::from(3);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("port_agent: no agent on command port {port}: {err}");
            ExitCode::from(3)
        }
    }
}

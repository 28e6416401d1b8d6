//! Command line surface.

use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::config::CliOptions;

/// Parse command line arguments and return the collected options.
pub fn parse_args() -> CliOptions {
    options_from(command().get_matches())
}

/// Same as [`parse_args`] but from an explicit argv (unit tests).
pub fn parse_args_from<I, T>(args: I) -> CliOptions
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    options_from(command().get_matches_from(args))
}

fn command() -> Command {
    Command::new("port_agent")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multiplexes an instrument byte stream into framed packets for observatory clients")
        .arg(
            Arg::new("conffile")
                .long("conffile")
                .short('c')
                .help("Path to a port agent config file, fed through the command parser")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("command_port")
                .long("command_port")
                .short('p')
                .help("Observatory command port; the agent's unique identity")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .help("Increase program verbosity (repeatable)")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("single")
                .long("single")
                .short('s')
                .help("Run in the foreground, do not detach")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("kill")
                .long("kill")
                .short('k')
                .help("Shut down the running agent on the given command port")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("ppid")
                .long("ppid")
                .short('y')
                .help("Poison pill: shut down if this parent process disappears")
                .value_name("PID")
                .value_parser(clap::value_parser!(u32)),
        )
}

fn options_from(matches: ArgMatches) -> CliOptions {
    // --version never reaches here: clap's built-in action prints the
    // crate version and exits first.
    CliOptions {
        conffile: matches.get_one::<PathBuf>("conffile").cloned(),
        command_port: matches.get_one::<u16>("command_port").copied(),
        verbose: matches.get_count("verbose"),
        single: matches.get_flag("single"),
        kill: matches.get_flag("kill"),
        ppid: matches.get_one::<u32>("ppid").copied(),
    }
}

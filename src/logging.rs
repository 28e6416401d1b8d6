//! Logger bootstrap.
//!
//! Log lines land in the agent's identity log file; `--single` mirrors
//! them to stdout as well. The builder is opened at its most verbose and
//! the effective level is gated through `log::set_max_level`, which is
//! what the `verbose` and `log_level` commands adjust at runtime.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use env_logger::{Builder, Target};
use log::LevelFilter;

/// Writes every log line to both the log file and stdout.
struct DualWriter {
    file: std::fs::File,
    stdout: io::Stdout,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.stdout.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.stdout.flush()
    }
}

/// Initialize the process logger writing to `path`.
pub fn init(path: &Path, level: LevelFilter, mirror_stdout: bool) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;

    let target: Target = if mirror_stdout {
        Target::Pipe(Box::new(DualWriter {
            file,
            stdout: io::stdout(),
        }))
    } else {
        Target::Pipe(Box::new(file))
    };

    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(target)
        .filter_level(LevelFilter::Trace)
        .try_init()
        .context("logger already initialized")?;
    log::set_max_level(level);

    log::info!("logger initialized at {}", path.display());
    Ok(())
}

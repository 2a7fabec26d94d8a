use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    /// Accepts anything starting with `deb`, `inf`, `warn` or `err`, in any case.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lowered = value.to_lowercase();
        [("deb", Self::Debug), ("inf", Self::Info), ("warn", Self::Warn), ("err", Self::Error)]
            .into_iter()
            .find(|(prefix, _)| lowered.starts_with(prefix))
            .map(|(_, level)| level)
            .ok_or_else(|| {
                format!("unknown log level {value:?} (expected debug, info, warn or error)")
            })
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[value(alias = "text")]
    Plain,
    #[value(alias = "structured")]
    Json,
    #[value(alias = "off")]
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    File(PathBuf),
}

impl FromStr for LogOutput {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "stdout" => Self::Stdout,
            "stderr" => Self::Stderr,
            path => Self::File(PathBuf::from(path)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
}

#[derive(Clone)]
pub(crate) enum LogWriter {
    Stdout,
    Stderr,
    File(Arc<Mutex<File>>),
}

impl LogWriter {
    /// Resolve `output`, falling back to stdout when the log file cannot be
    /// opened. The open error is handed back so it can be logged once a
    /// subscriber exists.
    pub(crate) fn open(output: &LogOutput) -> (Self, Option<(PathBuf, io::Error)>) {
        match output {
            LogOutput::Stdout => (Self::Stdout, None),
            LogOutput::Stderr => (Self::Stderr, None),
            LogOutput::File(path) => {
                match OpenOptions::new().create(true).append(true).open(path) {
                    Ok(file) => (Self::File(Arc::new(Mutex::new(file))), None),
                    Err(err) => (Self::Stdout, Some((path.clone(), err))),
                }
            }
        }
    }
}

pub(crate) struct LogWriterGuard {
    target: LogWriter,
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriterGuard { target: self.clone() }
    }
}

impl Write for LogWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.target {
            LogWriter::Stdout => io::stdout().write_all(buf)?,
            LogWriter::Stderr => io::stderr().write_all(buf)?,
            LogWriter::File(file) => file.lock().write_all(buf)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &self.target {
            LogWriter::Stdout => io::stdout().flush(),
            LogWriter::Stderr => io::stderr().flush(),
            LogWriter::File(file) => file.lock().flush(),
        }
    }
}

/// Install the global subscriber described by `settings`.
///
/// `RUST_LOG` directives, when set, refine the configured level. The `none`
/// format installs nothing, so every event is discarded.
///
/// # Errors
/// Fails when a global subscriber is already installed.
pub fn init(settings: &LogSettings) -> Result<()> {
    if settings.format == LogFormat::None {
        return Ok(());
    }

    let (writer, fallback) = LogWriter::open(&settings.output);
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(settings.level).into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);

    match settings.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Plain | LogFormat::None => builder.with_target(true).try_init(),
    }
    .map_err(|err| anyhow!("failed to install log subscriber: {err}"))?;

    if let Some((path, err)) = fallback {
        tracing::warn!(
            path = %path.display(),
            error = %err,
            "cannot open log file, logging to stdout instead"
        );
    }
    Ok(())
}

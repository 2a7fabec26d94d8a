use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use swince_store_sqlite::{StoreConfig, DEFAULT_CACHE_SIZE, DEFAULT_DATABASE_PATH};

use crate::logging::{LogFormat, LogLevel, LogOutput, LogSettings};

pub const DEFAULT_LISTEN_PORT: u16 = 1157;

#[derive(Debug, Parser)]
#[command(name = "swincebot")]
#[command(version, about = "Your personal swince leaderboard manager")]
pub struct Args {
    /// Database file
    #[arg(
        short = 'd',
        long = "database",
        env = "DATABASE_PATH",
        default_value = DEFAULT_DATABASE_PATH
    )]
    pub database: PathBuf,
    /// Database cache to keep in memory
    #[arg(long, env = "DATABASE_CACHE_SIZE", default_value_t = DEFAULT_CACHE_SIZE)]
    pub database_cache_size: u32,
    /// Time given to a graceful shutdown before resources are released anyway
    #[arg(
        short = 't',
        long,
        env = "GRACEFUL_TIMEOUT",
        default_value = "3s",
        value_parser = humantime::parse_duration
    )]
    pub grace_timeout: Duration,
    #[arg(
        short = 'p',
        long,
        env = "LISTEN_PORT",
        default_value_t = DEFAULT_LISTEN_PORT,
        value_parser = clap::value_parser!(u16).range(1024..)
    )]
    pub port: u16,
    /// Directory containing necessary secrets
    #[arg(long, env = "SECRETS_PATH", default_value = "/etc/secrets")]
    pub secrets_path: PathBuf,
    /// debug, info, warn, error
    #[arg(short = 'l', long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,
    #[arg(
        short = 'f',
        long,
        env = "LOG_FORMAT",
        value_enum,
        ignore_case = true,
        default_value = "plain"
    )]
    pub log_format: LogFormat,
    /// stdout, stderr, or a file path
    #[arg(short = 'o', long, env = "LOG_OUTPUT", default_value = "stdout")]
    pub log_output: LogOutput,
}

/// Everything the application needs to start, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub secrets_path: PathBuf,
    pub listen: SocketAddr,
}

impl Args {
    pub fn app_config(&self) -> AppConfig {
        AppConfig {
            store: StoreConfig::new(&self.database, self.database_cache_size),
            secrets_path: self.secrets_path.clone(),
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)),
        }
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            level: self.log_level,
            format: self.log_format,
            output: self.log_output.clone(),
        }
    }
}
